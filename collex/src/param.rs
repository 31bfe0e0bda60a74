//! Operation parameters as handed to an executor.

use crate::device::{DeviceMem, Stream};
use crate::error::{CollexError, Result};
use crate::types::{DataType, OpKind, Rank, ReduceOp};
use std::sync::Arc;

/// Per-rank counts and displacements of an all-to-all-v, in elements.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AllToAllVInfo {
    pub send_counts: Vec<u64>,
    pub send_displs: Vec<u64>,
    pub recv_counts: Vec<u64>,
    pub recv_displs: Vec<u64>,
}

impl AllToAllVInfo {
    /// Contiguous layout from counts alone.
    pub fn packed(send_counts: Vec<u64>, recv_counts: Vec<u64>) -> Self {
        let displs = |counts: &[u64]| {
            counts
                .iter()
                .scan(0u64, |acc, &c| {
                    let d = *acc;
                    *acc += c;
                    Some(d)
                })
                .collect::<Vec<_>>()
        };
        Self {
            send_displs: displs(&send_counts),
            recv_displs: displs(&recv_counts),
            send_counts,
            recv_counts,
        }
    }

    pub fn validate(&self, rank_size: usize) -> Result<()> {
        for (name, v) in [
            ("send_counts", &self.send_counts),
            ("send_displs", &self.send_displs),
            ("recv_counts", &self.recv_counts),
            ("recv_displs", &self.recv_displs),
        ] {
            if v.len() != rank_size {
                return Err(CollexError::param(format!(
                    "{name} has {} entries, rank size is {rank_size}",
                    v.len()
                )));
            }
        }
        Ok(())
    }

    /// Elements the send buffer must hold.
    pub fn send_extent(&self) -> u64 {
        self.send_counts
            .iter()
            .zip(&self.send_displs)
            .map(|(c, d)| c + d)
            .max()
            .unwrap_or(0)
    }

    pub fn recv_extent(&self) -> u64 {
        self.recv_counts
            .iter()
            .zip(&self.recv_displs)
            .map(|(c, d)| c + d)
            .max()
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendRecvKind {
    Send,
    Recv,
}

/// One entry of a batched send/receive.
#[derive(Debug, Clone)]
pub struct SendRecvItem {
    pub kind: SendRecvKind,
    pub peer: Rank,
    pub mem: DeviceMem,
    pub count: u64,
    pub dtype: DataType,
}

/// Everything describing one collective call.
#[derive(Debug, Clone)]
pub struct OpParam {
    pub op: OpKind,
    /// Caller-supplied tag; all ranks must use the same tag for the same call.
    pub tag: String,
    /// Elements per rank block (all-gather input, reduce-scatter output,
    /// broadcast buffer, ...).
    pub count: u64,
    pub dtype: DataType,
    pub reduce_op: Option<ReduceOp>,
    pub root: Rank,
    pub input: DeviceMem,
    pub output: DeviceMem,
    /// Primary stream the call is enqueued on.
    pub stream: Stream,
    /// Length tables of every rank, indexed by rank (all-to-all-v only).
    pub all_to_all: Option<Arc<Vec<AllToAllVInfo>>>,
    /// Peer of a single send or receive.
    pub peer: Option<Rank>,
    pub batch: Vec<SendRecvItem>,
    pub(crate) derived_tag: Option<String>,
}

impl OpParam {
    fn base(op: OpKind, tag: &str, count: u64, dtype: DataType, input: DeviceMem, output: DeviceMem, stream: Stream) -> Self {
        Self {
            op,
            tag: tag.to_string(),
            count,
            dtype,
            reduce_op: None,
            root: 0,
            input,
            output,
            stream,
            all_to_all: None,
            peer: None,
            batch: Vec::new(),
            derived_tag: None,
        }
    }

    pub fn all_gather(tag: &str, input: DeviceMem, output: DeviceMem, count: u64, dtype: DataType, stream: Stream) -> Self {
        Self::base(OpKind::AllGather, tag, count, dtype, input, output, stream)
    }

    pub fn all_reduce(
        tag: &str,
        input: DeviceMem,
        output: DeviceMem,
        count: u64,
        dtype: DataType,
        op: ReduceOp,
        stream: Stream,
    ) -> Self {
        let mut p = Self::base(OpKind::AllReduce, tag, count, dtype, input, output, stream);
        p.reduce_op = Some(op);
        p
    }

    /// `count` is the per-rank output size.
    pub fn reduce_scatter(
        tag: &str,
        input: DeviceMem,
        output: DeviceMem,
        count: u64,
        dtype: DataType,
        op: ReduceOp,
        stream: Stream,
    ) -> Self {
        let mut p = Self::base(OpKind::ReduceScatter, tag, count, dtype, input, output, stream);
        p.reduce_op = Some(op);
        p
    }

    /// In-place on `buffer`.
    pub fn broadcast(tag: &str, buffer: DeviceMem, count: u64, dtype: DataType, root: Rank, stream: Stream) -> Self {
        let mut p = Self::base(OpKind::Broadcast, tag, count, dtype, buffer.clone(), buffer, stream);
        p.root = root;
        p
    }

    #[allow(clippy::too_many_arguments)]
    pub fn reduce(
        tag: &str,
        input: DeviceMem,
        output: DeviceMem,
        count: u64,
        dtype: DataType,
        op: ReduceOp,
        root: Rank,
        stream: Stream,
    ) -> Self {
        let mut p = Self::base(OpKind::Reduce, tag, count, dtype, input, output, stream);
        p.reduce_op = Some(op);
        p.root = root;
        p
    }

    /// `count` is the per-rank block size.
    pub fn scatter(tag: &str, input: DeviceMem, output: DeviceMem, count: u64, dtype: DataType, root: Rank, stream: Stream) -> Self {
        let mut p = Self::base(OpKind::Scatter, tag, count, dtype, input, output, stream);
        p.root = root;
        p
    }

    pub fn gather(tag: &str, input: DeviceMem, output: DeviceMem, count: u64, dtype: DataType, root: Rank, stream: Stream) -> Self {
        let mut p = Self::base(OpKind::Gather, tag, count, dtype, input, output, stream);
        p.root = root;
        p
    }

    /// `table[r]` holds rank `r`'s counts and displacements; every rank
    /// passes the same table.
    pub fn all_to_all_v(
        tag: &str,
        input: DeviceMem,
        output: DeviceMem,
        dtype: DataType,
        table: Vec<AllToAllVInfo>,
        stream: Stream,
    ) -> Self {
        let mut p = Self::base(OpKind::AllToAllV, tag, 0, dtype, input, output, stream);
        p.all_to_all = Some(Arc::new(table));
        p
    }

    pub fn send(tag: &str, input: DeviceMem, count: u64, dtype: DataType, peer: Rank, stream: Stream) -> Self {
        let mut p = Self::base(OpKind::Send, tag, count, dtype, input.clone(), input, stream);
        p.peer = Some(peer);
        p
    }

    pub fn receive(tag: &str, output: DeviceMem, count: u64, dtype: DataType, peer: Rank, stream: Stream) -> Self {
        let mut p = Self::base(OpKind::Receive, tag, count, dtype, output.clone(), output, stream);
        p.peer = Some(peer);
        p
    }

    pub fn batch_send_recv(tag: &str, items: Vec<SendRecvItem>, stream: Stream) -> Self {
        let placeholder = DeviceMem::alloc(0);
        let dtype = items.first().map_or(DataType::U8, |i| i.dtype);
        let mut p = Self::base(OpKind::BatchSendRecv, tag, 0, dtype, placeholder.clone(), placeholder, stream);
        p.batch = items;
        p
    }

    /// Tag the executor's resources are cached under.
    pub fn exec_tag(&self) -> &str {
        self.derived_tag.as_deref().unwrap_or(&self.tag)
    }

    pub(crate) fn set_exec_tag(&mut self, tag: String) {
        self.derived_tag = Some(tag);
    }

    pub fn all_to_all_table(&self) -> Result<&[AllToAllVInfo]> {
        self.all_to_all
            .as_deref()
            .map(Vec::as_slice)
            .ok_or_else(|| CollexError::param("all_to_all_v needs length tables"))
    }

    /// This rank's row of the all-to-all-v table.
    pub fn local_all_to_all(&self, rank: Rank) -> Result<&AllToAllVInfo> {
        let table = self.all_to_all_table()?;
        table.get(rank as usize).ok_or(CollexError::InvalidRank {
            rank,
            rank_size: table.len() as u32,
        })
    }

    pub fn unit_size(&self) -> usize {
        self.dtype.size_in_bytes()
    }

    pub fn reduce_op(&self) -> Result<ReduceOp> {
        self.reduce_op
            .ok_or_else(|| CollexError::param(format!("{} needs a reduce op", self.op)))
    }

    /// Check buffer sizes and ranks against a communicator of `rank_size`.
    pub fn validate(&self, rank: Rank, rank_size: u32) -> Result<()> {
        let n = u64::from(rank_size);
        let unit = self.unit_size() as u64;
        let block = self.count * unit;
        let need = |mem: &DeviceMem, bytes: u64| -> Result<()> {
            if (mem.size() as u64) < bytes {
                return Err(CollexError::BufferSizeMismatch {
                    expected: bytes,
                    actual: mem.size() as u64,
                });
            }
            Ok(())
        };
        if self.op.is_rooted() && self.root >= rank_size {
            return Err(CollexError::InvalidRank {
                rank: self.root,
                rank_size,
            });
        }
        if self.op.is_reduction() {
            self.reduce_op()?;
        }
        match self.op {
            OpKind::AllGather => {
                need(&self.input, block)?;
                need(&self.output, block * n)
            }
            OpKind::AllReduce | OpKind::Broadcast => {
                need(&self.input, block)?;
                need(&self.output, block)
            }
            OpKind::Reduce => {
                need(&self.input, block)?;
                if rank == self.root {
                    need(&self.output, block)?;
                }
                Ok(())
            }
            OpKind::ReduceScatter => {
                need(&self.input, block * n)?;
                need(&self.output, block)
            }
            OpKind::Scatter => {
                if rank == self.root {
                    need(&self.input, block * n)?;
                }
                need(&self.output, block)
            }
            OpKind::Gather => {
                need(&self.input, block)?;
                if rank == self.root {
                    need(&self.output, block * n)?;
                }
                Ok(())
            }
            OpKind::AllToAllV => {
                let table = self.all_to_all_table()?;
                if table.len() != rank_size as usize {
                    return Err(CollexError::param(format!(
                        "all_to_all_v table has {} rows, rank size is {rank_size}",
                        table.len()
                    )));
                }
                for row in table {
                    row.validate(rank_size as usize)?;
                }
                let info = self.local_all_to_all(rank)?;
                need(&self.input, info.send_extent() * unit)?;
                need(&self.output, info.recv_extent() * unit)
            }
            OpKind::Send | OpKind::Receive => {
                let peer = self
                    .peer
                    .ok_or_else(|| CollexError::param(format!("{} needs a peer", self.op)))?;
                check_peer(peer, rank, rank_size)?;
                need(&self.input, block)
            }
            OpKind::BatchSendRecv => {
                for item in &self.batch {
                    check_peer(item.peer, rank, rank_size)?;
                    need(&item.mem, item.count * item.dtype.size_in_bytes() as u64)?;
                }
                Ok(())
            }
        }
    }
}

fn check_peer(peer: Rank, rank: Rank, rank_size: u32) -> Result<()> {
    if peer >= rank_size {
        return Err(CollexError::InvalidRank { rank: peer, rank_size });
    }
    if peer == rank {
        return Err(CollexError::param(format!("rank {rank} cannot send to itself")));
    }
    Ok(())
}

/// Memory one loop iteration of an executor works on.
#[derive(Debug, Clone)]
pub struct ExecMem {
    /// Elements per rank block in this iteration.
    pub count: u64,
    pub input_mem: DeviceMem,
    pub output_mem: DeviceMem,
    pub scratch_mem: Option<DeviceMem>,
    /// Element offset of this iteration inside the user buffers.
    pub base_count: u64,
    /// User buffers starting at this iteration's offset.
    pub user_input: DeviceMem,
    pub user_output: DeviceMem,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packed_displacements() {
        let info = AllToAllVInfo::packed(vec![2, 0, 3], vec![1, 1, 1]);
        assert_eq!(info.send_displs, vec![0, 2, 2]);
        assert_eq!(info.send_extent(), 5);
        assert_eq!(info.recv_extent(), 3);
        assert!(info.validate(3).is_ok());
        assert!(info.validate(4).is_err());
    }

    #[tokio::test]
    async fn test_validate_all_gather_sizes() {
        let s = Stream::new(0).unwrap();
        let p = OpParam::all_gather("t", DeviceMem::alloc(16), DeviceMem::alloc(32), 4, DataType::F32, s);
        assert!(matches!(
            p.validate(0, 4),
            Err(CollexError::BufferSizeMismatch { expected: 64, actual: 32 })
        ));
        assert!(p.validate(0, 2).is_ok());
    }

    #[tokio::test]
    async fn test_validate_all_to_all_table() {
        let s = Stream::new(0).unwrap();
        let rows = vec![
            AllToAllVInfo::packed(vec![1, 2], vec![1, 3]),
            AllToAllVInfo::packed(vec![3, 4], vec![2, 4]),
        ];
        let p = OpParam::all_to_all_v("t", DeviceMem::alloc(7), DeviceMem::alloc(6), DataType::U8, rows.clone(), s.clone());
        assert!(p.validate(1, 2).is_ok());
        assert_eq!(p.local_all_to_all(1).unwrap().send_counts, vec![3, 4]);
        // rank 0 only needs 3 bytes in, 4 out
        assert!(p.validate(0, 2).is_ok());
        let short = OpParam::all_to_all_v("t", DeviceMem::alloc(7), DeviceMem::alloc(6), DataType::U8, rows[..1].to_vec(), s);
        assert!(matches!(short.validate(0, 2), Err(CollexError::Param { .. })));
    }

    #[tokio::test]
    async fn test_validate_root_and_reduce_op() {
        let s = Stream::new(0).unwrap();
        let mem = DeviceMem::alloc(8);
        let b = OpParam::broadcast("t", mem.clone(), 2, DataType::F32, 5, s.clone());
        assert!(matches!(b.validate(0, 4), Err(CollexError::InvalidRank { rank: 5, .. })));
        let mut ar = OpParam::all_reduce("t", mem.clone(), mem, 2, DataType::F32, ReduceOp::Sum, s);
        ar.reduce_op = None;
        assert!(ar.validate(0, 2).is_err());
    }
}
