//! All-to-all-v plans.
//!
//! Both run once over the user buffers (`LoopMode::Direct`). The full-mesh
//! plan exchanges with every rank directly. The staged plan first forwards
//! inside the module, so that device `d` holds everything its module sends
//! to device `d` of every module, then exchanges one region per module pair
//! across level 1.

use crate::algorithm::{AllToAllPairwise, KernelArgs, launch};
use crate::device::{DeviceMem, Stream, copy_async};
use crate::error::{CollexError, Result};
use crate::executor::base::{ExecutorCore, LoopMode, OpPlan};
use crate::param::{AllToAllVInfo, ExecMem, OpParam};
use crate::resource::{CommLevel, MemKind, OpCommTransport, SingleSubCommTransport};
use crate::slice::Slice;
use crate::topology::CommTopology;
use crate::transport::Direction;
use crate::types::OpKind;
use std::sync::Arc;

fn send_slices(info: &AllToAllVInfo, unit: usize) -> Vec<Slice> {
    info.send_counts
        .iter()
        .zip(&info.send_displs)
        .map(|(&c, &d)| Slice::new(d as usize * unit, c as usize * unit))
        .collect()
}

fn recv_slices(info: &AllToAllVInfo, unit: usize) -> Vec<Slice> {
    info.recv_counts
        .iter()
        .zip(&info.recv_displs)
        .map(|(&c, &d)| Slice::new(d as usize * unit, c as usize * unit))
        .collect()
}

/// Elements the whole table moves; identical on every rank of a call.
fn table_volume(table: &[AllToAllVInfo]) -> u64 {
    table.iter().flat_map(|row| row.send_counts.iter()).sum()
}

#[derive(Debug, Clone, Default)]
struct Table(Option<Arc<Vec<AllToAllVInfo>>>);

impl Table {
    fn set(&mut self, table: &[AllToAllVInfo]) {
        self.0 = Some(Arc::new(table.to_vec()));
    }

    /// Falls back to the table carried by the call.
    fn resolve(&mut self, param: &OpParam) -> Result<()> {
        if self.0.is_none() {
            self.0 = param.all_to_all.clone();
        }
        if self.0.is_none() {
            return Err(CollexError::param("all_to_all_v needs length tables"));
        }
        Ok(())
    }

    fn rows(&self) -> Result<&[AllToAllVInfo]> {
        self.0
            .as_deref()
            .map(Vec::as_slice)
            .ok_or_else(|| CollexError::internal("all-to-all table not set"))
    }
}

/// Pairwise exchange with every rank over one combined mesh.
#[derive(Debug, Clone, Default)]
pub struct AllToAllFullMeshPlan {
    table: Table,
}

impl AllToAllFullMeshPlan {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OpPlan for AllToAllFullMeshPlan {
    fn name(&self) -> &'static str {
        "RunAlltoAllVFullMesh"
    }

    fn op(&self) -> OpKind {
        OpKind::AllToAllV
    }

    fn parse_param(&mut self, _core: &ExecutorCore, param: &OpParam) -> Result<()> {
        self.table.resolve(param)
    }

    fn calc_comm_info(&self, core: &ExecutorCore, _param: &OpParam) -> Result<OpCommTransport> {
        let mut t = OpCommTransport::new();
        let n = core.topo().rank_size();
        if n > 1 {
            let members = (0..n).collect();
            t.insert(
                CommLevel::Combined,
                vec![SingleSubCommTransport::mesh(
                    core.rank(),
                    members,
                    MemKind::ParamInput,
                    MemKind::ParamOutput,
                )?],
            );
        }
        Ok(t)
    }

    fn loop_mode(&self) -> LoopMode {
        LoopMode::Direct
    }

    fn shape_count(&self, _core: &ExecutorCore, _param: &OpParam, _cur: u64) -> u64 {
        self.table.rows().map(table_volume).unwrap_or(0)
    }

    fn set_extra_info(&mut self, table: &[AllToAllVInfo]) -> Result<()> {
        self.table.set(table);
        Ok(())
    }

    fn kernel_run(&self, core: &ExecutorCore, param: &OpParam, mem: &ExecMem, stream: &Stream) -> Result<()> {
        let unit = param.unit_size();
        let rows = self.table.rows()?;
        let info = rows
            .get(core.rank() as usize)
            .ok_or_else(|| CollexError::internal(format!("no all-to-all row for rank {}", core.rank())))?;
        let send = send_slices(info, unit);
        let recv = recv_slices(info, unit);
        if core.rank_size() == 1 {
            let (s, r) = (send[0], recv[0]);
            return copy_async(
                &mem.user_output.range(r.offset, r.size)?,
                &mem.user_input.range(s.offset, s.size)?,
                stream,
            );
        }
        let view = core.response()?.sub_comm(CommLevel::Combined, 0)?;
        let args = KernelArgs::new(mem.user_input.clone(), mem.user_output.clone(), param.dtype);
        launch(Box::new(AllToAllPairwise::new(send, recv)), args, &view, stream)
    }
}

/// Byte layout of the staged plan's scratch on one rank.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StagedLayout {
    /// `[dest module][source device]`: what the local module sends to this
    /// rank's device slot of each module.
    forward: Vec<Vec<Slice>>,
    /// `[source module][source device]`: what other modules send to this
    /// rank, starting after `forward`.
    landing: Vec<Vec<Slice>>,
    bytes: usize,
}

impl StagedLayout {
    fn new(rows: &[AllToAllVInfo], modules: usize, devices: usize, rank: usize, unit: usize) -> Self {
        let (me_mod, me_dev) = (rank / devices, rank % devices);
        let count = |src: usize, dst: usize| rows[src].send_counts[dst] as usize * unit;
        let mut offset = 0;
        let mut forward = Vec::with_capacity(modules);
        for mj in 0..modules {
            let mut blocks = Vec::with_capacity(devices);
            for s in 0..devices {
                let size = count(me_mod * devices + s, mj * devices + me_dev);
                blocks.push(Slice::new(offset, size));
                offset += size;
            }
            forward.push(blocks);
        }
        let mut landing = Vec::with_capacity(modules);
        for mf in 0..modules {
            let mut blocks = Vec::with_capacity(devices);
            for s in 0..devices {
                let size = if mf == me_mod {
                    0
                } else {
                    count(mf * devices + s, me_mod * devices + me_dev)
                };
                blocks.push(Slice::new(offset, size));
                offset += size;
            }
            landing.push(blocks);
        }
        Self {
            forward,
            landing,
            bytes: offset,
        }
    }

    /// Contiguous span of `blocks`.
    fn span(blocks: &[Slice]) -> Slice {
        let start = blocks.first().map_or(0, |b| b.offset);
        Slice::new(start, blocks.iter().map(|b| b.size).sum())
    }
}

/// Two-stage exchange: forward inside the module, then one region per
/// module pair over level 1. Needs several modules of several devices in a
/// single super-pod.
#[derive(Debug, Clone, Default)]
pub struct AllToAllStagedPlan {
    table: Table,
}

impl AllToAllStagedPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the staged plan can run on this topology.
    pub fn eligible(topo: &CommTopology) -> bool {
        topo.module_num() > 1 && topo.dev_per_aggregation() > 1 && topo.pod_num() == 1
    }

    fn layout(&self, core: &ExecutorCore, rank: usize, unit: usize) -> Result<StagedLayout> {
        Ok(StagedLayout::new(
            self.table.rows()?,
            core.topo().module_num() as usize,
            core.dev_per_aggregation(),
            rank,
            unit,
        ))
    }

    /// Stage 1 over the level-0 mesh.
    #[allow(clippy::too_many_arguments)]
    fn forward(&self, core: &ExecutorCore, info: &AllToAllVInfo, layout: &StagedLayout, mem: &ExecMem, scratch: &DeviceMem, unit: usize, stream: &Stream) -> Result<()> {
        let devices = core.dev_per_aggregation();
        let modules = layout.forward.len();
        let me = core.device() as usize;
        let send = send_slices(info, unit);
        let input = |mj: usize, dev: usize| {
            let s = send[mj * devices + dev];
            mem.user_input.range(s.offset, s.size)
        };
        let view = core.response()?.sub_comm(CommLevel::Level0, 0)?;
        for k in 0..devices {
            let to = (me + k) % devices;
            let from = (me + devices - k) % devices;
            if k == 0 {
                for mj in 0..modules {
                    let b = layout.forward[mj][me];
                    copy_async(&scratch.range(b.offset, b.size)?, &input(mj, me)?, stream)?;
                }
                continue;
            }
            let tx = view.link(to as u32)?;
            for mj in 0..modules {
                tx.transfer_async(Direction::Tx, &input(mj, to)?, stream)?;
            }
            let rx = view.link(from as u32)?;
            for mj in 0..modules {
                let b = layout.forward[mj][from];
                rx.transfer_async(Direction::Rx, &scratch.range(b.offset, b.size)?, stream)?;
            }
        }
        Ok(())
    }

    /// Stage 2 over the level-1 mesh, landing in the user output.
    #[allow(clippy::too_many_arguments)]
    fn exchange(&self, core: &ExecutorCore, info: &AllToAllVInfo, layout: &StagedLayout, mem: &ExecMem, scratch: &DeviceMem, unit: usize, stream: &Stream) -> Result<()> {
        let devices = core.dev_per_aggregation();
        let modules = layout.forward.len();
        let me = core.module() as usize;
        let recv = recv_slices(info, unit);
        let deliver = |blocks: &[Slice], mf: usize| -> Result<()> {
            for (s, b) in blocks.iter().enumerate() {
                let r = recv[mf * devices + s];
                if r.size != b.size {
                    return Err(CollexError::BufferSizeMismatch {
                        expected: r.size as u64,
                        actual: b.size as u64,
                    });
                }
                copy_async(&mem.user_output.range(r.offset, r.size)?, &scratch.range(b.offset, b.size)?, stream)?;
            }
            Ok(())
        };
        let view = core.response()?.sub_comm(CommLevel::Level1, 0)?;
        for k in 0..modules {
            let to = (me + k) % modules;
            let from = (me + modules - k) % modules;
            if k == 0 {
                deliver(&layout.forward[me], me)?;
                continue;
            }
            let out = StagedLayout::span(&layout.forward[to]);
            view.link(to as u32)?
                .transfer_async(Direction::Tx, &scratch.range(out.offset, out.size)?, stream)?;
            let land = StagedLayout::span(&layout.landing[from]);
            view.link(from as u32)?
                .transfer_async(Direction::Rx, &scratch.range(land.offset, land.size)?, stream)?;
            deliver(&layout.landing[from], from)?;
        }
        Ok(())
    }
}

impl OpPlan for AllToAllStagedPlan {
    fn name(&self) -> &'static str {
        "RunAlltoAllVStaged"
    }

    fn op(&self) -> OpKind {
        OpKind::AllToAllV
    }

    fn parse_param(&mut self, core: &ExecutorCore, param: &OpParam) -> Result<()> {
        if !Self::eligible(core.topo()) {
            return Err(CollexError::param(format!(
                "staged all-to-all needs several modules of several devices in one super-pod, got {} modules of {} in {} super-pods",
                core.topo().module_num(),
                core.dev_per_aggregation(),
                core.level2_size()
            )));
        }
        self.table.resolve(param)
    }

    fn calc_scratch_mem_size(&self, core: &ExecutorCore, param: &OpParam) -> Result<u64> {
        let unit = param.unit_size();
        let mut peak = 0;
        for rank in 0..core.rank_size() {
            peak = peak.max(self.layout(core, rank, unit)?.bytes);
        }
        Ok((core.config().ccl_buffer_size.max(peak)) as u64)
    }

    fn calc_comm_info(&self, core: &ExecutorCore, _param: &OpParam) -> Result<OpCommTransport> {
        let mut t = OpCommTransport::new();
        let module_base = core.module() * core.dev_per_aggregation() as u32;
        let level0 = (0..core.dev_per_aggregation() as u32).map(|d| module_base + d).collect();
        t.insert(
            CommLevel::Level0,
            vec![SingleSubCommTransport::mesh(core.rank(), level0, MemKind::ParamInput, MemKind::Scratch)?],
        );
        t.insert(
            CommLevel::Level1,
            vec![SingleSubCommTransport::mesh(
                core.rank(),
                core.topo().level1_ranks(core.rank()),
                MemKind::Scratch,
                MemKind::Scratch,
            )?],
        );
        Ok(t)
    }

    fn loop_mode(&self) -> LoopMode {
        LoopMode::Direct
    }

    fn shape_count(&self, _core: &ExecutorCore, _param: &OpParam, _cur: u64) -> u64 {
        self.table.rows().map(table_volume).unwrap_or(0)
    }

    fn set_extra_info(&mut self, table: &[AllToAllVInfo]) -> Result<()> {
        self.table.set(table);
        Ok(())
    }

    fn kernel_run(&self, core: &ExecutorCore, param: &OpParam, mem: &ExecMem, stream: &Stream) -> Result<()> {
        let unit = param.unit_size();
        let rows = self.table.rows()?;
        let info = rows
            .get(core.rank() as usize)
            .ok_or_else(|| CollexError::internal(format!("no all-to-all row for rank {}", core.rank())))?;
        let layout = self.layout(core, core.rank() as usize, unit)?;
        let scratch = mem
            .scratch_mem
            .as_ref()
            .ok_or_else(|| CollexError::internal(format!("tag {}: no scratch bound", core.tag())))?;
        if scratch.size() < layout.bytes {
            return Err(CollexError::BufferSizeMismatch {
                expected: layout.bytes as u64,
                actual: scratch.size() as u64,
            });
        }
        tracing::debug!(tag = %core.tag(), scratch = layout.bytes, "all_to_all: staged exchange");
        self.forward(core, info, &layout, mem, scratch, unit, stream)?;
        self.exchange(core, info, &layout, mem, scratch, unit, stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staged_layout() {
        // 2 modules of 2 devices; rank i sends (i + 1) elements to everyone
        let rows: Vec<AllToAllVInfo> = (0..4u64)
            .map(|i| AllToAllVInfo::packed(vec![i + 1; 4], (0..4).map(|j| j + 1).collect()))
            .collect();
        let l = StagedLayout::new(&rows, 2, 2, 3, 4);
        // rank 3 = module 1, device 1; forwards from devices 2 and 3
        assert_eq!(
            l.forward,
            vec![
                vec![Slice::new(0, 12), Slice::new(12, 16)],
                vec![Slice::new(28, 12), Slice::new(40, 16)],
            ]
        );
        // lands what module 0 (ranks 0 and 1) sends it
        assert_eq!(l.landing[0], vec![Slice::new(56, 4), Slice::new(60, 8)]);
        assert_eq!(l.landing[1], vec![Slice::new(68, 0), Slice::new(68, 0)]);
        assert_eq!(l.bytes, 68);
        assert_eq!(StagedLayout::span(&l.forward[1]), Slice::new(28, 28));
    }

    #[test]
    fn test_table_volume() {
        let rows = vec![
            AllToAllVInfo::packed(vec![1, 2], vec![1, 3]),
            AllToAllVInfo::packed(vec![3, 4], vec![2, 4]),
        ];
        assert_eq!(table_volume(&rows), 10);
    }
}
