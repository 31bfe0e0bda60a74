//! Single-plane collective kernels.
//!
//! A kernel runs one collective over one sub-communicator. It is prepared
//! with its buffers and slice layout, then launched on a stream: launching
//! only enqueues transfers, it never waits for them.

pub mod alltoall;
pub mod hd;
pub mod mesh;
pub mod nhr;
pub mod ring;

pub use alltoall::AllToAllPairwise;
pub use hd::{HdAllGather, HdAllReduce, HdReduceScatter, TreeBroadcast, TreeReduce};
pub use mesh::{MeshAllGather, MeshGather, MeshReduceScatter, MeshScatter};
pub use nhr::{BruckAllGather, BruckReduceScatter, NhrAllReduce};
pub use ring::{
    RingAllGather, RingAllReduce, RingBroadcast, RingGather, RingReduce, RingReduceScatter,
    RingScatter,
};

use crate::alg_type::{Level1Algo, Level2Algo};
use crate::device::{DeviceMem, Stream, reduce_async};
use crate::error::{CollexError, Result};
use crate::reduce::INLINE_REDUCE_BIT;
use crate::resource::SubCommView;
use crate::slice::Slice;
use crate::transport::{Direction, Link};
use crate::types::{DataType, ReduceOp};
use std::sync::Arc;

/// Buffers and layout of one kernel launch.
#[derive(Debug, Clone)]
pub struct KernelArgs {
    pub input: DeviceMem,
    pub output: DeviceMem,
    pub scratch: Option<DeviceMem>,
    pub dtype: DataType,
    pub reduce_op: Option<ReduceOp>,
    /// Reduce attribute bits, see [`crate::reduce::reduce_attr`].
    pub attr: u64,
    /// Root as a sub-rank of the plane.
    pub root: u32,
    /// Byte ranges inside `input`/`output`, one per owner.
    pub slices: Vec<Slice>,
    /// Ring position owning each slice. `None` means slice `k` belongs to
    /// sub-rank `k`.
    pub owners: Option<Vec<usize>>,
}

impl KernelArgs {
    pub fn new(input: DeviceMem, output: DeviceMem, dtype: DataType) -> Self {
        Self {
            input,
            output,
            scratch: None,
            dtype,
            reduce_op: None,
            attr: 0,
            root: 0,
            slices: Vec::new(),
            owners: None,
        }
    }

    pub fn slices(mut self, slices: Vec<Slice>) -> Self {
        self.slices = slices;
        self
    }

    pub fn owners(mut self, owners: Vec<usize>) -> Self {
        self.owners = Some(owners);
        self
    }

    pub fn reduce(mut self, op: ReduceOp) -> Self {
        self.reduce_op = Some(op);
        self
    }

    pub fn attr(mut self, attr: u64) -> Self {
        self.attr = attr;
        self
    }

    pub fn root(mut self, root: u32) -> Self {
        self.root = root;
        self
    }

    pub fn scratch(mut self, scratch: Option<DeviceMem>) -> Self {
        self.scratch = scratch;
        self
    }

    pub fn reduce_op(&self) -> Result<ReduceOp> {
        self.reduce_op
            .ok_or_else(|| CollexError::internal("reducing kernel launched without a reduce op"))
    }

    /// Receive the next frame from `from` and fold it into `dst`. Without
    /// the inline bit the frame lands in a staging buffer and a separate
    /// local reduce follows.
    pub fn recv_reduce(&self, from: &Arc<dyn Link>, dst: &DeviceMem, stream: &Stream) -> Result<()> {
        let op = self.reduce_op()?;
        if self.attr & INLINE_REDUCE_BIT != 0 {
            return from.transfer_with_reduce(dst, self.dtype, op, stream);
        }
        let staged = DeviceMem::alloc(dst.size());
        from.transfer_async(Direction::Rx, &staged, stream)?;
        reduce_async(dst, &staged, self.dtype, op, stream)
    }

    pub fn owner_of(&self, k: usize) -> usize {
        self.owners.as_ref().map_or(k, |o| o[k])
    }

    /// Slices owned by ring position `owner`, in slice order.
    pub fn owned_by(&self, owner: usize) -> impl Iterator<Item = Slice> + '_ {
        self.slices
            .iter()
            .enumerate()
            .filter(move |(k, _)| self.owner_of(*k) == owner)
            .map(|(_, s)| *s)
    }

    /// Check the layout against a plane of `n` members.
    pub fn check_layout(&self, n: usize) -> Result<()> {
        match &self.owners {
            None if self.slices.len() != n => Err(CollexError::internal(format!(
                "{} slices for a plane of {n}",
                self.slices.len()
            ))),
            Some(o) if o.len() != self.slices.len() => Err(CollexError::internal(format!(
                "{} owners for {} slices",
                o.len(),
                self.slices.len()
            ))),
            Some(o) if o.iter().any(|&p| p >= n) => Err(CollexError::internal(format!(
                "slice owner outside plane of {n}: {o:?}"
            ))),
            _ => Ok(()),
        }
    }

    pub fn in_window(&self, s: Slice) -> Result<DeviceMem> {
        self.input.range(s.offset, s.size)
    }

    pub fn out_window(&self, s: Slice) -> Result<DeviceMem> {
        self.output.range(s.offset, s.size)
    }
}

/// A collective over one plane.
pub trait SubAlgorithm: Send + Sync {
    fn name(&self) -> &'static str;

    /// Bind buffers and layout for the next launch.
    fn prepare(&mut self, args: KernelArgs) -> Result<()>;

    /// Enqueue the collective on `stream` over `view`.
    fn run_async(&self, view: &SubCommView, stream: &Stream) -> Result<()>;
}

pub(crate) fn prepared<'a>(args: &'a Option<KernelArgs>, name: &str) -> Result<&'a KernelArgs> {
    args.as_ref()
        .ok_or_else(|| CollexError::internal(format!("{name} launched before prepare")))
}

macro_rules! kernel_struct {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Default)]
        pub struct $name {
            args: Option<crate::algorithm::KernelArgs>,
        }

        impl $name {
            pub fn new() -> Self {
                Self::default()
            }
        }
    };
}
pub(crate) use kernel_struct;

/// Level-1 all-reduce kernel for `algo`.
pub fn level1_all_reduce(algo: Level1Algo) -> Box<dyn SubAlgorithm> {
    match algo {
        Level1Algo::Hd => Box::new(HdAllReduce::new()),
        Level1Algo::Nhr | Level1Algo::NhrV1 | Level1Algo::Nb => Box::new(NhrAllReduce::new()),
        _ => Box::new(RingAllReduce::new()),
    }
}

pub fn level1_all_gather(algo: Level1Algo) -> Box<dyn SubAlgorithm> {
    match algo {
        Level1Algo::Hd => Box::new(HdAllGather::new()),
        Level1Algo::Nhr | Level1Algo::NhrV1 | Level1Algo::Nb => Box::new(BruckAllGather::new()),
        _ => Box::new(RingAllGather::new()),
    }
}

pub fn level1_reduce_scatter(algo: Level1Algo) -> Box<dyn SubAlgorithm> {
    match algo {
        Level1Algo::Hd => Box::new(HdReduceScatter::new()),
        Level1Algo::Nhr | Level1Algo::NhrV1 | Level1Algo::Nb => Box::new(BruckReduceScatter::new()),
        _ => Box::new(RingReduceScatter::new()),
    }
}

pub fn level1_broadcast(algo: Level1Algo) -> Box<dyn SubAlgorithm> {
    match algo {
        Level1Algo::Ring | Level1Algo::WholeRing | Level1Algo::Pipeline | Level1Algo::Reserved => {
            Box::new(RingBroadcast::new())
        }
        _ => Box::new(TreeBroadcast::new()),
    }
}

pub fn level1_reduce(algo: Level1Algo) -> Box<dyn SubAlgorithm> {
    match algo {
        Level1Algo::Ring | Level1Algo::WholeRing | Level1Algo::Pipeline | Level1Algo::Reserved => {
            Box::new(RingReduce::new())
        }
        _ => Box::new(TreeReduce::new()),
    }
}

pub fn level2_all_reduce(algo: Level2Algo) -> Box<dyn SubAlgorithm> {
    match algo {
        Level2Algo::Hd => Box::new(HdAllReduce::new()),
        _ => Box::new(RingAllReduce::new()),
    }
}

pub fn level2_all_gather(algo: Level2Algo) -> Box<dyn SubAlgorithm> {
    match algo {
        Level2Algo::Hd => Box::new(HdAllGather::new()),
        _ => Box::new(RingAllGather::new()),
    }
}

pub fn level2_reduce_scatter(algo: Level2Algo) -> Box<dyn SubAlgorithm> {
    match algo {
        Level2Algo::Hd => Box::new(HdReduceScatter::new()),
        _ => Box::new(RingReduceScatter::new()),
    }
}

pub fn level2_broadcast(algo: Level2Algo) -> Box<dyn SubAlgorithm> {
    match algo {
        Level2Algo::Hd => Box::new(TreeBroadcast::new()),
        _ => Box::new(RingBroadcast::new()),
    }
}

pub fn level2_reduce(algo: Level2Algo) -> Box<dyn SubAlgorithm> {
    match algo {
        Level2Algo::Hd => Box::new(TreeReduce::new()),
        _ => Box::new(RingReduce::new()),
    }
}

/// Prepare and launch in one go.
pub fn launch(
    mut kernel: Box<dyn SubAlgorithm>,
    args: KernelArgs,
    view: &SubCommView,
    stream: &Stream,
) -> Result<()> {
    kernel.prepare(args)?;
    kernel.run_async(view, stream)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Run one kernel over an in-process plane of `n` ranks.

    use super::*;
    use crate::resource::{CommLevel, MemKind, PlaneLinks, SingleSubCommTransport};
    use crate::transport::LocalFabric;
    use std::sync::Arc;
    use std::time::Duration;

    pub(crate) fn f32_bytes(v: &[f32]) -> Vec<u8> {
        v.iter().flat_map(|x| x.to_le_bytes()).collect()
    }

    pub(crate) fn f32_values(b: &[u8]) -> Vec<f32> {
        b.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    /// Build mesh views for `n` ranks on a fresh fabric.
    pub(crate) fn mesh_views(n: u32, plane: &str) -> Vec<SubCommView> {
        let fabric = Arc::new(LocalFabric::new());
        (0..n)
            .map(|rank| {
                let t = SingleSubCommTransport::mesh(rank, (0..n).collect(), MemKind::CclInput, MemKind::CclOutput)
                    .unwrap();
                let links = t
                    .transport_requests
                    .iter()
                    .map(|r| {
                        r.is_valid.then(|| {
                            fabric
                                .connect(plane, rank, r.remote_user_rank, Duration::from_secs(5))
                                .unwrap()
                        })
                    })
                    .collect();
                let pl = PlaneLinks {
                    plane_key: plane.to_string(),
                    transport: t,
                    links,
                };
                SubCommView::new(CommLevel::Level1, 0, &pl).unwrap()
            })
            .collect()
    }

    /// Launch `make()` on every rank with `args_of(rank)` and wait.
    pub(crate) async fn run_all<K, A>(n: u32, make: K, args_of: A)
    where
        K: Fn() -> Box<dyn SubAlgorithm>,
        A: Fn(u32) -> KernelArgs,
    {
        let views = mesh_views(n, "test");
        let mut streams = Vec::new();
        for (rank, view) in views.iter().enumerate() {
            let s = Stream::new(rank as u32).unwrap();
            launch(make(), args_of(rank as u32), view, &s).unwrap();
            streams.push(s);
        }
        for s in streams {
            s.synchronize().await.unwrap();
        }
    }
}
