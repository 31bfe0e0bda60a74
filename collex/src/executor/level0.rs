//! Level-0 (intra-aggregation) strategies shared by the plans.
//!
//! Every plan moves data inside a module the same three ways: across the
//! ring planes of the module's ring orders, across one full-mesh plane with
//! one round per auxiliary stream, or across both fabrics' double rings at
//! once. The strategy is fixed when an executor is registered.

use crate::algorithm::{KernelArgs, MeshAllGather, MeshGather, MeshReduceScatter, MeshScatter, launch};
use crate::alg_type::{Level0Algo, Level1Algo};
use crate::device::{DeviceMem, Stream, copy_async};
use crate::error::Result;
use crate::executor::base::ExecutorCore;
use crate::executor::multi_ring::{RingLayout, RingPlane, owned_layouts, positional_layouts};
use crate::resource::{CommLevel, MemKind, OpCommTransport, SingleSubCommTransport};
use crate::slice::Slice;
use crate::types::{DataType, ReduceOp};

/// How level 0 moves data inside a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level0Kind {
    /// One ring per device order of the level-0 algorithm.
    Ring,
    /// One full-mesh plane; round `k` runs on auxiliary stream `k`.
    Mesh,
    /// Natural and reversed ring on both the fixed and the RDMA fabric.
    DoubleRingConcurrent,
}

impl Level0Kind {
    pub const fn name(self) -> &'static str {
        match self {
            Level0Kind::Ring => "Ring",
            Level0Kind::Mesh => "Mesh",
            Level0Kind::DoubleRingConcurrent => "DoubleRingConcurrent",
        }
    }

    /// Ring planes of this rank's module. A mesh has one plane in device
    /// order.
    pub fn rings(self, core: &ExecutorCore) -> Vec<RingPlane> {
        let topo = core.topo();
        match self {
            Level0Kind::Ring => topo
                .ring_orders(core.alg_type().level0())
                .into_iter()
                .enumerate()
                .map(|(i, order)| RingPlane::new(CommLevel::Level0, i, order))
                .collect(),
            Level0Kind::DoubleRingConcurrent => {
                let orders = topo.ring_orders(Level0Algo::NpDoubleRing);
                let fixed = orders
                    .iter()
                    .enumerate()
                    .map(|(i, o)| RingPlane::new(CommLevel::Level0, i, o.clone()));
                let rdma = orders
                    .iter()
                    .enumerate()
                    .map(|(i, o)| RingPlane::new(CommLevel::Level0Rdma, i, o.clone()));
                fixed.chain(rdma).collect()
            }
            Level0Kind::Mesh => {
                let natural = (0..topo.dev_per_aggregation()).collect();
                vec![RingPlane::new(CommLevel::Level0, 0, natural)]
            }
        }
    }

    /// Auxiliary streams level 0 needs.
    pub fn stream_num(self, core: &ExecutorCore) -> u32 {
        let dpa = core.dev_per_aggregation() as u32;
        if dpa <= 1 {
            return 0;
        }
        match self {
            Level0Kind::Ring | Level0Kind::DoubleRingConcurrent => {
                self.rings(core).len().saturating_sub(1) as u32
            }
            Level0Kind::Mesh => {
                let pipeline = core.alg_type().level1() == Level1Algo::Pipeline;
                dpa - 1 + u32::from(pipeline)
            }
        }
    }

    /// Level-0 planes, only when the module has more than one device.
    pub fn add_transport(
        self,
        core: &ExecutorCore,
        transport: &mut OpCommTransport,
        input: MemKind,
        output: MemKind,
    ) -> Result<()> {
        let dpa = core.dev_per_aggregation() as u32;
        if dpa <= 1 {
            return Ok(());
        }
        let base = core.module() * dpa;
        for plane in self.rings(core) {
            let members = plane.order.iter().map(|&d| base + d).collect();
            let t = match self {
                Level0Kind::Mesh => SingleSubCommTransport::mesh(core.rank(), members, input, output)?,
                _ => SingleSubCommTransport::ring(core.rank(), members, input, output)?,
            };
            transport.entry(plane.level).or_default().push(t);
        }
        Ok(())
    }

    /// Ring layouts for owned-slice collectives; NIC bookkeeping of a
    /// multi-ring split is stored under the call's tag.
    fn layouts(self, core: &ExecutorCore, segments: &[Slice]) -> Result<(Vec<RingPlane>, Vec<RingLayout>)> {
        let rings = self.rings(core);
        let (layouts, split) = owned_layouts(segments, &rings, core.topo().nics())?;
        if let Some(split) = split {
            tracing::debug!(
                tag = %core.tag(),
                rings = rings.len(),
                ring_nics = ?split.ring_nics,
                "level0: multi-ring split"
            );
            core.ctx()
                .set_ring_nics(core.tag(), split.ring_nics, split.nic_send_sizes)?;
        }
        Ok((rings, layouts))
    }

    /// All-gather of `segments` (one per device) inside `buf`. Each device's
    /// own segment must already be in place.
    pub fn all_gather(
        self,
        core: &ExecutorCore,
        stream: &Stream,
        buf: &DeviceMem,
        segments: &[Slice],
        dtype: DataType,
    ) -> Result<()> {
        let dpa = core.dev_per_aggregation();
        if dpa <= 1 {
            return Ok(());
        }
        let resp = core.response()?;
        let driver = core.multi_ring(stream);
        match self {
            Level0Kind::Mesh => {
                let view = resp.sub_comm(CommLevel::Level0, 0)?;
                driver.run(dpa, |k, s| {
                    if k + 1 == dpa {
                        return Ok(());
                    }
                    let args = KernelArgs::new(buf.clone(), buf.clone(), dtype).slices(segments.to_vec());
                    launch(Box::new(MeshAllGather::round(k)), args, &view, s)
                })
            }
            _ => {
                let (rings, layouts) = self.layouts(core, segments)?;
                driver.all_gather(resp, &rings, &layouts, buf, dtype)
            }
        }
    }

    /// Reduce-scatter of `segments` from `input` (modified in place by the
    /// ring kinds); this device's reduced segment lands in `output`.
    #[allow(clippy::too_many_arguments)]
    pub fn reduce_scatter(
        self,
        core: &ExecutorCore,
        stream: &Stream,
        input: &DeviceMem,
        output: &DeviceMem,
        segments: &[Slice],
        dtype: DataType,
        op: ReduceOp,
    ) -> Result<()> {
        let dpa = core.dev_per_aggregation();
        let me = core.device() as usize;
        if dpa <= 1 {
            let s = segments[me];
            return copy_async(&output.range(s.offset, s.size)?, &input.range(s.offset, s.size)?, stream);
        }
        let resp = core.response()?;
        let driver = core.multi_ring(stream);
        match self {
            Level0Kind::Mesh => {
                let view = resp.sub_comm(CommLevel::Level0, 0)?;
                let args = KernelArgs::new(input.clone(), output.clone(), dtype)
                    .slices(segments.to_vec())
                    .reduce(op)
                    .attr(core.reduce_attr(dtype, op));
                if core.config().deterministic {
                    // rounds run in order on the caller's stream
                    return launch(Box::new(MeshReduceScatter::new()), args, &view, stream);
                }
                let s = segments[me];
                copy_async(&output.range(s.offset, s.size)?, &input.range(s.offset, s.size)?, stream)?;
                driver.run(dpa, |k, st| {
                    if k + 1 == dpa {
                        return Ok(());
                    }
                    launch(Box::new(MeshReduceScatter::round(k)), args.clone(), &view, st)
                })
            }
            _ => {
                let (rings, layouts) = self.layouts(core, segments)?;
                let attr = core.reduce_attr(dtype, op);
                driver.reduce_scatter(resp, &rings, &layouts, input, output, dtype, op, attr)
            }
        }
    }

    /// All-reduce of every segment from `input` into `output`.
    #[allow(clippy::too_many_arguments)]
    pub fn all_reduce(
        self,
        core: &ExecutorCore,
        stream: &Stream,
        input: &DeviceMem,
        output: &DeviceMem,
        segments: &[Slice],
        dtype: DataType,
        op: ReduceOp,
    ) -> Result<()> {
        if core.dev_per_aggregation() <= 1 {
            for s in segments {
                copy_async(&output.range(s.offset, s.size)?, &input.range(s.offset, s.size)?, stream)?;
            }
            return Ok(());
        }
        match self {
            Level0Kind::Mesh => {
                self.reduce_scatter(core, stream, input, output, segments, dtype, op)?;
                self.all_gather(core, stream, output, segments, dtype)
            }
            _ => {
                let (rings, layouts) = self.layouts(core, segments)?;
                let attr = core.reduce_attr(dtype, op);
                core.multi_ring(stream)
                    .all_reduce(core.response()?, &rings, &layouts, input, output, dtype, op, attr)
            }
        }
    }

    /// Scatter from `root_device`: device `d` receives `segments[d]` at the
    /// same offset of `buf`.
    pub fn scatter(
        self,
        core: &ExecutorCore,
        stream: &Stream,
        buf: &DeviceMem,
        segments: &[Slice],
        dtype: DataType,
        root_device: u32,
    ) -> Result<()> {
        self.rooted(core, stream, buf, segments, dtype, root_device, true)
    }

    /// Inverse of [`Level0Kind::scatter`].
    pub fn gather(
        self,
        core: &ExecutorCore,
        stream: &Stream,
        buf: &DeviceMem,
        segments: &[Slice],
        dtype: DataType,
        root_device: u32,
    ) -> Result<()> {
        self.rooted(core, stream, buf, segments, dtype, root_device, false)
    }

    #[allow(clippy::too_many_arguments)]
    fn rooted(
        self,
        core: &ExecutorCore,
        stream: &Stream,
        buf: &DeviceMem,
        segments: &[Slice],
        dtype: DataType,
        root_device: u32,
        scatter: bool,
    ) -> Result<()> {
        let dpa = core.dev_per_aggregation();
        if dpa <= 1 {
            return Ok(());
        }
        let resp = core.response()?;
        let driver = core.multi_ring(stream);
        match self {
            Level0Kind::Mesh => {
                let view = resp.sub_comm(CommLevel::Level0, 0)?;
                driver.run(dpa, |k, s| {
                    if k + 1 == dpa {
                        return Ok(());
                    }
                    let args = KernelArgs::new(buf.clone(), buf.clone(), dtype)
                        .slices(segments.to_vec())
                        .root(root_device);
                    if scatter {
                        launch(Box::new(MeshScatter::round(k)), args, &view, s)
                    } else {
                        launch(Box::new(MeshGather::round(k)), args, &view, s)
                    }
                })
            }
            _ => {
                let rings = self.rings(core);
                let slices = positional_layouts(segments, &rings)?;
                if scatter {
                    driver.scatter(resp, &rings, &slices, buf, dtype, root_device)
                } else {
                    driver.gather(resp, &rings, &slices, buf, dtype, root_device)
                }
            }
        }
    }
}

impl std::fmt::Display for Level0Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
