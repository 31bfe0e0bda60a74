use crate::algorithm::{KernelArgs, MeshScatter, RingScatter, SubAlgorithm};
use crate::device::{Stream, copy_async};
use crate::error::Result;
use crate::executor::base::{ExecutorCore, Layout, OpPlan};
use crate::executor::broadcast::RootPlace;
use crate::executor::level0::Level0Kind;
use crate::param::{ExecMem, OpParam};
use crate::resource::{MemKind, OpCommTransport};
use crate::types::OpKind;

fn scatter_kernel(ring: bool) -> Box<dyn SubAlgorithm> {
    if ring {
        Box::new(RingScatter::new())
    } else {
        Box::new(MeshScatter::new())
    }
}

/// Scatter down the hierarchy: super-pod regions from the root, module
/// regions inside each super-pod, device blocks inside each module.
///
/// The root's transit input holds rank `r`'s block at `r * block`; every
/// rank scatters in place in its transit input.
#[derive(Debug, Clone)]
pub struct ScatterPlan {
    level0: Level0Kind,
}

impl ScatterPlan {
    pub fn new(level0: Level0Kind) -> Self {
        Self { level0 }
    }
}

impl OpPlan for ScatterPlan {
    fn name(&self) -> &'static str {
        match self.level0 {
            Level0Kind::Mesh => "ScatterMeshExecutor",
            _ => "ScatterRingExecutor",
        }
    }

    fn op(&self) -> OpKind {
        OpKind::Scatter
    }

    fn calc_stream_num(&self, core: &ExecutorCore) -> u32 {
        self.level0.stream_num(core)
    }

    fn calc_comm_info(&self, core: &ExecutorCore, _param: &OpParam) -> Result<OpCommTransport> {
        let mut t = OpCommTransport::new();
        self.level0.add_transport(core, &mut t, MemKind::CclInput, MemKind::CclInput)?;
        core.add_upper_levels(&mut t, MemKind::CclInput, MemKind::CclInput)?;
        Ok(t)
    }

    fn max_count_per_loop(&self, core: &ExecutorCore, param: &OpParam, ccl_bytes: u64) -> u64 {
        ccl_bytes / (param.unit_size() * core.rank_size()) as u64
    }

    fn input_layout(&self, core: &ExecutorCore, param: &OpParam) -> Layout {
        if core.rank() == param.root {
            Layout::PerRank(core.rank_size())
        } else {
            Layout::None
        }
    }

    fn kernel_run(&self, core: &ExecutorCore, param: &OpParam, mem: &ExecMem, stream: &Stream) -> Result<()> {
        let block = mem.count as usize * param.unit_size();
        let dtype = param.dtype;
        let root = RootPlace::of(core, param);
        let buf = mem.input_mem.range(0, core.rank_size() * block)?;

        if core.slot() == root.slot && core.device() == root.device {
            let args = KernelArgs::new(buf.clone(), buf.clone(), dtype)
                .slices(core.pod_regions(block))
                .root(root.pod);
            core.run_level2(scatter_kernel(core.level2_ring_like()), args, stream)?;
        }
        if core.device() == root.device {
            let args = KernelArgs::new(buf.clone(), buf.clone(), dtype)
                .slices(core.module_regions(block))
                .root(root.slot);
            core.run_level1(scatter_kernel(core.level1_ring_like()), args, stream)?;
        }
        self.level0
            .scatter(core, stream, &buf, &core.device_segments(block), dtype, root.device)?;

        let mine = core.rank() as usize * block;
        copy_async(&mem.output_mem.range(0, block)?, &buf.range(mine, block)?, stream)
    }
}
