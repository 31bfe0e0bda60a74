use crate::algorithm::{KernelArgs, MeshGather, RingGather, SubAlgorithm};
use crate::device::{Stream, copy_async};
use crate::error::Result;
use crate::executor::base::{ExecutorCore, Layout, OpPlan};
use crate::executor::broadcast::RootPlace;
use crate::executor::level0::Level0Kind;
use crate::param::{ExecMem, OpParam};
use crate::resource::{MemKind, OpCommTransport};
use crate::types::OpKind;

fn gather_kernel(ring: bool) -> Box<dyn SubAlgorithm> {
    if ring {
        Box::new(RingGather::new())
    } else {
        Box::new(MeshGather::new())
    }
}

/// Inverse of the scatter plan: device blocks to the root device of every
/// module, module regions to the root slot, super-pod regions to the root.
#[derive(Debug, Clone)]
pub struct GatherPlan {
    level0: Level0Kind,
}

impl GatherPlan {
    pub fn new(level0: Level0Kind) -> Self {
        Self { level0 }
    }
}

impl OpPlan for GatherPlan {
    fn name(&self) -> &'static str {
        "GatherRingExecutor"
    }

    fn op(&self) -> OpKind {
        OpKind::Gather
    }

    fn calc_stream_num(&self, core: &ExecutorCore) -> u32 {
        self.level0.stream_num(core)
    }

    fn calc_comm_info(&self, core: &ExecutorCore, _param: &OpParam) -> Result<OpCommTransport> {
        let mut t = OpCommTransport::new();
        self.level0.add_transport(core, &mut t, MemKind::CclOutput, MemKind::CclOutput)?;
        core.add_upper_levels(&mut t, MemKind::CclOutput, MemKind::CclOutput)?;
        Ok(t)
    }

    fn max_count_per_loop(&self, core: &ExecutorCore, param: &OpParam, ccl_bytes: u64) -> u64 {
        ccl_bytes / (param.unit_size() * core.rank_size()) as u64
    }

    fn output_layout(&self, core: &ExecutorCore, param: &OpParam) -> Layout {
        if core.rank() == param.root {
            Layout::PerRank(core.rank_size())
        } else {
            Layout::None
        }
    }

    fn supports_dma_reduce(&self) -> bool {
        true
    }

    fn kernel_run(&self, core: &ExecutorCore, param: &OpParam, mem: &ExecMem, stream: &Stream) -> Result<()> {
        let block = mem.count as usize * param.unit_size();
        let dtype = param.dtype;
        let root = RootPlace::of(core, param);
        let buf = mem.output_mem.range(0, core.rank_size() * block)?;
        let mine = core.rank() as usize * block;
        copy_async(&buf.range(mine, block)?, &mem.input_mem.range(0, block)?, stream)?;

        self.level0
            .gather(core, stream, &buf, &core.device_segments(block), dtype, root.device)?;
        if core.device() == root.device {
            let args = KernelArgs::new(buf.clone(), buf.clone(), dtype)
                .slices(core.module_regions(block))
                .root(root.slot);
            core.run_level1(gather_kernel(core.level1_ring_like()), args, stream)?;
        }
        if core.slot() == root.slot && core.device() == root.device {
            let args = KernelArgs::new(buf.clone(), buf, dtype)
                .slices(core.pod_regions(block))
                .root(root.pod);
            core.run_level2(gather_kernel(core.level2_ring_like()), args, stream)?;
        }
        Ok(())
    }
}
