use crate::algorithm::{KernelArgs, level1_all_gather, level2_all_gather};
use crate::device::{Stream, copy_async};
use crate::error::Result;
use crate::executor::base::{ExecutorCore, Layout, OpPlan};
use crate::executor::level0::Level0Kind;
use crate::param::{ExecMem, OpParam};
use crate::resource::{MemKind, OpCommTransport};
use crate::types::OpKind;

/// Hierarchical all-gather: level 0 inside the module, then module regions
/// across level 1, then super-pod regions across level 2.
///
/// Transit output layout: rank `r`'s block at `r * block`.
#[derive(Debug, Clone)]
pub struct AllGatherPlan {
    level0: Level0Kind,
}

impl AllGatherPlan {
    pub fn new(level0: Level0Kind) -> Self {
        Self { level0 }
    }
}

impl OpPlan for AllGatherPlan {
    fn name(&self) -> &'static str {
        match self.level0 {
            Level0Kind::Ring => "AllGatherRingExecutor",
            Level0Kind::Mesh => "AllGatherMeshExecutor",
            Level0Kind::DoubleRingConcurrent => "AllGatherDoubleRingConcurrentExecutor",
        }
    }

    fn op(&self) -> OpKind {
        OpKind::AllGather
    }

    fn calc_stream_num(&self, core: &ExecutorCore) -> u32 {
        let level0 = self.level0.stream_num(core);
        if core.splits_level1(self.level0) {
            level0.max(1)
        } else {
            level0
        }
    }

    fn calc_comm_info(&self, core: &ExecutorCore, _param: &OpParam) -> Result<OpCommTransport> {
        let mut t = OpCommTransport::new();
        self.level0.add_transport(core, &mut t, MemKind::CclOutput, MemKind::CclOutput)?;
        core.add_upper_levels(&mut t, MemKind::CclOutput, MemKind::CclOutput)?;
        if core.splits_level1(self.level0) {
            core.add_level1_rdma(&mut t, MemKind::CclOutput, MemKind::CclOutput)?;
        }
        Ok(t)
    }

    fn max_count_per_loop(&self, core: &ExecutorCore, param: &OpParam, ccl_bytes: u64) -> u64 {
        ccl_bytes / (param.unit_size() * core.rank_size()) as u64
    }

    fn output_layout(&self, core: &ExecutorCore, _param: &OpParam) -> Layout {
        Layout::PerRank(core.rank_size())
    }

    fn supports_dma_reduce(&self) -> bool {
        true
    }

    fn kernel_run(&self, core: &ExecutorCore, param: &OpParam, mem: &ExecMem, stream: &Stream) -> Result<()> {
        let block = mem.count as usize * param.unit_size();
        let out = &mem.output_mem;
        let mine = out.range(core.rank() as usize * block, block)?;
        copy_async(&mine, &mem.input_mem.range(0, block)?, stream)?;

        self.level0
            .all_gather(core, stream, out, &core.device_segments(block), param.dtype)?;

        let window = out.range(0, core.rank_size() * block)?;
        let alg = core.alg_type();
        let regions = core.module_regions(block);
        if core.splits_level1(self.level0) {
            core.run_level1_split(stream, &regions, |slices| {
                let args = KernelArgs::new(window.clone(), window.clone(), param.dtype).slices(slices);
                (level1_all_gather(alg.level1()), args)
            })?;
        } else {
            let args = KernelArgs::new(window.clone(), window.clone(), param.dtype).slices(regions);
            core.run_level1(level1_all_gather(alg.level1()), args, stream)?;
        }

        let args = KernelArgs::new(window.clone(), window, param.dtype).slices(core.pod_regions(block));
        core.run_level2(level2_all_gather(alg.level2()), args, stream)
    }
}
