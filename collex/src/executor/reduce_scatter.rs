use crate::algorithm::{KernelArgs, level1_reduce_scatter, level2_reduce_scatter};
use crate::device::{Stream, copy_async};
use crate::error::{CollexError, Result};
use crate::executor::base::{ExecutorCore, Layout, OpPlan};
use crate::executor::level0::Level0Kind;
use crate::param::{ExecMem, OpParam};
use crate::resource::{MemKind, OpCommTransport};
use crate::types::OpKind;

/// Reduce-scatter from the top level down: super-pod regions in place,
/// module regions into scratch, then device blocks into the output.
///
/// Transit input layout: the block for rank `r` at `r * block`.
#[derive(Debug, Clone)]
pub struct ReduceScatterPlan {
    level0: Level0Kind,
}

impl ReduceScatterPlan {
    pub fn new(level0: Level0Kind) -> Self {
        Self { level0 }
    }
}

impl OpPlan for ReduceScatterPlan {
    fn name(&self) -> &'static str {
        match self.level0 {
            Level0Kind::Mesh => "ReduceScatterMeshExecutor",
            _ => "ReduceScatterRingExecutor",
        }
    }

    fn op(&self) -> OpKind {
        OpKind::ReduceScatter
    }

    fn calc_scratch_mem_size(&self, core: &ExecutorCore, _param: &OpParam) -> Result<u64> {
        if core.level1_size() > 1 {
            Ok(core.config().ccl_buffer_size as u64)
        } else {
            Ok(0)
        }
    }

    fn calc_stream_num(&self, core: &ExecutorCore) -> u32 {
        self.level0.stream_num(core)
    }

    fn calc_comm_info(&self, core: &ExecutorCore, _param: &OpParam) -> Result<OpCommTransport> {
        let mut t = OpCommTransport::new();
        let level0_input = if core.level1_size() > 1 {
            MemKind::Scratch
        } else {
            MemKind::CclInput
        };
        self.level0.add_transport(core, &mut t, level0_input, MemKind::CclOutput)?;
        core.add_upper_levels(&mut t, MemKind::CclInput, MemKind::Scratch)?;
        Ok(t)
    }

    fn max_count_per_loop(&self, core: &ExecutorCore, param: &OpParam, ccl_bytes: u64) -> u64 {
        ccl_bytes / (param.unit_size() * core.rank_size()) as u64
    }

    fn input_layout(&self, core: &ExecutorCore, _param: &OpParam) -> Layout {
        Layout::PerRank(core.rank_size())
    }

    fn kernel_run(&self, core: &ExecutorCore, param: &OpParam, mem: &ExecMem, stream: &Stream) -> Result<()> {
        let block = mem.count as usize * param.unit_size();
        let total = core.rank_size() * block;
        let op = param.reduce_op()?;
        let dtype = param.dtype;
        let alg = core.alg_type();
        let attr = core.reduce_attr(dtype, op);
        tracing::debug!(
            tag = %core.tag(),
            attr,
            block,
            "reduce_scatter: kernel"
        );

        let input = mem.input_mem.range(0, total)?;
        let args = KernelArgs::new(input.clone(), input.clone(), dtype)
            .slices(core.pod_regions(block))
            .reduce(op)
            .attr(attr);
        core.run_level2(level2_reduce_scatter(alg.level2()), args, stream)?;

        let level0_input = if core.level1_size() > 1 {
            let scratch = mem
                .scratch_mem
                .as_ref()
                .ok_or_else(|| CollexError::internal(format!("tag {}: no scratch bound", core.tag())))?
                .range(0, total)?;
            let args = KernelArgs::new(input.clone(), scratch.clone(), dtype)
                .slices(core.module_regions(block))
                .reduce(op)
                .attr(attr);
            core.run_level1(level1_reduce_scatter(alg.level1()), args, stream)?;
            scratch
        } else {
            input
        };

        let out = &mem.output_mem;
        self.level0.reduce_scatter(
            core,
            stream,
            &level0_input,
            out,
            &core.device_segments(block),
            dtype,
            op,
        )?;
        let mine = core.rank() as usize * block;
        copy_async(&out.range(0, block)?, &out.range(mine, block)?, stream)
    }
}
