use crate::algorithm::{KernelArgs, level1_reduce, level2_reduce};
use crate::device::Stream;
use crate::error::Result;
use crate::executor::base::{ExecutorCore, Layout, OpPlan};
use crate::executor::broadcast::RootPlace;
use crate::executor::level0::Level0Kind;
use crate::param::{ExecMem, OpParam};
use crate::resource::{MemKind, OpCommTransport};
use crate::slice::{Slice, prepare_slice_data};
use crate::types::OpKind;

/// Reduce-scatter inside every module, reduce each segment toward the
/// root's module, gather the segments to the root device.
#[derive(Debug, Clone, Default)]
pub struct ReducePlan;

impl ReducePlan {
    pub fn new() -> Self {
        Self
    }
}

impl OpPlan for ReducePlan {
    fn name(&self) -> &'static str {
        "ReduceRingPlusHd"
    }

    fn op(&self) -> OpKind {
        OpKind::Reduce
    }

    fn calc_stream_num(&self, core: &ExecutorCore) -> u32 {
        Level0Kind::Ring.stream_num(core)
    }

    fn calc_comm_info(&self, core: &ExecutorCore, _param: &OpParam) -> Result<OpCommTransport> {
        let mut t = OpCommTransport::new();
        Level0Kind::Ring.add_transport(core, &mut t, MemKind::CclInput, MemKind::CclOutput)?;
        core.add_upper_levels(&mut t, MemKind::CclOutput, MemKind::CclOutput)?;
        Ok(t)
    }

    fn output_layout(&self, core: &ExecutorCore, param: &OpParam) -> Layout {
        if core.rank() == param.root {
            Layout::Flat
        } else {
            Layout::None
        }
    }

    fn kernel_run(&self, core: &ExecutorCore, param: &OpParam, mem: &ExecMem, stream: &Stream) -> Result<()> {
        let unit = param.unit_size();
        let op = param.reduce_op()?;
        let dtype = param.dtype;
        let root = RootPlace::of(core, param);
        let segments = prepare_slice_data(mem.count as usize, unit, core.dev_per_aggregation())?;
        let attr = core.reduce_attr(dtype, op);
        tracing::debug!(
            tag = %core.tag(),
            attr,
            root = param.root,
            "reduce: kernel"
        );
        let (input, output) = (&mem.input_mem, &mem.output_mem);
        Level0Kind::Ring.reduce_scatter(core, stream, input, output, &segments, dtype, op)?;

        let mine = segments[core.device() as usize];
        let window = output.range(mine.offset, mine.size)?;
        let whole = vec![Slice::new(0, mine.size)];
        let alg = core.alg_type();
        let args = KernelArgs::new(window.clone(), window.clone(), dtype)
            .slices(whole.clone())
            .reduce(op)
            .attr(attr)
            .root(root.slot);
        core.run_level1(level1_reduce(alg.level1()), args, stream)?;
        if core.slot() == root.slot {
            let args = KernelArgs::new(window.clone(), window, dtype)
                .slices(whole)
                .reduce(op)
                .attr(attr)
                .root(root.pod);
            core.run_level2(level2_reduce(alg.level2()), args, stream)?;
        }

        if core.module() == root.module {
            Level0Kind::Ring.gather(core, stream, output, &segments, dtype, root.device)?;
        }
        Ok(())
    }
}
