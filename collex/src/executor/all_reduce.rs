use crate::algorithm::{KernelArgs, level1_all_reduce, level2_all_reduce};
use crate::device::Stream;
use crate::error::Result;
use crate::executor::base::{ExecutorCore, OpPlan};
use crate::executor::level0::Level0Kind;
use crate::param::{ExecMem, OpParam};
use crate::resource::{MemKind, OpCommTransport};
use crate::slice::prepare_slice_data;
use crate::types::OpKind;

/// Level-0 reduce-scatter, all-reduce of the local segment across levels 1
/// and 2, level-0 all-gather.
#[derive(Debug, Clone)]
pub struct AllReducePlan {
    level0: Level0Kind,
}

impl AllReducePlan {
    pub fn new(level0: Level0Kind) -> Self {
        Self { level0 }
    }
}

impl OpPlan for AllReducePlan {
    fn name(&self) -> &'static str {
        match self.level0 {
            Level0Kind::Ring => "AllReduceRingExecutor",
            Level0Kind::Mesh => "AllReduceMeshExecutor",
            Level0Kind::DoubleRingConcurrent => "AllReduceDoubleRingConcurrentExecutor",
        }
    }

    fn op(&self) -> OpKind {
        OpKind::AllReduce
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
        self.level0.add_transport(core, &mut t, MemKind::CclInput, MemKind::CclOutput)?;
        core.add_upper_levels(&mut t, MemKind::CclOutput, MemKind::CclOutput)?;
        if core.splits_level1(self.level0) {
            core.add_level1_rdma(&mut t, MemKind::CclOutput, MemKind::CclOutput)?;
        }
        Ok(t)
    }

    fn kernel_run(&self, core: &ExecutorCore, param: &OpParam, mem: &ExecMem, stream: &Stream) -> Result<()> {
        let unit = param.unit_size();
        let op = param.reduce_op()?;
        let dtype = param.dtype;
        let segments = prepare_slice_data(mem.count as usize, unit, core.dev_per_aggregation())?;
        let attr = core.reduce_attr(dtype, op);
        tracing::debug!(
            tag = %core.tag(),
            attr,
            segments = segments.len(),
            "all_reduce: kernel"
        );
        let (input, output) = (&mem.input_mem, &mem.output_mem);

        if core.level1_size() <= 1 && core.level2_size() <= 1 {
            return self.level0.all_reduce(core, stream, input, output, &segments, dtype, op);
        }

        self.level0
            .reduce_scatter(core, stream, input, output, &segments, dtype, op)?;

        let mine = segments[core.device() as usize];
        let window = output.range(mine.offset, mine.size)?;
        let alg = core.alg_type();
        let inner = prepare_slice_data(mine.size / unit, unit, core.level1_size())?;
        if core.splits_level1(self.level0) {
            core.run_level1_split(stream, &inner, |slices| {
                let args = KernelArgs::new(window.clone(), window.clone(), dtype)
                    .slices(slices)
                    .reduce(op)
                    .attr(attr);
                (level1_all_reduce(alg.level1()), args)
            })?;
        } else {
            let args = KernelArgs::new(window.clone(), window.clone(), dtype)
                .slices(inner)
                .reduce(op)
                .attr(attr);
            core.run_level1(level1_all_reduce(alg.level1()), args, stream)?;
        }

        let inner = prepare_slice_data(mine.size / unit, unit, core.level2_size())?;
        let args = KernelArgs::new(window.clone(), window, dtype)
            .slices(inner)
            .reduce(op)
            .attr(attr);
        core.run_level2(level2_all_reduce(alg.level2()), args, stream)?;

        self.level0.all_gather(core, stream, output, &segments, dtype)
    }
}
