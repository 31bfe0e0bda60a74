use crate::device::{Stream, copy_async};
use crate::error::Result;
use crate::executor::base::{ExecutorCore, LoopMode, OpPlan};
use crate::param::{ExecMem, OpParam};
use crate::resource::OpCommTransport;
use crate::types::OpKind;

/// One-rank communicator: every supported collective is a local copy of
/// `count` elements, reductions included.
#[derive(Debug, Clone)]
pub struct SingleRankPlan {
    op: OpKind,
}

impl SingleRankPlan {
    pub fn new(op: OpKind) -> Self {
        Self { op }
    }
}

impl OpPlan for SingleRankPlan {
    fn name(&self) -> &'static str {
        match self.op {
            OpKind::AllGather => "AllGatherSingleExecutor",
            OpKind::AllReduce => "AllReduceSingleExecutor",
            OpKind::ReduceScatter => "ReduceScatterSingleExecutor",
            _ => "ReduceSingleExecutor",
        }
    }

    fn op(&self) -> OpKind {
        self.op
    }

    fn calc_comm_info(&self, _core: &ExecutorCore, _param: &OpParam) -> Result<OpCommTransport> {
        Ok(OpCommTransport::new())
    }

    fn loop_mode(&self) -> LoopMode {
        LoopMode::Direct
    }

    fn kernel_run(&self, _core: &ExecutorCore, param: &OpParam, mem: &ExecMem, stream: &Stream) -> Result<()> {
        let bytes = param.count as usize * param.unit_size();
        copy_async(
            &mem.output_mem.range(0, bytes)?,
            &mem.input_mem.range(0, bytes)?,
            stream,
        )
    }
}
