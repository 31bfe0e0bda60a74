use crate::algorithm::{KernelArgs, level1_broadcast, level2_broadcast};
use crate::device::{Stream, copy_async};
use crate::error::Result;
use crate::executor::base::{ExecutorCore, Layout, OpPlan};
use crate::executor::level0::Level0Kind;
use crate::param::{ExecMem, OpParam};
use crate::resource::{MemKind, OpCommTransport};
use crate::slice::{Slice, prepare_slice_data};
use crate::types::OpKind;

/// Where the root of a rooted collective sits in the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RootPlace {
    pub device: u32,
    pub module: u32,
    pub slot: u32,
    pub pod: u32,
}

impl RootPlace {
    pub fn of(core: &ExecutorCore, param: &OpParam) -> Self {
        let topo = core.topo();
        let module = topo.module_of(param.root);
        Self {
            device: topo.device_of(param.root),
            module,
            slot: module % topo.modules_per_pod(),
            pod: module / topo.modules_per_pod(),
        }
    }
}

/// Scatter inside the root's module, broadcast each device's segment
/// across super-pods and modules, all-gather inside every module.
#[derive(Debug, Clone)]
pub struct BroadcastPlan {
    level0: Level0Kind,
}

impl BroadcastPlan {
    pub fn new(level0: Level0Kind) -> Self {
        Self { level0 }
    }
}

impl OpPlan for BroadcastPlan {
    fn name(&self) -> &'static str {
        match self.level0 {
            Level0Kind::Mesh => "BroadCastMeshExecutor",
            _ => "BroadCastRingExecutor",
        }
    }

    fn op(&self) -> OpKind {
        OpKind::Broadcast
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

    fn input_layout(&self, core: &ExecutorCore, param: &OpParam) -> Layout {
        if core.rank() == param.root {
            Layout::Flat
        } else {
            Layout::None
        }
    }

    fn supports_dma_reduce(&self) -> bool {
        true
    }

    fn kernel_run(&self, core: &ExecutorCore, param: &OpParam, mem: &ExecMem, stream: &Stream) -> Result<()> {
        let bytes = mem.count as usize * param.unit_size();
        let dtype = param.dtype;
        let root = RootPlace::of(core, param);
        let buf = mem.output_mem.range(0, bytes)?;
        if core.rank() == param.root {
            copy_async(&buf, &mem.input_mem.range(0, bytes)?, stream)?;
        }

        let segments = prepare_slice_data(mem.count as usize, param.unit_size(), core.dev_per_aggregation())?;
        if core.module() == root.module {
            self.level0.scatter(core, stream, &buf, &segments, dtype, root.device)?;
        }

        let mine = segments[core.device() as usize];
        let window = buf.range(mine.offset, mine.size)?;
        let whole = vec![Slice::new(0, mine.size)];
        let alg = core.alg_type();
        if core.slot() == root.slot {
            let args = KernelArgs::new(window.clone(), window.clone(), dtype)
                .slices(whole.clone())
                .root(root.pod);
            core.run_level2(level2_broadcast(alg.level2()), args, stream)?;
        }
        let args = KernelArgs::new(window.clone(), window, dtype)
            .slices(whole)
            .root(root.slot);
        core.run_level1(level1_broadcast(alg.level1()), args, stream)?;

        self.level0.all_gather(core, stream, &buf, &segments, dtype)
    }
}
