//! Executor core, operation plans and the chunking loop.
//!
//! [`NativeExecutor`] owns the parts every executor shares: the state
//! machine, the bound resources and stream sync set, consistency
//! registration and the loop that pushes user data through the transit
//! buffers. What moves where inside one iteration is the [`OpPlan`]'s
//! business.

use crate::alg_type::{AlgType, Level1Algo, Level2Algo};
use crate::algorithm::{KernelArgs, SubAlgorithm, launch};
use crate::config::CollexConfig;
use crate::consistency::{ConsistencyChecker, OpShape};
use crate::context::CommunicatorContext;
use crate::device::{DeviceMem, Stream, copy_async};
use crate::error::{CollexError, Result};
use crate::executor::level0::Level0Kind;
use crate::executor::multi_ring::{MultiRing, StreamSyncSet};
use crate::executor::{
    CollExecutor, ConsistencyAware, ExecutorState, ResourceNegotiable, Runnable,
};
use crate::param::{AllToAllVInfo, ExecMem, OpParam};
use crate::resource::{
    CommLevel, MemKind, OpCommTransport, ResourceRequest, ResourceResponse,
    SingleSubCommTransport,
};
use crate::reduce::reduce_attr;
use crate::slice::{Slice, loop_counts, multi_seg_slices};
use crate::topology::CommTopology;
use crate::types::{DataType, OpKind, Rank, ReduceOp};
use std::sync::Arc;
use std::time::Duration;

/// How a user buffer maps onto a transit buffer in one loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// `user[base .. base + cur]` <-> `transit[0 .. cur]`.
    Flat,
    /// `n` rank blocks of `count` elements: user block `r` at
    /// `r * count + base` <-> transit `r * cur`.
    PerRank(usize),
    /// Nothing is copied on this rank.
    None,
}

impl Layout {
    /// `(user, transit)` byte ranges of one iteration.
    fn pairs(self, count: u64, base: u64, cur: u64, unit: usize) -> Vec<(Slice, Slice)> {
        let u = unit as u64;
        let len = (cur * u) as usize;
        match self {
            Layout::Flat => vec![(Slice::new((base * u) as usize, len), Slice::new(0, len))],
            Layout::PerRank(n) => (0..n as u64)
                .map(|r| {
                    (
                        Slice::new(((r * count + base) * u) as usize, len),
                        Slice::new((r * cur * u) as usize, len),
                    )
                })
                .collect(),
            Layout::None => Vec::new(),
        }
    }
}

/// Whether the plan goes through the transit buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopMode {
    Chunked,
    /// One kernel pass straight on the user buffers.
    Direct,
}

/// The operation-specific half of an executor.
pub trait OpPlan: Send {
    /// Registry name; also the `algo` of consistency registrations.
    fn name(&self) -> &'static str;

    fn op(&self) -> OpKind;

    /// Checks beyond [`OpParam::validate`].
    fn parse_param(&mut self, _core: &ExecutorCore, _param: &OpParam) -> Result<()> {
        Ok(())
    }

    fn calc_scratch_mem_size(&self, _core: &ExecutorCore, _param: &OpParam) -> Result<u64> {
        Ok(0)
    }

    /// Auxiliary streams beyond the caller's.
    fn calc_stream_num(&self, _core: &ExecutorCore) -> u32 {
        0
    }

    fn need_aiv_buffer(&self, _core: &ExecutorCore) -> bool {
        false
    }

    fn calc_comm_info(&self, core: &ExecutorCore, param: &OpParam) -> Result<OpCommTransport>;

    /// Elements per rank block one iteration can carry through `ccl_bytes`
    /// of transit buffer.
    fn max_count_per_loop(&self, _core: &ExecutorCore, param: &OpParam, ccl_bytes: u64) -> u64 {
        ccl_bytes / param.unit_size() as u64
    }

    fn input_layout(&self, _core: &ExecutorCore, _param: &OpParam) -> Layout {
        Layout::Flat
    }

    fn output_layout(&self, _core: &ExecutorCore, _param: &OpParam) -> Layout {
        Layout::Flat
    }

    /// Whether the kernel may read the user input in place of the transit
    /// input. Only plans that never write their input qualify.
    fn supports_dma_reduce(&self) -> bool {
        false
    }

    /// Enqueue one iteration on `stream`.
    fn kernel_run(&self, core: &ExecutorCore, param: &OpParam, mem: &ExecMem, stream: &Stream) -> Result<()>;

    fn loop_mode(&self) -> LoopMode {
        LoopMode::Chunked
    }

    /// Count registered with the consistency checker for an iteration of
    /// `cur` elements.
    fn shape_count(&self, _core: &ExecutorCore, _param: &OpParam, cur: u64) -> u64 {
        cur
    }

    fn checks_consistency(&self) -> bool {
        true
    }

    fn set_extra_info(&mut self, _table: &[AllToAllVInfo]) -> Result<()> {
        Ok(())
    }
}

/// Level-1 algorithms that run over a ring plane.
pub(crate) fn ring_like(algo: Level1Algo) -> bool {
    matches!(
        algo,
        Level1Algo::Ring | Level1Algo::WholeRing | Level1Algo::Pipeline | Level1Algo::Reserved
    )
}

fn plane(ring: bool, local: Rank, members: Vec<Rank>, input: MemKind, output: MemKind) -> Result<SingleSubCommTransport> {
    if ring {
        SingleSubCommTransport::ring(local, members, input, output)
    } else {
        SingleSubCommTransport::mesh(local, members, input, output)
    }
}

/// Everything an executor knows about its communicator and current call.
pub struct ExecutorCore {
    rank: Rank,
    topo: Arc<CommTopology>,
    config: Arc<CollexConfig>,
    alg_type: AlgType,
    ctx: Arc<CommunicatorContext>,
    consistency: Arc<dyn ConsistencyChecker>,
    state: ExecutorState,
    response: Option<Arc<ResourceResponse>>,
    sync: StreamSyncSet,
    tag: String,
    scratch_size: u64,
}

impl std::fmt::Debug for ExecutorCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorCore")
            .field("rank", &self.rank)
            .field("alg_type", &self.alg_type)
            .field("state", &self.state)
            .field("tag", &self.tag)
            .finish()
    }
}

impl ExecutorCore {
    pub fn new(
        rank: Rank,
        topo: Arc<CommTopology>,
        config: Arc<CollexConfig>,
        alg_type: AlgType,
        ctx: Arc<CommunicatorContext>,
        consistency: Arc<dyn ConsistencyChecker>,
    ) -> Self {
        Self {
            rank,
            topo,
            config,
            alg_type,
            ctx,
            consistency,
            state: ExecutorState::Unconfigured,
            response: None,
            sync: StreamSyncSet::default(),
            tag: String::new(),
            scratch_size: 0,
        }
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn topo(&self) -> &CommTopology {
        &self.topo
    }

    pub fn config(&self) -> &CollexConfig {
        &self.config
    }

    pub fn alg_type(&self) -> AlgType {
        self.alg_type
    }

    pub fn ctx(&self) -> &CommunicatorContext {
        &self.ctx
    }

    pub fn state(&self) -> ExecutorState {
        self.state
    }

    /// Tag of the current call.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn rank_size(&self) -> usize {
        self.topo.rank_size() as usize
    }

    pub fn device(&self) -> u32 {
        self.topo.device_of(self.rank)
    }

    pub fn module(&self) -> u32 {
        self.topo.module_of(self.rank)
    }

    /// Position of this rank's module inside its super-pod.
    pub fn slot(&self) -> u32 {
        self.module() % self.topo.modules_per_pod()
    }

    pub fn pod(&self) -> u32 {
        self.module() / self.topo.modules_per_pod()
    }

    pub fn dev_per_aggregation(&self) -> usize {
        self.topo.dev_per_aggregation() as usize
    }

    pub fn level1_size(&self) -> usize {
        self.topo.modules_per_pod() as usize
    }

    pub fn level2_size(&self) -> usize {
        self.topo.pod_num() as usize
    }

    pub fn wait_timeout(&self) -> Duration {
        self.config.notify_wait_timeout
    }

    pub fn response(&self) -> Result<&ResourceResponse> {
        self.response
            .as_deref()
            .ok_or_else(|| CollexError::internal(format!("tag {}: no resources bound", self.tag)))
    }

    pub fn sync(&self) -> &StreamSyncSet {
        &self.sync
    }

    /// Reduce attribute for kernels of this executor.
    pub fn reduce_attr(&self, dtype: DataType, op: ReduceOp) -> u64 {
        reduce_attr(dtype, op, self.config.inline_reduce)
    }

    pub fn multi_ring<'a>(&'a self, primary: &'a Stream) -> MultiRing<'a> {
        MultiRing::new(&self.tag, primary, &self.sync, self.wait_timeout())
    }

    fn move_to(&mut self, to: ExecutorState) -> Result<()> {
        self.state = self.state.move_to(to)?;
        Ok(())
    }

    fn reset(&mut self) {
        self.state = ExecutorState::Unconfigured;
        self.response = None;
        self.sync = StreamSyncSet::default();
    }

    fn bind(&mut self, resource: Arc<ResourceResponse>) -> Result<()> {
        self.move_to(ExecutorState::ResourceBound)?;
        self.sync = StreamSyncSet::from_response(&resource)?;
        self.response = Some(resource);
        tracing::debug!(
            tag = %self.tag,
            rings = self.sync.ring_num(),
            "executor: resources bound"
        );
        self.move_to(ExecutorState::Running)
    }

    // ===== Byte regions of rank-major buffers =====

    /// Blocks of the devices of this rank's module, indexed by device.
    pub fn device_segments(&self, block: usize) -> Vec<Slice> {
        let dpa = self.dev_per_aggregation();
        let base = self.module() as usize * dpa * block;
        (0..dpa).map(|d| Slice::new(base + d * block, block)).collect()
    }

    /// Module regions of this rank's super-pod, indexed by slot.
    pub fn module_regions(&self, block: usize) -> Vec<Slice> {
        let bytes = self.dev_per_aggregation() * block;
        let base = self.pod() as usize * self.level1_size() * bytes;
        (0..self.level1_size())
            .map(|s| Slice::new(base + s * bytes, bytes))
            .collect()
    }

    /// Super-pod regions, indexed by pod.
    pub fn pod_regions(&self, block: usize) -> Vec<Slice> {
        let bytes = self.level1_size() * self.dev_per_aggregation() * block;
        (0..self.level2_size())
            .map(|p| Slice::new(p * bytes, bytes))
            .collect()
    }

    // ===== Levels 1 and 2 =====

    pub fn level1_ring_like(&self) -> bool {
        ring_like(self.alg_type.level1())
    }

    pub fn level2_ring_like(&self) -> bool {
        self.alg_type.level2() != Level2Algo::Hd
    }

    /// Level-1 and level-2 planes, each only when that level has peers.
    pub fn add_upper_levels(&self, transport: &mut OpCommTransport, input: MemKind, output: MemKind) -> Result<()> {
        if self.level1_size() > 1 {
            let members = self.topo.level1_ranks(self.rank);
            transport.insert(
                CommLevel::Level1,
                vec![plane(self.level1_ring_like(), self.rank, members, input, output)?],
            );
        }
        if self.level2_size() > 1 {
            let members = self.topo.level2_ranks(self.rank);
            transport.insert(
                CommLevel::Level2,
                vec![plane(self.level2_ring_like(), self.rank, members, input, output)?],
            );
        }
        Ok(())
    }

    /// Whether a ring-like level-1 step runs on both fabrics at once.
    pub fn splits_level1(&self, level0: Level0Kind) -> bool {
        (level0 == Level0Kind::DoubleRingConcurrent || self.config.rdma_sdma_concurrent)
            && self.level1_size() > 1
            && self.level1_ring_like()
    }

    /// RDMA duplicate of the level-1 plane for [`ExecutorCore::run_level1_split`].
    pub fn add_level1_rdma(&self, transport: &mut OpCommTransport, input: MemKind, output: MemKind) -> Result<()> {
        if self.level1_size() > 1 && self.level1_ring_like() {
            let members = self.topo.level1_ranks(self.rank);
            transport.insert(
                CommLevel::Level1Rdma,
                vec![SingleSubCommTransport::ring(self.rank, members, input, output)?],
            );
        }
        Ok(())
    }

    /// Launch a level-1 kernel; a no-op without level-1 peers.
    pub fn run_level1(&self, kernel: Box<dyn SubAlgorithm>, args: KernelArgs, stream: &Stream) -> Result<()> {
        self.run_level(CommLevel::Level1, self.level1_size(), kernel, args, stream)
    }

    pub fn run_level2(&self, kernel: Box<dyn SubAlgorithm>, args: KernelArgs, stream: &Stream) -> Result<()> {
        self.run_level(CommLevel::Level2, self.level2_size(), kernel, args, stream)
    }

    /// Run a level-1 step as two rings: every region is halved, the fixed
    /// plane carries the first halves on an auxiliary stream and the RDMA
    /// plane the second halves on `stream`.
    pub fn run_level1_split<F>(&self, stream: &Stream, regions: &[Slice], mut step: F) -> Result<()>
    where
        F: FnMut(Vec<Slice>) -> (Box<dyn SubAlgorithm>, KernelArgs),
    {
        let pieces = multi_seg_slices(regions, 2)?;
        let levels = [CommLevel::Level1, CommLevel::Level1Rdma];
        let resp = self.response()?;
        self.multi_ring(stream).run(levels.len(), |r, s| {
            let slices = pieces.iter().map(|p| p[r]).collect();
            let (kernel, args) = step(slices);
            let view = resp.sub_comm(levels[r], 0)?;
            tracing::debug!(tag = %self.tag, level = %levels[r], kernel = kernel.name(), "executor: split level step");
            launch(kernel, args, &view, s)
        })
    }

    fn run_level(
        &self,
        level: CommLevel,
        size: usize,
        kernel: Box<dyn SubAlgorithm>,
        args: KernelArgs,
        stream: &Stream,
    ) -> Result<()> {
        if size <= 1 {
            return Ok(());
        }
        let view = self.response()?.sub_comm(level, 0)?;
        tracing::debug!(tag = %self.tag, level = %level, kernel = kernel.name(), "executor: level step");
        launch(kernel, args, &view, stream)
    }
}

/// An executor built from the shared core and one operation plan.
pub struct NativeExecutor<P> {
    core: ExecutorCore,
    plan: P,
}

impl<P: OpPlan + 'static> NativeExecutor<P> {
    pub fn new(core: ExecutorCore, plan: P) -> Self {
        Self { core, plan }
    }

    pub fn boxed(core: ExecutorCore, plan: P) -> Box<dyn CollExecutor> {
        Box::new(Self::new(core, plan))
    }

    pub fn core(&self) -> &ExecutorCore {
        &self.core
    }

    pub fn plan(&self) -> &P {
        &self.plan
    }

    fn build_request(&mut self, param: &OpParam) -> Result<ResourceRequest> {
        self.core.tag = param.exec_tag().to_string();
        self.core.move_to(ExecutorState::ResourceRequested)?;
        self.plan.parse_param(&self.core, param)?;
        let scratch_mem_size = self.plan.calc_scratch_mem_size(&self.core, param)?;
        let stream_num = self.plan.calc_stream_num(&self.core);
        let need_aiv_buffer = self.plan.need_aiv_buffer(&self.core);
        let comm_transport = self.plan.calc_comm_info(&self.core, param)?;
        for (level, planes) in &comm_transport {
            for (index, t) in planes.iter().enumerate() {
                tracing::debug!(
                    tag = %self.core.tag,
                    level = %level,
                    index,
                    kind = ?t.kind,
                    members = ?t.members,
                    "executor: transport requested"
                );
            }
        }
        self.core.scratch_size = scratch_mem_size;
        Ok(ResourceRequest {
            scratch_mem_size,
            stream_num,
            notify_num: 2 * stream_num,
            need_aiv_buffer,
            comm_transport,
        })
    }

    fn shape(&self, param: &OpParam, cur: u64) -> OpShape {
        OpShape {
            op: self.plan.op(),
            count: self.plan.shape_count(&self.core, param, cur),
            dtype: param.dtype,
            reduce_op: if param.op.is_reduction() { param.reduce_op } else { None },
            root: param.op.is_rooted().then_some(param.root),
            algo: self.plan.name().to_string(),
        }
    }

    fn record(&self, param: &OpParam, cur: u64) -> Result<()> {
        if self.plan.checks_consistency() {
            self.core
                .consistency
                .record_operation(self.core.rank, &self.core.tag, &self.shape(param, cur))?;
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        if self.plan.checks_consistency() {
            self.core.consistency.clear_operation(self.core.rank, &self.core.tag)?;
        }
        Ok(())
    }

    /// One kernel pass with no transit copies.
    fn single_pass(&self, param: &OpParam, input: DeviceMem, output: DeviceMem) -> Result<()> {
        self.record(param, param.count)?;
        let mem = ExecMem {
            count: param.count,
            input_mem: input,
            output_mem: output,
            scratch_mem: self.core.response()?.scratch.clone(),
            base_count: 0,
            user_input: param.input.clone(),
            user_output: param.output.clone(),
        };
        self.plan.kernel_run(&self.core, param, &mem, &param.stream)?;
        self.clear()
    }

    fn chunked(&self, param: &OpParam) -> Result<()> {
        let resp = self.core.response()?;
        let unit = param.unit_size();
        let max = self.plan.max_count_per_loop(&self.core, param, resp.ccl_input.size() as u64);
        let counts = loop_counts(param.count as usize, max as usize)?;
        let in_layout = self.plan.input_layout(&self.core, param);
        let out_layout = self.plan.output_layout(&self.core, param);
        let dma = in_layout == Layout::Flat
            && self.plan.supports_dma_reduce()
            && self.core.config.dma_reduce
            && self.core.topo.dev_type().supports_dma_reduce();
        let stream = &param.stream;
        tracing::debug!(
            tag = %self.core.tag,
            count = param.count,
            max,
            iterations = counts.len(),
            dma,
            "executor: chunked loop"
        );

        let mut base = 0u64;
        for cur in counts {
            let cur = cur as u64;
            if cur == 0 {
                return Err(CollexError::internal(format!("tag {}: empty loop iteration", self.core.tag)));
            }
            self.record(param, cur)?;
            tracing::debug!(tag = %self.core.tag, base, cur, "executor: loop iteration");

            let user_input = tail(&param.input, base * unit as u64)?;
            let user_output = tail(&param.output, base * unit as u64)?;
            let input_mem = if dma {
                param.input.range((base * unit as u64) as usize, (cur * unit as u64) as usize)?
            } else {
                for (user, transit) in in_layout.pairs(param.count, base, cur, unit) {
                    copy_async(
                        &resp.ccl_input.range(transit.offset, transit.size)?,
                        &param.input.range(user.offset, user.size)?,
                        stream,
                    )?;
                }
                resp.ccl_input.clone()
            };
            let mem = ExecMem {
                count: cur,
                input_mem,
                output_mem: resp.ccl_output.clone(),
                scratch_mem: resp.scratch.clone(),
                base_count: base,
                user_input,
                user_output,
            };
            self.plan.kernel_run(&self.core, param, &mem, stream)?;
            for (user, transit) in out_layout.pairs(param.count, base, cur, unit) {
                copy_async(
                    &param.output.range(user.offset, user.size)?,
                    &resp.ccl_output.range(transit.offset, transit.size)?,
                    stream,
                )?;
            }
            self.clear()?;
            base += cur;
        }
        Ok(())
    }

    fn run(&mut self, param: &OpParam, resource: Arc<ResourceResponse>) -> Result<()> {
        self.core.bind(resource)?;
        let resp = self.core.response()?;
        let transit_in_place =
            param.input.ptr_eq(&resp.ccl_input) && param.output.ptr_eq(&resp.ccl_output);
        let (ccl_in, ccl_out) = (resp.ccl_input.clone(), resp.ccl_output.clone());

        if self.core.rank_size() == 1 || self.plan.loop_mode() == LoopMode::Direct {
            self.single_pass(param, param.input.clone(), param.output.clone())?;
        } else if transit_in_place {
            self.single_pass(param, ccl_in, ccl_out)?;
        } else {
            self.chunked(param)?;
        }
        self.core.move_to(ExecutorState::Completed)
    }
}

/// `mem` from byte `offset` to its end, empty past the end.
fn tail(mem: &DeviceMem, offset: u64) -> Result<DeviceMem> {
    let offset = (offset as usize).min(mem.size());
    mem.range(offset, mem.size() - offset)
}

impl<P: OpPlan + 'static> ResourceNegotiable for NativeExecutor<P> {
    fn calc_res_request(&mut self, param: &OpParam) -> Result<ResourceRequest> {
        let result = self.build_request(param);
        if result.is_err() {
            self.core.reset();
        }
        result
    }

    fn check_need_recreate_comm(&self, last_scratch: u64) -> bool {
        self.core.scratch_size > last_scratch
    }
}

impl<P: OpPlan + 'static> Runnable for NativeExecutor<P> {
    fn orchestrate(&mut self, param: &OpParam, resource: Arc<ResourceResponse>) -> Result<()> {
        let result = self.run(param, resource);
        match &result {
            Ok(()) => tracing::info!(
                tag = %self.core.tag,
                executor = self.plan.name(),
                "executor: orchestrated"
            ),
            Err(e) => {
                tracing::debug!(tag = %self.core.tag, error = %e, "executor: orchestrate failed");
                self.core.reset();
            }
        }
        result
    }
}

impl<P: OpPlan + 'static> ConsistencyAware for NativeExecutor<P> {
    fn consistency(&self) -> &Arc<dyn ConsistencyChecker> {
        &self.core.consistency
    }
}

impl<P: OpPlan + 'static> CollExecutor for NativeExecutor<P> {
    fn name(&self) -> &'static str {
        self.plan.name()
    }

    fn state(&self) -> ExecutorState {
        self.core.state
    }

    fn set_executor_extra_info(&mut self, table: &[AllToAllVInfo]) -> Result<()> {
        if table.len() != self.core.rank_size() {
            return Err(CollexError::param(format!(
                "all-to-all table has {} rows for {} ranks",
                table.len(),
                self.core.rank_size()
            )));
        }
        self.plan.set_extra_info(table)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::core_with;
    use super::*;
    use crate::alg_type::Level0Algo;

    #[test]
    fn test_layout_pairs() {
        assert_eq!(
            Layout::Flat.pairs(10, 4, 3, 2),
            vec![(Slice::new(8, 6), Slice::new(0, 6))]
        );
        assert_eq!(
            Layout::PerRank(2).pairs(10, 4, 3, 2),
            vec![
                (Slice::new(8, 6), Slice::new(0, 6)),
                (Slice::new(28, 6), Slice::new(6, 6)),
            ]
        );
        assert!(Layout::None.pairs(10, 0, 3, 2).is_empty());
    }

    #[test]
    fn test_regions_for_two_pods() {
        // 8 ranks: 4 modules of 2 devices, 2 modules per pod; rank 7 is
        // pod 1, slot 1, device 1
        let topo = CommTopology::new(8, 2).unwrap().super_pods(2).unwrap();
        let alg = AlgType::encode(Level0Algo::NpSingleRing, Level1Algo::Ring, Level2Algo::Ring);
        let core = core_with(topo, CollexConfig::default(), alg, 7);
        assert_eq!((core.pod(), core.slot(), core.device()), (1, 1, 1));
        assert_eq!(core.device_segments(4), vec![Slice::new(24, 4), Slice::new(28, 4)]);
        assert_eq!(core.module_regions(4), vec![Slice::new(16, 8), Slice::new(24, 8)]);
        assert_eq!(core.pod_regions(4), vec![Slice::new(0, 16), Slice::new(16, 16)]);

        let mut t = OpCommTransport::new();
        core.add_upper_levels(&mut t, MemKind::CclInput, MemKind::CclOutput).unwrap();
        assert_eq!(t[&CommLevel::Level1][0].members, vec![5, 7]);
        assert_eq!(t[&CommLevel::Level2][0].members, vec![3, 7]);
        core.add_level1_rdma(&mut t, MemKind::CclInput, MemKind::CclOutput).unwrap();
        assert_eq!(t[&CommLevel::Level1Rdma][0].members, vec![5, 7]);
    }

    #[test]
    fn test_no_upper_levels_in_one_module() {
        let topo = CommTopology::new(4, 4).unwrap();
        let core = core_with(topo, CollexConfig::default(), AlgType::default(), 2);
        let mut t = OpCommTransport::new();
        core.add_upper_levels(&mut t, MemKind::CclInput, MemKind::CclOutput).unwrap();
        core.add_level1_rdma(&mut t, MemKind::CclInput, MemKind::CclOutput).unwrap();
        assert!(t.is_empty());
    }

    #[test]
    fn test_hd_level1_uses_mesh() {
        let topo = CommTopology::new(8, 2).unwrap();
        let alg = AlgType::encode(Level0Algo::NpSingleRing, Level1Algo::Hd, Level2Algo::Ring);
        let core = core_with(topo, CollexConfig::default(), alg, 0);
        let mut t = OpCommTransport::new();
        core.add_upper_levels(&mut t, MemKind::CclInput, MemKind::CclOutput).unwrap();
        assert_eq!(t[&CommLevel::Level1][0].kind, crate::resource::PlaneKind::Mesh);
        assert!(core.response().is_err());
    }
}
