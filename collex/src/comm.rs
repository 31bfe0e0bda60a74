//! Caller-facing communicator.

use crate::alg_type::AlgType;
use crate::alloc::{LocalAllocator, ResourceAllocator};
use crate::config::CollexConfig;
use crate::consistency::{ConsistencyChecker, LocalConsistency};
use crate::context::CommunicatorContext;
use crate::device::{DeviceMem, Stream};
use crate::error::{CollexError, Result};
use crate::executor::{CollExecutor, ExecutorCore};
use crate::operator::{AlgSelection, Operator};
use crate::param::{AllToAllVInfo, OpParam, SendRecvItem};
use crate::registry::ExecutorRegistry;
use crate::resource::{ResourceRequest, ResourceResponse};
use crate::topology::CommTopology;
use crate::transport::LocalFabric;
use crate::types::{DataType, OpKind, Rank, ReduceOp};
use std::collections::{HashMap, HashSet};
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex};

type ExecutorKey = (&'static str, String);

/// One rank's view of a communicator.
///
/// Every call goes through the same steps: validate, pick an executor,
/// negotiate resources (reusing what earlier calls under the same tag
/// built), enqueue on the caller's stream, then wait for the stream.
///
/// # Example
///
/// ```no_run
/// use collex::{CollexConfig, CommTopology, Communicator, DataType, DeviceMem, ReduceOp, Stream};
///
/// # async fn example() -> collex::Result<()> {
/// let comms = Communicator::local_group(CommTopology::new(4, 2)?, CollexConfig::default())?;
/// let comm = &comms[0];
/// let stream = Stream::new(0)?;
/// let buf = DeviceMem::alloc(64);
/// comm.all_reduce("grad", &buf, &buf, 16, DataType::F32, ReduceOp::Sum, &stream)
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct Communicator {
    rank: Rank,
    topo: Arc<CommTopology>,
    config: Arc<CollexConfig>,
    ctx: Arc<CommunicatorContext>,
    consistency: Arc<dyn ConsistencyChecker>,
    allocator: LocalAllocator,
    operator: Operator,
    registry: Arc<ExecutorRegistry>,
    executors: Mutex<HashMap<ExecutorKey, Box<dyn CollExecutor>>>,
    /// Executor tags launched under each caller tag.
    exec_tags: Mutex<HashMap<String, HashSet<String>>>,
}

impl std::fmt::Debug for Communicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Communicator")
            .field("rank", &self.rank)
            .field("rank_size", &self.topo.rank_size())
            .finish()
    }
}

impl Communicator {
    /// Rank `rank` of `topo`, linked to its peers through `fabric`.
    pub fn new(
        rank: Rank,
        topo: Arc<CommTopology>,
        config: Arc<CollexConfig>,
        fabric: Arc<LocalFabric>,
        consistency: Arc<dyn ConsistencyChecker>,
    ) -> Result<Self> {
        topo.check_rank(rank)?;
        let ctx = Arc::new(CommunicatorContext::new(&config));
        let allocator = LocalAllocator::new(
            fabric,
            Arc::clone(&ctx),
            config.ccl_buffer_size,
            config.link_timeout,
        );
        let operator = Operator::new(rank, Arc::clone(&topo), Arc::clone(&config), Arc::clone(&ctx));
        Ok(Self {
            rank,
            topo,
            config,
            ctx,
            consistency,
            allocator,
            operator,
            registry: Arc::new(ExecutorRegistry::with_defaults()),
            executors: Mutex::new(HashMap::new()),
            exec_tags: Mutex::new(HashMap::new()),
        })
    }

    /// Every rank of `topo` in this process, sharing one fabric and one
    /// consistency checker.
    pub fn local_group(topo: CommTopology, config: CollexConfig) -> Result<Vec<Communicator>> {
        let consistency: Arc<dyn ConsistencyChecker> =
            Arc::new(LocalConsistency::new(topo.rank_size()));
        Self::local_group_with(topo, config, consistency)
    }

    /// Like [`Communicator::local_group`] with a caller-supplied checker.
    pub fn local_group_with(
        topo: CommTopology,
        config: CollexConfig,
        consistency: Arc<dyn ConsistencyChecker>,
    ) -> Result<Vec<Communicator>> {
        let topo = Arc::new(topo);
        let config = Arc::new(config);
        let fabric = Arc::new(LocalFabric::new());
        (0..topo.rank_size())
            .map(|rank| {
                Self::new(
                    rank,
                    Arc::clone(&topo),
                    Arc::clone(&config),
                    Arc::clone(&fabric),
                    Arc::clone(&consistency),
                )
            })
            .collect()
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn rank_size(&self) -> u32 {
        self.topo.rank_size()
    }

    pub fn topology(&self) -> &CommTopology {
        &self.topo
    }

    pub fn config(&self) -> &CollexConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<CommunicatorContext> {
        &self.ctx
    }

    /// Transit input and output buffers. Calls whose user buffers are these
    /// run in one pass without staging copies.
    pub fn transit_buffers(&self) -> (DeviceMem, DeviceMem) {
        self.allocator.transit_buffers()
    }

    /// Algorithm the communicator currently uses for `op`.
    pub fn alg_type(&self, op: OpKind) -> Result<AlgType> {
        self.operator.alg_type(op)
    }

    fn lock_executors(&self) -> Result<std::sync::MutexGuard<'_, HashMap<ExecutorKey, Box<dyn CollExecutor>>>> {
        self.executors
            .lock()
            .map_err(|_| CollexError::LockPoisoned("executors"))
    }

    fn prepare(&self, param: &mut OpParam) -> Result<AlgSelection> {
        param.validate(self.rank, self.topo.rank_size())?;
        let sel = self.operator.select(param)?;
        param.set_exec_tag(sel.exec_tag.clone());
        Ok(sel)
    }

    /// Executor cached under `sel`, created on first use.
    fn executor<'a>(
        &self,
        executors: &'a mut HashMap<ExecutorKey, Box<dyn CollExecutor>>,
        sel: &AlgSelection,
    ) -> Result<&'a mut Box<dyn CollExecutor>> {
        Ok(match executors.entry((sel.executor, sel.exec_tag.clone())) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(v) => {
                let core = ExecutorCore::new(
                    self.rank,
                    Arc::clone(&self.topo),
                    Arc::clone(&self.config),
                    sel.alg_type,
                    Arc::clone(&self.ctx),
                    Arc::clone(&self.consistency),
                );
                v.insert(self.registry.create(sel.executor, core)?)
            }
        })
    }

    fn request_for(exec: &mut dyn CollExecutor, param: &OpParam) -> Result<ResourceRequest> {
        if param.op == OpKind::AllToAllV {
            exec.set_executor_extra_info(param.all_to_all_table()?)?;
        }
        exec.calc_res_request(param)
    }

    /// Resources for `tag`: the cached response when it still covers the
    /// request, otherwise a fresh allocation.
    fn negotiate(&self, tag: &str, exec: &dyn CollExecutor, request: &ResourceRequest) -> Result<Arc<ResourceResponse>> {
        let high_water = self.ctx.scratch_high_water(tag)?;
        if let Some(resp) = self.ctx.response(tag)? {
            if resp.covers(request) && !exec.check_need_recreate_comm(high_water) {
                return Ok(resp);
            }
            tracing::debug!(
                rank = self.rank,
                tag,
                scratch = request.scratch_mem_size,
                high_water,
                "comm: rebuilding resources"
            );
        }
        // scratch never shrinks below what earlier calls under the tag used
        let mut request = request.clone();
        request.scratch_mem_size = request.scratch_mem_size.max(high_water);
        let resp = Arc::new(self.allocator.allocate(self.rank, tag, &request)?);
        self.ctx
            .store_response(tag, Arc::clone(&resp), request.scratch_mem_size)?;
        Ok(resp)
    }

    /// The resource request `param` would make, without running it.
    pub fn resource_request(&self, param: &OpParam) -> Result<ResourceRequest> {
        let mut param = param.clone();
        let sel = self.prepare(&mut param)?;
        let mut executors = self.lock_executors()?;
        let exec = self.executor(&mut executors, &sel)?;
        Self::request_for(&mut **exec, &param)
    }

    /// Enqueue `param` on its stream and return without waiting.
    ///
    /// Sets the executor tag on `param`.
    pub fn launch(&self, param: &mut OpParam) -> Result<()> {
        let sel = self.prepare(param)?;
        self.exec_tags
            .lock()
            .map_err(|_| CollexError::LockPoisoned("exec tags"))?
            .entry(param.tag.clone())
            .or_default()
            .insert(sel.exec_tag.clone());
        let mut executors = self.lock_executors()?;
        let exec = self.executor(&mut executors, &sel)?;
        let request = Self::request_for(&mut **exec, param)?;
        let response = self.negotiate(&sel.exec_tag, &**exec, &request)?;
        exec.orchestrate(param, response)
    }

    /// Run `param` to completion.
    ///
    /// A failed call keeps its streams, notifies and buffers allocated so
    /// they can be inspected. Call [`Communicator::release`] before reusing
    /// the tag.
    pub async fn run(&self, mut param: OpParam) -> Result<()> {
        let outcome = match self.launch(&mut param) {
            Ok(()) => param.stream.synchronize().await,
            Err(e) => Err(e),
        };
        let Err(err) = outcome else {
            return Ok(());
        };
        let err = self.drain_aux(param.exec_tag(), err).await;
        tracing::error!(rank = self.rank, tag = %param.tag, op = %param.op, error = %err, "comm: operation failed");
        Err(CollexError::op_failed(&param.tag, param.op.name(), err))
    }

    /// Tear down everything calls under `tag` built: cached executors and
    /// the context's streams, notifies, buffers and NIC lists.
    pub fn release(&self, tag: &str) -> Result<()> {
        let exec_tags = self
            .exec_tags
            .lock()
            .map_err(|_| CollexError::LockPoisoned("exec tags"))?
            .remove(tag)
            .unwrap_or_default();
        self.lock_executors()?
            .retain(|(_, exec_tag), _| !exec_tags.contains(exec_tag));
        for exec_tag in &exec_tags {
            self.ctx.discard(exec_tag)?;
        }
        tracing::debug!(rank = self.rank, tag, released = exec_tags.len(), "comm: tag released");
        Ok(())
    }

    /// Wait out the auxiliary streams of a failed call. A ring failure
    /// reported there names the ring and stream, so it wins over the
    /// primary stream's error.
    async fn drain_aux(&self, tag: &str, err: CollexError) -> CollexError {
        let Ok(Some(resp)) = self.ctx.response(tag) else {
            return err;
        };
        let mut ring_err = None;
        for stream in &resp.streams {
            match stream.synchronize().await {
                Err(e @ CollexError::RingFailed { .. }) if ring_err.is_none() => ring_err = Some(e),
                _ => {}
            }
        }
        if matches!(err, CollexError::RingFailed { .. }) {
            return err;
        }
        ring_err.unwrap_or(err)
    }

    pub async fn all_gather(
        &self,
        tag: &str,
        input: &DeviceMem,
        output: &DeviceMem,
        count: u64,
        dtype: DataType,
        stream: &Stream,
    ) -> Result<()> {
        self.run(OpParam::all_gather(tag, input.clone(), output.clone(), count, dtype, stream.clone()))
            .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn all_reduce(
        &self,
        tag: &str,
        input: &DeviceMem,
        output: &DeviceMem,
        count: u64,
        dtype: DataType,
        op: ReduceOp,
        stream: &Stream,
    ) -> Result<()> {
        self.run(OpParam::all_reduce(tag, input.clone(), output.clone(), count, dtype, op, stream.clone()))
            .await
    }

    /// `count` is the per-rank output size.
    #[allow(clippy::too_many_arguments)]
    pub async fn reduce_scatter(
        &self,
        tag: &str,
        input: &DeviceMem,
        output: &DeviceMem,
        count: u64,
        dtype: DataType,
        op: ReduceOp,
        stream: &Stream,
    ) -> Result<()> {
        self.run(OpParam::reduce_scatter(tag, input.clone(), output.clone(), count, dtype, op, stream.clone()))
            .await
    }

    pub async fn broadcast(
        &self,
        tag: &str,
        buffer: &DeviceMem,
        count: u64,
        dtype: DataType,
        root: Rank,
        stream: &Stream,
    ) -> Result<()> {
        self.run(OpParam::broadcast(tag, buffer.clone(), count, dtype, root, stream.clone()))
            .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn reduce(
        &self,
        tag: &str,
        input: &DeviceMem,
        output: &DeviceMem,
        count: u64,
        dtype: DataType,
        op: ReduceOp,
        root: Rank,
        stream: &Stream,
    ) -> Result<()> {
        self.run(OpParam::reduce(tag, input.clone(), output.clone(), count, dtype, op, root, stream.clone()))
            .await
    }

    /// `count` is the per-rank block size.
    #[allow(clippy::too_many_arguments)]
    pub async fn scatter(
        &self,
        tag: &str,
        input: &DeviceMem,
        output: &DeviceMem,
        count: u64,
        dtype: DataType,
        root: Rank,
        stream: &Stream,
    ) -> Result<()> {
        self.run(OpParam::scatter(tag, input.clone(), output.clone(), count, dtype, root, stream.clone()))
            .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn gather(
        &self,
        tag: &str,
        input: &DeviceMem,
        output: &DeviceMem,
        count: u64,
        dtype: DataType,
        root: Rank,
        stream: &Stream,
    ) -> Result<()> {
        self.run(OpParam::gather(tag, input.clone(), output.clone(), count, dtype, root, stream.clone()))
            .await
    }

    /// `table[r]` is rank `r`'s row; every rank passes the same table.
    pub async fn all_to_all_v(
        &self,
        tag: &str,
        input: &DeviceMem,
        output: &DeviceMem,
        dtype: DataType,
        table: Vec<AllToAllVInfo>,
        stream: &Stream,
    ) -> Result<()> {
        self.run(OpParam::all_to_all_v(tag, input.clone(), output.clone(), dtype, table, stream.clone()))
            .await
    }

    pub async fn send(
        &self,
        tag: &str,
        input: &DeviceMem,
        count: u64,
        dtype: DataType,
        peer: Rank,
        stream: &Stream,
    ) -> Result<()> {
        self.run(OpParam::send(tag, input.clone(), count, dtype, peer, stream.clone()))
            .await
    }

    pub async fn recv(
        &self,
        tag: &str,
        output: &DeviceMem,
        count: u64,
        dtype: DataType,
        peer: Rank,
        stream: &Stream,
    ) -> Result<()> {
        self.run(OpParam::receive(tag, output.clone(), count, dtype, peer, stream.clone()))
            .await
    }

    pub async fn batch_send_recv(&self, tag: &str, items: Vec<SendRecvItem>, stream: &Stream) -> Result<()> {
        self.run(OpParam::batch_send_recv(tag, items, stream.clone()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resource_request_without_running() {
        let comms = Communicator::local_group(CommTopology::new(8, 8).unwrap(), CollexConfig::default()).unwrap();
        let stream = Stream::new(0).unwrap();
        let input = DeviceMem::alloc(64);
        let output = DeviceMem::alloc(64 * 8);
        let param = OpParam::all_gather("ag", input, output, 16, DataType::F32, stream);
        let req = comms[3].resource_request(&param).unwrap();
        assert_eq!(req.stream_num, 7);
        assert_eq!(req.notify_num, 14);
        assert!(comms[3].context().response("ag_AllGatherRingExecutor").unwrap().is_none());
    }

    fn bare_request(scratch: u64, streams: u32) -> ResourceRequest {
        ResourceRequest {
            scratch_mem_size: scratch,
            stream_num: streams,
            notify_num: 0,
            need_aiv_buffer: false,
            comm_transport: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_rebuild_keeps_scratch_high_water() {
        let comms = Communicator::local_group(CommTopology::new(1, 1).unwrap(), CollexConfig::default()).unwrap();
        let comm = &comms[0];
        let mut param = OpParam::all_gather(
            "grow",
            DeviceMem::alloc(64),
            DeviceMem::alloc(64),
            16,
            DataType::F32,
            Stream::new(0).unwrap(),
        );
        let sel = comm.prepare(&mut param).unwrap();
        let mut executors = comm.lock_executors().unwrap();
        let exec = comm.executor(&mut executors, &sel).unwrap();

        let first = comm.negotiate(&sel.exec_tag, &**exec, &bare_request(4096, 0)).unwrap();
        assert_eq!(first.scratch.as_ref().map(DeviceMem::size), Some(4096));
        // more streams force a rebuild, the smaller scratch must not shrink it
        let second = comm.negotiate(&sel.exec_tag, &**exec, &bare_request(1024, 2)).unwrap();
        assert_eq!(second.streams.len(), 2);
        assert_eq!(second.scratch.as_ref().map(DeviceMem::size), Some(4096));
        assert_eq!(comm.context().scratch_high_water(&sel.exec_tag).unwrap(), 4096);
    }

    #[tokio::test]
    async fn test_release_drops_only_its_tag() {
        let comms = Communicator::local_group(CommTopology::new(1, 1).unwrap(), CollexConfig::default()).unwrap();
        let comm = &comms[0];
        let stream = Stream::new(0).unwrap();
        let (input, output) = (DeviceMem::alloc(64), DeviceMem::alloc(64));
        comm.all_gather("a", &input, &output, 16, DataType::F32, &stream).await.unwrap();
        comm.all_gather("a_b", &input, &output, 16, DataType::F32, &stream).await.unwrap();
        assert!(comm.context().response("a_AllGatherSingleExecutor").unwrap().is_some());

        comm.release("a").unwrap();
        assert!(comm.context().response("a_AllGatherSingleExecutor").unwrap().is_none());
        assert!(comm.context().response("a_b_AllGatherSingleExecutor").unwrap().is_some());
        assert_eq!(comm.lock_executors().unwrap().len(), 1);
        comm.release("never-used").unwrap();
    }

    #[tokio::test]
    async fn test_invalid_rank_rejected() {
        let topo = Arc::new(CommTopology::new(2, 2).unwrap());
        let err = Communicator::new(
            2,
            topo,
            Arc::new(CollexConfig::default()),
            Arc::new(LocalFabric::new()),
            Arc::new(LocalConsistency::new(2)),
        )
        .unwrap_err();
        assert!(matches!(err, CollexError::InvalidRank { .. }));
    }
}
