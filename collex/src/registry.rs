use crate::error::{CollexError, Result};
use crate::executor::{
    AllGatherPlan, AllReducePlan, AllToAllFullMeshPlan, AllToAllStagedPlan, BatchSendRecvPlan,
    BroadcastPlan, CollExecutor, ExecutorCore, GatherPlan, Level0Kind, NativeExecutor,
    ReceivePlan, ReducePlan, ReduceScatterPlan, ScatterPlan, SendPlan, SingleRankPlan,
};
use crate::types::OpKind;
use indexmap::IndexMap;

/// Builds a fresh executor around a core.
pub type ExecutorFactory = fn(ExecutorCore) -> Box<dyn CollExecutor>;

/// Registry mapping executor names to factories.
///
/// Names are unique; registration order is kept so `names()` lists the
/// built-in executors in a stable order.
pub struct ExecutorRegistry {
    factories: IndexMap<&'static str, ExecutorFactory>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            factories: IndexMap::new(),
        }
    }

    /// Registry holding every built-in executor.
    pub fn with_defaults() -> Self {
        let builtins: [(&'static str, ExecutorFactory); 23] = [
            ("AllGatherRingExecutor", |c| {
                NativeExecutor::boxed(c, AllGatherPlan::new(Level0Kind::Ring))
            }),
            ("AllGatherMeshExecutor", |c| {
                NativeExecutor::boxed(c, AllGatherPlan::new(Level0Kind::Mesh))
            }),
            ("AllGatherDoubleRingConcurrentExecutor", |c| {
                NativeExecutor::boxed(c, AllGatherPlan::new(Level0Kind::DoubleRingConcurrent))
            }),
            ("AllGatherSingleExecutor", |c| {
                NativeExecutor::boxed(c, SingleRankPlan::new(OpKind::AllGather))
            }),
            ("AllReduceRingExecutor", |c| {
                NativeExecutor::boxed(c, AllReducePlan::new(Level0Kind::Ring))
            }),
            ("AllReduceMeshExecutor", |c| {
                NativeExecutor::boxed(c, AllReducePlan::new(Level0Kind::Mesh))
            }),
            ("AllReduceDoubleRingConcurrentExecutor", |c| {
                NativeExecutor::boxed(c, AllReducePlan::new(Level0Kind::DoubleRingConcurrent))
            }),
            ("AllReduceSingleExecutor", |c| {
                NativeExecutor::boxed(c, SingleRankPlan::new(OpKind::AllReduce))
            }),
            ("ReduceScatterRingExecutor", |c| {
                NativeExecutor::boxed(c, ReduceScatterPlan::new(Level0Kind::Ring))
            }),
            ("ReduceScatterMeshExecutor", |c| {
                NativeExecutor::boxed(c, ReduceScatterPlan::new(Level0Kind::Mesh))
            }),
            ("ReduceScatterSingleExecutor", |c| {
                NativeExecutor::boxed(c, SingleRankPlan::new(OpKind::ReduceScatter))
            }),
            ("BroadCastRingExecutor", |c| {
                NativeExecutor::boxed(c, BroadcastPlan::new(Level0Kind::Ring))
            }),
            ("BroadCastMeshExecutor", |c| {
                NativeExecutor::boxed(c, BroadcastPlan::new(Level0Kind::Mesh))
            }),
            ("ReduceRingPlusHd", |c| NativeExecutor::boxed(c, ReducePlan::new())),
            ("ReduceSingleExecutor", |c| {
                NativeExecutor::boxed(c, SingleRankPlan::new(OpKind::Reduce))
            }),
            ("ScatterRingExecutor", |c| {
                NativeExecutor::boxed(c, ScatterPlan::new(Level0Kind::Ring))
            }),
            ("ScatterMeshExecutor", |c| {
                NativeExecutor::boxed(c, ScatterPlan::new(Level0Kind::Mesh))
            }),
            ("GatherRingExecutor", |c| {
                NativeExecutor::boxed(c, GatherPlan::new(Level0Kind::Ring))
            }),
            ("RunAlltoAllVFullMesh", |c| {
                NativeExecutor::boxed(c, AllToAllFullMeshPlan::new())
            }),
            ("RunAlltoAllVStaged", |c| NativeExecutor::boxed(c, AllToAllStagedPlan::new())),
            ("SendExecutor", |c| NativeExecutor::boxed(c, SendPlan)),
            ("ReceiveExecutor", |c| NativeExecutor::boxed(c, ReceivePlan)),
            ("BatchSendRecv", |c| NativeExecutor::boxed(c, BatchSendRecvPlan)),
        ];
        Self {
            factories: builtins.into_iter().collect(),
        }
    }

    /// Register a factory under `name`. Names cannot be re-registered.
    pub fn register(&mut self, name: &'static str, factory: ExecutorFactory) -> Result<()> {
        if self.factories.contains_key(name) {
            return Err(CollexError::DuplicateExecutor { name: name.into() });
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Build the executor registered under `name`.
    pub fn create(&self, name: &str, core: ExecutorCore) -> Result<Box<dyn CollExecutor>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| CollexError::ExecutorNotFound { name: name.into() })?;
        Ok(factory(core))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.factories.keys().copied()
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
