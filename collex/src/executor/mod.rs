//! Collective executors.
//!
//! An executor turns one [`OpParam`] into a [`ResourceRequest`], and once
//! the request is satisfied, into work enqueued on the caller's stream and
//! its auxiliary streams. The shared machinery (state machine, chunking
//! loop, stream sync set) lives in [`base::ExecutorCore`] and
//! [`base::NativeExecutor`]; each operation contributes an [`base::OpPlan`].

pub mod base;
pub mod level0;
pub mod multi_ring;

mod all_gather;
mod all_reduce;
mod all_to_all;
mod broadcast;
mod gather;
mod reduce;
mod reduce_scatter;
mod scatter;
mod send_recv;
mod single_rank;

pub use all_gather::AllGatherPlan;
pub use all_reduce::AllReducePlan;
pub use all_to_all::{AllToAllFullMeshPlan, AllToAllStagedPlan};
pub use base::{ExecutorCore, Layout, LoopMode, NativeExecutor, OpPlan};
pub use broadcast::BroadcastPlan;
pub use gather::GatherPlan;
pub use level0::Level0Kind;
pub use multi_ring::{MultiRing, RingLayout, RingPlane, SignalPair, StartedRing, StreamSyncSet};
pub use reduce::ReducePlan;
pub use reduce_scatter::ReduceScatterPlan;
pub use scatter::ScatterPlan;
pub use send_recv::{BatchSendRecvPlan, ReceivePlan, SendPlan};
pub use single_rank::SingleRankPlan;

use crate::consistency::ConsistencyChecker;
use crate::error::{CollexError, Result};
use crate::param::{AllToAllVInfo, OpParam};
use crate::resource::{ResourceRequest, ResourceResponse};
use std::sync::Arc;

/// Lifecycle of one executor call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutorState {
    Unconfigured,
    ResourceRequested,
    ResourceBound,
    Running,
    Completed,
}

impl ExecutorState {
    pub const fn name(self) -> &'static str {
        match self {
            ExecutorState::Unconfigured => "Unconfigured",
            ExecutorState::ResourceRequested => "ResourceRequested",
            ExecutorState::ResourceBound => "ResourceBound",
            ExecutorState::Running => "Running",
            ExecutorState::Completed => "Completed",
        }
    }

    /// Whether `self -> to` is a legal step.
    ///
    /// Any state may fall back to `Unconfigured` after a failed call; a
    /// completed executor may be asked for resources again.
    pub fn can_move_to(self, to: ExecutorState) -> bool {
        use ExecutorState::*;
        matches!(
            (self, to),
            (_, Unconfigured)
                | (Unconfigured | ResourceRequested | Completed, ResourceRequested)
                | (ResourceRequested, ResourceBound)
                | (ResourceBound, Running)
                | (Running, Completed)
        )
    }

    pub fn move_to(self, to: ExecutorState) -> Result<ExecutorState> {
        if self.can_move_to(to) {
            Ok(to)
        } else {
            Err(CollexError::InvalidState {
                from: self.name(),
                to: to.name(),
            })
        }
    }
}

impl std::fmt::Display for ExecutorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Turns a call into a resource request.
pub trait ResourceNegotiable {
    /// Compute scratch, streams, notifies and per-level transport for `param`.
    fn calc_res_request(&mut self, param: &OpParam) -> Result<ResourceRequest>;

    /// Whether resources built with `last_scratch` bytes of scratch are too
    /// small for the last computed request.
    fn check_need_recreate_comm(&self, last_scratch: u64) -> bool;
}

/// Runs a call against bound resources.
pub trait Runnable {
    /// Enqueue the whole operation on `param.stream` and the bound
    /// auxiliary streams. Returns once everything is enqueued.
    fn orchestrate(&mut self, param: &OpParam, resource: Arc<ResourceResponse>) -> Result<()>;
}

/// Registers operations with a cross-rank consistency checker.
pub trait ConsistencyAware {
    fn consistency(&self) -> &Arc<dyn ConsistencyChecker>;
}

/// Everything the communicator needs from an executor, object-safe.
pub trait CollExecutor: ResourceNegotiable + Runnable + ConsistencyAware + Send {
    /// Registry name.
    fn name(&self) -> &'static str;

    fn state(&self) -> ExecutorState;

    /// Per-rank length tables for all-to-all-v; ignored by other executors.
    fn set_executor_extra_info(&mut self, _table: &[AllToAllVInfo]) -> Result<()> {
        Ok(())
    }
}
