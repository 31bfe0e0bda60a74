//! Operator layer: picks the algorithm type, the executor name and the
//! executor tag for one call.

use crate::alg_type::{AlgType, Level1Algo, Level2Algo};
use crate::config::CollexConfig;
use crate::context::CommunicatorContext;
use crate::error::{CollexError, Result};
use crate::executor::AllToAllStagedPlan;
use crate::param::OpParam;
use crate::reduce::{inline_reduce_supported, rdma_reduce_supported};
use crate::selector::SelectorTopo;
use crate::topology::CommTopology;
use crate::types::{OpKind, Rank};
use std::sync::Arc;

/// What the operator decided for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlgSelection {
    pub alg_type: AlgType,
    /// Registry name of the executor to run.
    pub executor: &'static str,
    /// Tag the executor's resources are cached under.
    pub exec_tag: String,
}

/// Ops whose level-1 algorithm the cost model may choose.
fn selectable(op: OpKind) -> bool {
    matches!(
        op,
        OpKind::AllGather
            | OpKind::AllReduce
            | OpKind::ReduceScatter
            | OpKind::Broadcast
            | OpKind::Reduce
            | OpKind::Gather
    )
}

fn pipelined(op: OpKind) -> bool {
    matches!(op, OpKind::AllGather | OpKind::AllReduce | OpKind::ReduceScatter)
}

#[derive(Debug, Clone)]
pub struct Operator {
    rank: Rank,
    topo: Arc<CommTopology>,
    config: Arc<CollexConfig>,
    ctx: Arc<CommunicatorContext>,
}

impl Operator {
    pub fn new(
        rank: Rank,
        topo: Arc<CommTopology>,
        config: Arc<CollexConfig>,
        ctx: Arc<CommunicatorContext>,
    ) -> Self {
        Self {
            rank,
            topo,
            config,
            ctx,
        }
    }

    /// Communicator-level algorithm: the configured one, or the wiring's
    /// level 0 with ring above it.
    pub fn base_alg_type(&self) -> AlgType {
        self.config.algo.unwrap_or_else(|| {
            AlgType::encode(
                self.topo.get_topo_type().level0(),
                Level1Algo::Ring,
                Level2Algo::Ring,
            )
        })
    }

    /// Algorithm the last selection settled on for `op`.
    pub fn alg_type(&self, op: OpKind) -> Result<AlgType> {
        Ok(self
            .ctx
            .alg_override(op)?
            .unwrap_or_else(|| self.base_alg_type()))
    }

    pub fn selector_topo(&self, param: &OpParam, level0_mesh: bool) -> SelectorTopo {
        let (inline_reduce, rdma_reduce) = match param.reduce_op {
            Some(op) if param.op.is_reduction() => (
                self.config.inline_reduce && inline_reduce_supported(param.dtype, op),
                rdma_reduce_supported(param.dtype, op),
            ),
            _ => (false, false),
        };
        SelectorTopo {
            module_num: self.topo.module_num(),
            user_rank_size: self.topo.rank_size(),
            dev_per_aggregation: self.topo.dev_per_aggregation(),
            level0_mesh,
            single_mesh_aggregation: self.topo.is_single_mesh_aggregation(),
            rdma_lite: self.config.rdma_lite,
            inline_reduce,
            rdma_reduce,
            deterministic: self.config.deterministic,
            aiv_mode: self.config.aiv_mode,
        }
    }

    /// Decide algorithm, executor and tag for `param`.
    pub fn select(&self, param: &OpParam) -> Result<AlgSelection> {
        let op = param.op;
        let mut alg = self.base_alg_type();
        let mut chosen = false;
        if self.config.algo.is_none() && self.topo.module_num() > 1 && selectable(op) {
            let cur_size = param.count * param.unit_size() as u64;
            let topo = self.selector_topo(param, alg.is_mesh());
            let ccl = self.config.ccl_buffer_size as u64;
            let bw = self.config.bandwidth_gbps;
            if let Some(level1) = self
                .ctx
                .with_selector(|s| s.select(op, cur_size, ccl, &topo, bw))?
            {
                alg = alg.with_level1(level1);
                chosen = true;
            }
        }
        let alg = self.fallback(op, alg);
        if chosen {
            self.ctx.set_alg_override(op, alg)?;
        }

        let executor = self.executor_name(op, alg);
        let exec_tag = self.exec_tag(param, alg, executor, chosen)?;
        tracing::info!(
            rank = self.rank,
            op = %op,
            executor,
            exec_tag = %exec_tag,
            level0 = alg.level0().name(),
            level1 = alg.level1().name(),
            "operator: executor selected"
        );
        Ok(AlgSelection {
            alg_type: alg,
            executor,
            exec_tag,
        })
    }

    /// Rewrite level-1 choices the op has no kernel for, then drop an 8P
    /// ring level 0 the wiring cannot carry.
    fn fallback(&self, op: OpKind, mut alg: AlgType) -> AlgType {
        let level1 = alg.level1();
        let reset = match op {
            OpKind::Broadcast
                if !matches!(level1, Level1Algo::Nhr | Level1Algo::NhrV1 | Level1Algo::Nb) =>
            {
                Some(Level1Algo::Hd)
            }
            OpKind::Reduce
                if matches!(
                    level1,
                    Level1Algo::Nhr | Level1Algo::NhrV1 | Level1Algo::Nb | Level1Algo::Pipeline
                ) =>
            {
                Some(Level1Algo::Hd)
            }
            OpKind::Scatter
                if !matches!(level1, Level1Algo::Nhr | Level1Algo::Nb | Level1Algo::Ring) =>
            {
                Some(Level1Algo::Ring)
            }
            OpKind::AllGather | OpKind::ReduceScatter
                if alg.uses_pipeline() && !alg.is_mesh() =>
            {
                Some(Level1Algo::Hd)
            }
            _ if alg.uses_pipeline() && !pipelined(op) => Some(Level1Algo::Ring),
            _ => None,
        };
        if let Some(to) = reset {
            tracing::warn!(
                op = %op,
                from = level1.name(),
                to = to.name(),
                "operator: level1 algorithm unsupported for op, reset"
            );
            alg = alg.with_level1(to);
        }
        if alg.is_8p_ring() && self.topo.dev_per_aggregation() != 8 {
            let level0 = self.topo.get_topo_type().level0();
            tracing::warn!(
                op = %op,
                devices = self.topo.dev_per_aggregation(),
                level0 = level0.name(),
                "operator: 8P ring needs 8 devices per aggregation"
            );
            alg = alg.with_level0(level0);
        }
        alg
    }

    /// Registry name of the executor for `op` under `alg`.
    pub fn executor_name(&self, op: OpKind, alg: AlgType) -> &'static str {
        if self.topo.rank_size() == 1 {
            match op {
                OpKind::AllGather => return "AllGatherSingleExecutor",
                OpKind::AllReduce => return "AllReduceSingleExecutor",
                OpKind::ReduceScatter => return "ReduceScatterSingleExecutor",
                OpKind::Reduce => return "ReduceSingleExecutor",
                _ => {}
            }
        }
        let mesh = alg.is_mesh();
        let concurrent = alg.is_double_ring() && self.config.rdma_sdma_concurrent;
        match op {
            OpKind::AllGather if mesh => "AllGatherMeshExecutor",
            OpKind::AllGather if concurrent => "AllGatherDoubleRingConcurrentExecutor",
            OpKind::AllGather => "AllGatherRingExecutor",
            OpKind::AllReduce if mesh => "AllReduceMeshExecutor",
            OpKind::AllReduce if concurrent => "AllReduceDoubleRingConcurrentExecutor",
            OpKind::AllReduce => "AllReduceRingExecutor",
            OpKind::ReduceScatter if mesh => "ReduceScatterMeshExecutor",
            OpKind::ReduceScatter => "ReduceScatterRingExecutor",
            OpKind::Broadcast if mesh => "BroadCastMeshExecutor",
            OpKind::Broadcast => "BroadCastRingExecutor",
            OpKind::Reduce => "ReduceRingPlusHd",
            OpKind::Scatter if mesh => "ScatterMeshExecutor",
            OpKind::Scatter => "ScatterRingExecutor",
            OpKind::Gather => "GatherRingExecutor",
            OpKind::AllToAllV if AllToAllStagedPlan::eligible(&self.topo) => "RunAlltoAllVStaged",
            OpKind::AllToAllV => "RunAlltoAllVFullMesh",
            OpKind::Send => "SendExecutor",
            OpKind::Receive => "ReceiveExecutor",
            OpKind::BatchSendRecv => "BatchSendRecv",
        }
    }

    /// Point-to-point tags name the rank pair, so a send and its matching
    /// receive share resources. Collective tags carry the executor name,
    /// and the level-1 name when the selector chose it.
    fn exec_tag(&self, param: &OpParam, alg: AlgType, executor: &str, chosen: bool) -> Result<String> {
        let tag = &param.tag;
        Ok(match param.op {
            OpKind::Send | OpKind::Receive => {
                let peer = param
                    .peer
                    .ok_or_else(|| CollexError::param(format!("{} needs a peer", param.op)))?;
                format!("{tag}_p2p_{}_{}", self.rank.min(peer), self.rank.max(peer))
            }
            OpKind::BatchSendRecv => format!("{tag}_batch"),
            _ if chosen => format!("{tag}_{}_{executor}", alg.level1_name()),
            _ => format!("{tag}_{executor}"),
        })
    }
}
