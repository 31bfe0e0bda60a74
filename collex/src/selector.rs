//! Cost-based choice of the inter-server (level-1) algorithm.
//!
//! Every candidate is priced as `steps * LATENCY_US + factor * bytes / bw`.
//! Ring and NHR are compared first; halving-doubling only wins when strictly
//! cheaper than both, so ties resolve ring > NHR > HD.

use std::collections::HashMap;

use crate::alg_type::Level1Algo;
use crate::types::OpKind;

/// Fixed per-step delay in microseconds.
pub const LATENCY_US: f64 = 60.0;
/// GB/s to B/s.
pub const GB2B: f64 = (1u64 << 30) as f64;
pub const SECOND2MICROSECOND: f64 = 1_000_000.0;
/// All-reduce and rooted ops cost two one-directional passes.
pub const DOUBLE_SUB_CMD: f64 = 2.0;

pub const PIPELINE_MIN_SIZE: u64 = 32 * 1024; // 32 KiB
pub const PIPELINE_MIN_SIZE_NO_LITE: u64 = 2 * 1024 * 1024; // 2 MiB
pub const PIPELINE_ALLREDUCE_MIN_SIZE: u64 = 1024 * 1024; // 1 MiB

/// Topology and capability facts the cost model reads.
#[derive(Debug, Clone, Copy)]
pub struct SelectorTopo {
    /// Number of modules (servers) joined at level 1.
    pub module_num: u32,
    pub user_rank_size: u32,
    pub dev_per_aggregation: u32,
    /// Level 0 is one of the mesh wirings.
    pub level0_mesh: bool,
    pub single_mesh_aggregation: bool,
    pub rdma_lite: bool,
    pub inline_reduce: bool,
    pub rdma_reduce: bool,
    pub deterministic: bool,
    pub aiv_mode: bool,
}

/// Priced candidates for one decision, in evaluation order.
#[derive(Debug, Clone, PartialEq)]
pub struct CostTable {
    pub entries: Vec<(Level1Algo, f64)>,
}

impl CostTable {
    /// Cheapest entry; earlier entries win ties.
    pub fn argmin(&self) -> Option<Level1Algo> {
        let mut best: Option<(Level1Algo, f64)> = None;
        for &(algo, cost) in &self.entries {
            if best.is_none_or(|(_, b)| cost < b) {
                best = Some((algo, cost));
            }
        }
        best.map(|(a, _)| a)
    }

    pub fn cost_of(&self, algo: Level1Algo) -> Option<f64> {
        self.entries.iter().find(|(a, _)| *a == algo).map(|(_, c)| *c)
    }
}

fn is_pow2(m: u32) -> bool {
    m != 0 && m & (m - 1) == 0
}

/// Transfer time in microseconds for `bytes` at `bw` bytes per second.
fn xfer_us(bytes: f64, bw: f64) -> f64 {
    bytes / bw * SECOND2MICROSECOND
}

/// Price ring, NHR and HD for one-directional ops (reduce-scatter, all-gather).
fn one_way_costs(s: f64, topo: &SelectorTopo, bw: f64, with_nhr: bool) -> CostTable {
    let m = f64::from(topo.module_num);
    let n = f64::from(topo.user_rank_size);
    let d = LATENCY_US;
    let bytes = s * n;
    let ring = (m - 1.0) * d + (m - 1.0) / m * xfer_us(bytes, bw);
    let mut entries = vec![(Level1Algo::Ring, ring)];
    if with_nhr {
        let nhr = m.log2().ceil() * d + (m - 1.0) / m * xfer_us(bytes, bw);
        entries.push((Level1Algo::Nhr, nhr));
    }
    let hd = if is_pow2(topo.module_num) {
        m.log2() * d + (m - 1.0) / m * xfer_us(bytes, bw)
    } else {
        m.log2().ceil() * d + (2.0 * m - 1.0) / m * xfer_us(bytes, bw)
    };
    entries.push((Level1Algo::Hd, hd));
    CostTable { entries }
}

fn all_reduce_costs(s: f64, topo: &SelectorTopo, bw: f64) -> CostTable {
    let m = f64::from(topo.module_num);
    let dpa = f64::from(topo.dev_per_aggregation.max(1));
    let d = LATENCY_US;
    let bytes = s / dpa;
    let ring = DOUBLE_SUB_CMD * (m - 1.0) * d + DOUBLE_SUB_CMD * (m - 1.0) / m * xfer_us(bytes, bw);
    let nhr = DOUBLE_SUB_CMD * m.log2().ceil() * d
        + DOUBLE_SUB_CMD * (m - 1.0) / m * xfer_us(bytes, bw);
    let hd = if is_pow2(topo.module_num) {
        DOUBLE_SUB_CMD * m.log2() * d + DOUBLE_SUB_CMD * (m - 1.0) / m * xfer_us(bytes, bw)
    } else {
        DOUBLE_SUB_CMD * m.log2().ceil() * d
            + DOUBLE_SUB_CMD * (2.0 * m - 1.0) / m * xfer_us(bytes, bw)
    };
    CostTable {
        entries: vec![(Level1Algo::Ring, ring), (Level1Algo::Nhr, nhr), (Level1Algo::Hd, hd)],
    }
}

/// Broadcast and reduce: ring against HD, no NHR.
fn rooted_costs(s: f64, topo: &SelectorTopo, bw: f64) -> CostTable {
    let m = f64::from(topo.module_num);
    let dpa = f64::from(topo.dev_per_aggregation.max(1));
    let d = LATENCY_US;
    let bytes = s / dpa;
    let ring = DOUBLE_SUB_CMD * (m - 1.0) * d + DOUBLE_SUB_CMD * (m - 1.0) / m * xfer_us(bytes, bw);
    let hd = if is_pow2(topo.module_num) {
        DOUBLE_SUB_CMD * m.log2() * d + DOUBLE_SUB_CMD * (m - 1.0) / m * xfer_us(bytes, bw)
    } else {
        (1.0 + DOUBLE_SUB_CMD * m.log2().floor()) * d
            + (1.0 + DOUBLE_SUB_CMD * (m - 1.0) / m) * xfer_us(bytes, bw)
    };
    CostTable {
        entries: vec![(Level1Algo::Ring, ring), (Level1Algo::Hd, hd)],
    }
}

/// Price every candidate for `op` at `data_size_per_loop` bytes.
///
/// Returns `None` for ops the cost model does not cover.
pub fn cost_table(op: OpKind, data_size_per_loop: u64, topo: &SelectorTopo, bandwidth_gbps: f64) -> Option<CostTable> {
    let s = data_size_per_loop as f64;
    let bw = bandwidth_gbps * GB2B;
    match op {
        OpKind::ReduceScatter | OpKind::AllGather => Some(one_way_costs(s, topo, bw, true)),
        OpKind::Gather => Some(one_way_costs(s, topo, bw, false)),
        OpKind::AllReduce => Some(all_reduce_costs(s, topo, bw)),
        OpKind::Broadcast | OpKind::Reduce => Some(rooted_costs(s, topo, bw)),
        _ => None,
    }
}

/// Whether `op` skips the cost model and runs the pipeline algorithm.
pub fn pipeline_eligible(op: OpKind, cur_size: u64, topo: &SelectorTopo) -> bool {
    let reduce_ok = topo.inline_reduce && topo.rdma_reduce && !topo.deterministic;
    let min_size = if topo.rdma_lite {
        PIPELINE_MIN_SIZE
    } else {
        PIPELINE_MIN_SIZE_NO_LITE
    };
    let one_way = (op == OpKind::ReduceScatter && reduce_ok) || op == OpKind::AllGather;
    if one_way && topo.dev_per_aggregation != 1 && cur_size >= min_size && topo.level0_mesh {
        return true;
    }
    if op == OpKind::AllReduce {
        let min_size = if topo.rdma_lite {
            PIPELINE_ALLREDUCE_MIN_SIZE
        } else {
            PIPELINE_MIN_SIZE_NO_LITE
        };
        let per_slice = cur_size / (u64::from(topo.module_num) * u64::from(topo.dev_per_aggregation)).max(1);
        return reduce_ok
            && topo.dev_per_aggregation != 1
            && per_slice >= min_size
            && !topo.aiv_mode
            && topo.level0_mesh;
    }
    false
}

/// Size class used as the cache key: `ceil(log2(bytes))`.
pub fn size_class(bytes: u64) -> u32 {
    if bytes <= 1 {
        0
    } else {
        64 - (bytes - 1).leading_zeros()
    }
}

/// Level-1 selector with a per-(op, size class) cache.
#[derive(Debug, Default)]
pub struct AlgoSelector {
    cache: HashMap<(OpKind, u32), Level1Algo>,
    evaluations: usize,
}

impl AlgoSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Choose the level-1 algorithm for one call.
    ///
    /// Returns `None` when no choice is needed: a single mesh aggregation, or
    /// an op kind outside the cost model.
    pub fn select(
        &mut self,
        op: OpKind,
        cur_size: u64,
        ccl_buffer_size: u64,
        topo: &SelectorTopo,
        bandwidth_gbps: f64,
    ) -> Option<Level1Algo> {
        if topo.single_mesh_aggregation {
            tracing::debug!(op = %op, modules = topo.module_num, "selector: single mesh aggregation, no level1 choice");
            return None;
        }
        // Eligibility depends on the uncapped size, which the size class
        // cannot see once the buffer caps it.
        if pipeline_eligible(op, cur_size, topo) {
            tracing::debug!(op = %op, bytes = cur_size, "selector: pipeline bypass");
            return Some(Level1Algo::Pipeline);
        }
        let data_size_per_loop = cur_size.min(ccl_buffer_size);
        let class = size_class(data_size_per_loop);
        if let Some(&cached) = self.cache.get(&(op, class)) {
            return Some(cached);
        }

        let table = cost_table(op, data_size_per_loop, topo, bandwidth_gbps)?;
        let choice = table.argmin()?;
        self.evaluations += 1;
        tracing::info!(
            op = %op,
            modules = topo.module_num,
            bytes = data_size_per_loop,
            algo = choice.name(),
            "selector: level1 chosen"
        );
        self.cache.insert((op, class), choice);
        Some(choice)
    }

    /// How many times the cost model actually ran.
    pub fn evaluations(&self) -> usize {
        self.evaluations
    }
}
