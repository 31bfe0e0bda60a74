//! Cross-rank consistency checking.
//!
//! Every rank registers the shape of each operation before issuing any
//! transfer for it. The i-th registration of a tag on one rank is compared
//! with the i-th registration of the same tag on every other rank; a
//! mismatch is reported as `Divergence` to the rank that noticed it.

use crate::error::{CollexError, Result};
use crate::types::{DataType, OpKind, Rank, ReduceOp};
use std::collections::HashMap;
use std::sync::Mutex;

/// What must agree across ranks for one registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpShape {
    pub op: OpKind,
    pub count: u64,
    pub dtype: DataType,
    pub reduce_op: Option<ReduceOp>,
    pub root: Option<Rank>,
    pub algo: String,
}

impl std::fmt::Display for OpShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} count={} dtype={}", self.op, self.count, self.dtype)?;
        if let Some(op) = self.reduce_op {
            write!(f, " op={op}")?;
        }
        if let Some(root) = self.root {
            write!(f, " root={root}")?;
        }
        write!(f, " algo={}", self.algo)
    }
}

pub trait ConsistencyChecker: Send + Sync {
    /// Register the next operation of `rank` under `tag`.
    fn record_operation(&self, rank: Rank, tag: &str, shape: &OpShape) -> Result<()>;

    /// Mark `rank`'s last registered operation under `tag` as issued.
    fn clear_operation(&self, rank: Rank, tag: &str) -> Result<()>;
}

#[derive(Debug)]
struct Entry {
    shape: OpShape,
    cleared: u32,
}

#[derive(Debug, Default)]
struct TagLedger {
    next_seq: HashMap<Rank, u64>,
    in_flight: HashMap<Rank, u64>,
    open: HashMap<u64, Entry>,
}

/// Shared in-memory checker for ranks living in one process.
#[derive(Debug)]
pub struct LocalConsistency {
    world: u32,
    ledgers: Mutex<HashMap<String, TagLedger>>,
}

impl LocalConsistency {
    pub fn new(world: u32) -> Self {
        Self {
            world,
            ledgers: Mutex::new(HashMap::new()),
        }
    }

    /// Registrations still waiting for some rank to clear them.
    pub fn open_entries(&self, tag: &str) -> usize {
        self.ledgers
            .lock()
            .map(|l| l.get(tag).map_or(0, |t| t.open.len()))
            .unwrap_or(0)
    }
}

impl ConsistencyChecker for LocalConsistency {
    fn record_operation(&self, rank: Rank, tag: &str, shape: &OpShape) -> Result<()> {
        let mut ledgers = self
            .ledgers
            .lock()
            .map_err(|_| CollexError::LockPoisoned("consistency ledger"))?;
        let ledger = ledgers.entry(tag.to_string()).or_default();
        let seq = ledger.next_seq.entry(rank).or_insert(0);
        let this = *seq;
        *seq += 1;

        let entry = ledger.open.entry(this).or_insert_with(|| Entry {
            shape: shape.clone(),
            cleared: 0,
        });
        if entry.shape != *shape {
            tracing::warn!(rank, tag, seq = this, recorded = %entry.shape, issued = %shape, "consistency: divergence");
            return Err(CollexError::Divergence {
                tag: tag.to_string(),
                expected: entry.shape.to_string(),
                actual: shape.to_string(),
            });
        }
        ledger.in_flight.insert(rank, this);
        Ok(())
    }

    fn clear_operation(&self, rank: Rank, tag: &str) -> Result<()> {
        let mut ledgers = self
            .ledgers
            .lock()
            .map_err(|_| CollexError::LockPoisoned("consistency ledger"))?;
        let Some(ledger) = ledgers.get_mut(tag) else {
            return Err(CollexError::internal(format!(
                "rank {rank} cleared tag {tag} without recording it"
            )));
        };
        let seq = ledger.in_flight.remove(&rank).ok_or_else(|| {
            CollexError::internal(format!("rank {rank} has nothing in flight under tag {tag}"))
        })?;
        if let Some(entry) = ledger.open.get_mut(&seq) {
            entry.cleared += 1;
            if entry.cleared >= self.world {
                ledger.open.remove(&seq);
            }
        }
        Ok(())
    }
}
