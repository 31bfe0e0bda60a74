//! Per-communicator state shared by every executor of that communicator.
//!
//! Streams, notifies and negotiated resources are cached per operation tag,
//! so repeated calls with the same tag reuse what the first call built. All
//! maps sit behind one lock.

use crate::alg_type::AlgType;
use crate::config::CollexConfig;
use crate::device::{Notify, Stream, StreamTrace};
use crate::error::{CollexError, Result};
use crate::resource::ResourceResponse;
use crate::selector::AlgoSelector;
use crate::types::OpKind;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Extra streams and notifies reserved for one tag.
#[derive(Debug, Clone, Default)]
pub struct StreamBundle {
    pub streams: Vec<Stream>,
    pub notifies: Vec<Notify>,
}

#[derive(Default)]
struct ContextState {
    bundles: HashMap<String, StreamBundle>,
    responses: HashMap<String, Arc<ResourceResponse>>,
    scratch_high_water: HashMap<String, u64>,
    ring_nics: HashMap<String, Vec<Vec<usize>>>,
    nic_send_sizes: HashMap<String, Vec<usize>>,
    selector: AlgoSelector,
    alg_overrides: HashMap<OpKind, AlgType>,
}

pub struct CommunicatorContext {
    state: Mutex<ContextState>,
    next_id: AtomicU32,
    trace: Option<Arc<StreamTrace>>,
}

impl std::fmt::Debug for CommunicatorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommunicatorContext")
            .field("next_id", &self.next_id)
            .field("tracing", &self.trace.is_some())
            .finish()
    }
}

impl CommunicatorContext {
    pub fn new(config: &CollexConfig) -> Self {
        Self {
            state: Mutex::new(ContextState::default()),
            next_id: AtomicU32::new(1),
            trace: config.trace_streams.then(|| Arc::new(StreamTrace::new())),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, ContextState>> {
        self.state
            .lock()
            .map_err(|_| CollexError::LockPoisoned("communicator context"))
    }

    /// Shared trace of every stream this context created, if tracing is on.
    pub fn trace(&self) -> Option<&Arc<StreamTrace>> {
        self.trace.as_ref()
    }

    fn fresh_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// New stream registered with this context's trace.
    pub fn new_stream(&self) -> Result<Stream> {
        let id = self.fresh_id();
        match &self.trace {
            Some(t) => Stream::with_trace(id, Arc::clone(t)),
            None => Stream::new(id),
        }
    }

    /// Streams and notifies for `tag`, grown to at least the given counts.
    pub fn stream_bundle(&self, tag: &str, stream_num: usize, notify_num: usize) -> Result<StreamBundle> {
        let mut state = self.lock()?;
        let bundle = state.bundles.entry(tag.to_string()).or_default();
        while bundle.streams.len() < stream_num {
            bundle.streams.push(self.new_stream()?);
        }
        while bundle.notifies.len() < notify_num {
            bundle.notifies.push(Notify::new(self.fresh_id()));
        }
        Ok(StreamBundle {
            streams: bundle.streams[..stream_num].to_vec(),
            notifies: bundle.notifies[..notify_num].to_vec(),
        })
    }

    pub fn response(&self, tag: &str) -> Result<Option<Arc<ResourceResponse>>> {
        Ok(self.lock()?.responses.get(tag).cloned())
    }

    pub fn store_response(&self, tag: &str, response: Arc<ResourceResponse>, scratch: u64) -> Result<()> {
        let mut state = self.lock()?;
        state.responses.insert(tag.to_string(), response);
        let hw = state.scratch_high_water.entry(tag.to_string()).or_insert(0);
        *hw = (*hw).max(scratch);
        Ok(())
    }

    /// Largest scratch size negotiated so far for `tag`.
    pub fn scratch_high_water(&self, tag: &str) -> Result<u64> {
        Ok(self
            .lock()?
            .scratch_high_water
            .get(tag)
            .copied()
            .unwrap_or(0))
    }

    pub fn set_ring_nics(&self, tag: &str, ring_nics: Vec<Vec<usize>>, send_sizes: Vec<usize>) -> Result<()> {
        let mut state = self.lock()?;
        state.ring_nics.insert(tag.to_string(), ring_nics);
        state.nic_send_sizes.insert(tag.to_string(), send_sizes);
        Ok(())
    }

    pub fn ring_nics(&self, tag: &str) -> Result<Option<Vec<Vec<usize>>>> {
        Ok(self.lock()?.ring_nics.get(tag).cloned())
    }

    pub fn nic_send_sizes(&self, tag: &str) -> Result<Option<Vec<usize>>> {
        Ok(self.lock()?.nic_send_sizes.get(tag).cloned())
    }

    /// Drop the streams, notifies and resources of `tag` so the next call
    /// under it starts from scratch.
    pub fn discard(&self, tag: &str) -> Result<()> {
        let mut state = self.lock()?;
        state.bundles.remove(tag);
        state.responses.remove(tag);
        state.scratch_high_water.remove(tag);
        state.ring_nics.remove(tag);
        state.nic_send_sizes.remove(tag);
        tracing::debug!(tag, "context: resources discarded");
        Ok(())
    }

    /// Record the algorithm the selector settled on for `op`.
    pub fn set_alg_override(&self, op: OpKind, alg: AlgType) -> Result<()> {
        self.lock()?.alg_overrides.insert(op, alg);
        Ok(())
    }

    pub fn alg_override(&self, op: OpKind) -> Result<Option<AlgType>> {
        Ok(self.lock()?.alg_overrides.get(&op).copied())
    }

    /// Run `f` with exclusive access to the level-1 selector.
    pub fn with_selector<T>(&self, f: impl FnOnce(&mut AlgoSelector) -> T) -> Result<T> {
        let mut state = self.lock()?;
        Ok(f(&mut state.selector))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bundle_grows_and_is_reused() {
        let ctx = CommunicatorContext::new(&CollexConfig::default());
        let a = ctx.stream_bundle("t", 2, 4).unwrap();
        let b = ctx.stream_bundle("t", 3, 6).unwrap();
        assert_eq!(b.streams.len(), 3);
        assert_eq!(a.streams[1].id(), b.streams[1].id());
        assert_eq!(a.notifies[3].id(), b.notifies[3].id());
        let other = ctx.stream_bundle("u", 1, 0).unwrap();
        assert_ne!(other.streams[0].id(), a.streams[0].id());
    }

    #[test]
    fn test_scratch_high_water_only_grows() {
        let ctx = CommunicatorContext::new(&CollexConfig::default());
        assert_eq!(ctx.scratch_high_water("t").unwrap(), 0);
        let resp = |n| {
            Arc::new(ResourceResponse {
                ccl_input: crate::device::DeviceMem::alloc(n),
                ccl_output: crate::device::DeviceMem::alloc(n),
                scratch: None,
                aiv_input: None,
                aiv_output: None,
                streams: Vec::new(),
                notifies: Vec::new(),
                links: Default::default(),
            })
        };
        ctx.store_response("t", resp(1), 1024).unwrap();
        ctx.store_response("t", resp(1), 512).unwrap();
        assert_eq!(ctx.scratch_high_water("t").unwrap(), 1024);
        assert!(ctx.response("t").unwrap().is_some());

        ctx.discard("t").unwrap();
        assert!(ctx.response("t").unwrap().is_none());
        assert_eq!(ctx.scratch_high_water("t").unwrap(), 0);
    }

    #[test]
    fn test_alg_override_per_op() {
        use crate::alg_type::{Level0Algo, Level1Algo, Level2Algo};
        let ctx = CommunicatorContext::new(&CollexConfig::default());
        assert_eq!(ctx.alg_override(OpKind::AllReduce).unwrap(), None);
        let alg = AlgType::encode(Level0Algo::NpMesh, Level1Algo::Hd, Level2Algo::Ring);
        ctx.set_alg_override(OpKind::AllReduce, alg).unwrap();
        assert_eq!(ctx.alg_override(OpKind::AllReduce).unwrap(), Some(alg));
        assert_eq!(ctx.alg_override(OpKind::AllGather).unwrap(), None);
    }
}
