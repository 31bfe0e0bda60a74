use collex::{
    CollexConfig, CommTopology, Communicator, ConsistencyChecker, DeviceMem, LocalConsistency,
    OpShape, Rank, Result,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Small transit buffers so multi-iteration loops show up at test sizes.
pub fn test_config() -> CollexConfig {
    CollexConfig {
        ccl_buffer_size: 64 * 1024,
        link_timeout: Duration::from_secs(5),
        notify_wait_timeout: Duration::from_secs(5),
        ..CollexConfig::default()
    }
}

/// Helper: run one closure per rank of `topo` concurrently.
/// Keeps all communicators alive until every task completes.
pub async fn run_collective<F, Fut>(topo: CommTopology, config: CollexConfig, f: F)
where
    F: Fn(Arc<Communicator>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let comms = Communicator::local_group(topo, config).unwrap();
    run_on(comms, f).await;
}

/// Like [`run_collective`] on communicators the caller already built.
pub async fn run_on<F, Fut>(comms: Vec<Communicator>, f: F)
where
    F: Fn(Arc<Communicator>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let comms: Vec<Arc<Communicator>> = comms.into_iter().map(Arc::new).collect();
    let f = Arc::new(f);
    let mut handles = Vec::new();
    for c in &comms {
        let c = Arc::clone(c);
        let f = Arc::clone(&f);
        handles.push(tokio::spawn(async move { f(c).await }));
    }
    for h in handles {
        h.await.unwrap();
    }
}

pub fn f32_mem(values: &[f32]) -> DeviceMem {
    DeviceMem::from_vec(values.iter().flat_map(|x| x.to_le_bytes()).collect())
}

pub fn zeroed_f32(count: usize) -> DeviceMem {
    DeviceMem::alloc(count * 4)
}

pub fn read_f32(mem: &DeviceMem) -> Vec<f32> {
    mem.read()
        .unwrap()
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Integer-valued payload distinct per rank and element.
pub fn pattern(rank: Rank, count: usize) -> Vec<f32> {
    (0..count).map(|i| (rank as usize * 1000 + i % 1000) as f32).collect()
}

/// Checker that forwards to [`LocalConsistency`] and remembers every
/// registration.
pub struct RecordingChecker {
    inner: LocalConsistency,
    pub records: Mutex<Vec<(Rank, String, OpShape)>>,
}

impl RecordingChecker {
    pub fn new(world: u32) -> Self {
        Self {
            inner: LocalConsistency::new(world),
            records: Mutex::new(Vec::new()),
        }
    }

    /// Counts `rank` registered, in order.
    pub fn counts_of(&self, rank: Rank) -> Vec<u64> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|(r, _, _)| *r == rank)
            .map(|(_, _, s)| s.count)
            .collect()
    }
}

impl ConsistencyChecker for RecordingChecker {
    fn record_operation(&self, rank: Rank, tag: &str, shape: &OpShape) -> Result<()> {
        self.records
            .lock()
            .unwrap()
            .push((rank, tag.to_string(), shape.clone()));
        self.inner.record_operation(rank, tag, shape)
    }

    fn clear_operation(&self, rank: Rank, tag: &str) -> Result<()> {
        self.inner.clear_operation(rank, tag)
    }
}
