use crate::device::notify::Notify;
use crate::device::trace::{StreamTrace, TraceKind};
use crate::error::{CollexError, Result};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

enum Command {
    Task {
        label: &'static str,
        fut: BoxFuture<'static, Result<()>>,
    },
    Post(Notify),
    Wait { notify: Notify, timeout: Duration },
    Sync(oneshot::Sender<Result<()>>),
}

/// Where a stream handle is running one ring of a multi-ring launch.
///
/// Task failures on such a handle are wrapped in `RingFailed`.
#[derive(Debug, Clone)]
pub struct RingContext {
    pub tag: String,
    pub ring: usize,
    pub stream: usize,
}

/// An ordered, asynchronous task queue.
///
/// Tasks run one at a time in enqueue order on a background worker.
/// Enqueueing never blocks. The first failure is sticky: later tasks are
/// skipped (posts still go out, poisoned) until [`Stream::synchronize`]
/// reports the error, after which the stream accepts work again.
#[derive(Clone)]
pub struct Stream {
    id: u32,
    tx: mpsc::UnboundedSender<Command>,
    ring: Option<Arc<RingContext>>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("ring", &self.ring)
            .finish()
    }
}

impl Stream {
    /// Start a stream worker on the current tokio runtime.
    pub fn new(id: u32) -> Result<Self> {
        Self::spawn(id, None)
    }

    /// Like [`Stream::new`], recording every event into `trace`.
    pub fn with_trace(id: u32, trace: Arc<StreamTrace>) -> Result<Self> {
        Self::spawn(id, Some(trace))
    }

    fn spawn(id: u32, trace: Option<Arc<StreamTrace>>) -> Result<Self> {
        let handle = tokio::runtime::Handle::try_current().map_err(|e| CollexError::Device {
            message: format!("stream {id} needs a tokio runtime"),
            source: Some(Box::new(e)),
        })?;
        let (tx, rx) = mpsc::unbounded_channel();
        handle.spawn(run_worker(id, rx, trace));
        Ok(Self { id, tx, ring: None })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Handle to the same queue whose task failures carry `ctx`.
    pub fn in_ring(&self, ctx: RingContext) -> Stream {
        Self {
            id: self.id,
            tx: self.tx.clone(),
            ring: Some(Arc::new(ctx)),
        }
    }

    fn send(&self, cmd: Command) -> Result<()> {
        self.tx
            .send(cmd)
            .map_err(|_| CollexError::device(format!("stream {} is closed", self.id)))
    }

    /// Enqueue a task. The future is not polled until every earlier task
    /// on this stream has completed.
    pub fn enqueue<F>(&self, label: &'static str, fut: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let fut = match &self.ring {
            Some(ctx) => {
                let ctx = Arc::clone(ctx);
                async move {
                    fut.await
                        .map_err(|e| CollexError::ring_failed(&ctx.tag, ctx.ring, ctx.stream, e))
                }
                .boxed()
            }
            None => fut.boxed(),
        };
        self.send(Command::Task { label, fut })
    }

    /// Ordering point with no work attached.
    pub fn empty_task(&self) -> Result<()> {
        self.enqueue("empty", async { Ok(()) })
    }

    /// Post `notify` once every earlier task has completed.
    pub fn post(&self, notify: &Notify) -> Result<()> {
        self.send(Command::Post(notify.clone()))
    }

    /// Block later tasks until `notify` is posted.
    pub fn wait(&self, notify: &Notify, timeout: Duration) -> Result<()> {
        self.send(Command::Wait {
            notify: notify.clone(),
            timeout,
        })
    }

    /// Wait for everything enqueued so far; returns the first failure.
    pub async fn synchronize(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Sync(tx))?;
        rx.await
            .map_err(|_| CollexError::device(format!("stream {} worker exited", self.id)))?
    }
}

async fn run_worker(
    id: u32,
    mut rx: mpsc::UnboundedReceiver<Command>,
    trace: Option<Arc<StreamTrace>>,
) {
    let record = |kind: TraceKind| {
        if let Some(t) = &trace {
            t.record(id, kind);
        }
    };
    let mut failed: Option<CollexError> = None;

    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Task { label, fut } => {
                if failed.is_some() {
                    continue;
                }
                match fut.await {
                    Ok(()) => record(TraceKind::Task(label)),
                    Err(e) => {
                        tracing::debug!(stream = id, task = label, error = %e, "stream: task failed");
                        failed = Some(e);
                    }
                }
            }
            Command::Post(notify) => {
                match &failed {
                    Some(e) => notify.post_poisoned(e.to_string()),
                    None => notify.post(),
                }
                record(TraceKind::Post(notify.id()));
            }
            Command::Wait { notify, timeout } => {
                if failed.is_some() {
                    continue;
                }
                match notify.wait(timeout).await {
                    Ok(()) => record(TraceKind::WaitDone(notify.id())),
                    Err(e) => {
                        tracing::debug!(stream = id, notify = notify.id(), error = %e, "stream: wait failed");
                        failed = Some(e);
                    }
                }
            }
            Command::Sync(reply) => {
                let _ = reply.send(failed.take().map_or(Ok(()), Err));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_tasks_run_in_order() {
        let s = Stream::new(0).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let log = Arc::clone(&log);
            s.enqueue("push", async move {
                if i % 2 == 0 {
                    tokio::task::yield_now().await;
                }
                log.lock().unwrap().push(i);
                Ok(())
            })
            .unwrap();
        }
        s.synchronize().await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_failure_is_sticky_until_sync() {
        let s = Stream::new(0).unwrap();
        let ran = Arc::new(Mutex::new(false));
        s.enqueue("fail", async { Err(CollexError::internal("boom")) })
            .unwrap();
        let r = Arc::clone(&ran);
        s.enqueue("skipped", async move {
            *r.lock().unwrap() = true;
            Ok(())
        })
        .unwrap();
        let err = s.synchronize().await.unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert!(!*ran.lock().unwrap());
        s.empty_task().unwrap();
        s.synchronize().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_blocks_until_post() {
        let trace = Arc::new(StreamTrace::new());
        let a = Stream::with_trace(0, Arc::clone(&trace)).unwrap();
        let b = Stream::with_trace(1, Arc::clone(&trace)).unwrap();
        let n = Notify::new(9);
        b.wait(&n, Duration::from_secs(5)).unwrap();
        b.enqueue("after_wait", async { Ok(()) }).unwrap();
        a.enqueue("before_post", async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(())
        })
        .unwrap();
        a.post(&n).unwrap();
        b.synchronize().await.unwrap();
        a.synchronize().await.unwrap();

        let events = trace.drain();
        let pos = |k: TraceKind| events.iter().position(|e| e.kind == k).unwrap();
        assert!(pos(TraceKind::Task("before_post")) < pos(TraceKind::Post(9)));
        assert!(pos(TraceKind::Post(9)) < pos(TraceKind::WaitDone(9)));
        assert!(pos(TraceKind::WaitDone(9)) < pos(TraceKind::Task("after_wait")));
    }

    #[tokio::test]
    async fn test_ring_context_wraps_failure() {
        let s = Stream::new(4).unwrap().in_ring(RingContext {
            tag: "ag".into(),
            ring: 2,
            stream: 3,
        });
        s.enqueue("fail", async { Err(CollexError::transport("reset")) })
            .unwrap();
        let err = s.synchronize().await.unwrap_err();
        assert!(matches!(err, CollexError::RingFailed { ring: 2, stream: 3, .. }));
    }

    #[test]
    fn test_new_outside_runtime_fails() {
        assert!(Stream::new(0).is_err());
    }
}
