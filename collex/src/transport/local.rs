use crate::device::{DeviceMem, Stream};
use crate::error::{CollexError, Result};
use crate::transport::{Direction, Link};
use crate::types::{DataType, Rank, ReduceOp};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

enum Frame {
    Data(Vec<u8>),
    Ready,
}

/// One direction of a plane: `src` to `dst`.
type ChannelKey = (String, Rank, Rank);

struct Channel {
    tx: mpsc::UnboundedSender<Frame>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>>,
}

/// In-process interconnect shared by every rank of a test or single-host job.
///
/// Channels are created lazily by whichever side connects first, so ranks
/// can build their sub-communicators in any order. A plane is named by a
/// string key; the same pair of ranks on two planes never shares a channel.
#[derive(Default)]
pub struct LocalFabric {
    channels: Mutex<HashMap<ChannelKey, Channel>>,
    issued: Mutex<HashMap<Rank, u64>>,
}

impl std::fmt::Debug for LocalFabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let channels = self.channels.lock().map(|c| c.len()).unwrap_or_default();
        f.debug_struct("LocalFabric")
            .field("channels", &channels)
            .finish()
    }
}

impl LocalFabric {
    pub fn new() -> Self {
        Self::default()
    }

    fn channel_ends(
        &self,
        key: ChannelKey,
    ) -> Result<(
        mpsc::UnboundedSender<Frame>,
        Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>>,
    )> {
        let mut channels = self
            .channels
            .lock()
            .map_err(|_| CollexError::LockPoisoned("fabric channels"))?;
        let ch = channels.entry(key).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            Channel {
                tx,
                rx: Arc::new(tokio::sync::Mutex::new(rx)),
            }
        });
        Ok((ch.tx.clone(), Arc::clone(&ch.rx)))
    }

    /// Open `local`'s end of the link to `remote` on `plane`.
    pub fn connect(
        self: &Arc<Self>,
        plane: &str,
        local: Rank,
        remote: Rank,
        timeout: Duration,
    ) -> Result<Arc<dyn Link>> {
        if local == remote {
            return Err(CollexError::internal(format!(
                "plane {plane}: rank {local} cannot link to itself"
            )));
        }
        let (tx, _) = self.channel_ends((plane.to_string(), local, remote))?;
        let (_, rx) = self.channel_ends((plane.to_string(), remote, local))?;
        tracing::trace!(plane, local, remote, "fabric: link opened");
        Ok(Arc::new(LocalLink {
            plane: Arc::from(plane),
            local,
            remote,
            tx,
            rx,
            timeout,
            fabric: Arc::clone(self),
        }))
    }

    /// Transfers (sends and receives) `rank` has enqueued so far.
    pub fn transfers_issued(&self, rank: Rank) -> u64 {
        self.issued
            .lock()
            .map(|m| m.get(&rank).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn count_issue(&self, rank: Rank) -> Result<()> {
        let mut issued = self
            .issued
            .lock()
            .map_err(|_| CollexError::LockPoisoned("fabric counters"))?;
        *issued.entry(rank).or_insert(0) += 1;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Expect {
    Data,
    Ready,
}

struct LocalLink {
    plane: Arc<str>,
    local: Rank,
    remote: Rank,
    tx: mpsc::UnboundedSender<Frame>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>>,
    timeout: Duration,
    fabric: Arc<LocalFabric>,
}

impl std::fmt::Debug for LocalLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalLink")
            .field("plane", &self.plane)
            .field("local", &self.local)
            .field("remote", &self.remote)
            .finish()
    }
}

/// Receive the next frame on a link within `timeout`.
async fn recv_frame(
    rx: &tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>,
    timeout: Duration,
    plane: &str,
    remote: Rank,
    expect: Expect,
) -> Result<Option<Vec<u8>>> {
    let mut guard = rx.lock().await;
    let frame = match tokio::time::timeout(timeout, guard.recv()).await {
        Ok(Some(frame)) => frame,
        Ok(None) => {
            return Err(CollexError::transport(format!(
                "plane {plane}: channel from rank {remote} closed"
            )));
        }
        Err(_) => {
            return Err(CollexError::transport(format!(
                "plane {plane}: receive from rank {remote} timed out after {}ms",
                timeout.as_millis()
            )));
        }
    };
    match (frame, expect) {
        (Frame::Data(d), Expect::Data) => Ok(Some(d)),
        (Frame::Ready, Expect::Ready) => Ok(None),
        (Frame::Data(_), Expect::Ready) => Err(CollexError::transport(format!(
            "plane {plane}: expected ready signal from rank {remote}, got data"
        ))),
        (Frame::Ready, Expect::Data) => Err(CollexError::transport(format!(
            "plane {plane}: expected data from rank {remote}, got ready signal"
        ))),
    }
}

impl LocalLink {
    fn hung_up(&self) -> CollexError {
        CollexError::transport(format!(
            "plane {}: rank {} hung up",
            self.plane, self.remote
        ))
    }

    fn enqueue_recv<F>(&self, stream: &Stream, label: &'static str, expect: Expect, apply: F) -> Result<()>
    where
        F: FnOnce(Option<Vec<u8>>) -> Result<()> + Send + 'static,
    {
        self.fabric.count_issue(self.local)?;
        let rx = Arc::clone(&self.rx);
        let plane = Arc::clone(&self.plane);
        let (remote, timeout) = (self.remote, self.timeout);
        stream.enqueue(label, async move {
            let payload = recv_frame(&rx, timeout, &plane, remote, expect).await?;
            apply(payload)
        })
    }
}

impl Link for LocalLink {
    fn local_rank(&self) -> Rank {
        self.local
    }

    fn remote_rank(&self) -> Rank {
        self.remote
    }

    fn transfer_async(&self, dir: Direction, mem: &DeviceMem, stream: &Stream) -> Result<()> {
        let mem = mem.clone();
        match dir {
            Direction::Tx => {
                self.fabric.count_issue(self.local)?;
                let tx = self.tx.clone();
                let err = self.hung_up();
                stream.enqueue("link_tx", async move {
                    let data = mem.read()?;
                    tx.send(Frame::Data(data)).map_err(|_| err)
                })
            }
            Direction::Rx => self.enqueue_recv(stream, "link_rx", Expect::Data, move |payload| {
                let data = payload.unwrap_or_default();
                if data.len() != mem.size() {
                    return Err(CollexError::BufferSizeMismatch {
                        expected: mem.size() as u64,
                        actual: data.len() as u64,
                    });
                }
                mem.write(&data)
            }),
        }
    }

    fn transfer_with_reduce(
        &self,
        mem: &DeviceMem,
        dtype: DataType,
        op: ReduceOp,
        stream: &Stream,
    ) -> Result<()> {
        let mem = mem.clone();
        self.enqueue_recv(stream, "link_rx_reduce", Expect::Data, move |payload| {
            let data = payload.unwrap_or_default();
            mem.reduce_with(&data, dtype, op)
        })
    }

    fn signal_data_ready(&self, stream: &Stream) -> Result<()> {
        let tx = self.tx.clone();
        let err = self.hung_up();
        stream.enqueue("link_ready", async move { tx.send(Frame::Ready).map_err(|_| err) })
    }

    fn wait_data_ready(&self, stream: &Stream) -> Result<()> {
        self.enqueue_recv(stream, "link_wait_ready", Expect::Ready, |_| Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_recv_between_two_ranks() {
        let fabric = Arc::new(LocalFabric::new());
        let t = Duration::from_secs(5);
        let a = fabric.connect("p", 0, 1, t).unwrap();
        let b = fabric.connect("p", 1, 0, t).unwrap();
        let sa = Stream::new(0).unwrap();
        let sb = Stream::new(1).unwrap();

        let src = DeviceMem::from_vec(vec![1, 2, 3, 4]);
        let dst = DeviceMem::alloc(4);
        b.transfer_async(Direction::Rx, &dst, &sb).unwrap();
        a.transfer_async(Direction::Tx, &src, &sa).unwrap();
        sa.synchronize().await.unwrap();
        sb.synchronize().await.unwrap();
        assert_eq!(dst.read().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(fabric.transfers_issued(0), 1);
        assert_eq!(fabric.transfers_issued(1), 1);
    }

    #[tokio::test]
    async fn test_planes_are_isolated() {
        let fabric = Arc::new(LocalFabric::new());
        let t = Duration::from_millis(50);
        let a = fabric.connect("p0", 0, 1, t).unwrap();
        let b = fabric.connect("p1", 1, 0, t).unwrap();
        let sa = Stream::new(0).unwrap();
        let sb = Stream::new(1).unwrap();
        a.transfer_async(Direction::Tx, &DeviceMem::alloc(4), &sa)
            .unwrap();
        b.transfer_async(Direction::Rx, &DeviceMem::alloc(4), &sb)
            .unwrap();
        sa.synchronize().await.unwrap();
        let err = sb.synchronize().await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_ready_signal_then_data() {
        let fabric = Arc::new(LocalFabric::new());
        let t = Duration::from_secs(5);
        let a = fabric.connect("p", 0, 1, t).unwrap();
        let b = fabric.connect("p", 1, 0, t).unwrap();
        let sa = Stream::new(0).unwrap();
        let sb = Stream::new(1).unwrap();

        let dst = DeviceMem::alloc(2);
        b.signal_data_ready(&sb).unwrap();
        b.transfer_async(Direction::Rx, &dst, &sb).unwrap();
        a.wait_data_ready(&sa).unwrap();
        a.transfer_async(Direction::Tx, &DeviceMem::from_vec(vec![5, 6]), &sa)
            .unwrap();
        sa.synchronize().await.unwrap();
        sb.synchronize().await.unwrap();
        assert_eq!(dst.read().unwrap(), vec![5, 6]);
    }

    #[tokio::test]
    async fn test_size_mismatch_on_receive() {
        let fabric = Arc::new(LocalFabric::new());
        let t = Duration::from_secs(5);
        let a = fabric.connect("p", 0, 1, t).unwrap();
        let b = fabric.connect("p", 1, 0, t).unwrap();
        let sa = Stream::new(0).unwrap();
        let sb = Stream::new(1).unwrap();
        a.transfer_async(Direction::Tx, &DeviceMem::alloc(8), &sa)
            .unwrap();
        b.transfer_async(Direction::Rx, &DeviceMem::alloc(4), &sb)
            .unwrap();
        sa.synchronize().await.unwrap();
        assert!(matches!(
            sb.synchronize().await.unwrap_err(),
            CollexError::BufferSizeMismatch { expected: 4, actual: 8 }
        ));
    }

    #[test]
    fn test_self_link_rejected() {
        let fabric = Arc::new(LocalFabric::new());
        assert!(fabric.connect("p", 2, 2, Duration::from_secs(1)).is_err());
    }
}
