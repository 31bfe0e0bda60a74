//! Point-to-point links between ranks of one sub-communicator.

pub mod local;

pub use local::LocalFabric;

use crate::device::{DeviceMem, Stream};
use crate::error::Result;
use crate::types::{DataType, Rank, ReduceOp};

/// Transfer direction relative to the local rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Tx,
    Rx,
}

/// A bidirectional connection to one remote rank.
///
/// Every method enqueues work on `stream` and returns immediately; the
/// transfer happens when the stream reaches it. Frames between a pair of
/// ranks arrive in the order they were sent.
pub trait Link: Send + Sync + std::fmt::Debug {
    fn local_rank(&self) -> Rank;

    fn remote_rank(&self) -> Rank;

    /// `Tx` sends the window's bytes; `Rx` overwrites the window with the
    /// next frame, which must be exactly the window size.
    fn transfer_async(&self, dir: Direction, mem: &DeviceMem, stream: &Stream) -> Result<()>;

    /// Receive the next frame and reduce it into `mem`.
    fn transfer_with_reduce(
        &self,
        mem: &DeviceMem,
        dtype: DataType,
        op: ReduceOp,
        stream: &Stream,
    ) -> Result<()>;

    /// Tell the remote side our buffer is ready to be written.
    fn signal_data_ready(&self, stream: &Stream) -> Result<()>;

    /// Wait for the remote side's ready signal.
    fn wait_data_ready(&self, stream: &Stream) -> Result<()>;
}
