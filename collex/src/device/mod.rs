//! Host-side model of the accelerator runtime: ordered streams, cross-stream
//! notifies and aliasable device memory.

pub mod mem;
pub mod notify;
pub mod stream;
pub mod trace;

pub use mem::{DeviceMem, copy_async, reduce_async};
pub use notify::Notify;
pub use stream::{RingContext, Stream};
pub use trace::{StreamTrace, TraceEvent, TraceKind};
