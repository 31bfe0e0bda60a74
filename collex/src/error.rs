use crate::resource::CommLevel;
use crate::types::{DataType, Rank};

pub type Result<T> = std::result::Result<T, CollexError>;

#[derive(Debug, thiserror::Error)]
pub enum CollexError {
    #[error("invalid parameter: {reason}")]
    Param { reason: String },

    #[error("invalid rank {rank}: rank size is {rank_size}")]
    InvalidRank { rank: Rank, rank_size: u32 },

    #[error("buffer size mismatch: expected {expected} bytes, got {actual}")]
    BufferSizeMismatch { expected: u64, actual: u64 },

    #[error("unsupported data type: {dtype} for operation {op}")]
    UnsupportedDType { dtype: DataType, op: &'static str },

    #[error("internal error: {reason}")]
    Internal { reason: String },

    #[error("invalid executor state transition: {from} -> {to}")]
    InvalidState {
        from: &'static str,
        to: &'static str,
    },

    #[error("{level} needs {expected} sub-communicators, only {actual} negotiated")]
    ResourceUnavailable {
        level: CommLevel,
        expected: usize,
        actual: usize,
    },

    #[error("tag {tag}: operation diverged across ranks (recorded {expected}, issued {actual})")]
    Divergence {
        tag: String,
        expected: String,
        actual: String,
    },

    #[error("transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("device error: {message}")]
    Device {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("executor {name} is not registered")]
    ExecutorNotFound { name: String },

    #[error("executor {name} is already registered")]
    DuplicateExecutor { name: String },

    #[error("tag {tag}: ring {ring} on stream {stream} failed: {source}")]
    RingFailed {
        tag: String,
        ring: usize,
        stream: usize,
        #[source]
        source: Box<CollexError>,
    },

    #[error("tag {tag}: {operation} failed: {source}")]
    OpFailed {
        tag: String,
        operation: &'static str,
        #[source]
        source: Box<CollexError>,
    },

    #[error("internal lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl CollexError {
    /// Create a `Param` error.
    pub fn param(reason: impl Into<String>) -> Self {
        Self::Param {
            reason: reason.into(),
        }
    }

    /// Create an `Internal` error.
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Create a `Transport` error with just a message.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Transport` error with a message and a source error.
    pub fn transport_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a `Device` error with just a message.
    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device {
            message: msg.into(),
            source: None,
        }
    }

    /// Wrap a ring failure with the tag, ring index and stream index it ran on.
    pub fn ring_failed(tag: &str, ring: usize, stream: usize, source: CollexError) -> Self {
        Self::RingFailed {
            tag: tag.to_string(),
            ring,
            stream,
            source: Box::new(source),
        }
    }

    /// Wrap a failed operation with its tag.
    pub fn op_failed(tag: &str, operation: &'static str, source: CollexError) -> Self {
        Self::OpFailed {
            tag: tag.to_string(),
            operation,
            source: Box::new(source),
        }
    }

    /// Innermost error, looking through `RingFailed` and `OpFailed` wrappers.
    pub fn root(&self) -> &CollexError {
        match self {
            Self::RingFailed { source, .. } | Self::OpFailed { source, .. } => source.root(),
            other => other,
        }
    }

    /// True for cross-rank divergence, wherever it sits in the wrapper chain.
    pub fn is_divergence(&self) -> bool {
        matches!(self.root(), Self::Divergence { .. })
    }
}
