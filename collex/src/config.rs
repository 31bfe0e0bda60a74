//! Runtime-configurable options for collex.
//!
//! All values have sensible defaults. Override via environment variables
//! (prefixed `COLLEX_`) or by constructing a custom `CollexConfig`.

use std::time::Duration;

use crate::alg_type::AlgType;
use crate::error::Result;

/// Options that shape algorithm choice, buffering and timeouts.
#[derive(Debug, Clone)]
pub struct CollexConfig {
    /// Capacity of each transit (CCL) buffer in bytes.
    pub ccl_buffer_size: usize,

    /// Forbid reduction orders that depend on arrival timing.
    pub deterministic: bool,

    /// Allow reduction during transfer where the dtype/op pair supports it.
    pub inline_reduce: bool,

    /// Run RDMA and SDMA rings side by side on double-ring topologies.
    pub rdma_sdma_concurrent: bool,

    /// Write reduced data straight to user buffers, skipping transit copies.
    pub dma_reduce: bool,

    /// Per-NPU bandwidth used by the cost model, in GB/s.
    pub bandwidth_gbps: f64,

    /// RDMA-lite path available (lowers the pipeline threshold).
    pub rdma_lite: bool,

    /// AIV kernels in use (disables the all-reduce pipeline).
    pub aiv_mode: bool,

    /// Timeout for one link receive.
    pub link_timeout: Duration,

    /// Timeout for one notify wait on a stream.
    pub notify_wait_timeout: Duration,

    /// Record stream events for inspection.
    pub trace_streams: bool,

    /// Forced algorithm type; `None` lets the selector decide.
    pub algo: Option<AlgType>,
}

impl Default for CollexConfig {
    fn default() -> Self {
        Self {
            ccl_buffer_size: 200 * 1024 * 1024, // 200 MiB
            deterministic: false,
            inline_reduce: true,
            rdma_sdma_concurrent: false,
            dma_reduce: false,
            bandwidth_gbps: 12.5,
            rdma_lite: true,
            aiv_mode: false,
            link_timeout: Duration::from_secs(30),
            notify_wait_timeout: Duration::from_secs(30),
            trace_streams: false,
            algo: None,
        }
    }
}

impl CollexConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `COLLEX_BUFFSIZE_MB`
    /// - `COLLEX_DETERMINISTIC`
    /// - `COLLEX_INLINE_REDUCE`
    /// - `COLLEX_CONCURRENT_ENABLE`
    /// - `COLLEX_DMA_REDUCE`
    /// - `COLLEX_BANDWIDTH_GBPS`
    /// - `COLLEX_RDMA_LITE`
    /// - `COLLEX_AIV_MODE`
    /// - `COLLEX_LINK_TIMEOUT_SECS`
    /// - `COLLEX_NOTIFY_TIMEOUT_SECS`
    /// - `COLLEX_TRACE_STREAMS`
    /// - `COLLEX_ALGO` (`level0:level1:level2`)
    ///
    /// Unparseable values are ignored, except `COLLEX_ALGO`: an unsupported
    /// algorithm is a configuration error.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("COLLEX_BUFFSIZE_MB") {
            if let Ok(mb) = v.parse::<usize>() {
                cfg.ccl_buffer_size = mb * 1024 * 1024;
            }
        }
        if let Some(b) = env_flag("COLLEX_DETERMINISTIC") {
            cfg.deterministic = b;
        }
        if let Some(b) = env_flag("COLLEX_INLINE_REDUCE") {
            cfg.inline_reduce = b;
        }
        if let Some(b) = env_flag("COLLEX_CONCURRENT_ENABLE") {
            cfg.rdma_sdma_concurrent = b;
        }
        if let Some(b) = env_flag("COLLEX_DMA_REDUCE") {
            cfg.dma_reduce = b;
        }
        if let Ok(v) = std::env::var("COLLEX_BANDWIDTH_GBPS") {
            if let Ok(g) = v.parse::<f64>() {
                cfg.bandwidth_gbps = g;
            }
        }
        if let Some(b) = env_flag("COLLEX_RDMA_LITE") {
            cfg.rdma_lite = b;
        }
        if let Some(b) = env_flag("COLLEX_AIV_MODE") {
            cfg.aiv_mode = b;
        }
        if let Ok(v) = std::env::var("COLLEX_LINK_TIMEOUT_SECS") {
            if let Ok(s) = v.parse::<u64>() {
                cfg.link_timeout = Duration::from_secs(s);
            }
        }
        if let Ok(v) = std::env::var("COLLEX_NOTIFY_TIMEOUT_SECS") {
            if let Ok(s) = v.parse::<u64>() {
                cfg.notify_wait_timeout = Duration::from_secs(s);
            }
        }
        if let Some(b) = env_flag("COLLEX_TRACE_STREAMS") {
            cfg.trace_streams = b;
        }
        if let Ok(v) = std::env::var("COLLEX_ALGO") {
            cfg.algo = Some(AlgType::parse(&v)?);
        }

        Ok(cfg)
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let v = std::env::var(name).ok()?;
    match v.trim() {
        "1" | "true" | "TRUE" | "on" => Some(true),
        "0" | "false" | "FALSE" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = CollexConfig::default();
        assert_eq!(cfg.ccl_buffer_size, 200 * 1024 * 1024);
        assert!(cfg.inline_reduce);
        assert!(!cfg.deterministic);
        assert!(cfg.algo.is_none());
        assert_eq!(cfg.link_timeout, Duration::from_secs(30));
    }
}
