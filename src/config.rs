// Node configuration
//
// Serde-backed option structs with defaults for every tunable the node
// exposes. The server binary loads these from a JSON file; tests construct
// them directly.

use crate::error::{AccessError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Which condition triggers a buffer flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlushStrategyKind {
    /// Flush when the total buffered event count reaches `size_limit`.
    SizeLimited,
    /// Flush on a periodic timer.
    Looping,
    /// Flush on whichever of the two fires first.
    Hybrid,
    /// Flush only when explicitly requested. Test-only.
    Manual,
}

/// Temporal event buffer tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    pub strategy: FlushStrategyKind,
    /// Size trigger for `SizeLimited` and `Hybrid`.
    pub size_limit: usize,
    /// Timer trigger in milliseconds for `Looping` and `Hybrid`.
    pub flush_interval_ms: u64,
    /// Consecutive flush failures tolerated before the trip switch fires.
    pub flush_failure_limit: u32,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            strategy: FlushStrategyKind::Hybrid,
            size_limit: 10_000,
            flush_interval_ms: 60_000,
            flush_failure_limit: 3,
        }
    }
}

impl BufferConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// Client-side RPC retry policy. Applies to transient transport errors only.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    pub retry_count: u32,
    pub retry_interval_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_count: 5,
            retry_interval_ms: 1_000,
        }
    }
}

impl RetryConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

/// Event cache sizing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CacheConfig {
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { capacity: 10_000 }
    }
}

/// Error payload shaping at the server edge.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ErrorMappingConfig {
    /// Include the full error chain in wire error messages.
    pub include_inner_exceptions: bool,
    /// Collapse internal failures to `ServiceUnavailable` on the wire.
    pub override_internal_server_errors: bool,
}

impl Default for ErrorMappingConfig {
    fn default() -> Self {
        Self {
            include_inner_exceptions: false,
            override_internal_server_errors: true,
        }
    }
}

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Address the node protocol listens on.
    pub listen_addr: String,
    /// Base directory for file-backed storage instances.
    pub data_dir: String,
    pub buffer: BufferConfig,
    pub retry: RetryConfig,
    pub cache: CacheConfig,
    pub errors: ErrorMappingConfig,
    /// Maintain reverse mapping indexes on reader stores.
    pub store_bidirectional_mappings: bool,
    /// Reader refresh loop period in milliseconds.
    pub refresh_interval_ms: u64,
    /// Consecutive refresh failures tolerated before the trip switch fires.
    pub refresh_failure_limit: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:5170".to_string(),
            data_dir: "./data".to_string(),
            buffer: BufferConfig::default(),
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
            errors: ErrorMappingConfig::default(),
            store_bidirectional_mappings: true,
            refresh_interval_ms: 5_000,
            refresh_failure_limit: 3,
        }
    }
}

impl NodeConfig {
    /// Load configuration from a JSON file. Missing fields fall back to
    /// defaults; a missing file is a configuration error.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            AccessError::Configuration(format!(
                "cannot read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;
        serde_json::from_str(&raw)
            .map_err(|e| AccessError::Configuration(format!("invalid config file: {}", e)))
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.buffer.size_limit, 10_000);
        assert_eq!(config.retry.retry_count, 5);
        assert_eq!(config.cache.capacity, 10_000);
        assert!(config.store_bidirectional_mappings);
        assert!(config.errors.override_internal_server_errors);
    }

    #[test]
    fn test_partial_file_falls_back_to_defaults() {
        let parsed: NodeConfig =
            serde_json::from_str(r#"{"buffer": {"strategy": "Manual", "size_limit": 5, "flush_interval_ms": 100, "flush_failure_limit": 1}}"#)
                .unwrap();
        assert_eq!(parsed.buffer.size_limit, 5);
        assert_eq!(parsed.buffer.strategy, FlushStrategyKind::Manual);
        // untouched sections keep their defaults
        assert_eq!(parsed.retry.retry_count, 5);
    }

    #[test]
    fn test_missing_file_is_configuration_error() {
        let err = NodeConfig::load("/nonexistent/keyplane.json").unwrap_err();
        assert!(matches!(err, AccessError::Configuration(_)));
    }
}
