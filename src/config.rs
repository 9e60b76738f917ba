//! Centralized configuration for the peek relay.
//!
//! The relay only consumes plain numbers: how many bytes to inspect and how
//! large each remainder read may be. Everything else tunes the transport
//! around it.

use std::time::Duration;
use tracing::warn;

use crate::error::{RelayError, RelayResult};

/// Upper bound on `inspect_threshold`. Each request allocates a prefix
/// buffer of `threshold + 1` bytes.
pub const MAX_INSPECT_THRESHOLD: usize = 16 * 1024 * 1024;

/// Runtime configuration for the relay.
///
/// All parameters can be overridden via `PEEKRELAY_*` environment variables.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    // ─────────────────────────────────────────────────────────────────────────
    // Inspection
    // ─────────────────────────────────────────────────────────────────────────
    /// Largest body, in bytes, that is handed to the logging collaborator.
    /// The prefix read asks for `inspect_threshold + 1` bytes.
    pub inspect_threshold: usize,

    /// Upper bound for each remainder read in the splice strategy.
    pub remainder_chunk_size: usize,

    /// Treat a missing or non-numeric upstream content-length as `0`
    /// instead of rejecting the response.
    pub missing_length_as_zero: bool,

    // ─────────────────────────────────────────────────────────────────────────
    // Transport
    // ─────────────────────────────────────────────────────────────────────────
    /// Per-chunk read timeout on the upstream body
    pub stream_read_timeout: Duration,

    /// Total upstream body timeout (prevents slow-drip upstreams)
    pub stream_total_timeout: Duration,

    /// Enable TCP_NODELAY on both legs
    pub tcp_nodelay: bool,

    /// TCP keepalive interval in seconds for accepted connections
    pub tcp_keepalive_secs: u64,

    /// Maximum number of idle upstream connections kept per host.
    pub pool_max_idle_per_host: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            inspect_threshold: 10 * 1024,       // 10 KB
            remainder_chunk_size: 1024 * 1024, // 1 MB
            missing_length_as_zero: false,

            stream_read_timeout: Duration::from_secs(300),
            stream_total_timeout: Duration::from_secs(3600),
            tcp_nodelay: true,
            tcp_keepalive_secs: 60,
            pool_max_idle_per_host: 32,
        }
    }
}

impl RelayConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// # Environment Variables
    ///
    /// - `PEEKRELAY_INSPECT_THRESHOLD` (default: 10240)
    /// - `PEEKRELAY_REMAINDER_CHUNK_SIZE` (default: 1048576)
    /// - `PEEKRELAY_MISSING_LENGTH_AS_ZERO` (default: false)
    /// - `PEEKRELAY_STREAM_READ_TIMEOUT_SECS` (default: 300)
    /// - `PEEKRELAY_STREAM_TOTAL_TIMEOUT_SECS` (default: 3600)
    /// - `PEEKRELAY_TCP_NODELAY` (default: true)
    /// - `PEEKRELAY_TCP_KEEPALIVE_SECS` (default: 60)
    /// - `PEEKRELAY_POOL_MAX_IDLE` (default: 32)
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            inspect_threshold: parse_env_warn(
                "PEEKRELAY_INSPECT_THRESHOLD",
                default.inspect_threshold,
            ),

            remainder_chunk_size: parse_env_warn(
                "PEEKRELAY_REMAINDER_CHUNK_SIZE",
                default.remainder_chunk_size,
            ),

            missing_length_as_zero: parse_env_warn(
                "PEEKRELAY_MISSING_LENGTH_AS_ZERO",
                default.missing_length_as_zero,
            ),

            stream_read_timeout: Duration::from_secs(parse_env_warn(
                "PEEKRELAY_STREAM_READ_TIMEOUT_SECS",
                default.stream_read_timeout.as_secs(),
            )),

            stream_total_timeout: Duration::from_secs(parse_env_warn(
                "PEEKRELAY_STREAM_TOTAL_TIMEOUT_SECS",
                default.stream_total_timeout.as_secs(),
            )),

            tcp_nodelay: parse_env_warn("PEEKRELAY_TCP_NODELAY", default.tcp_nodelay),

            tcp_keepalive_secs: parse_env_warn(
                "PEEKRELAY_TCP_KEEPALIVE_SECS",
                default.tcp_keepalive_secs,
            ),

            pool_max_idle_per_host: parse_env_warn(
                "PEEKRELAY_POOL_MAX_IDLE",
                default.pool_max_idle_per_host,
            ),
        }
    }

    /// Reject values the relay cannot operate with.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::InvalidConfig` when the remainder chunk size is
    /// zero, the threshold exceeds [`MAX_INSPECT_THRESHOLD`], or a stream
    /// timeout is zero.
    pub fn validate(&self) -> RelayResult<()> {
        if self.remainder_chunk_size == 0 {
            return Err(RelayError::InvalidConfig(
                "remainder_chunk_size must be greater than zero".to_string(),
            ));
        }
        if self.inspect_threshold > MAX_INSPECT_THRESHOLD {
            return Err(RelayError::InvalidConfig(format!(
                "inspect_threshold must be at most {MAX_INSPECT_THRESHOLD} bytes, got {}",
                self.inspect_threshold
            )));
        }
        if self.stream_read_timeout.is_zero() || self.stream_total_timeout.is_zero() {
            return Err(RelayError::InvalidConfig(
                "stream timeouts must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Number of bytes the prefix read must gather before classification.
    pub fn prefix_read_size(&self) -> usize {
        self.inspect_threshold.saturating_add(1)
    }
}

/// Parse an environment variable with a warning on invalid values.
///
/// If the env var is set but cannot be parsed, logs a warning and returns the default.
/// If the env var is not set, returns the default silently.
fn parse_env_warn<T: std::str::FromStr + std::fmt::Display>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(val) => match val.parse::<T>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!(
                    env_var = name,
                    value = %val,
                    default = %default,
                    "Invalid value for environment variable, using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}
