//! Configuration for the mirror engine.
//!
//! This module defines all configuration types needed to run the mux
//! socket, the resilient connection, and the replication coordinator.
//! Configuration is constructed programmatically or deserialized from
//! YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use mirror_engine::config::MirrorConfig;
//!
//! let config = MirrorConfig {
//!     ..Default::default()
//! };
//! assert_eq!(config.resilience.failure_timeout_ms, 60_000);
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! MirrorConfig
//! ├── socket: SocketConfig           # mux dispatch behavior
//! ├── resilience: ResilienceConfig   # stall detection + reconnect backoff
//! └── coordinator: CoordinatorConfig # table mirroring
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The top-level config object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MirrorConfig {
    #[serde(default)]
    pub socket: SocketConfig,
    #[serde(default)]
    pub resilience: ResilienceConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
}

impl MirrorConfig {
    /// Fast-timer config for tests.
    pub fn for_testing() -> Self {
        Self {
            socket: SocketConfig::default(),
            resilience: ResilienceConfig::for_testing(),
            coordinator: CoordinatorConfig::for_testing(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SocketConfig: mux dispatch behavior
// ═══════════════════════════════════════════════════════════════════════════════

/// Mux socket dispatch options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketConfig {
    /// Answer data frames for unknown stream ids with a reset frame
    /// instead of dropping them silently.
    ///
    /// Silent dropping is the default: the peer may legitimately race a
    /// frame against our close. Resetting gives faster feedback when
    /// debugging a misbehaving server.
    #[serde(default)]
    pub reset_unknown_streams: bool,
}

#[allow(clippy::derivable_impls)]
impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            reset_unknown_streams: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ResilienceConfig: stall detection and reconnect backoff
// ═══════════════════════════════════════════════════════════════════════════════

/// Stall detection and reconnect behavior for the resilient connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// How long to wait for expected data before declaring a silent stall
    /// and reconnecting (ms).
    #[serde(default = "default_failure_timeout_ms")]
    pub failure_timeout_ms: u64,

    /// Base delay before a reconnect attempt (ms).
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Uniform random jitter added to the base delay (ms). Spreads
    /// reconnect storms across clients.
    #[serde(default = "default_backoff_jitter_ms")]
    pub backoff_jitter_ms: u64,
}

fn default_failure_timeout_ms() -> u64 {
    60_000 // 60 seconds
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_jitter_ms() -> u64 {
    1_000
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            failure_timeout_ms: default_failure_timeout_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_jitter_ms: default_backoff_jitter_ms(),
        }
    }
}

impl ResilienceConfig {
    /// Fast-fail timers for tests.
    pub fn for_testing() -> Self {
        Self {
            failure_timeout_ms: 100,
            backoff_base_ms: 10,
            backoff_jitter_ms: 20,
        }
    }

    /// Expected-data deadline.
    pub fn failure_timeout(&self) -> Duration {
        Duration::from_millis(self.failure_timeout_ms)
    }

    /// Inclusive bounds of the reconnect delay.
    pub fn backoff_bounds(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_base_ms + self.backoff_jitter_ms),
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CoordinatorConfig: table mirroring
// ═══════════════════════════════════════════════════════════════════════════════

/// Replication coordinator options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// How long shutdown waits for tail tasks to drain (ms).
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

fn default_drain_timeout_ms() -> u64 {
    10_000 // 10 seconds
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

impl CoordinatorConfig {
    /// Fast drain for tests.
    pub fn for_testing() -> Self {
        Self {
            drain_timeout_ms: 500,
        }
    }

    /// Shutdown drain deadline.
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}
