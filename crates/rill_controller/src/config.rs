//! Configuration for the controller's background managers.

use std::time::Duration;

/// Bounded retry policy for transient metadata-store failures.
#[derive(Clone, Copy, Debug)]
pub struct RetryConfig {
    /// First backoff delay; doubled per attempt up to `max`.
    pub base: Duration,
    /// Upper bound on a single backoff delay.
    pub max: Duration,
    /// Total attempts before surfacing the failure to the caller.
    pub attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(20),
            max: Duration::from_secs(1),
            attempts: 5,
        }
    }
}

/// Configuration for the background transaction lease sweep.
#[derive(Clone, Copy, Debug)]
pub struct TxnSweepConfig {
    /// Scan interval for expired open transactions.
    pub interval: Duration,
}

impl Default for TxnSweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
        }
    }
}

/// Configuration for the scale workflow progression loop.
#[derive(Clone, Copy, Debug)]
pub struct ScaleEngineConfig {
    /// Reconcile interval; also bounds how quickly a drained seal barrier
    /// is noticed.
    pub interval: Duration,
}

impl Default for ScaleEngineConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
        }
    }
}

/// Configuration for the failover recovery coordinator.
#[derive(Clone, Copy, Debug)]
pub struct RecoveryConfig {
    /// Scan interval for orphaned workflows and stuck transactions.
    pub interval: Duration,
    /// Adopt a non-terminal workflow whose owner has neither progressed
    /// nor heartbeat within this window. Stale fencing tokens are adopted
    /// immediately regardless of this timeout.
    pub takeover_timeout: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            takeover_timeout: Duration::from_secs(10),
        }
    }
}

/// Top-level controller configuration.
#[derive(Clone, Copy, Debug, Default)]
pub struct ControllerConfig {
    pub txn_sweep: TxnSweepConfig,
    pub scale: ScaleEngineConfig,
    pub recovery: RecoveryConfig,
    pub store_retry: RetryConfig,
}
