//! Runtime configuration shared by the engine, guard and reconciliation loop

use std::time::Duration;

use crate::retry::RetryConfig;

/// Requeue interval for a healthy template
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(300);
/// Minimum age before an unreferenced secret record is reclaimed
pub const DEFAULT_ORPHAN_GRACE_PERIOD: Duration = Duration::from_secs(60);
/// Interval between orphan sweeps
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// Attempts made to persist a template after its secrets were written
pub const DEFAULT_PERSIST_ATTEMPTS: u32 = 5;
/// Field manager for server-side apply
pub const DEFAULT_FIELD_MANAGER: &str = "nodevault";

/// Tunables for one nodevault instance
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// Requeue interval for templates that reconciled cleanly
    pub reconcile_interval: Duration,
    /// Records younger than this are never swept, so an in-flight create
    /// cannot lose its secrets before the template lands
    pub orphan_grace_period: Duration,
    /// Interval between orphan sweeps
    pub sweep_interval: Duration,
    /// Backoff policy for persisting a template after its secrets exist
    pub persist_retry: RetryConfig,
    /// Field manager used for server-side apply
    pub field_manager: String,
    /// Value of the `app.kubernetes.io/managed-by` label on secret records
    pub managed_by: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
            orphan_grace_period: DEFAULT_ORPHAN_GRACE_PERIOD,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            persist_retry: RetryConfig::with_max_attempts(DEFAULT_PERSIST_ATTEMPTS),
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
            managed_by: DEFAULT_FIELD_MANAGER.to_string(),
        }
    }
}

impl Config {
    /// Set the orphan grace period
    pub fn orphan_grace_period(mut self, grace: Duration) -> Self {
        self.orphan_grace_period = grace;
        self
    }

    /// Set the reconcile requeue interval
    pub fn reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }

    /// Set the sweep interval
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the persistence retry policy
    pub fn persist_retry(mut self, retry: RetryConfig) -> Self {
        self.persist_retry = retry;
        self
    }
}
