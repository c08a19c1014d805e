//! Controller tuning knobs

use crate::pki::SERVICE_ACCOUNT_KEY_BITS;
use std::time::Duration;

/// Retry policy of the work queue
#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// Delay after the first failure of a key
    pub backoff_base: Duration,
    /// Upper bound for the per-key delay
    pub backoff_max: Duration,
    /// Sustained retry rate across all keys
    pub bucket_qps: f64,
    /// Retries allowed in a burst before the rate applies
    pub bucket_burst: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_secs(10),
            bucket_qps: 10.0,
            bucket_burst: 100,
        }
    }
}

/// Settings of the reconcile loop
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Number of parallel reconcile workers
    pub workers: usize,
    pub queue: QueueConfig,
    /// Size of generated service account signing keys
    pub service_account_key_bits: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            queue: QueueConfig::default(),
            service_account_key_bits: SERVICE_ACCOUNT_KEY_BITS,
        }
    }
}
