//! Rate limited work queue feeding the reconcile workers
//!
//! Two independent pieces are composed here:
//! - [`WorkQueue`]: deduplication and blocking hand-out of keys
//! - [`RateLimiter`]: how long a failing key waits before it is retried

pub mod rate_limiter;
pub mod work_queue;

pub use rate_limiter::{
    BucketRateLimiter, ItemExponentialFailureRateLimiter, MaxOfRateLimiter, RateLimiter,
};
pub use work_queue::WorkQueue;

use crate::config::QueueConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Work queue with retry bookkeeping
pub struct RateLimitingQueue {
    queue: Arc<WorkQueue>,
    limiter: Box<dyn RateLimiter>,
}

impl RateLimitingQueue {
    pub fn new(limiter: Box<dyn RateLimiter>) -> Self {
        Self {
            queue: Arc::new(WorkQueue::new()),
            limiter,
        }
    }

    /// Exponential per-key backoff combined with a global token bucket
    pub fn with_config(config: &QueueConfig) -> Self {
        Self::new(Box::new(MaxOfRateLimiter::new(vec![
            Box::new(ItemExponentialFailureRateLimiter::new(
                config.backoff_base,
                config.backoff_max,
            )),
            Box::new(BucketRateLimiter::new(config.bucket_qps, config.bucket_burst)),
        ])))
    }

    pub fn add(&self, key: &str) {
        self.queue.add(key);
    }

    /// Add `key` once `delay` has passed
    pub fn add_after(&self, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.queue.add(key);
            return;
        }
        if self.queue.is_shutting_down() {
            return;
        }

        let queue = self.queue.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Re-add `key` after the delay the rate limiter assigns to it
    pub fn add_with_backoff(&self, key: &str) {
        let delay = self.limiter.when(key);
        trace!(key, ?delay, "requeueing with backoff");
        self.add_after(key, delay);
    }

    /// Clear the retry history of `key`
    pub fn forget(&self, key: &str) {
        self.limiter.forget(key);
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
        self.limiter.num_requeues(key)
    }

    pub async fn get(&self) -> Option<String> {
        self.queue.get().await
    }

    pub fn done(&self, key: &str) {
        self.queue.done(key);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn shut_down(&self) {
        self.queue.shut_down();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.queue.is_shutting_down()
    }
}
