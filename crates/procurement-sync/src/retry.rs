// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bounded retry with per-attempt backoff for items falling out of a fetch.

use std::time::Duration;

use procurement_queue::PriorityQueue;
use tracing::{debug, warn};

use crate::model::RETRY_PRIORITY_BASE;

/// HTTP status recorded for a rate-limited fetch; retries caused by this
/// status never consume the retry budget.
pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;

/// Decides whether to retry, re-prioritize, delay, or drop a queued item.
#[derive(Clone)]
pub struct RetryPolicy {
    retries_count: i64,
    retry_default_timeout: Duration,
}

impl RetryPolicy {
    /// Build a policy allowing up to `retries_count` non-429 retries, with
    /// `retry_default_timeout` as the per-retry backoff multiplier.
    pub fn new(retries_count: i64, retry_default_timeout: Duration) -> Self {
        Self {
            retries_count,
            retry_default_timeout,
        }
    }

    /// Attempt to requeue `item` at `priority`, honoring the retry budget.
    ///
    /// `status_code` is the upstream HTTP status that caused the retry, or
    /// `0` if the failure wasn't an HTTP error. A `429` never counts against
    /// the budget and carries no backoff sleep.
    pub async fn enqueue_retry<T: Send + 'static>(
        &self,
        queue: &PriorityQueue<T>,
        item: T,
        priority: i64,
        status_code: u16,
    ) {
        let retries = priority_to_retries(priority);

        if retries > self.retries_count && status_code != STATUS_TOO_MANY_REQUESTS {
            warn!(
                target: "procurement_sync.retry",
                message_id = "dropped_documents",
                retries,
                retries_count = self.retries_count,
                "retry budget exhausted, dropping item"
            );
            return;
        }

        if status_code == STATUS_TOO_MANY_REQUESTS {
            debug!(
                target: "procurement_sync.retry",
                message_id = "add_to_retry",
                priority,
                "rate-limited retry, no backoff or budget consumption"
            );
            let _ = queue.push(priority, item).await;
            return;
        }

        let delay = self.retry_default_timeout.mul_f64(retries.max(0) as f64);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let bumped = priority + 1;
        debug!(
            target: "procurement_sync.retry",
            message_id = "add_to_retry",
            priority = bumped,
            delay_ms = delay.as_millis() as u64,
            "retrying with backoff"
        );
        let _ = queue.push(bumped, item).await;
    }
}

/// Retries already spent for a queue priority (priorities `>= 1000` encode
/// retry attempts as `priority - 1000`).
fn priority_to_retries(priority: i64) -> i64 {
    if priority >= RETRY_PRIORITY_BASE {
        priority - RETRY_PRIORITY_BASE
    } else {
        priority
    }
}
