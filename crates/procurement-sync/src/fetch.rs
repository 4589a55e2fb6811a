// SPDX-License-Identifier: MIT OR Apache-2.0
//! Performs one upstream fetch, classifies the outcome, and updates the
//! client's adaptive throttle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use procurement_queue::PriorityQueue;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::FetchError;
use crate::lease::{ClientLeaseManager, PooledClient};
use crate::retry::RetryPolicy;

/// Performs fetches against a leased client, applying the 429 throttle
/// adjustment and routing retryable failures back through [`RetryPolicy`].
pub struct Fetcher {
    leases: ClientLeaseManager,
    retry: RetryPolicy,
    client_inc_step_timeout: f64,
    client_dec_step_timeout: f64,
    drop_threshold_client_cookies: f64,
    tick: AtomicU64,
}

impl Fetcher {
    /// Build a fetcher over a lease manager and retry policy, with the
    /// configured throttle step sizes.
    pub fn new(
        leases: ClientLeaseManager,
        retry: RetryPolicy,
        client_inc_step_timeout: f64,
        client_dec_step_timeout: f64,
        drop_threshold_client_cookies: f64,
    ) -> Self {
        Self {
            leases,
            retry,
            client_inc_step_timeout,
            client_dec_step_timeout,
            drop_threshold_client_cookies,
            tick: AtomicU64::new(0),
        }
    }

    /// Fetch `rid` using `client`, which is consumed: every path releases
    /// the lease exactly once, and every retryable path enqueues exactly
    /// one retry onto `retry_queue`.
    pub async fn fetch<T: Send + 'static>(
        &self,
        mut client: PooledClient,
        rid: &str,
        priority: i64,
        retry_item: T,
        retry_queue: &PriorityQueue<T>,
    ) -> Option<Value> {
        let start = Instant::now();
        match client.transport.get_resource_item(rid).await {
            Ok(document) => {
                self.record_success(&mut client, start.elapsed()).await;
                self.leases.release(client, Duration::ZERO);
                Some(document)
            }
            Err(error) => {
                self.handle_error(client, error, priority, retry_item, retry_queue)
                    .await;
                None
            }
        }
    }

    async fn record_success(&self, client: &mut PooledClient, elapsed: Duration) {
        let tick = self.tick.fetch_add(1, Ordering::Relaxed);
        let request_interval = client.lease.request_interval;
        self.leases
            .info_table()
            .with_entry(&client.lease.id, |info| {
                info.record_duration(tick, elapsed.as_secs_f64(), request_interval);
            })
            .await;

        debug!(
            target: "procurement_sync.fetch",
            client_id = %client.lease.id,
            requests_timeout = elapsed.as_secs_f64(),
            "fetch completed"
        );

        if client.lease.request_interval > 0.0 {
            client.lease.request_interval =
                (client.lease.request_interval - self.client_dec_step_timeout).max(0.0);
        }
    }

    async fn handle_error<T: Send + 'static>(
        &self,
        mut client: PooledClient,
        error: FetchError,
        priority: i64,
        retry_item: T,
        retry_queue: &PriorityQueue<T>,
    ) {
        let client_id = client.lease.id.clone();
        match error {
            FetchError::ResourceGone => {
                debug!(
                    target: "procurement_sync.fetch",
                    client_id = %client_id,
                    "resource archived, treating as terminal success"
                );
                self.leases.release(client, Duration::ZERO);
            }
            FetchError::RequestFailed { status } if status == crate::retry::STATUS_TOO_MANY_REQUESTS => {
                let delay = self.apply_throttle_adjustment(&mut client).await;
                warn!(
                    target: "procurement_sync.fetch",
                    client_id = %client_id,
                    delay_ms = delay.as_millis() as u64,
                    "rate limited, throttling client"
                );
                self.leases.release(client, delay);
                self.retry
                    .enqueue_retry(retry_queue, retry_item, priority, status)
                    .await;
            }
            FetchError::ResourceNotFound => {
                warn!(
                    target: "procurement_sync.fetch",
                    client_id = %client_id,
                    "resource not found, clearing session cookies and retrying"
                );
                let _ = client.transport.clear_cookies().await;
                self.leases.release(client, Duration::ZERO);
                self.retry
                    .enqueue_retry(retry_queue, retry_item, priority, 404)
                    .await;
            }
            FetchError::InvalidResponse(reason) => {
                debug!(
                    target: "procurement_sync.fetch",
                    client_id = %client_id,
                    %reason,
                    "invalid response, retrying"
                );
                self.leases.release(client, Duration::ZERO);
                self.retry
                    .enqueue_retry(retry_queue, retry_item, priority, 0)
                    .await;
            }
            FetchError::RequestFailed { status } => {
                debug!(
                    target: "procurement_sync.fetch",
                    client_id = %client_id,
                    status,
                    "request failed, retrying"
                );
                self.leases.release(client, Duration::ZERO);
                self.retry
                    .enqueue_retry(retry_queue, retry_item, priority, status)
                    .await;
            }
            FetchError::Other(source) => {
                debug!(
                    target: "procurement_sync.fetch",
                    client_id = %client_id,
                    error = %source,
                    "unexpected transport error, retrying"
                );
                self.leases.release(client, Duration::ZERO);
                self.retry
                    .enqueue_retry(retry_queue, retry_item, priority, 0)
                    .await;
            }
        }
    }

    /// Adjust `client.lease.request_interval` for a 429, clearing cookies on
    /// a hard reset if the threshold is crossed, and return the delay the
    /// caller should apply before returning the lease to the pool.
    async fn apply_throttle_adjustment(&self, client: &mut PooledClient) -> Duration {
        if client.lease.request_interval > self.drop_threshold_client_cookies {
            let _ = client.transport.clear_cookies().await;
            client.lease.request_interval = 0.0;
        } else {
            client.lease.request_interval += self.client_inc_step_timeout;
        }
        Duration::from_secs_f64(client.lease.request_interval.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::ClientInfoTable;
    use crate::model::ClientLease;
    use crate::transport::fake::{FakeTransport, Scripted};
    use procurement_queue::PoolQueue;
    use serde_json::json;
    use std::sync::Arc;

    fn fetcher(leases: ClientLeaseManager) -> Fetcher {
        Fetcher::new(leases, RetryPolicy::new(5, Duration::from_millis(1)), 1.0, 0.1, 10.0)
    }

    fn pooled(transport: FakeTransport) -> PooledClient {
        PooledClient {
            lease: ClientLease::new("c1"),
            transport: Arc::new(transport),
        }
    }

    #[tokio::test]
    async fn success_releases_lease_and_returns_document() {
        let pool: PoolQueue<PooledClient> = PoolQueue::new(0);
        let manager = ClientLeaseManager::new(pool.clone(), ClientInfoTable::new(), Duration::from_millis(10));
        let fetcher = fetcher(manager);
        let retry_queue: PriorityQueue<&'static str> = PriorityQueue::new(0);

        let client = pooled(FakeTransport::new(vec![Scripted::Ok(json!({"id": "a"}))]));
        let result = fetcher
            .fetch(client, "a", 0, "unused", &retry_queue)
            .await;

        assert!(result.is_some());
        assert_eq!(pool.len().await, 1);
        assert!(retry_queue.is_empty().await);
    }

    #[tokio::test]
    async fn resource_gone_is_terminal_no_retry() {
        let pool: PoolQueue<PooledClient> = PoolQueue::new(0);
        let manager = ClientLeaseManager::new(pool.clone(), ClientInfoTable::new(), Duration::from_millis(10));
        let fetcher = fetcher(manager);
        let retry_queue: PriorityQueue<&'static str> = PriorityQueue::new(0);

        let client = pooled(FakeTransport::new(vec![Scripted::Err(FetchError::ResourceGone)]));
        let result = fetcher
            .fetch(client, "a", 0, "unused", &retry_queue)
            .await;

        assert!(result.is_none());
        assert_eq!(pool.len().await, 1);
        assert!(retry_queue.is_empty().await);
    }

    #[tokio::test]
    async fn rate_limited_response_bumps_interval_and_retries() {
        let pool: PoolQueue<PooledClient> = PoolQueue::new(0);
        let manager = ClientLeaseManager::new(pool.clone(), ClientInfoTable::new(), Duration::from_millis(10));
        let fetcher = fetcher(manager);
        let retry_queue: PriorityQueue<&'static str> = PriorityQueue::new(0);

        let client = pooled(FakeTransport::new(vec![Scripted::Err(FetchError::RequestFailed {
            status: 429,
        })]));
        fetcher.fetch(client, "a", 5, "item", &retry_queue).await;

        let (priority, item) = retry_queue.try_pop(Duration::from_millis(50)).await.unwrap();
        assert_eq!(priority, 5);
        assert_eq!(item, "item");

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let returned = pool.try_pop(Duration::from_millis(10)).await.unwrap();
        assert_eq!(returned.lease.request_interval, 1.0);
    }

    #[tokio::test]
    async fn hard_reset_when_interval_exceeds_threshold() {
        let pool: PoolQueue<PooledClient> = PoolQueue::new(0);
        let manager = ClientLeaseManager::new(pool.clone(), ClientInfoTable::new(), Duration::from_millis(10));
        let fetcher = fetcher(manager);
        let retry_queue: PriorityQueue<&'static str> = PriorityQueue::new(0);

        let mut client = pooled(FakeTransport::new(vec![Scripted::Err(FetchError::RequestFailed {
            status: 429,
        })]));
        client.lease.request_interval = 11.0;
        fetcher.fetch(client, "a", 0, "item", &retry_queue).await;

        let returned = pool.try_pop(Duration::from_millis(10)).await.unwrap();
        assert_eq!(returned.lease.request_interval, 0.0);
    }

    #[tokio::test]
    async fn resource_not_found_clears_cookies_and_retries() {
        let pool: PoolQueue<PooledClient> = PoolQueue::new(0);
        let manager = ClientLeaseManager::new(pool.clone(), ClientInfoTable::new(), Duration::from_millis(10));
        let fetcher = fetcher(manager);
        let retry_queue: PriorityQueue<&'static str> = PriorityQueue::new(0);

        let client = pooled(FakeTransport::new(vec![Scripted::Err(FetchError::ResourceNotFound)]));
        fetcher.fetch(client, "a", 0, "item", &retry_queue).await;

        assert!(retry_queue.try_pop(Duration::from_millis(50)).await.is_some());
        assert_eq!(pool.len().await, 1);
    }
}
