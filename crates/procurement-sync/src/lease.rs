// SPDX-License-Identifier: MIT OR Apache-2.0
//! Client lease acquisition and release, with cookie-refresh and adaptive
//! per-client throttle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use procurement_queue::PoolQueue;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::model::{ClientInfo, ClientLease};
use crate::transport::ApiTransport;

/// A leasable client: its identity plus the transport it carries.
pub struct PooledClient {
    /// Lease bookkeeping (throttle state, id).
    pub lease: ClientLease,
    /// The transport this lease grants exclusive access to.
    pub transport: Arc<dyn ApiTransport>,
}

/// Process-wide per-client state, shared across all workers.
#[derive(Clone, Default)]
pub struct ClientInfoTable {
    inner: Arc<Mutex<HashMap<String, ClientInfo>>>,
}

impl ClientInfoTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` against the entry for `client_id`, creating a default entry
    /// if none exists yet.
    pub async fn with_entry<R>(&self, client_id: &str, f: impl FnOnce(&mut ClientInfo) -> R) -> R {
        let mut table = self.inner.lock().await;
        let entry = table.entry(client_id.to_string()).or_default();
        f(entry)
    }

    /// Set the `drop_cookies` flag for a client, creating its entry if
    /// needed. May be called by an external controller concurrently with a
    /// lease holder's own mutations.
    pub async fn request_cookie_drop(&self, client_id: &str) {
        self.with_entry(client_id, |info| info.drop_cookies = true)
            .await;
    }
}

/// Checks out and returns API clients, applying the adaptive per-client
/// throttle and cookie-refresh protocol on acquire.
#[derive(Clone)]
pub struct ClientLeaseManager {
    pool: PoolQueue<PooledClient>,
    info: ClientInfoTable,
    queue_timeout: Duration,
}

impl ClientLeaseManager {
    /// Build a manager over an already-populated client pool.
    pub fn new(pool: PoolQueue<PooledClient>, info: ClientInfoTable, queue_timeout: Duration) -> Self {
        Self {
            pool,
            info,
            queue_timeout,
        }
    }

    /// Check out one client, applying cookie refresh and adaptive throttle.
    ///
    /// Returns `None` if the pool is empty, the pop times out, or a
    /// required cookie renewal fails (in the last case the client is
    /// returned to the pool first).
    pub async fn acquire(&self) -> Option<PooledClient> {
        if self.pool.is_empty().await {
            return None;
        }

        let mut client = self.pool.try_pop(self.queue_timeout).await?;

        let needs_drop = self
            .info
            .with_entry(&client.lease.id, |info| info.drop_cookies)
            .await;

        if needs_drop {
            match client.transport.renew_cookies().await {
                Ok(()) => {
                    self.info
                        .with_entry(&client.lease.id, |info| info.reset())
                        .await;
                    client.lease.request_interval = 0.0;
                    client.lease.not_actual_count = 0;
                    debug!(target: "procurement_sync.lease", client_id = %client.lease.id, "cookies renewed");
                }
                Err(error) => {
                    warn!(
                        target: "procurement_sync.lease",
                        client_id = %client.lease.id,
                        %error,
                        "cookie renewal failed, returning client to pool"
                    );
                    let _ = self.pool.push(client).await;
                    return None;
                }
            }
        }

        if client.lease.request_interval > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(client.lease.request_interval)).await;
        }

        debug!(
            target: "procurement_sync.lease",
            message_id = "get_client",
            client_id = %client.lease.id,
            request_interval = client.lease.request_interval,
            "leased client"
        );

        Some(client)
    }

    /// Return a client to the pool, optionally delaying its reappearance by
    /// `delay` (used after a rate-limited fetch).
    pub fn release(&self, client: PooledClient, delay: Duration) {
        debug!(
            target: "procurement_sync.lease",
            message_id = "put_client",
            client_id = %client.lease.id,
            delay_ms = delay.as_millis() as u64,
            "returning client to pool"
        );
        if delay.is_zero() {
            self.pool.release_after(client, Duration::ZERO);
        } else {
            self.pool.release_after(client, delay);
        }
    }

    /// Access to the shared per-client info table, for components (the
    /// fetcher) that need to record durations or read throttle state.
    pub fn info_table(&self) -> &ClientInfoTable {
        &self.info
    }
}
