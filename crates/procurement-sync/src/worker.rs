// SPDX-License-Identifier: MIT OR Apache-2.0
//! The cooperative worker loop (C6): composes the lease manager, fetcher,
//! and retry policy with a pluggable terminal step (bulk-flush or
//! handler-dispatch).
//!
//! The two worker flavors differ only in payload shape and terminal step;
//! this module encodes the shared loop once and parameterizes the terminal
//! step with a [`ReconcileStrategy`] rather than modeling mode A/B as a
//! type hierarchy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use procurement_queue::{PoolQueue, PriorityQueue};
use tracing::warn;

use crate::bulk::BulkReconciler;
use crate::dispatch::HandlerDispatcher;
use crate::error::StoreError;
use crate::fetch::Fetcher;
use crate::handlers::HandlerRegistry;
use crate::lease::{ClientInfoTable, ClientLeaseManager, PooledClient};
use crate::model::{DispatchQueueItem, ResourceDocument};
use crate::retry::RetryPolicy;
use crate::store::Store;

/// A queued payload that can yield the resource id a fetch is performed
/// against.
pub trait QueuePayload: Clone + Send + 'static {
    /// The resource id to fetch.
    fn rid(&self) -> &str;
}

impl QueuePayload for String {
    fn rid(&self) -> &str {
        self
    }
}

impl QueuePayload for DispatchQueueItem {
    fn rid(&self) -> &str {
        &self.id
    }
}

/// The terminal step a worker applies to a successfully fetched document.
///
/// `prepare` is the mode A local-document lookup; mode B's default no-op
/// implementation skips the store entirely. `on_public_item` consumes the
/// fetched document. `on_shutdown_flush` runs once when the worker observes
/// shutdown, giving mode A a chance to flush its buffer regardless of size
/// or time thresholds.
#[async_trait]
pub trait ReconcileStrategy<Item: QueuePayload>: Send {
    /// Read a prior local copy of `rid`, if this strategy needs one.
    async fn prepare(&mut self, rid: &str) -> Result<Option<ResourceDocument>, StoreError> {
        let _ = rid;
        Ok(None)
    }

    /// Apply the terminal step to one fetched document.
    async fn on_public_item(
        &mut self,
        local: Option<ResourceDocument>,
        public: ResourceDocument,
        priority: i64,
        item: Item,
        retry_queue: &PriorityQueue<Item>,
    );

    /// Run after every successfully dispatched item, before the next loop
    /// iteration (mode A uses this to check `flush_if_due`).
    async fn after_item(&mut self, retry_queue: &PriorityQueue<Item>) {
        let _ = retry_queue;
    }

    /// Run exactly once when shutdown is observed.
    async fn on_shutdown(&mut self, retry_queue: &PriorityQueue<Item>) {
        let _ = retry_queue;
    }
}

/// Mode A terminal step: merge into the bulk buffer and flush when due.
pub struct BulkStrategy<S: Store> {
    reconciler: BulkReconciler<S>,
}

impl<S: Store> BulkStrategy<S> {
    /// Wrap an already-configured [`BulkReconciler`].
    pub fn new(reconciler: BulkReconciler<S>) -> Self {
        Self { reconciler }
    }
}

#[async_trait]
impl<S: Store + Send + Sync> ReconcileStrategy<String> for BulkStrategy<S> {
    async fn prepare(&mut self, rid: &str) -> Result<Option<ResourceDocument>, StoreError> {
        self.reconciler.store().get_doc(rid).await
    }

    async fn on_public_item(
        &mut self,
        local: Option<ResourceDocument>,
        public: ResourceDocument,
        priority: i64,
        _item: String,
        _retry_queue: &PriorityQueue<String>,
    ) {
        self.reconciler.add(local.as_ref(), public, priority);
    }

    async fn after_item(&mut self, retry_queue: &PriorityQueue<String>) {
        self.reconciler
            .flush_if_due(false, retry_queue, |id| id)
            .await;
    }

    async fn on_shutdown(&mut self, retry_queue: &PriorityQueue<String>) {
        self.reconciler.flush(retry_queue, |id| id).await;
    }
}

/// Mode B terminal step: dispatch to a registered [`crate::handlers::ResourceHandler`].
pub struct DispatchStrategy {
    dispatcher: HandlerDispatcher,
}

impl DispatchStrategy {
    /// Build a strategy wrapping a dispatcher and its registry.
    pub fn new(registry: HandlerRegistry, retry: RetryPolicy) -> Self {
        Self {
            dispatcher: HandlerDispatcher::new(registry, retry),
        }
    }
}

#[async_trait]
impl ReconcileStrategy<DispatchQueueItem> for DispatchStrategy {
    async fn on_public_item(
        &mut self,
        _local: Option<ResourceDocument>,
        public: ResourceDocument,
        priority: i64,
        item: DispatchQueueItem,
        retry_queue: &PriorityQueue<DispatchQueueItem>,
    ) {
        self.dispatcher.dispatch(&public, priority, item, retry_queue).await;
    }
}

/// Composes the lease manager, fetcher, retry policy, and a
/// [`ReconcileStrategy`] into one cooperative task.
pub struct Worker<Item: QueuePayload, Strategy: ReconcileStrategy<Item>> {
    leases: ClientLeaseManager,
    fetcher: Arc<Fetcher>,
    retry: RetryPolicy,
    ready_queue: PriorityQueue<Item>,
    retry_queue: PriorityQueue<Item>,
    strategy: Strategy,
    worker_sleep: Duration,
    queue_timeout: Duration,
    shutdown: Arc<AtomicBool>,
}

impl<Item: QueuePayload, Strategy: ReconcileStrategy<Item>> Worker<Item, Strategy> {
    /// Build one worker instance. `shutdown` is shared across every worker
    /// spawned by the same supervisor.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        leases: ClientLeaseManager,
        fetcher: Arc<Fetcher>,
        retry: RetryPolicy,
        ready_queue: PriorityQueue<Item>,
        retry_queue: PriorityQueue<Item>,
        strategy: Strategy,
        worker_sleep: Duration,
        queue_timeout: Duration,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            leases,
            fetcher,
            retry,
            ready_queue,
            retry_queue,
            strategy,
            worker_sleep,
            queue_timeout,
            shutdown,
        }
    }

    /// Run the loop until shutdown is observed. A shutdown check happens at
    /// the top of every iteration; an in-flight iteration always drains.
    pub async fn run(&mut self) {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                self.strategy.on_shutdown(&self.retry_queue).await;
                return;
            }
            self.run_one().await;
        }
    }

    /// Drive exactly one loop iteration: acquire a lease, pop one queued
    /// item, fetch, and apply the terminal step. Does not check shutdown.
    ///
    /// Exposed as a public single-step entry point for tests and tools that
    /// want deterministic control over how many items a worker processes,
    /// rather than racing [`Self::run`] against a shutdown flag.
    pub async fn run_one(&mut self) {
        let Some(client) = self.leases.acquire().await else {
            tokio::time::sleep(self.worker_sleep).await;
            return;
        };

        let Some((priority, item)) = self.ready_queue.try_pop(self.queue_timeout).await else {
            self.leases.release(client, Duration::ZERO);
            tokio::time::sleep(self.worker_sleep).await;
            return;
        };

        self.process_one(client, priority, item).await;
    }

    async fn process_one(&mut self, client: PooledClient, priority: i64, item: Item) {
        let rid = item.rid().to_string();

        let local = match self.strategy.prepare(&rid).await {
            Ok(local) => local,
            Err(error) => {
                warn!(
                    target: "procurement_sync.worker",
                    message_id = "exceptions",
                    %rid,
                    %error,
                    "local store read failed, returning lease and retrying"
                );
                self.leases.release(client, Duration::ZERO);
                self.retry
                    .enqueue_retry(&self.retry_queue, item, priority, 0)
                    .await;
                return;
            }
        };

        let Some(raw) = self
            .fetcher
            .fetch(client, &rid, priority, item.clone(), &self.retry_queue)
            .await
        else {
            return;
        };

        let Some(public) = ResourceDocument::from_value(raw) else {
            warn!(
                target: "procurement_sync.worker",
                message_id = "exceptions",
                %rid,
                "upstream document missing id/dateModified, retrying"
            );
            self.retry
                .enqueue_retry(&self.retry_queue, item, priority, 0)
                .await;
            return;
        };

        self.strategy
            .on_public_item(local, public, priority, item, &self.retry_queue)
            .await;
        self.strategy.after_item(&self.retry_queue).await;
    }
}

/// Build a pre-populated client pool from a list of transports, one lease
/// per transport, identified by `client_ids[i]`.
pub async fn seed_pool(
    pool: &PoolQueue<PooledClient>,
    clients: Vec<(String, Arc<dyn crate::transport::ApiTransport>)>,
) {
    for (id, transport) in clients {
        let client = PooledClient {
            lease: crate::model::ClientLease::new(id),
            transport,
        };
        let _ = pool.push(client).await;
    }
}

/// Build the shared per-client info table, pool, lease manager, retry
/// policy, and fetcher that both worker flavors are constructed from.
pub fn shared_components(
    pool: PoolQueue<PooledClient>,
    queue_timeout: Duration,
    retries_count: i64,
    retry_default_timeout: Duration,
    client_inc_step_timeout: f64,
    client_dec_step_timeout: f64,
    drop_threshold_client_cookies: f64,
) -> (ClientLeaseManager, RetryPolicy, Arc<Fetcher>) {
    let info = ClientInfoTable::new();
    let leases = ClientLeaseManager::new(pool, info, queue_timeout);
    let retry = RetryPolicy::new(retries_count, retry_default_timeout);
    let fetcher = Arc::new(Fetcher::new(
        leases.clone(),
        retry.clone(),
        client_inc_step_timeout,
        client_dec_step_timeout,
        drop_threshold_client_cookies,
    ));
    (leases, retry, fetcher)
}
