// SPDX-License-Identifier: MIT OR Apache-2.0
//! Mode A terminal step: coalesce fetched documents into a per-worker
//! buffer and periodically flush them to the store.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use chrono_tz::Tz;
use procurement_queue::PriorityQueue;
use tracing::{info, warn};

use crate::error::{BulkWriteOutcome, StoreError, STALE_WRITE_REASON};
use crate::model::ResourceDocument;
use crate::retry::RetryPolicy;
use crate::store::Store;

/// Per-worker accumulator of documents awaiting a bulk write, plus the
/// lowest priority observed for each pending id.
///
/// Unshared: every field here is only ever touched by the worker that owns
/// this reconciler.
pub struct BulkReconciler<S: Store> {
    store: S,
    retry: RetryPolicy,
    doc_type: String,
    bulk_save_limit: usize,
    bulk_save_interval: Duration,
    tz: Tz,
    buffer: BTreeMap<String, ResourceDocument>,
    priority_cache: BTreeMap<String, i64>,
    window_start: Instant,
}

impl<S: Store> BulkReconciler<S> {
    /// Build a reconciler writing to `store`, stamping `doc_type` (the
    /// singular, title-cased resource kind) onto every document it buffers.
    pub fn new(
        store: S,
        retry: RetryPolicy,
        doc_type: impl Into<String>,
        bulk_save_limit: usize,
        bulk_save_interval: Duration,
        tz: Tz,
    ) -> Self {
        Self {
            store,
            retry,
            doc_type: doc_type.into(),
            bulk_save_limit,
            bulk_save_interval,
            tz,
            buffer: BTreeMap::new(),
            priority_cache: BTreeMap::new(),
            window_start: Instant::now(),
        }
    }

    /// The store this reconciler writes to, exposed so a worker's mode A
    /// strategy can also perform the `get_doc` local-copy lookup.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Number of documents currently buffered.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// `true` if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// `dateModified` of the currently buffered document for `id`, if any.
    pub fn buffered_date_modified(&self, id: &str) -> Option<&str> {
        self.buffer.get(id).and_then(ResourceDocument::date_modified)
    }

    /// The cached lowest priority seen for `id`, if it is currently buffered.
    pub fn cached_priority(&self, id: &str) -> Option<i64> {
        self.priority_cache.get(id).copied()
    }

    /// Merge one fetched document into the buffer, deduplicating by
    /// `dateModified` and tracking the lowest priority seen for its id.
    ///
    /// `local` carries forward any `_`-prefixed service keys (store revision
    /// and similar) so the write doesn't clobber store-managed metadata. A
    /// buffered copy with an equal-or-newer `dateModified` than the
    /// incoming one wins and the incoming copy is discarded — even though a
    /// worker's own `local` could in principle be newer still than `public`;
    /// this core does not guard against that because the store's write path
    /// independently rejects stale writes (see [`Self::flush`]).
    pub fn add(&mut self, local: Option<&ResourceDocument>, mut public: ResourceDocument, priority: i64) {
        let id = match public.id() {
            Some(id) => id.to_string(),
            None => return,
        };

        public.set("doc_type", self.doc_type.clone());
        public.set("_id", id.clone());
        if let Some(local) = local {
            public.adopt_service_keys_from(local);
        }

        match self.buffer.get(&id) {
            None => {
                self.priority_cache.insert(id.clone(), priority);
                self.buffer.insert(id, public);
            }
            Some(existing) if existing.is_at_least_as_fresh_as(&public) => {
                // buffer already holds an at-least-as-fresh copy; discard.
            }
            Some(_) => {
                let cached = self.priority_cache.entry(id.clone()).or_insert(priority);
                if priority < *cached {
                    *cached = priority;
                }
                self.buffer.insert(id, public);
            }
        }
    }

    /// `true` if the buffer should flush: size threshold, time threshold, or
    /// caller-forced (shutdown).
    pub fn is_due(&self, force: bool) -> bool {
        force
            || self.buffer.len() >= self.bulk_save_limit
            || self.window_start.elapsed() >= self.bulk_save_interval
    }

    /// Flush if [`Self::is_due`], otherwise a no-op.
    pub async fn flush_if_due<T: Send + 'static>(
        &mut self,
        force: bool,
        retry_queue: &PriorityQueue<T>,
        to_retry_item: impl Fn(String) -> T,
    ) {
        if self.is_due(force) {
            self.flush(retry_queue, to_retry_item).await;
        }
    }

    /// Write the buffer to the store, classify every per-document outcome,
    /// and clear state for the next window regardless of outcome.
    pub async fn flush<T: Send + 'static>(
        &mut self,
        retry_queue: &PriorityQueue<T>,
        to_retry_item: impl Fn(String) -> T,
    ) {
        if self.buffer.is_empty() {
            self.window_start = Instant::now();
            return;
        }

        let batch = std::mem::take(&mut self.buffer);
        let priorities = std::mem::take(&mut self.priority_cache);
        let batch_len = batch.len();
        self.log_timeshifts(&batch);

        let start = Instant::now();
        let result = self.store.save_bulk(batch).await;
        let duration = start.elapsed();

        match result {
            Ok(outcomes) => {
                info!(
                    target: "procurement_sync.bulk",
                    message_id = "save_documents",
                    save_bulk_len = batch_len,
                    save_bulk_duration_ms = duration.as_millis() as u64,
                    "flushed bulk batch"
                );
                for outcome in outcomes {
                    self.classify_outcome(outcome, &priorities, retry_queue, &to_retry_item)
                        .await;
                }
            }
            Err(StoreError::BulkFailed(source)) | Err(StoreError::ReadFailed { source, .. }) => {
                warn!(
                    target: "procurement_sync.bulk",
                    message_id = "exceptions",
                    error = %source,
                    save_bulk_len = batch_len,
                    "bulk write failed, re-enqueuing whole batch"
                );
                for (id, priority) in priorities {
                    self.retry
                        .enqueue_retry(retry_queue, to_retry_item(id), priority, 0)
                        .await;
                }
            }
        }

        self.window_start = Instant::now();
    }

    async fn classify_outcome<T: Send + 'static>(
        &self,
        outcome: BulkWriteOutcome,
        priorities: &BTreeMap<String, i64>,
        retry_queue: &PriorityQueue<T>,
        to_retry_item: &impl Fn(String) -> T,
    ) {
        match outcome {
            BulkWriteOutcome::Created { id, .. } => {
                info!(target: "procurement_sync.bulk", message_id = "save_documents", %id, "new document saved");
            }
            BulkWriteOutcome::Updated { id, .. } => {
                info!(target: "procurement_sync.bulk", message_id = "update_documents", %id, "document updated");
            }
            BulkWriteOutcome::StaleWriteIgnored { id } => {
                info!(
                    target: "procurement_sync.bulk",
                    message_id = "skipped",
                    %id,
                    reason = STALE_WRITE_REASON,
                    "stale write lost race, store already held a fresher copy"
                );
            }
            BulkWriteOutcome::Rejected { id, reason } => {
                warn!(target: "procurement_sync.bulk", message_id = "not_found_docs", %id, %reason, "per-document write rejected, retrying");
                let priority = priorities.get(&id).copied().unwrap_or(0);
                self.retry
                    .enqueue_retry(retry_queue, to_retry_item(id), priority, 0)
                    .await;
            }
        }
    }

    fn log_timeshifts(&self, batch: &BTreeMap<String, ResourceDocument>) {
        let now = Utc::now().with_timezone(&self.tz);
        for (id, doc) in batch {
            let Some(date_modified) = doc.date_modified() else {
                continue;
            };
            let Ok(modified) = chrono::DateTime::parse_from_rfc3339(date_modified) else {
                continue;
            };
            let timeshift = now.signed_duration_since(modified.with_timezone(&self.tz));
            tracing::debug!(
                target: "procurement_sync.bulk",
                message_id = "add_to_save_bulk",
                %id,
                document_timeshift_secs = timeshift.num_seconds(),
                "document queued for bulk write"
            );
        }
    }
}
