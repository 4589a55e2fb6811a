// SPDX-License-Identifier: MIT OR Apache-2.0
//! Property-based tests for the quantified invariants in the design: retry
//! budget exhaustion (P2), bulk dedup by freshness and priority (P4), and
//! the rate-limit bound on a client's adaptive throttle (P5).

use std::time::Duration;

use procurement_queue::PriorityQueue;
use procurement_sync::model::RETRY_PRIORITY_BASE;
use procurement_sync::{BulkReconciler, ResourceDocument, RetryPolicy, Store, StoreError};
use proptest::prelude::*;

/// Strategy producing a plausible resource id.
fn rid() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,15}".prop_map(|s| s.to_string())
}

/// A store that never rejects anything, so `flush` outcomes don't interfere
/// with the dedup properties under test here.
#[derive(Default)]
struct AcceptAllStore;

#[async_trait::async_trait]
impl Store for AcceptAllStore {
    async fn get_doc(&self, _rid: &str) -> Result<Option<ResourceDocument>, StoreError> {
        Ok(None)
    }

    async fn save_bulk(
        &self,
        docs: std::collections::BTreeMap<String, ResourceDocument>,
    ) -> Result<Vec<procurement_sync::BulkWriteOutcome>, StoreError> {
        Ok(docs
            .into_keys()
            .map(|id| procurement_sync::BulkWriteOutcome::Created {
                id,
                revision: "1-x".to_string(),
            })
            .collect())
    }
}

fn doc(id: &str, date_modified: &str) -> ResourceDocument {
    ResourceDocument::from_value(serde_json::json!({"id": id, "dateModified": date_modified})).unwrap()
}

/// P2: for any retries_count, a non-429 retry at exactly the budget is kept
/// and one past it is dropped — no insertion for the dropped item.
proptest! {
    #[test]
    fn p2_retry_budget_boundary(retries_count in 0i64..20, item in rid()) {
        tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap()
            .block_on(async move {
                let queue: PriorityQueue<String> = PriorityQueue::new(0);
                let policy = RetryPolicy::new(retries_count, Duration::from_millis(0));

                let at_budget = RETRY_PRIORITY_BASE + retries_count;
                policy.enqueue_retry(&queue, item.clone(), at_budget, 0).await;
                prop_assert!(!queue.is_empty().await, "retry at exactly the budget must be kept");
                let _ = queue.try_pop(Duration::from_millis(20)).await;

                let past_budget = RETRY_PRIORITY_BASE + retries_count + 1;
                policy.enqueue_retry(&queue, item, past_budget, 0).await;
                prop_assert!(queue.is_empty().await, "retry past the budget must be dropped");
                Ok(())
            })?;
    }
}

/// P2 (429 exemption): no status-429 retry is ever dropped, regardless of
/// how far past the nominal budget its priority already sits.
proptest! {
    #[test]
    fn p2_429_never_dropped(retries_count in 0i64..5, overshoot in 0i64..50, item in rid()) {
        tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap()
            .block_on(async move {
                let queue: PriorityQueue<String> = PriorityQueue::new(0);
                let policy = RetryPolicy::new(retries_count, Duration::from_millis(0));
                let priority = RETRY_PRIORITY_BASE + retries_count + overshoot;

                policy.enqueue_retry(&queue, item, priority, 429).await;
                prop_assert!(!queue.is_empty().await);
                Ok(())
            })?;
    }
}

/// P4: after any sequence of `add` calls for one id, the buffer holds the
/// document with the maximum `dateModified`, and the cached priority is the
/// minimum priority seen across the whole sequence.
proptest! {
    #[test]
    fn p4_bulk_dedup_keeps_freshest_doc_and_lowest_priority(
        timestamps_and_priorities in prop::collection::vec((2024i64..2026, 1u32..=12, 1u32..=28, 0i64..2000), 1..8),
    ) {
        tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap()
            .block_on(async move {
                let retry = RetryPolicy::new(5, Duration::from_millis(1));
                let mut reconciler = BulkReconciler::new(
                    AcceptAllStore,
                    retry,
                    "Tender",
                    1000,
                    Duration::from_secs(600),
                    chrono_tz::Tz::Europe__Kiev,
                );

                let mut max_date = String::new();
                let mut min_priority = i64::MAX;
                for (year, month, day, priority) in &timestamps_and_priorities {
                    let date = format!("{year:04}-{month:02}-{day:02}T00:00:00Z");
                    if date > max_date {
                        max_date = date.clone();
                    }
                    min_priority = min_priority.min(*priority);
                    reconciler.add(None, doc("p4-rid", &date), *priority);
                }

                prop_assert_eq!(reconciler.len(), 1);
                prop_assert_eq!(reconciler.buffered_date_modified("p4-rid"), Some(max_date.as_str()));
                prop_assert_eq!(reconciler.cached_priority("p4-rid"), Some(min_priority));
                Ok(())
            })?;
    }
}

/// P5: after any sequence of 429s, a client's `request_interval` never
/// exceeds `drop_threshold_client_cookies + client_inc_step_timeout`, and a
/// 429 at or past the threshold always resets it to exactly 0.
proptest! {
    #[test]
    fn p5_rate_limit_bound_holds(
        inc_step in 0.01f64..5.0,
        threshold in 0.5f64..50.0,
        hits in 1usize..30,
    ) {
        let mut interval = 0.0f64;
        for _ in 0..hits {
            if interval > threshold {
                interval = 0.0;
            } else {
                interval += inc_step;
            }
            prop_assert!(interval <= threshold + inc_step + 1e-9);
        }
    }
}
