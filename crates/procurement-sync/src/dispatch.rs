// SPDX-License-Identifier: MIT OR Apache-2.0
//! Mode B terminal step: look up a domain handler by `procurementMethodType`
//! and hand it the fetched document.

use procurement_queue::PriorityQueue;
use tracing::{error, warn};

use crate::error::FetchError;
use crate::handlers::HandlerRegistry;
use crate::model::{DispatchQueueItem, ResourceDocument};
use crate::retry::RetryPolicy;

/// Routes a fetched document to its registered [`crate::handlers::ResourceHandler`].
pub struct HandlerDispatcher {
    registry: HandlerRegistry,
    retry: RetryPolicy,
}

impl HandlerDispatcher {
    /// Build a dispatcher over a process-wide registry and the shared retry
    /// policy.
    pub fn new(registry: HandlerRegistry, retry: RetryPolicy) -> Self {
        Self { registry, retry }
    }

    /// Resolve the handler for `item.procurement_method_type` (falling back
    /// to `"common"`) and invoke it with `public`.
    ///
    /// An unroutable item (no direct or fallback handler) is a terminal
    /// drop: logged at `error`, never retried — the item carries a tag this
    /// process simply doesn't know how to handle, and retrying would loop
    /// forever.
    pub async fn dispatch(
        &self,
        public: &ResourceDocument,
        priority: i64,
        item: DispatchQueueItem,
        retry_queue: &PriorityQueue<DispatchQueueItem>,
    ) {
        let Some(handler) = self.registry.resolve(&item.procurement_method_type) else {
            error!(
                target: "procurement_sync.dispatch",
                message_id = "bridge_worker_exception",
                tender_id = %item.id,
                procurement_method_type = %item.procurement_method_type,
                "no handler registered for this type and no common fallback, dropping item"
            );
            return;
        };

        match handler.process_resource(public).await {
            Ok(()) => {}
            Err(FetchError::RequestFailed { status }) => {
                warn!(
                    target: "procurement_sync.dispatch",
                    message_id = "add_to_retry",
                    tender_id = %item.id,
                    status,
                    "handler reported a request failure, retrying"
                );
                self.retry.enqueue_retry(retry_queue, item, priority, status).await;
            }
            Err(other) => {
                warn!(
                    target: "procurement_sync.dispatch",
                    message_id = "add_to_retry",
                    tender_id = %item.id,
                    error = %other,
                    "handler raised an unexpected error, retrying"
                );
                self.retry.enqueue_retry(retry_queue, item, priority, 0).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::fake::RecordingHandler;
    use crate::handlers::COMMON_HANDLER_KEY;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    fn item(id: &str, tag: &str) -> DispatchQueueItem {
        DispatchQueueItem {
            id: id.to_string(),
            procurement_method_type: tag.to_string(),
        }
    }

    fn dispatcher(registry: HandlerRegistry) -> HandlerDispatcher {
        HandlerDispatcher::new(registry, RetryPolicy::new(3, Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn dispatches_to_direct_handler() {
        let handler = Arc::new(RecordingHandler::default());
        let mut handlers: HashMap<String, Arc<dyn crate::handlers::ResourceHandler>> = HashMap::new();
        handlers.insert("open".to_string(), handler.clone());
        let d = dispatcher(HandlerRegistry::new(handlers));
        let retry_queue: PriorityQueue<DispatchQueueItem> = PriorityQueue::new(0);

        let public = ResourceDocument::from_value(
            json!({"id": "t1", "dateModified": "2024-01-01T00:00:00Z"}),
        )
        .unwrap();
        d.dispatch(&public, 0, item("t1", "open"), &retry_queue).await;

        assert_eq!(*handler.processed.lock().await, vec!["t1".to_string()]);
        assert!(retry_queue.is_empty().await);
    }

    #[tokio::test]
    async fn falls_back_to_common_handler() {
        let handler = Arc::new(RecordingHandler::default());
        let mut handlers: HashMap<String, Arc<dyn crate::handlers::ResourceHandler>> = HashMap::new();
        handlers.insert(COMMON_HANDLER_KEY.to_string(), handler.clone());
        let d = dispatcher(HandlerRegistry::new(handlers));
        let retry_queue: PriorityQueue<DispatchQueueItem> = PriorityQueue::new(0);

        let public = ResourceDocument::from_value(
            json!({"id": "t1", "dateModified": "2024-01-01T00:00:00Z"}),
        )
        .unwrap();
        d.dispatch(&public, 0, item("t1", "unknownType"), &retry_queue).await;

        assert_eq!(*handler.processed.lock().await, vec!["t1".to_string()]);
    }

    #[tokio::test]
    async fn unroutable_item_is_dropped_without_retry() {
        let d = dispatcher(HandlerRegistry::default());
        let retry_queue: PriorityQueue<DispatchQueueItem> = PriorityQueue::new(0);

        let public = ResourceDocument::from_value(
            json!({"id": "t1", "dateModified": "2024-01-01T00:00:00Z"}),
        )
        .unwrap();
        d.dispatch(&public, 0, item("t1", "unknownType"), &retry_queue).await;

        assert!(retry_queue.is_empty().await);
    }

    #[tokio::test]
    async fn handler_failure_enqueues_retry_via_the_shared_policy() {
        let handler = Arc::new(RecordingHandler {
            should_fail: true,
            ..Default::default()
        });
        let mut handlers: HashMap<String, Arc<dyn crate::handlers::ResourceHandler>> = HashMap::new();
        handlers.insert("open".to_string(), handler);
        let d = dispatcher(HandlerRegistry::new(handlers));
        let retry_queue: PriorityQueue<DispatchQueueItem> = PriorityQueue::new(0);

        let public = ResourceDocument::from_value(
            json!({"id": "t1", "dateModified": "2024-01-01T00:00:00Z"}),
        )
        .unwrap();
        d.dispatch(&public, 4, item("t1", "open"), &retry_queue).await;

        let (priority, retried) = retry_queue.try_pop(Duration::from_millis(50)).await.unwrap();
        assert_eq!(priority, 5);
        assert_eq!(retried.id, "t1");
    }
}
