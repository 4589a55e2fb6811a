// SPDX-License-Identifier: MIT OR Apache-2.0
//! The domain-handler registry consumed by the dispatch strategy (mode B).

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::FetchError;
use crate::model::ResourceDocument;

/// Key looked up when no handler is registered for a document's own
/// `procurementMethodType`.
pub const COMMON_HANDLER_KEY: &str = "common";

/// A domain handler that knows how to process one fetched document.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    /// Process a fetched, reconciled document.
    async fn process_resource(&self, document: &ResourceDocument) -> Result<(), FetchError>;
}

/// A typed registry of named [`ResourceHandler`] implementations, keyed by
/// `procurementMethodType`.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: Arc<HashMap<String, Arc<dyn ResourceHandler>>>,
}

impl HandlerRegistry {
    /// Build a registry from a fixed set of `(tag, handler)` pairs.
    pub fn new(handlers: HashMap<String, Arc<dyn ResourceHandler>>) -> Self {
        Self {
            handlers: Arc::new(handlers),
        }
    }

    /// Look up the handler for `tag`, falling back to [`COMMON_HANDLER_KEY`]
    /// if no handler is registered under `tag` itself.
    pub fn resolve(&self, tag: &str) -> Option<Arc<dyn ResourceHandler>> {
        self.handlers
            .get(tag)
            .or_else(|| self.handlers.get(COMMON_HANDLER_KEY))
            .cloned()
    }

    /// `true` if a handler would resolve for `tag` (directly or via the
    /// common fallback).
    pub fn contains(&self, tag: &str) -> bool {
        self.resolve(tag).is_some()
    }
}
