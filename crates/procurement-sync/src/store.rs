// SPDX-License-Identifier: MIT OR Apache-2.0
//! The local database capability consumed by the bulk reconciler (mode A).

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::error::{BulkWriteOutcome, StoreError};
use crate::model::ResourceDocument;

/// The local datastore written to by the bulk reconciler.
///
/// The store owns its own conflict detection: a `save_bulk` call may accept,
/// update, or reject each document independently, and a rejection whose
/// reason is [`crate::error::STALE_WRITE_REASON`] means the store already
/// held an at-least-as-fresh copy.
#[async_trait]
pub trait Store: Send + Sync {
    /// Fetch the locally stored copy of `rid`, if any.
    async fn get_doc(&self, rid: &str) -> Result<Option<ResourceDocument>, StoreError>;

    /// Write a batch of documents, keyed by id, returning one outcome per
    /// document (not necessarily in the same order as the input map).
    async fn save_bulk(
        &self,
        docs: BTreeMap<String, ResourceDocument>,
    ) -> Result<Vec<BulkWriteOutcome>, StoreError>;
}
