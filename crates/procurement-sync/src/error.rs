// SPDX-License-Identifier: MIT OR Apache-2.0
//! Error taxonomy for upstream fetches and store operations.

use thiserror::Error;

/// Outcome of a single upstream `get_resource_item` call, classified into
/// the buckets the fetcher and retry policy branch on.
#[derive(Debug, Error)]
pub enum FetchError {
    /// HTTP 410 Gone — the resource is archived and must never be retried.
    #[error("resource gone (archived)")]
    ResourceGone,

    /// The upstream response could not be parsed as a valid document.
    #[error("invalid response from upstream: {0}")]
    InvalidResponse(String),

    /// The upstream request failed with an HTTP status code.
    #[error("request failed with status {status}")]
    RequestFailed {
        /// HTTP status code returned by upstream, `0` if none was received.
        status: u16,
    },

    /// HTTP 404 — observed in practice as a symptom of a stale session
    /// rather than a genuinely missing resource; the caller clears client
    /// cookies and retries rather than dropping the item.
    #[error("resource not found upstream")]
    ResourceNotFound,

    /// Any other transport-level failure (connection reset, timeout, …).
    #[error("unexpected transport error: {0}")]
    Other(#[source] anyhow::Error),
}

impl FetchError {
    /// HTTP status code carried by this error, if any.
    pub fn status_code(&self) -> u16 {
        match self {
            FetchError::ResourceGone => 410,
            FetchError::ResourceNotFound => 404,
            FetchError::RequestFailed { status } => *status,
            FetchError::InvalidResponse(_) | FetchError::Other(_) => 0,
        }
    }
}

/// Errors from the local store (mode A).
#[derive(Debug, Error)]
pub enum StoreError {
    /// The document could not be read.
    #[error("failed to read document {id}: {source}")]
    ReadFailed {
        /// Resource item identifier.
        id: String,
        /// Underlying cause.
        #[source]
        source: anyhow::Error,
    },

    /// The bulk write call itself failed (not a per-document rejection).
    #[error("bulk write failed: {0}")]
    BulkFailed(#[source] anyhow::Error),
}

/// Outcome of a single document within a `save_bulk` call.
#[derive(Debug, Clone)]
pub enum BulkWriteOutcome {
    /// The document was newly created; `revision` starts with `"1-"`.
    Created {
        /// Document id.
        id: String,
        /// Store-assigned revision.
        revision: String,
    },
    /// An existing document was updated.
    Updated {
        /// Document id.
        id: String,
        /// Store-assigned revision.
        revision: String,
    },
    /// The write lost a race against a fresher write already in the store.
    /// Terminal-ignore: the store already holds an at-least-as-fresh copy.
    StaleWriteIgnored {
        /// Document id.
        id: String,
    },
    /// The write failed for a reason other than staleness; retryable.
    Rejected {
        /// Document id.
        id: String,
        /// Store-reported rejection reason.
        reason: String,
    },
}

impl BulkWriteOutcome {
    /// The document id this outcome refers to.
    pub fn id(&self) -> &str {
        match self {
            BulkWriteOutcome::Created { id, .. }
            | BulkWriteOutcome::Updated { id, .. }
            | BulkWriteOutcome::StaleWriteIgnored { id }
            | BulkWriteOutcome::Rejected { id, .. } => id,
        }
    }
}

/// Marker string the store uses for the one terminal-ignore rejection reason:
/// a write that lost a race against a fresher `dateModified`.
pub const STALE_WRITE_REASON: &str = "New doc with oldest dateModified.";
