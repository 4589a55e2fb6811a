// SPDX-License-Identifier: MIT OR Apache-2.0
//! Concurrent worker that reconciles a public procurement API into a local
//! store.
//!
//! Multiple worker tasks share three queues — ready items, retry items, and
//! an API client pool — fetch full documents from the upstream API for each
//! queued identifier, and either bulk-write reconciled documents into a
//! local store ([`bulk`], mode A) or dispatch the fetched record to a
//! registered domain handler keyed by a type tag ([`dispatch`], mode B).
//! [`worker`] composes the shared pieces (lease acquisition, fetch,
//! bounded retry) into one cooperative loop per mode.

pub mod bulk;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod fetch;
pub mod handlers;
pub mod lease;
pub mod model;
pub mod retry;
pub mod store;
pub mod transport;
pub mod worker;

pub use bulk::BulkReconciler;
pub use config::{ConfigError, WorkerConfig};
pub use dispatch::HandlerDispatcher;
pub use error::{BulkWriteOutcome, FetchError, StoreError};
pub use fetch::Fetcher;
pub use handlers::{HandlerRegistry, ResourceHandler};
pub use lease::{ClientInfoTable, ClientLeaseManager, PooledClient};
pub use model::{ClientInfo, ClientLease, DispatchQueueItem, ResourceDocument, ResourceId};
pub use retry::RetryPolicy;
pub use store::Store;
pub use transport::{ApiTransport, HttpTransport};
pub use worker::{BulkStrategy, DispatchStrategy, QueuePayload, ReconcileStrategy, Worker};
