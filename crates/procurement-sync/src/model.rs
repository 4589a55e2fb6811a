// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shared data model: resource documents, queue payloads, and per-client
//! rate-limiting state.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Priorities `>= RETRY_PRIORITY_BASE` encode a retry attempt; the item's
/// retry count is `priority - RETRY_PRIORITY_BASE`.
pub const RETRY_PRIORITY_BASE: i64 = 1000;

/// Number of retries already spent, given a queue priority.
pub fn retries_from_priority(priority: i64) -> i64 {
    if priority >= RETRY_PRIORITY_BASE {
        priority - RETRY_PRIORITY_BASE
    } else {
        priority
    }
}

/// Opaque resource item identifier (RID).
pub type ResourceId = String;

/// A resource document: `id` and `dateModified` are guaranteed present,
/// every other upstream field is preserved opaquely.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct ResourceDocument(pub Map<String, Value>);

impl ResourceDocument {
    /// Wrap a raw JSON object, failing if required fields are missing.
    pub fn from_value(value: Value) -> Option<Self> {
        let map = value.as_object()?.clone();
        let doc = ResourceDocument(map);
        if doc.id().is_some() && doc.date_modified().is_some() {
            Some(doc)
        } else {
            None
        }
    }

    /// The document's `id` field.
    pub fn id(&self) -> Option<&str> {
        self.0.get("id").and_then(Value::as_str)
    }

    /// The document's `dateModified` field, as the raw ISO-8601 string.
    ///
    /// Ordering compares these strings directly — RFC 3339 / ISO 8601
    /// timestamps with a fixed-width, zero-padded format sort lexically in
    /// the same order as chronologically, so no parsing is needed to decide
    /// which of two documents is newer.
    pub fn date_modified(&self) -> Option<&str> {
        self.0.get("dateModified").and_then(Value::as_str)
    }

    /// `true` if `other` is at least as new as `self` (non-strict).
    pub fn is_at_least_as_fresh_as(&self, other: &ResourceDocument) -> bool {
        self.date_modified() >= other.date_modified()
    }

    /// Set a field to an arbitrary JSON value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Get a field as a string, if present and a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Copy every "service" key (starting with `_`, e.g. `_rev`) from
    /// `local` into `self`. Store-level metadata like the revision must
    /// survive the public-document overwrite.
    pub fn adopt_service_keys_from(&mut self, local: &ResourceDocument) {
        for (k, v) in local.0.iter() {
            if k.starts_with('_') {
                self.0.insert(k.clone(), v.clone());
            }
        }
    }
}

/// Payload queued for mode A (bulk reconcile): a bare resource id.
pub type BulkQueueItem = ResourceId;

/// Payload queued for mode B (handler dispatch): the partial record carrying
/// at least `id` and `procurementMethodType`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DispatchQueueItem {
    /// Resource item identifier.
    pub id: ResourceId,
    /// Routing key into the handler registry.
    #[serde(rename = "procurementMethodType")]
    pub procurement_method_type: String,
}

/// A leased API client: exclusive per-worker access to one transport plus
/// its adaptive throttle state.
#[derive(Debug, Clone)]
pub struct ClientLease {
    /// Opaque client identifier, stable across leases.
    pub id: String,
    /// Current per-client throttle, in seconds. Mutated only by the worker
    /// currently holding this lease.
    pub request_interval: f64,
    /// Initialized on cookie refresh; not otherwise bounded or consulted by
    /// this core, kept purely for interface fidelity with the wider client
    /// state a future controller might want to inspect.
    pub not_actual_count: u32,
}

impl ClientLease {
    /// Create a fresh lease for a client id with no accumulated throttle.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            request_interval: 0.0,
            not_actual_count: 0,
        }
    }
}

/// Process-wide, per-client state. Mutated only by the lease holder, except
/// `drop_cookies` which may be set by an external controller.
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    /// Set by a controller to force a cookie renewal on next `acquire`.
    pub drop_cookies: bool,
    /// Recent request durations, keyed by a monotonically increasing tick;
    /// bounded to [`MAX_DURATION_SAMPLES`] entries (oldest dropped first) so
    /// a long-lived process cannot grow this map without bound.
    pub request_durations: BTreeMap<u64, f64>,
    /// Throttle value recorded at last successful fetch.
    pub request_interval: f64,
    /// Mean of `request_durations`.
    pub avg_duration: f64,
}

/// Cap on [`ClientInfo::request_durations`] entries retained per client.
pub const MAX_DURATION_SAMPLES: usize = 64;

impl ClientInfo {
    /// Reset to the post-cookie-renewal state.
    pub fn reset(&mut self) {
        *self = ClientInfo::default();
    }

    /// Record one fetch duration and recompute `avg_duration`.
    pub fn record_duration(&mut self, tick: u64, elapsed_secs: f64, request_interval: f64) {
        self.request_durations.insert(tick, elapsed_secs);
        while self.request_durations.len() > MAX_DURATION_SAMPLES {
            if let Some(&oldest) = self.request_durations.keys().next() {
                self.request_durations.remove(&oldest);
            } else {
                break;
            }
        }
        self.request_interval = request_interval;
        let sum: f64 = self.request_durations.values().sum();
        self.avg_duration = sum / self.request_durations.len() as f64;
    }
}
