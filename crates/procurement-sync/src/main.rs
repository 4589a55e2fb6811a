// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, ValueEnum};
use procurement_queue::{PoolQueue, PriorityQueue};
use procurement_sync::{
    BulkReconciler, BulkStrategy, ConfigError, DispatchQueueItem, DispatchStrategy,
    FetchError, HandlerRegistry, HttpTransport, PooledClient, ResourceDocument, ResourceHandler,
    Worker, WorkerConfig,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod fake_store {
    //! A process-local, non-persistent [`procurement_sync::Store`], used
    //! when no real database driver is wired in. Swap for a real driver in
    //! a deployment; the store is an external collaborator per the design.

    use super::*;
    use procurement_sync::{BulkWriteOutcome, Store, StoreError};
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub struct InMemoryStore {
        docs: Mutex<std::collections::BTreeMap<String, ResourceDocument>>,
    }

    #[async_trait]
    impl Store for InMemoryStore {
        async fn get_doc(&self, rid: &str) -> Result<Option<ResourceDocument>, StoreError> {
            Ok(self.docs.lock().await.get(rid).cloned())
        }

        async fn save_bulk(
            &self,
            incoming: std::collections::BTreeMap<String, ResourceDocument>,
        ) -> Result<Vec<BulkWriteOutcome>, StoreError> {
            let mut docs = self.docs.lock().await;
            let mut outcomes = Vec::with_capacity(incoming.len());
            for (id, doc) in incoming {
                match docs.get(&id) {
                    Some(existing) if existing.is_at_least_as_fresh_as(&doc) => {
                        outcomes.push(BulkWriteOutcome::StaleWriteIgnored { id });
                    }
                    Some(_) => {
                        docs.insert(id.clone(), doc);
                        outcomes.push(BulkWriteOutcome::Updated {
                            id,
                            revision: "2-updated".to_string(),
                        });
                    }
                    None => {
                        docs.insert(id.clone(), doc);
                        outcomes.push(BulkWriteOutcome::Created {
                            id,
                            revision: "1-created".to_string(),
                        });
                    }
                }
            }
            Ok(outcomes)
        }
    }
}

/// A handler that only logs; stands in for the real per-type domain
/// handlers, which are an external collaborator this crate never defines.
struct LoggingHandler;

#[async_trait]
impl ResourceHandler for LoggingHandler {
    async fn process_resource(&self, document: &ResourceDocument) -> Result<(), FetchError> {
        info!(
            target: "procurement_sync.handler",
            id = document.id().unwrap_or_default(),
            "common handler received document (no-op placeholder)"
        );
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Bulk-reconcile fetched documents into the local store.
    Bulk,
    /// Dispatch fetched documents to a registered domain handler.
    Dispatch,
}

#[derive(Parser, Debug)]
#[command(name = "procurement-sync", version, about = "Reconciles a public procurement API into a local store")]
struct Args {
    /// Path to a TOML worker configuration file.
    #[arg(long, default_value = "procurement-sync.toml")]
    config: PathBuf,

    /// Base URL of the upstream public procurement API.
    #[arg(long, default_value = "https://public.api.openprocurement.org/api/2.5")]
    base_url: String,

    /// Number of API client transports to seed the pool with.
    #[arg(long, default_value_t = 1)]
    clients: usize,

    /// Which terminal step the spawned workers use.
    #[arg(long, value_enum, default_value_t = Mode::Bulk)]
    mode: Mode,

    /// Enable verbose debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("procurement_sync=debug")
    } else {
        EnvFilter::new("procurement_sync=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = load_config(&args.config)?;
    info!(
        resource = %config.resource,
        workers_count = config.workers_count,
        mode = ?args.mode,
        "starting procurement-sync"
    );

    let pool: PoolQueue<PooledClient> = PoolQueue::new(args.clients);
    let http_client = reqwest::Client::builder()
        .user_agent("procurement-sync/0.1")
        .build()
        .context("build reqwest client")?;
    let transports: Vec<(String, Arc<dyn procurement_sync::ApiTransport>)> = (0..args.clients)
        .map(|i| {
            let transport = HttpTransport::new(http_client.clone(), args.base_url.clone(), config.resource.clone());
            (format!("client-{i}"), Arc::new(transport) as Arc<dyn procurement_sync::ApiTransport>)
        })
        .collect();
    procurement_sync::worker::seed_pool(&pool, transports).await;

    let (leases, retry, fetcher) = procurement_sync::worker::shared_components(
        pool,
        config.queue_timeout(),
        config.retries_count,
        Duration::from_secs_f64(config.retry_default_timeout_secs),
        config.client_inc_step_timeout,
        config.client_dec_step_timeout,
        config.drop_threshold_client_cookies,
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let mut join_handles = Vec::with_capacity(config.workers_count);

    match args.mode {
        Mode::Bulk => {
            let ready: PriorityQueue<String> = PriorityQueue::new(0);
            let retry_queue: PriorityQueue<String> = PriorityQueue::new(0);
            let store = Arc::new(fake_store::InMemoryStore::default());

            for _ in 0..config.workers_count {
                let reconciler = BulkReconciler::new(
                    SharedStore(store.clone()),
                    retry.clone(),
                    title_case(&config.resource_singular()),
                    config.bulk_save_limit,
                    config.bulk_save_interval(),
                    config.tz(),
                );
                let strategy = BulkStrategy::new(reconciler);
                let mut worker = Worker::new(
                    leases.clone(),
                    fetcher.clone(),
                    retry.clone(),
                    ready.clone(),
                    retry_queue.clone(),
                    strategy,
                    config.worker_sleep(),
                    config.queue_timeout(),
                    shutdown.clone(),
                );
                join_handles.push(tokio::spawn(async move { worker.run().await }));
            }
        }
        Mode::Dispatch => {
            let ready: PriorityQueue<DispatchQueueItem> = PriorityQueue::new(0);
            let retry_queue: PriorityQueue<DispatchQueueItem> = PriorityQueue::new(0);

            let mut handlers: HashMap<String, Arc<dyn ResourceHandler>> = HashMap::new();
            handlers.insert("common".to_string(), Arc::new(LoggingHandler));
            let registry = HandlerRegistry::new(handlers);

            for _ in 0..config.workers_count {
                let strategy = DispatchStrategy::new(registry.clone(), retry.clone());
                let mut worker = Worker::new(
                    leases.clone(),
                    fetcher.clone(),
                    retry.clone(),
                    ready.clone(),
                    retry_queue.clone(),
                    strategy,
                    config.worker_sleep(),
                    config.queue_timeout(),
                    shutdown.clone(),
                );
                join_handles.push(tokio::spawn(async move { worker.run().await }));
            }
        }
    }

    tokio::signal::ctrl_c().await.context("await ctrl_c")?;
    info!("shutdown requested, draining workers");
    shutdown.store(true, Ordering::Relaxed);

    for handle in join_handles {
        if let Err(error) = handle.await {
            warn!(target: "procurement_sync.main", %error, "worker task panicked");
        }
    }

    Ok(())
}

fn load_config(path: &std::path::Path) -> Result<WorkerConfig> {
    match WorkerConfig::load(path) {
        Ok(config) => Ok(config),
        Err(ConfigError::FileNotFound { .. }) => {
            warn!(path = %path.display(), "config file not found, using defaults with environment overrides");
            let mut config = WorkerConfig::default();
            config
                .apply_env_overrides(std::env::vars())
                .context("apply environment overrides")?;
            config.validate().context("validate default configuration")?;
            Ok(config)
        }
        Err(other) => Err(other).with_context(|| format!("load config from {}", path.display())),
    }
}

fn title_case(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// A cheaply cloneable `Store` wrapper so every spawned worker's
/// [`BulkReconciler`] can share the same backing map.
struct SharedStore(Arc<fake_store::InMemoryStore>);

#[async_trait]
impl procurement_sync::Store for SharedStore {
    async fn get_doc(
        &self,
        rid: &str,
    ) -> Result<Option<ResourceDocument>, procurement_sync::StoreError> {
        self.0.get_doc(rid).await
    }

    async fn save_bulk(
        &self,
        docs: std::collections::BTreeMap<String, ResourceDocument>,
    ) -> Result<Vec<procurement_sync::BulkWriteOutcome>, procurement_sync::StoreError> {
        self.0.save_bulk(docs).await
    }
}
