pub mod batch;
pub mod cache;
pub mod config;
pub mod content;
pub mod db;
pub mod errors;
pub mod limiter;
pub mod models;
pub mod orchestrator;
pub mod providers;
pub mod retry_queue;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use once_cell::sync::OnceCell;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::batch::{BatchExecutor, BatchOptions, ProgressObserver};
use crate::cache::{CacheStats, CacheStore, DisabledCache, SqliteCache};
use crate::config::{PublicAppConfig, RetryStorage};
use crate::content::{HttpContentFetcher, RemoteExtractor};
use crate::db::{bootstrap, SharedConnection};
use crate::limiter::{ConcurrencyLimiter, LimiterMetrics, LimiterSettings};
use crate::orchestrator::{LookupOrchestrator, OrchestratorSettings};
use crate::providers::ProviderChain;
use crate::retry_queue::{
    MemoryRetryStore, RetryQueue, RetryQueueStats, RetrySettings, RetryStore, SqliteRetryStore,
};

pub use crate::config::AppConfig;
pub use crate::errors::{AppError, AppResult};
pub use crate::models::{BatchSummary, LookupRequest, LookupResult, LookupStatus};
pub use crate::orchestrator::{LookupOptions, LookupService};
pub use crate::retry_queue::RetryRun;

#[derive(Debug, Serialize)]
pub struct RuntimeHealth {
    pub db_path: String,
    pub cache_backend: &'static str,
    pub cache: Option<CacheStats>,
    pub search_limiter: LimiterMetrics,
    pub retry_queue: RetryQueueStats,
    pub config: PublicAppConfig,
}

/// Wires configuration, storage, providers and the retry queue into one process-wide
/// lookup service.
pub struct LookupRuntime {
    config: AppConfig,
    db_path: PathBuf,
    cache: Arc<dyn CacheStore>,
    sqlite_cache: Option<Arc<SqliteCache>>,
    limiter: Arc<ConcurrencyLimiter>,
    orchestrator: Arc<LookupOrchestrator>,
    batch: BatchExecutor,
    retry_queue: RetryQueue,
}

impl LookupRuntime {
    pub fn from_env() -> AppResult<Self> {
        init_tracing();
        Self::from_config(AppConfig::from_env())
    }

    pub fn from_config(config: AppConfig) -> AppResult<Self> {
        config.validate()?;
        let context = bootstrap(&config.database_path)?;
        let db_path = context.path.clone();
        let db: SharedConnection = context.into_shared();

        let sqlite_cache = config
            .cache_enabled
            .then(|| Arc::new(SqliteCache::new(Arc::clone(&db))));
        let cache: Arc<dyn CacheStore> = match &sqlite_cache {
            Some(cache) => cache.clone(),
            None => Arc::new(DisabledCache),
        };

        let limiter = Arc::new(ConcurrencyLimiter::new(LimiterSettings::from_config(
            &config,
        ))?);
        let providers = ProviderChain::from_config(&config, Arc::clone(&limiter))?;
        let extractor = Arc::new(RemoteExtractor::from_config(&config)?);
        if !extractor.is_configured() {
            warn!("no extraction service configured; verification will assume matches");
        }
        let orchestrator = Arc::new(LookupOrchestrator::new(
            providers,
            Arc::new(HttpContentFetcher::new(config.scrape_timeout())?),
            extractor.clone(),
            extractor,
            Arc::clone(&cache),
            OrchestratorSettings::from_config(&config),
        ));

        let store: Arc<dyn RetryStore> = match config.retry_storage {
            RetryStorage::Sqlite => Arc::new(SqliteRetryStore::new(Arc::clone(&db))),
            RetryStorage::Memory => Arc::new(MemoryRetryStore::default()),
        };
        let retry_queue = RetryQueue::new(
            store,
            orchestrator.clone(),
            RetrySettings::from_config(&config),
        );
        retry_queue.recover_stalled()?;

        info!(
            db_path = %db_path.display(),
            cache = cache.backend(),
            retry_storage = config.retry_storage.as_str(),
            "lookup runtime ready"
        );
        Ok(Self {
            batch: BatchExecutor::new(orchestrator.clone()),
            config,
            db_path,
            cache,
            sqlite_cache,
            limiter,
            orchestrator,
            retry_queue,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn retry_queue(&self) -> &RetryQueue {
        &self.retry_queue
    }

    pub fn default_batch_options(&self) -> BatchOptions {
        BatchOptions::new(self.config.batch_max_concurrent)
    }

    pub async fn lookup(&self, request: &LookupRequest, options: LookupOptions) -> LookupResult {
        self.orchestrator.lookup(request, options).await
    }

    /// Runs a batch and, when auto-enqueue is on, queues its failures for retry.
    pub async fn run_batch(
        &self,
        requests: Vec<LookupRequest>,
        options: BatchOptions,
        observer: Option<ProgressObserver>,
    ) -> AppResult<BatchSummary> {
        if requests.is_empty() {
            return Err(AppError::Validation("batch contains no requests".into()));
        }
        if requests.len() > self.config.batch_max_size {
            return Err(AppError::Validation(format!(
                "batch of {} exceeds the maximum of {}",
                requests.len(),
                self.config.batch_max_size
            )));
        }
        if let Some(blank) = requests.iter().position(|r| r.name.trim().is_empty()) {
            return Err(AppError::Validation(format!(
                "request {blank} has an empty name"
            )));
        }

        let batch_id = format!("batch-{}", retry_queue::generate_id());
        let started = Instant::now();
        let results = self.batch.run_batch(&requests, options, observer).await;
        let mut summary = BatchSummary::from_results(
            batch_id.clone(),
            results,
            started.elapsed().as_secs_f64(),
        );

        if self.config.retry_auto_enqueue {
            match self
                .retry_queue
                .enqueue_batch_failures(&summary.results, &requests, Some(&batch_id))
            {
                Ok(items) => summary.enqueued_for_retry = items.len(),
                Err(err) => warn!(?err, %batch_id, "failed to enqueue batch failures"),
            }
        }
        info!(
            %batch_id,
            total = summary.total_requested,
            successful = summary.successful,
            partial = summary.partial,
            failed = summary.failed,
            enqueued = summary.enqueued_for_retry,
            "batch summary"
        );
        Ok(summary)
    }

    pub async fn invalidate(&self, request: &LookupRequest) -> usize {
        self.cache.invalidate(&request.fingerprint()).await
    }

    pub fn health(&self) -> AppResult<RuntimeHealth> {
        let cache = match &self.sqlite_cache {
            Some(cache) => Some(cache.stats()?),
            None => None,
        };
        Ok(RuntimeHealth {
            db_path: self.db_path.to_string_lossy().to_string(),
            cache_backend: self.cache.backend(),
            cache,
            search_limiter: self.limiter.metrics(),
            retry_queue: self.retry_queue.stats()?,
            config: self.config.public_profile(),
        })
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,hotel_lookup=debug"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init();
    });
}
