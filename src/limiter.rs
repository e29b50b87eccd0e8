use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, warn};

use crate::config::AppConfig;
use crate::errors::AppResult;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider rate limit exceeded")]
    RateLimited,
    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),
    #[error("provider returned server error {0}")]
    Server(u16),
    #[error("provider transport failure: {0}")]
    Transport(String),
    #[error("provider rejected credentials: {0}")]
    Auth(String),
    #[error("provider misconfigured: {0}")]
    Config(String),
    #[error("provider response unreadable: {0}")]
    Malformed(String),
    #[error("search worker pool failure: {0}")]
    WorkerPool(String),
}

impl ProviderError {
    /// Rate limits, timeouts, 5xx responses and transport hiccups are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited
                | ProviderError::Timeout(_)
                | ProviderError::Server(_)
                | ProviderError::Transport(_)
        )
    }

    pub fn from_status(status: StatusCode, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        match status {
            StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited,
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
                ProviderError::Timeout(Duration::ZERO)
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Auth(detail),
            status if status.is_server_error() => ProviderError::Server(status.as_u16()),
            status => ProviderError::Config(format!("HTTP {}: {detail}", status.as_u16())),
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return ProviderError::Timeout(Duration::ZERO);
        }
        if let Some(status) = err.status() {
            return ProviderError::from_status(status, err.to_string());
        }
        if err.is_decode() {
            return ProviderError::Malformed(err.to_string());
        }
        if err.is_builder() {
            return ProviderError::Config(err.to_string());
        }
        ProviderError::Transport(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct LimiterSettings {
    pub max_concurrent: usize,
    pub worker_threads: usize,
    pub max_attempts: u32,
    pub retry_delay_base: Duration,
    pub call_timeout: Duration,
}

impl LimiterSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_concurrent: config.search_max_concurrent,
            worker_threads: config.search_worker_threads,
            max_attempts: config.search_retry_max,
            retry_delay_base: config.search_retry_delay_base(),
            call_timeout: config.search_timeout(),
        }
    }
}

#[derive(Default)]
struct Counters {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LimiterMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub retried_requests: u64,
    pub success_rate: f64,
    pub max_concurrent: usize,
    pub available_permits: usize,
    pub worker_threads: usize,
}

/// Runs blocking, rate-limited search calls on a dedicated worker pool.
///
/// One instance is shared by every batch in the process, so its semaphore caps the
/// number of in-flight provider calls regardless of how many batches are running.
/// Blocking calls never execute on the caller's scheduler threads.
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    pool: Option<Runtime>,
    settings: LimiterSettings,
    counters: Counters,
}

impl ConcurrencyLimiter {
    pub fn new(settings: LimiterSettings) -> AppResult<Self> {
        let settings = LimiterSettings {
            max_concurrent: settings.max_concurrent.max(1),
            worker_threads: settings.worker_threads.max(1),
            max_attempts: settings.max_attempts.max(1),
            ..settings
        };
        let pool = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(settings.worker_threads)
            .thread_name("search-worker")
            .enable_time()
            .build()?;
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(settings.max_concurrent)),
            pool: Some(pool),
            settings,
            counters: Counters::default(),
        })
    }

    pub fn settings(&self) -> &LimiterSettings {
        &self.settings
    }

    /// Submits `op` to the worker pool, retrying retryable failures with exponential
    /// backoff. Fatal failures return immediately.
    pub async fn run<T, F>(&self, label: &str, op: F) -> Result<T, ProviderError>
    where
        F: Fn() -> Result<T, ProviderError> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let op = Arc::new(op);
        self.counters.total.fetch_add(1, Ordering::Relaxed);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt(Arc::clone(&op)).await {
                Ok(value) => {
                    self.counters.successful.fetch_add(1, Ordering::Relaxed);
                    debug!(target: "search_limiter", label, attempt, "search call completed");
                    return Ok(value);
                }
                Err(err) if err.is_retryable() && attempt < self.settings.max_attempts => {
                    self.counters.retried.fetch_add(1, Ordering::Relaxed);
                    let delay = backoff_delay(self.settings.retry_delay_base, attempt);
                    warn!(
                        target: "search_limiter",
                        %err,
                        label,
                        attempt,
                        max_attempts = self.settings.max_attempts,
                        "retryable search failure; retrying after {:?}",
                        delay
                    );
                    sleep(delay).await;
                }
                Err(err) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    if err.is_retryable() {
                        warn!(target: "search_limiter", %err, label, attempt, "search retries exhausted");
                    } else {
                        error!(target: "search_limiter", %err, label, "fatal search failure; not retrying");
                    }
                    return Err(err);
                }
            }
        }
    }

    async fn attempt<T, F>(&self, op: Arc<F>) -> Result<T, ProviderError>
    where
        F: Fn() -> Result<T, ProviderError> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| ProviderError::WorkerPool("limiter closed".into()))?;
        // Held until the blocking call returns, even after a timeout.
        let handle = self.pool_handle()?.spawn_blocking(move || {
            let _permit = permit;
            op()
        });
        match timeout(self.settings.call_timeout, handle).await {
            Err(_) => Err(ProviderError::Timeout(self.settings.call_timeout)),
            Ok(Err(join_err)) => Err(ProviderError::WorkerPool(join_err.to_string())),
            Ok(Ok(outcome)) => outcome,
        }
    }

    fn pool_handle(&self) -> Result<&Handle, ProviderError> {
        self.pool
            .as_ref()
            .map(Runtime::handle)
            .ok_or_else(|| ProviderError::WorkerPool("worker pool shut down".into()))
    }

    pub fn metrics(&self) -> LimiterMetrics {
        let total = self.counters.total.load(Ordering::Relaxed);
        let successful = self.counters.successful.load(Ordering::Relaxed);
        LimiterMetrics {
            total_requests: total,
            successful_requests: successful,
            failed_requests: self.counters.failed.load(Ordering::Relaxed),
            retried_requests: self.counters.retried.load(Ordering::Relaxed),
            success_rate: if total == 0 {
                0.0
            } else {
                successful as f64 / total as f64
            },
            max_concurrent: self.settings.max_concurrent,
            available_permits: self.semaphore.available_permits(),
            worker_threads: self.settings.worker_threads,
        }
    }
}

impl Drop for ConcurrencyLimiter {
    fn drop(&mut self) {
        // Blocking shutdown would panic when dropped from async code.
        if let Some(pool) = self.pool.take() {
            pool.shutdown_background();
        }
    }
}

/// Delay before retry `attempt + 1`: `base * 2^(attempt - 1)`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base * (1_u32 << exponent)
}
