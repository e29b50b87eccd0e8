use std::time::Duration;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

use crate::errors::{AppError, AppResult};

const DEFAULT_DATABASE_PATH: &str = "hotel-lookup.db";
const DEFAULT_HISTORY_MAX: usize = 200;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStorage {
    Sqlite,
    Memory,
}

impl RetryStorage {
    fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" | "in-memory" | "in_memory" => RetryStorage::Memory,
            _ => RetryStorage::Sqlite,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RetryStorage::Sqlite => "sqlite",
            RetryStorage::Memory => "in-memory",
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_path: String,
    pub cache_enabled: bool,
    pub cache_ttl_hours: u64,
    pub batch_max_concurrent: usize,
    pub batch_max_size: usize,
    pub retry_max_attempts: u32,
    pub retry_backoff_base_secs: f64,
    pub retry_max_concurrent: usize,
    pub retry_auto_enqueue: bool,
    pub retry_storage: RetryStorage,
    pub retry_history_max: usize,
    pub search_max_concurrent: usize,
    pub search_worker_threads: usize,
    pub search_retry_max: u32,
    pub search_retry_delay_base_secs: f64,
    pub search_timeout_secs: u64,
    pub scrape_timeout_secs: u64,
    pub verification_mismatch_threshold: f64,
    pub grounded_search_endpoint: Option<String>,
    pub web_search_endpoint: Option<String>,
    pub booking_search_endpoint: Option<String>,
    pub planning_portal_endpoint: Option<String>,
    pub search_api_key: Option<SecretString>,
    pub extractor_endpoint: Option<String>,
    pub extractor_api_key: Option<SecretString>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub database_path: String,
    pub cache_enabled: bool,
    pub cache_ttl_hours: u64,
    pub batch_max_concurrent: usize,
    pub batch_max_size: usize,
    pub retry_max_attempts: u32,
    pub retry_backoff_base_secs: f64,
    pub retry_max_concurrent: usize,
    pub retry_auto_enqueue: bool,
    pub retry_storage: RetryStorage,
    pub search_max_concurrent: usize,
    pub search_worker_threads: usize,
    pub verification_mismatch_threshold: f64,
    pub has_grounded_search: bool,
    pub has_web_search: bool,
    pub has_booking_search: bool,
    pub has_planning_portal: bool,
    pub has_search_api_key: bool,
    pub has_extractor: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| DEFAULT_DATABASE_PATH.to_string()),
            cache_enabled: parse_bool("CACHE_ENABLED", true),
            cache_ttl_hours: parse_u64("CACHE_TTL_HOURS", 24),
            batch_max_concurrent: parse_usize("BATCH_MAX_CONCURRENT", 25).max(1),
            batch_max_size: parse_usize("BATCH_MAX_SIZE", 500).max(1),
            retry_max_attempts: parse_u32("RETRY_MAX_ATTEMPTS", 3).max(1),
            retry_backoff_base_secs: parse_f64("RETRY_BACKOFF_BASE", 30.0).max(0.0),
            retry_max_concurrent: parse_usize("RETRY_MAX_CONCURRENT", 5).max(1),
            retry_auto_enqueue: parse_bool("RETRY_AUTO_ENQUEUE", true),
            retry_storage: env::var("RETRY_STORAGE")
                .map(|v| RetryStorage::parse(&v))
                .unwrap_or(RetryStorage::Sqlite),
            retry_history_max: parse_usize("RETRY_HISTORY_MAX", DEFAULT_HISTORY_MAX).max(1),
            search_max_concurrent: parse_usize("SEARCH_MAX_CONCURRENT", 15).max(1),
            search_worker_threads: parse_usize("SEARCH_WORKER_THREADS", 20).max(1),
            search_retry_max: parse_u32("SEARCH_RETRY_MAX", 3).max(1),
            search_retry_delay_base_secs: parse_f64("SEARCH_RETRY_DELAY_BASE", 2.0).max(0.0),
            search_timeout_secs: parse_u64("SEARCH_TIMEOUT_SECS", 90).max(1),
            scrape_timeout_secs: parse_u64("SCRAPE_TIMEOUT_SECONDS", 30).max(1),
            verification_mismatch_threshold: parse_f64("VERIFICATION_MISMATCH_THRESHOLD", 0.5)
                .clamp(0.0, 1.0),
            grounded_search_endpoint: non_empty("GROUNDED_SEARCH_ENDPOINT"),
            web_search_endpoint: non_empty("WEB_SEARCH_ENDPOINT"),
            booking_search_endpoint: non_empty("BOOKING_SEARCH_ENDPOINT"),
            planning_portal_endpoint: non_empty("PLANNING_PORTAL_ENDPOINT"),
            search_api_key: non_empty("SEARCH_API_KEY").map(SecretString::from),
            extractor_endpoint: non_empty("EXTRACTOR_ENDPOINT"),
            extractor_api_key: non_empty("EXTRACTOR_API_KEY").map(SecretString::from),
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            database_path: self.database_path.clone(),
            cache_enabled: self.cache_enabled,
            cache_ttl_hours: self.cache_ttl_hours,
            batch_max_concurrent: self.batch_max_concurrent,
            batch_max_size: self.batch_max_size,
            retry_max_attempts: self.retry_max_attempts,
            retry_backoff_base_secs: self.retry_backoff_base_secs,
            retry_max_concurrent: self.retry_max_concurrent,
            retry_auto_enqueue: self.retry_auto_enqueue,
            retry_storage: self.retry_storage,
            search_max_concurrent: self.search_max_concurrent,
            search_worker_threads: self.search_worker_threads,
            verification_mismatch_threshold: self.verification_mismatch_threshold,
            has_grounded_search: self.grounded_search_endpoint.is_some(),
            has_web_search: self.web_search_endpoint.is_some(),
            has_booking_search: self.booking_search_endpoint.is_some(),
            has_planning_portal: self.planning_portal_endpoint.is_some(),
            has_search_api_key: self.search_api_key.is_some(),
            has_extractor: self.extractor_endpoint.is_some(),
        }
    }

    /// Rejects endpoints that are not absolute http(s) URLs.
    pub fn validate(&self) -> AppResult<()> {
        let endpoints = [
            ("GROUNDED_SEARCH_ENDPOINT", &self.grounded_search_endpoint),
            ("WEB_SEARCH_ENDPOINT", &self.web_search_endpoint),
            ("BOOKING_SEARCH_ENDPOINT", &self.booking_search_endpoint),
            ("PLANNING_PORTAL_ENDPOINT", &self.planning_portal_endpoint),
            ("EXTRACTOR_ENDPOINT", &self.extractor_endpoint),
        ];
        for (key, value) in endpoints {
            let Some(url) = value else { continue };
            let url = url.trim();
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(AppError::Config(format!(
                    "{key} must be an http(s) URL, got `{url}`"
                )));
            }
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_hours * 60 * 60)
    }

    pub fn retry_backoff_base(&self) -> Duration {
        Duration::from_secs_f64(self.retry_backoff_base_secs)
    }

    pub fn search_retry_delay_base(&self) -> Duration {
        Duration::from_secs_f64(self.search_retry_delay_base_secs)
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_secs(self.search_timeout_secs)
    }

    pub fn scrape_timeout(&self) -> Duration {
        Duration::from_secs(self.scrape_timeout_secs)
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn parse_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}
