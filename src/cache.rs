use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::OptionalExtension;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::db::SharedConnection;
use crate::errors::AppResult;
use crate::models::LookupResult;

/// Terminal lookup results keyed by request fingerprint.
///
/// Implementations never surface storage failures: an unreachable backend behaves as an
/// always-miss cache and the failure is logged.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, fingerprint: &str) -> Option<LookupResult>;
    async fn set(&self, fingerprint: &str, result: &LookupResult, ttl: Duration);
    async fn invalidate(&self, fingerprint: &str) -> usize;
    fn backend(&self) -> &'static str;
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub result: LookupResult,
    pub cached_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl CacheEntry {
    fn expires_at(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| self.cached_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at() > now
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub backend: &'static str,
    pub entries: usize,
    pub expired: usize,
}

pub struct SqliteCache {
    db: SharedConnection,
}

impl SqliteCache {
    pub fn new(db: SharedConnection) -> Self {
        Self { db }
    }

    pub fn stats(&self) -> AppResult<CacheStats> {
        let now = Utc::now().timestamp();
        let conn = self.db.lock();
        let (entries, expired): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN expires_at <= ?1 THEN 1 ELSE 0 END), 0)
            FROM lookup_cache",
            [now],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(CacheStats {
            backend: self.backend(),
            entries: entries as usize,
            expired: expired as usize,
        })
    }

    pub fn purge_expired(&self) -> AppResult<usize> {
        let now = Utc::now().timestamp();
        let conn = self.db.lock();
        let removed = conn.execute("DELETE FROM lookup_cache WHERE expires_at <= ?1", [now])?;
        Ok(removed)
    }

    fn load(&self, fingerprint: &str) -> AppResult<Option<LookupResult>> {
        let now = Utc::now().timestamp();
        let payload: Option<String> = {
            let conn = self.db.lock();
            conn.query_row(
                "SELECT result_json FROM lookup_cache WHERE fingerprint = ?1 AND expires_at > ?2",
                (fingerprint, now),
                |row| row.get(0),
            )
            .optional()?
        };
        match payload {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    fn store(&self, entry: &CacheEntry) -> AppResult<()> {
        let payload = serde_json::to_string(&entry.result)?;
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO lookup_cache (fingerprint, result_json, cached_at, expires_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(fingerprint) DO UPDATE SET
                result_json = excluded.result_json,
                cached_at = excluded.cached_at,
                expires_at = excluded.expires_at",
            (
                entry.fingerprint.as_str(),
                payload,
                entry.cached_at.timestamp(),
                entry.expires_at().timestamp(),
            ),
        )?;
        Ok(())
    }

    fn remove(&self, fingerprint: &str) -> AppResult<usize> {
        let conn = self.db.lock();
        Ok(conn.execute(
            "DELETE FROM lookup_cache WHERE fingerprint = ?1",
            [fingerprint],
        )?)
    }
}

#[async_trait]
impl CacheStore for SqliteCache {
    async fn get(&self, fingerprint: &str) -> Option<LookupResult> {
        match self.load(fingerprint) {
            Ok(Some(mut result)) => {
                debug!(target: "cache", fingerprint, "cache hit");
                result.from_cache = true;
                Some(result)
            }
            Ok(None) => {
                debug!(target: "cache", fingerprint, "cache miss");
                None
            }
            Err(err) => {
                warn!(target: "cache", ?err, fingerprint, "cache read failed; treating as miss");
                None
            }
        }
    }

    async fn set(&self, fingerprint: &str, result: &LookupResult, ttl: Duration) {
        let entry = CacheEntry {
            fingerprint: fingerprint.to_string(),
            result: result.clone(),
            cached_at: Utc::now(),
            ttl,
        };
        match self.store(&entry) {
            Ok(()) => info!(
                target: "cache",
                fingerprint,
                ttl_secs = ttl.as_secs(),
                "cached lookup result"
            ),
            Err(err) => warn!(target: "cache", ?err, fingerprint, "cache write failed"),
        }
    }

    async fn invalidate(&self, fingerprint: &str) -> usize {
        match self.remove(fingerprint) {
            Ok(count) => count,
            Err(err) => {
                warn!(target: "cache", ?err, fingerprint, "cache invalidation failed");
                0
            }
        }
    }

    fn backend(&self) -> &'static str {
        "sqlite"
    }
}

#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, fingerprint: &str) -> Option<LookupResult> {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        match entries.get(fingerprint) {
            Some(entry) if entry.is_live(now) => {
                let mut result = entry.result.clone();
                result.from_cache = true;
                Some(result)
            }
            Some(_) => {
                entries.remove(fingerprint);
                None
            }
            None => None,
        }
    }

    async fn set(&self, fingerprint: &str, result: &LookupResult, ttl: Duration) {
        self.entries.lock().insert(
            fingerprint.to_string(),
            CacheEntry {
                fingerprint: fingerprint.to_string(),
                result: result.clone(),
                cached_at: Utc::now(),
                ttl,
            },
        );
    }

    async fn invalidate(&self, fingerprint: &str) -> usize {
        usize::from(self.entries.lock().remove(fingerprint).is_some())
    }

    fn backend(&self) -> &'static str {
        "in-memory"
    }
}

/// Always-miss cache used when caching is switched off.
#[derive(Default)]
pub struct DisabledCache;

#[async_trait]
impl CacheStore for DisabledCache {
    async fn get(&self, _fingerprint: &str) -> Option<LookupResult> {
        None
    }

    async fn set(&self, _fingerprint: &str, _result: &LookupResult, _ttl: Duration) {}

    async fn invalidate(&self, _fingerprint: &str) -> usize {
        0
    }

    fn backend(&self) -> &'static str {
        "disabled"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;
    use crate::models::{LookupRequest, LookupStatus};

    fn sample_result() -> LookupResult {
        let request = LookupRequest::new("The County Hotel").with_address("Old Luss Road");
        let mut result = LookupResult::for_request(&request);
        result.website = Some("https://county.example".into());
        result.finalize(false);
        result
    }

    #[tokio::test]
    async fn sqlite_cache_roundtrips_and_flags_hits() {
        let cache = SqliteCache::new(open_in_memory().unwrap());
        let result = sample_result();
        cache.set("fp", &result, Duration::from_secs(60)).await;

        let hit = cache.get("fp").await.expect("cached");
        assert!(hit.from_cache);
        assert_eq!(hit.status, LookupStatus::Partial);
        assert_eq!(hit.website, result.website);
        assert_eq!(cache.stats().unwrap().entries, 1);
    }

    #[tokio::test]
    async fn sqlite_cache_skips_expired_entries() {
        let cache = SqliteCache::new(open_in_memory().unwrap());
        cache.set("fp", &sample_result(), Duration::ZERO).await;

        assert!(cache.get("fp").await.is_none());
        assert_eq!(cache.stats().unwrap().expired, 1);
        assert_eq!(cache.purge_expired().unwrap(), 1);
    }

    #[tokio::test]
    async fn invalidate_reports_removed_count() {
        let cache = SqliteCache::new(open_in_memory().unwrap());
        cache.set("fp", &sample_result(), Duration::from_secs(60)).await;
        assert_eq!(cache.invalidate("fp").await, 1);
        assert_eq!(cache.invalidate("fp").await, 0);
        assert!(cache.get("fp").await.is_none());
    }

    #[tokio::test]
    async fn unreachable_store_degrades_to_miss() {
        let db = open_in_memory().unwrap();
        db.lock().execute("DROP TABLE lookup_cache", []).unwrap();
        let cache = SqliteCache::new(db);

        cache.set("fp", &sample_result(), Duration::from_secs(60)).await;
        assert!(cache.get("fp").await.is_none());
        assert_eq!(cache.invalidate("fp").await, 0);
    }

    #[tokio::test]
    async fn memory_cache_expires_entries() {
        let cache = MemoryCache::default();
        cache.set("live", &sample_result(), Duration::from_secs(60)).await;
        cache.set("stale", &sample_result(), Duration::ZERO).await;

        assert!(cache.get("live").await.unwrap().from_cache);
        assert!(cache.get("stale").await.is_none());
        assert_eq!(cache.len(), 1);
    }
}
