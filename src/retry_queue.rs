use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use futures_util::FutureExt;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::db::SharedConnection;
use crate::errors::{AppError, AppResult};
use crate::models::{LookupRequest, LookupResult, LookupStatus};
use crate::orchestrator::{panic_message, LookupOptions, LookupService};

const ID_LEN: usize = 8;
const STALE_RETRY_AFTER: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStatus {
    Pending,
    Retrying,
    Succeeded,
    Exhausted,
}

impl RetryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryStatus::Pending => "pending",
            RetryStatus::Retrying => "retrying",
            RetryStatus::Succeeded => "succeeded",
            RetryStatus::Exhausted => "exhausted",
        }
    }
}

/// The fields of a successful retry worth keeping once the item leaves the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryOutcome {
    pub status: LookupStatus,
    pub website: Option<String>,
    pub phone: Option<String>,
    pub rooms_min: Option<u32>,
    pub rooms_max: Option<u32>,
    pub confidence: Option<f64>,
}

impl From<&LookupResult> for RetryOutcome {
    fn from(result: &LookupResult) -> Self {
        Self {
            status: result.status,
            website: result.website.clone(),
            phone: result.phone.clone(),
            rooms_min: result.rooms_min,
            rooms_max: result.rooms_max,
            confidence: result.confidence,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryItem {
    pub id: String,
    pub request: LookupRequest,
    pub original_status: LookupStatus,
    #[serde(default)]
    pub original_errors: Vec<String>,
    #[serde(default)]
    pub source_batch_id: Option<String>,
    pub status: RetryStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_retry_at: DateTime<Utc>,
    #[serde(default)]
    pub last_errors: Vec<String>,
    #[serde(default)]
    pub result: Option<RetryOutcome>,
}

impl RetryItem {
    fn begin_attempt(&self, at: DateTime<Utc>) -> Self {
        Self {
            status: RetryStatus::Retrying,
            attempt_count: self.attempt_count + 1,
            last_attempt_at: Some(at),
            ..self.clone()
        }
    }

    /// Whether a stored item still carries the version `current` was read at.
    fn same_version(&self, current: &RetryItem) -> bool {
        self.status == current.status && self.attempt_count == current.attempt_count
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryHistoryEntry {
    #[serde(flatten)]
    pub item: RetryItem,
    pub completed_at: DateTime<Utc>,
}

/// Key-value storage for queued items plus a capped, newest-first history list.
pub trait RetryStore: Send + Sync {
    fn backend(&self) -> &'static str;
    fn get_all(&self) -> AppResult<Vec<RetryItem>>;
    fn get(&self, id: &str) -> AppResult<Option<RetryItem>>;
    fn put(&self, item: &RetryItem) -> AppResult<()>;
    fn delete(&self, id: &str) -> AppResult<bool>;
    /// Writes `next` only if the stored item still has `current`'s status and attempt
    /// count. Returns whether the write happened.
    fn compare_and_put(&self, current: &RetryItem, next: &RetryItem) -> AppResult<bool>;
    fn push_history(&self, entry: &RetryHistoryEntry, cap: usize) -> AppResult<()>;
    fn history(&self) -> AppResult<Vec<RetryHistoryEntry>>;
    fn clear_history(&self) -> AppResult<usize>;

    /// Removes the item from the queue and records it in history.
    fn archive(&self, entry: &RetryHistoryEntry, cap: usize) -> AppResult<()> {
        self.delete(&entry.item.id)?;
        self.push_history(entry, cap)
    }
}

pub struct SqliteRetryStore {
    db: SharedConnection,
}

impl SqliteRetryStore {
    pub fn new(db: SharedConnection) -> Self {
        Self { db }
    }
}

fn trim_history(conn: &rusqlite::Connection, cap: usize) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM retry_history WHERE seq NOT IN (
            SELECT seq FROM retry_history ORDER BY seq DESC LIMIT ?1
        )",
        [cap as i64],
    )
}

impl RetryStore for SqliteRetryStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    fn get_all(&self) -> AppResult<Vec<RetryItem>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare("SELECT item_json FROM retry_queue ORDER BY rowid")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.iter()
            .map(|json| serde_json::from_str(json).map_err(AppError::from))
            .collect()
    }

    fn get(&self, id: &str) -> AppResult<Option<RetryItem>> {
        let conn = self.db.lock();
        let json: Option<String> = conn
            .query_row(
                "SELECT item_json FROM retry_queue WHERE id = ?1",
                [id],
                |row| row.get(0),
            )
            .optional()?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn put(&self, item: &RetryItem) -> AppResult<()> {
        let json = serde_json::to_string(item)?;
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO retry_queue (id, item_json, status, attempt_count, updated_at)
            VALUES (?1, ?2, ?3, ?4, DATETIME('now'))
            ON CONFLICT(id) DO UPDATE SET
                item_json = excluded.item_json,
                status = excluded.status,
                attempt_count = excluded.attempt_count,
                updated_at = excluded.updated_at",
            (&item.id, json, item.status.as_str(), item.attempt_count),
        )?;
        Ok(())
    }

    fn compare_and_put(&self, current: &RetryItem, next: &RetryItem) -> AppResult<bool> {
        let json = serde_json::to_string(next)?;
        let conn = self.db.lock();
        let updated = conn.execute(
            "UPDATE retry_queue
            SET item_json = ?2, status = ?3, attempt_count = ?4, updated_at = DATETIME('now')
            WHERE id = ?1 AND status = ?5 AND attempt_count = ?6",
            (
                &next.id,
                json,
                next.status.as_str(),
                next.attempt_count,
                current.status.as_str(),
                current.attempt_count,
            ),
        )?;
        Ok(updated == 1)
    }

    fn delete(&self, id: &str) -> AppResult<bool> {
        let conn = self.db.lock();
        Ok(conn.execute("DELETE FROM retry_queue WHERE id = ?1", [id])? > 0)
    }

    fn push_history(&self, entry: &RetryHistoryEntry, cap: usize) -> AppResult<()> {
        let json = serde_json::to_string(entry)?;
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO retry_history (item_id, entry_json, completed_at) VALUES (?1, ?2, ?3)",
            (&entry.item.id, json, entry.completed_at.to_rfc3339()),
        )?;
        trim_history(&conn, cap)?;
        Ok(())
    }

    fn history(&self) -> AppResult<Vec<RetryHistoryEntry>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare("SELECT entry_json FROM retry_history ORDER BY seq DESC")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.iter()
            .map(|json| serde_json::from_str(json).map_err(AppError::from))
            .collect()
    }

    fn clear_history(&self) -> AppResult<usize> {
        let conn = self.db.lock();
        Ok(conn.execute("DELETE FROM retry_history", [])?)
    }

    fn archive(&self, entry: &RetryHistoryEntry, cap: usize) -> AppResult<()> {
        let json = serde_json::to_string(entry)?;
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM retry_queue WHERE id = ?1", [&entry.item.id])?;
        tx.execute(
            "INSERT INTO retry_history (item_id, entry_json, completed_at) VALUES (?1, ?2, ?3)",
            (&entry.item.id, json, entry.completed_at.to_rfc3339()),
        )?;
        trim_history(&tx, cap)?;
        tx.commit()?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryRetryStore {
    items: Mutex<(HashMap<String, RetryItem>, Vec<String>)>,
    history: Mutex<VecDeque<RetryHistoryEntry>>,
}

impl RetryStore for MemoryRetryStore {
    fn backend(&self) -> &'static str {
        "in-memory"
    }

    fn get_all(&self) -> AppResult<Vec<RetryItem>> {
        let guard = self.items.lock();
        let (items, order) = &*guard;
        Ok(order.iter().filter_map(|id| items.get(id).cloned()).collect())
    }

    fn get(&self, id: &str) -> AppResult<Option<RetryItem>> {
        Ok(self.items.lock().0.get(id).cloned())
    }

    fn put(&self, item: &RetryItem) -> AppResult<()> {
        let mut guard = self.items.lock();
        let (items, order) = &mut *guard;
        if items.insert(item.id.clone(), item.clone()).is_none() {
            order.push(item.id.clone());
        }
        Ok(())
    }

    fn delete(&self, id: &str) -> AppResult<bool> {
        let mut guard = self.items.lock();
        let (items, order) = &mut *guard;
        let removed = items.remove(id).is_some();
        if removed {
            order.retain(|existing| existing != id);
        }
        Ok(removed)
    }

    fn compare_and_put(&self, current: &RetryItem, next: &RetryItem) -> AppResult<bool> {
        let mut guard = self.items.lock();
        match guard.0.get_mut(&next.id) {
            Some(stored) if stored.same_version(current) => {
                *stored = next.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn push_history(&self, entry: &RetryHistoryEntry, cap: usize) -> AppResult<()> {
        let mut history = self.history.lock();
        history.push_front(entry.clone());
        history.truncate(cap);
        Ok(())
    }

    fn history(&self) -> AppResult<Vec<RetryHistoryEntry>> {
        Ok(self.history.lock().iter().cloned().collect())
    }

    fn clear_history(&self) -> AppResult<usize> {
        let mut history = self.history.lock();
        let count = history.len();
        history.clear();
        Ok(count)
    }
}

#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub history_max: usize,
    /// Items left in `Retrying` longer than this are treated as abandoned.
    pub stale_after: Duration,
}

impl RetrySettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_attempts: config.retry_max_attempts,
            backoff_base: config.retry_backoff_base(),
            history_max: config.retry_history_max,
            stale_after: STALE_RETRY_AFTER,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetrySummary {
    pub processed: usize,
    pub succeeded: usize,
    pub still_failed: usize,
    pub exhausted: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryRun {
    AlreadyRunning,
    Completed(RetrySummary),
}

#[derive(Debug, Clone, Serialize)]
pub struct RetryQueueStats {
    pub queue_size: usize,
    pub pending: usize,
    pub retrying: usize,
    pub history_size: usize,
    pub total_succeeded: usize,
    pub total_exhausted: usize,
    pub storage: &'static str,
    pub max_attempts: u32,
    pub backoff_base_seconds: f64,
    pub is_processing: bool,
}

/// `now + base * 2^attempt_count`.
pub fn next_retry_at(base: Duration, attempt_count: u32, now: DateTime<Utc>) -> DateTime<Utc> {
    let delay = base.saturating_mul(1_u32 << attempt_count.min(20));
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub(crate) fn generate_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ID_LEN)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

pub struct RetryQueue {
    store: Arc<dyn RetryStore>,
    lookup: Arc<dyn LookupService>,
    settings: RetrySettings,
    guard: AsyncMutex<()>,
}

impl RetryQueue {
    pub fn new(
        store: Arc<dyn RetryStore>,
        lookup: Arc<dyn LookupService>,
        settings: RetrySettings,
    ) -> Self {
        Self {
            store,
            lookup,
            settings: RetrySettings {
                max_attempts: settings.max_attempts.max(1),
                history_max: settings.history_max.max(1),
                ..settings
            },
            guard: AsyncMutex::new(()),
        }
    }

    pub fn enqueue(
        &self,
        request: LookupRequest,
        original_status: LookupStatus,
        original_errors: Vec<String>,
        source_batch_id: Option<String>,
    ) -> AppResult<RetryItem> {
        let now = Utc::now();
        let item = RetryItem {
            id: generate_id(),
            request,
            original_status,
            original_errors,
            source_batch_id,
            status: RetryStatus::Pending,
            attempt_count: 0,
            max_attempts: self.settings.max_attempts,
            created_at: now,
            last_attempt_at: None,
            next_retry_at: next_retry_at(self.settings.backoff_base, 0, now),
            last_errors: Vec::new(),
            result: None,
        };
        self.store.put(&item)?;
        info!(target: "retry_queue", id = %item.id, name = %item.request.name, "enqueued for retry");
        Ok(item)
    }

    /// Enqueues the NotFound and Error results of a batch; other results are ignored.
    pub fn enqueue_batch_failures(
        &self,
        results: &[LookupResult],
        requests: &[LookupRequest],
        batch_id: Option<&str>,
    ) -> AppResult<Vec<RetryItem>> {
        let mut enqueued = Vec::new();
        for (request, result) in requests.iter().zip(results) {
            if result.status.is_failure() {
                enqueued.push(self.enqueue(
                    request.clone(),
                    result.status,
                    result.errors.clone(),
                    batch_id.map(str::to_string),
                )?);
            }
        }
        if !enqueued.is_empty() {
            info!(
                target: "retry_queue",
                count = enqueued.len(),
                batch_id = batch_id.unwrap_or("unknown"),
                "enqueued batch failures"
            );
        }
        Ok(enqueued)
    }

    pub fn get_item(&self, id: &str) -> AppResult<Option<RetryItem>> {
        self.store.get(id)
    }

    pub fn all(&self) -> AppResult<Vec<RetryItem>> {
        self.store.get_all()
    }

    pub fn pending(&self) -> AppResult<Vec<RetryItem>> {
        Ok(self
            .store
            .get_all()?
            .into_iter()
            .filter(|item| item.status == RetryStatus::Pending)
            .collect())
    }

    pub fn history(&self) -> AppResult<Vec<RetryHistoryEntry>> {
        self.store.history()
    }

    pub fn remove_item(&self, id: &str) -> AppResult<bool> {
        self.store.delete(id)
    }

    /// Drops every pending item; items mid-retry are left alone.
    pub fn clear_queue(&self) -> AppResult<usize> {
        let mut removed = 0;
        for item in self.pending()? {
            if self.store.delete(&item.id)? {
                removed += 1;
            }
        }
        info!(target: "retry_queue", removed, "cleared pending items");
        Ok(removed)
    }

    pub fn clear_history(&self) -> AppResult<usize> {
        self.store.clear_history()
    }

    pub fn is_processing(&self) -> bool {
        self.guard.try_lock().is_err()
    }

    pub fn stats(&self) -> AppResult<RetryQueueStats> {
        let items = self.store.get_all()?;
        let history = self.store.history()?;
        let count_items = |status: RetryStatus| items.iter().filter(|i| i.status == status).count();
        let count_history =
            |status: RetryStatus| history.iter().filter(|h| h.item.status == status).count();
        Ok(RetryQueueStats {
            queue_size: items.len(),
            pending: count_items(RetryStatus::Pending),
            retrying: count_items(RetryStatus::Retrying),
            history_size: history.len(),
            total_succeeded: count_history(RetryStatus::Succeeded),
            total_exhausted: count_history(RetryStatus::Exhausted),
            storage: self.store.backend(),
            max_attempts: self.settings.max_attempts,
            backoff_base_seconds: self.settings.backoff_base.as_secs_f64(),
            is_processing: self.is_processing(),
        })
    }

    /// Re-runs one queued lookup with caching disabled. Returns `None` for unknown ids
    /// and for items that are not pending, including ones another worker has claimed.
    pub async fn retry_one(&self, id: &str) -> AppResult<Option<RetryItem>> {
        let Some(current) = self.store.get(id)? else {
            return Ok(None);
        };
        if current.status != RetryStatus::Pending {
            debug!(target: "retry_queue", id, status = current.status.as_str(), "item not pending; skipping");
            return Ok(None);
        }
        let mut item = current.begin_attempt(Utc::now());
        if !self.store.compare_and_put(&current, &item)? {
            info!(target: "retry_queue", id, "item claimed by another worker; skipping");
            return Ok(None);
        }
        info!(
            target: "retry_queue",
            id = %item.id,
            name = %item.request.name,
            attempt = item.attempt_count,
            max_attempts = item.max_attempts,
            "retrying lookup"
        );

        let attempt = self
            .lookup
            .lookup(&item.request, LookupOptions::default().uncached());
        let result = match AssertUnwindSafe(attempt).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(target: "retry_queue", id = %item.id, error = %message, "retry lookup faulted");
                LookupResult::faulted(&item.request, message)
            }
        };

        if result.status.is_resolved() {
            item.status = RetryStatus::Succeeded;
            item.result = Some(RetryOutcome::from(&result));
            item.last_errors.clear();
            self.archive(&item)?;
            info!(target: "retry_queue", id = %item.id, attempt = item.attempt_count, "retry succeeded");
            return Ok(Some(item));
        }

        item.last_errors = result.errors;
        if item.attempt_count >= item.max_attempts {
            item.status = RetryStatus::Exhausted;
            self.archive(&item)?;
            warn!(
                target: "retry_queue",
                id = %item.id,
                name = %item.request.name,
                attempts = item.attempt_count,
                "retries exhausted"
            );
        } else {
            item.status = RetryStatus::Pending;
            item.next_retry_at =
                next_retry_at(self.settings.backoff_base, item.attempt_count, Utc::now());
            self.store.put(&item)?;
            info!(
                target: "retry_queue",
                id = %item.id,
                next_retry_at = %item.next_retry_at,
                "retry still failing"
            );
        }
        Ok(Some(item))
    }

    /// Returns items stuck in `Retrying` past `stale_after` to `Pending`, for example after
    /// a process died mid-retry.
    pub fn recover_stalled(&self) -> AppResult<usize> {
        let now = Utc::now();
        let cutoff = chrono::Duration::from_std(self.settings.stale_after)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut recovered = 0;
        for current in self.store.get_all()? {
            let stalled = current.status == RetryStatus::Retrying
                && current.last_attempt_at.map_or(true, |at| at <= cutoff);
            if !stalled {
                continue;
            }
            let mut next = current.clone();
            next.status = RetryStatus::Pending;
            next.next_retry_at = now;
            next.last_errors.push("retry interrupted before completion".to_string());
            if self.store.compare_and_put(&current, &next)? {
                recovered += 1;
            }
        }
        if recovered > 0 {
            warn!(target: "retry_queue", recovered, "returned stalled retries to the queue");
        }
        Ok(recovered)
    }

    /// Re-drives every pending item, at most `max_concurrent` at a time. Only one run may
    /// be active per queue.
    pub async fn retry_all_pending(&self, max_concurrent: usize) -> AppResult<RetryRun> {
        let Ok(_running) = self.guard.try_lock() else {
            warn!(target: "retry_queue", "retry run already in progress");
            return Ok(RetryRun::AlreadyRunning);
        };

        let pending = self.pending()?;
        if pending.is_empty() {
            return Ok(RetryRun::Completed(RetrySummary::default()));
        }
        info!(target: "retry_queue", count = pending.len(), max_concurrent, "processing pending retries");

        let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
        let attempts = pending.iter().map(|item| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                match self.retry_one(&item.id).await {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        warn!(target: "retry_queue", ?err, id = %item.id, "retry attempt failed");
                        None
                    }
                }
            }
        });

        let mut summary = RetrySummary::default();
        for item in join_all(attempts).await.into_iter().flatten() {
            summary.processed += 1;
            match item.status {
                RetryStatus::Succeeded => summary.succeeded += 1,
                RetryStatus::Exhausted => summary.exhausted += 1,
                RetryStatus::Pending | RetryStatus::Retrying => summary.still_failed += 1,
            }
        }
        info!(
            target: "retry_queue",
            succeeded = summary.succeeded,
            still_failed = summary.still_failed,
            exhausted = summary.exhausted,
            "retry run complete"
        );
        Ok(RetryRun::Completed(summary))
    }

    fn archive(&self, item: &RetryItem) -> AppResult<()> {
        let entry = RetryHistoryEntry {
            item: item.clone(),
            completed_at: Utc::now(),
        };
        self.store.archive(&entry, self.settings.history_max)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::db::open_in_memory;

    /// Fails until `succeed_after` calls have been made.
    struct FlakyLookup {
        calls: AtomicUsize,
        succeed_after: usize,
        gate: Option<Arc<Notify>>,
        delay: Option<Duration>,
    }

    impl FlakyLookup {
        fn new(succeed_after: usize) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                succeed_after,
                gate: None,
                delay: None,
            })
        }

        fn slow(succeed_after: usize, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                succeed_after,
                gate: None,
                delay: Some(delay),
            })
        }
    }

    struct PanickingLookup;

    #[async_trait]
    impl LookupService for PanickingLookup {
        async fn lookup(&self, _request: &LookupRequest, _options: LookupOptions) -> LookupResult {
            panic!("lookup blew up");
        }
    }

    #[async_trait]
    impl LookupService for FlakyLookup {
        async fn lookup(&self, request: &LookupRequest, options: LookupOptions) -> LookupResult {
            assert!(!options.use_cache);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let mut result = LookupResult::for_request(request);
            if call > self.succeed_after {
                result.website = Some("https://found.example".into());
            } else {
                result.errors.push(format!("attempt {call} found nothing"));
            }
            result.finalize(false);
            result
        }
    }

    fn settings() -> RetrySettings {
        RetrySettings {
            max_attempts: 3,
            backoff_base: Duration::from_secs(30),
            history_max: 200,
            stale_after: Duration::from_secs(15 * 60),
        }
    }

    fn stores() -> Vec<Arc<dyn RetryStore>> {
        vec![
            Arc::new(SqliteRetryStore::new(open_in_memory().unwrap())),
            Arc::new(MemoryRetryStore::default()),
        ]
    }

    fn failed(name: &str, status: LookupStatus) -> (LookupRequest, LookupResult) {
        let request = LookupRequest::new(name);
        let mut result = LookupResult::for_request(&request);
        if status == LookupStatus::Error {
            result = LookupResult::faulted(&request, "boom");
        } else if status != LookupStatus::NotFound {
            result.website = Some("https://x.example".into());
            result.finalize(false);
        } else {
            result.finalize(false);
        }
        (request, result)
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let now = Utc::now();
        let base = Duration::from_secs(30);
        let deltas = (0..4)
            .map(|attempt| (next_retry_at(base, attempt, now) - now).num_seconds())
            .collect::<Vec<_>>();
        assert_eq!(deltas, vec![30, 60, 120, 240]);
    }

    #[tokio::test]
    async fn enqueues_only_failures() {
        for store in stores() {
            let queue = RetryQueue::new(store, FlakyLookup::new(0), settings());
            let (requests, results): (Vec<_>, Vec<_>) = [
                failed("a", LookupStatus::NotFound),
                failed("b", LookupStatus::Partial),
                failed("c", LookupStatus::Error),
            ]
            .into_iter()
            .unzip();

            let items = queue
                .enqueue_batch_failures(&results, &requests, Some("batch-1"))
                .unwrap();
            assert_eq!(items.len(), 2);
            assert_eq!(items[0].request.name, "a");
            assert_eq!(items[1].original_status, LookupStatus::Error);
            assert_eq!(items[1].original_errors, vec!["boom".to_string()]);
            assert_eq!(items[0].id.len(), 8);
            assert_eq!(items[0].source_batch_id.as_deref(), Some("batch-1"));
            assert_eq!(
                (items[0].next_retry_at - items[0].created_at).num_seconds(),
                30
            );
            assert_eq!(queue.pending().unwrap().len(), 2);
        }
    }

    #[tokio::test]
    async fn exhausted_items_move_to_history_once() {
        for store in stores() {
            let queue = RetryQueue::new(store, FlakyLookup::new(usize::MAX), settings());
            let item = queue
                .enqueue(LookupRequest::new("Ghost Inn"), LookupStatus::NotFound, vec![], None)
                .unwrap();

            let first = queue.retry_one(&item.id).await.unwrap().unwrap();
            assert_eq!(first.status, RetryStatus::Pending);
            assert_eq!(first.attempt_count, 1);
            let delay = first.next_retry_at - first.last_attempt_at.unwrap();
            assert!((59..=60).contains(&delay.num_seconds()));

            queue.retry_one(&item.id).await.unwrap().unwrap();
            let last = queue.retry_one(&item.id).await.unwrap().unwrap();
            assert_eq!(last.status, RetryStatus::Exhausted);
            assert_eq!(last.attempt_count, 3);

            assert!(queue.pending().unwrap().is_empty());
            assert!(queue.get_item(&item.id).unwrap().is_none());
            assert!(queue.retry_one(&item.id).await.unwrap().is_none());

            let history = queue.history().unwrap();
            assert_eq!(history.iter().filter(|h| h.item.id == item.id).count(), 1);
            assert!(history[0].completed_at >= last.last_attempt_at.unwrap());
            assert_eq!(history[0].item.last_errors, vec!["attempt 3 found nothing".to_string()]);

            let stats = queue.stats().unwrap();
            assert_eq!(stats.total_exhausted, 1);
            assert_eq!(stats.queue_size, 0);
        }
    }

    #[tokio::test]
    async fn successful_retry_keeps_result_snapshot() {
        for store in stores() {
            let queue = RetryQueue::new(store, FlakyLookup::new(1), settings());
            let item = queue
                .enqueue(LookupRequest::new("Late Hotel"), LookupStatus::Error, vec![], None)
                .unwrap();

            queue.retry_one(&item.id).await.unwrap();
            let done = queue.retry_one(&item.id).await.unwrap().unwrap();
            assert_eq!(done.status, RetryStatus::Succeeded);
            assert_eq!(
                done.result.as_ref().and_then(|r| r.website.as_deref()),
                Some("https://found.example")
            );
            assert!(done.last_errors.is_empty());
            assert_eq!(queue.stats().unwrap().total_succeeded, 1);
        }
    }

    #[tokio::test]
    async fn retry_all_summarises_outcomes() {
        for store in stores() {
            let queue = RetryQueue::new(
                store,
                FlakyLookup::new(2),
                RetrySettings {
                    max_attempts: 1,
                    ..settings()
                },
            );
            for name in ["one", "two", "three", "four"] {
                queue
                    .enqueue(LookupRequest::new(name), LookupStatus::NotFound, vec![], None)
                    .unwrap();
            }

            let RetryRun::Completed(summary) = queue.retry_all_pending(2).await.unwrap() else {
                panic!("run rejected");
            };
            assert_eq!(summary.processed, 4);
            assert_eq!(summary.succeeded, 2);
            assert_eq!(summary.exhausted, 2);
            assert_eq!(summary.still_failed, 0);
            assert!(!queue.is_processing());
        }
    }

    #[tokio::test]
    async fn concurrent_runs_are_rejected() {
        let gate = Arc::new(Notify::new());
        let lookup = Arc::new(FlakyLookup {
            calls: AtomicUsize::new(0),
            succeed_after: 0,
            gate: Some(Arc::clone(&gate)),
            delay: None,
        });
        let queue = Arc::new(RetryQueue::new(
            Arc::new(MemoryRetryStore::default()),
            lookup,
            settings(),
        ));
        queue
            .enqueue(LookupRequest::new("Slow Hotel"), LookupStatus::NotFound, vec![], None)
            .unwrap();

        let background = Arc::clone(&queue);
        let first = tokio::spawn(async move { background.retry_all_pending(1).await });
        while !queue.is_processing() {
            tokio::task::yield_now().await;
        }

        assert_eq!(
            queue.retry_all_pending(1).await.unwrap(),
            RetryRun::AlreadyRunning
        );
        assert!(queue.stats().unwrap().is_processing);

        gate.notify_one();
        let run = first.await.unwrap().unwrap();
        assert!(matches!(run, RetryRun::Completed(RetrySummary { succeeded: 1, .. })));
        assert!(!queue.is_processing());
    }

    #[tokio::test]
    async fn overlapping_retries_of_one_item_run_once() {
        for store in stores() {
            let queue = RetryQueue::new(
                store,
                FlakyLookup::slow(usize::MAX, Duration::from_millis(30)),
                RetrySettings {
                    max_attempts: 1,
                    ..settings()
                },
            );
            let item = queue
                .enqueue(LookupRequest::new("Busy Hotel"), LookupStatus::NotFound, vec![], None)
                .unwrap();

            let (a, b) = tokio::join!(queue.retry_one(&item.id), queue.retry_one(&item.id));
            let outcomes = [a.unwrap(), b.unwrap()];
            let ran = outcomes.iter().flatten().collect::<Vec<_>>();
            assert_eq!(ran.len(), 1);
            assert_eq!(ran[0].attempt_count, 1);
            assert_eq!(ran[0].status, RetryStatus::Exhausted);

            let history = queue.history().unwrap();
            assert_eq!(history.iter().filter(|h| h.item.id == item.id).count(), 1);
        }
    }

    #[test]
    fn stale_snapshots_cannot_overwrite_newer_state() {
        for store in stores() {
            let queue = RetryQueue::new(store, FlakyLookup::new(0), settings());
            let item = queue
                .enqueue(LookupRequest::new("Race Inn"), LookupStatus::NotFound, vec![], None)
                .unwrap();

            let claimed = item.begin_attempt(Utc::now());
            assert!(queue.store.compare_and_put(&item, &claimed).unwrap());
            assert!(!queue.store.compare_and_put(&item, &claimed).unwrap());

            let mut requeued = claimed.clone();
            requeued.status = RetryStatus::Pending;
            assert!(queue.store.compare_and_put(&claimed, &requeued).unwrap());
            // Pending again, but one attempt further along than the old snapshot.
            assert!(!queue.store.compare_and_put(&item, &item.begin_attempt(Utc::now())).unwrap());
            assert_eq!(queue.get_item(&item.id).unwrap().unwrap().attempt_count, 1);
        }
    }

    #[tokio::test]
    async fn lookup_panics_count_as_failed_attempts() {
        for store in stores() {
            let queue = RetryQueue::new(store, Arc::new(PanickingLookup), settings());
            let item = queue
                .enqueue(LookupRequest::new("Broken Hotel"), LookupStatus::Error, vec![], None)
                .unwrap();

            let RetryRun::Completed(summary) = queue.retry_all_pending(2).await.unwrap() else {
                panic!("run rejected");
            };
            assert_eq!(summary.still_failed, 1);

            let after = queue.get_item(&item.id).unwrap().unwrap();
            assert_eq!(after.status, RetryStatus::Pending);
            assert_eq!(after.attempt_count, 1);
            assert!(after.last_errors.iter().any(|e| e.contains("lookup blew up")));

            queue.retry_one(&item.id).await.unwrap();
            let last = queue.retry_one(&item.id).await.unwrap().unwrap();
            assert_eq!(last.status, RetryStatus::Exhausted);
            assert!(queue.pending().unwrap().is_empty());
        }
    }

    #[test]
    fn stalled_retries_return_to_pending() {
        for store in stores() {
            let queue = RetryQueue::new(store, FlakyLookup::new(0), settings());
            let abandoned = queue
                .enqueue(LookupRequest::new("Crashed Hotel"), LookupStatus::NotFound, vec![], None)
                .unwrap();
            let active = queue
                .enqueue(LookupRequest::new("Running Hotel"), LookupStatus::NotFound, vec![], None)
                .unwrap();

            let hour_ago = Utc::now() - chrono::Duration::hours(1);
            queue.store.put(&abandoned.begin_attempt(hour_ago)).unwrap();
            queue.store.put(&active.begin_attempt(Utc::now())).unwrap();

            assert_eq!(queue.recover_stalled().unwrap(), 1);
            let recovered = queue.get_item(&abandoned.id).unwrap().unwrap();
            assert_eq!(recovered.status, RetryStatus::Pending);
            assert_eq!(recovered.attempt_count, 1);
            assert_eq!(
                queue.get_item(&active.id).unwrap().unwrap().status,
                RetryStatus::Retrying
            );
            assert_eq!(queue.recover_stalled().unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn history_is_capped_newest_first() {
        for store in stores() {
            let queue = RetryQueue::new(
                store,
                FlakyLookup::new(0),
                RetrySettings {
                    history_max: 2,
                    ..settings()
                },
            );
            let mut ids = Vec::new();
            for name in ["a", "b", "c"] {
                let item = queue
                    .enqueue(LookupRequest::new(name), LookupStatus::NotFound, vec![], None)
                    .unwrap();
                queue.retry_one(&item.id).await.unwrap();
                ids.push(item.id);
            }
            let history = queue.history().unwrap();
            assert_eq!(history.len(), 2);
            assert_eq!(history[0].item.id, ids[2]);
            assert_eq!(history[1].item.id, ids[1]);
            assert_eq!(queue.clear_history().unwrap(), 2);
            assert!(queue.history().unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn management_operations_behave_the_same_on_both_backends() {
        for store in stores() {
            let queue = RetryQueue::new(store, FlakyLookup::new(0), settings());
            let keep = queue
                .enqueue(LookupRequest::new("keep"), LookupStatus::NotFound, vec![], None)
                .unwrap();
            let dropped = queue
                .enqueue(LookupRequest::new("drop"), LookupStatus::NotFound, vec![], None)
                .unwrap();

            assert!(queue.remove_item(&dropped.id).unwrap());
            assert!(!queue.remove_item(&dropped.id).unwrap());
            assert_eq!(queue.all().unwrap(), vec![keep.clone()]);

            let mut retrying = keep.clone();
            retrying.status = RetryStatus::Retrying;
            queue.store.put(&retrying).unwrap();
            queue
                .enqueue(LookupRequest::new("gone"), LookupStatus::Error, vec![], None)
                .unwrap();

            assert_eq!(queue.clear_queue().unwrap(), 1);
            let stats = queue.stats().unwrap();
            assert_eq!(stats.queue_size, 1);
            assert_eq!(stats.retrying, 1);
            assert_eq!(stats.pending, 0);
            assert_eq!(stats.max_attempts, 3);
            assert_eq!(stats.backoff_base_seconds, 30.0);
        }
    }
}
