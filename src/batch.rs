use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::models::{LookupRequest, LookupResult, LookupStatus};
use crate::orchestrator::{LookupOptions, LookupService};

pub type ProgressObserver = Arc<dyn Fn(BatchProgress) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct BatchProgress {
    pub completed: usize,
    pub total: usize,
    pub name: String,
    pub status: LookupStatus,
}

#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    pub max_concurrent: usize,
    pub lookup: LookupOptions,
}

impl BatchOptions {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            lookup: LookupOptions::default(),
        }
    }

    pub fn with_lookup(mut self, lookup: LookupOptions) -> Self {
        self.lookup = lookup;
        self
    }
}

#[derive(Clone)]
pub struct BatchExecutor {
    lookup: Arc<dyn LookupService>,
}

impl BatchExecutor {
    pub fn new(lookup: Arc<dyn LookupService>) -> Self {
        Self { lookup }
    }

    /// Runs every request with at most `max_concurrent` lookups in flight. The returned
    /// results line up index-for-index with `requests`.
    ///
    /// Progress normally fires as each lookup finishes. A task that dies outside the lookup
    /// itself is only reported when the in-order join reaches it, so `completed` can arrive
    /// at the observer out of completion order in that case.
    pub async fn run_batch(
        &self,
        requests: &[LookupRequest],
        options: BatchOptions,
        observer: Option<ProgressObserver>,
    ) -> Vec<LookupResult> {
        let total = requests.len();
        if total == 0 {
            return Vec::new();
        }
        let max_concurrent = options.max_concurrent.max(1);
        info!(target: "batch", total, max_concurrent, fast = options.lookup.skip_deep_scrape, "starting batch");

        let semaphore = Arc::new(Semaphore::new(max_concurrent));
        let completed = Arc::new(AtomicUsize::new(0));

        let handles = requests
            .iter()
            .cloned()
            .map(|request| {
                let lookup = Arc::clone(&self.lookup);
                let semaphore = Arc::clone(&semaphore);
                let completed = Arc::clone(&completed);
                let observer = observer.clone();
                tokio::spawn(async move {
                    let result = match semaphore.acquire_owned().await {
                        Ok(_permit) => lookup.lookup(&request, options.lookup).await,
                        Err(_) => LookupResult::faulted(&request, "batch semaphore closed"),
                    };
                    let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                    notify(observer.as_ref(), done, total, &result);
                    result
                })
            })
            .collect::<Vec<_>>();

        let mut results = Vec::with_capacity(total);
        for (request, handle) in requests.iter().zip(handles) {
            match handle.await {
                Ok(result) => results.push(result),
                Err(join_err) => {
                    error!(target: "batch", name = %request.name, %join_err, "lookup task failed");
                    let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                    let placeholder = LookupResult::faulted(
                        request,
                        format!("lookup task failed: {join_err}"),
                    );
                    notify(observer.as_ref(), done, total, &placeholder);
                    results.push(placeholder);
                }
            }
        }

        info!(
            target: "batch",
            total,
            failed = results.iter().filter(|r| r.status.is_failure()).count(),
            "batch finished"
        );
        results
    }
}

fn notify(observer: Option<&ProgressObserver>, completed: usize, total: usize, result: &LookupResult) {
    let Some(callback) = observer else {
        return;
    };
    debug!(target: "batch", completed, total, name = %result.search_name, "lookup finished");
    let progress = BatchProgress {
        completed,
        total,
        name: result.search_name.clone(),
        status: result.status,
    };
    if panic::catch_unwind(AssertUnwindSafe(|| callback(progress))).is_err() {
        warn!(target: "batch", completed, total, "progress observer panicked; ignoring");
    }
}
