use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::FutureExt;
use tracing::{debug, error, info, warn};

use crate::cache::CacheStore;
use crate::config::AppConfig;
use crate::content::{
    detect_parking, ContentExtractor, ContentFetcher, Extraction, ExtractionHints, MatchVerifier,
};
use crate::errors::AppResult;
use crate::models::{LookupRequest, LookupResult};
use crate::providers::{Candidate, ProviderChain, SearchOutcome, SearchProvider, SearchQuery};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupOptions {
    pub use_cache: bool,
    pub skip_deep_scrape: bool,
}

impl Default for LookupOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            skip_deep_scrape: false,
        }
    }
}

impl LookupOptions {
    pub fn fast() -> Self {
        Self {
            skip_deep_scrape: true,
            ..Self::default()
        }
    }

    pub fn uncached(self) -> Self {
        Self {
            use_cache: false,
            ..self
        }
    }
}

/// Resolves one request to a terminal result. Implementations never fail; faults are
/// folded into an `Error` status.
#[async_trait]
pub trait LookupService: Send + Sync {
    async fn lookup(&self, request: &LookupRequest, options: LookupOptions) -> LookupResult;
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub cache_ttl: Duration,
    pub mismatch_threshold: f64,
}

impl OrchestratorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            cache_ttl: config.cache_ttl(),
            mismatch_threshold: config.verification_mismatch_threshold,
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(24 * 60 * 60),
            mismatch_threshold: 0.5,
        }
    }
}

enum ChainEnd {
    Continue,
    Terminate,
}

pub struct LookupOrchestrator {
    providers: ProviderChain,
    fetcher: Arc<dyn ContentFetcher>,
    extractor: Arc<dyn ContentExtractor>,
    verifier: Arc<dyn MatchVerifier>,
    cache: Arc<dyn CacheStore>,
    settings: OrchestratorSettings,
}

impl LookupOrchestrator {
    pub fn new(
        providers: ProviderChain,
        fetcher: Arc<dyn ContentFetcher>,
        extractor: Arc<dyn ContentExtractor>,
        verifier: Arc<dyn MatchVerifier>,
        cache: Arc<dyn CacheStore>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            providers,
            fetcher,
            extractor,
            verifier,
            cache,
            settings,
        }
    }

    async fn run_chain(
        &self,
        request: &LookupRequest,
        options: LookupOptions,
        result: &mut LookupResult,
    ) -> AppResult<()> {
        let query = SearchQuery::from(request);

        if let Some(candidate) = self.consult(&self.providers.primary, &query, result).await {
            merge_candidate(result, &candidate, self.providers.primary.kind().label());
        }

        if !result.is_empty() {
            if options.skip_deep_scrape || result.found_count() == 3 {
                return Ok(());
            }
            if let Some(website) = result.website.clone() {
                self.deep_scrape(request, &website, result).await?;
            }
        } else if options.skip_deep_scrape {
            debug!(target: "lookup", name = %request.name, "primary search empty; fast mode stops here");
            return Ok(());
        } else if let ChainEnd::Terminate = self.fallback_chain(request, &query, result).await? {
            return Ok(());
        }

        if !result.has_rooms() {
            if let Some(candidate) = self
                .consult(&self.providers.planning_portal, &query, result)
                .await
            {
                merge_candidate(result, &candidate, self.providers.planning_portal.kind().label());
            }
        }
        Ok(())
    }

    /// Fills gaps left by the primary search from the discovered website.
    async fn deep_scrape(
        &self,
        request: &LookupRequest,
        website: &str,
        result: &mut LookupResult,
    ) -> AppResult<()> {
        let page = match self.fetcher.fetch(website).await {
            Ok(page) => page,
            Err(err) => {
                warn!(target: "lookup", %err, website, "deep scrape fetch failed");
                result.errors.push(format!("Failed to scrape website {website}: {err}"));
                return Ok(());
            }
        };
        let hints = hints_for(request, result);
        let extraction = self.extractor.extract(&page.text, &hints).await?;
        apply_extraction(result, &extraction, &page.url);
        Ok(())
    }

    async fn fallback_chain(
        &self,
        request: &LookupRequest,
        query: &SearchQuery,
        result: &mut LookupResult,
    ) -> AppResult<ChainEnd> {
        let web_label = self.providers.fallback_web.kind().label();
        let found = self.consult(&self.providers.fallback_web, query, result).await;
        if let Some(candidate) = &found {
            merge_candidate(result, candidate, web_label);
        }
        let Some(website) = result.website.clone() else {
            self.try_booking_site(query, result).await;
            return Ok(ChainEnd::Continue);
        };

        let page = match self.fetcher.fetch(&website).await {
            Ok(page) => page,
            Err(err) => {
                warn!(target: "lookup", %err, %website, "fallback scrape failed");
                result.errors.push(format!("Failed to scrape website {website}: {err}"));
                self.try_booking_site(query, result).await;
                return Ok(ChainEnd::Continue);
            }
        };

        let parking = detect_parking(&page);
        if parking.is_parked {
            warn!(target: "lookup", %website, indicators = ?parking.indicators, "website looks parked");
            let shown = parking
                .indicators
                .iter()
                .take(3)
                .copied()
                .collect::<Vec<_>>()
                .join(", ");
            result.errors.push(format!(
                "Website appears to be a parked domain; the business may have closed. Indicators: {shown}"
            ));
            clear_website(result);
            self.try_booking_site(query, result).await;
            return Ok(ChainEnd::Continue);
        }

        let address = request.display_address();
        let verdict = self
            .verifier
            .verify(&request.name, address.as_deref(), &page)
            .await?;
        if verdict.is_confident_mismatch(self.settings.mismatch_threshold) {
            info!(
                target: "lookup",
                %website,
                confidence = verdict.confidence,
                "website does not match entity; trying booking sites"
            );
            result
                .errors
                .push(format!("Website may not match entity: {}", verdict.reason));
            clear_website(result);
            if self.try_booking_site(query, result).await {
                return Ok(ChainEnd::Continue);
            }
            result
                .errors
                .push("Could not find entity information from any source".to_string());
            return Ok(ChainEnd::Terminate);
        }
        if !verdict.is_match {
            // Still worth extracting from, but not the entity's own site.
            result.errors.push(format!(
                "Website match uncertain ({:.2}): {}",
                verdict.confidence, verdict.reason
            ));
            clear_website(result);
        }

        let hints = hints_for(request, result);
        let extraction = self.extractor.extract(&page.text, &hints).await?;
        apply_extraction(result, &extraction, &page.url);
        if !result.has_rooms() {
            self.try_booking_site(query, result).await;
        }
        Ok(ChainEnd::Continue)
    }

    async fn try_booking_site(&self, query: &SearchQuery, result: &mut LookupResult) -> bool {
        let Some(candidate) = self
            .consult(&self.providers.booking_site, query, result)
            .await
        else {
            return false;
        };
        let source = candidate
            .source
            .clone()
            .unwrap_or_else(|| self.providers.booking_site.kind().label().to_string());
        merge_candidate(result, &candidate, &source);
        if candidate.has_rooms() {
            result.errors.push(format!("Room count sourced from {source}"));
        }
        true
    }

    /// Runs one source; exhausted transient faults become a diagnostic rather than a fault.
    async fn consult(
        &self,
        provider: &Arc<dyn SearchProvider>,
        query: &SearchQuery,
        result: &mut LookupResult,
    ) -> Option<Candidate> {
        match provider.search(query).await {
            SearchOutcome::Found(candidate) => Some(candidate),
            SearchOutcome::Empty => None,
            SearchOutcome::Fault(err) => {
                let label = provider.kind().label();
                warn!(target: "lookup", %err, source = label, name = %query.name, "source unavailable");
                result.errors.push(format!("{label} unavailable: {err}"));
                None
            }
        }
    }
}

#[async_trait]
impl LookupService for LookupOrchestrator {
    async fn lookup(&self, request: &LookupRequest, options: LookupOptions) -> LookupResult {
        let fingerprint = request.fingerprint();
        if options.use_cache {
            if let Some(hit) = self.cache.get(&fingerprint).await {
                info!(target: "lookup", name = %request.name, status = hit.status.as_str(), "served from cache");
                return hit;
            }
        }

        let mut result = LookupResult::for_request(request);
        let outcome = AssertUnwindSafe(self.run_chain(request, options, &mut result))
            .catch_unwind()
            .await;
        let fault = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err.to_string()),
            Err(payload) => Some(panic_message(payload.as_ref())),
        };
        result.last_checked = Utc::now();

        if let Some(message) = fault {
            error!(target: "lookup", name = %request.name, error = %message, "lookup faulted");
            result.errors.push(message);
            result.finalize(true);
            return result;
        }

        result.finalize(false);
        info!(
            target: "lookup",
            name = %request.name,
            status = result.status.as_str(),
            found = result.found_count(),
            "lookup complete"
        );
        if options.use_cache {
            self.cache
                .set(&fingerprint, &result, self.settings.cache_ttl)
                .await;
        }
        result
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .map(|msg| format!("internal fault: {msg}"))
        .unwrap_or_else(|| "internal fault".to_string())
}

fn hints_for(request: &LookupRequest, result: &LookupResult) -> ExtractionHints {
    ExtractionHints {
        entity_name: request.name.clone(),
        address: request.display_address(),
        need_website: !result.has_website(),
        need_phone: !result.has_phone(),
        need_rooms: !result.has_rooms(),
    }
}

fn clear_website(result: &mut LookupResult) {
    result.website = None;
    result.website_source = None;
}

/// Fills only the fields still missing; existing values are never overwritten.
fn merge_candidate(result: &mut LookupResult, candidate: &Candidate, source: &str) {
    let mut applied = false;
    if result.website.is_none() {
        if let Some(website) = &candidate.website {
            result.website = Some(website.clone());
            result.website_source = Some(source.to_string());
            applied = true;
        }
    }
    if result.phone.is_none() {
        if let Some(phone) = &candidate.phone {
            result.phone = Some(phone.clone());
            result.phone_source = Some(source.to_string());
            applied = true;
        }
    }
    if !result.has_rooms() && candidate.has_rooms() {
        result.rooms_min = candidate.rooms_min;
        result.rooms_max = candidate.rooms_max;
        applied = true;
        if result.source_notes.is_none() {
            result.source_notes = candidate.notes.clone();
        }
    }
    if applied {
        result.raise_confidence(candidate.confidence);
    }
}

fn apply_extraction(result: &mut LookupResult, extraction: &Extraction, page_url: &str) {
    let mut applied = false;
    if result.website.is_none() {
        if let Some(website) = &extraction.website {
            result.website = Some(website.clone());
            result.website_source = Some(page_url.to_string());
            applied = true;
        }
    }
    if result.phone.is_none() {
        if let Some(phone) = &extraction.phone {
            result.phone = Some(phone.clone());
            result.phone_source = Some(page_url.to_string());
            applied = true;
        }
    }
    if !result.has_rooms() && (extraction.rooms_min.is_some() || extraction.rooms_max.is_some()) {
        result.rooms_min = extraction.rooms_min;
        result.rooms_max = extraction.rooms_max;
        applied = true;
        if result.source_notes.is_none() {
            result.source_notes = extraction.notes.clone();
        }
    }
    if applied {
        result.raise_confidence(Some(extraction.confidence));
    }
}
