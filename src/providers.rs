use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::limiter::{ConcurrencyLimiter, ProviderError};
use crate::models::LookupRequest;

const API_KEY_HEADER: &str = "X-Api-Key";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Grounded,
    FallbackWeb,
    BookingSite,
    PlanningPortal,
}

impl SourceKind {
    pub fn label(&self) -> &'static str {
        match self {
            SourceKind::Grounded => "Grounded search",
            SourceKind::FallbackWeb => "Web search",
            SourceKind::BookingSite => "Booking site",
            SourceKind::PlanningPortal => "Planning portal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchQuery {
    pub name: String,
    pub address: Option<String>,
    pub city: Option<String>,
    pub postcode: Option<String>,
}

impl From<&LookupRequest> for SearchQuery {
    fn from(request: &LookupRequest) -> Self {
        Self {
            name: request.name.clone(),
            address: request.address.clone(),
            city: request.city.clone(),
            postcode: request.postcode.clone(),
        }
    }
}

/// What a source claims to know about an entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    #[serde(default, alias = "official_website")]
    pub website: Option<String>,
    #[serde(default, alias = "uk_contact_phone")]
    pub phone: Option<String>,
    #[serde(default)]
    pub rooms_min: Option<u32>,
    #[serde(default)]
    pub rooms_max: Option<u32>,
    #[serde(default, alias = "rooms_source_notes")]
    pub notes: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub source: Option<String>,
}

impl Candidate {
    pub fn has_rooms(&self) -> bool {
        self.rooms_min.is_some() || self.rooms_max.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.website.is_none() && self.phone.is_none() && !self.has_rooms()
    }

    fn cleaned(mut self) -> Self {
        self.website = self.website.and_then(non_blank);
        self.phone = self.phone.and_then(non_blank);
        self.notes = self.notes.and_then(non_blank);
        self.confidence = self.confidence.map(|c| c.clamp(0.0, 1.0));
        if let (Some(min), Some(max)) = (self.rooms_min, self.rooms_max) {
            if min > max {
                self.rooms_min = Some(max);
                self.rooms_max = Some(min);
            }
        }
        self
    }
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("null") {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SearchOutcome {
    Found(Candidate),
    Empty,
    Fault(ProviderError),
}

impl SearchOutcome {
    pub fn from_candidate(candidate: Option<Candidate>) -> Self {
        match candidate.map(Candidate::cleaned) {
            Some(candidate) if !candidate.is_empty() => SearchOutcome::Found(candidate),
            _ => SearchOutcome::Empty,
        }
    }
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    fn kind(&self) -> SourceKind;
    async fn search(&self, query: &SearchQuery) -> SearchOutcome;
}

/// A search capability whose client library blocks the calling thread.
pub trait BlockingSearch: Send + Sync + 'static {
    fn search_blocking(&self, query: &SearchQuery) -> Result<Option<Candidate>, ProviderError>;
}

/// Primary, agent-backed search. Calls go through the shared limiter.
pub struct GroundedSearch {
    client: Arc<dyn BlockingSearch>,
    limiter: Arc<ConcurrencyLimiter>,
}

impl GroundedSearch {
    pub fn new(client: Arc<dyn BlockingSearch>, limiter: Arc<ConcurrencyLimiter>) -> Self {
        Self { client, limiter }
    }
}

#[async_trait]
impl SearchProvider for GroundedSearch {
    fn kind(&self) -> SourceKind {
        SourceKind::Grounded
    }

    async fn search(&self, query: &SearchQuery) -> SearchOutcome {
        let client = Arc::clone(&self.client);
        let owned = query.clone();
        match self
            .limiter
            .run("grounded_search", move || client.search_blocking(&owned))
            .await
        {
            Ok(candidate) => SearchOutcome::from_candidate(candidate),
            Err(err) if err.is_retryable() => SearchOutcome::Fault(err),
            Err(err) => {
                warn!(target: "lookup", %err, name = %query.name, "grounded search unavailable");
                SearchOutcome::Empty
            }
        }
    }
}

thread_local! {
    static AGENT_HTTP: once_cell::unsync::OnceCell<reqwest::blocking::Client> =
        once_cell::unsync::OnceCell::new();
}

/// Blocking HTTP client for a grounding agent endpoint. The agent replies with a JSON
/// object, optionally wrapped in a markdown code fence.
pub struct HttpAgentSearch {
    endpoint: String,
    api_key: Option<SecretString>,
    timeout: Duration,
}

impl HttpAgentSearch {
    pub fn new(endpoint: String, api_key: Option<SecretString>, timeout: Duration) -> Self {
        Self {
            endpoint,
            api_key,
            timeout,
        }
    }

    fn post(
        &self,
        http: &reqwest::blocking::Client,
        query: &SearchQuery,
    ) -> Result<Option<Candidate>, ProviderError> {
        let mut request = http.post(&self.endpoint).json(query);
        if let Some(key) = &self.api_key {
            request = request.header(API_KEY_HEADER, key.expose_secret());
        }
        let response = request.send()?;
        let status = response.status();
        if status == StatusCode::NO_CONTENT || status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let detail = response.text().unwrap_or_default();
            return Err(ProviderError::from_status(status, detail));
        }
        let body = response.text()?;
        parse_agent_response(&body)
    }
}

impl BlockingSearch for HttpAgentSearch {
    fn search_blocking(&self, query: &SearchQuery) -> Result<Option<Candidate>, ProviderError> {
        // Each pool thread keeps its own client; blocking clients must not be dropped
        // on async scheduler threads.
        AGENT_HTTP.with(|cell| {
            let http = cell
                .get_or_try_init(|| {
                    reqwest::blocking::Client::builder()
                        .timeout(self.timeout)
                        .build()
                })
                .map_err(|err| ProviderError::Config(err.to_string()))?;
            self.post(http, query)
        })
    }
}

pub fn parse_agent_response(body: &str) -> Result<Option<Candidate>, ProviderError> {
    let text = strip_code_fence(body.trim());
    if text.is_empty() || text == "null" || text == "{}" {
        return Ok(None);
    }
    match serde_json::from_str::<Candidate>(text) {
        Ok(candidate) => Ok(Some(candidate)),
        Err(first) => {
            let embedded = text
                .find('{')
                .zip(text.rfind('}'))
                .filter(|(start, end)| start < end)
                .map(|(start, end)| &text[start..=end]);
            match embedded.map(serde_json::from_str::<Candidate>) {
                Some(Ok(candidate)) => Ok(Some(candidate)),
                _ => Err(ProviderError::Malformed(first.to_string())),
            }
        }
    }
}

fn strip_code_fence(text: &str) -> &str {
    let text = text
        .strip_prefix("```json")
        .or_else(|| text.strip_prefix("```"))
        .unwrap_or(text);
    text.strip_suffix("```").unwrap_or(text).trim()
}

/// JSON-over-HTTP source used for the fallback web search, booking-site and planning
/// portal lookups.
pub struct HttpSearchProvider {
    kind: SourceKind,
    endpoint: String,
    api_key: Option<SecretString>,
    http: reqwest::Client,
}

impl HttpSearchProvider {
    pub fn new(
        kind: SourceKind,
        endpoint: String,
        api_key: Option<SecretString>,
        timeout: Duration,
    ) -> AppResult<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            kind,
            endpoint,
            api_key,
            http,
        })
    }

    pub fn fallback_web(
        endpoint: String,
        api_key: Option<SecretString>,
        timeout: Duration,
    ) -> AppResult<Self> {
        Self::new(SourceKind::FallbackWeb, endpoint, api_key, timeout)
    }

    pub fn booking_site(
        endpoint: String,
        api_key: Option<SecretString>,
        timeout: Duration,
    ) -> AppResult<Self> {
        Self::new(SourceKind::BookingSite, endpoint, api_key, timeout)
    }

    pub fn planning_portal(
        endpoint: String,
        api_key: Option<SecretString>,
        timeout: Duration,
    ) -> AppResult<Self> {
        Self::new(SourceKind::PlanningPortal, endpoint, api_key, timeout)
    }

    async fn fetch(&self, query: &SearchQuery) -> Result<Option<Candidate>, ProviderError> {
        let mut request = self.http.post(&self.endpoint).json(query);
        if let Some(key) = &self.api_key {
            request = request.header(API_KEY_HEADER, key.expose_secret());
        }
        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::NO_CONTENT || status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, detail));
        }
        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str::<Option<Candidate>>(&body)
            .map_err(|err| ProviderError::Malformed(err.to_string()))
    }
}

#[async_trait]
impl SearchProvider for HttpSearchProvider {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn search(&self, query: &SearchQuery) -> SearchOutcome {
        match self.fetch(query).await {
            Ok(candidate) => {
                let outcome = SearchOutcome::from_candidate(candidate);
                debug!(
                    target: "lookup",
                    source = self.kind.label(),
                    found = matches!(outcome, SearchOutcome::Found(_)),
                    "search completed"
                );
                outcome
            }
            Err(err) => {
                warn!(target: "lookup", %err, source = self.kind.label(), "search failed");
                SearchOutcome::Fault(err)
            }
        }
    }
}

/// Stand-in for a source with no endpoint configured.
pub struct DisabledProvider(pub SourceKind);

#[async_trait]
impl SearchProvider for DisabledProvider {
    fn kind(&self) -> SourceKind {
        self.0
    }

    async fn search(&self, _query: &SearchQuery) -> SearchOutcome {
        SearchOutcome::Empty
    }
}

#[derive(Clone)]
pub struct ProviderChain {
    pub primary: Arc<dyn SearchProvider>,
    pub fallback_web: Arc<dyn SearchProvider>,
    pub booking_site: Arc<dyn SearchProvider>,
    pub planning_portal: Arc<dyn SearchProvider>,
}

impl ProviderChain {
    pub fn from_config(config: &AppConfig, limiter: Arc<ConcurrencyLimiter>) -> AppResult<Self> {
        let key = config.search_api_key.clone();
        let timeout = config.scrape_timeout();

        let primary: Arc<dyn SearchProvider> = match &config.grounded_search_endpoint {
            Some(endpoint) => Arc::new(GroundedSearch::new(
                Arc::new(HttpAgentSearch::new(
                    endpoint.clone(),
                    key.clone(),
                    config.search_timeout(),
                )),
                limiter,
            )),
            None => Arc::new(DisabledProvider(SourceKind::Grounded)),
        };

        Ok(Self {
            primary,
            fallback_web: http_or_disabled(
                SourceKind::FallbackWeb,
                &config.web_search_endpoint,
                &key,
                timeout,
            )?,
            booking_site: http_or_disabled(
                SourceKind::BookingSite,
                &config.booking_search_endpoint,
                &key,
                timeout,
            )?,
            planning_portal: http_or_disabled(
                SourceKind::PlanningPortal,
                &config.planning_portal_endpoint,
                &key,
                timeout,
            )?,
        })
    }
}

fn http_or_disabled(
    kind: SourceKind,
    endpoint: &Option<String>,
    key: &Option<SecretString>,
    timeout: Duration,
) -> AppResult<Arc<dyn SearchProvider>> {
    Ok(match endpoint {
        Some(endpoint) => Arc::new(HttpSearchProvider::new(
            kind,
            endpoint.clone(),
            key.clone(),
            timeout,
        )?),
        None => Arc::new(DisabledProvider(kind)),
    })
}
