use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupStatus {
    Success,
    Partial,
    NotFound,
    Error,
}

impl LookupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LookupStatus::Success => "success",
            LookupStatus::Partial => "partial",
            LookupStatus::NotFound => "not_found",
            LookupStatus::Error => "error",
        }
    }

    /// NotFound and Error results are the ones worth re-driving later.
    pub fn is_failure(&self) -> bool {
        matches!(self, LookupStatus::NotFound | LookupStatus::Error)
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, LookupStatus::Success | LookupStatus::Partial)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupRequest {
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub postcode: Option<String>,
}

impl LookupRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: None,
            city: None,
            postcode: None,
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_city(mut self, city: impl Into<String>) -> Self {
        self.city = Some(city.into());
        self
    }

    pub fn with_postcode(mut self, postcode: impl Into<String>) -> Self {
        self.postcode = Some(postcode.into());
        self
    }

    /// Cache identity of the request. Case and whitespace differences in the name or
    /// address collapse to the same key; city and postcode do not participate.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(normalize_key_part(&self.name).as_bytes());
        if let Some(address) = self.address.as_deref().map(normalize_key_part) {
            if !address.is_empty() {
                hasher.update(b"|");
                hasher.update(address.as_bytes());
            }
        }
        URL_SAFE_NO_PAD.encode(&hasher.finalize()[..16])
    }

    /// Address, city and postcode joined for display and prompting.
    pub fn display_address(&self) -> Option<String> {
        let parts = [&self.address, &self.city, &self.postcode]
            .into_iter()
            .filter_map(|part| part.as_deref())
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(", "))
        }
    }
}

fn normalize_key_part(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupResult {
    pub search_name: String,
    #[serde(default)]
    pub search_address: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub rooms_min: Option<u32>,
    #[serde(default)]
    pub rooms_max: Option<u32>,
    #[serde(default)]
    pub source_notes: Option<String>,
    #[serde(default)]
    pub website_source: Option<String>,
    #[serde(default)]
    pub phone_source: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    pub status: LookupStatus,
    #[serde(default)]
    pub errors: Vec<String>,
    pub last_checked: DateTime<Utc>,
    #[serde(default)]
    pub from_cache: bool,
}

impl LookupResult {
    pub fn for_request(request: &LookupRequest) -> Self {
        Self {
            search_name: request.name.clone(),
            search_address: request.display_address(),
            website: None,
            phone: None,
            rooms_min: None,
            rooms_max: None,
            source_notes: None,
            website_source: None,
            phone_source: None,
            confidence: None,
            status: LookupStatus::NotFound,
            errors: Vec::new(),
            last_checked: Utc::now(),
            from_cache: false,
        }
    }

    /// Placeholder for a slot whose task faulted outside the orchestrator.
    pub fn faulted(request: &LookupRequest, message: impl Into<String>) -> Self {
        let mut result = Self::for_request(request);
        result.errors.push(message.into());
        result.finalize(true);
        result
    }

    pub fn has_website(&self) -> bool {
        self.website.is_some()
    }

    pub fn has_phone(&self) -> bool {
        self.phone.is_some()
    }

    pub fn has_rooms(&self) -> bool {
        self.rooms_min.is_some() || self.rooms_max.is_some()
    }

    pub fn found_count(&self) -> usize {
        [self.has_website(), self.has_phone(), self.has_rooms()]
            .into_iter()
            .filter(|present| *present)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.found_count() == 0
    }

    /// Assigns the terminal status from the populated fields.
    pub fn finalize(&mut self, faulted: bool) {
        self.status = derive_status(self.found_count(), faulted);
    }

    pub fn raise_confidence(&mut self, candidate: Option<f64>) {
        let Some(candidate) = candidate.map(|c| c.clamp(0.0, 1.0)) else {
            return;
        };
        match self.confidence {
            Some(current) if current >= candidate => {}
            _ => self.confidence = Some(candidate),
        }
    }
}

pub fn derive_status(found: usize, faulted: bool) -> LookupStatus {
    if faulted {
        return LookupStatus::Error;
    }
    match found {
        0 => LookupStatus::NotFound,
        n if n >= 3 => LookupStatus::Success,
        _ => LookupStatus::Partial,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub batch_id: String,
    pub total_requested: usize,
    pub successful: usize,
    pub partial: usize,
    pub failed: usize,
    pub processing_time_seconds: f64,
    pub enqueued_for_retry: usize,
    pub results: Vec<LookupResult>,
}

impl BatchSummary {
    pub fn from_results(
        batch_id: String,
        results: Vec<LookupResult>,
        processing_time_seconds: f64,
    ) -> Self {
        let count = |status: LookupStatus| results.iter().filter(|r| r.status == status).count();
        Self {
            batch_id,
            total_requested: results.len(),
            successful: count(LookupStatus::Success),
            partial: count(LookupStatus::Partial),
            failed: results.iter().filter(|r| r.status.is_failure()).count(),
            processing_time_seconds,
            enqueued_for_retry: 0,
            results,
        }
    }
}
