use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{ACCEPT, USER_AGENT};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};

const MAX_TEXT_CHARS: usize = 15_000;
const MIN_VERIFIABLE_CHARS: usize = 100;
const SPARSE_PAGE_WORDS: usize = 100;
const BROWSER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

const PARKING_INDICATORS: &[&str] = &[
    "domain parking",
    "parked domain",
    "domain for sale",
    "buy this domain",
    "domain is for sale",
    "fasthosts",
    "godaddy parking",
    "sedoparking",
    "hugedomains",
    "dan.com",
    "undeveloped.com",
    "afternic",
    "website coming soon",
    "under construction",
    "parked free",
    "domain expired",
    "this site is not available",
    "get your own domain",
    "register this domain",
];

const PARKING_TITLE_HINTS: &[&str] = &["parking", "for sale", "coming soon"];

static STRIPPED_BLOCKS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?is)<(script|style|nav|header|footer|aside|form|noscript)\b[^>]*>.*?</(script|style|nav|header|footer|aside|form|noscript)\s*>",
    )
    .expect("valid block pattern")
});
static TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]+>").expect("valid tag pattern"));
static TITLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("valid title pattern"));

#[derive(Debug, Clone, PartialEq)]
pub struct ScrapedPage {
    pub url: String,
    pub html: String,
    pub text: String,
}

impl ScrapedPage {
    pub fn from_html(url: impl Into<String>, html: impl Into<String>) -> Self {
        let html = html.into();
        let text = extract_text(&html);
        Self {
            url: url.into(),
            html,
            text,
        }
    }

    pub fn title(&self) -> Option<String> {
        TITLE
            .captures(&self.html)
            .and_then(|caps| caps.get(1))
            .map(|m| collapse_whitespace(&decode_entities(m.as_str())))
            .filter(|title| !title.is_empty())
    }
}

#[async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> AppResult<ScrapedPage>;
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractionHints {
    pub entity_name: String,
    pub address: Option<String>,
    pub need_website: bool,
    pub need_phone: bool,
    pub need_rooms: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
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
    pub confidence: f64,
}

/// Pulls structured fields out of page text. "Nothing found" is an empty extraction, not
/// an error.
#[async_trait]
pub trait ContentExtractor: Send + Sync {
    async fn extract(&self, content: &str, hints: &ExtractionHints) -> AppResult<Extraction>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    pub is_match: bool,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub reason: String,
}

impl Verification {
    fn assumed(confidence: f64, reason: &str) -> Self {
        Self {
            is_match: true,
            confidence,
            reason: reason.to_string(),
        }
    }

    /// A mismatch only counts when the verifier is sure enough about it.
    pub fn is_confident_mismatch(&self, threshold: f64) -> bool {
        !self.is_match && self.confidence > threshold
    }
}

#[async_trait]
pub trait MatchVerifier: Send + Sync {
    async fn verify(
        &self,
        entity_name: &str,
        address: Option<&str>,
        page: &ScrapedPage,
    ) -> AppResult<Verification>;
}

pub struct HttpContentFetcher {
    http: reqwest::Client,
}

impl HttpContentFetcher {
    pub fn new(timeout: Duration) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl ContentFetcher for HttpContentFetcher {
    async fn fetch(&self, url: &str) -> AppResult<ScrapedPage> {
        let response = self
            .http
            .get(url)
            .header(USER_AGENT, BROWSER_AGENT)
            .header(ACCEPT, "text/html,application/xhtml+xml")
            .send()
            .await?
            .error_for_status()?;
        let final_url = response.url().to_string();
        let html = response.text().await?;
        debug!(target: "lookup", url = %final_url, bytes = html.len(), "fetched page");
        Ok(ScrapedPage::from_html(final_url, html))
    }
}

/// Client for the AI extraction service, which also answers verification questions.
pub struct RemoteExtractor {
    endpoint: Option<String>,
    api_key: Option<SecretString>,
    http: reqwest::Client,
}

impl RemoteExtractor {
    pub fn new(
        endpoint: Option<String>,
        api_key: Option<SecretString>,
        timeout: Duration,
    ) -> AppResult<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint: endpoint.map(|e| e.trim_end_matches('/').to_string()),
            api_key,
            http,
        })
    }

    pub fn from_config(config: &AppConfig) -> AppResult<Self> {
        Self::new(
            config.extractor_endpoint.clone(),
            config.extractor_api_key.clone(),
            config.search_timeout(),
        )
    }

    pub fn is_configured(&self) -> bool {
        self.endpoint.is_some()
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        path: &str,
        body: serde_json::Value,
    ) -> AppResult<Option<T>> {
        let mut request = self.http.post(format!("{endpoint}/{path}")).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AppError::Extraction(format!(
                "{path} returned HTTP {}: {detail}",
                status.as_u16()
            )));
        }
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|err| AppError::Extraction(format!("unreadable {path} response: {err}")))
    }
}

#[async_trait]
impl ContentExtractor for RemoteExtractor {
    async fn extract(&self, content: &str, hints: &ExtractionHints) -> AppResult<Extraction> {
        let Some(endpoint) = self.endpoint.as_deref() else {
            return Ok(Extraction::default());
        };
        let body = json!({
            "content": truncate_chars(content, MAX_TEXT_CHARS),
            "hints": hints,
        });
        let extraction: Extraction = self
            .call(endpoint, "extract", body)
            .await?
            .unwrap_or_default();
        Ok(Extraction {
            confidence: extraction.confidence.clamp(0.0, 1.0),
            ..extraction
        })
    }
}

#[async_trait]
impl MatchVerifier for RemoteExtractor {
    async fn verify(
        &self,
        entity_name: &str,
        address: Option<&str>,
        page: &ScrapedPage,
    ) -> AppResult<Verification> {
        let Some(endpoint) = self.endpoint.as_deref() else {
            return Ok(Verification::assumed(0.5, "verification service unavailable"));
        };
        if page.text.chars().count() < MIN_VERIFIABLE_CHARS {
            return Ok(Verification::assumed(0.3, "content too short to verify"));
        }
        let body = json!({
            "entity_name": entity_name,
            "address": address,
            "url": page.url,
            "content": truncate_chars(&page.text, MAX_TEXT_CHARS),
        });
        match self.call::<Verification>(endpoint, "verify", body).await? {
            Some(verdict) => Ok(Verification {
                confidence: verdict.confidence.clamp(0.0, 1.0),
                ..verdict
            }),
            None => {
                warn!(target: "lookup", entity_name, "verification service returned no verdict");
                Ok(Verification::assumed(0.5, "empty verification response"))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParkingCheck {
    pub is_parked: bool,
    pub indicators: Vec<&'static str>,
    pub word_count: usize,
}

/// Flags registrar placeholder pages and lapsed domains.
pub fn detect_parking(page: &ScrapedPage) -> ParkingCheck {
    let haystack = format!("{} {}", page.text, page.html).to_lowercase();
    let indicators = PARKING_INDICATORS
        .iter()
        .copied()
        .filter(|indicator| haystack.contains(indicator))
        .collect::<Vec<_>>();
    let word_count = page.text.split_whitespace().count();
    let sparse_parking_title = word_count < SPARSE_PAGE_WORDS
        && page.title().is_some_and(|title| {
            let title = title.to_lowercase();
            PARKING_TITLE_HINTS.iter().any(|hint| title.contains(hint))
        });
    ParkingCheck {
        is_parked: !indicators.is_empty() || sparse_parking_title,
        indicators,
        word_count,
    }
}

/// Visible page text with chrome (scripts, navigation, forms) removed.
pub fn extract_text(html: &str) -> String {
    let without_blocks = STRIPPED_BLOCKS.replace_all(html, " ");
    let without_tags = TAGS.replace_all(&without_blocks, " ");
    let text = collapse_whitespace(&decode_entities(&without_tags));
    truncate_chars(&text, MAX_TEXT_CHARS).to_string()
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use httptest::matchers::{all_of, request};
    use httptest::responders::{json_encoded, status_code};
    use httptest::{Expectation, Server};

    use super::*;

    fn long_page() -> ScrapedPage {
        let body = "The Ship Inn offers twelve en-suite rooms overlooking the harbour. ".repeat(5);
        ScrapedPage::from_html(
            "https://ship.example",
            format!("<html><head><title>The Ship Inn</title></head><body><p>{body}</p></body></html>"),
        )
    }

    fn hints() -> ExtractionHints {
        ExtractionHints {
            entity_name: "The Ship Inn".into(),
            address: None,
            need_website: false,
            need_phone: true,
            need_rooms: true,
        }
    }

    #[test]
    fn strips_chrome_and_markup() {
        let html = r#"<html><head><script>var x = "<b>";</script><style>p{}</style></head>
            <body><nav>Home | Rooms</nav><h1>Seaview&nbsp;Hotel</h1>
            <p>Call   01234 567890</p><footer>(c) 2024</footer></body></html>"#;
        assert_eq!(extract_text(html), "Seaview Hotel Call 01234 567890");
    }

    #[test]
    fn truncates_long_text() {
        let html = format!("<p>{}</p>", "é".repeat(MAX_TEXT_CHARS + 10));
        assert_eq!(extract_text(&html).chars().count(), MAX_TEXT_CHARS);
    }

    #[test]
    fn detects_parked_domains() {
        let parked = ScrapedPage::from_html(
            "https://old-hotel.example",
            "<html><body>This premium domain is for sale. Buy this domain today!</body></html>",
        );
        let check = detect_parking(&parked);
        assert!(check.is_parked);
        assert!(check.indicators.contains(&"buy this domain"));

        let sparse = ScrapedPage::from_html(
            "https://soon.example",
            "<html><head><title>Coming Soon</title></head><body>Stay tuned</body></html>",
        );
        assert!(detect_parking(&sparse).is_parked);

        assert!(!detect_parking(&long_page()).is_parked);
    }

    #[tokio::test]
    async fn unconfigured_extractor_falls_back() {
        let extractor = RemoteExtractor::new(None, None, Duration::from_secs(5)).unwrap();
        assert!(!extractor.is_configured());

        let extraction = extractor.extract("anything", &hints()).await.unwrap();
        assert_eq!(extraction, Extraction::default());

        let verdict = extractor.verify("The Ship Inn", None, &long_page()).await.unwrap();
        assert!(verdict.is_match);
        assert_eq!(verdict.confidence, 0.5);
    }

    #[tokio::test]
    async fn short_content_is_assumed_to_match() {
        let server = Server::run();
        let extractor = RemoteExtractor::new(
            Some(server.url("/ai/").to_string()),
            None,
            Duration::from_secs(5),
        )
        .unwrap();
        let page = ScrapedPage::from_html("https://tiny.example", "<p>Welcome</p>");
        let verdict = extractor.verify("Tiny Hotel", None, &page).await.unwrap();
        assert!(verdict.is_match);
        assert_eq!(verdict.confidence, 0.3);
    }

    #[tokio::test]
    async fn remote_extractor_posts_to_service() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of!(request::method("POST"), request::path("/ai/verify")))
                .respond_with(json_encoded(serde_json::json!({
                    "is_match": false,
                    "confidence": 0.9,
                    "reason": "page describes a different pub"
                }))),
        );
        server.expect(
            Expectation::matching(all_of!(request::method("POST"), request::path("/ai/extract")))
                .respond_with(json_encoded(serde_json::json!({
                    "uk_contact_phone": "01234 567890",
                    "rooms_min": 12,
                    "rooms_max": 12,
                    "confidence": 1.4
                }))),
        );
        let extractor = RemoteExtractor::new(
            Some(server.url("/ai").to_string()),
            None,
            Duration::from_secs(5),
        )
        .unwrap();

        let verdict = extractor.verify("The Ship Inn", None, &long_page()).await.unwrap();
        assert!(verdict.is_confident_mismatch(0.5));

        let extraction = extractor.extract(&long_page().text, &hints()).await.unwrap();
        assert_eq!(extraction.phone.as_deref(), Some("01234 567890"));
        assert_eq!(extraction.rooms_min, Some(12));
        assert_eq!(extraction.confidence, 1.0);
    }

    #[tokio::test]
    async fn extractor_failures_propagate() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::path("/ai/extract")).respond_with(status_code(500)),
        );
        let extractor = RemoteExtractor::new(
            Some(server.url("/ai").to_string()),
            None,
            Duration::from_secs(5),
        )
        .unwrap();
        let err = extractor.extract("text", &hints()).await.unwrap_err();
        assert!(matches!(err, AppError::Extraction(_)));
    }

    #[tokio::test]
    async fn fetcher_returns_page_text() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::path("/home")).respond_with(
                status_code(200).body("<html><body><h1>Harbour Hotel</h1></body></html>"),
            ),
        );
        let fetcher = HttpContentFetcher::new(Duration::from_secs(5)).unwrap();
        let page = fetcher.fetch(&server.url("/home").to_string()).await.unwrap();
        assert_eq!(page.text, "Harbour Hotel");
    }
}
