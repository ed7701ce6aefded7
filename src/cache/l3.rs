//! L3 Cache - HTTP Network Validation Tier
//!
//! Decides admissibility and freshness of origin responses from their
//! caching headers. The tier stores nothing itself: the coordinator keeps
//! validated values in L1/L2 and hands the persisted validators back here
//! for conditional revalidation.
//!
//! # Design
//!
//! - Admissible iff the status is 2xx and `Cache-Control` carries neither
//!   `no-store` nor `private`
//! - Freshness lifetime: `max-age`, then `Expires - now` (floored at zero),
//!   then the tier default
//! - `no-cache` / `must-revalidate` force revalidation regardless of age
//! - Pluggable transport (`HttpTransport`) for the actual HTTP round trip

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, CACHE_CONTROL, ETAG, EXPIRES, IF_MODIFIED_SINCE,
    IF_NONE_MATCH, LAST_MODIFIED,
};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::clock::{self, SharedClock};
use super::entry::CacheKey;
use crate::error::{Error, Result};

/// Network tier configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Origin that relative keys are resolved against
    pub base_url: Option<String>,
    /// Freshness lifetime when the response carries none (seconds)
    pub default_ttl_secs: u64,
    /// Per-request timeout (milliseconds)
    pub request_timeout_ms: u64,
    /// User-Agent sent by the reqwest transport
    pub user_agent: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            default_ttl_secs: 300,
            request_timeout_ms: 10_000,
            user_agent: None,
        }
    }
}

impl NetworkConfig {
    /// Default freshness lifetime
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    /// Request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

// =============================================================================
// Freshness
// =============================================================================

/// Result of checking a stored value against its validators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreshnessDecision {
    /// Within its freshness lifetime
    Fresh,
    /// Must be revalidated with the origin
    Stale,
    /// No network metadata, the value was written locally
    Unknown,
}

/// Validators and freshness persisted with a network-sourced value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationMetadata {
    /// Entity tag from the last response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    /// Last-Modified from the last response (HTTP-date, verbatim)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    /// When the origin last confirmed the value
    pub validated_at: DateTime<Utc>,
    /// Freshness lifetime counted from `validated_at`
    pub freshness_millis: u64,
    /// `no-cache` or `must-revalidate` was present
    #[serde(default)]
    pub always_revalidate: bool,
}

impl ValidationMetadata {
    /// Freshness lifetime
    pub fn freshness(&self) -> Duration {
        Duration::from_millis(self.freshness_millis)
    }

    /// Time since the last validation
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        clock::elapsed(now, self.validated_at)
    }

    /// Freshness left, zero once stale or when revalidation is forced
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        if self.always_revalidate {
            return Duration::ZERO;
        }
        self.freshness().saturating_sub(self.age(now))
    }

    /// Check if a conditional request can be made
    pub fn has_validators(&self) -> bool {
        self.etag.is_some() || self.last_modified.is_some()
    }
}

/// Parsed `Cache-Control` directives relevant to a private cache
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControl {
    pub no_store: bool,
    pub no_cache: bool,
    pub private: bool,
    pub must_revalidate: bool,
    pub max_age: Option<u64>,
}

impl CacheControl {
    /// Parse a header value; unknown directives are ignored
    pub fn parse(value: &str) -> Self {
        let mut directives = Self::default();

        for directive in value.split(',') {
            let directive = directive.trim();
            let (name, arg) = match directive.split_once('=') {
                Some((name, arg)) => (name.trim(), Some(arg.trim().trim_matches('"'))),
                None => (directive, None),
            };

            match name.to_ascii_lowercase().as_str() {
                "no-store" => directives.no_store = true,
                "no-cache" => directives.no_cache = true,
                "private" => directives.private = true,
                "must-revalidate" => directives.must_revalidate = true,
                "max-age" => directives.max_age = arg.and_then(|a| a.parse().ok()),
                _ => {}
            }
        }

        directives
    }

    /// Collect directives from every `Cache-Control` header
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let joined = headers
            .get_all(CACHE_CONTROL)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join(",");
        Self::parse(&joined)
    }

    /// Revalidation is required regardless of age
    pub fn forces_revalidation(&self) -> bool {
        self.no_cache || self.must_revalidate
    }
}

// =============================================================================
// Transport
// =============================================================================

/// Outbound GET request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub headers: HeaderMap,
}

/// Origin response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    /// Create an empty response with a status
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Add a header; invalid values are dropped
    pub fn with_header(mut self, name: HeaderName, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.append(name, value);
        }
        self
    }

    /// Set the body
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Get a header as a string
    pub fn header(&self, name: &HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// HTTP transport used for fetches and revalidation
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Send a GET request
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// reqwest-backed transport
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Build a client with the configured timeout and user agent
    pub fn new(config: &NetworkConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(config.request_timeout());
        if let Some(agent) = &config.user_agent {
            builder = builder.user_agent(agent.clone());
        }

        Ok(Self {
            client: builder.build().map_err(Error::Transport)?,
        })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let response = self
            .client
            .get(&request.url)
            .headers(request.headers)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Network(format!("request to {} timed out", request.url))
                } else {
                    Error::Transport(e)
                }
            })?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(Error::Transport)?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// Scripted in-memory transport that records every request
///
/// Responses are queued per URL and served in order; the last queued
/// response keeps being served. Unknown URLs answer `404 Not Found`.
#[derive(Default)]
pub struct StaticTransport {
    routes: DashMap<String, VecDeque<HttpResponse>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl StaticTransport {
    /// Create an empty transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for a URL
    pub fn enqueue(&self, url: impl Into<String>, response: HttpResponse) {
        self.routes.entry(url.into()).or_default().push_back(response);
    }

    /// Requests seen so far
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    /// Number of requests seen so far
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl HttpTransport for StaticTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let response = match self.routes.get_mut(&request.url) {
            Some(mut queue) => {
                if queue.len() > 1 {
                    queue.pop_front()
                } else {
                    queue.front().cloned()
                }
            }
            None => None,
        };

        self.requests.lock().push(request);
        Ok(response.unwrap_or_else(|| HttpResponse::new(StatusCode::NOT_FOUND)))
    }
}

// =============================================================================
// Decoding
// =============================================================================

/// Turns a response body into a cache value
pub trait ResponseDecoder<V>: Send + Sync {
    fn decode(&self, body: &[u8]) -> Result<V>;
}

/// Decodes JSON bodies with serde
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDecoder;

impl<V: DeserializeOwned> ResponseDecoder<V> for JsonDecoder {
    fn decode(&self, body: &[u8]) -> Result<V> {
        Ok(serde_json::from_slice(body)?)
    }
}

/// Keeps bodies as raw bytes
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesDecoder;

impl ResponseDecoder<Vec<u8>> for BytesDecoder {
    fn decode(&self, body: &[u8]) -> Result<Vec<u8>> {
        Ok(body.to_vec())
    }
}

impl<V, F> ResponseDecoder<V> for F
where
    F: Fn(&[u8]) -> Result<V> + Send + Sync,
{
    fn decode(&self, body: &[u8]) -> Result<V> {
        self(body)
    }
}

// =============================================================================
// Network Validation Tier
// =============================================================================

/// Outcome of a fetch or revalidation
#[derive(Debug)]
pub enum FetchOutcome<V> {
    /// New body; `metadata` is `None` when the response may not be cached
    Fetched {
        value: V,
        metadata: Option<ValidationMetadata>,
    },
    /// `304 Not Modified`; the stored value is still valid
    NotModified { metadata: ValidationMetadata },
    /// `404` or `410`; the resource is gone
    Gone,
    /// Any other non-success status
    Failed { status: StatusCode },
}

/// L3 Cache - HTTP validation tier
pub struct NetworkValidationTier<V> {
    config: NetworkConfig,
    transport: Arc<dyn HttpTransport>,
    decoder: Arc<dyn ResponseDecoder<V>>,
    clock: SharedClock,
    /// Full responses received
    fetches: AtomicU64,
    /// 304 responses received
    not_modified: AtomicU64,
    /// Transport errors and failing statuses
    errors: AtomicU64,
}

impl<V> NetworkValidationTier<V> {
    /// Create a network tier
    pub fn new(
        config: NetworkConfig,
        transport: Arc<dyn HttpTransport>,
        decoder: Arc<dyn ResponseDecoder<V>>,
        clock: SharedClock,
    ) -> Self {
        Self {
            config,
            transport,
            decoder,
            clock,
            fetches: AtomicU64::new(0),
            not_modified: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// Get configuration
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Decide whether a stored value may be served without revalidation
    pub fn validate(
        &self,
        key: &CacheKey,
        cached: Option<&ValidationMetadata>,
    ) -> FreshnessDecision {
        let Some(metadata) = cached else {
            return FreshnessDecision::Unknown;
        };

        let decision = if metadata.always_revalidate {
            FreshnessDecision::Stale
        } else if metadata.age(self.clock.now()) < metadata.freshness() {
            FreshnessDecision::Fresh
        } else {
            FreshnessDecision::Stale
        };

        trace!(key = %key, ?decision, "Validated cached entry");
        decision
    }

    /// Freshness lifetime of a response, `None` if it may not be cached
    pub fn should_cache(&self, response: &HttpResponse) -> Option<Duration> {
        if !response.status.is_success() {
            return None;
        }

        let directives = CacheControl::from_headers(&response.headers);
        if directives.no_store || directives.private {
            return None;
        }

        Some(self.freshness_lifetime(&response.headers, &directives))
    }

    fn freshness_lifetime(&self, headers: &HeaderMap, directives: &CacheControl) -> Duration {
        if let Some(max_age) = directives.max_age {
            return Duration::from_secs(max_age);
        }

        let expires = headers
            .get(EXPIRES)
            .and_then(|v| v.to_str().ok())
            .map(|v| httpdate::parse_http_date(v).ok());

        match expires {
            Some(Some(at)) => {
                let now = SystemTime::from(self.clock.now());
                at.duration_since(now).unwrap_or_default()
            }
            // Malformed Expires means already expired
            Some(None) => Duration::ZERO,
            None => self.config.default_ttl(),
        }
    }

    /// Validators and lifetime captured from a cacheable response
    pub fn metadata_for(&self, response: &HttpResponse, lifetime: Duration) -> ValidationMetadata {
        let directives = CacheControl::from_headers(&response.headers);
        ValidationMetadata {
            etag: response.header(&ETAG).map(str::to_owned),
            last_modified: response.header(&LAST_MODIFIED).map(str::to_owned),
            validated_at: self.clock.now(),
            freshness_millis: lifetime.as_millis().min(u64::MAX as u128) as u64,
            always_revalidate: directives.forces_revalidation(),
        }
    }

    /// Conditional request headers for a stored value
    pub fn conditional_headers(cached: Option<&ValidationMetadata>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let Some(metadata) = cached else {
            return headers;
        };

        if let Some(value) = metadata
            .etag
            .as_deref()
            .and_then(|e| HeaderValue::from_str(e).ok())
        {
            headers.insert(IF_NONE_MATCH, value);
        }
        if let Some(value) = metadata
            .last_modified
            .as_deref()
            .and_then(|lm| HeaderValue::from_str(lm).ok())
        {
            headers.insert(IF_MODIFIED_SINCE, value);
        }
        headers
    }

    /// Resolve a key to the URL it is fetched from
    pub fn url_for(&self, key: &CacheKey) -> Result<String> {
        let raw = key.as_str();
        if raw.starts_with("http://") || raw.starts_with("https://") {
            return Ok(raw.to_string());
        }

        match &self.config.base_url {
            Some(base) => Ok(format!(
                "{}/{}",
                base.trim_end_matches('/'),
                raw.trim_start_matches('/')
            )),
            None => Err(Error::Network(format!(
                "key '{}' is not a URL and no base_url is configured",
                raw
            ))),
        }
    }

    /// Fetch or revalidate a key against the origin
    pub async fn fetch(
        &self,
        key: &CacheKey,
        cached: Option<&ValidationMetadata>,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome<V>> {
        let url = self.url_for(key)?;
        let request = HttpRequest {
            url,
            headers: Self::conditional_headers(cached),
        };
        let conditional = !request.headers.is_empty();
        let timeout = self.config.request_timeout();

        debug!(key = %key, url = %request.url, conditional, "Requesting origin");

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = tokio::time::timeout(timeout, self.transport.send(request)) => {
                match result {
                    Ok(Ok(response)) => response,
                    Ok(Err(e)) => {
                        self.errors.fetch_add(1, Ordering::Relaxed);
                        return Err(e);
                    }
                    Err(_) => {
                        self.errors.fetch_add(1, Ordering::Relaxed);
                        return Err(Error::Timeout(timeout));
                    }
                }
            }
        };

        self.interpret(key, response, cached)
    }

    fn interpret(
        &self,
        key: &CacheKey,
        response: HttpResponse,
        cached: Option<&ValidationMetadata>,
    ) -> Result<FetchOutcome<V>> {
        match response.status {
            StatusCode::NOT_MODIFIED => {
                self.not_modified.fetch_add(1, Ordering::Relaxed);
                let directives = CacheControl::from_headers(&response.headers);
                let lifetime = self.freshness_lifetime(&response.headers, &directives);
                let fresh = self.metadata_for(&response, lifetime);

                // Directives and lifetime the 304 omits carry over from the stored copy
                let sends_directives = response.headers.contains_key(CACHE_CONTROL);
                let sends_lifetime =
                    directives.max_age.is_some() || response.headers.contains_key(EXPIRES);

                let metadata = match cached {
                    Some(previous) => ValidationMetadata {
                        etag: fresh.etag.or_else(|| previous.etag.clone()),
                        last_modified: fresh
                            .last_modified
                            .or_else(|| previous.last_modified.clone()),
                        freshness_millis: if sends_lifetime {
                            fresh.freshness_millis
                        } else {
                            previous.freshness_millis
                        },
                        always_revalidate: if sends_directives {
                            fresh.always_revalidate
                        } else {
                            previous.always_revalidate
                        },
                        ..fresh
                    },
                    None => fresh,
                };
                debug!(key = %key, freshness = ?metadata.freshness(), "Origin confirmed entry");
                Ok(FetchOutcome::NotModified { metadata })
            }
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                debug!(key = %key, status = %response.status, "Origin no longer has entry");
                Ok(FetchOutcome::Gone)
            }
            status if status.is_success() => {
                self.fetches.fetch_add(1, Ordering::Relaxed);
                let value = self.decoder.decode(&response.body)?;
                let metadata = self
                    .should_cache(&response)
                    .map(|lifetime| self.metadata_for(&response, lifetime));
                Ok(FetchOutcome::Fetched { value, metadata })
            }
            status => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                Ok(FetchOutcome::Failed { status })
            }
        }
    }

    /// Get tier statistics
    pub fn stats(&self) -> NetworkStats {
        NetworkStats {
            fetches: self.fetches.load(Ordering::Relaxed),
            not_modified: self.not_modified.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

impl<V> std::fmt::Debug for NetworkValidationTier<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkValidationTier")
            .field("config", &self.config)
            .finish()
    }
}

/// L3 tier statistics
#[derive(Debug, Clone, Serialize)]
pub struct NetworkStats {
    /// Full responses received
    pub fetches: u64,
    /// 304 responses received
    pub not_modified: u64,
    /// Transport errors and failing statuses
    pub errors: u64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::clock::{Clock, ManualClock};
    use serde_json::json;

    const ORIGIN: &str = "https://origin.test";

    fn tier(
        transport: Arc<StaticTransport>,
        clock: Arc<ManualClock>,
    ) -> NetworkValidationTier<serde_json::Value> {
        let config = NetworkConfig {
            base_url: Some(ORIGIN.to_string()),
            default_ttl_secs: 120,
            ..Default::default()
        };
        NetworkValidationTier::new(config, transport, Arc::new(JsonDecoder), clock)
    }

    fn ok(cache_control: &str) -> HttpResponse {
        HttpResponse::new(StatusCode::OK)
            .with_header(CACHE_CONTROL, cache_control)
            .with_body(r#"{"id":1}"#)
    }

    #[test]
    fn test_cache_control_parsing() {
        let cc = CacheControl::parse("public, Max-Age=\"60\", must-revalidate");
        assert_eq!(cc.max_age, Some(60));
        assert!(cc.must_revalidate);
        assert!(!cc.no_store);
        assert!(cc.forces_revalidation());

        let cc = CacheControl::parse("no-store,private");
        assert!(cc.no_store && cc.private);
        assert_eq!(cc.max_age, None);
    }

    #[test]
    fn test_should_cache_admissibility() {
        let clock = Arc::new(ManualClock::starting_now());
        let tier = tier(Arc::new(StaticTransport::new()), clock);

        assert_eq!(tier.should_cache(&ok("max-age=30")), Some(Duration::from_secs(30)));
        assert_eq!(tier.should_cache(&ok("no-store")), None);
        assert_eq!(tier.should_cache(&ok("private, max-age=30")), None);
        assert_eq!(
            tier.should_cache(&HttpResponse::new(StatusCode::INTERNAL_SERVER_ERROR)),
            None
        );
        // No directives at all falls back to the tier default
        assert_eq!(
            tier.should_cache(&HttpResponse::new(StatusCode::OK)),
            Some(Duration::from_secs(120))
        );
    }

    #[test]
    fn test_expires_header_lifetime() {
        let start = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let clock = Arc::new(ManualClock::new(start));
        let tier = tier(Arc::new(StaticTransport::new()), clock.clone());

        let response = HttpResponse::new(StatusCode::OK)
            .with_header(EXPIRES, "Wed, 01 May 2024 12:10:00 GMT");
        assert_eq!(tier.should_cache(&response), Some(Duration::from_secs(600)));

        // max-age wins over Expires
        let response = response.with_header(CACHE_CONTROL, "max-age=5");
        assert_eq!(tier.should_cache(&response), Some(Duration::from_secs(5)));

        // Past Expires floors at zero
        clock.advance(Duration::from_secs(3600));
        let response = HttpResponse::new(StatusCode::OK)
            .with_header(EXPIRES, "Wed, 01 May 2024 12:10:00 GMT");
        assert_eq!(tier.should_cache(&response), Some(Duration::ZERO));
    }

    #[test]
    fn test_validate_decisions() {
        let clock = Arc::new(ManualClock::starting_now());
        let tier = tier(Arc::new(StaticTransport::new()), clock.clone());
        let key = CacheKey::new("items/1");

        assert_eq!(tier.validate(&key, None), FreshnessDecision::Unknown);

        let response = ok("max-age=60").with_header(ETAG, "\"v1\"");
        let metadata = tier.metadata_for(&response, Duration::from_secs(60));
        assert_eq!(tier.validate(&key, Some(&metadata)), FreshnessDecision::Fresh);

        clock.advance(Duration::from_secs(60));
        assert_eq!(tier.validate(&key, Some(&metadata)), FreshnessDecision::Stale);

        let forced = ValidationMetadata {
            always_revalidate: true,
            validated_at: clock.now(),
            ..metadata
        };
        assert_eq!(tier.validate(&key, Some(&forced)), FreshnessDecision::Stale);
    }

    #[test]
    fn test_url_resolution() {
        let clock = Arc::new(ManualClock::starting_now());
        let tier = tier(Arc::new(StaticTransport::new()), clock);

        assert_eq!(
            tier.url_for(&CacheKey::new("/items/1")).unwrap(),
            "https://origin.test/items/1"
        );
        assert_eq!(
            tier.url_for(&CacheKey::new("http://other.test/x")).unwrap(),
            "http://other.test/x"
        );
    }

    #[tokio::test]
    async fn test_fetch_full_response() {
        let transport = Arc::new(StaticTransport::new());
        transport.enqueue(
            format!("{}/items/1", ORIGIN),
            ok("max-age=30").with_header(ETAG, "\"abc\""),
        );
        let tier = tier(transport.clone(), Arc::new(ManualClock::starting_now()));

        let outcome = tier
            .fetch(&CacheKey::new("items/1"), None, &CancellationToken::new())
            .await
            .unwrap();

        match outcome {
            FetchOutcome::Fetched { value, metadata } => {
                assert_eq!(value, json!({"id": 1}));
                let metadata = metadata.unwrap();
                assert_eq!(metadata.etag.as_deref(), Some("\"abc\""));
                assert_eq!(metadata.freshness(), Duration::from_secs(30));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(transport.requests()[0].headers.is_empty());
        assert_eq!(tier.stats().fetches, 1);
    }

    #[tokio::test]
    async fn test_revalidation_sends_conditional_headers() {
        let transport = Arc::new(StaticTransport::new());
        let url = format!("{}/items/1", ORIGIN);
        transport.enqueue(
            url.clone(),
            HttpResponse::new(StatusCode::NOT_MODIFIED).with_header(CACHE_CONTROL, "max-age=90"),
        );
        let clock = Arc::new(ManualClock::starting_now());
        let tier = tier(transport.clone(), clock.clone());

        let cached = ValidationMetadata {
            etag: Some("\"abc\"".into()),
            last_modified: Some("Wed, 01 May 2024 12:00:00 GMT".into()),
            validated_at: clock.now(),
            freshness_millis: 0,
            always_revalidate: false,
        };
        clock.advance(Duration::from_secs(10));

        let outcome = tier
            .fetch(&CacheKey::new("items/1"), Some(&cached), &CancellationToken::new())
            .await
            .unwrap();

        let request = &transport.requests()[0];
        assert_eq!(request.headers.get(IF_NONE_MATCH).unwrap(), "\"abc\"");
        assert_eq!(
            request.headers.get(IF_MODIFIED_SINCE).unwrap(),
            "Wed, 01 May 2024 12:00:00 GMT"
        );

        match outcome {
            FetchOutcome::NotModified { metadata } => {
                assert_eq!(metadata.etag.as_deref(), Some("\"abc\""));
                assert_eq!(metadata.freshness(), Duration::from_secs(90));
                assert_eq!(metadata.validated_at, clock.now());
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bare_not_modified_keeps_stored_directives() {
        let transport = Arc::new(StaticTransport::new());
        let url = format!("{}/items/2", ORIGIN);
        transport.enqueue(url.clone(), HttpResponse::new(StatusCode::NOT_MODIFIED));
        transport.enqueue(
            url.clone(),
            HttpResponse::new(StatusCode::NOT_MODIFIED).with_header(CACHE_CONTROL, "public"),
        );
        let clock = Arc::new(ManualClock::starting_now());
        let tier = tier(transport.clone(), clock.clone());

        let cached = ValidationMetadata {
            etag: Some("\"v1\"".into()),
            last_modified: None,
            validated_at: clock.now(),
            freshness_millis: 45_000,
            always_revalidate: true,
        };
        let cancel = CancellationToken::new();

        let metadata = match tier
            .fetch(&CacheKey::new("items/2"), Some(&cached), &cancel)
            .await
            .unwrap()
        {
            FetchOutcome::NotModified { metadata } => metadata,
            other => panic!("unexpected outcome: {:?}", other),
        };
        assert!(metadata.always_revalidate);
        assert_eq!(metadata.freshness(), Duration::from_secs(45));
        assert_eq!(metadata.etag.as_deref(), Some("\"v1\""));
        assert_eq!(
            tier.validate(&CacheKey::new("items/2"), Some(&metadata)),
            FreshnessDecision::Stale
        );

        // Directives sent with the 304 replace the stored ones
        let metadata = match tier
            .fetch(&CacheKey::new("items/2"), Some(&metadata), &cancel)
            .await
            .unwrap()
        {
            FetchOutcome::NotModified { metadata } => metadata,
            other => panic!("unexpected outcome: {:?}", other),
        };
        assert!(!metadata.always_revalidate);
        assert_eq!(metadata.freshness(), Duration::from_secs(45));
        assert_eq!(
            tier.validate(&CacheKey::new("items/2"), Some(&metadata)),
            FreshnessDecision::Fresh
        );
    }

    #[tokio::test]
    async fn test_fetch_gone_and_failed() {
        let transport = Arc::new(StaticTransport::new());
        transport.enqueue(
            format!("{}/down", ORIGIN),
            HttpResponse::new(StatusCode::SERVICE_UNAVAILABLE),
        );
        transport.enqueue(format!("{}/gone", ORIGIN), HttpResponse::new(StatusCode::GONE));
        let tier = tier(transport, Arc::new(ManualClock::starting_now()));
        let cancel = CancellationToken::new();

        assert!(matches!(
            tier.fetch(&CacheKey::new("missing"), None, &cancel).await.unwrap(),
            FetchOutcome::Gone
        ));
        assert!(matches!(
            tier.fetch(&CacheKey::new("gone"), None, &cancel).await.unwrap(),
            FetchOutcome::Gone
        ));
        assert!(matches!(
            tier.fetch(&CacheKey::new("down"), None, &cancel).await.unwrap(),
            FetchOutcome::Failed { status } if status == StatusCode::SERVICE_UNAVAILABLE
        ));
    }

    #[tokio::test]
    async fn test_fetch_cancelled() {
        let tier = tier(
            Arc::new(StaticTransport::new()),
            Arc::new(ManualClock::starting_now()),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = tier
            .fetch(&CacheKey::new("items/1"), None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn test_closure_decoder() {
        let transport = Arc::new(StaticTransport::new());
        transport.enqueue(
            format!("{}/text", ORIGIN),
            HttpResponse::new(StatusCode::OK).with_body("hello"),
        );
        let decoder = |body: &[u8]| -> Result<String> {
            String::from_utf8(body.to_vec()).map_err(|e| Error::Serialization(e.to_string()))
        };
        let tier: NetworkValidationTier<String> = NetworkValidationTier::new(
            NetworkConfig {
                base_url: Some(ORIGIN.into()),
                ..Default::default()
            },
            transport,
            Arc::new(decoder),
            Arc::new(ManualClock::starting_now()),
        );

        let outcome = tier
            .fetch(&CacheKey::new("text"), None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, FetchOutcome::Fetched { value, .. } if value == "hello"));
    }
}
