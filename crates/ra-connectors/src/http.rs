//! HTTP transport for the investigation backend and the enrichment service.
//!
//! The client performs exactly one request per call: retry and backoff
//! belong to [`crate::investigation::InvestigationClient`], which has to
//! persist its bookkeeping between reconciliation ticks.

use async_trait::async_trait;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorRateLimiter,
};
use moka::future::Cache as MokaCache;
use reqwest::{Client, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::traits::{
    AuthConfig, ConnectorConfig, ConnectorError, ConnectorResult, ContextEnricher,
    ContextQueryResult, InvestigationBackend, InvestigationRequest, InvestigationResponse,
    RateLimitConfig,
};

/// Path of the investigation endpoint.
pub const INVESTIGATE_PATH: &str = "/api/v1/investigate";
/// Path of the context query endpoint.
pub const CONTEXT_QUERY_PATH: &str = "/api/v1/context/query";

/// Type alias for the rate limiter.
type RateLimiterType = GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// JSON HTTP client with optional client-side rate limiting.
pub struct HttpClient {
    client: Client,
    config: ConnectorConfig,
    rate_limiter: Option<Arc<RateLimiterType>>,
}

impl HttpClient {
    /// Creates a new HTTP client from connector configuration.
    pub fn new(config: ConnectorConfig) -> ConnectorResult<Self> {
        if !config.verify_tls {
            warn!(
                base_url = %config.base_url,
                connector_name = %config.name,
                "TLS certificate verification disabled"
            );
        }

        let mut headers = reqwest::header::HeaderMap::new();
        for (key, value) in &config.headers {
            if let (Ok(name), Ok(val)) = (
                reqwest::header::HeaderName::try_from(key.as_str()),
                reqwest::header::HeaderValue::try_from(value.as_str()),
            ) {
                headers.insert(name, val);
            }
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .danger_accept_invalid_certs(!config.verify_tls)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .default_headers(headers)
            .build()
            .map_err(|e| ConnectorError::ConfigError(e.to_string()))?;

        let rate_limiter = match &config.rate_limit {
            Some(rl) => Some(Arc::new(Self::build_rate_limiter(rl)?)),
            None => None,
        };

        Ok(Self {
            client,
            config,
            rate_limiter,
        })
    }

    fn build_rate_limiter(rl: &RateLimitConfig) -> ConnectorResult<RateLimiterType> {
        let max_requests = rl.max_requests.max(1);
        let period = Duration::from_secs(rl.period_secs) / max_requests;
        let quota = Quota::with_period(period)
            .ok_or_else(|| ConnectorError::ConfigError("rate limit period must be non-zero".into()))?
            .allow_burst(NonZeroU32::new(rl.burst_size).unwrap_or(NonZeroU32::MIN));
        Ok(GovernorRateLimiter::direct(quota))
    }

    /// Builds a URL from a path.
    pub fn build_url(&self, path: &str) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{}/{}", base, path)
    }

    /// Connector name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// POSTs `body` as JSON and deserializes the JSON response.
    pub async fn post_json<T: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &T,
    ) -> ConnectorResult<R> {
        let url = self.build_url(path);
        let request = self.client.post(&url).json(body);
        let response = self.execute_once(request).await?;
        Self::parse_json_response(response).await
    }

    async fn parse_json_response<T: DeserializeOwned>(response: Response) -> ConnectorResult<T> {
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ConnectorError::InvalidResponse(e.to_string()))?;

        serde_json::from_str(&text).map_err(|e| {
            ConnectorError::InvalidResponse(format!(
                "Failed to parse response (status {}): {} - Body: {}",
                status,
                e,
                text.chars().take(500).collect::<String>()
            ))
        })
    }

    /// Sends a request once with authentication and rate limiting, mapping
    /// transport failures and non-success statuses to [`ConnectorError`].
    async fn execute_once(&self, request: reqwest::RequestBuilder) -> ConnectorResult<Response> {
        if let Some(limiter) = &self.rate_limiter {
            limiter.until_ready().await;
        }

        let request = self.add_auth(request);
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ConnectorError::Timeout(e.to_string())
            } else if e.is_connect() {
                ConnectorError::ConnectionFailed(e.to_string())
            } else {
                ConnectorError::RequestFailed(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let body = response.text().await.unwrap_or_default();
        debug!(status = %status, "Non-success response");
        Err(classify_status(status, retry_after, &body))
    }

    fn add_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.auth {
            AuthConfig::None => request,
            AuthConfig::ApiKey { key, header_name } => request.header(header_name, key),
            AuthConfig::BearerToken { token } => {
                request.header("Authorization", format!("Bearer {}", token))
            }
        }
    }
}

/// Maps a non-success status to a connector error.
pub fn classify_status(status: StatusCode, retry_after: Option<u64>, body: &str) -> ConnectorError {
    let snippet: String = body.chars().take(200).collect();
    match status {
        StatusCode::TOO_MANY_REQUESTS => ConnectorError::RateLimited(retry_after.unwrap_or(60)),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ConnectorError::AuthenticationFailed(status.to_string())
        }
        StatusCode::NOT_FOUND => ConnectorError::NotFound(snippet),
        s if s.is_server_error() => ConnectorError::ServerError(s.as_u16()),
        s if s.is_client_error() => ConnectorError::ClientError {
            status: s.as_u16(),
            message: snippet,
        },
        s => ConnectorError::InvalidResponse(format!("unexpected status {}", s)),
    }
}

/// Response cache using moka.
pub struct ResponseCache<V: Clone + Send + Sync + 'static> {
    cache: MokaCache<String, V>,
}

impl<V: Clone + Send + Sync + 'static> ResponseCache<V> {
    /// Creates a new cache with the specified TTL and max capacity.
    pub fn new(ttl: Duration, max_capacity: u64) -> Self {
        let cache = MokaCache::builder()
            .time_to_live(ttl)
            .max_capacity(max_capacity)
            .build();
        Self { cache }
    }

    pub async fn get(&self, key: &str) -> Option<V> {
        self.cache.get(key).await
    }

    pub async fn insert(&self, key: String, value: V) {
        self.cache.insert(key, value).await;
    }
}

/// Investigation backend reached over HTTP.
pub struct HttpInvestigationBackend {
    client: HttpClient,
}

impl HttpInvestigationBackend {
    pub fn new(config: ConnectorConfig) -> ConnectorResult<Self> {
        Ok(Self {
            client: HttpClient::new(config)?,
        })
    }
}

#[async_trait]
impl InvestigationBackend for HttpInvestigationBackend {
    fn name(&self) -> &str {
        self.client.name()
    }

    #[instrument(skip(self, request), fields(fingerprint = %request.fingerprint))]
    async fn investigate(
        &self,
        request: &InvestigationRequest,
    ) -> ConnectorResult<InvestigationResponse> {
        self.client.post_json(INVESTIGATE_PATH, request).await
    }
}

#[derive(Serialize)]
struct ContextQuery<'a> {
    fingerprint: &'a str,
    time_window_secs: u64,
    max_results: usize,
}

/// Enrichment service reached over HTTP, with a short-lived response cache.
pub struct HttpContextEnricher {
    client: HttpClient,
    cache: ResponseCache<ContextQueryResult>,
}

impl HttpContextEnricher {
    pub fn new(config: ConnectorConfig, cache_ttl: Duration) -> ConnectorResult<Self> {
        Ok(Self {
            client: HttpClient::new(config)?,
            cache: ResponseCache::new(cache_ttl, 10_000),
        })
    }

    fn cache_key(fingerprint: &str, time_window: Duration, max_results: usize) -> String {
        format!("{}|{}|{}", fingerprint, time_window.as_secs(), max_results)
    }
}

#[async_trait]
impl ContextEnricher for HttpContextEnricher {
    fn name(&self) -> &str {
        self.client.name()
    }

    #[instrument(skip(self))]
    async fn query(
        &self,
        fingerprint: &str,
        time_window: Duration,
        max_results: usize,
    ) -> ConnectorResult<ContextQueryResult> {
        let key = Self::cache_key(fingerprint, time_window, max_results);
        if let Some(cached) = self.cache.get(&key).await {
            debug!("Context cache hit");
            return Ok(cached);
        }

        let body = ContextQuery {
            fingerprint,
            time_window_secs: time_window.as_secs(),
            max_results,
        };
        let result: ContextQueryResult = self.client.post_json(CONTEXT_QUERY_PATH, &body).await?;
        self.cache.insert(key, result.clone()).await;
        Ok(result)
    }
}
