//! HTTP access shared by every source adapter.
//!
//! [`ResilientClient`] pairs a `reqwest` client with the source's circuit
//! breaker, backoff policy and the run's cancellation token, and maps HTTP
//! statuses onto [`SourceError`] so the retry wrapper can tell transient
//! failures from permanent ones.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::HarvestConfig;
use crate::harvest::traits::SourceError;
use crate::model::SourceType;
use crate::resilience::{retry, BackoffPolicy, CircuitBreaker};

/// Bearer token plus the base URL it is scoped to.
#[derive(Debug, Clone)]
struct Credential {
    token: String,
    scope: Url,
}

impl Credential {
    /// True when `url` lies under the scope: same origin, and the path is
    /// the scope path or below it.
    fn covers(&self, url: &Url) -> bool {
        if url.origin() != self.scope.origin() {
            return false;
        }
        let prefix = self.scope.path().trim_end_matches('/');
        let path = url.path();
        prefix.is_empty()
            || path == prefix
            || path.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('/'))
    }
}

/// Resilient GET client for one source.
#[derive(Debug, Clone)]
pub struct ResilientClient {
    http: Client,
    source: SourceType,
    breaker: Arc<CircuitBreaker>,
    policy: BackoffPolicy,
    cancel: CancellationToken,
    credential: Option<Credential>,
}

impl ResilientClient {
    pub fn new(
        source: SourceType,
        config: &HarvestConfig,
        cancel: CancellationToken,
    ) -> Result<Self, SourceError> {
        let http = Client::builder()
            .user_agent(config.http.user_agent.clone())
            .timeout(Duration::from_secs(config.http.request_timeout_secs))
            .build()
            .map_err(|e| SourceError::Config(format!("HTTP client: {}", e)))?;

        let credential = match config.credential(source) {
            Some(token) => {
                let base = api_base(source, config);
                let scope = Url::parse(base)
                    .map_err(|e| SourceError::Config(format!("API base URL '{}': {}", base, e)))?;
                Some(Credential {
                    token: token.to_string(),
                    scope,
                })
            }
            None => None,
        };

        Ok(Self {
            http,
            source,
            breaker: Arc::new(CircuitBreaker::from_config(source, &config.breaker)),
            policy: BackoffPolicy::from_config(&config.backoff),
            cancel,
            credential,
        })
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn source_type(&self) -> SourceType {
        self.source
    }

    /// GET `url` as text, retrying transient failures.
    pub async fn get_text(&self, url: &str) -> Result<String, SourceError> {
        retry(&self.breaker, &self.policy, &self.cancel, |_attempt| {
            self.fetch_text(url)
        })
        .await
        .map_err(SourceError::from)
    }

    /// Like [`get_text`](Self::get_text), but a 404 is `Ok(None)`.
    pub async fn get_optional_text(&self, url: &str) -> Result<Option<String>, SourceError> {
        match self.get_text(url).await {
            Ok(text) => Ok(Some(text)),
            Err(SourceError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// GET `url` and decode the JSON body. Decoding failures are permanent.
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, SourceError> {
        let body = self.get_text(url).await?;
        serde_json::from_str(&body)
            .map_err(|e| SourceError::UnexpectedResponse(format!("{}: {}", url, e)))
    }

    /// The token, when `url` belongs to the source's API.
    fn token_for(&self, url: &str) -> Option<&str> {
        let credential = self.credential.as_ref()?;
        let url = Url::parse(url).ok()?;
        credential.covers(&url).then_some(credential.token.as_str())
    }

    async fn fetch_text(&self, url: &str) -> Result<String, SourceError> {
        let mut request = self.http.get(url);
        if let Some(token) = self.token_for(url) {
            request = request
                .header(AUTHORIZATION, format!("Bearer {}", token))
                .header(ACCEPT, "application/vnd.github+json");
        }
        let response = request.send().await?;
        let response = check_status(response, url)?;
        Ok(response.text().await?)
    }
}

/// Base URL of the API a source's credential is meant for.
fn api_base(source: SourceType, config: &HarvestConfig) -> &str {
    match source {
        SourceType::Flathub => &config.flathub.api_base,
        SourceType::Nix => &config.nixpkgs.raw_base,
        SourceType::Arch => &config.aur.base_url,
    }
}

/// Maps non-success statuses onto [`SourceError`].
fn check_status(response: Response, url: &str) -> Result<Response, SourceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    debug!(status = status.as_u16(), url, "Upstream returned an error status");

    match status {
        StatusCode::NOT_FOUND => Err(SourceError::NotFound(url.to_string())),
        StatusCode::TOO_MANY_REQUESTS => Err(SourceError::RateLimited {
            retry_after: retry_after(response.headers()),
        }),
        // GitHub signals an exhausted quota with 403 and a zero remaining count.
        StatusCode::FORBIDDEN if quota_exhausted(response.headers()) => {
            let retry_after = retry_after(response.headers()).or_else(|| quota_reset(response.headers()));
            warn!(url, ?retry_after, "API quota exhausted");
            Err(SourceError::RateLimited { retry_after })
        }
        _ => Err(SourceError::Http {
            status: status.as_u16(),
            url: url.to_string(),
        }),
    }
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

/// `Retry-After` in delta-seconds form.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    header_str(headers, RETRY_AFTER.as_str())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn quota_exhausted(headers: &HeaderMap) -> bool {
    header_str(headers, "x-ratelimit-remaining") == Some("0")
}

/// Time until `x-ratelimit-reset` (epoch seconds).
fn quota_reset(headers: &HeaderMap) -> Option<Duration> {
    let reset = header_str(headers, "x-ratelimit-reset")?.parse::<i64>().ok()?;
    let wait = reset - Utc::now().timestamp();
    Some(Duration::from_secs(wait.max(0) as u64))
}
