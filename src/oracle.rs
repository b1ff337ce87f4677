//! The vision oracle boundary: trait, retry adapter, Gemini implementation.
//!
//! The oracle is an unreliable, non-deterministic function from
//! `(prompt, image)` to free text. Everything downstream assumes the worst:
//! malformed JSON, truncation, hallucinated fields. This module only deals
//! with getting a response at all — interpreting it is
//! [`crate::pipeline::recovery`]'s job.
//!
//! ## Retry Strategy
//!
//! HTTP 429 / 503 errors are transient and frequent. Exponential backoff
//! (`retry_backoff_ms * 2^attempt`) avoids hammering a recovering endpoint:
//! with 500 ms base and 3 retries the wait sequence is 500 ms → 1 s → 2 s.
//! Auth errors are never retried.

use crate::config::ExtractionConfig;
use crate::error::{OracleError, OrderVisionError, PageError};
use crate::model::ImageData;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, warn};

/// An opaque vision-language oracle: `(prompt, image) → text`.
///
/// Implementations are pure I/O boundaries. They must not parse or repair
/// the response; they return whatever text the model produced.
#[async_trait]
pub trait VisionOracle: Send + Sync {
    /// Ask the oracle to describe/extract from one page image.
    async fn describe(&self, prompt: &str, image: &ImageData) -> Result<String, OracleError>;

    /// Short identifier for logs and metadata.
    fn name(&self) -> &str {
        "oracle"
    }
}

/// Shared handle to a boxed oracle.
pub type OracleHandle = Arc<dyn VisionOracle>;

/// Call the oracle with timeout, bounded retries and exponential backoff.
///
/// Always resolves: the error side is a [`PageError`] ready to be attached
/// to the page outcome, never a panic or a propagated oracle internal.
pub async fn call_with_retry(
    oracle: &OracleHandle,
    prompt: &str,
    image: &ImageData,
    page: usize,
    config: &ExtractionConfig,
) -> Result<(String, u8), PageError> {
    let started = Instant::now();
    let mut last_err: Option<OracleError> = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let backoff = config.retry_backoff_ms * 2u64.pow(attempt - 1);
            warn!(page, attempt, max = config.max_retries, backoff_ms = backoff, "oracle retry");
            sleep(Duration::from_millis(backoff)).await;
        }

        let call = oracle.describe(prompt, image);
        match timeout(Duration::from_secs(config.oracle_timeout_secs), call).await {
            Ok(Ok(text)) => {
                debug!(
                    page,
                    chars = text.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "oracle responded"
                );
                return Ok((text, attempt as u8));
            }
            Ok(Err(e)) => {
                warn!(page, attempt, error = %e, "oracle call failed");
                let retryable = e.is_retryable();
                last_err = Some(e);
                if !retryable {
                    break;
                }
            }
            Err(_) => {
                warn!(page, attempt, secs = config.oracle_timeout_secs, "oracle call timed out");
                last_err = Some(OracleError::Timeout {
                    elapsed_ms: config.oracle_timeout_secs * 1000,
                });
            }
        }
    }

    match last_err {
        Some(OracleError::Timeout { .. }) => Err(PageError::Timeout {
            page,
            secs: config.oracle_timeout_secs,
        }),
        Some(e) => Err(PageError::OracleFailed {
            page,
            retries: config.max_retries as u8,
            detail: e.to_string(),
        }),
        None => Err(PageError::OracleFailed {
            page,
            retries: config.max_retries as u8,
            detail: "unknown oracle error".into(),
        }),
    }
}

// ── Gemini implementation ────────────────────────────────────────────────

/// Default Gemini model used by [`GeminiOracle::from_env`].
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash";

/// Vision oracle backed by the Gemini `generateContent` REST API.
pub struct GeminiOracle {
    client: reqwest::Client,
    api_key: String,
    model: String,
    endpoint: String,
}

impl GeminiOracle {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.into(),
            endpoint: "https://generativelanguage.googleapis.com/v1beta/models".into(),
        }
    }

    /// Build from `GEMINI_API_KEY` (+ optional `GEMINI_MODEL`) environment
    /// variables.
    pub fn from_env() -> Result<Self, OrderVisionError> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| OrderVisionError::OracleNotConfigured {
                oracle: "gemini".into(),
                hint: "Set GEMINI_API_KEY in the environment.".into(),
            })?;
        let model =
            std::env::var("GEMINI_MODEL").unwrap_or_else(|_| DEFAULT_GEMINI_MODEL.to_string());
        Ok(Self::new(api_key, model))
    }

    /// Point the client at a different base URL (tests, proxies).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[derive(Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: GeminiContent,
}

#[derive(Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: String,
}

#[async_trait]
impl VisionOracle for GeminiOracle {
    async fn describe(&self, prompt: &str, image: &ImageData) -> Result<String, OracleError> {
        let url = format!(
            "{}/{}:generateContent?key={}",
            self.endpoint, self.model, self.api_key
        );

        let body = json!({
            "contents": [{
                "parts": [
                    { "text": prompt },
                    { "inline_data": { "mime_type": image.mime_type, "data": image.data } }
                ]
            }],
            "generationConfig": { "temperature": 0.1 }
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    OracleError::Timeout { elapsed_ms: 0 }
                } else {
                    OracleError::Api(e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(OracleError::RateLimited { retry_after_secs });
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(OracleError::Auth(format!("HTTP {status}")));
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(OracleError::Api(format!("HTTP {status}: {detail}")));
        }

        let parsed: GeminiResponse = response
            .json()
            .await
            .map_err(|e| OracleError::Api(format!("response decode: {e}")))?;

        let text: String = parsed
            .candidates
            .first()
            .map(|c| {
                c.content
                    .parts
                    .iter()
                    .map(|p| p.text.as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        if text.is_empty() {
            return Err(OracleError::Api("empty candidate list".into()));
        }
        Ok(text)
    }

    fn name(&self) -> &str {
        "gemini"
    }
}
