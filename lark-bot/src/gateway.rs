//! Completion gateway: the only component that talks to the language model.
//!
//! The gateway is pure request/response. It receives a role prompt, a
//! history snapshot, and the new user text, and returns assistant text or a
//! typed error. It never touches session state, so a failed call leaves the
//! conversation exactly as it was.

use crate::session::Turn;
use async_trait::async_trait;
use lark_common::OpenAiConfig;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Input for one completion call. Cloneable so the retry wrapper can replay
/// the identical request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// System prompt for the session's role, when one is configured.
    pub system_prompt: Option<String>,
    /// Prior turns, oldest first. Already bounded by the session window.
    pub history: Vec<Turn>,
    /// The message that triggered this call.
    pub user_text: String,
}

/// Why a completion call failed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GatewayError {
    /// The upstream could not be reached or answered with a transient
    /// failure (network error, 5xx, 429). Worth retrying.
    #[error("upstream unavailable: {0}")]
    Unavailable(String),
    /// The upstream refused the request (bad request, auth, quota).
    /// Retrying the same request will not help.
    #[error("upstream rejected request (status {status}): {message}")]
    Rejected { status: u16, message: String },
    /// No response within the configured deadline.
    #[error("upstream timed out after {0:?}")]
    Timeout(Duration),
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Unavailable(_) | GatewayError::Timeout(_))
    }
}

#[async_trait]
pub trait CompletionGateway: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<String, GatewayError>;
}

/// Gateway backed by an OpenAI-compatible chat completions endpoint.
pub struct OpenAiGateway {
    client: reqwest::Client,
    base_url: String,
    model: String,
    max_tokens: i64,
    temperature: f64,
    timeout: Duration,
}

impl OpenAiGateway {
    pub fn new(config: &OpenAiConfig) -> Self {
        let timeout = Duration::from_secs(config.timeout_secs);
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", config.api_key))
                .unwrap_or_else(|_| HeaderValue::from_static("")),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            timeout,
        }
    }

    fn build_messages(request: &CompletionRequest) -> Vec<ChatMessage> {
        let mut messages: Vec<ChatMessage> = request
            .history
            .iter()
            .map(|turn| ChatMessage {
                role: turn.speaker.as_str().into(),
                content: turn.text.clone(),
            })
            .collect();

        messages.push(ChatMessage {
            role: "user".into(),
            content: request.user_text.clone(),
        });

        if let Some(system) = &request.system_prompt {
            messages.insert(
                0,
                ChatMessage {
                    role: "system".into(),
                    content: system.clone(),
                },
            );
        }

        messages
    }
}

#[async_trait]
impl CompletionGateway for OpenAiGateway {
    async fn complete(&self, request: CompletionRequest) -> Result<String, GatewayError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = ChatCompletionRequest {
            model: self.model.clone(),
            messages: Self::build_messages(&request),
            max_tokens: Some(self.max_tokens),
            temperature: Some(self.temperature),
        };

        let response = self.client.post(&url).json(&body).send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout(self.timeout)
            } else {
                GatewayError::Unavailable(format!("request failed: {}", e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // 429 and 5xx are transient; other 4xx means the request itself
            // was refused
            if status.as_u16() == 429 || status.is_server_error() {
                return Err(GatewayError::Unavailable(format!(
                    "API error {}: {}",
                    status, body
                )));
            }
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                message: body,
            });
        }

        let completion: ChatCompletionResponse = response.json().await.map_err(|e| {
            GatewayError::Unavailable(format!("failed to parse response: {}", e))
        })?;

        Ok(completion
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .unwrap_or_default())
    }
}

/// Retry policy for the wrapped gateway.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt, for retryable errors only.
    pub max_retries: u32,
    /// Base backoff delay in milliseconds (doubles with each retry).
    pub base_backoff_ms: u64,
    /// Maximum backoff delay in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_backoff_ms: 500,
            max_backoff_ms: 10_000,
        }
    }
}

impl RetryConfig {
    pub fn from_config(config: &OpenAiConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_backoff_ms: config.base_backoff_ms,
            max_backoff_ms: config.max_backoff_ms,
        }
    }
}

/// Wraps a gateway with bounded retries and exponential backoff.
///
/// Only transient errors are retried; a rejected request is returned
/// immediately. The last error is surfaced once the budget is spent.
pub struct ResilientGateway {
    inner: Arc<dyn CompletionGateway>,
    config: RetryConfig,
}

impl ResilientGateway {
    pub fn new(inner: Arc<dyn CompletionGateway>, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let delay_ms = self
            .config
            .base_backoff_ms
            .saturating_mul(2_u64.saturating_pow(attempt))
            .min(self.config.max_backoff_ms);
        Duration::from_millis(delay_ms)
    }
}

#[async_trait]
impl CompletionGateway for ResilientGateway {
    async fn complete(&self, request: CompletionRequest) -> Result<String, GatewayError> {
        let mut last_err = GatewayError::Unavailable("no completion attempts were made".into());

        for attempt in 0..=self.config.max_retries {
            match self.inner.complete(request.clone()).await {
                Ok(text) => {
                    if attempt > 0 {
                        tracing::info!(attempt = attempt + 1, "Upstream recovered after retries");
                    }
                    return Ok(text);
                }
                Err(e) => {
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    if attempt < self.config.max_retries {
                        let delay = self.backoff_delay(attempt);
                        tracing::warn!(
                            attempt = attempt + 1,
                            max_retries = self.config.max_retries,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Upstream call failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    last_err = e;
                }
            }
        }

        Err(last_err)
    }
}

// ============================================================================
// OpenAI API Types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}
