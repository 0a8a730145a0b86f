//! HTTP client for the Anthropic messages API.

use super::worker::{WorkerClient, WorkerRequest};
use crate::errors::WorkerCallError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

/// Settings for [`AnthropicClient`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicConfig {
    /// API key sent as `x-api-key`.
    pub api_key: String,
    /// Model name.
    pub model: String,
    /// Token cap per response.
    pub max_tokens: u32,
    /// Endpoint URL.
    pub base_url: String,
    /// Per-request HTTP timeout in seconds.
    pub request_timeout_secs: u64,
}

impl AnthropicConfig {
    /// Creates a config with the stock model and limits.
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: "claude-3-5-sonnet-latest".to_string(),
            max_tokens: 8192,
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout_secs: 300,
        }
    }

    /// Sets the model.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Sets the endpoint URL.
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: [Message<'a>; 1],
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

/// A [`WorkerClient`] that calls the Anthropic messages API.
#[derive(Debug, Clone)]
pub struct AnthropicClient {
    http: reqwest::Client,
    config: AnthropicConfig,
}

impl AnthropicClient {
    /// Creates a client.
    ///
    /// # Errors
    ///
    /// Returns the reqwest error if the HTTP client cannot be built.
    pub fn new(config: AnthropicConfig) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self { http, config })
    }
}

#[async_trait]
impl WorkerClient for AnthropicClient {
    async fn complete(&self, request: WorkerRequest) -> Result<String, WorkerCallError> {
        let body = MessagesRequest {
            model: &self.config.model,
            max_tokens: self.config.max_tokens,
            system: &request.system_prompt,
            messages: [Message {
                role: "user",
                content: &request.prompt,
            }],
        };

        let response = self
            .http
            .post(&self.config.base_url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    WorkerCallError::timeout(request.stage, self.config.request_timeout_secs)
                } else {
                    WorkerCallError::failed(request.stage, e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(stage = %request.stage, status = %status, "Model API returned an error");
            return Err(WorkerCallError::failed(
                request.stage,
                format!("HTTP {status}: {text}"),
            ));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| WorkerCallError::failed(request.stage, e.to_string()))?;

        parsed
            .content
            .into_iter()
            .find_map(|block| block.text)
            .ok_or_else(|| WorkerCallError::failed(request.stage, "response had no text block"))
    }
}
