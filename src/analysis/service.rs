//! Reasoning service adapter.
//!
//! Talks to an OpenAI-compatible `chat/completions` endpoint and maps every
//! outcome of a single attempt onto either a reply or one of the
//! [`ServiceError`] signals the retry state machine understands.

use super::prompt::AnalysisRequest;
use crate::config::ServiceConfig;
use crate::error::ServiceError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Raw reply from a successful attempt. `content` is not yet validated.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceReply {
    pub id: Option<String>,
    pub content: String,
}

/// One attempt against the external reasoning service.
#[async_trait]
pub trait ReasoningService: Send + Sync {
    async fn complete(&self, request: &AnalysisRequest) -> Result<ServiceReply, ServiceError>;

    /// Model or provider name for reports and logs.
    fn model_name(&self) -> String;
}

/// Message in the chat history.
#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

/// Chat completions request.
#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

/// Chat completions response.
#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Client for any endpoint speaking the OpenAI chat completions protocol.
pub struct OpenAiCompatibleService {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    temperature: f32,
    json_mode: bool,
}

impl OpenAiCompatibleService {
    pub fn from_config(config: &ServiceConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("feedwatch/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .context("Failed to create HTTP client")?;

        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty());

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
            json_mode: config.json_mode,
        })
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }
}

#[async_trait]
impl ReasoningService for OpenAiCompatibleService {
    async fn complete(&self, request: &AnalysisRequest) -> Result<ServiceReply, ServiceError> {
        let url = format!("{}/chat/completions", self.base_url);
        let instruction = request.instruction();
        let user = request.user_message();

        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &instruction,
                },
                ChatMessage {
                    role: "user",
                    content: &user,
                },
            ],
            temperature: self.temperature,
            response_format: self.json_mode.then_some(ResponseFormat {
                kind: "json_object",
            }),
        };

        debug!(model = %self.model, chars = user.len(), "Sending analysis request");

        let mut builder = self.http.post(&url).json(&body);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ServiceError::Transport("request timed out".to_string())
            } else if e.is_connect() {
                ServiceError::Transport(format!("cannot connect to {}", self.base_url))
            } else {
                ServiceError::Transport(format!("failed to send request: {}", e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &text, retry_after));
        }

        let text = response
            .text()
            .await
            .map_err(|e| ServiceError::Transport(format!("failed to read response: {}", e)))?;

        parse_envelope(&text)
    }

    fn model_name(&self) -> String {
        self.model.clone()
    }
}

/// Map a non-2xx HTTP status to a service signal.
pub fn classify_status(status: StatusCode, body: &str, retry_after: Option<Duration>) -> ServiceError {
    let lower = body.to_lowercase();
    let too_large = lower.contains("context_length_exceeded")
        || lower.contains("maximum context length")
        || lower.contains("too large")
        || lower.contains("too many tokens");

    match status {
        StatusCode::TOO_MANY_REQUESTS if lower.contains("insufficient_quota") => {
            ServiceError::Transport(format!("quota exhausted ({})", status))
        }
        StatusCode::TOO_MANY_REQUESTS => ServiceError::RateLimited { retry_after },
        StatusCode::PAYLOAD_TOO_LARGE => ServiceError::InputTooLarge(format!("HTTP {}", status)),
        StatusCode::BAD_REQUEST if too_large => {
            ServiceError::InputTooLarge(first_line(body).to_string())
        }
        _ => ServiceError::Transport(format!("HTTP {}: {}", status, first_line(body))),
    }
}

/// Extract the reply from a chat completions envelope.
pub fn parse_envelope(text: &str) -> Result<ServiceReply, ServiceError> {
    let envelope: ChatResponse = serde_json::from_str(text)
        .map_err(|e| ServiceError::MalformedOutput(format!("invalid response envelope: {}", e)))?;

    let choice = envelope
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ServiceError::MalformedOutput("response has no choices".to_string()))?;

    // The completion hit its output token limit; a shorter input would not
    // make the reply fit, so this is not a truncation signal.
    if choice.finish_reason.as_deref() == Some("length") {
        return Err(ServiceError::MalformedOutput(
            "response cut off at the completion token limit".to_string(),
        ));
    }

    let content = choice
        .message
        .content
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| ServiceError::MalformedOutput("response message is empty".to_string()))?;

    Ok(ServiceReply {
        id: envelope.id,
        content,
    })
}

fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn first_line(s: &str) -> &str {
    let line = s.lines().next().unwrap_or("").trim();
    match line.char_indices().nth(200) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}
