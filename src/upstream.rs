use crate::config::UpstreamConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    total_tokens: u64,
}

/// Decoded successful completion.
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub model: String,
    pub total_tokens: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("decode error: {0}")]
    Decode(String),
}

impl UpstreamError {
    /// Whether a retry could plausibly succeed. Timeouts, connection errors,
    /// 408/429 and 5xx are transient; other 4xx and shape mismatches are not.
    pub fn is_transient(&self) -> bool {
        match self {
            UpstreamError::Transport(_) => true,
            UpstreamError::Status { status, .. } => {
                matches!(*status, 408 | 429) || *status >= 500
            }
            UpstreamError::Decode(_) => false,
        }
    }
}

/// HTTP client for the upstream completions endpoint. The bearer credential
/// is attached per request and never logged.
pub struct UpstreamClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| format!("failed to build http client: {e}"))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    pub async fn chat(&self, request: &ChatRequest) -> Result<Completion, UpstreamError> {
        let url = format!("{}/chat/completions", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        if !(200..300).contains(&status) {
            return Err(UpstreamError::Status {
                status,
                body: truncate(&String::from_utf8_lossy(&body), 300),
            });
        }

        parse_completion(&body, &request.model)
    }
}

fn parse_completion(body: &[u8], model: &str) -> Result<Completion, UpstreamError> {
    let parsed: ChatResponse = serde_json::from_slice(body)
        .map_err(|e| UpstreamError::Decode(format!("unexpected response shape: {e}")))?;

    let content = parsed
        .choices
        .first()
        .map(|c| c.message.content.clone())
        .ok_or_else(|| UpstreamError::Decode("response contained no choices".to_string()))?;

    let total_tokens = parsed.usage.map(|u| u.total_tokens).unwrap_or(0);

    Ok(Completion {
        content,
        model: model.to_string(),
        total_tokens,
    })
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}
