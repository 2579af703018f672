use crate::api::ApiState;
use crate::error::{AppError, AppResult, LoggedJson};
use crate::governor::key;
use crate::governor::GovernedRequest;
use crate::upstream::ChatMessage;
use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;

const MAX_TOPIC_CHARS: usize = 500;
const MAX_SEARCH_LIMIT: u32 = 50;
const MAX_CHAT_MESSAGES: usize = 64;
const MAX_MESSAGE_BYTES: usize = 16 * 1024;

#[derive(Deserialize)]
pub struct SearchPayload {
    pub topic: String,
    pub category: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
}

/// POST /v1/search - Governed finance research query.
pub async fn search(
    State(state): State<Arc<ApiState>>,
    LoggedJson(payload): LoggedJson<SearchPayload>,
) -> AppResult<Json<serde_json::Value>> {
    let topic = payload.topic.trim();
    if topic.is_empty() {
        return Err(AppError::Validation("topic is required".to_string()));
    }
    if topic.chars().count() > MAX_TOPIC_CHARS {
        return Err(AppError::Validation(format!(
            "topic exceeds {MAX_TOPIC_CHARS} characters"
        )));
    }

    let limit = payload.limit.unwrap_or(10);
    if limit == 0 || limit > MAX_SEARCH_LIMIT {
        return Err(AppError::Validation(format!(
            "limit must be between 1 and {MAX_SEARCH_LIMIT}"
        )));
    }
    let offset = payload.offset.unwrap_or(0);

    let model = payload
        .model
        .unwrap_or_else(|| state.default_model.clone());

    let cache_key = key::search_key(topic, payload.category.as_deref(), limit, offset);

    let mut user_prompt = format!("Provide the latest findings on {topic}.");
    if let Some(ref category) = payload.category {
        user_prompt.push_str(&format!(" Focus on the {} category.", category.trim()));
    }
    user_prompt.push_str(&format!(
        " Return up to {limit} findings, starting from result {offset}."
    ));

    let request = GovernedRequest {
        endpoint: "search".to_string(),
        model,
        messages: vec![
            ChatMessage {
                role: "system".to_string(),
                content: "You are a financial research assistant. Answer with concise, \
                          sourced market analysis."
                    .to_string(),
            },
            ChatMessage {
                role: "user".to_string(),
                content: user_prompt,
            },
        ],
        temperature: None,
        max_tokens: payload.max_tokens,
        cache_key,
    };

    let response = state.governor.execute(request).await?;
    Ok(Json(serde_json::to_value(response).map_err(|e| {
        AppError::Internal(format!("response serialization failed: {e}"))
    })?))
}

#[derive(Deserialize)]
pub struct ChatPayload {
    pub messages: Vec<ChatMessage>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// POST /v1/chat - Governed raw chat completion.
pub async fn chat(
    State(state): State<Arc<ApiState>>,
    LoggedJson(payload): LoggedJson<ChatPayload>,
) -> AppResult<Json<serde_json::Value>> {
    if payload.messages.is_empty() {
        return Err(AppError::Validation(
            "messages must not be empty".to_string(),
        ));
    }
    if payload.messages.len() > MAX_CHAT_MESSAGES {
        return Err(AppError::Validation(format!(
            "at most {MAX_CHAT_MESSAGES} messages per request"
        )));
    }
    for (i, message) in payload.messages.iter().enumerate() {
        match message.role.as_str() {
            "system" | "user" | "assistant" => {}
            other => {
                return Err(AppError::Validation(format!(
                    "message {i}: unknown role {other:?}"
                )));
            }
        }
        if message.content.trim().is_empty() {
            return Err(AppError::Validation(format!("message {i}: empty content")));
        }
        if message.content.len() > MAX_MESSAGE_BYTES {
            return Err(AppError::Validation(format!(
                "message {i} exceeds {MAX_MESSAGE_BYTES} bytes"
            )));
        }
    }

    let model = payload
        .model
        .unwrap_or_else(|| state.default_model.clone());

    let cache_key = key::chat_key(
        &model,
        &payload.messages,
        payload.temperature,
        payload.max_tokens,
    );

    let request = GovernedRequest {
        endpoint: "chat".to_string(),
        model,
        messages: payload.messages,
        temperature: payload.temperature,
        max_tokens: payload.max_tokens,
        cache_key,
    };

    let response = state.governor.execute(request).await?;
    Ok(Json(serde_json::to_value(response).map_err(|e| {
        AppError::Internal(format!("response serialization failed: {e}"))
    })?))
}

const HISTORY_TAIL: usize = 20;

/// GET /v1/usage - Rolling usage counters and cache stats.
pub async fn usage(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    let metrics = state.governor.metrics();
    let tail: Vec<_> = metrics
        .history
        .iter()
        .rev()
        .take(HISTORY_TAIL)
        .rev()
        .collect();

    Json(serde_json::json!({
        "requests_last_minute": metrics.requests_last_minute,
        "requests_last_hour": metrics.requests_last_hour,
        "requests_last_24h": metrics.requests_last_24h,
        "tokens_used_24h": metrics.tokens_used_24h,
        "quota_resets": metrics.quota_resets,
        "history_len": metrics.history.len(),
        "recent_calls": tail,
        "cache_entries": state.governor.cache_len(),
    }))
}

/// GET /v1/limits - Configured ceilings and rolling remaining headroom.
pub async fn limits(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    let limits = state.governor.limits();
    let metrics = state.governor.metrics();

    Json(serde_json::json!({
        "limits": limits,
        "remaining": {
            "requests_this_minute": limits
                .max_requests_per_minute
                .saturating_sub(metrics.requests_last_minute),
            "requests_this_hour": limits
                .max_requests_per_hour
                .saturating_sub(metrics.requests_last_hour),
            "requests_today": limits
                .max_requests_per_day
                .saturating_sub(metrics.requests_last_24h),
            "tokens_today": limits
                .max_tokens_per_day
                .saturating_sub(metrics.tokens_used_24h),
        },
    }))
}

/// GET /health - Liveness probe, unauthenticated.
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// POST /v1/admin/usage/reset - Zero all rolling counters.
pub async fn reset_usage(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    state.governor.reset_metrics();
    let metrics = state.governor.metrics();
    tracing::info!("usage metrics reset by admin");

    Json(serde_json::json!({
        "status": "reset",
        "requests_last_minute": metrics.requests_last_minute,
        "requests_last_hour": metrics.requests_last_hour,
        "requests_last_24h": metrics.requests_last_24h,
        "tokens_used_24h": metrics.tokens_used_24h,
    }))
}

#[derive(Deserialize, Default)]
pub struct InvalidatePayload {
    pub key: Option<String>,
}

/// POST /v1/admin/cache/invalidate - Drop one cache entry, or all of them.
/// An empty body clears the whole cache.
pub async fn invalidate_cache(
    State(state): State<Arc<ApiState>>,
    body: axum::body::Bytes,
) -> AppResult<Json<serde_json::Value>> {
    let key = if body.is_empty() {
        None
    } else {
        serde_json::from_slice::<InvalidatePayload>(&body)
            .map_err(|e| AppError::Validation(format!("invalid payload: {e}")))?
            .key
    };

    let removed = match key {
        Some(ref key) => {
            let removed = usize::from(state.governor.invalidate_cache(key));
            tracing::info!(cache_key = %key, removed, "admin cache invalidation");
            removed
        }
        None => {
            let removed = state.governor.clear_cache();
            tracing::info!(removed, "admin cache clear");
            removed
        }
    };

    Ok(Json(serde_json::json!({
        "removed": removed,
        "remaining": state.governor.cache_len(),
    })))
}
