pub mod cache;
pub mod key;
pub mod retry;
pub mod tracker;

use crate::config::AppConfig;
use crate::error::AppError;
use crate::upstream::{ChatMessage, ChatRequest, UpstreamClient, UpstreamError};
use cache::ResponseCache;
use retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracker::{CallRecord, Limits, UsageMetrics, UsageTracker};

/// Cached result of a successful upstream call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub content: String,
    pub model: String,
    pub tokens: u64,
}

/// A fully prepared outbound call: what to send upstream plus the derived
/// cache key.
#[derive(Debug, Clone)]
pub struct GovernedRequest {
    pub endpoint: String,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub cache_key: String,
}

/// Advisory attached to successful responses when daily token usage crosses
/// the configured warning threshold. Never blocks a call.
#[derive(Debug, Clone, Serialize)]
pub struct TokenWarning {
    pub message: String,
    pub tokens_used_24h: u64,
    pub max_tokens_per_day: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GovernedResponse {
    pub content: String,
    pub model: String,
    pub tokens: u64,
    pub served_from_cache: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<TokenWarning>,
}

#[derive(Debug, thiserror::Error)]
pub enum GovernorError {
    #[error("quota exceeded: {limit_name}")]
    QuotaExceeded {
        limit_name: &'static str,
        retry_after_seconds: u64,
    },

    #[error("upstream unavailable: {last_error}")]
    UpstreamUnavailable { last_error: String },

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
}

impl From<GovernorError> for AppError {
    fn from(err: GovernorError) -> Self {
        match err {
            GovernorError::QuotaExceeded {
                limit_name,
                retry_after_seconds,
            } => AppError::QuotaExceeded {
                limit_name,
                retry_after_seconds,
            },
            GovernorError::UpstreamUnavailable { last_error } => {
                AppError::UpstreamUnavailable(last_error)
            }
            GovernorError::InvalidRequest { reason } => AppError::Validation(reason),
        }
    }
}

/// Mediates every outbound call: cache first, then quota, then a bounded
/// retried upstream dispatch. Constructed once at startup and shared.
pub struct Governor {
    tracker: Arc<UsageTracker>,
    cache: Arc<ResponseCache>,
    upstream: Arc<UpstreamClient>,
    limits: Limits,
    retry: RetryPolicy,
    cache_ttl_secs: u64,
    token_warn_ratio: f64,
    journal_tx: Option<mpsc::Sender<CallRecord>>,
}

impl Governor {
    pub fn new(
        tracker: Arc<UsageTracker>,
        cache: Arc<ResponseCache>,
        upstream: Arc<UpstreamClient>,
        config: &AppConfig,
        journal_tx: Option<mpsc::Sender<CallRecord>>,
    ) -> Self {
        Self {
            tracker,
            cache,
            upstream,
            limits: Limits::from(&config.limits),
            retry: RetryPolicy::new(&config.retry),
            cache_ttl_secs: config.cache.ttl_secs,
            token_warn_ratio: config.limits.token_warn_ratio,
            journal_tx,
        }
    }

    /// Run one governed call: serve from cache, reject on quota, or dispatch
    /// upstream with bounded retry. Every attempt is recorded in the history.
    pub async fn execute(
        &self,
        request: GovernedRequest,
    ) -> Result<GovernedResponse, GovernorError> {
        if request.model.trim().is_empty() {
            return Err(GovernorError::InvalidRequest {
                reason: "model is required".to_string(),
            });
        }
        if request.messages.is_empty() {
            return Err(GovernorError::InvalidRequest {
                reason: "messages must not be empty".to_string(),
            });
        }

        if let Some(payload) = self.cache.get(&request.cache_key) {
            tracing::debug!(endpoint = %request.endpoint, key = %request.cache_key, "cache hit");
            return Ok(GovernedResponse {
                content: payload.content,
                model: payload.model,
                tokens: payload.tokens,
                served_from_cache: true,
                warning: None,
            });
        }

        if let Err(hit) = self.tracker.quota_check(&self.limits) {
            tracing::info!(
                endpoint = %request.endpoint,
                limit = hit.limit.as_str(),
                retry_after = hit.retry_after_seconds,
                "call rejected by quota"
            );
            return Err(GovernorError::QuotaExceeded {
                limit_name: hit.limit.as_str(),
                retry_after_seconds: hit.retry_after_seconds,
            });
        }

        let chat_request = ChatRequest {
            model: request.model.clone(),
            messages: request.messages.clone(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let mut last_error = String::new();
        for attempt in 0..self.retry.max_attempts {
            if attempt > 0 {
                let delay = self.retry.jittered(self.retry.delay_for_attempt(attempt - 1));
                tokio::time::sleep(delay).await;
            }

            let start = Instant::now();
            match self.upstream.chat(&chat_request).await {
                Ok(completion) => {
                    let latency_ms = start.elapsed().as_millis() as u64;
                    let record = self.tracker.record_call(
                        &request.endpoint,
                        &request.model,
                        completion.total_tokens,
                        true,
                        latency_ms,
                    );
                    self.journal(record);

                    let payload = ResponsePayload {
                        content: completion.content,
                        model: completion.model,
                        tokens: completion.total_tokens,
                    };
                    self.cache
                        .put(&request.cache_key, payload.clone(), self.cache_ttl_secs);

                    return Ok(GovernedResponse {
                        content: payload.content,
                        model: payload.model,
                        tokens: payload.tokens,
                        served_from_cache: false,
                        warning: self.token_warning(),
                    });
                }
                Err(e) => {
                    let latency_ms = start.elapsed().as_millis() as u64;
                    let record = self.tracker.record_call(
                        &request.endpoint,
                        &request.model,
                        0,
                        false,
                        latency_ms,
                    );
                    self.journal(record);

                    if !e.is_transient() {
                        return Err(permanent_failure(e));
                    }

                    tracing::warn!(
                        endpoint = %request.endpoint,
                        attempt = attempt + 1,
                        max_attempts = self.retry.max_attempts,
                        error = %e,
                        "upstream attempt failed"
                    );
                    last_error = e.to_string();
                }
            }
        }

        Err(GovernorError::UpstreamUnavailable { last_error })
    }

    pub fn metrics(&self) -> UsageMetrics {
        self.tracker.metrics()
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Clear the call history. The cache is left intact.
    pub fn reset_metrics(&self) {
        self.tracker.reset();
        tracing::info!("usage metrics reset");
    }

    pub fn invalidate_cache(&self, key: &str) -> bool {
        self.cache.invalidate(key)
    }

    pub fn clear_cache(&self) -> usize {
        self.cache.clear()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    fn token_warning(&self) -> Option<TokenWarning> {
        if self.limits.max_tokens_per_day == 0 {
            return None;
        }
        let used = self.tracker.metrics().tokens_used_24h;
        let threshold =
            (self.limits.max_tokens_per_day as f64 * self.token_warn_ratio).ceil() as u64;
        if used >= threshold {
            Some(TokenWarning {
                message: "approaching daily token limit".to_string(),
                tokens_used_24h: used,
                max_tokens_per_day: self.limits.max_tokens_per_day,
            })
        } else {
            None
        }
    }

    fn journal(&self, record: CallRecord) {
        if let Some(ref tx) = self.journal_tx {
            if tx.try_send(record).is_err() {
                tracing::warn!("journal channel full, call record not persisted");
            }
        }
    }
}

fn permanent_failure(err: UpstreamError) -> GovernorError {
    match err {
        // Shape mismatches are boundary parse errors, surfaced without retry.
        UpstreamError::Decode(msg) => GovernorError::InvalidRequest {
            reason: format!("upstream response rejected: {msg}"),
        },
        other => GovernorError::UpstreamUnavailable {
            last_error: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn governor_with(config: &AppConfig) -> Governor {
        let tracker = Arc::new(UsageTracker::new(config.usage.history_cap));
        let cache = Arc::new(ResponseCache::new(config.cache.max_entries));
        let upstream = Arc::new(UpstreamClient::new(&config.upstream).unwrap());
        Governor::new(tracker, cache, upstream, config, None)
    }

    fn test_config() -> AppConfig {
        let mut cfg = AppConfig::load(Some("/nonexistent")).unwrap();
        cfg.upstream.api_key = "pplx-test".to_string();
        cfg
    }

    #[tokio::test]
    async fn test_execute_rejects_empty_messages() {
        let governor = governor_with(&test_config());
        let err = governor
            .execute(GovernedRequest {
                endpoint: "chat".to_string(),
                model: "sonar".to_string(),
                messages: vec![],
                temperature: None,
                max_tokens: None,
                cache_key: "k".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GovernorError::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn test_execute_rejects_blank_model() {
        let governor = governor_with(&test_config());
        let err = governor
            .execute(GovernedRequest {
                endpoint: "chat".to_string(),
                model: "  ".to_string(),
                messages: vec![ChatMessage {
                    role: "user".to_string(),
                    content: "hi".to_string(),
                }],
                temperature: None,
                max_tokens: None,
                cache_key: "k".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GovernorError::InvalidRequest { .. }));
    }

    #[test]
    fn test_token_warning_threshold() {
        let mut cfg = test_config();
        cfg.limits.max_tokens_per_day = 1000;
        cfg.limits.token_warn_ratio = 0.8;
        let governor = governor_with(&cfg);

        governor.tracker.record_call("search", "sonar", 799, true, 10);
        assert!(governor.token_warning().is_none());

        governor.tracker.record_call("search", "sonar", 1, true, 10);
        let warning = governor.token_warning().expect("at threshold");
        assert_eq!(warning.tokens_used_24h, 800);
        assert_eq!(warning.max_tokens_per_day, 1000);
    }

    #[test]
    fn test_reset_metrics_leaves_cache() {
        let governor = governor_with(&test_config());
        governor.tracker.record_call("search", "sonar", 10, true, 10);
        governor.cache.put(
            "k",
            ResponsePayload {
                content: "cached".to_string(),
                model: "sonar".to_string(),
                tokens: 10,
            },
            60,
        );

        governor.reset_metrics();
        assert_eq!(governor.metrics().requests_last_24h, 0);
        assert_eq!(governor.cache_len(), 1);
    }

    #[test]
    fn test_error_mapping_to_app_error() {
        let err: AppError = GovernorError::QuotaExceeded {
            limit_name: "perMinute",
            retry_after_seconds: 12,
        }
        .into();
        assert!(matches!(err, AppError::QuotaExceeded { .. }));

        let err: AppError = GovernorError::InvalidRequest {
            reason: "bad".to_string(),
        }
        .into();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
