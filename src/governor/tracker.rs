use crate::config::LimitsConfig;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// One upstream call attempt, successful or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub endpoint: String,
    pub model: String,
    pub tokens: u64,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub latency_ms: u64,
}

/// Rolling usage snapshot. Counters are recomputed from `history` at query
/// time; there is no separately incremented state that can drift.
#[derive(Debug, Clone, Serialize)]
pub struct UsageMetrics {
    pub requests_last_minute: u64,
    pub requests_last_hour: u64,
    pub requests_last_24h: u64,
    pub tokens_used_24h: u64,
    pub quota_resets: DateTime<Utc>,
    pub history: Vec<CallRecord>,
}

/// Configured ceilings, immutable after load.
#[derive(Debug, Clone, Serialize)]
pub struct Limits {
    pub max_requests_per_minute: u64,
    pub max_requests_per_hour: u64,
    pub max_requests_per_day: u64,
    pub max_tokens_per_day: u64,
}

impl From<&LimitsConfig> for Limits {
    fn from(cfg: &LimitsConfig) -> Self {
        Self {
            max_requests_per_minute: cfg.max_requests_per_minute,
            max_requests_per_hour: cfg.max_requests_per_hour,
            max_requests_per_day: cfg.max_requests_per_day,
            max_tokens_per_day: cfg.max_tokens_per_day,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    PerMinute,
    PerHour,
    PerDay,
    TokensPerDay,
}

impl LimitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitKind::PerMinute => "perMinute",
            LimitKind::PerHour => "perHour",
            LimitKind::PerDay => "perDay",
            LimitKind::TokensPerDay => "tokensPerDay",
        }
    }
}

/// A limit that would be exceeded by a prospective call.
#[derive(Debug, Clone, Copy)]
pub struct QuotaHit {
    pub limit: LimitKind,
    pub retry_after_seconds: u64,
}

/// Shared call history with rolling-window accounting.
///
/// The history is the single source of truth: every counter is derived by
/// filtering it against the current clock reading. Entries are dropped when
/// they fall out of the 24h window (lazily, on read) or when the count cap
/// is exceeded (oldest first, on append).
pub struct UsageTracker {
    history: Mutex<VecDeque<CallRecord>>,
    cap: usize,
}

impl UsageTracker {
    pub fn new(cap: usize) -> Self {
        Self {
            history: Mutex::new(VecDeque::with_capacity(cap.min(1024))),
            cap,
        }
    }

    /// Append a record timestamped now. Returns a copy for journaling.
    pub fn record_call(
        &self,
        endpoint: &str,
        model: &str,
        tokens: u64,
        success: bool,
        latency_ms: u64,
    ) -> CallRecord {
        let record = CallRecord {
            endpoint: endpoint.to_string(),
            model: model.to_string(),
            tokens,
            timestamp: Utc::now(),
            success,
            latency_ms,
        };
        self.push(record.clone());
        record
    }

    /// Append a pre-timestamped record (startup seeding, tests).
    pub fn push(&self, record: CallRecord) {
        let mut history = self.history.lock();
        history.push_back(record);
        while history.len() > self.cap {
            history.pop_front();
        }
    }

    pub fn metrics(&self) -> UsageMetrics {
        self.metrics_at(Utc::now())
    }

    pub fn metrics_at(&self, now: DateTime<Utc>) -> UsageMetrics {
        let mut history = self.history.lock();
        prune_expired(&mut history, now);

        let minute_floor = now - Duration::minutes(1);
        let hour_floor = now - Duration::hours(1);

        let mut requests_last_minute = 0u64;
        let mut requests_last_hour = 0u64;
        let mut requests_last_24h = 0u64;
        let mut tokens_used_24h = 0u64;

        for record in history.iter() {
            requests_last_24h += 1;
            tokens_used_24h += record.tokens;
            if record.timestamp >= hour_floor {
                requests_last_hour += 1;
            }
            if record.timestamp >= minute_floor {
                requests_last_minute += 1;
            }
        }

        let quota_resets = history
            .front()
            .map(|r| r.timestamp + Duration::hours(24))
            .unwrap_or(now);

        UsageMetrics {
            requests_last_minute,
            requests_last_hour,
            requests_last_24h,
            tokens_used_24h,
            quota_resets,
            history: history.iter().cloned().collect(),
        }
    }

    /// Clear all history. No error conditions.
    pub fn reset(&self) {
        self.history.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.history.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.lock().is_empty()
    }

    /// Check whether a prospective call would exceed any configured limit.
    /// Returns the first violated limit with the seconds until its window's
    /// oldest counted entry expires.
    pub fn quota_check(&self, limits: &Limits) -> Result<(), QuotaHit> {
        self.quota_check_at(limits, Utc::now())
    }

    pub fn quota_check_at(&self, limits: &Limits, now: DateTime<Utc>) -> Result<(), QuotaHit> {
        let mut history = self.history.lock();
        prune_expired(&mut history, now);

        let checks = [
            (LimitKind::PerMinute, Duration::minutes(1), limits.max_requests_per_minute),
            (LimitKind::PerHour, Duration::hours(1), limits.max_requests_per_hour),
            (LimitKind::PerDay, Duration::hours(24), limits.max_requests_per_day),
        ];

        for (kind, window, max) in checks {
            let floor = now - window;
            let count = history.iter().filter(|r| r.timestamp >= floor).count() as u64;
            if count >= max {
                let oldest = history
                    .iter()
                    .find(|r| r.timestamp >= floor)
                    .map(|r| r.timestamp)
                    .unwrap_or(now);
                return Err(QuotaHit {
                    limit: kind,
                    retry_after_seconds: seconds_until(oldest + window, now),
                });
            }
        }

        let tokens: u64 = history.iter().map(|r| r.tokens).sum();
        if tokens >= limits.max_tokens_per_day {
            let oldest = history
                .iter()
                .find(|r| r.tokens > 0)
                .or_else(|| history.front())
                .map(|r| r.timestamp)
                .unwrap_or(now);
            return Err(QuotaHit {
                limit: LimitKind::TokensPerDay,
                retry_after_seconds: seconds_until(oldest + Duration::hours(24), now),
            });
        }

        Ok(())
    }
}

/// Drop entries older than the longest tracked window (24h).
fn prune_expired(history: &mut VecDeque<CallRecord>, now: DateTime<Utc>) {
    let floor = now - Duration::hours(24);
    while let Some(front) = history.front() {
        if front.timestamp < floor {
            history.pop_front();
        } else {
            break;
        }
    }
}

fn seconds_until(deadline: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let secs = (deadline - now).num_seconds();
    secs.max(1) as u64
}
