use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub usage: UsageConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: Vec::new(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8090
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("finsight.db")
}

#[derive(Deserialize, Clone)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_base")]
    pub base_url: String,
    /// Bearer credential, injected via FINSIGHT__UPSTREAM__API_KEY.
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_upstream_timeout")]
    pub timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_upstream_base(),
            api_key: String::new(),
            default_model: default_model(),
            timeout_secs: default_upstream_timeout(),
        }
    }
}

// Manual Debug keeps the credential out of debug-formatted config dumps.
impl std::fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("default_model", &self.default_model)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

fn default_upstream_base() -> String {
    "https://api.perplexity.ai".to_string()
}
fn default_model() -> String {
    "sonar".to_string()
}
fn default_upstream_timeout() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    #[serde(default = "default_max_per_minute")]
    pub max_requests_per_minute: u64,
    #[serde(default = "default_max_per_hour")]
    pub max_requests_per_hour: u64,
    #[serde(default = "default_max_per_day")]
    pub max_requests_per_day: u64,
    #[serde(default = "default_max_tokens_per_day")]
    pub max_tokens_per_day: u64,
    #[serde(default = "default_token_warn_ratio")]
    pub token_warn_ratio: f64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_requests_per_minute: default_max_per_minute(),
            max_requests_per_hour: default_max_per_hour(),
            max_requests_per_day: default_max_per_day(),
            max_tokens_per_day: default_max_tokens_per_day(),
            token_warn_ratio: default_token_warn_ratio(),
        }
    }
}

fn default_max_per_minute() -> u64 {
    10
}
fn default_max_per_hour() -> u64 {
    100
}
fn default_max_per_day() -> u64 {
    500
}
fn default_max_tokens_per_day() -> u64 {
    500_000
}
fn default_token_warn_ratio() -> f64 {
    0.8
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl(),
            max_entries: default_cache_max_entries(),
        }
    }
}

fn default_cache_ttl() -> u64 {
    900
}
fn default_cache_max_entries() -> usize {
    1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            base_delay_ms: default_retry_base_delay(),
            max_delay_ms: default_retry_max_delay(),
        }
    }
}

fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_base_delay() -> u64 {
    250
}
fn default_retry_max_delay() -> u64 {
    2000
}

#[derive(Debug, Deserialize, Clone)]
pub struct UsageConfig {
    #[serde(default = "default_history_cap")]
    pub history_cap: usize,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_flush_batch_size")]
    pub flush_batch_size: usize,
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
    #[serde(default = "default_retention_sweep")]
    pub retention_sweep_secs: u64,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            history_cap: default_history_cap(),
            channel_capacity: default_channel_capacity(),
            flush_batch_size: default_flush_batch_size(),
            flush_interval_secs: default_flush_interval(),
            retention_days: default_retention_days(),
            retention_sweep_secs: default_retention_sweep(),
        }
    }
}

fn default_history_cap() -> usize {
    512
}
fn default_channel_capacity() -> usize {
    1024
}
fn default_flush_batch_size() -> usize {
    64
}
fn default_flush_interval() -> u64 {
    5
}
fn default_retention_days() -> u64 {
    30
}
fn default_retention_sweep() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default = "default_rl_per_second")]
    pub per_second: u64,
    #[serde(default = "default_rl_burst")]
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_second: default_rl_per_second(),
            burst_size: default_rl_burst(),
        }
    }
}

fn default_rl_per_second() -> u64 {
    20
}
fn default_rl_burst() -> u32 {
    40
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AuthConfig {
    /// Client API keys. Empty means open access (dev mode).
    #[serde(default)]
    pub api_keys: Vec<String>,
    /// Keys allowed on admin routes. Empty rejects all admin requests.
    #[serde(default)]
    pub admin_keys: Vec<String>,
}

impl AppConfig {
    /// Validate configuration before the server starts.
    pub fn validate(&self) -> Result<(), String> {
        match url::Url::parse(&self.upstream.base_url) {
            Ok(u) if u.scheme() == "http" || u.scheme() == "https" => {}
            Ok(u) => {
                return Err(format!(
                    "upstream.base_url must be http or https, got {}",
                    u.scheme()
                ));
            }
            Err(e) => return Err(format!("upstream.base_url is not a valid URL: {e}")),
        }
        if self.upstream.api_key.is_empty() {
            return Err("upstream.api_key must be set. \
                 Set it via the FINSIGHT__UPSTREAM__API_KEY env var or config.toml."
                .to_string());
        }
        if self.limits.token_warn_ratio <= 0.0 || self.limits.token_warn_ratio > 1.0 {
            return Err("limits.token_warn_ratio must be in (0, 1]".to_string());
        }
        if self.retry.max_attempts == 0 {
            return Err("retry.max_attempts must be at least 1".to_string());
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err("retry.max_delay_ms must be >= retry.base_delay_ms".to_string());
        }
        if self.usage.history_cap == 0 {
            return Err("usage.history_cap must be at least 1".to_string());
        }
        Ok(())
    }

    pub fn load(config_path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = Config::builder();

        // Load from config file
        let path = config_path.unwrap_or("config.toml");
        builder = builder.add_source(File::with_name(path).required(false));

        // Overlay with environment variables (FINSIGHT__SERVER__PORT=8091, etc.)
        builder = builder.add_source(
            Environment::with_prefix("FINSIGHT")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AppConfig {
        let mut cfg = AppConfig::load(Some("/nonexistent")).expect("defaults should load");
        cfg.upstream.api_key = "pplx-test-key".to_string();
        cfg
    }

    #[test]
    fn test_defaults_load() {
        let cfg = AppConfig::load(Some("/nonexistent")).expect("defaults should load");
        assert_eq!(cfg.server.port, 8090);
        assert_eq!(cfg.limits.max_requests_per_minute, 10);
        assert_eq!(cfg.cache.ttl_secs, 900);
        assert_eq!(cfg.retry.max_attempts, 3);
    }

    #[test]
    fn test_validate_requires_api_key() {
        let mut cfg = valid_config();
        cfg.upstream.api_key = String::new();
        let err = cfg.validate().unwrap_err();
        assert!(err.contains("upstream.api_key"));
    }

    #[test]
    fn test_validate_rejects_bad_base_url() {
        let mut cfg = valid_config();
        cfg.upstream.base_url = "not a url".to_string();
        assert!(cfg.validate().is_err());

        cfg.upstream.base_url = "ftp://example.com".to_string();
        let err = cfg.validate().unwrap_err();
        assert!(err.contains("http"));
    }

    #[test]
    fn test_validate_warn_ratio_bounds() {
        let mut cfg = valid_config();
        cfg.limits.token_warn_ratio = 0.0;
        assert!(cfg.validate().is_err());
        cfg.limits.token_warn_ratio = 1.5;
        assert!(cfg.validate().is_err());
        cfg.limits.token_warn_ratio = 1.0;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_retry_bounds() {
        let mut cfg = valid_config();
        cfg.retry.max_attempts = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.retry.base_delay_ms = 5000;
        cfg.retry.max_delay_ms = 1000;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_debug_redacts_credential() {
        let cfg = valid_config();
        let dump = format!("{:?}", cfg.upstream);
        assert!(!dump.contains("pplx-test-key"));
        assert!(dump.contains("<redacted>"));
    }
}
