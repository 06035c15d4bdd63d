use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `json` or `text`
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
        }
    }
}

fn default_database_url() -> String {
    "sqlite:./data/telemetry.db".to_string()
}

/// Event queue and batch flusher tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Upper bound on one sink write, unbounded when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sink_write_timeout_secs: Option<u64>,
    /// Extra attempts for a failed batch; 0 discards on first failure
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            batch_size: default_batch_size(),
            flush_interval_secs: default_flush_interval_secs(),
            poll_timeout_ms: default_poll_timeout_ms(),
            sink_write_timeout_secs: None,
            max_retries: 0,
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

fn default_queue_capacity() -> usize {
    crate::telemetry::queue::DEFAULT_QUEUE_CAPACITY
}

fn default_batch_size() -> usize {
    10
}

fn default_flush_interval_secs() -> u64 {
    5
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

fn default_retry_backoff_ms() -> u64 {
    200
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_per_minute")]
    pub per_minute: u64,
    #[serde(default = "default_per_hour")]
    pub per_hour: u64,
    /// Added to the window length to form the counter TTL
    #[serde(default = "default_window_slack_secs")]
    pub window_slack_secs: u64,
    /// Request paths that bypass the limiter
    #[serde(default = "default_exempt_paths")]
    pub exempt_paths: Vec<String>,
    #[serde(default)]
    pub counter_store: CounterStoreConfig,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            per_minute: default_per_minute(),
            per_hour: default_per_hour(),
            window_slack_secs: default_window_slack_secs(),
            exempt_paths: default_exempt_paths(),
            counter_store: CounterStoreConfig::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_per_minute() -> u64 {
    crate::ratelimit::DEFAULT_PER_MINUTE
}

fn default_per_hour() -> u64 {
    crate::ratelimit::DEFAULT_PER_HOUR
}

fn default_window_slack_secs() -> u64 {
    5
}

fn default_exempt_paths() -> Vec<String> {
    vec!["/health".to_string(), "/metrics".to_string()]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CounterStoreBackend {
    /// Per-process counters, only correct for a single instance
    #[default]
    Memory,
    /// Shared SQLite file, usable by several processes on one host
    Sqlite,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CounterStoreConfig {
    #[serde(default)]
    pub backend: CounterStoreBackend,
    /// Defaults to `database.url` when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Prices in USD per million tokens
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ModelRate {
    /// Case-insensitive substring of the model identifier
    pub pattern: String,
    pub input_per_million: Decimal,
    pub output_per_million: Decimal,
}

impl ModelRate {
    fn new(pattern: &str, input_cents: i64, output_cents: i64) -> Self {
        Self {
            pattern: pattern.to_string(),
            input_per_million: Decimal::new(input_cents, 2),
            output_per_million: Decimal::new(output_cents, 2),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PricingConfig {
    #[serde(default = "default_fallback_input")]
    pub fallback_input_per_million: Decimal,
    #[serde(default = "default_fallback_output")]
    pub fallback_output_per_million: Decimal,
    /// Checked in order, first match wins
    #[serde(default = "default_model_rates")]
    pub models: Vec<ModelRate>,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            fallback_input_per_million: default_fallback_input(),
            fallback_output_per_million: default_fallback_output(),
            models: default_model_rates(),
        }
    }
}

fn default_model_rates() -> Vec<ModelRate> {
    vec![
        ModelRate::new("llama-3.1-8b", 5, 8),
        ModelRate::new("llama3-8b", 5, 8),
        ModelRate::new("llama-3.1-70b", 59, 79),
        ModelRate::new("llama3-70b", 59, 79),
        ModelRate::new("mixtral", 24, 24),
        ModelRate::new("gemma-7b", 7, 7),
        ModelRate::new("gemma2-9b", 20, 20),
    ]
}

fn default_fallback_input() -> Decimal {
    Decimal::new(10, 2)
}

fn default_fallback_output() -> Decimal {
    Decimal::new(10, 2)
}

/// Load configuration from `path` (optional) and `LLM_TELEMETRY__*` environment overrides
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let config = config::Config::builder()
        .add_source(config::File::from(path).required(false))
        .add_source(
            config::Environment::with_prefix("LLM_TELEMETRY")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("rate_limit.exempt_paths"),
        )
        .build()?;

    let cfg: Config = config.try_deserialize()?;
    validate_config(&cfg)?;

    Ok(cfg)
}

pub fn validate_config(cfg: &Config) -> anyhow::Result<()> {
    match cfg.server.log_format.as_str() {
        "json" | "text" => {}
        other => anyhow::bail!("Invalid log format '{}', expected 'json' or 'text'", other),
    }

    if cfg.database.url.is_empty() {
        anyhow::bail!("database.url cannot be empty");
    }

    let pipeline = &cfg.pipeline;
    if pipeline.queue_capacity == 0 {
        anyhow::bail!("pipeline.queue_capacity must be greater than 0");
    }
    if pipeline.batch_size == 0 {
        anyhow::bail!("pipeline.batch_size must be greater than 0");
    }
    if pipeline.batch_size > pipeline.queue_capacity {
        anyhow::bail!(
            "pipeline.batch_size ({}) cannot exceed pipeline.queue_capacity ({})",
            pipeline.batch_size,
            pipeline.queue_capacity
        );
    }
    if pipeline.flush_interval_secs == 0 {
        anyhow::bail!("pipeline.flush_interval_secs must be greater than 0");
    }
    if pipeline.poll_timeout_ms == 0 {
        anyhow::bail!("pipeline.poll_timeout_ms must be greater than 0");
    }
    if pipeline.poll_timeout_ms > pipeline.flush_interval_secs.saturating_mul(1000) {
        anyhow::bail!(
            "pipeline.poll_timeout_ms ({}) cannot exceed the flush interval ({}s)",
            pipeline.poll_timeout_ms,
            pipeline.flush_interval_secs
        );
    }
    if pipeline.sink_write_timeout_secs == Some(0) {
        anyhow::bail!("pipeline.sink_write_timeout_secs must be greater than 0 when set");
    }

    let limits = &cfg.rate_limit;
    if limits.per_minute == 0 || limits.per_hour == 0 {
        anyhow::bail!("rate_limit ceilings must be greater than 0");
    }
    if let Some(url) = &limits.counter_store.url {
        if url.is_empty() {
            anyhow::bail!("rate_limit.counter_store.url cannot be empty when set");
        }
    }

    for rate in &cfg.pricing.models {
        if rate.pattern.is_empty() {
            anyhow::bail!("pricing model pattern cannot be empty");
        }
        if rate.input_per_million.is_sign_negative() || rate.output_per_million.is_sign_negative() {
            anyhow::bail!("pricing for '{}' cannot be negative", rate.pattern);
        }
    }

    Ok(())
}
