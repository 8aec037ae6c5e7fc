use anyhow::{Context, Result};
use serde::Deserialize;
use validator::{Validate, ValidationError};

// Default constants
pub const DEFAULT_API_VERSION: &str = "2020-07-15";
pub const DEFAULT_USER_AGENT: &str = concat!("cosmosql/", env!("CARGO_PKG_VERSION"));

pub const DEFAULT_THROTTLE_MAX_ATTEMPTS: u32 = 9;
pub const DEFAULT_THROTTLE_MAX_WAIT_MS: u64 = 30_000;
pub const DEFAULT_BASE_DELAY_MS: u64 = 100;
pub const DEFAULT_MAX_DELAY_MS: u64 = 5_000;
pub const DEFAULT_RETRY_WITH_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_WITH_MIN_DELAY_MS: u64 = 10;
pub const DEFAULT_RETRY_WITH_MAX_DELAY_MS: u64 = 50;
pub const DEFAULT_TRANSIENT_MAX_ATTEMPTS: u32 = 4;

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

pub const DEFAULT_LOW_WATER_MARK: usize = 1;
pub const DEFAULT_METADATA_CACHE_CAPACITY: u64 = 1_000;

pub const DEFAULT_LOG_FILTER: &str = "info";

/// Retry budgets for the request pipeline.
#[derive(Debug, Deserialize, Clone, Copy, Validate)]
#[validate(schema(function = "validate_retry_window"))]
pub struct RetrySettings {
    /// Retries granted to 429 responses
    #[serde(default = "default_throttle_max_attempts")]
    pub max_attempts: u32,
    /// Cumulative sleep allowed across 429 retries of one logical request
    #[serde(default = "default_throttle_max_wait_ms")]
    #[validate(range(min = 1))]
    pub max_wait_ms: u64,
    #[serde(default = "default_base_delay_ms")]
    #[validate(range(min = 1))]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_retry_with_max_attempts")]
    pub retry_with_max_attempts: u32,
    #[serde(default = "default_retry_with_min_delay_ms")]
    pub retry_with_min_delay_ms: u64,
    #[serde(default = "default_retry_with_max_delay_ms")]
    pub retry_with_max_delay_ms: u64,
    /// Retries granted to 408/5xx/network failures of idempotent requests
    #[serde(default = "default_transient_max_attempts")]
    pub transient_max_attempts: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_THROTTLE_MAX_ATTEMPTS,
            max_wait_ms: DEFAULT_THROTTLE_MAX_WAIT_MS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            retry_with_max_attempts: DEFAULT_RETRY_WITH_MAX_ATTEMPTS,
            retry_with_min_delay_ms: DEFAULT_RETRY_WITH_MIN_DELAY_MS,
            retry_with_max_delay_ms: DEFAULT_RETRY_WITH_MAX_DELAY_MS,
            transient_max_attempts: DEFAULT_TRANSIENT_MAX_ATTEMPTS,
        }
    }
}

fn default_throttle_max_attempts() -> u32 {
    DEFAULT_THROTTLE_MAX_ATTEMPTS
}
fn default_throttle_max_wait_ms() -> u64 {
    DEFAULT_THROTTLE_MAX_WAIT_MS
}
fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}
fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}
fn default_retry_with_max_attempts() -> u32 {
    DEFAULT_RETRY_WITH_MAX_ATTEMPTS
}
fn default_retry_with_min_delay_ms() -> u64 {
    DEFAULT_RETRY_WITH_MIN_DELAY_MS
}
fn default_retry_with_max_delay_ms() -> u64 {
    DEFAULT_RETRY_WITH_MAX_DELAY_MS
}
fn default_transient_max_attempts() -> u32 {
    DEFAULT_TRANSIENT_MAX_ATTEMPTS
}

fn validate_retry_window(s: &RetrySettings) -> Result<(), ValidationError> {
    if s.base_delay_ms > s.max_delay_ms {
        return Err(ValidationError::new("base_delay_exceeds_max_delay"));
    }
    if s.retry_with_min_delay_ms > s.retry_with_max_delay_ms {
        return Err(ValidationError::new("retry_with_window_inverted"));
    }
    Ok(())
}

/// Cross-partition executor limits.
#[derive(Debug, Deserialize, Clone, Validate)]
pub struct ExecutorSettings {
    /// Concurrent page fetches per query; `None` means one per targeted range.
    #[serde(default)]
    #[validate(range(min = 1))]
    pub max_concurrency: Option<usize>,
    /// A cursor is refilled once its buffer holds fewer rows than this.
    #[serde(default = "default_low_water_mark")]
    #[validate(range(min = 1))]
    pub low_water_mark: usize,
    /// `x-ms-max-item-count` sent on query pages when the query does not set one.
    #[serde(default)]
    pub max_item_count: Option<u32>,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_concurrency: None,
            low_water_mark: DEFAULT_LOW_WATER_MARK,
            max_item_count: None,
        }
    }
}

fn default_low_water_mark() -> usize {
    DEFAULT_LOW_WATER_MARK
}

#[derive(Debug, Deserialize, Clone, Validate)]
pub struct TransportSettings {
    #[serde(default = "default_api_version")]
    #[validate(custom(function = "validate_api_version"))]
    pub api_version: String,
    #[serde(default = "default_request_timeout_ms")]
    #[validate(range(min = 1))]
    pub request_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub insecure_skip_verify: bool,
    #[serde(default)]
    #[validate(url)]
    pub proxy: Option<String>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Capacity of the container-metadata cache
    #[serde(default = "default_metadata_cache_capacity")]
    pub metadata_cache_capacity: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            api_version: default_api_version(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            insecure_skip_verify: false,
            proxy: None,
            user_agent: default_user_agent(),
            metadata_cache_capacity: DEFAULT_METADATA_CACHE_CAPACITY,
        }
    }
}

fn default_api_version() -> String {
    DEFAULT_API_VERSION.to_string()
}
fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}
fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}
fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}
fn default_metadata_cache_capacity() -> u64 {
    DEFAULT_METADATA_CACHE_CAPACITY
}

/// Accepts `YYYY-MM-DD` versions no older than the minimum the driver speaks.
pub fn validate_api_version(version: &str) -> Result<(), ValidationError> {
    let parts: Vec<&str> = version.split('-').collect();
    let well_formed = parts.len() == 3
        && parts[0].len() == 4
        && parts[1].len() == 2
        && parts[2].len() == 2
        && parts.iter().all(|p| p.chars().all(|c| c.is_ascii_digit()));
    if !well_formed {
        return Err(ValidationError::new("malformed_api_version"));
    }
    // Zero-padded dates compare correctly as strings.
    if version < DEFAULT_API_VERSION {
        return Err(ValidationError::new("api_version_too_old"));
    }
    Ok(())
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

#[derive(Debug, Deserialize, Default, Clone, Validate)]
pub struct DriverSettings {
    #[serde(default)]
    #[validate(nested)]
    pub retry: RetrySettings,
    #[serde(default)]
    #[validate(nested)]
    pub executor: ExecutorSettings,
    #[serde(default)]
    #[validate(nested)]
    pub transport: TransportSettings,
    #[serde(default)]
    pub logging: LogSettings,
}

impl DriverSettings {
    pub fn from_file(path: &str) -> Result<Self> {
        let builder = config::Config::builder();

        let builder = if std::path::Path::new(path).exists() {
            builder.add_source(config::File::with_name(path))
        } else {
            builder
        };

        // COSMOSQL__RETRY__MAX_ATTEMPTS maps to retry.max_attempts, etc.
        let builder = builder.add_source(
            config::Environment::with_prefix("COSMOSQL")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().context("Failed to build driver settings")?;

        let settings: DriverSettings = cfg
            .try_deserialize()
            .context("Failed to deserialize driver settings")?;

        settings
            .validate()
            .map_err(|e| anyhow::anyhow!("Driver settings validation failed: {:?}", e))?;

        Ok(settings)
    }
}
