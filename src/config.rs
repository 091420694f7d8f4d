//! Configuration types.

use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Engine configuration: rate ceilings, retry policy, concurrency caps.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Sends per minute across all jobs.
    pub global_rate_per_minute: u32,
    /// Burst capacity of the global bucket.
    pub global_burst: u32,
    /// Optional per-job ceiling (sends per minute).
    pub job_rate_per_minute: Option<u32>,
    /// Burst capacity of each per-job bucket.
    pub job_burst: u32,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Backoff base: the first retry waits this long.
    pub retry_base_delay: Duration,
    /// Backoff ceiling.
    pub retry_max_delay: Duration,
    /// A send taking longer than this counts as a transient failure.
    pub send_timeout: Duration,
    /// Maximum number of active (non-terminal) jobs.
    pub max_concurrent_jobs: usize,
    /// Maximum outstanding sends for a single job.
    pub max_in_flight_per_job: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            // Conservative default that keeps the channel from flagging us.
            global_rate_per_minute: 30,
            global_burst: 5,
            job_rate_per_minute: None,
            job_burst: 5,
            max_retries: 3,
            retry_base_delay: Duration::from_secs(5),
            retry_max_delay: Duration::from_secs(300), // 5 minutes
            send_timeout: Duration::from_secs(30),
            max_concurrent_jobs: 5,
            max_in_flight_per_job: 5,
        }
    }
}

impl EngineConfig {
    /// Build config from `BULK_SEND_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let global_burst = env_parse("BULK_SEND_BURST")?.unwrap_or(defaults.global_burst);
        let config = Self {
            global_rate_per_minute: env_parse("BULK_SEND_RATE_PER_MINUTE")?
                .unwrap_or(defaults.global_rate_per_minute),
            global_burst,
            job_rate_per_minute: env_parse("BULK_SEND_JOB_RATE_PER_MINUTE")?,
            job_burst: env_parse("BULK_SEND_JOB_BURST")?.unwrap_or(defaults.job_burst),
            max_retries: env_parse("BULK_SEND_MAX_RETRIES")?.unwrap_or(defaults.max_retries),
            retry_base_delay: env_parse("BULK_SEND_RETRY_BASE_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_base_delay),
            retry_max_delay: env_parse("BULK_SEND_RETRY_MAX_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_max_delay),
            send_timeout: env_parse("BULK_SEND_SEND_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.send_timeout),
            max_concurrent_jobs: env_parse("BULK_SEND_MAX_CONCURRENT_JOBS")?
                .unwrap_or(defaults.max_concurrent_jobs),
            max_in_flight_per_job: env_parse("BULK_SEND_MAX_IN_FLIGHT")?
                .unwrap_or(global_burst as usize),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the dispatcher cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.global_rate_per_minute == 0 {
            return Err(invalid("global_rate_per_minute", "must be greater than zero"));
        }
        if self.global_burst == 0 || self.job_burst == 0 {
            return Err(invalid("burst", "must be greater than zero"));
        }
        if self.job_rate_per_minute == Some(0) {
            return Err(invalid("job_rate_per_minute", "must be greater than zero"));
        }
        if self.retry_base_delay > self.retry_max_delay {
            return Err(invalid(
                "retry_base_delay",
                "must not exceed retry_max_delay",
            ));
        }
        if self.max_concurrent_jobs == 0 || self.max_in_flight_per_job == 0 {
            return Err(invalid("concurrency", "limits must be greater than zero"));
        }
        Ok(())
    }
}

/// Per-client HTTP request allowances, per minute, by endpoint class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestLimits {
    pub general_per_minute: u32,
    /// Upload endpoints (parsing is expensive).
    pub upload_per_minute: u32,
    /// Message preview and send endpoints.
    pub send_per_minute: u32,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            general_per_minute: 100,
            upload_per_minute: 5,
            send_per_minute: 30,
        }
    }
}

impl RequestLimits {
    /// `None` when `BULK_SEND_REQUEST_LIMITS_ENABLED=false`.
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        if !env_parse("BULK_SEND_REQUEST_LIMITS_ENABLED")?.unwrap_or(true) {
            return Ok(None);
        }
        let defaults = Self::default();
        let limits = Self {
            general_per_minute: env_parse("BULK_SEND_GENERAL_REQUESTS_PER_MINUTE")?
                .unwrap_or(defaults.general_per_minute),
            upload_per_minute: env_parse("BULK_SEND_UPLOAD_REQUESTS_PER_MINUTE")?
                .unwrap_or(defaults.upload_per_minute),
            send_per_minute: env_parse("BULK_SEND_SEND_REQUESTS_PER_MINUTE")?
                .unwrap_or(defaults.send_per_minute),
        };
        limits.validate()?;
        Ok(Some(limits))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.general_per_minute == 0 || self.upload_per_minute == 0 || self.send_per_minute == 0 {
            return Err(invalid("request_limits", "must be greater than zero"));
        }
        Ok(())
    }
}

/// HTTP server and transport settings for the binary.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub allowed_origins: Vec<String>,
    /// Gateway URL for outbound messages. `None` means log-only delivery.
    pub transport_url: Option<String>,
    pub transport_token: Option<SecretString>,
    /// Directory for the rolling log file, if any.
    pub log_dir: Option<String>,
    /// Per-client request throttling. `None` disables it.
    pub request_limits: Option<RequestLimits>,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = env_parse("BULK_SEND_PORT")?.unwrap_or(3001);

        let allowed_origins: Vec<String> = std::env::var("BULK_SEND_ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000,http://localhost:5173".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            port,
            allowed_origins,
            transport_url: std::env::var("BULK_SEND_TRANSPORT_URL").ok(),
            transport_token: std::env::var("BULK_SEND_TRANSPORT_TOKEN")
                .ok()
                .map(SecretString::from),
            log_dir: std::env::var("BULK_SEND_LOG_DIR").ok(),
            request_limits: RequestLimits::from_env()?,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| invalid(key, &format!("cannot parse {raw:?}"))),
        Err(_) => Ok(None),
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}
