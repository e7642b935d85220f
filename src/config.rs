//! Configuration for the rotation gateway.
//!
//! Every tunable named in the data model's configuration table is recognized
//! here as an environment variable, with its documented default applied when
//! unset. Durations are read as whole seconds (or milliseconds where the
//! default is sub-second) and parsed with [`ConfigError::InvalidValue`] on
//! failure, matching this codebase's existing `Config::from_env` shape.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

fn env_duration_secs(name: &str, default: u64) -> Result<Duration, ConfigError> {
    match std::env::var(name) {
        Ok(v) => v
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(Duration::from_secs(default)),
    }
}

fn env_duration_millis(name: &str, default: u64) -> Result<Duration, ConfigError> {
    match std::env::var(name) {
        Ok(v) => v
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(Duration::from_millis(default)),
    }
}

fn env_u32(name: &str, default: u32) -> Result<u32, ConfigError> {
    match std::env::var(name) {
        Ok(v) => v
            .parse::<u32>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

fn env_usize(name: &str, default: usize) -> Result<usize, ConfigError> {
    match std::env::var(name) {
        Ok(v) => v
            .parse::<usize>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

fn env_f64(name: &str, default: f64) -> Result<f64, ConfigError> {
    match std::env::var(name) {
        Ok(v) => v
            .parse::<f64>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Validate that a configured endpoint is a well-formed absolute URL,
/// catching a typo'd `UPSTREAM_BASE_URL`/`OAUTH_REFRESH_URL` at startup
/// rather than on the first outbound request.
fn validate_url(name: &str, value: &str) -> Result<(), ConfigError> {
    url::Url::parse(value)
        .map(|_| ())
        .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string()))
}

/// The fallback chain tried, in order, on a 429 for the originally requested
/// model: flash → pro → pro-3.1.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub default_model: String,
    pub fallback_model: String,
    pub fallback_model_v2: String,
    /// Upstream model name that is rewritten to `fallback_model` before the
    /// first call; not natively supported but commonly requested.
    pub unsupported_preview_model: String,
}

impl ModelConfig {
    /// The fallback chain in trial order: the requested model itself, then
    /// whichever of the two configured fallbacks it is not already.
    pub fn fallback_chain(&self, requested: &str) -> Vec<String> {
        let mut chain = vec![requested.to_string()];
        for candidate in [&self.fallback_model, &self.fallback_model_v2] {
            if !chain.contains(candidate) {
                chain.push(candidate.clone());
            }
        }
        chain
    }
}

/// Gateway configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_path: PathBuf,

    /// Rounds of the outer rotation loop.
    pub max_attempts: u32,
    /// Sleep between candidates within one round.
    pub inter_identity_stagger: Duration,
    /// Base of the exponential backoff curve.
    pub base_retry_delay: Duration,
    /// Cap of the exponential backoff curve.
    pub max_retry_delay: Duration,
    /// Jitter sampled uniformly in `[-factor, +factor]`.
    pub jitter_factor: f64,

    /// Per-identity request budget.
    pub rate_limit_max: u32,
    /// Per-identity window length.
    pub rate_limit_window: Duration,

    /// Process-wide outbound concurrency cap.
    pub concurrency_cap: usize,

    /// Active-identity cache TTL.
    pub identity_cache_ttl: Duration,
    /// Refresh threshold before expiry.
    pub token_refresh_margin: Duration,

    /// Durable cooldown used by the background reactivator.
    pub exhaustion_cooldown: Duration,
    /// Reactivator sweep interval.
    pub reactivator_interval: Duration,

    pub probe_margin: Duration,
    pub min_probe_interval: Duration,

    pub models: ModelConfig,

    /// Unary request timeout.
    pub unary_timeout: Duration,
    /// Streaming read timeout.
    pub stream_timeout: Duration,

    /// Inbound request body size limit.
    pub max_body_bytes: usize,

    /// Upstream base URL (Code-Assist endpoint).
    pub upstream_base_url: String,
    /// OAuth token-refresh endpoint.
    pub oauth_refresh_url: String,
}

impl Config {
    /// Load configuration from environment variables, applying the
    /// documented default for every tunable left unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env_string("HOST", "0.0.0.0");
        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|e| ConfigError::InvalidValue("PORT".to_string(), format!("{e}")))?;
        let database_path = std::env::var("DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("gateway.sqlite3"));

        let models = ModelConfig {
            default_model: env_string("DEFAULT_MODEL", "gemini-2.5-flash"),
            fallback_model: env_string("FALLBACK_MODEL", "gemini-2.5-pro"),
            fallback_model_v2: env_string("FALLBACK_MODEL_V2", "gemini-3.1-pro"),
            unsupported_preview_model: env_string(
                "UNSUPPORTED_PREVIEW_MODEL",
                "gemini-3.1-pro-preview",
            ),
        };

        let upstream_base_url = env_string("UPSTREAM_BASE_URL", "https://cloudcode-pa.googleapis.com");
        let oauth_refresh_url = env_string("OAUTH_REFRESH_URL", "https://oauth2.googleapis.com/token");
        validate_url("UPSTREAM_BASE_URL", &upstream_base_url)?;
        validate_url("OAUTH_REFRESH_URL", &oauth_refresh_url)?;

        Ok(Self {
            host,
            port,
            database_path,
            max_attempts: env_u32("MAX_ATTEMPTS", 5)?,
            inter_identity_stagger: env_duration_millis("INTER_IDENTITY_STAGGER", 150)?,
            base_retry_delay: env_duration_secs("BASE_RETRY_DELAY", 2)?,
            max_retry_delay: env_duration_secs("MAX_RETRY_DELAY", 60)?,
            jitter_factor: env_f64("JITTER_FACTOR", 0.2)?,
            rate_limit_max: env_u32("RATE_LIMIT_MAX", 60)?,
            rate_limit_window: env_duration_secs("RATE_LIMIT_WINDOW", 60)?,
            concurrency_cap: env_usize("CONCURRENCY_CAP", 3)?,
            identity_cache_ttl: env_duration_secs("IDENTITY_CACHE_TTL", 5)?,
            token_refresh_margin: env_duration_secs("TOKEN_REFRESH_MARGIN", 5 * 60)?,
            exhaustion_cooldown: env_duration_secs("EXHAUSTION_COOLDOWN", 60 * 60)?,
            reactivator_interval: env_duration_secs("REACTIVATOR_INTERVAL", 5 * 60)?,
            probe_margin: env_duration_secs("PROBE_MARGIN", 2 * 60)?,
            min_probe_interval: env_duration_secs("MIN_PROBE_INTERVAL", 30)?,
            models,
            unary_timeout: env_duration_secs("UNARY_TIMEOUT", 30)?,
            stream_timeout: env_duration_secs("STREAM_TIMEOUT", 120)?,
            max_body_bytes: env_usize("MAX_BODY_BYTES", 50 * 1024 * 1024)?,
            upstream_base_url,
            oauth_refresh_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_url_accepts_https_and_rejects_garbage() {
        assert!(validate_url("UPSTREAM_BASE_URL", "https://cloudcode-pa.googleapis.com").is_ok());
        assert!(validate_url("UPSTREAM_BASE_URL", "not a url").is_err());
    }

    #[test]
    fn fallback_chain_skips_duplicate_when_requested_is_already_a_fallback() {
        let models = ModelConfig {
            default_model: "gemini-2.5-flash".to_string(),
            fallback_model: "gemini-2.5-pro".to_string(),
            fallback_model_v2: "gemini-3.1-pro".to_string(),
            unsupported_preview_model: "gemini-3.1-pro-preview".to_string(),
        };
        let chain = models.fallback_chain("gemini-2.5-pro");
        assert_eq!(chain, vec!["gemini-2.5-pro", "gemini-3.1-pro"]);
    }

    #[test]
    fn fallback_chain_full_for_flash() {
        let models = ModelConfig {
            default_model: "gemini-2.5-flash".to_string(),
            fallback_model: "gemini-2.5-pro".to_string(),
            fallback_model_v2: "gemini-3.1-pro".to_string(),
            unsupported_preview_model: "gemini-3.1-pro-preview".to_string(),
        };
        let chain = models.fallback_chain("gemini-2.5-flash");
        assert_eq!(
            chain,
            vec!["gemini-2.5-flash", "gemini-2.5-pro", "gemini-3.1-pro"]
        );
    }
}
