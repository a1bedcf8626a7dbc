//! Loader configuration from environment variables

use crate::stale::DEFAULT_STALE_THRESHOLD_MS;
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Default number of concurrent updates sent to the API.
pub const DEFAULT_API_CONCURRENCY: usize = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Configuration for a loader run
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Base URL of the availability API (only needed when sending)
    pub api_url: Option<String>,

    /// Key sent as `x-api-key` with every update
    pub api_key: Option<String>,

    /// Maximum number of in-flight update requests
    pub api_concurrency: usize,

    /// Records older than this are dropped before output
    pub stale_threshold_ms: i64,

    /// Per-request timeout for publisher and API calls
    pub http_timeout: Duration,

    /// Optional deadline for each source pipeline
    pub run_timeout: Option<Duration>,

    /// Release identifier used in the User-Agent
    pub version: String,

    /// Verbose logging
    pub debug: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            api_key: None,
            api_concurrency: DEFAULT_API_CONCURRENCY,
            stale_threshold_ms: DEFAULT_STALE_THRESHOLD_MS,
            http_timeout: Duration::from_secs(30),
            run_timeout: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
            debug: false,
        }
    }
}

impl LoaderConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `API_URL` / `API_KEY` (required only with `--send`)
    /// - `API_CONCURRENCY` (default: 10)
    /// - `STALE_THRESHOLD_HOURS` (default: 24)
    /// - `HTTP_TIMEOUT_SECS` (default: 30)
    /// - `RUN_TIMEOUT_SECS` (default: unset, no deadline)
    /// - `RELEASE`, `COMMIT_SHA`, `GITHUB_SHA` (first one set wins)
    /// - `DEBUG` (any non-empty value)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let api_url = non_empty_var("API_URL");
        if let Some(url) = &api_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::InvalidValue(
                    "API_URL must start with http:// or https://".to_string(),
                ));
            }
        }

        let api_concurrency = env::var("API_CONCURRENCY")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(defaults.api_concurrency);

        let stale_threshold_ms = env::var("STALE_THRESHOLD_HOURS")
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|h| *h > 0.0)
            .map(|h| (h * 60.0 * 60.0 * 1000.0) as i64)
            .unwrap_or(defaults.stale_threshold_ms);

        let http_timeout = env::var("HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.http_timeout);

        let run_timeout = env::var("RUN_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|s| *s > 0)
            .map(Duration::from_secs);

        let version = ["RELEASE", "COMMIT_SHA", "GITHUB_SHA"]
            .iter()
            .find_map(|name| non_empty_var(name))
            .unwrap_or(defaults.version);

        Ok(Self {
            api_url,
            api_key: non_empty_var("API_KEY"),
            api_concurrency,
            stale_threshold_ms,
            http_timeout,
            run_timeout,
            version,
            debug: non_empty_var("DEBUG").is_some(),
        })
    }

    /// User-Agent sent with every outbound request.
    pub fn user_agent(&self) -> String {
        format!("availflow/{}", self.version)
    }

    /// API URL and key, or an error naming the first missing variable.
    pub fn api_credentials(&self) -> Result<(&str, &str), ConfigError> {
        let url = self
            .api_url
            .as_deref()
            .ok_or_else(|| ConfigError::MissingVariable("API_URL".to_string()))?;
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ConfigError::MissingVariable("API_KEY".to_string()))?;
        Ok((url, key))
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: &[&str] = &[
        "API_URL",
        "API_KEY",
        "API_CONCURRENCY",
        "STALE_THRESHOLD_HOURS",
        "HTTP_TIMEOUT_SECS",
        "RUN_TIMEOUT_SECS",
        "RELEASE",
        "COMMIT_SHA",
        "GITHUB_SHA",
        "DEBUG",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    // Env vars are process-global, so both scenarios run in one test.
    #[test]
    fn test_config_from_env() {
        clear_env();

        let config = LoaderConfig::from_env().unwrap();
        assert_eq!(config.api_url, None);
        assert_eq!(config.api_concurrency, 10);
        assert_eq!(config.stale_threshold_ms, DEFAULT_STALE_THRESHOLD_MS);
        assert_eq!(config.http_timeout, Duration::from_secs(30));
        assert_eq!(config.run_timeout, None);
        assert!(!config.debug);
        assert!(matches!(
            config.api_credentials(),
            Err(ConfigError::MissingVariable(ref v)) if v == "API_URL"
        ));

        env::set_var("API_URL", "https://example.org");
        env::set_var("API_KEY", "secret");
        env::set_var("API_CONCURRENCY", "4");
        env::set_var("STALE_THRESHOLD_HOURS", "2");
        env::set_var("RUN_TIMEOUT_SECS", "300");
        env::set_var("RELEASE", "abc123");
        env::set_var("DEBUG", "1");

        let config = LoaderConfig::from_env().unwrap();
        assert_eq!(config.api_credentials().unwrap(), ("https://example.org", "secret"));
        assert_eq!(config.api_concurrency, 4);
        assert_eq!(config.stale_threshold_ms, 2 * 60 * 60 * 1000);
        assert_eq!(config.run_timeout, Some(Duration::from_secs(300)));
        assert_eq!(config.user_agent(), "availflow/abc123");
        assert!(config.debug);

        env::set_var("API_URL", "ftp://example.org");
        assert!(matches!(
            LoaderConfig::from_env(),
            Err(ConfigError::InvalidValue(_))
        ));

        clear_env();
    }
}
