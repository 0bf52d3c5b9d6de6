//! Configuration module for the magic aggregator service.
//!
//! Settings come from environment variables, with validated bounds and
//! defaults for everything that is not set.

use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Default bind address for the ingress HTTP server
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";

/// Default component name, used in log fields
const DEFAULT_COMPONENT_NAME: &str = "magic";

/// Default base URL of the downstream metrics endpoint
const DEFAULT_EXPORT_URL: &str = "http://localhost:9090";

/// Path appended to the export base URL
const EXPORT_PATH: &str = "/v1/metrics";

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default lifetime of a pending request entry
const DEFAULT_PENDING_TTL_SECS: u64 = 300;
const MAX_PENDING_TTL_SECS: u64 = 86_400;

/// Default cap on simultaneously pending request entries
const DEFAULT_MAX_PENDING: usize = 10_000;
const MAX_MAX_PENDING: usize = 1_000_000;

/// Default interval between background expiry sweeps
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;
const MAX_SWEEP_INTERVAL_SECS: u64 = 3_600;

/// Where completed batches go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportMode {
    /// Log each completed batch as pretty-printed JSON
    Log,

    /// POST each completed batch to `export_url`
    Http,
}

impl FromStr for ExportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "log" => Ok(ExportMode::Log),
            "http" => Ok(ExportMode::Http),
            other => Err(format!("'{}' is not one of: log, http", other)),
        }
    }
}

impl fmt::Display for ExportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportMode::Log => write!(f, "log"),
            ExportMode::Http => write!(f, "http"),
        }
    }
}

/// Configuration for the magic aggregator service.
///
/// All settings can be configured via environment variables:
/// - `MAGIC_LISTEN_ADDR`: ingress bind address (default: 0.0.0.0:8080)
/// - `MAGIC_COMPONENT_NAME`: name used in logs (default: magic)
/// - `MAGIC_EXPORT_MODE`: `log` or `http` (default: log)
/// - `MAGIC_EXPORT_URL`: downstream base URL (default: http://localhost:9090)
/// - `MAGIC_REQUEST_TIMEOUT_SECS`: HTTP request timeout (default: 30)
/// - `MAGIC_MAX_RETRIES`: export retry attempts (default: 3)
/// - `MAGIC_PENDING_TTL_SECS`: pending entry lifetime (default: 300)
/// - `MAGIC_MAX_PENDING`: pending entry cap (default: 10000)
/// - `MAGIC_SWEEP_INTERVAL_SECS`: expiry sweep period (default: 30)
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the ingress server binds to
    pub listen_addr: SocketAddr,

    /// Component name, attached to log output
    pub component_name: String,

    /// Downstream consumer selection
    pub export_mode: ExportMode,

    /// Base URL of the downstream endpoint
    pub export_base_url: String,

    /// Full URL completed batches are posted to
    pub export_url: String,

    /// HTTP request timeout duration
    pub request_timeout: Duration,

    /// Maximum number of retry attempts for failed exports
    pub max_retries: u32,

    /// How long a pending request entry may wait for its remaining fragments
    pub pending_ttl: Duration,

    /// Maximum number of request entries pending at once
    pub max_pending: usize,

    /// Period of the background expiry sweep
    pub sweep_interval: Duration,
}

/// Error type for configuration loading failures
#[derive(Debug, Error)]
#[error("Configuration error for {env_var}: {message}")]
pub struct ConfigError {
    pub message: String,
    pub env_var: String,
}

impl ConfigError {
    fn new(env_var: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            env_var: env_var.to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` naming the offending variable when a value does
    /// not parse or falls outside its allowed range.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use magic_aggregator::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Listening on: {}", config.listen_addr);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// `from_env` is this with `std::env::var`; tests pass a map instead.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_addr = {
            let env_var = "MAGIC_LISTEN_ADDR";
            let raw = lookup(env_var).unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
            raw.trim().parse::<SocketAddr>().map_err(|_| {
                ConfigError::new(env_var, format!("'{}' is not a valid socket address", raw))
            })?
        };

        let component_name = lookup("MAGIC_COMPONENT_NAME")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_COMPONENT_NAME.to_string());

        let export_mode = match lookup("MAGIC_EXPORT_MODE") {
            Some(raw) => raw
                .parse::<ExportMode>()
                .map_err(|e| ConfigError::new("MAGIC_EXPORT_MODE", e))?,
            None => ExportMode::Log,
        };

        let export_base_url = lookup("MAGIC_EXPORT_URL")
            .unwrap_or_else(|| DEFAULT_EXPORT_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        if !export_base_url.starts_with("http://") && !export_base_url.starts_with("https://") {
            return Err(ConfigError::new(
                "MAGIC_EXPORT_URL",
                format!("'{}' must start with http:// or https://", export_base_url),
            ));
        }

        let export_url = format!("{}{}", export_base_url, EXPORT_PATH);

        let request_timeout_secs = parse_bounded(
            &lookup,
            "MAGIC_REQUEST_TIMEOUT_SECS",
            DEFAULT_REQUEST_TIMEOUT_SECS,
            1,
            600,
        )?;

        let max_retries = parse_bounded(&lookup, "MAGIC_MAX_RETRIES", DEFAULT_MAX_RETRIES, 0, 10)?;

        let pending_ttl_secs = parse_bounded(
            &lookup,
            "MAGIC_PENDING_TTL_SECS",
            DEFAULT_PENDING_TTL_SECS,
            1,
            MAX_PENDING_TTL_SECS,
        )?;

        let max_pending = parse_bounded(
            &lookup,
            "MAGIC_MAX_PENDING",
            DEFAULT_MAX_PENDING,
            1,
            MAX_MAX_PENDING,
        )?;

        let sweep_interval_secs = parse_bounded(
            &lookup,
            "MAGIC_SWEEP_INTERVAL_SECS",
            DEFAULT_SWEEP_INTERVAL_SECS,
            1,
            MAX_SWEEP_INTERVAL_SECS,
        )?;

        Ok(Self {
            listen_addr,
            component_name,
            export_mode,
            export_base_url,
            export_url,
            request_timeout: Duration::from_secs(request_timeout_secs),
            max_retries,
            pending_ttl: Duration::from_secs(pending_ttl_secs),
            max_pending,
            sweep_interval: Duration::from_secs(sweep_interval_secs),
        })
    }
}

/// Parse a numeric variable, falling back to `default` when unset and
/// rejecting values outside `min..=max`.
fn parse_bounded<F, T>(lookup: &F, env_var: &str, default: T, min: T, max: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + PartialOrd + fmt::Display + Copy,
{
    let Some(value) = lookup(env_var) else {
        return Ok(default);
    };

    let parsed: T = value
        .trim()
        .parse()
        .map_err(|_| ConfigError::new(env_var, format!("'{}' is not a valid number", value)))?;

    if parsed < min {
        return Err(ConfigError::new(
            env_var,
            format!("{} is below minimum ({})", parsed, min),
        ));
    }

    if parsed > max {
        return Err(ConfigError::new(
            env_var,
            format!("{} exceeds maximum ({})", parsed, max),
        ));
    }

    Ok(parsed)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            component_name: DEFAULT_COMPONENT_NAME.to_string(),
            export_mode: ExportMode::Log,
            export_base_url: DEFAULT_EXPORT_URL.to_string(),
            export_url: format!("{}{}", DEFAULT_EXPORT_URL, EXPORT_PATH),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            pending_ttl: Duration::from_secs(DEFAULT_PENDING_TTL_SECS),
            max_pending: DEFAULT_MAX_PENDING,
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.listen_addr.port(), 8080);
        assert_eq!(config.component_name, "magic");
        assert_eq!(config.export_mode, ExportMode::Log);
        assert_eq!(config.export_url, "http://localhost:9090/v1/metrics");
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.pending_ttl, Duration::from_secs(300));
        assert_eq!(config.max_pending, 10_000);
    }

    #[test]
    fn test_config_from_lookup_with_defaults() {
        let config = load(&[]).expect("Should load with defaults");
        let default = Config::default();

        assert_eq!(config.listen_addr, default.listen_addr);
        assert_eq!(config.export_url, default.export_url);
        assert_eq!(config.request_timeout, default.request_timeout);
        assert_eq!(config.sweep_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_config_from_lookup_custom_values() {
        let config = load(&[
            ("MAGIC_LISTEN_ADDR", "127.0.0.1:9000"),
            ("MAGIC_COMPONENT_NAME", "edge"),
            ("MAGIC_EXPORT_MODE", "HTTP"),
            ("MAGIC_EXPORT_URL", "http://collector:4318/"),
            ("MAGIC_MAX_RETRIES", "5"),
            ("MAGIC_PENDING_TTL_SECS", "60"),
            ("MAGIC_MAX_PENDING", "50"),
        ])
        .expect("Should load custom values");

        assert_eq!(config.listen_addr.to_string(), "127.0.0.1:9000");
        assert_eq!(config.component_name, "edge");
        assert_eq!(config.export_mode, ExportMode::Http);
        assert_eq!(config.export_base_url, "http://collector:4318"); // Trailing slash removed
        assert_eq!(config.export_url, "http://collector:4318/v1/metrics");
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.pending_ttl, Duration::from_secs(60));
        assert_eq!(config.max_pending, 50);
    }

    #[test]
    fn test_invalid_listen_addr() {
        let err = load(&[("MAGIC_LISTEN_ADDR", "localhost")]).unwrap_err();
        assert_eq!(err.env_var, "MAGIC_LISTEN_ADDR");
        assert!(err.message.contains("not a valid socket address"));
    }

    #[test]
    fn test_invalid_export_mode() {
        let err = load(&[("MAGIC_EXPORT_MODE", "kafka")]).unwrap_err();
        assert_eq!(err.env_var, "MAGIC_EXPORT_MODE");
        assert!(err.message.contains("kafka"));
    }

    #[test]
    fn test_export_url_requires_scheme() {
        let err = load(&[("MAGIC_EXPORT_URL", "collector:4318")]).unwrap_err();
        assert!(err.message.contains("http://"));
    }

    #[test]
    fn test_invalid_number() {
        let err = load(&[("MAGIC_MAX_PENDING", "lots")]).unwrap_err();
        assert!(err.message.contains("not a valid number"));
    }

    #[test]
    fn test_zero_max_pending() {
        let err = load(&[("MAGIC_MAX_PENDING", "0")]).unwrap_err();
        assert!(err.message.contains("below minimum"));
    }

    #[test]
    fn test_ttl_exceeds_max() {
        let err = load(&[("MAGIC_PENDING_TTL_SECS", "999999")]).unwrap_err();
        assert_eq!(err.env_var, "MAGIC_PENDING_TTL_SECS");
        assert!(err.message.contains("exceeds maximum"));
    }

    #[test]
    fn test_config_error_display() {
        let error = ConfigError::new("TEST_VAR", "test error");
        assert_eq!(
            format!("{}", error),
            "Configuration error for TEST_VAR: test error"
        );
    }
}
