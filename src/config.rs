//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::workflow::events::DEFAULT_EVENT_CAPACITY;
use crate::workflow::executor::{DEFAULT_STEP_TIMEOUT, RetryPolicy};

/// Orchestrator configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// libSQL database file.
    pub db_path: PathBuf,
    /// Port for the REST and WebSocket server.
    pub http_port: u16,
    /// Base URL of the collaborator gateway.
    pub collaborator_url: String,
    /// Deadline for a single collaborator attempt.
    pub step_timeout: Duration,
    /// Attempts per step before a failure is recorded.
    pub step_max_attempts: u32,
    /// Backoff before the second attempt; doubles after that.
    pub retry_backoff: Duration,
    /// Per-workflow event buffer.
    pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            db_path: PathBuf::from("./data/onboarding.db"),
            http_port: 8080,
            collaborator_url: String::new(),
            step_timeout: DEFAULT_STEP_TIMEOUT,
            step_max_attempts: retry.max_attempts,
            retry_backoff: retry.base_backoff,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl OrchestratorConfig {
    /// Build config from the process environment.
    ///
    /// `ONBOARD_COLLABORATOR_URL` is required; everything else has a default.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from any key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let collaborator_url = lookup("ONBOARD_COLLABORATOR_URL")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("ONBOARD_COLLABORATOR_URL".into()))?;
        if !collaborator_url.starts_with("http://") && !collaborator_url.starts_with("https://") {
            return Err(ConfigError::InvalidValue {
                key: "ONBOARD_COLLABORATOR_URL".into(),
                message: format!("expected an http(s) URL, got {collaborator_url}"),
            });
        }

        let db_path = lookup("ONBOARD_DB_PATH")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let http_port = parse_or(&lookup, "ONBOARD_HTTP_PORT", defaults.http_port)?;

        let step_timeout = match parse_opt::<u64>(&lookup, "ONBOARD_STEP_TIMEOUT_SECS")? {
            Some(0) => return Err(positive("ONBOARD_STEP_TIMEOUT_SECS")),
            Some(secs) => Duration::from_secs(secs),
            None => defaults.step_timeout,
        };

        let step_max_attempts = parse_or(&lookup, "ONBOARD_STEP_MAX_ATTEMPTS", defaults.step_max_attempts)?;
        if step_max_attempts == 0 {
            return Err(positive("ONBOARD_STEP_MAX_ATTEMPTS"));
        }

        let retry_backoff = parse_opt::<u64>(&lookup, "ONBOARD_RETRY_BACKOFF_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry_backoff);

        let event_capacity = parse_or(&lookup, "ONBOARD_EVENT_CAPACITY", defaults.event_capacity)?;
        if event_capacity == 0 {
            return Err(positive("ONBOARD_EVENT_CAPACITY"));
        }

        Ok(Self {
            db_path,
            http_port,
            collaborator_url,
            step_timeout,
            step_max_attempts,
            retry_backoff,
            event_capacity,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.step_max_attempts,
            base_backoff: self.retry_backoff,
        }
    }
}

fn parse_opt<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    Ok(parse_opt(lookup, key)?.unwrap_or(default))
}

fn positive(key: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: "must be greater than zero".into(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<OrchestratorConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        OrchestratorConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_only_url_is_set() {
        let config = load(&[("ONBOARD_COLLABORATOR_URL", "http://localhost:9000")]).unwrap();
        assert_eq!(config.db_path, PathBuf::from("./data/onboarding.db"));
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.step_timeout, Duration::from_secs(120));
        assert_eq!(config.step_max_attempts, 2);
        assert_eq!(config.retry_backoff, Duration::from_millis(500));
        assert_eq!(config.event_capacity, 256);
    }

    #[test]
    fn missing_collaborator_url_is_an_error() {
        let err = load(&[]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref k) if k == "ONBOARD_COLLABORATOR_URL"));
    }

    #[test]
    fn overrides_are_parsed() {
        let config = load(&[
            ("ONBOARD_COLLABORATOR_URL", "https://content.internal/"),
            ("ONBOARD_DB_PATH", "/tmp/onboard.db"),
            ("ONBOARD_HTTP_PORT", "9090"),
            ("ONBOARD_STEP_TIMEOUT_SECS", "30"),
            ("ONBOARD_STEP_MAX_ATTEMPTS", "4"),
            ("ONBOARD_RETRY_BACKOFF_MS", "50"),
            ("ONBOARD_EVENT_CAPACITY", "64"),
        ])
        .unwrap();
        assert_eq!(config.http_port, 9090);
        assert_eq!(config.db_path, PathBuf::from("/tmp/onboard.db"));
        assert_eq!(config.step_timeout, Duration::from_secs(30));
        assert_eq!(config.retry_policy().max_attempts, 4);
        assert_eq!(config.retry_policy().base_backoff, Duration::from_millis(50));
        assert_eq!(config.event_capacity, 64);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let url = ("ONBOARD_COLLABORATOR_URL", "http://localhost:9000");

        let err = load(&[url, ("ONBOARD_HTTP_PORT", "eighty")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "ONBOARD_HTTP_PORT"));

        let err = load(&[url, ("ONBOARD_STEP_MAX_ATTEMPTS", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "ONBOARD_STEP_MAX_ATTEMPTS"));

        let err = load(&[url, ("ONBOARD_STEP_TIMEOUT_SECS", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = load(&[("ONBOARD_COLLABORATOR_URL", "localhost:9000")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
