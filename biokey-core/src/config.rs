//! Runtime configuration
//!
//! Loaded from environment variables with sensible defaults. Command-line
//! flags take precedence over everything here.

use std::time::Duration;

/// Default time allowed for one interactive operation.
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Serial number of the key to use (default: auto-select the only key)
    pub serial: Option<u32>,
    /// Upper bound on one operation, prompts included (default: 60s)
    pub timeout: Duration,
    /// Client-data origin override (default: `https://<rp id>`)
    pub origin: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            serial: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            origin: None,
        }
    }
}

impl Config {
    /// Load configuration from `BIOKEY_SERIAL`, `BIOKEY_TIMEOUT_SECS` and
    /// `BIOKEY_ORIGIN`.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let serial = lookup("BIOKEY_SERIAL").and_then(|v| v.trim().parse().ok());

        let timeout_secs = lookup("BIOKEY_TIMEOUT_SECS")
            .and_then(|v| v.trim().parse().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        let origin = lookup("BIOKEY_ORIGIN")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        Self {
            serial,
            timeout: Duration::from_secs(timeout_secs),
            origin,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.serial, None);
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert!(config.origin.is_none());
        assert_eq!(config_from(&[]), config);
    }

    #[test]
    fn test_values_from_environment() {
        let config = config_from(&[
            ("BIOKEY_SERIAL", "12345678"),
            ("BIOKEY_TIMEOUT_SECS", "15"),
            ("BIOKEY_ORIGIN", "https://login.example.com"),
        ]);
        assert_eq!(config.serial, Some(12345678));
        assert_eq!(config.timeout, Duration::from_secs(15));
        assert_eq!(config.origin.as_deref(), Some("https://login.example.com"));
    }

    #[test]
    fn test_invalid_values_fall_back_to_defaults() {
        let config = config_from(&[
            ("BIOKEY_SERIAL", "not-a-number"),
            ("BIOKEY_TIMEOUT_SECS", "0"),
            ("BIOKEY_ORIGIN", "  "),
        ]);
        assert_eq!(config, Config::default());
    }
}
