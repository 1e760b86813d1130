//! Configuration file parser for ~/.config/paddock/config.toml.
//!
//! The config file is optional: a missing file yields `Config::default()`.
//! Unknown keys are accepted by serde and logged as likely typos.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// SEC-014: Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Engine and CLI settings.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Auto-refresh period for `watch`, in minutes. 0 = manual refresh only.
    pub refresh_interval_minutes: u64,

    /// Retries after the first failed attempt before giving up.
    pub max_retry_attempts: u32,

    /// Retry `n` waits `n * retry_base_delay_ms`.
    pub retry_base_delay_ms: u64,

    /// Deadline for one attempt, body read included.
    pub request_timeout_secs: u64,

    /// Cache age after which a load is logged as stale. Stale caches are still used.
    pub cache_stale_minutes: u64,

    /// Repeat a request without certificate verification when validation fails.
    pub accept_invalid_certs: bool,

    pub user_agent: String,

    /// Overrides ~/.cache/paddock/feeds.
    pub cache_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            refresh_interval_minutes: 30,
            max_retry_attempts: 3,
            retry_base_delay_ms: 1000,
            request_timeout_secs: 15,
            cache_stale_minutes: 30,
            accept_invalid_certs: true,
            user_agent: "MotorsportRSS Reader 1.0".to_string(),
            cache_dir: None,
        }
    }
}

impl Config {
    /// SEC-014: Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 8] = [
        "refresh_interval_minutes",
        "max_retry_attempts",
        "retry_base_delay_ms",
        "request_timeout_secs",
        "cache_stale_minutes",
        "accept_invalid_certs",
        "user_agent",
        "cache_dir",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // SEC-014: Check file size before reading
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(
            path = %path.display(),
            refresh_interval_minutes = config.refresh_interval_minutes,
            max_retry_attempts = config.max_retry_attempts,
            "Loaded configuration"
        );
        Ok(config)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    /// `None` when auto-refresh is off.
    pub fn refresh_interval(&self) -> Option<Duration> {
        (self.refresh_interval_minutes > 0)
            .then(|| Duration::from_secs(self.refresh_interval_minutes.saturating_mul(60)))
    }

    pub fn cache_stale_after(&self) -> chrono::Duration {
        // capped at ten years to stay inside chrono's range
        let minutes = self.cache_stale_minutes.min(10 * 365 * 24 * 60);
        chrono::Duration::minutes(minutes as i64)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.refresh_interval_minutes, 30);
        assert_eq!(config.max_retry_attempts, 3);
        assert_eq!(config.retry_base_delay(), Duration::from_millis(1000));
        assert_eq!(config.request_timeout(), Duration::from_secs(15));
        assert_eq!(config.cache_stale_after(), chrono::Duration::minutes(30));
        assert!(config.accept_invalid_certs);
        assert_eq!(config.user_agent, "MotorsportRSS Reader 1.0");
        assert!(config.cache_dir.is_none());
    }

    #[test]
    fn test_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_empty_file_returns_default() {
        let (_dir, path) = write_config("");
        assert_eq!(Config::load(&path).unwrap(), Config::default());
    }

    #[test]
    fn test_whitespace_only_file_returns_default() {
        let (_dir, path) = write_config("  \n\t\n  ");
        assert_eq!(Config::load(&path).unwrap(), Config::default());
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let (_dir, path) = write_config("max_retry_attempts = 5\n");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.max_retry_attempts, 5);
        assert_eq!(config.retry_base_delay_ms, 1000);
        assert_eq!(config.refresh_interval_minutes, 30);
    }

    #[test]
    fn test_full_config() {
        let (_dir, path) = write_config(
            r#"
refresh_interval_minutes = 0
max_retry_attempts = 1
retry_base_delay_ms = 250
request_timeout_secs = 5
cache_stale_minutes = 10
accept_invalid_certs = false
user_agent = "paddock-test"
cache_dir = "/var/tmp/paddock"
"#,
        );

        let config = Config::load(&path).unwrap();
        assert_eq!(config.refresh_interval(), None);
        assert_eq!(config.max_retry_attempts, 1);
        assert_eq!(config.retry_base_delay(), Duration::from_millis(250));
        assert_eq!(config.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.cache_stale_after(), chrono::Duration::minutes(10));
        assert!(!config.accept_invalid_certs);
        assert_eq!(config.user_agent, "paddock-test");
        assert_eq!(config.cache_dir, Some(PathBuf::from("/var/tmp/paddock")));
    }

    #[test]
    fn test_refresh_interval_in_minutes() {
        let config = Config {
            refresh_interval_minutes: 2,
            ..Config::default()
        };
        assert_eq!(config.refresh_interval(), Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let (_dir, path) = write_config("max_retry_attempts = [\n");
        assert!(matches!(Config::load(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_wrong_type_returns_error() {
        let (_dir, path) = write_config("accept_invalid_certs = \"yes\"\n");
        assert!(matches!(Config::load(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_unknown_keys_accepted() {
        let (_dir, path) = write_config("theme = \"dark\"\nmax_retry_attempts = 2\n");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.max_retry_attempts, 2);
    }

    // SEC-014: File size limit
    #[test]
    fn test_too_large_file_rejected() {
        let (_dir, path) = write_config(&"a".repeat(1_048_577));

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::TooLarge(_)));
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn test_file_at_size_limit_accepted() {
        let mut content = "max_retry_attempts = 3\n".to_string();
        while content.len() < 1_048_576 - 20 {
            content.push_str("# padding comment\n");
        }
        content.truncate(1_048_576);
        let (_dir, path) = write_config(&content);

        assert!(Config::load(&path).is_ok());
    }
}
