//! Configuration file parser for `feedpool.toml`.
//!
//! The config file is optional: a missing file yields `Config::default()`.
//! Unknown keys are silently ignored by serde (with `deny_unknown_fields` off),
//! though we log a warning when the file contains potential typos.
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::feed::Source;

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

    /// A value parsed but is not usable (bad source URL, duplicate id).
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Processor configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
/// Missing keys fall back to `Default::default()`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Initial number of concurrent fetch workers, kept within `[1, 20]`.
    pub max_concurrency: usize,

    /// Retries granted to a task before its failures become permanent.
    pub max_retries: u32,

    /// TCP/TLS connect deadline in seconds.
    pub connection_timeout_secs: u64,

    /// Deadline for a whole fetch (connect, headers, body) in seconds.
    pub total_timeout_secs: u64,

    /// Largest accepted response body.
    pub max_feed_size_bytes: usize,

    pub user_agent: String,

    /// Attempts made per source by the out-of-band failover path.
    pub failover_max_attempts: u32,

    pub sources: Vec<Source>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            max_retries: 3,
            connection_timeout_secs: 10,
            total_timeout_secs: 60,
            max_feed_size_bytes: 10 * 1024 * 1024,
            user_agent: "TradingAssistantX/1.0".to_string(),
            failover_max_attempts: 3,
            sources: Vec::new(),
        }
    }
}

impl Config {
    /// SEC-014: Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Floor applied when load forces concurrency down.
    pub const MIN_CONCURRENCY: usize = 5;
    /// Ceiling for every concurrency value, configured or tuned.
    pub const MAX_CONCURRENCY: usize = 20;

    const KNOWN_KEYS: [&'static str; 8] = [
        "max_concurrency",
        "max_retries",
        "connection_timeout_secs",
        "total_timeout_secs",
        "max_feed_size_bytes",
        "user_agent",
        "failover_max_attempts",
        "sources",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Invalid source entries → `Err(ConfigError::Invalid)`
    /// - Unknown keys → silently accepted (serde default behavior), logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // SEC-014: Check file size before reading to prevent memory exhaustion
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
                // Race condition: file deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        let config = Self::from_toml_str(&content)?;
        tracing::info!(
            path = %path.display(),
            sources = config.sources.len(),
            max_concurrency = config.max_concurrency,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Parses and validates configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let mut config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Clamps `max_concurrency` and checks every source.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        let clamped = self
            .max_concurrency
            .clamp(1, Self::MAX_CONCURRENCY);
        if clamped != self.max_concurrency {
            tracing::warn!(
                requested = self.max_concurrency,
                using = clamped,
                "max_concurrency out of range, clamping"
            );
            self.max_concurrency = clamped;
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            if source.id.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "source with url '{}' has an empty id",
                    source.url
                )));
            }
            if !seen.insert(source.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate source id '{}'",
                    source.id
                )));
            }
            let url = url::Url::parse(&source.url).map_err(|e| {
                ConfigError::Invalid(format!("source '{}': invalid url: {}", source.id, e))
            })?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(ConfigError::Invalid(format!(
                    "source '{}': unsupported scheme '{}' (only http/https allowed)",
                    source.id,
                    url.scheme()
                )));
            }
        }

        Ok(())
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn total_timeout(&self) -> Duration {
        Duration::from_secs(self.total_timeout_secs)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FeedFormat;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.max_concurrency, 10);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.connection_timeout(), Duration::from_secs(10));
        assert_eq!(config.total_timeout(), Duration::from_secs(60));
        assert_eq!(config.user_agent, "TradingAssistantX/1.0");
        assert!(config.sources.is_empty());
    }

    #[test]
    fn test_missing_file_returns_default() {
        let path = Path::new("/tmp/feedpool_test_nonexistent_config.toml");
        let config = Config::load(path).unwrap();
        assert_eq!(config.max_concurrency, 10);
    }

    #[test]
    fn test_whitespace_only_returns_default() {
        let config = Config::from_toml_str("   \n  \n  ").unwrap();
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_full_config() {
        let dir = std::env::temp_dir().join("feedpool_config_test_full");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("feedpool.toml");

        let content = r#"
max_concurrency = 8
total_timeout_secs = 30
user_agent = "Test/2.0"

[[sources]]
id = "fed"
url = "https://example.com/fed.xml"
priority = 5

[[sources]]
id = "markets"
url = "https://example.com/markets.json"
format = "json"
refresh_interval_secs = 600
"#;
        std::fs::write(&path, content).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.max_concurrency, 8);
        assert_eq!(config.total_timeout(), Duration::from_secs(30));
        assert_eq!(config.user_agent, "Test/2.0");
        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.sources[0].priority, 5);
        assert_eq!(config.sources[0].format, FeedFormat::Rss);
        assert_eq!(config.sources[1].format, FeedFormat::Json);
        assert_eq!(config.sources[1].refresh_interval_secs, 600);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_concurrency_is_clamped() {
        let config = Config::from_toml_str("max_concurrency = 100").unwrap();
        assert_eq!(config.max_concurrency, 20);

        let config = Config::from_toml_str("max_concurrency = 0").unwrap();
        assert_eq!(config.max_concurrency, 1);

        let config = Config::from_toml_str("max_concurrency = 2").unwrap();
        assert_eq!(config.max_concurrency, 2);
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let err = Config::from_toml_str("this is not [valid toml").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("Invalid TOML"));
    }

    #[test]
    fn test_unknown_keys_accepted() {
        let config = Config::from_toml_str("max_retries = 2\ntotally_fake_key = 1\n").unwrap();
        assert_eq!(config.max_retries, 2);
    }

    #[test]
    fn test_duplicate_source_ids_rejected() {
        let content = r#"
[[sources]]
id = "a"
url = "https://example.com/1"

[[sources]]
id = "a"
url = "https://example.com/2"
"#;
        let err = Config::from_toml_str(content).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_non_http_source_rejected() {
        let content = r#"
[[sources]]
id = "local"
url = "file:///etc/passwd"
"#;
        let err = Config::from_toml_str(content).unwrap_err();
        assert!(err.to_string().contains("unsupported scheme"));
    }

    #[test]
    fn test_source_missing_url_is_parse_error() {
        let content = r#"
[[sources]]
id = "a"
"#;
        assert!(matches!(
            Config::from_toml_str(content),
            Err(ConfigError::Parse(_))
        ));
    }

    // SEC-014: File size limit
    #[test]
    fn test_too_large_file_rejected() {
        let dir = std::env::temp_dir().join("feedpool_config_test_too_large");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("feedpool.toml");
        std::fs::write(&path, "a".repeat(1_048_577)).unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::TooLarge(_)));
        assert!(err.to_string().contains("too large"));

        std::fs::remove_dir_all(&dir).ok();
    }
}
