// bufstage-config - configuration surface for the buffering engine
//
// Consumed as validated input before the engine starts. Sources:
// 1. Explicit construction by the embedding process
// 2. TOML file or string (`EngineConfig::from_toml_*`)
//
// Invalid combinations fail fast here, never at runtime.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

mod validation;

pub use validation::validate_config;

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub buffer: BufferConfig,

    #[serde(default)]
    pub flush: FlushConfig,

    #[serde(default)]
    pub delivery: DeliveryConfig,
}

impl EngineConfig {
    /// Parse from a TOML string.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(input)?;
        Ok(config)
    }

    /// Parse from a TOML file.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Validate the whole configuration, failing fast on the first problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validation::validate_config(self)
    }

    /// The flush mode the engine will actually run with.
    ///
    /// `default` resolves to `none` when the time component is among the
    /// chunk keys (window expiry drives sealing) and `fast` otherwise.
    pub fn resolved_flush_mode(&self) -> FlushMode {
        match self.flush.mode {
            FlushMode::Default => {
                if self.buffer.uses_time_key() {
                    FlushMode::None
                } else {
                    FlushMode::Fast
                }
            }
            mode => mode,
        }
    }
}

/// Buffer sizing and grouping configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Byte ceiling for a single staged chunk
    #[serde(default = "default_chunk_limit_bytes")]
    pub chunk_limit_bytes: usize,

    /// Byte ceiling for everything the buffer holds at once
    #[serde(default = "default_total_limit_bytes")]
    pub total_limit_bytes: usize,

    /// Active grouping components: the reserved words `time` and `tag`,
    /// plus record field names
    #[serde(default)]
    pub chunk_keys: Vec<String>,

    /// Time-window width in seconds; mandatory when `time` is a chunk key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timekey_range_secs: Option<u64>,

    /// Grace delay after a window closes before it may flush
    #[serde(default = "default_timekey_wait_secs")]
    pub timekey_wait_secs: u64,
}

impl BufferConfig {
    pub fn uses_time_key(&self) -> bool {
        self.chunk_keys.iter().any(|k| k.trim() == "time")
    }

    pub fn timekey_wait(&self) -> Duration {
        Duration::from_secs(self.timekey_wait_secs)
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            chunk_limit_bytes: default_chunk_limit_bytes(),
            total_limit_bytes: default_total_limit_bytes(),
            chunk_keys: Vec::new(),
            timekey_range_secs: None,
            timekey_wait_secs: default_timekey_wait_secs(),
        }
    }
}

fn default_chunk_limit_bytes() -> usize {
    8 * 1024 * 1024
}

fn default_total_limit_bytes() -> usize {
    512 * 1024 * 1024
}

fn default_timekey_wait_secs() -> u64 {
    600
}

/// Flush scheduling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlushConfig {
    #[serde(default)]
    pub mode: FlushMode,

    /// Age at which a staged chunk seals in `fast` mode
    #[serde(default = "default_flush_interval_secs")]
    pub interval_secs: u64,

    /// Number of flush worker threads
    #[serde(default = "default_flush_threads")]
    pub thread_count: usize,

    /// Period of the trigger evaluator tick
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Shortened tick used right after a just-missed window boundary
    #[serde(default = "default_burst_interval_ms")]
    pub burst_interval_ms: u64,
}

impl FlushConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn burst_interval(&self) -> Duration {
        Duration::from_millis(self.burst_interval_ms)
    }
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            mode: FlushMode::Default,
            interval_secs: default_flush_interval_secs(),
            thread_count: default_flush_threads(),
            tick_interval_ms: default_tick_interval_ms(),
            burst_interval_ms: default_burst_interval_ms(),
        }
    }
}

fn default_flush_interval_secs() -> u64 {
    60
}

fn default_flush_threads() -> usize {
    1
}

fn default_tick_interval_ms() -> u64 {
    1_000
}

fn default_burst_interval_ms() -> u64 {
    100
}

/// When staged chunks are sealed into the flush queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushMode {
    /// Derive from the chunk keys: `none` when time-keyed, `fast` otherwise
    #[default]
    Default,
    /// Seal only on window expiry (time-keyed) or size overflow
    None,
    /// Periodic tick seals on window close, chunk age, or size
    Fast,
    /// Seal right after every emit
    Immediate,
}

impl std::fmt::Display for FlushMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlushMode::Default => write!(f, "default"),
            FlushMode::None => write!(f, "none"),
            FlushMode::Fast => write!(f, "fast"),
            FlushMode::Immediate => write!(f, "immediate"),
        }
    }
}

impl std::str::FromStr for FlushMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, ConfigError> {
        match s.to_lowercase().as_str() {
            "default" => Ok(FlushMode::Default),
            "none" => Ok(FlushMode::None),
            "fast" => Ok(FlushMode::Fast),
            "immediate" => Ok(FlushMode::Immediate),
            other => Err(ConfigError::invalid(
                "flush.mode",
                format!(
                    "unsupported flush mode: {}. Supported: default, none, fast, immediate",
                    other
                ),
            )),
        }
    }
}

/// Delivery, acknowledgment and retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// How long a delayed write may stay unacknowledged before a forced
    /// rollback
    #[serde(default = "default_delayed_commit_timeout_secs")]
    pub delayed_commit_timeout_secs: u64,

    /// First retry backoff step
    #[serde(default = "default_retry_base_interval_ms")]
    pub retry_base_interval_ms: u64,

    /// Cap on the exponential backoff
    #[serde(default = "default_retry_max_interval_secs")]
    pub retry_max_interval_secs: u64,

    /// Give up after this many attempts; unset means only the elapsed-time
    /// ceiling applies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_max_attempts: Option<u32>,

    /// Give up once this much time has passed since the first failure
    #[serde(default = "default_retry_timeout_secs")]
    pub retry_timeout_secs: u64,
}

impl DeliveryConfig {
    pub fn delayed_commit_timeout(&self) -> Duration {
        Duration::from_secs(self.delayed_commit_timeout_secs)
    }

    pub fn retry_base_interval(&self) -> Duration {
        Duration::from_millis(self.retry_base_interval_ms)
    }

    pub fn retry_max_interval(&self) -> Duration {
        Duration::from_secs(self.retry_max_interval_secs)
    }

    pub fn retry_timeout(&self) -> Duration {
        Duration::from_secs(self.retry_timeout_secs)
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            delayed_commit_timeout_secs: default_delayed_commit_timeout_secs(),
            retry_base_interval_ms: default_retry_base_interval_ms(),
            retry_max_interval_secs: default_retry_max_interval_secs(),
            retry_max_attempts: None,
            retry_timeout_secs: default_retry_timeout_secs(),
        }
    }
}

fn default_delayed_commit_timeout_secs() -> u64 {
    60
}

fn default_retry_base_interval_ms() -> u64 {
    1_000
}

fn default_retry_max_interval_secs() -> u64 {
    60
}

fn default_retry_timeout_secs() -> u64 {
    72 * 3600
}

/// Configuration errors, fatal at setup
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Time-windowed keying requires a window width
    #[error("chunk_keys includes 'time' but buffer.timekey_range_secs is not set")]
    MissingTimekeyRange,

    /// A field holds an unusable value
    #[error("invalid configuration: {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    /// Config file could not be read
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Config content could not be parsed
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

impl ConfigError {
    /// Create an invalid-value error
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.buffer.chunk_limit_bytes, 8 * 1024 * 1024);
        assert_eq!(config.flush.thread_count, 1);
        assert_eq!(config.delivery.retry_max_attempts, None);
    }

    #[test]
    fn test_flush_mode_resolution() {
        let mut config = EngineConfig::default();
        assert_eq!(config.resolved_flush_mode(), FlushMode::Fast);

        config.buffer.chunk_keys = vec!["tag".to_string()];
        assert_eq!(config.resolved_flush_mode(), FlushMode::Fast);

        config.buffer.chunk_keys = vec!["time".to_string(), "tag".to_string()];
        assert_eq!(config.resolved_flush_mode(), FlushMode::None);

        config.flush.mode = FlushMode::Immediate;
        assert_eq!(config.resolved_flush_mode(), FlushMode::Immediate);
    }

    #[test]
    fn test_from_toml_str() {
        let config = EngineConfig::from_toml_str(
            r#"
            [buffer]
            chunk_limit_bytes = 1024
            chunk_keys = ["time", "tag"]
            timekey_range_secs = 30
            timekey_wait_secs = 5

            [flush]
            mode = "none"
            thread_count = 2

            [delivery]
            delayed_commit_timeout_secs = 30
            "#,
        )
        .unwrap();

        assert_eq!(config.buffer.chunk_limit_bytes, 1024);
        assert_eq!(config.buffer.timekey_range_secs, Some(30));
        assert_eq!(config.flush.mode, FlushMode::None);
        assert_eq!(config.flush.thread_count, 2);
        assert_eq!(
            config.delivery.delayed_commit_timeout(),
            Duration::from_secs(30)
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_flush_mode_from_str() {
        assert_eq!("fast".parse::<FlushMode>().unwrap(), FlushMode::Fast);
        assert_eq!("IMMEDIATE".parse::<FlushMode>().unwrap(), FlushMode::Immediate);
        assert!("interval".parse::<FlushMode>().is_err());
    }
}
