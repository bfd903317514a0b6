//! Gateway settings

use crate::core::channel::{BackpressurePolicy, ChannelConfig, DEFAULT_CAPACITY};
use crate::core::protocol::{
    Calibration, DecoderConfig, Precision, DEFAULT_BATCH_SIZE, DEFAULT_MAX_FRAME_LEN,
    DEFAULT_MAX_HEARTBEAT_LEN, HEARTBEAT_SENSOR_ID,
};
use crate::core::reader::ReaderOptions;
use crate::core::sink::RecordFormat;
use crate::core::timeline::MAX_SAMPLE_INTERVAL;
use crate::core::transport::{RetryPolicy, SerialConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read or written
    #[error("Failed to access {path}: {source}")]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for this schema
    #[error("Failed to parse {path}: {source}")]
    Parse {
        /// File involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: toml::de::Error,
    },

    /// Config could not be serialized
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Platform config directory is unknown
    #[error("Could not determine config directory")]
    NoConfigDir,

    /// A value is out of range
    #[error("Invalid {field}: {reason}")]
    Invalid {
        /// Offending key
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },
}

/// Gateway configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Serial link
    pub serial: SerialConfig,
    /// Wire protocol
    pub protocol: ProtocolConfig,
    /// Temperature offsets
    pub calibration: Calibration,
    /// Reader to consumer hand-off
    pub channel: ChannelSettings,
    /// Transport retry
    pub retry: RetrySettings,
    /// Persistence sink
    pub output: OutputConfig,
    /// Loss reports
    pub stats: StatsConfig,
    /// Diagnostics
    pub logging: LoggingConfig,
}

/// Wire protocol settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Readings per batch
    pub batch_size: usize,
    /// Seconds between readings of one batch
    pub sample_interval_secs: u64,
    /// Sensor id marking heartbeats
    pub heartbeat_sensor_id: u8,
    /// Longest accepted heartbeat text
    pub max_heartbeat_len: usize,
    /// Longest frame kept while waiting for an end marker
    pub max_frame_len: usize,
    /// Temperature rounding
    pub precision: Precision,
    /// Truncate timestamps to whole seconds
    pub round_timestamps: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            sample_interval_secs: 2,
            heartbeat_sensor_id: HEARTBEAT_SENSOR_ID,
            max_heartbeat_len: DEFAULT_MAX_HEARTBEAT_LEN,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            precision: Precision::HalfDegree,
            round_timestamps: true,
        }
    }
}

/// Channel settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSettings {
    /// Per-consumer queue capacity
    pub capacity: usize,
    /// Full-queue policy
    pub policy: BackpressurePolicy,
    /// Blocking send slice in milliseconds
    pub send_timeout_ms: u64,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            policy: BackpressurePolicy::Block,
            send_timeout_ms: 100,
        }
    }
}

/// Retry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Consecutive failures tolerated
    pub max_attempts: u32,
    /// First delay in milliseconds
    pub initial_delay_ms: u64,
    /// Delay cap in milliseconds
    pub max_delay_ms: u64,
    /// Exponential backoff factor
    pub backoff_multiplier: f32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Persistence settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Record file; no file sink when unset
    pub path: Option<PathBuf>,
    /// File format
    pub format: RecordFormat,
    /// Records between flushes
    pub flush_every: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: None,
            format: RecordFormat::Csv,
            flush_every: 1,
        }
    }
}

/// Statistics settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Seconds between reports (0 disables)
    pub report_interval_secs: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            report_interval_secs: 10,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive
    pub level: String,
    /// Emit JSON instead of text
    pub json: bool,
    /// Directory for a daily rolling log file
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            directory: None,
        }
    }
}

impl GatewayConfig {
    /// Load `<config_dir>/config.toml`, or defaults when it does not exist
    pub fn load() -> Result<Self, ConfigError> {
        let path = super::config_file().ok_or(ConfigError::NoConfigDir)?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load a specific file
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Save to `path`, creating parent directories
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        std::fs::write(path, self.to_toml()?).map_err(io_err)
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.protocol;
        if p.batch_size == 0 {
            return Err(invalid("protocol.batch_size", "must be at least 1"));
        }
        if p.sample_interval_secs == 0 {
            return Err(invalid("protocol.sample_interval_secs", "must be at least 1"));
        }
        if p.sample_interval_secs > MAX_SAMPLE_INTERVAL.as_secs() {
            return Err(invalid(
                "protocol.sample_interval_secs",
                format!("must be at most {}", MAX_SAMPLE_INTERVAL.as_secs()),
            ));
        }
        let frame = self.decoder_config().readings_frame_len();
        if p.max_frame_len < frame {
            return Err(invalid(
                "protocol.max_frame_len",
                format!("{} is smaller than one readings frame ({frame} bytes)", p.max_frame_len),
            ));
        }
        if self.channel.capacity == 0 {
            return Err(invalid("channel.capacity", "must be at least 1"));
        }
        if self.serial.read_chunk == 0 {
            return Err(invalid("serial.read_chunk", "must be at least 1"));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(invalid("retry.backoff_multiplier", "must be 1.0 or more"));
        }
        if self.output.flush_every == 0 {
            return Err(invalid("output.flush_every", "must be at least 1"));
        }
        Ok(())
    }

    /// Decoder settings
    pub fn decoder_config(&self) -> DecoderConfig {
        DecoderConfig {
            batch_size: self.protocol.batch_size,
            heartbeat_sensor_id: self.protocol.heartbeat_sensor_id,
            max_heartbeat_len: self.protocol.max_heartbeat_len,
            precision: self.protocol.precision,
            calibration: self.calibration,
        }
    }

    /// Retry policy
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            backoff_multiplier: self.retry.backoff_multiplier,
        }
    }

    /// Reader loop settings
    pub fn reader_options(&self) -> ReaderOptions {
        ReaderOptions {
            read_chunk: self.serial.read_chunk,
            read_timeout: self.serial.timeout(),
            max_frame_len: self.protocol.max_frame_len,
            retry: self.retry_policy(),
            decoder: self.decoder_config(),
            sample_interval: Duration::from_secs(self.protocol.sample_interval_secs),
            round_timestamps: self.protocol.round_timestamps,
        }
    }

    /// Channel settings
    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            capacity: self.channel.capacity,
            policy: self.channel.policy,
            send_timeout: Duration::from_millis(self.channel.send_timeout_ms),
        }
    }

    /// Report period, `None` when disabled
    pub fn report_interval(&self) -> Option<Duration> {
        (self.stats.report_interval_secs > 0)
            .then(|| Duration::from_secs(self.stats.report_interval_secs))
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = GatewayConfig::default();
        config.validate().unwrap();
        assert_eq!(config.serial.port, "/dev/serial0");
        assert_eq!(config.protocol.batch_size, 5);
        assert_eq!(config.report_interval(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: GatewayConfig = toml::from_str(
            r#"
            [serial]
            port = "/dev/ttyUSB0"

            [channel]
            policy = "drop_oldest"

            [calibration]
            meat_offset = -1.5
            "#,
        )
        .unwrap();

        assert_eq!(config.serial.port, "/dev/ttyUSB0");
        assert_eq!(config.serial.baud_rate, 115_200);
        assert_eq!(config.channel.policy, BackpressurePolicy::DropOldest);
        assert_eq!(config.decoder_config().calibration.meat_offset, -1.5);
        assert_eq!(config.protocol.precision, Precision::HalfDegree);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = GatewayConfig::default();
        config.protocol.batch_size = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "protocol.batch_size", .. })
        ));

        let mut config = GatewayConfig::default();
        config.protocol.max_frame_len = 10;
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.channel.capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_bounds_sample_interval() {
        let mut config = GatewayConfig::default();
        config.protocol.sample_interval_secs = 10_000_000_000_000;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "protocol.sample_interval_secs", .. })
        ));

        config.protocol.sample_interval_secs = 86_400;
        config.validate().unwrap();

        config.protocol.sample_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = GatewayConfig::default();
        config.output.path = Some(PathBuf::from("/var/lib/sensorgate/readings.csv"));
        config.stats.report_interval_secs = 0;
        config.save(&path).unwrap();

        let loaded = GatewayConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.report_interval(), None);
    }

    #[test]
    fn test_reader_options_follow_config() {
        let mut config = GatewayConfig::default();
        config.protocol.sample_interval_secs = 3;
        config.retry.max_attempts = 9;

        let options = config.reader_options();
        assert_eq!(options.sample_interval, Duration::from_secs(3));
        assert_eq!(options.retry.max_attempts, 9);
        assert_eq!(options.read_timeout, Duration::from_millis(100));
    }
}
