//! Configuration for the gateway.

use crate::core::frame::ExportFormat;
use crate::core::inference::SensingMode;
use crate::device::types::DEFAULT_SAMPLE_PERIOD_MS;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A windowed profile must cover exactly this much device time per window.
pub const SEQUENCE_SPAN_MS: u64 = 10_000;

/// Main configuration for the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Sampling period sent to every node for plain collection
    pub sampling_ms: u16,

    /// How long a discovery pass listens
    #[serde(with = "duration_serde::secs")]
    pub scan_timeout: Duration,

    /// Upper bound for opening one link
    #[serde(with = "duration_serde::millis")]
    pub connect_timeout: Duration,

    /// Upper bound for one command round-trip
    #[serde(with = "duration_serde::millis")]
    pub command_timeout: Duration,

    /// Pause before each configuration broadcast, letting links settle
    #[serde(with = "duration_serde::millis")]
    pub settle_delay: Duration,

    /// Queued notification records per device before records are dropped
    pub notification_capacity: usize,

    /// File listing known devices, one `<address> <name>` per line
    pub registry_path: PathBuf,

    /// Where frame logs are written
    pub export_path: PathBuf,

    /// Output format for frame logs
    pub export_format: ExportFormat,

    /// Path for storing statistics
    pub data_path: PathBuf,

    /// Named sensing profiles
    pub profiles: Vec<Profile>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("imu-sync-gateway");

        Self {
            sampling_ms: DEFAULT_SAMPLE_PERIOD_MS,
            scan_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(5),
            settle_delay: Duration::from_secs(1),
            notification_capacity: 1024,
            registry_path: Self::config_dir().join("devices.txt"),
            export_path: data_dir.join("exports"),
            export_format: ExportFormat::Csv,
            data_path: data_dir,
            profiles: Profile::defaults(),
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`, falling back to defaults if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let content =
                std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
            let config: Config = serde_json::from_str(&content)
                .map_err(|e| ConfigError::ParseError(e.to_string()))?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::IoError(e.to_string()))?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("imu-sync-gateway")
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.json")
    }

    /// Path of the persisted collection statistics.
    pub fn stats_path(&self) -> PathBuf {
        self.data_path.join("stats.json")
    }

    /// Ensure all required directories exist.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.export_path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        std::fs::create_dir_all(&self.data_path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sampling_ms == 0 {
            return Err(ConfigError::Invalid("sampling_ms must be positive".into()));
        }
        if self.notification_capacity == 0 {
            return Err(ConfigError::Invalid(
                "notification_capacity must be positive".into(),
            ));
        }
        for (i, profile) in self.profiles.iter().enumerate() {
            profile.validate()?;
            if self.profiles[..i].iter().any(|p| p.name == profile.name) {
                return Err(ConfigError::InvalidProfile {
                    name: profile.name.clone(),
                    reason: "defined twice".into(),
                });
            }
        }
        Ok(())
    }

    pub fn profile(&self, name: &str) -> Result<&Profile, ConfigError> {
        self.profiles
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| ConfigError::UnknownProfile(name.to_string()))
    }
}

/// A named exercise profile: how to sample and how to feed the classifier.
///
/// Profiles carry no model. The application binds a classifier to the name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub sampling_ms: u16,
    pub mode: SensingMode,
}

impl Profile {
    pub fn single_frame(name: &str, sampling_ms: u16) -> Self {
        Self {
            name: name.to_string(),
            sampling_ms,
            mode: SensingMode::SingleFrame,
        }
    }

    pub fn windowed(name: &str, sampling_ms: u16, steps: usize) -> Self {
        Self {
            name: name.to_string(),
            sampling_ms,
            mode: SensingMode::Windowed { steps },
        }
    }

    /// The postures the gateway ships with.
    pub fn defaults() -> Vec<Profile> {
        vec![
            Profile::single_frame("neck", 50),
            Profile::windowed("shoulder", 100, 100),
            Profile::windowed("hamstring", 100, 100),
            Profile::single_frame("bridge", 50),
        ]
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidProfile {
            name: self.name.clone(),
            reason,
        };
        if self.name.trim().is_empty() {
            return Err(invalid("name is empty".into()));
        }
        if self.sampling_ms == 0 {
            return Err(invalid("sampling_ms must be positive".into()));
        }
        if let SensingMode::Windowed { steps } = self.mode {
            if steps == 0 {
                return Err(invalid("window needs at least one step".into()));
            }
            let span = u64::from(self.sampling_ms) * steps as u64;
            if span != SEQUENCE_SPAN_MS {
                return Err(invalid(format!(
                    "{steps} steps x {}ms = {span}ms, expected {SEQUENCE_SPAN_MS}ms",
                    self.sampling_ms
                )));
            }
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    IoError(String),
    ParseError(String),
    SerializeError(String),
    Invalid(String),
    InvalidProfile { name: String, reason: String },
    UnknownProfile(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {e}"),
            ConfigError::ParseError(e) => write!(f, "Parse error: {e}"),
            ConfigError::SerializeError(e) => write!(f, "Serialize error: {e}"),
            ConfigError::Invalid(e) => write!(f, "Invalid configuration: {e}"),
            ConfigError::InvalidProfile { name, reason } => {
                write!(f, "Invalid profile '{name}': {reason}")
            }
            ConfigError::UnknownProfile(name) => write!(f, "Unknown profile: {name}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Serde support for Duration.
mod duration_serde {
    pub mod secs {
        use serde::{Deserialize, Deserializer, Serialize, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            duration.as_secs().serialize(serializer)
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
        where
            D: Deserializer<'de>,
        {
            let secs = u64::deserialize(deserializer)?;
            Ok(Duration::from_secs(secs))
        }
    }

    pub mod millis {
        use serde::{Deserialize, Deserializer, Serialize, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            (duration.as_millis() as u64).serialize(serializer)
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
        where
            D: Deserializer<'de>,
        {
            let ms = u64::deserialize(deserializer)?;
            Ok(Duration::from_millis(ms))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.sampling_ms, 50);
        assert_eq!(config.scan_timeout, Duration::from_secs(2));
        assert_eq!(config.export_format, ExportFormat::Csv);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_profiles() {
        let config = Config::default();
        assert_eq!(config.profile("neck").unwrap().mode, SensingMode::SingleFrame);
        let shoulder = config.profile("shoulder").unwrap();
        assert_eq!(shoulder.mode, SensingMode::Windowed { steps: 100 });
        assert_eq!(shoulder.sampling_ms, 100);
        assert_eq!(
            config.profile("yoga").unwrap_err(),
            ConfigError::UnknownProfile("yoga".into())
        );
    }

    #[test]
    fn test_windowed_profile_must_span_ten_seconds() {
        assert!(Profile::windowed("ok", 50, 200).validate().is_ok());
        let err = Profile::windowed("bad", 50, 100).validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidProfile { ref name, .. } if name == "bad"));
        assert!(Profile::windowed("empty", 100, 0).validate().is_err());
    }

    #[test]
    fn test_duplicate_profile_rejected() {
        let mut config = Config::default();
        config.profiles.push(Profile::single_frame("neck", 50));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidProfile { .. })
        ));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::default();
        config.sampling_ms = 200;
        config.settle_delay = Duration::from_millis(250);
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.sampling_ms, 200);
        assert_eq!(loaded.settle_delay, Duration::from_millis(250));
        assert_eq!(loaded.profiles, config.profiles);

        let missing = Config::load_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(missing.sampling_ms, 50);
    }

    #[test]
    fn test_invalid_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            Config::load_from(&path),
            Err(ConfigError::ParseError(_))
        ));
    }
}
