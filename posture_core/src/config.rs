//! Configuration file support for the posture monitor.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/posture/config.toml`.
//! Every field has a default, so partial files are fine.

use crate::{DeviceRole, Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,

    #[serde(default)]
    pub user: UserConfig,

    #[serde(default)]
    pub devices: DeviceConfig,

    #[serde(default)]
    pub cycle: CycleConfig,

    #[serde(default)]
    pub calibration: CalibrationConfig,

    #[serde(default)]
    pub classifier: ClassifierConfig,

    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub training: TrainingConfig,
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserConfig {
    #[serde(default = "default_user_id")]
    pub id: String,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            id: default_user_id(),
        }
    }
}

/// Advertised-name prefixes identifying each role's peripheral
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_upper_back_name")]
    pub upper_back_name: String,

    #[serde(default = "default_lower_back_name")]
    pub lower_back_name: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            upper_back_name: default_upper_back_name(),
            lower_back_name: default_lower_back_name(),
        }
    }
}

impl DeviceConfig {
    pub fn name_for(&self, role: DeviceRole) -> &str {
        match role {
            DeviceRole::UpperBack => &self.upper_back_name,
            DeviceRole::LowerBack => &self.lower_back_name,
        }
    }

    /// Whether an advertised name belongs to the given role
    pub fn matches(&self, role: DeviceRole, advertised: &str) -> bool {
        advertised.starts_with(self.name_for(role))
    }
}

/// Device cycle timing
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CycleConfig {
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,

    /// Give up on a connection attempt the radio never answers
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Connection hold in normal operation
    #[serde(default = "default_short_hold_ms")]
    pub short_hold_ms: u64,

    /// Connection hold for high-rate training capture
    #[serde(default = "default_long_hold_ms")]
    pub long_hold_ms: u64,

    /// Settle time between one role's disconnect and the next role's scan
    #[serde(default = "default_role_pause_ms")]
    pub role_pause_ms: u64,

    #[serde(default = "default_true")]
    pub high_priority: bool,

    /// Capacity of the controller event stream
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            scan_timeout_ms: default_scan_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            short_hold_ms: default_short_hold_ms(),
            long_hold_ms: default_long_hold_ms(),
            role_pause_ms: default_role_pause_ms(),
            high_priority: true,
            event_buffer: default_event_buffer(),
        }
    }
}

impl CycleConfig {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn role_pause(&self) -> Duration {
        Duration::from_millis(self.role_pause_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Window for the first peripheral to connect in a collection phase
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            connection_timeout_ms: default_connection_timeout_ms(),
        }
    }
}

impl CalibrationConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default = "default_smoothing_alpha")]
    pub smoothing_alpha: f64,

    /// Fraction of the calibrated threshold used as the live boundary
    #[serde(default = "default_threshold_multiplier")]
    pub threshold_multiplier: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            smoothing_alpha: default_smoothing_alpha(),
            threshold_multiplier: default_threshold_multiplier(),
        }
    }
}

/// Session retention and analysis batching
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_analysis_batch_size")]
    pub analysis_batch_size: usize,

    #[serde(default = "default_retention_days")]
    pub retention_days: i64,

    #[serde(default = "default_retention_batch_size")]
    pub retention_batch_size: usize,

    #[serde(default = "default_incomplete_max_age_hours")]
    pub incomplete_max_age_hours: i64,

    #[serde(default = "default_incomplete_batch_size")]
    pub incomplete_batch_size: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            analysis_batch_size: default_analysis_batch_size(),
            retention_days: default_retention_days(),
            retention_batch_size: default_retention_batch_size(),
            incomplete_max_age_hours: default_incomplete_max_age_hours(),
            incomplete_batch_size: default_incomplete_batch_size(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Wait before restarting after a cycle that found no peripheral
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default = "default_sample_rate_hz")]
    pub sample_rate_hz: u32,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: default_sample_rate_hz(),
        }
    }
}

// Default value functions
fn default_data_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(|| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        PathBuf::from(home).join(".local/share")
    });
    base.join("posture")
}

fn default_user_id() -> String {
    "local".into()
}

fn default_upper_back_name() -> String {
    "POSTURE_UB".into()
}

fn default_lower_back_name() -> String {
    "POSTURE_LB".into()
}

fn default_scan_timeout_ms() -> u64 {
    10_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_short_hold_ms() -> u64 {
    10_000
}

fn default_long_hold_ms() -> u64 {
    120_000
}

fn default_role_pause_ms() -> u64 {
    1_500
}

fn default_true() -> bool {
    true
}

fn default_event_buffer() -> usize {
    4096
}

fn default_connection_timeout_ms() -> u64 {
    15_000
}

fn default_smoothing_alpha() -> f64 {
    0.5
}

fn default_threshold_multiplier() -> f64 {
    0.65
}

fn default_analysis_batch_size() -> usize {
    3
}

fn default_retention_days() -> i64 {
    7
}

fn default_retention_batch_size() -> usize {
    20
}

fn default_incomplete_max_age_hours() -> i64 {
    24
}

fn default_incomplete_batch_size() -> usize {
    10
}

fn default_retry_delay_ms() -> u64 {
    30_000
}

fn default_sample_rate_hz() -> u32 {
    50
}

impl Config {
    /// Load configuration from the standard config path
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::info!(
                "No config file found at {:?}, using defaults",
                config_path
            );
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        let base = dirs::config_dir().unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
            PathBuf::from(home).join(".config")
        });
        base.join("posture").join("config.toml")
    }

    /// Save the current configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Reject values the controller and classifier cannot work with
    pub fn validate(&self) -> Result<()> {
        let cycle = &self.cycle;
        if cycle.scan_timeout_ms == 0
            || cycle.connect_timeout_ms == 0
            || cycle.short_hold_ms == 0
            || cycle.long_hold_ms == 0
        {
            return Err(Error::Config(
                "scan/connect timeouts and hold durations must be positive".into(),
            ));
        }
        if cycle.event_buffer == 0 {
            return Err(Error::Config("event_buffer must be positive".into()));
        }
        if self.calibration.connection_timeout_ms == 0 {
            return Err(Error::Config(
                "calibration connection timeout must be positive".into(),
            ));
        }

        let alpha = self.classifier.smoothing_alpha;
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(Error::Config(format!(
                "smoothing_alpha must be in (0, 1], got {}",
                alpha
            )));
        }
        let multiplier = self.classifier.threshold_multiplier;
        if !(multiplier > 0.0 && multiplier <= 1.0) {
            return Err(Error::Config(format!(
                "threshold_multiplier must be in (0, 1], got {}",
                multiplier
            )));
        }

        let lifecycle = &self.lifecycle;
        if lifecycle.analysis_batch_size == 0
            || lifecycle.retention_batch_size == 0
            || lifecycle.incomplete_batch_size == 0
        {
            return Err(Error::Config("batch sizes must be positive".into()));
        }
        if self.devices.upper_back_name.is_empty() || self.devices.lower_back_name.is_empty() {
            return Err(Error::Config("device names must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.cycle.scan_timeout_ms, 10_000);
        assert_eq!(config.cycle.short_hold_ms, 10_000);
        assert_eq!(config.cycle.long_hold_ms, 120_000);
        assert_eq!(config.calibration.connection_timeout_ms, 15_000);
        assert_eq!(config.classifier.threshold_multiplier, 0.65);
        assert_eq!(config.lifecycle.analysis_batch_size, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_roundtrip() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.cycle.role_pause_ms, parsed.cycle.role_pause_ms);
        assert_eq!(
            config.devices.upper_back_name,
            parsed.devices.upper_back_name
        );
    }

    #[test]
    fn test_partial_config() {
        let toml_str = r#"
[cycle]
short_hold_ms = 250
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.cycle.short_hold_ms, 250);
        assert_eq!(config.cycle.scan_timeout_ms, 10_000); // default
        assert_eq!(config.user.id, "local");
    }

    #[test]
    fn test_invalid_multiplier_rejected() {
        let mut config = Config::default();
        config.classifier.threshold_multiplier = 1.5;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "[devices]\nupper_back_name = \"UB-X\"\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert!(config.devices.matches(DeviceRole::UpperBack, "UB-X 01"));
        assert!(!config.devices.matches(DeviceRole::LowerBack, "UB-X 01"));
    }
}
