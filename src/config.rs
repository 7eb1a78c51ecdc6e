//! Configuration management.
//!
//! Settings are loaded with the `config` crate from an optional TOML file;
//! every field carries a serde default matching the vendor polling-rate
//! constraints, so a missing file yields a fully usable configuration.

use crate::error::DeviceError;
use config::Config;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Settings {
    pub log_level: LogLevel,
    pub storage: StorageSettings,
    pub heartbeat: HeartbeatSettings,
    pub glucose: GlucoseSettings,
    pub cgm: CgmSettings,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(transparent)]
pub struct LogLevel(pub String);

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel("info".to_string())
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageSettings {
    /// Root directory for the file-backed key-value store.
    pub data_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".aps"),
        }
    }
}

/// Heartbeat rate limiting. The catch-up band deliberately covers only
/// 5–10 minutes of elapsed time; outside it the default interval applies.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HeartbeatSettings {
    #[serde(with = "humantime_serde")]
    pub default_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub catch_up_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub catch_up_band_start: Duration,
    #[serde(with = "humantime_serde")]
    pub catch_up_band_end: Duration,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            default_interval: Duration::from_secs(270), // 4.5 minutes
            catch_up_interval: Duration::from_secs(60),
            catch_up_band_start: Duration::from_secs(5 * 60),
            catch_up_band_end: Duration::from_secs(10 * 60),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GlucoseSettings {
    /// Ingestion tick period.
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
    /// Minimum clinically meaningful spacing between stored samples.
    #[serde(with = "humantime_serde")]
    pub min_sample_spacing: Duration,
    /// JSON blob written by a companion process under a shared namespace.
    pub shared_storage_path: PathBuf,
    /// Cap on entries read from shared storage per tick.
    pub max_shared_entries: usize,
}

impl Default for GlucoseSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            min_sample_spacing: Duration::from_secs(60),
            shared_storage_path: PathBuf::from(".aps/shared/latest_readings.json"),
            max_shared_entries: 60,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CgmSettings {
    /// Prefix handed to sensor drivers that ask where to keep credentials.
    pub credential_storage_prefix: String,
}

impl Default for CgmSettings {
    fn default() -> Self {
        Self {
            credential_storage_prefix: "aps-core.cgm".to_string(),
        }
    }
}

impl Settings {
    pub fn new(config_name: Option<&str>) -> Result<Self, DeviceError> {
        let config_path = format!("config/{}", config_name.unwrap_or("default"));
        let s = Config::builder()
            .add_source(config::File::with_name(&config_path).required(false))
            .build()
            .map_err(DeviceError::Config)?;

        s.try_deserialize().map_err(DeviceError::Config)
    }
}
