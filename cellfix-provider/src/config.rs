use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::module::engine::ZeroSignalPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    #[serde(default)]
    pub dataset: DatasetConfig,

    #[serde(default)]
    pub cells: CellsConfig,

    #[serde(default)]
    pub online: OnlineConfig,

    #[serde(default)]
    pub settings: SettingsConfig,

    #[serde(default)]
    pub positioning: PositioningConfig,
}

/// Offline cell location dataset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Searched in order
    #[serde(default = "default_dataset_dirs")]
    pub dirs: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellsConfig {
    /// JSON neighbour cell list written by the modem helper
    #[serde(default = "default_cells_snapshot")]
    pub snapshot: PathBuf,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnlineConfig {
    /// `geolocate` endpoint, online positioning is unavailable without one
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default = "default_online_timeout_secs")]
    pub timeout_secs: u64,

    /// JSON list of visible access points, sent only when WLAN data is allowed
    #[serde(default)]
    pub wlan_snapshot: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsConfig {
    #[serde(default = "default_settings_path")]
    pub path: PathBuf,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositioningConfig {
    #[serde(default)]
    pub zero_signal_policy: ZeroSignalPolicy,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8484
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_dataset_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from("/usr/share/cellfix/dataset")]
}

fn default_cells_snapshot() -> PathBuf {
    PathBuf::from("/run/cellfix/cells.json")
}

fn default_poll_interval_secs() -> u64 {
    2
}

fn default_online_timeout_secs() -> u64 {
    15
}

fn default_settings_path() -> PathBuf {
    PathBuf::from("/etc/location/location.conf")
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            log_dir: default_log_dir(),
            dataset: DatasetConfig::default(),
            cells: CellsConfig::default(),
            online: OnlineConfig::default(),
            settings: SettingsConfig::default(),
            positioning: PositioningConfig::default(),
        }
    }
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            dirs: default_dataset_dirs(),
        }
    }
}

impl Default for CellsConfig {
    fn default() -> Self {
        Self {
            snapshot: default_cells_snapshot(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl Default for OnlineConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: default_online_timeout_secs(),
            wlan_snapshot: None,
        }
    }
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            path: default_settings_path(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl ProviderConfig {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: ProviderConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl CellsConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

impl OnlineConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl SettingsConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}
