//! Location settings: the device-wide switches that gate positioning.
//!
//! The settings file is owned by the system settings UI and device
//! management, we only read it.
//!
//! ```toml
//! [location]
//! enabled = true
//!
//! [location.mls]
//! enabled = true
//! online_enabled = false
//!
//! [location.allowed_data_sources]
//! online = true
//! cell_data = true
//! wlan_data = true
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use tracing::{debug, warn};

/// Effective switches derived from the settings file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocationSettings {
    pub positioning_enabled: bool,
    pub cell_positioning_enabled: bool,
    pub online_positioning_enabled: bool,
    pub online_data_allowed: bool,
    pub cell_data_allowed: bool,
    pub wlan_data_allowed: bool,
}

impl LocationSettings {
    /// Cell positioning runs only when both the master switch and the cell switch are on.
    pub fn positioning_active(&self) -> bool {
        self.positioning_enabled && self.cell_positioning_enabled
    }

    /// The online service may be queried.
    pub fn online_active(&self) -> bool {
        self.online_positioning_enabled && self.online_data_allowed
    }

    /// Parse the settings file contents
    pub fn parse(content: &str) -> Result<Self> {
        let file: SettingsFile = toml::from_str(content).context("Failed to parse location settings")?;
        Ok(file.location.into())
    }

    /// Load settings from `path`. A missing or malformed file yields the defaults,
    /// which keep positioning disabled.
    pub fn load(path: &Path) -> Self {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                debug!("Cannot read location settings {:?}: {}", path, e);
                return SettingsFile::default().location.into();
            }
        };

        match Self::parse(&content) {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Ignoring location settings {:?}: {:#}", path, e);
                SettingsFile::default().location.into()
            }
        }
    }

    pub fn log_summary(&self) {
        let state = |on: bool| if on { "enabled" } else { "disabled" };
        let allowed = |on: bool| if on { "allowed" } else { "not allowed" };
        debug!("Positioning is {}", state(self.positioning_enabled));
        debug!("Device-local cell triangulation positioning is {}", state(self.cell_positioning_enabled));
        debug!("Online service positioning is {}", state(self.online_positioning_enabled));
        debug!("Online data is {}", allowed(self.online_data_allowed));
        debug!("Adjacent cell id data is {}", allowed(self.cell_data_allowed));
        debug!("WLAN data is {}", allowed(self.wlan_data_allowed));
    }
}

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    #[serde(default)]
    location: LocationSection,
}

#[derive(Debug, Default, Deserialize)]
struct LocationSection {
    #[serde(default)]
    enabled: bool,

    /// Deprecated spelling of `mls.enabled`
    #[serde(default)]
    cell_id_positioning_enabled: bool,

    #[serde(default)]
    mls: MlsSection,

    #[serde(default)]
    allowed_data_sources: AllowedDataSources,
}

#[derive(Debug, Default, Deserialize)]
struct MlsSection {
    #[serde(default)]
    enabled: bool,

    #[serde(default)]
    online_enabled: bool,
}

#[derive(Debug, Deserialize)]
struct AllowedDataSources {
    #[serde(default = "default_allowed")]
    online: bool,

    #[serde(default = "default_allowed")]
    cell_data: bool,

    #[serde(default = "default_allowed")]
    wlan_data: bool,
}

fn default_allowed() -> bool {
    true
}

impl Default for AllowedDataSources {
    fn default() -> Self {
        Self {
            online: default_allowed(),
            cell_data: default_allowed(),
            wlan_data: default_allowed(),
        }
    }
}

impl From<LocationSection> for LocationSettings {
    fn from(section: LocationSection) -> Self {
        let positioning_enabled = section.enabled;
        let cell_positioning_enabled =
            positioning_enabled && (section.mls.enabled || section.cell_id_positioning_enabled);
        let online_positioning_enabled = cell_positioning_enabled && section.mls.online_enabled;

        Self {
            positioning_enabled,
            cell_positioning_enabled,
            online_positioning_enabled,
            online_data_allowed: section.allowed_data_sources.online,
            cell_data_allowed: section.allowed_data_sources.cell_data,
            wlan_data_allowed: section.allowed_data_sources.wlan_data,
        }
    }
}
