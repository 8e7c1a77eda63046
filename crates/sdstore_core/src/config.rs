//! Per-profile configuration: instance identity, the SD registry, and
//! polling knobs, persisted as TOML under the profile's local app-data
//! directory (never inside an SD — see §3's instance-identity rule).
//!
//! # Example
//!
//! ```ignore
//! use sdstore_core::config::Config;
//!
//! let config = Config::load_or_create()?;
//! let registry = config.registry();
//! # Ok::<(), sdstore_core::error::SdError>(())
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SdError};
use crate::ids::{InstanceId, SdId};
use crate::polling_group::PollingSettings;
use crate::sd_registry::SdRegistry;

/// One SD this profile has previously registered, so it can be re-mounted
/// automatically on the next run instead of requiring the host to re-pick it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdEntry {
    /// The SD's identifier.
    pub id: SdId,
    /// Last known path to the SD root.
    pub path: PathBuf,
}

/// TOML-friendly mirror of [`PollingSettings`] (`Duration` has no direct TOML
/// representation, so `full_repoll_interval` round-trips as whole seconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingSettingsConfig {
    /// See [`PollingSettings::poll_rate_per_minute`].
    pub poll_rate_per_minute: u32,
    /// See [`PollingSettings::hit_rate_multiplier`].
    pub hit_rate_multiplier: f64,
    /// See [`PollingSettings::max_burst_per_second`].
    pub max_burst_per_second: u32,
    /// See [`PollingSettings::normal_priority_reserve`].
    pub normal_priority_reserve: f64,
    /// See [`PollingSettings::full_repoll_interval`], in whole seconds.
    /// `None` disables periodic sweeping.
    pub full_repoll_interval_secs: Option<u64>,
}

impl Default for PollingSettingsConfig {
    fn default() -> Self {
        PollingSettings::default().into()
    }
}

impl From<PollingSettings> for PollingSettingsConfig {
    fn from(settings: PollingSettings) -> Self {
        Self {
            poll_rate_per_minute: settings.poll_rate_per_minute,
            hit_rate_multiplier: settings.hit_rate_multiplier,
            max_burst_per_second: settings.max_burst_per_second,
            normal_priority_reserve: settings.normal_priority_reserve,
            full_repoll_interval_secs: settings.full_repoll_interval.map(|d| d.as_secs()),
        }
    }
}

impl From<PollingSettingsConfig> for PollingSettings {
    fn from(config: PollingSettingsConfig) -> Self {
        Self {
            poll_rate_per_minute: config.poll_rate_per_minute,
            hit_rate_multiplier: config.hit_rate_multiplier,
            max_burst_per_second: config.max_burst_per_second,
            normal_priority_reserve: config.normal_priority_reserve,
            full_repoll_interval: config.full_repoll_interval_secs.map(Duration::from_secs),
        }
    }
}

/// Persisted profile configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// This process's stable identity, generated once on first run and
    /// never written inside an SD.
    pub instance_id: InstanceId,
    /// SDs this profile has registered, so they can be re-mounted on the
    /// next run.
    #[serde(default)]
    pub sds: Vec<SdEntry>,
    /// Tier 2 polling knobs, shared across every SD this profile mounts.
    #[serde(default)]
    pub polling: PollingSettingsConfig,
}

impl Config {
    /// Build a fresh config with a newly generated instance id and no
    /// registered SDs.
    pub fn new() -> Self {
        Self {
            instance_id: InstanceId::generate(),
            sds: Vec::new(),
            polling: PollingSettingsConfig::default(),
        }
    }

    /// Path to this profile's config file (`<data_dir>/sdstore/config.toml`).
    pub fn config_path() -> Option<PathBuf> {
        dirs::data_dir().map(|dir| dir.join("sdstore").join("config.toml"))
    }

    /// Load the config from its default location.
    pub fn load() -> Result<Self> {
        let path = Self::config_path().ok_or_else(|| SdError::Internal("no data directory for this platform".to_string()))?;
        let contents = std::fs::read_to_string(&path).map_err(SdError::Io)?;
        toml::from_str(&contents).map_err(|e| SdError::Corrupt {
            path,
            offset: 0,
            message: e.to_string(),
        })
    }

    /// Load the config, creating and persisting a fresh one (with a newly
    /// generated instance id) if none exists yet.
    pub fn load_or_create() -> Result<Self> {
        let path = Self::config_path().ok_or_else(|| SdError::Internal("no data directory for this platform".to_string()))?;
        if path.exists() {
            return Self::load();
        }
        let config = Self::new();
        config.save()?;
        Ok(config)
    }

    /// Persist this config to its default location, creating the parent
    /// directory if needed.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path().ok_or_else(|| SdError::Internal("no data directory for this platform".to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(SdError::Io)?;
        }
        let contents = toml::to_string_pretty(self).map_err(|e| SdError::Internal(e.to_string()))?;
        std::fs::write(&path, contents).map_err(SdError::Io)?;
        Ok(())
    }

    /// Register (or re-point) an SD entry and persist the change.
    pub fn upsert_sd(&mut self, id: SdId, path: PathBuf) {
        if let Some(entry) = self.sds.iter_mut().find(|e| e.id == id) {
            entry.path = path;
        } else {
            self.sds.push(SdEntry { id, path });
        }
    }

    /// Drop a registered SD entry.
    pub fn remove_sd(&mut self, id: &SdId) {
        self.sds.retain(|e| &e.id != id);
    }

    /// Build an in-memory [`SdRegistry`] seeded from the registered SDs.
    pub fn registry(&self) -> SdRegistry {
        SdRegistry::from_entries(self.sds.iter().map(|e| (e.id.clone(), e.path.clone())))
    }

    /// The polling settings this config persists, as a runtime
    /// [`PollingSettings`].
    pub fn polling_settings(&self) -> PollingSettings {
        self.polling.clone().into()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn polling_settings_round_trip_through_toml_shape() {
        let settings = PollingSettings {
            poll_rate_per_minute: 60,
            hit_rate_multiplier: 0.5,
            max_burst_per_second: 5,
            normal_priority_reserve: 0.1,
            full_repoll_interval: Some(Duration::from_secs(900)),
        };
        let config: PollingSettingsConfig = settings.into();
        let back: PollingSettings = config.into();
        assert_eq!(back.poll_rate_per_minute, 60);
        assert_eq!(back.full_repoll_interval, Some(Duration::from_secs(900)));
    }

    #[test]
    fn new_config_has_no_registered_sds() {
        let config = Config::new();
        assert!(config.sds.is_empty());
        assert_eq!(config.registry().all().len(), 0);
    }

    #[test]
    fn upsert_sd_replaces_path_for_existing_id() {
        let mut config = Config::new();
        let id = SdId::from_raw("sd-1");
        config.upsert_sd(id.clone(), PathBuf::from("/a"));
        config.upsert_sd(id.clone(), PathBuf::from("/b"));
        assert_eq!(config.sds.len(), 1);
        assert_eq!(config.sds[0].path, PathBuf::from("/b"));
    }
}
