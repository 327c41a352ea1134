use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{BusConfig, ModuleProfiles};
use crate::error::{BusResult, ConfigurationError};
use crate::key::ModuleIdentifier;

/// One raw configuration layer: setting name → JSON value.
///
/// `null` values count as absent, so they never replace a lower layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleSettings(BTreeMap<String, Value>);

impl ModuleSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key).filter(|value| !value.is_null())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key)?.as_u64()
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key)?.as_f64()
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key)?.as_bool()
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key)?.as_str()
    }

    pub fn get_duration_ms(&self, key: &str) -> Option<Duration> {
        self.get_u64(key).map(Duration::from_millis)
    }

    /// Strict typed read used by option overlays: a present value of the
    /// wrong shape is an error rather than silently ignored.
    pub fn read<T: DeserializeOwned>(&self, module: &str, key: &str) -> BusResult<Option<T>> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|e| {
                ConfigurationError::InvalidSetting {
                    module: module.to_string(),
                    key: key.to_string(),
                    message: e.to_string(),
                }
                .into()
            })
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, Value)> for ModuleSettings {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Where module profiles and per-handler overrides come from.
#[mockall::automock]
pub trait ModuleSettingsSource: Send + Sync {
    /// All profiles configured for `module`, keyed by profile name.
    fn profiles(&self, module: &str) -> HashMap<String, ModuleSettings>;

    fn override_for(&self, id: &ModuleIdentifier) -> Option<ModuleSettings>;
}

/// Default source: profiles from [`BusConfig`], overrides set in code.
#[derive(Default)]
pub struct SettingsStore {
    profiles: ModuleProfiles,
    overrides: DashMap<ModuleIdentifier, ModuleSettings>,
}

impl SettingsStore {
    pub fn new(profiles: ModuleProfiles) -> Self {
        Self {
            profiles,
            overrides: DashMap::new(),
        }
    }

    pub fn from_config(config: &BusConfig) -> Self {
        Self::new(config.modules.clone())
    }

    pub fn set_override(&self, id: ModuleIdentifier, settings: ModuleSettings) {
        self.overrides.insert(id, settings);
    }
}

impl ModuleSettingsSource for SettingsStore {
    fn profiles(&self, module: &str) -> HashMap<String, ModuleSettings> {
        self.profiles.get(module).cloned().unwrap_or_default()
    }

    fn override_for(&self, id: &ModuleIdentifier) -> Option<ModuleSettings> {
        self.overrides.get(id).map(|entry| entry.value().clone())
    }
}
