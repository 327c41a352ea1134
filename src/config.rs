use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fs::File, io::BufReader, path::Path};

use crate::error::{BusResult, ConfigurationError};
use crate::module::ModuleSettings;
use crate::notification::PublishStrategy;

/// Module name → profile name → raw settings layer.
pub type ModuleProfiles = HashMap<String, HashMap<String, ModuleSettings>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_pool_capacity")]
    pub handler_pool_capacity: usize,

    #[serde(default = "default_pool_capacity")]
    pub pipeline_pool_capacity: usize,

    #[serde(default = "default_pool_capacity")]
    pub notification_pool_capacity: usize,

    /// Serve pipeline-free handlers from a per-thread cached context.
    #[serde(default = "default_true")]
    pub fast_path: bool,

    #[serde(default)]
    pub publish_strategy: PublishStrategy,

    #[serde(default)]
    pub modules: ModuleProfiles,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            handler_pool_capacity: default_pool_capacity(),
            pipeline_pool_capacity: default_pool_capacity(),
            notification_pool_capacity: default_pool_capacity(),
            fast_path: default_true(),
            publish_strategy: PublishStrategy::default(),
            modules: ModuleProfiles::new(),
        }
    }
}

impl BusConfig {
    /// Profiles configured for `module`, keyed by profile name.
    pub fn profiles(&self, module: &str) -> HashMap<String, ModuleSettings> {
        self.modules.get(module).cloned().unwrap_or_default()
    }

    pub fn with_profile(
        mut self,
        module: &str,
        profile: &str,
        settings: ModuleSettings,
    ) -> Self {
        self.modules
            .entry(module.to_string())
            .or_default()
            .insert(profile.to_string(), settings);
        self
    }
}

pub fn from_file<T: for<'de> Deserialize<'de>, P: AsRef<Path>>(path: P) -> BusResult<T> {
    let file = File::open(path)
        .map_err(|e| ConfigurationError::Load(format!("Failed to open config file: {}", e)))?;
    let reader = BufReader::new(file);
    let config = serde_json::from_reader(reader)
        .map_err(|e| ConfigurationError::Load(format!("Failed to parse config file: {}", e)))?;
    Ok(config)
}

pub fn from_str<T: for<'de> Deserialize<'de>>(s: &str) -> BusResult<T> {
    let config = serde_json::from_str(s)
        .map_err(|e| ConfigurationError::Load(format!("Failed to parse config: {}", e)))?;
    Ok(config)
}

fn default_pool_capacity() -> usize {
    64
}
fn default_true() -> bool {
    true
}

pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
