//! # Modules
//!
//! Reusable cross-cutting behaviours (retry, timeout, audit, ...) that attach
//! to individual handlers as pipeline steps.
//!
//! A module resolves its options per [`ModuleIdentifier`] from four layers,
//! lowest first:
//!
//! 1. the options type's built-in defaults
//! 2. the `"Default"` profile
//! 3. the requested profile (falls back to `"Default"` when missing)
//! 4. the override given when the module was attached to the handler
//!
//! Resolved options and the wrappers built from them are cached for the
//! lifetime of the module.

pub mod audit;
pub mod registry;
pub mod retry;
pub mod settings;
pub mod timeout;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use crate::context::PipelineContext;
use crate::error::{BusResult, ConfigurationError};
use crate::handler::{AnyResponse, Next, PipelineBehavior};
use crate::key::{ModuleIdentifier, DEFAULT_PROFILE};

pub use registry::{ModuleEnvironment, ModuleFactory, ModuleRegistry};
pub use settings::{MockModuleSettingsSource, ModuleSettings, ModuleSettingsSource, SettingsStore};

/// Statically typed options of one module kind.
pub trait ModuleOptions: Default + Clone + fmt::Debug + Send + Sync + 'static {
    /// Replaces every field present in `settings`; absent fields are kept.
    fn overlay(&mut self, module: &str, settings: &ModuleSettings) -> BusResult<()>;
}

/// The behaviour behind a module. Modules ship a default provider; another
/// one can be registered per module name.
#[async_trait]
pub trait ModuleProvider<O: ModuleOptions>: Send + Sync + 'static {
    async fn execute(
        &self,
        id: &ModuleIdentifier,
        options: &O,
        ctx: &mut PipelineContext,
        next: Next<'_>,
    ) -> BusResult<AnyResponse>;
}

/// Type-erased face of a module as seen by the registry.
pub trait Module: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Pipeline priority of the module's wrapper.
    fn priority(&self) -> i32;

    /// Pipeline step for `id`, built once and reused.
    fn wrapper(
        &self,
        id: &ModuleIdentifier,
        env: &ModuleEnvironment,
    ) -> BusResult<Arc<dyn PipelineBehavior>>;
}

struct ModuleCache<O> {
    configs: HashMap<ModuleIdentifier, Arc<O>>,
    wrappers: HashMap<ModuleIdentifier, Arc<dyn PipelineBehavior>>,
}

impl<O> Default for ModuleCache<O> {
    fn default() -> Self {
        Self {
            configs: HashMap::new(),
            wrappers: HashMap::new(),
        }
    }
}

/// [`Module`] implementation shared by all option-driven modules.
pub struct ConfiguredModule<O: ModuleOptions> {
    name: String,
    priority: i32,
    defaults: O,
    default_provider: Arc<dyn ModuleProvider<O>>,
    cache: Mutex<ModuleCache<O>>,
}

impl<O: ModuleOptions> ConfiguredModule<O> {
    pub fn new<P>(name: &str, priority: i32, defaults: O, default_provider: P) -> Self
    where
        P: ModuleProvider<O>,
    {
        Self {
            name: name.to_string(),
            priority,
            defaults,
            default_provider: Arc::new(default_provider),
            cache: Mutex::new(ModuleCache::default()),
        }
    }

    /// Resolved options for `id`, computed on first request.
    pub fn config(&self, id: &ModuleIdentifier, env: &ModuleEnvironment) -> BusResult<Arc<O>> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        self.config_locked(&mut cache, id, env)
    }

    fn config_locked(
        &self,
        cache: &mut ModuleCache<O>,
        id: &ModuleIdentifier,
        env: &ModuleEnvironment,
    ) -> BusResult<Arc<O>> {
        if let Some(options) = cache.configs.get(id) {
            return Ok(Arc::clone(options));
        }
        let options = Arc::new(self.resolve_options(id, env)?);
        debug!("Resolved {}: {:?}", id, options);
        cache.configs.insert(id.clone(), Arc::clone(&options));
        Ok(options)
    }

    fn resolve_options(&self, id: &ModuleIdentifier, env: &ModuleEnvironment) -> BusResult<O> {
        let mut options = self.defaults.clone();
        let profiles = env.settings().profiles(&self.name);

        if let Some(default) = profiles.get(DEFAULT_PROFILE) {
            options.overlay(&self.name, default)?;
        }
        if !id.is_default_profile() {
            match profiles.get(&id.profile) {
                Some(profile) => options.overlay(&self.name, profile)?,
                None => debug!(
                    "Profile {} not configured for {}, using {}",
                    id.profile, self.name, DEFAULT_PROFILE
                ),
            }
        }
        if let Some(overrides) = env.override_for(id) {
            options.overlay(&self.name, &overrides)?;
        }
        Ok(options)
    }

    /// The registered provider for this module, else the built-in one.
    pub fn provider(&self, env: &ModuleEnvironment) -> BusResult<Arc<dyn ModuleProvider<O>>> {
        match env.provider_any(&self.name) {
            Some(provider) => provider
                .downcast_ref::<Arc<dyn ModuleProvider<O>>>()
                .cloned()
                .ok_or_else(|| {
                    ConfigurationError::ProviderTypeMismatch {
                        module: self.name.clone(),
                    }
                    .into()
                }),
            None => Ok(Arc::clone(&self.default_provider)),
        }
    }
}

impl<O: ModuleOptions> Module for ConfiguredModule<O> {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn wrapper(
        &self,
        id: &ModuleIdentifier,
        env: &ModuleEnvironment,
    ) -> BusResult<Arc<dyn PipelineBehavior>> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(wrapper) = cache.wrappers.get(id) {
            return Ok(Arc::clone(wrapper));
        }
        let options = self.config_locked(&mut cache, id, env)?;
        let wrapper: Arc<dyn PipelineBehavior> = Arc::new(ModuleWrapper {
            id: id.clone(),
            options,
            provider: self.provider(env)?,
        });
        cache.wrappers.insert(id.clone(), Arc::clone(&wrapper));
        Ok(wrapper)
    }
}

/// Pipeline step that runs a module provider with fixed options.
struct ModuleWrapper<O: ModuleOptions> {
    id: ModuleIdentifier,
    options: Arc<O>,
    provider: Arc<dyn ModuleProvider<O>>,
}

#[async_trait]
impl<O: ModuleOptions> PipelineBehavior for ModuleWrapper<O> {
    async fn handle(&self, ctx: &mut PipelineContext, next: Next<'_>) -> BusResult<AnyResponse> {
        self.provider
            .execute(&self.id, &self.options, ctx, next)
            .await
    }
}
