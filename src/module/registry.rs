use std::any::Any;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, instrument};

use super::settings::{ModuleSettings, ModuleSettingsSource};
use super::{audit, retry, timeout, Module, ModuleOptions, ModuleProvider};
use crate::error::{BusError, BusResult, ConfigurationError};
use crate::handler::HandlerRegistry;
use crate::key::{HandleKey, ModuleIdentifier};
use crate::services::ServiceProvider;

/// Builds a module instance, resolving whatever it needs from services.
pub type ModuleFactory =
    Arc<dyn Fn(&dyn ServiceProvider) -> BusResult<Arc<dyn Module>> + Send + Sync>;

/// Everything a module needs to resolve options and providers.
pub struct ModuleEnvironment {
    services: Arc<dyn ServiceProvider>,
    settings: Arc<dyn ModuleSettingsSource>,
    attached: DashMap<ModuleIdentifier, Option<ModuleSettings>>,
    providers: DashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl ModuleEnvironment {
    pub fn new(
        services: Arc<dyn ServiceProvider>,
        settings: Arc<dyn ModuleSettingsSource>,
    ) -> Self {
        Self {
            services,
            settings,
            attached: DashMap::new(),
            providers: DashMap::new(),
        }
    }

    pub fn services(&self) -> &Arc<dyn ServiceProvider> {
        &self.services
    }

    pub fn settings(&self) -> &Arc<dyn ModuleSettingsSource> {
        &self.settings
    }

    /// Override attached in code, else the one from the settings source.
    pub fn override_for(&self, id: &ModuleIdentifier) -> Option<ModuleSettings> {
        match self.attached.get(id).and_then(|entry| entry.value().clone()) {
            Some(settings) => Some(settings),
            None => self.settings.override_for(id),
        }
    }

    /// Records the override given when attaching under `id`.
    ///
    /// Every handler attached under the same identifier shares one wrapper,
    /// so a later attach must repeat the first one's override exactly.
    /// Returns whether this call recorded the identifier.
    pub(crate) fn attach_override(
        &self,
        id: &ModuleIdentifier,
        overrides: Option<ModuleSettings>,
    ) -> BusResult<bool> {
        match self.attached.entry(id.clone()) {
            Entry::Occupied(existing) if *existing.get() == overrides => Ok(false),
            Entry::Occupied(_) => Err(ConfigurationError::ConflictingOverride(id.to_string()).into()),
            Entry::Vacant(slot) => {
                slot.insert(overrides);
                Ok(true)
            }
        }
    }

    fn detach_override(&self, id: &ModuleIdentifier) {
        self.attached.remove(id);
    }

    pub(crate) fn provider_any(&self, module: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.providers.get(module).map(|entry| Arc::clone(entry.value()))
    }
}

/// Module factories by name, the instances built from them and the
/// providers registered for them.
pub struct ModuleRegistry {
    factories: DashMap<String, ModuleFactory>,
    instances: DashMap<String, Arc<dyn Module>>,
    env: ModuleEnvironment,
}

impl ModuleRegistry {
    /// Registry with the built-in Audit, Retry and Timeout modules.
    pub fn new(env: ModuleEnvironment) -> Self {
        let registry = Self::empty(env);
        let builtins = [
            (audit::NAME, builtin(audit::audit_module)),
            (retry::NAME, builtin(retry::retry_module)),
            (timeout::NAME, builtin(timeout::timeout_module)),
        ];
        for (name, factory) in builtins {
            registry.factories.insert(name.to_string(), factory);
        }
        registry
    }

    pub fn empty(env: ModuleEnvironment) -> Self {
        Self {
            factories: DashMap::new(),
            instances: DashMap::new(),
            env,
        }
    }

    pub fn environment(&self) -> &ModuleEnvironment {
        &self.env
    }

    pub fn register_module(&self, name: &str, factory: ModuleFactory) -> BusResult<()> {
        match self.factories.entry(name.to_string()) {
            Entry::Occupied(_) => Err(ConfigurationError::DuplicateModule(name.to_string()).into()),
            Entry::Vacant(slot) => {
                slot.insert(factory);
                debug!("Registered module: {}", name);
                Ok(())
            }
        }
    }

    /// Replaces the built-in behaviour of `module`. One provider per module,
    /// registered before the module is first attached.
    pub fn register_provider<O, P>(&self, module: &str, provider: P) -> BusResult<()>
    where
        O: ModuleOptions,
        P: ModuleProvider<O>,
    {
        if self.instances.contains_key(module) {
            return Err(ConfigurationError::ProviderAfterAttach(module.to_string()).into());
        }
        let provider: Arc<dyn ModuleProvider<O>> = Arc::new(provider);
        match self.env.providers.entry(module.to_string()) {
            Entry::Occupied(_) => {
                Err(ConfigurationError::DuplicateProvider(module.to_string()).into())
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(provider));
                debug!("Registered provider for module: {}", module);
                Ok(())
            }
        }
    }

    /// The instance for `name`, built by its factory on first use.
    pub fn module(&self, name: &str) -> BusResult<Arc<dyn Module>> {
        if let Some(module) = self.instances.get(name) {
            return Ok(Arc::clone(module.value()));
        }
        let factory = self
            .factories
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ConfigurationError::ModuleNotFound(name.to_string()))?;

        let module = match self.instances.entry(name.to_string()) {
            Entry::Occupied(existing) => Arc::clone(existing.get()),
            Entry::Vacant(slot) => {
                let module = factory(self.env.services.as_ref())?;
                slot.insert(Arc::clone(&module));
                module
            }
        };
        Ok(module)
    }

    /// Wraps the handler under `key` with `module`, configured for `profile`
    /// and optionally overridden for this handler's type pair.
    ///
    /// Handlers of one type pair attached to the same module and profile
    /// share a wrapper; their overrides must agree.
    #[instrument(level = "debug", skip(self, handlers, overrides))]
    pub fn attach(
        &self,
        handlers: &HandlerRegistry,
        key: &HandleKey,
        module: &str,
        profile: Option<&str>,
        overrides: Option<ModuleSettings>,
    ) -> BusResult<ModuleIdentifier> {
        if handlers.is_sealed() {
            return Err(BusError::sealed("Handler", format!("module {} for {}", module, key)));
        }
        let module = self.module(module)?;
        let id = ModuleIdentifier::for_handle(key, module.name(), profile);
        let recorded = self.env.attach_override(&id, overrides)?;

        let wrapper = match module.wrapper(&id, &self.env) {
            Ok(wrapper) => wrapper,
            Err(e) => {
                if recorded {
                    self.env.detach_override(&id);
                }
                return Err(e);
            }
        };
        handlers.register_pipeline(key, module.priority(), wrapper)?;
        Ok(id)
    }
}

fn builtin(build: fn() -> Arc<dyn Module>) -> ModuleFactory {
    Arc::new(move |_: &dyn ServiceProvider| -> BusResult<Arc<dyn Module>> { Ok(build()) })
}
