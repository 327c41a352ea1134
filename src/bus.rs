//! # Bus
//!
//! Façade over the handler, notification and module registries.
//!
//! ## Lifecycle
//!
//! 1. Build a [`Bus`] with [`BusBuilder`]
//! 2. Register handlers, pipelines, subscribers and modules
//! 3. Call [`Bus::complete_registration`]
//! 4. Dispatch with `send*` and `publish*`
//!
//! Registration after step 3 and dispatch before it fail with a
//! configuration error.

use std::any::Any;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::config::{self, BusConfig};
use crate::context::{BoxedValue, ContextSeed, PoolStats};
use crate::error::BusResult;
use crate::handler::{
    downcast_response, AnyResponse, HandlerRegistry, PipelineBehavior, Request, RequestHandler,
};
use crate::key::{HandleKey, ModuleIdentifier, TypeKey};
use crate::module::{
    ModuleEnvironment, ModuleFactory, ModuleOptions, ModuleProvider, ModuleRegistry,
    ModuleSettings, ModuleSettingsSource, SettingsStore,
};
use crate::notification::{NotificationHandler, NotificationRegistry, PublishStrategy};
use crate::services::{NoServices, ServiceProvider};

/// Per-call options for [`Bus::send_as`].
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Handler name; empty selects the type default.
    pub name: String,
    pub cancellation: Option<CancellationToken>,
}

impl SendOptions {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            cancellation: None,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// A request whose static type is not known at the call site.
pub struct DynamicRequest {
    key: TypeKey,
    value: BoxedValue,
}

impl DynamicRequest {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            key: TypeKey::of::<T>(),
            value: Box::new(value),
        }
    }

    pub fn type_key(&self) -> TypeKey {
        self.key
    }
}

impl fmt::Debug for DynamicRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicRequest")
            .field("type", &self.key)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusPoolStats {
    pub handler: PoolStats,
    pub pipeline: PoolStats,
    pub notification: PoolStats,
}

#[derive(Default)]
pub struct BusBuilder {
    config: Option<BusConfig>,
    services: Option<Arc<dyn ServiceProvider>>,
    settings: Option<Arc<dyn ModuleSettingsSource>>,
}

impl BusBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: BusConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Loads the [`BusConfig`] from a JSON file.
    pub fn config_file<P: AsRef<Path>>(self, path: P) -> BusResult<Self> {
        let config: BusConfig = config::from_file(path)?;
        Ok(self.config(config))
    }

    pub fn services<S: ServiceProvider + 'static>(mut self, services: S) -> Self {
        self.services = Some(Arc::new(services));
        self
    }

    pub fn shared_services(mut self, services: Arc<dyn ServiceProvider>) -> Self {
        self.services = Some(services);
        self
    }

    /// Replaces the config-backed module settings with another source.
    pub fn settings_source<S: ModuleSettingsSource + 'static>(mut self, source: S) -> Self {
        self.settings = Some(Arc::new(source));
        self
    }

    pub fn build(self) -> Bus {
        let config = self.config.unwrap_or_default();
        let services = self
            .services
            .unwrap_or_else(|| Arc::new(NoServices) as Arc<dyn ServiceProvider>);
        let settings = self.settings.unwrap_or_else(|| {
            Arc::new(SettingsStore::from_config(&config)) as Arc<dyn ModuleSettingsSource>
        });

        debug!("Building bus: {:?}", config);
        let inner = BusInner {
            handlers: HandlerRegistry::new(&config),
            notifications: NotificationRegistry::new(&config),
            modules: ModuleRegistry::new(ModuleEnvironment::new(Arc::clone(&services), settings)),
            services,
            config,
        };
        Bus {
            inner: Arc::new(inner),
        }
    }
}

struct BusInner {
    config: BusConfig,
    services: Arc<dyn ServiceProvider>,
    handlers: HandlerRegistry,
    notifications: NotificationRegistry,
    modules: ModuleRegistry,
}

/// In-process request/response and publish/subscribe dispatcher.
///
/// Cloning is cheap and shares the registries.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("sealed", &self.is_sealed())
            .finish_non_exhaustive()
    }
}

impl Bus {
    pub fn new() -> Self {
        BusBuilder::new().build()
    }

    pub fn builder() -> BusBuilder {
        BusBuilder::new()
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    pub fn services(&self) -> &Arc<dyn ServiceProvider> {
        &self.inner.services
    }

    // Registration

    pub fn register_handler<Req, Res, H>(&self, name: &str, handler: H) -> BusResult<HandleKey>
    where
        Req: Send + Sync + 'static,
        Res: Send + 'static,
        H: RequestHandler<Req, Res>,
    {
        self.inner.handlers.register(name, handler)
    }

    pub fn register_pipeline<P: PipelineBehavior>(
        &self,
        key: &HandleKey,
        priority: i32,
        behavior: P,
    ) -> BusResult<()> {
        self.inner
            .handlers
            .register_pipeline(key, priority, Arc::new(behavior))
    }

    pub fn register_notification<N, H>(&self, handler: H) -> BusResult<()>
    where
        N: Send + Sync + 'static,
        H: NotificationHandler<N>,
    {
        self.inner.notifications.register(handler)
    }

    pub fn register_module(&self, name: &str, factory: ModuleFactory) -> BusResult<()> {
        self.inner.modules.register_module(name, factory)
    }

    /// Must be called before `module` is first attached.
    pub fn register_module_provider<O, P>(&self, module: &str, provider: P) -> BusResult<()>
    where
        O: ModuleOptions,
        P: ModuleProvider<O>,
    {
        self.inner.modules.register_provider(module, provider)
    }

    /// Wraps the handler under `key` with a module as a pipeline step.
    ///
    /// Handlers of the same request/response pair that use this module and
    /// profile share one wrapper, so their `overrides` must be identical;
    /// a differing override is rejected with
    /// [`ConfigurationError::ConflictingOverride`](crate::ConfigurationError::ConflictingOverride).
    /// Fails once registration is complete.
    pub fn attach_module(
        &self,
        key: &HandleKey,
        module: &str,
        profile: Option<&str>,
        overrides: Option<ModuleSettings>,
    ) -> BusResult<ModuleIdentifier> {
        self.inner
            .modules
            .attach(&self.inner.handlers, key, module, profile, overrides)
    }

    /// Seals both registries. Calling it again has no effect.
    pub fn complete_registration(&self) {
        self.inner.handlers.complete();
        self.inner.notifications.complete();
    }

    pub fn is_sealed(&self) -> bool {
        self.inner.handlers.is_sealed() && self.inner.notifications.is_sealed()
    }

    // Requests

    pub async fn send<R: Request>(&self, request: R) -> BusResult<R::Response> {
        self.send_as::<R, R::Response>(request, SendOptions::default())
            .await
    }

    pub async fn send_named<R: Request>(&self, request: R, name: &str) -> BusResult<R::Response> {
        self.send_as::<R, R::Response>(request, SendOptions::named(name))
            .await
    }

    /// Sends with an explicit request/response pair.
    pub async fn send_as<Req, Res>(&self, request: Req, options: SendOptions) -> BusResult<Res>
    where
        Req: Send + Sync + 'static,
        Res: Send + 'static,
    {
        let handle = HandleKey::of::<Req, Res>(&options.name);
        let response = self
            .dispatch(
                TypeKey::of::<Req>(),
                Some(TypeKey::of::<Res>()),
                Box::new(request),
                options,
            )
            .await?;
        downcast_response(response, &handle)
    }

    /// Sends a type-erased request, expecting a response of type `Res`.
    pub async fn send_dynamic<Res: Send + 'static>(
        &self,
        request: DynamicRequest,
        name: &str,
    ) -> BusResult<Res> {
        let handle = HandleKey::new(request.key, TypeKey::of::<Res>(), name);
        let response = self
            .dispatch(
                request.key,
                Some(TypeKey::of::<Res>()),
                request.value,
                SendOptions::named(name),
            )
            .await?;
        downcast_response(response, &handle)
    }

    /// Sends a type-erased request to the only handler registered for its
    /// type (and name, if given), whatever its response type.
    pub async fn send_object(&self, request: DynamicRequest, name: &str) -> BusResult<AnyResponse> {
        self.dispatch(request.key, None, request.value, SendOptions::named(name))
            .await
    }

    /// Sends a type-erased request to a handler that responds with `()`.
    pub async fn send_void(&self, request: DynamicRequest, name: &str) -> BusResult<()> {
        self.send_dynamic::<()>(request, name).await
    }

    #[instrument(level = "debug", skip(self, request, options), fields(name = %options.name))]
    async fn dispatch(
        &self,
        request_type: TypeKey,
        response_type: Option<TypeKey>,
        request: BoxedValue,
        options: SendOptions,
    ) -> BusResult<AnyResponse> {
        let entry = self
            .inner
            .handlers
            .resolve(request_type, response_type, &options.name)?;
        let seed = self.seed(options.cancellation);
        let response = self.inner.handlers.invoke(&entry, request, &seed).await;
        response
    }

    // Notifications

    /// Publishes with the configured default strategy.
    pub async fn publish<N: Send + Sync + 'static>(&self, notification: N) -> BusResult<()> {
        self.publish_cancellable(notification, None, CancellationToken::new())
            .await
    }

    pub async fn publish_with<N: Send + Sync + 'static>(
        &self,
        notification: N,
        strategy: PublishStrategy,
    ) -> BusResult<()> {
        self.publish_cancellable(notification, Some(strategy), CancellationToken::new())
            .await
    }

    #[instrument(level = "debug", skip(self, notification, cancellation), fields(notification = %TypeKey::of::<N>()))]
    pub async fn publish_cancellable<N: Send + Sync + 'static>(
        &self,
        notification: N,
        strategy: Option<PublishStrategy>,
        cancellation: CancellationToken,
    ) -> BusResult<()> {
        let strategy = strategy.unwrap_or(self.inner.config.publish_strategy);
        let seed = self.seed(Some(cancellation));
        let result = self
            .inner
            .notifications
            .publish(notification, &seed, strategy)
            .await;
        result
    }

    pub fn pool_stats(&self) -> BusPoolStats {
        BusPoolStats {
            handler: self.inner.handlers.handler_pool_stats(),
            pipeline: self.inner.handlers.pipeline_pool_stats(),
            notification: self.inner.notifications.pool_stats(),
        }
    }

    fn seed(&self, cancellation: Option<CancellationToken>) -> ContextSeed {
        ContextSeed::new(Arc::clone(&self.inner.services))
            .with_bus(self.clone())
            .with_cancellation(cancellation.unwrap_or_default())
    }
}
