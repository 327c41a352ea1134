//! Handler registration, resolution and invocation.
//!
//! The registry has two phases. While registering, entries live in
//! mutex-protected tables. [`HandlerRegistry::complete`] moves them into
//! immutable lookup tables that dispatch reads without locking; from then on
//! registration is rejected.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};

use tracing::{debug, trace, warn};

use super::{AnyResponse, ErasedHandler, Next, PipelineBehavior, PipelineStep, RequestHandler, TypedHandler};
use crate::config::BusConfig;
use crate::context::{
    BoxedValue, ContextPool, ContextSeed, HandlerContext, HandlerLease, Lease, PipelineContext,
    PoolStats,
};
use crate::error::{BusError, BusResult, ConfigurationError};
use crate::key::{HandleKey, RequestResponseKey, TypeKey};

const REGISTRY: &str = "Handler";

/// A registered handler and the pipeline steps attached to it.
pub struct HandlerEntry {
    key: HandleKey,
    terminal: Arc<dyn ErasedHandler>,
    pipelines: Mutex<Vec<PipelineStep>>,
    composed: RwLock<Option<Arc<[PipelineStep]>>>,
}

impl HandlerEntry {
    fn new(key: HandleKey, terminal: Arc<dyn ErasedHandler>) -> Self {
        Self {
            key,
            terminal,
            pipelines: Mutex::new(Vec::new()),
            composed: RwLock::new(None),
        }
    }

    pub fn key(&self) -> &HandleKey {
        &self.key
    }

    pub fn pipeline_count(&self) -> usize {
        self.pipelines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn add_pipeline(&self, step: PipelineStep) {
        self.pipelines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(step);
        *self.composed.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Steps sorted by priority, ties in attachment order. Built on first use
    /// and cached until another step is attached.
    pub fn composed(&self) -> Arc<[PipelineStep]> {
        if let Some(chain) = self
            .composed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            return Arc::clone(chain);
        }

        let mut slot = self.composed.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(chain) = slot.as_ref() {
            return Arc::clone(chain);
        }
        let mut steps = self
            .pipelines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        steps.sort_by_key(|step| step.priority);
        let chain: Arc<[PipelineStep]> = steps.into();
        trace!("Composed {} pipeline steps for {}", chain.len(), self.key);
        *slot = Some(Arc::clone(&chain));
        chain
    }
}

impl fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("key", &self.key)
            .field("pipelines", &self.pipeline_count())
            .finish()
    }
}

#[derive(Default)]
struct HandlerTables {
    by_handle: HashMap<HandleKey, Arc<HandlerEntry>>,
    defaults: HashMap<RequestResponseKey, Arc<HandlerEntry>>,
}

struct SealedHandlers {
    tables: HandlerTables,
    by_request: HashMap<TypeKey, Vec<Arc<HandlerEntry>>>,
}

pub struct HandlerRegistry {
    pending: Mutex<HandlerTables>,
    sealed: OnceLock<SealedHandlers>,
    handler_pool: Arc<ContextPool<HandlerContext>>,
    pipeline_pool: Arc<ContextPool<PipelineContext>>,
    fast_path: bool,
}

impl HandlerRegistry {
    pub fn new(config: &BusConfig) -> Self {
        Self {
            pending: Mutex::new(HandlerTables::default()),
            sealed: OnceLock::new(),
            handler_pool: Arc::new(ContextPool::new(config.handler_pool_capacity)),
            pipeline_pool: Arc::new(ContextPool::new(config.pipeline_pool_capacity)),
            fast_path: config.fast_path,
        }
    }

    /// Registers `handler` under `(Req, Res, name)`.
    ///
    /// An identical key replaces the earlier handler, and the registration
    /// becomes the type default for `(Req, Res)`.
    pub fn register<Req, Res, H>(&self, name: &str, handler: H) -> BusResult<HandleKey>
    where
        Req: Send + Sync + 'static,
        Res: Send + 'static,
        H: RequestHandler<Req, Res>,
    {
        let key = HandleKey::of::<Req, Res>(name);
        let terminal: Arc<dyn ErasedHandler> = Arc::new(TypedHandler::new(handler));
        self.register_erased(key.clone(), terminal)?;
        Ok(key)
    }

    fn register_erased(&self, key: HandleKey, terminal: Arc<dyn ErasedHandler>) -> BusResult<()> {
        let mut tables = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_sealed() {
            return Err(BusError::sealed(REGISTRY, key.to_string()));
        }
        let entry = Arc::new(HandlerEntry::new(key.clone(), terminal));
        if tables.by_handle.insert(key.clone(), Arc::clone(&entry)).is_some() {
            debug!("Replaced handler: {}", key);
        } else {
            debug!("Registered handler: {}", key);
        }
        tables.defaults.insert(key.type_pair(), entry);
        Ok(())
    }

    /// Attaches a pipeline step to the handler registered under `key`.
    ///
    /// Unknown keys are ignored.
    pub fn register_pipeline(
        &self,
        key: &HandleKey,
        priority: i32,
        behavior: Arc<dyn PipelineBehavior>,
    ) -> BusResult<()> {
        let tables = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_sealed() {
            return Err(BusError::sealed(REGISTRY, format!("pipeline for {}", key)));
        }
        match tables.by_handle.get(key) {
            Some(entry) => {
                entry.add_pipeline(PipelineStep::new(priority, behavior));
                debug!("Attached pipeline to {} at priority {}", key, priority);
            }
            None => warn!("No handler registered for {}, pipeline ignored", key),
        }
        Ok(())
    }

    /// Seals the registry. Calling it again has no effect.
    pub fn complete(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_sealed() {
            return;
        }
        let tables = std::mem::take(&mut *pending);
        let mut by_request: HashMap<TypeKey, Vec<Arc<HandlerEntry>>> = HashMap::new();
        for entry in tables.by_handle.values() {
            by_request
                .entry(entry.key.request)
                .or_default()
                .push(Arc::clone(entry));
        }
        debug!("Handler registry sealed with {} handlers", tables.by_handle.len());
        let _ = self.sealed.set(SealedHandlers { tables, by_request });
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.get().is_some()
    }

    /// Finds the handler for a request.
    ///
    /// With a known response type, a non-empty `name` selects the exact
    /// registration and an empty one selects the type default. Without a
    /// response type, the single handler registered for the request type
    /// (with that name, if given) is selected.
    pub fn resolve(
        &self,
        request: TypeKey,
        response: Option<TypeKey>,
        name: &str,
    ) -> BusResult<Arc<HandlerEntry>> {
        let sealed = self.sealed.get().ok_or_else(|| BusError::not_sealed(REGISTRY))?;

        let found = match response {
            Some(response) if !name.is_empty() => sealed
                .tables
                .by_handle
                .get(&HandleKey::new(request, response, name))
                .cloned(),
            Some(response) => sealed
                .tables
                .defaults
                .get(&RequestResponseKey::new(request, response))
                .cloned(),
            None => {
                let candidates: Vec<&Arc<HandlerEntry>> = sealed
                    .by_request
                    .get(&request)
                    .map(|entries| {
                        entries
                            .iter()
                            .filter(|entry| name.is_empty() || entry.key.name == name)
                            .collect()
                    })
                    .unwrap_or_default();
                match candidates.as_slice() {
                    [single] => Some(Arc::clone(*single)),
                    [] => None,
                    many => {
                        return Err(ConfigurationError::AmbiguousHandler {
                            request: request.to_string(),
                            candidates: many.len(),
                        }
                        .into())
                    }
                }
            }
        };

        found.ok_or_else(|| {
            let key = match response {
                Some(response) => HandleKey::new(request, response, name).to_string(),
                None if name.is_empty() => format!("{} -> ?", request),
                None => format!("{} -> ? ({})", request, name),
            };
            ConfigurationError::HandlerNotFound { key }.into()
        })
    }

    /// Runs `entry` for `request`, through its pipeline chain if it has one.
    pub(crate) async fn invoke(
        &self,
        entry: &HandlerEntry,
        request: BoxedValue,
        seed: &ContextSeed,
    ) -> BusResult<AnyResponse> {
        if seed.cancellation.is_cancelled() {
            return Err(BusError::Cancelled);
        }

        let steps = entry.composed();
        if steps.is_empty() {
            trace!("Dispatching {} without pipelines", entry.key);
            let mut ctx = HandlerLease::rent(&self.handler_pool, self.fast_path);
            ctx.init(request, seed);
            let response = entry.terminal.invoke(&*ctx).await;
            response
        } else {
            trace!("Dispatching {} through {} steps", entry.key, steps.len());
            let mut ctx = Lease::rent(&self.pipeline_pool);
            ctx.init(request, seed);
            let response = Next::new(&steps, entry.terminal.as_ref())
                .run(&mut ctx)
                .await;
            response
        }
    }

    pub fn handler_pool_stats(&self) -> PoolStats {
        self.handler_pool.stats()
    }

    pub fn pipeline_pool_stats(&self) -> PoolStats {
        self.pipeline_pool.stats()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new(&BusConfig::default())
    }
}
