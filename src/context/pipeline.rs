use std::any::Any;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::{
    no_services, BoxedValue, ContextItems, ContextSeed, ExecutionContext, Poolable,
};
use crate::bus::Bus;
use crate::services::ServiceProvider;

/// Context for requests that run through at least one pipeline step.
pub struct PipelineContext {
    request: Option<BoxedValue>,
    services: Arc<dyn ServiceProvider>,
    bus: Option<Bus>,
    cancellation: CancellationToken,
    items: ContextItems,
    execution_order: usize,
}

impl PipelineContext {
    pub(crate) fn init(&mut self, request: BoxedValue, seed: &ContextSeed) {
        self.request = Some(request);
        self.services = Arc::clone(&seed.services);
        self.bus = seed.bus.clone();
        self.cancellation = seed.cancellation.clone();
    }

    pub fn request<T: Any>(&self) -> Option<&T> {
        self.request.as_ref()?.downcast_ref::<T>()
    }

    /// Mutable access for steps that rewrite the request before passing it on.
    pub fn request_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.request.as_mut()?.downcast_mut::<T>()
    }

    pub fn items(&self) -> &ContextItems {
        &self.items
    }

    pub fn items_mut(&mut self) -> &mut ContextItems {
        &mut self.items
    }

    /// Number of pipeline steps entered so far in this dispatch.
    pub fn execution_order(&self) -> usize {
        self.execution_order
    }

    pub(crate) fn advance(&mut self) {
        self.execution_order += 1;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

impl Default for PipelineContext {
    fn default() -> Self {
        Self {
            request: None,
            services: no_services(),
            bus: None,
            cancellation: CancellationToken::new(),
            items: ContextItems::new(),
            execution_order: 0,
        }
    }
}

impl Poolable for PipelineContext {
    fn reset(&mut self) {
        self.request = None;
        self.services = no_services();
        self.bus = None;
        self.cancellation = CancellationToken::new();
        self.items.clear();
        self.execution_order = 0;
    }
}

impl ExecutionContext for PipelineContext {
    fn request_any(&self) -> Option<&(dyn Any + Send + Sync)> {
        self.request.as_deref()
    }

    fn services(&self) -> &Arc<dyn ServiceProvider> {
        &self.services
    }

    fn bus(&self) -> Option<&Bus> {
        self.bus.as_ref()
    }

    fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    fn items(&self) -> Option<&ContextItems> {
        Some(&self.items)
    }
}
