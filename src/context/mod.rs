//! # Execution Contexts
//!
//! Every dispatch runs against a context object that carries the request (or
//! notification), the service provider, a handle back to the bus and the
//! cancellation token of the call.
//!
//! - [`HandlerContext`]: pipeline-free requests (the fast path)
//! - [`PipelineContext`]: requests with at least one pipeline step; adds a
//!   per-invocation item bag and an execution-order counter
//! - [`NotificationContext`]: published notifications
//!
//! Contexts are pooled. A dispatch moves a context out of its pool, owns it
//! exclusively and hands it back through a drop guard, which resets it first.

mod handler;
mod items;
mod notification;
mod pipeline;
mod pool;

use std::any::Any;
use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

use crate::bus::Bus;
use crate::services::{NoServices, ServiceProvider};

pub use handler::HandlerContext;
pub(crate) use handler::HandlerLease;
pub use items::ContextItems;
pub use notification::NotificationContext;
pub use pipeline::PipelineContext;
pub use pool::{ContextPool, Lease, PoolStats, Poolable};

/// Type-erased request or notification value.
pub type BoxedValue = Box<dyn Any + Send + Sync>;

/// Read access shared by all context kinds.
pub trait ExecutionContext: Send + Sync {
    fn request_any(&self) -> Option<&(dyn Any + Send + Sync)>;

    fn services(&self) -> &Arc<dyn ServiceProvider>;

    /// The bus the dispatch came from. `None` when the registry is driven
    /// directly, without a [`Bus`].
    fn bus(&self) -> Option<&Bus>;

    fn cancellation(&self) -> &CancellationToken;

    /// Items set by earlier pipeline steps, if this is a pipeline dispatch.
    fn items(&self) -> Option<&ContextItems> {
        None
    }
}

impl dyn ExecutionContext + '_ {
    pub fn request<T: Any>(&self) -> Option<&T> {
        self.request_any()?.downcast_ref::<T>()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation().is_cancelled()
    }
}

/// Per-call ambient state copied into a context on checkout.
#[derive(Clone)]
pub(crate) struct ContextSeed {
    pub services: Arc<dyn ServiceProvider>,
    pub bus: Option<Bus>,
    pub cancellation: CancellationToken,
}

impl ContextSeed {
    pub fn new(services: Arc<dyn ServiceProvider>) -> Self {
        Self {
            services,
            bus: None,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_bus(mut self, bus: Bus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }
}

impl Default for ContextSeed {
    fn default() -> Self {
        Self::new(no_services())
    }
}

/// Shared provider for contexts sitting in a pool.
fn no_services() -> Arc<dyn ServiceProvider> {
    static NO_SERVICES: OnceLock<Arc<dyn ServiceProvider>> = OnceLock::new();
    Arc::clone(NO_SERVICES.get_or_init(|| Arc::new(NoServices)))
}
