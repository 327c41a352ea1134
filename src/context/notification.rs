use std::any::Any;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::{no_services, BoxedValue, ContextSeed, ExecutionContext, Poolable};
use crate::bus::Bus;
use crate::services::ServiceProvider;

/// Context shared by every subscriber of one publish.
pub struct NotificationContext {
    notification: Option<BoxedValue>,
    services: Arc<dyn ServiceProvider>,
    bus: Option<Bus>,
    cancellation: CancellationToken,
}

impl NotificationContext {
    pub(crate) fn init(&mut self, notification: BoxedValue, seed: &ContextSeed) {
        self.notification = Some(notification);
        self.services = Arc::clone(&seed.services);
        self.bus = seed.bus.clone();
        self.cancellation = seed.cancellation.clone();
    }

    pub fn notification<T: Any>(&self) -> Option<&T> {
        self.notification.as_ref()?.downcast_ref::<T>()
    }

    pub fn services(&self) -> &Arc<dyn ServiceProvider> {
        &self.services
    }

    pub fn bus(&self) -> Option<&Bus> {
        self.bus.as_ref()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}

impl Default for NotificationContext {
    fn default() -> Self {
        Self {
            notification: None,
            services: no_services(),
            bus: None,
            cancellation: CancellationToken::new(),
        }
    }
}

impl Poolable for NotificationContext {
    fn reset(&mut self) {
        self.notification = None;
        self.services = no_services();
        self.bus = None;
        self.cancellation = CancellationToken::new();
    }
}

impl ExecutionContext for NotificationContext {
    fn request_any(&self) -> Option<&(dyn Any + Send + Sync)> {
        self.notification.as_deref()
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
}
