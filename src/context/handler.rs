use std::any::Any;
use std::cell::RefCell;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::{no_services, BoxedValue, ContextPool, ContextSeed, ExecutionContext, Poolable};
use crate::bus::Bus;
use crate::services::ServiceProvider;

/// Context for requests whose handler has no pipeline steps.
pub struct HandlerContext {
    request: Option<BoxedValue>,
    services: Arc<dyn ServiceProvider>,
    bus: Option<Bus>,
    cancellation: CancellationToken,
}

impl HandlerContext {
    pub(crate) fn init(&mut self, request: BoxedValue, seed: &ContextSeed) {
        self.request = Some(request);
        self.services = Arc::clone(&seed.services);
        self.bus = seed.bus.clone();
        self.cancellation = seed.cancellation.clone();
    }

    pub fn request<T: Any>(&self) -> Option<&T> {
        self.request.as_ref()?.downcast_ref::<T>()
    }
}

impl Default for HandlerContext {
    fn default() -> Self {
        Self {
            request: None,
            services: no_services(),
            bus: None,
            cancellation: CancellationToken::new(),
        }
    }
}

impl Poolable for HandlerContext {
    fn reset(&mut self) {
        self.request = None;
        self.services = no_services();
        self.bus = None;
        self.cancellation = CancellationToken::new();
    }
}

impl ExecutionContext for HandlerContext {
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
}

thread_local! {
    static LOCAL_SLOT: RefCell<Option<HandlerContext>> = const { RefCell::new(None) };
}

/// Checkout of a [`HandlerContext`], preferring the per-thread slot.
///
/// The slot is emptied while the lease is alive, so a nested or interleaved
/// dispatch on the same thread rents from the pool instead. On drop the
/// context goes back to the slot of whichever thread drops it, or to the
/// pool if that slot is occupied.
pub(crate) struct HandlerLease {
    ctx: Option<HandlerContext>,
    pool: Arc<ContextPool<HandlerContext>>,
    local: bool,
}

impl HandlerLease {
    pub fn rent(pool: &Arc<ContextPool<HandlerContext>>, use_local: bool) -> Self {
        let cached = if use_local { take_local() } else { None };
        Self {
            ctx: Some(cached.unwrap_or_else(|| pool.rent())),
            pool: Arc::clone(pool),
            local: use_local,
        }
    }
}

fn take_local() -> Option<HandlerContext> {
    LOCAL_SLOT
        .try_with(|slot| slot.try_borrow_mut().ok().and_then(|mut slot| slot.take()))
        .ok()
        .flatten()
}

/// Hands `ctx` back if the slot is empty.
fn park_local(ctx: HandlerContext) -> Option<HandlerContext> {
    let mut pending = Some(ctx);
    let _ = LOCAL_SLOT.try_with(|slot| {
        if let Ok(mut slot) = slot.try_borrow_mut() {
            if slot.is_none() {
                *slot = pending.take();
            }
        }
    });
    pending
}

impl Deref for HandlerLease {
    type Target = HandlerContext;

    fn deref(&self) -> &HandlerContext {
        match &self.ctx {
            Some(ctx) => ctx,
            None => unreachable!("handler lease used after release"),
        }
    }
}

impl DerefMut for HandlerLease {
    fn deref_mut(&mut self) -> &mut HandlerContext {
        match &mut self.ctx {
            Some(ctx) => ctx,
            None => unreachable!("handler lease used after release"),
        }
    }
}

impl Drop for HandlerLease {
    fn drop(&mut self) {
        let Some(mut ctx) = self.ctx.take() else {
            return;
        };
        if self.local {
            ctx.reset();
            if let Some(ctx) = park_local(ctx) {
                self.pool.give_back(ctx);
            }
        } else {
            self.pool.give_back(ctx);
        }
    }
}
