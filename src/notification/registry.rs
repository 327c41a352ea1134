use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use tracing::{debug, trace};

use super::{ErasedSubscriber, NotificationHandler, PublishStrategy, TypedSubscriber};
use crate::config::BusConfig;
use crate::context::{ContextPool, ContextSeed, Lease, NotificationContext, PoolStats};
use crate::error::{BusError, BusResult};
use crate::key::TypeKey;

const REGISTRY: &str = "Notification";

type Subscribers = Arc<[Arc<dyn ErasedSubscriber>]>;

pub struct NotificationRegistry {
    pending: Mutex<HashMap<TypeKey, Vec<Arc<dyn ErasedSubscriber>>>>,
    sealed: OnceLock<HashMap<TypeKey, Subscribers>>,
    pool: Arc<ContextPool<NotificationContext>>,
}

impl NotificationRegistry {
    pub fn new(config: &BusConfig) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            sealed: OnceLock::new(),
            pool: Arc::new(ContextPool::new(config.notification_pool_capacity)),
        }
    }

    /// Appends a subscriber for notifications of type `N`.
    pub fn register<N, H>(&self, handler: H) -> BusResult<()>
    where
        N: Send + Sync + 'static,
        H: NotificationHandler<N>,
    {
        let key = TypeKey::of::<N>();
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_sealed() {
            return Err(BusError::sealed(REGISTRY, format!("subscriber for {}", key)));
        }
        let subscribers = pending.entry(key).or_default();
        subscribers.push(Arc::new(TypedSubscriber::<H, N>::new(handler)));
        debug!("Registered subscriber #{} for {}", subscribers.len(), key);
        Ok(())
    }

    /// Freezes the subscriber lists. Calling it again has no effect.
    pub fn complete(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_sealed() {
            return;
        }
        let frozen: HashMap<TypeKey, Subscribers> = pending
            .drain()
            .map(|(key, subscribers)| (key, subscribers.into()))
            .collect();
        debug!("Notification registry sealed with {} types", frozen.len());
        let _ = self.sealed.set(frozen);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.get().is_some()
    }

    pub fn subscriber_count(&self, notification: TypeKey) -> usize {
        self.sealed
            .get()
            .and_then(|sealed| sealed.get(&notification))
            .map_or(0, |subscribers| subscribers.len())
    }

    /// Delivers `notification` to every subscriber of its type.
    pub(crate) async fn publish<N>(
        &self,
        notification: N,
        seed: &ContextSeed,
        strategy: PublishStrategy,
    ) -> BusResult<()>
    where
        N: Send + Sync + 'static,
    {
        let sealed = self.sealed.get().ok_or_else(|| BusError::not_sealed(REGISTRY))?;
        let key = TypeKey::of::<N>();
        let Some(subscribers) = sealed.get(&key).filter(|s| !s.is_empty()) else {
            trace!("No subscribers for {}", key);
            return Ok(());
        };
        if seed.cancellation.is_cancelled() {
            return Err(BusError::Cancelled);
        }

        let mut ctx = Lease::rent(&self.pool);
        ctx.init(Box::new(notification), seed);
        trace!("Publishing {} to {} subscribers ({})", key, subscribers.len(), strategy);

        let result = match strategy {
            PublishStrategy::Sequential => deliver_sequential(subscribers, &ctx).await,
            PublishStrategy::Parallel => deliver_parallel(subscribers, &ctx).await,
        };
        result
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

impl Default for NotificationRegistry {
    fn default() -> Self {
        Self::new(&BusConfig::default())
    }
}

async fn deliver_sequential(
    subscribers: &[Arc<dyn ErasedSubscriber>],
    ctx: &NotificationContext,
) -> BusResult<()> {
    for subscriber in subscribers {
        if ctx.cancellation().is_cancelled() {
            return Err(BusError::Cancelled);
        }
        subscriber.deliver(ctx).await?;
    }
    Ok(())
}

async fn deliver_parallel(
    subscribers: &[Arc<dyn ErasedSubscriber>],
    ctx: &NotificationContext,
) -> BusResult<()> {
    let mut errors: Vec<(usize, BusError)> = Vec::new();
    let mut running: Vec<(usize, BoxFuture<'_, BusResult<()>>)> = Vec::new();

    for (index, subscriber) in subscribers.iter().enumerate() {
        let mut delivery = subscriber.deliver(ctx);
        match (&mut delivery).now_or_never() {
            Some(Ok(())) => {}
            Some(Err(e)) => errors.push((index, e)),
            None => running.push((index, delivery)),
        }
    }

    if !running.is_empty() {
        let (indices, deliveries): (Vec<usize>, Vec<_>) = running.into_iter().unzip();
        for (index, result) in indices.into_iter().zip(join_all(deliveries).await) {
            if let Err(e) = result {
                errors.push((index, e));
            }
        }
    }

    errors.sort_by_key(|(index, _)| *index);
    let mut errors: Vec<BusError> = errors.into_iter().map(|(_, e)| e).collect();
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(BusError::Multiple(errors)),
    }
}
