//! # Notifications
//!
//! Publish/subscribe side of the bus. Every subscriber registered for a
//! notification type receives each published value of that type, either one
//! after another or concurrently depending on the [`PublishStrategy`].

pub mod registry;

use std::marker::PhantomData;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::context::NotificationContext;
use crate::error::{BusResult, ConfigurationError};
use crate::key::TypeKey;

pub use registry::NotificationRegistry;

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
pub enum PublishStrategy {
    /// Subscribers run one at a time in registration order; the first
    /// failure stops the rest.
    #[default]
    Sequential,
    /// Subscribers run concurrently; failures are reported once all settle.
    Parallel,
}

#[async_trait]
pub trait NotificationHandler<N>: Send + Sync + 'static
where
    N: Send + Sync + 'static,
{
    async fn handle(&self, notification: &N, ctx: &NotificationContext) -> BusResult<()>;
}

pub struct FnNotificationHandler<F, N> {
    f: F,
    _marker: PhantomData<fn(N)>,
}

/// Wraps a synchronous closure as a [`NotificationHandler`].
pub fn notification_fn<F, N>(f: F) -> FnNotificationHandler<F, N>
where
    F: Fn(&N, &NotificationContext) -> BusResult<()> + Send + Sync + 'static,
{
    FnNotificationHandler {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<F, N> NotificationHandler<N> for FnNotificationHandler<F, N>
where
    F: Fn(&N, &NotificationContext) -> BusResult<()> + Send + Sync + 'static,
    N: Send + Sync + 'static,
{
    async fn handle(&self, notification: &N, ctx: &NotificationContext) -> BusResult<()> {
        (self.f)(notification, ctx)
    }
}

pub(crate) trait ErasedSubscriber: Send + Sync {
    fn deliver<'a>(&'a self, ctx: &'a NotificationContext) -> BoxFuture<'a, BusResult<()>>;
}

pub(crate) struct TypedSubscriber<H, N> {
    inner: H,
    _marker: PhantomData<fn(N)>,
}

impl<H, N> TypedSubscriber<H, N> {
    pub fn new(inner: H) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }
}

impl<H, N> ErasedSubscriber for TypedSubscriber<H, N>
where
    H: NotificationHandler<N>,
    N: Send + Sync + 'static,
{
    fn deliver<'a>(&'a self, ctx: &'a NotificationContext) -> BoxFuture<'a, BusResult<()>> {
        Box::pin(async move {
            let notification = ctx.notification::<N>().ok_or_else(|| {
                ConfigurationError::RequestTypeMismatch {
                    expected: TypeKey::of::<N>().to_string(),
                }
            })?;
            self.inner.handle(notification, ctx).await
        })
    }
}
