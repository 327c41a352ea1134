//! # Request Handlers
//!
//! A request is routed to exactly one [`RequestHandler`], chosen by request
//! type, response type and an optional name. Handlers may be wrapped by
//! [`PipelineBehavior`] steps; see [`registry`] for resolution and dispatch.

pub mod pipeline;
pub mod registry;

use std::any::Any;
use std::marker::PhantomData;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::context::ExecutionContext;
use crate::error::{BusResult, ConfigurationError};
use crate::key::TypeKey;

pub use pipeline::{Next, PipelineBehavior, PipelineStep};
pub use registry::{HandlerEntry, HandlerRegistry};

/// Type-erased response travelling through the pipeline chain.
pub type AnyResponse = Box<dyn Any + Send>;

/// Marker for request types that know their response type.
///
/// Lets callers write `bus.send(request)` instead of spelling out the pair.
pub trait Request: Send + Sync + 'static {
    type Response: Send + 'static;
}

#[async_trait]
pub trait RequestHandler<Req, Res>: Send + Sync + 'static
where
    Req: Send + Sync + 'static,
    Res: Send + 'static,
{
    async fn handle(&self, request: &Req, ctx: &dyn ExecutionContext) -> BusResult<Res>;
}

/// Handler built from a synchronous closure.
pub struct FnHandler<F, Req, Res> {
    f: F,
    _marker: PhantomData<fn(Req) -> Res>,
}

/// Wraps a synchronous closure as a [`RequestHandler`].
pub fn handler_fn<F, Req, Res>(f: F) -> FnHandler<F, Req, Res>
where
    F: Fn(&Req, &dyn ExecutionContext) -> BusResult<Res> + Send + Sync + 'static,
{
    FnHandler {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<F, Req, Res> RequestHandler<Req, Res> for FnHandler<F, Req, Res>
where
    F: Fn(&Req, &dyn ExecutionContext) -> BusResult<Res> + Send + Sync + 'static,
    Req: Send + Sync + 'static,
    Res: Send + 'static,
{
    async fn handle(&self, request: &Req, ctx: &dyn ExecutionContext) -> BusResult<Res> {
        (self.f)(request, ctx)
    }
}

/// Terminal handler with its request and response types erased.
pub(crate) trait ErasedHandler: Send + Sync {
    fn invoke<'a>(&'a self, ctx: &'a dyn ExecutionContext) -> BoxFuture<'a, BusResult<AnyResponse>>;
}

pub(crate) struct TypedHandler<H, Req, Res> {
    inner: H,
    _marker: PhantomData<fn(Req) -> Res>,
}

impl<H, Req, Res> TypedHandler<H, Req, Res> {
    pub fn new(inner: H) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }
}

impl<H, Req, Res> ErasedHandler for TypedHandler<H, Req, Res>
where
    H: RequestHandler<Req, Res>,
    Req: Send + Sync + 'static,
    Res: Send + 'static,
{
    fn invoke<'a>(&'a self, ctx: &'a dyn ExecutionContext) -> BoxFuture<'a, BusResult<AnyResponse>> {
        Box::pin(async move {
            let request = ctx.request::<Req>().ok_or_else(|| {
                ConfigurationError::RequestTypeMismatch {
                    expected: TypeKey::of::<Req>().to_string(),
                }
            })?;
            let response = self.inner.handle(request, ctx).await?;
            Ok(Box::new(response) as AnyResponse)
        })
    }
}

/// Recovers a typed response from the erased chain output.
pub(crate) fn downcast_response<Res: 'static>(
    response: AnyResponse,
    handle: &dyn std::fmt::Display,
) -> BusResult<Res> {
    response.downcast::<Res>().map(|boxed| *boxed).map_err(|_| {
        ConfigurationError::ResponseTypeMismatch {
            handle: handle.to_string(),
            expected: TypeKey::of::<Res>().to_string(),
        }
        .into()
    })
}
