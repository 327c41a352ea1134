use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use super::{downcast_response, AnyResponse, ErasedHandler};
use crate::context::PipelineContext;
use crate::error::BusResult;

/// Middleware step wrapped around a handler.
///
/// A step may run code before and after the rest of the chain, short-circuit
/// by returning without calling `next`, or call `next` more than once.
#[async_trait]
pub trait PipelineBehavior: Send + Sync + 'static {
    async fn handle(&self, ctx: &mut PipelineContext, next: Next<'_>) -> BusResult<AnyResponse>;
}

/// A step together with its ordering priority. Lower runs outermost.
#[derive(Clone)]
pub struct PipelineStep {
    pub priority: i32,
    pub behavior: Arc<dyn PipelineBehavior>,
}

impl PipelineStep {
    pub fn new(priority: i32, behavior: Arc<dyn PipelineBehavior>) -> Self {
        Self { priority, behavior }
    }
}

impl fmt::Debug for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineStep")
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Cursor over the remaining steps of a composed chain.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    steps: &'a [PipelineStep],
    terminal: &'a dyn ErasedHandler,
}

impl<'a> Next<'a> {
    pub(crate) fn new(steps: &'a [PipelineStep], terminal: &'a dyn ErasedHandler) -> Self {
        Self { steps, terminal }
    }

    /// Steps left before the handler.
    pub fn remaining(&self) -> usize {
        self.steps.len()
    }

    /// Runs the rest of the chain, ending with the handler.
    pub async fn run(self, ctx: &mut PipelineContext) -> BusResult<AnyResponse> {
        match self.steps.split_first() {
            Some((step, rest)) => {
                ctx.advance();
                let next = Next {
                    steps: rest,
                    terminal: self.terminal,
                };
                step.behavior.handle(ctx, next).await
            }
            None => self.terminal.invoke(&*ctx).await,
        }
    }

    /// Like [`run`](Self::run), recovering the concrete response type.
    pub async fn run_typed<Res: Any>(self, ctx: &mut PipelineContext) -> BusResult<Res> {
        let response = self.run(ctx).await?;
        downcast_response(response, &"pipeline chain")
    }
}
