//! Bounds the time spent in the rest of the chain.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{ConfiguredModule, Module, ModuleOptions, ModuleProvider, ModuleSettings};
use crate::context::PipelineContext;
use crate::error::{BusError, BusResult};
use crate::handler::{AnyResponse, Next};
use crate::key::ModuleIdentifier;

pub const NAME: &str = "Timeout";
pub const PRIORITY: i32 = 300;

#[derive(Debug, Clone, PartialEq)]
pub struct TimeoutOptions {
    /// Zero disables the limit.
    pub timeout: Duration,
}

impl Default for TimeoutOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

impl ModuleOptions for TimeoutOptions {
    fn overlay(&mut self, module: &str, settings: &ModuleSettings) -> BusResult<()> {
        if let Some(timeout_ms) = settings.read::<u64>(module, "timeout_ms")? {
            self.timeout = Duration::from_millis(timeout_ms);
        }
        Ok(())
    }
}

pub struct TimeoutProvider;

#[async_trait]
impl ModuleProvider<TimeoutOptions> for TimeoutProvider {
    async fn execute(
        &self,
        id: &ModuleIdentifier,
        options: &TimeoutOptions,
        ctx: &mut PipelineContext,
        next: Next<'_>,
    ) -> BusResult<AnyResponse> {
        if options.timeout.is_zero() {
            return next.run(ctx).await;
        }
        match tokio::time::timeout(options.timeout, next.run(ctx)).await {
            Ok(result) => result,
            Err(_) => {
                debug!("{}: timed out after {:?}", id, options.timeout);
                Err(BusError::Timeout {
                    elapsed: options.timeout,
                })
            }
        }
    }
}

pub fn timeout_module() -> Arc<dyn Module> {
    Arc::new(ConfiguredModule::new(
        NAME,
        PRIORITY,
        TimeoutOptions::default(),
        TimeoutProvider,
    ))
}
