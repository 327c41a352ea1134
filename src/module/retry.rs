//! Re-runs the rest of the chain when it fails with a retryable error.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{ConfiguredModule, Module, ModuleOptions, ModuleProvider, ModuleSettings};
use crate::context::{ExecutionContext, PipelineContext};
use crate::error::{BusError, BusResult, ConfigurationError};
use crate::handler::{AnyResponse, Next};
use crate::key::ModuleIdentifier;

pub const NAME: &str = "Retry";
pub const PRIORITY: i32 = 200;

/// Item holding the 1-based attempt number while the chain runs.
pub const ATTEMPT_ITEM: &str = "retry.attempt";

#[derive(Debug, Clone, PartialEq)]
pub struct RetryOptions {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
        }
    }
}

impl ModuleOptions for RetryOptions {
    fn overlay(&mut self, module: &str, settings: &ModuleSettings) -> BusResult<()> {
        if let Some(max_attempts) = settings.read(module, "max_attempts")? {
            self.max_attempts = max_attempts;
        }
        if let Some(delay_ms) = settings.read::<u64>(module, "delay_ms")? {
            self.delay = Duration::from_millis(delay_ms);
        }
        if let Some(multiplier) = settings.read::<f64>(module, "backoff_multiplier")? {
            if !multiplier.is_finite() || multiplier < 1.0 {
                return Err(ConfigurationError::InvalidSetting {
                    module: module.to_string(),
                    key: "backoff_multiplier".to_string(),
                    message: format!("must be a finite number >= 1.0, got {}", multiplier),
                }
                .into());
            }
            self.backoff_multiplier = multiplier;
        }
        Ok(())
    }
}

pub struct RetryProvider;

#[async_trait]
impl ModuleProvider<RetryOptions> for RetryProvider {
    async fn execute(
        &self,
        id: &ModuleIdentifier,
        options: &RetryOptions,
        ctx: &mut PipelineContext,
        next: Next<'_>,
    ) -> BusResult<AnyResponse> {
        let max_attempts = options.max_attempts.max(1);
        let mut delay = options.delay;
        let mut attempt = 1;

        loop {
            ctx.items_mut().insert(ATTEMPT_ITEM, attempt);
            let error = match next.run(ctx).await {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };
            if attempt >= max_attempts || !error.is_retryable() || ctx.is_cancelled() {
                return Err(error);
            }
            debug!(
                "{}: attempt {}/{} failed: {}, retrying in {:?}",
                id, attempt, max_attempts, error, delay
            );

            let cancellation = ctx.cancellation().clone();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancellation.cancelled() => return Err(BusError::Cancelled),
            }
            delay = Duration::try_from_secs_f64(delay.as_secs_f64() * options.backoff_multiplier)
                .unwrap_or(Duration::MAX);
            attempt += 1;
        }
    }
}

pub fn retry_module() -> Arc<dyn Module> {
    Arc::new(ConfiguredModule::new(
        NAME,
        PRIORITY,
        RetryOptions::default(),
        RetryProvider,
    ))
}
