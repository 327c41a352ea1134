//! Records one [`AuditRecord`] per dispatch through the wrapped handler.
//!
//! Records go to the [`AuditSink`] registered in the service provider as
//! `Arc<dyn AuditSink>`, or to [`TracingAuditSink`] when there is none.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::{ConfiguredModule, Module, ModuleOptions, ModuleProvider, ModuleSettings};
use crate::config::duration_ms;
use crate::context::{ExecutionContext, PipelineContext};
use crate::error::BusResult;
use crate::handler::{AnyResponse, Next};
use crate::key::ModuleIdentifier;
use crate::services::ServiceProviderExt;

pub const NAME: &str = "Audit";
pub const PRIORITY: i32 = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct AuditOptions {
    pub enabled: bool,
    pub include_request_type: bool,
    pub label: Option<String>,
}

impl Default for AuditOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            include_request_type: true,
            label: None,
        }
    }
}

impl ModuleOptions for AuditOptions {
    fn overlay(&mut self, module: &str, settings: &ModuleSettings) -> BusResult<()> {
        if let Some(enabled) = settings.read(module, "enabled")? {
            self.enabled = enabled;
        }
        if let Some(include) = settings.read(module, "include_request_type")? {
            self.include_request_type = include;
        }
        if let Some(label) = settings.read::<String>(module, "label")? {
            self.label = Some(label);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuditOutcome {
    Succeeded,
    #[strum(to_string = "Failed: {message}")]
    Failed { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    /// `Request -> Response` of the audited handler.
    pub handle: String,
    pub request_type: Option<String>,
    pub label: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
    pub outcome: AuditOutcome,
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord);
}

/// Writes records to the `tracing` log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, record: AuditRecord) {
        match &record.outcome {
            AuditOutcome::Succeeded => info!(
                "audit {} {} {:?} in {:?}",
                record.id, record.handle, record.label, record.elapsed
            ),
            AuditOutcome::Failed { message } => warn!(
                "audit {} {} {:?} failed in {:?}: {}",
                record.id, record.handle, record.label, record.elapsed, message
            ),
        }
    }
}

pub struct AuditProvider;

#[async_trait]
impl ModuleProvider<AuditOptions> for AuditProvider {
    async fn execute(
        &self,
        id: &ModuleIdentifier,
        options: &AuditOptions,
        ctx: &mut PipelineContext,
        next: Next<'_>,
    ) -> BusResult<AnyResponse> {
        if !options.enabled {
            return next.run(ctx).await;
        }

        let sink: Arc<dyn AuditSink> = match ctx.services().resolve::<Arc<dyn AuditSink>>() {
            Some(sink) => Arc::clone(&*sink),
            None => Arc::new(TracingAuditSink),
        };
        let started_at = Utc::now();
        let started = Instant::now();

        let result = next.run(ctx).await;

        let outcome = match &result {
            Ok(_) => AuditOutcome::Succeeded,
            Err(e) => AuditOutcome::Failed {
                message: e.to_string(),
            },
        };
        let record = AuditRecord {
            id: Uuid::new_v4(),
            handle: format!("{} -> {}", id.request, id.response),
            request_type: options
                .include_request_type
                .then(|| id.request.name().to_string()),
            label: options.label.clone(),
            started_at,
            elapsed: started.elapsed(),
            outcome,
        };
        sink.record(record).await;
        result
    }
}

pub fn audit_module() -> Arc<dyn Module> {
    Arc::new(ConfiguredModule::new(
        NAME,
        PRIORITY,
        AuditOptions::default(),
        AuditProvider,
    ))
}
