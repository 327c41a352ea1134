//! # dispatch-bus: In-Process Request and Notification Dispatch
//!
//! A mediator that routes typed requests to exactly one handler and broadcasts
//! notifications to every subscriber of their type, all within one process.
//!
//! ## Requests
//!
//! A handler is registered under its request type, response type and an
//! optional name ([`key::HandleKey`]). Dispatch resolves the handler
//! ([`handler::registry`]), runs it through its ordered pipeline steps
//! ([`handler::pipeline`]) and returns the typed response. Handlers without
//! steps take a fast path that skips the chain entirely.
//!
//! ## Notifications
//!
//! Subscribers are registered per notification type ([`notification`]) and
//! run either sequentially or concurrently ([`notification::PublishStrategy`]).
//!
//! ## Modules
//!
//! Cross-cutting behaviours such as retry, timeout and audit are packaged as
//! modules ([`module`]) and attached to individual handlers. Their options
//! are resolved from built-in defaults, named profiles in [`config::BusConfig`]
//! and per-handler overrides.
//!
//! ## Execution Contexts
//!
//! Each dispatch runs against a pooled context ([`context`]) carrying the
//! request, the service provider ([`services`]), the bus and a cancellation
//! token.
//!
//! ```text
//! register_* → complete_registration → send / publish
//! ```

pub mod bus;
pub mod config;
pub mod context;
pub mod error;
pub mod handler;
pub mod key;
pub mod module;
pub mod notification;
pub mod services;

// Re-exports
pub use bus::{Bus, BusBuilder, BusPoolStats, DynamicRequest, SendOptions};
pub use config::BusConfig;
pub use context::{ExecutionContext, HandlerContext, NotificationContext, PipelineContext};
pub use error::*;
pub use handler::{
    handler_fn, AnyResponse, Next, PipelineBehavior, Request, RequestHandler,
};
pub use key::{HandleKey, ModuleIdentifier, RequestResponseKey, TypeKey, DEFAULT_PROFILE};
pub use module::{Module, ModuleOptions, ModuleProvider, ModuleSettings, ModuleSettingsSource};
pub use notification::{notification_fn, NotificationHandler, PublishStrategy};
pub use services::{ServiceCollection, ServiceProvider, ServiceProviderExt};
