use std::time::Duration;

use thiserror::Error;

/// Boxed business error raised by a handler, pipeline step or subscriber.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Handler error: {0}")]
    Handler(#[source] BoxError),

    #[error("Dispatch cancelled")]
    Cancelled,

    #[error("Dispatch timed out after {}ms", .elapsed.as_millis())]
    Timeout { elapsed: Duration },

    #[error("{} subscribers failed, first: {}", .0.len(), first_message(.0))]
    Multiple(Vec<BusError>),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Registration and resolution faults.
///
/// These describe a misconfigured bus rather than a failed request; the core
/// never retries them.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("No handler registered for {key}")]
    HandlerNotFound { key: String },

    #[error("Ambiguous handler for {request}: {candidates} candidates")]
    AmbiguousHandler { request: String, candidates: usize },

    #[error("{registry} registry is sealed, cannot register {what}")]
    RegistrySealed {
        registry: &'static str,
        what: String,
    },

    #[error("{registry} registry is not sealed, call complete_registration before dispatching")]
    RegistryNotSealed { registry: &'static str },

    #[error("Request type mismatch: expected {expected}")]
    RequestTypeMismatch { expected: String },

    #[error("Response type mismatch for {handle}: expected {expected}")]
    ResponseTypeMismatch { handle: String, expected: String },

    #[error("Service not registered: {0}")]
    ServiceNotFound(String),

    #[error("Module not registered: {0}")]
    ModuleNotFound(String),

    #[error("Module already registered: {0}")]
    DuplicateModule(String),

    #[error("Provider already registered for module: {0}")]
    DuplicateProvider(String),

    #[error("Provider for module {0} must be registered before the module is attached")]
    ProviderAfterAttach(String),

    #[error("Conflicting overrides for {0}: handlers of one type pair share module settings")]
    ConflictingOverride(String),

    #[error("Provider for module {module} has an unexpected type")]
    ProviderTypeMismatch { module: String },

    #[error("Invalid module setting {module}.{key}: {message}")]
    InvalidSetting {
        module: String,
        key: String,
        message: String,
    },

    #[error("Failed to load configuration: {0}")]
    Load(String),
}

pub type BusResult<T> = Result<T, BusError>;

fn first_message(errors: &[BusError]) -> String {
    errors.first().map(ToString::to_string).unwrap_or_default()
}

impl BusError {
    /// Wraps a business error so it propagates through the bus unchanged.
    pub fn handler<E>(error: E) -> Self
    where
        E: Into<BoxError>,
    {
        BusError::Handler(error.into())
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        BusError::Internal(message.into())
    }

    /// Configuration faults are fatal: they describe the bus, not the request.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BusError::Configuration(_))
    }

    /// Whether a retrying pipeline step may run the chain again.
    pub fn is_retryable(&self) -> bool {
        match self {
            BusError::Handler(_) | BusError::Timeout { .. } => true,
            BusError::Multiple(errors) => errors.iter().all(BusError::is_retryable),
            BusError::Configuration(_) | BusError::Cancelled | BusError::Internal(_) => false,
        }
    }

    /// Returns the wrapped business error of the given type, if any.
    pub fn downcast_handler_ref<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        match self {
            BusError::Handler(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }

    pub(crate) fn sealed(registry: &'static str, what: impl Into<String>) -> Self {
        ConfigurationError::RegistrySealed {
            registry,
            what: what.into(),
        }
        .into()
    }

    pub(crate) fn not_sealed(registry: &'static str) -> Self {
        ConfigurationError::RegistryNotSealed { registry }.into()
    }
}
