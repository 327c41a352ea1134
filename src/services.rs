//! # Service Resolution
//!
//! The bus never assumes a particular dependency-injection container. Every
//! execution context carries an `Arc<dyn ServiceProvider>`, and handlers,
//! pipeline steps and modules resolve what they need through it.
//!
//! [`ServiceCollection`] is a small concurrent implementation suitable for
//! applications that don't bring their own container.

use std::any::Any;
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{BusResult, ConfigurationError};
use crate::key::TypeKey;

pub type SharedService = Arc<dyn Any + Send + Sync>;

/// `resolve(type) -> instance` capability, optionally keyed by name.
pub trait ServiceProvider: Send + Sync {
    fn resolve_any(&self, key: TypeKey) -> Option<SharedService>;

    fn resolve_keyed_any(&self, _key: TypeKey, _name: &str) -> Option<SharedService> {
        None
    }
}

/// Typed helpers over any [`ServiceProvider`].
pub trait ServiceProviderExt {
    fn resolve<T: Any + Send + Sync>(&self) -> Option<Arc<T>>;

    fn resolve_keyed<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>>;

    /// Like [`resolve`](Self::resolve) but reports a missing service as an error.
    fn require<T: Any + Send + Sync>(&self) -> BusResult<Arc<T>> {
        self.resolve::<T>()
            .ok_or_else(|| ConfigurationError::ServiceNotFound(TypeKey::of::<T>().to_string()).into())
    }
}

impl<P: ServiceProvider + ?Sized> ServiceProviderExt for P {
    fn resolve<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.resolve_any(TypeKey::of::<T>())
            .and_then(|service| service.downcast::<T>().ok())
    }

    fn resolve_keyed<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.resolve_keyed_any(TypeKey::of::<T>(), name)
            .and_then(|service| service.downcast::<T>().ok())
    }
}

/// Provider that resolves nothing. Used by contexts that sit in a pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoServices;

impl ServiceProvider for NoServices {
    fn resolve_any(&self, _key: TypeKey) -> Option<SharedService> {
        None
    }
}

/// Concurrent singleton registry keyed by type (and optionally by name).
///
/// Cloning shares the underlying maps.
#[derive(Default, Clone)]
pub struct ServiceCollection {
    services: Arc<DashMap<TypeKey, SharedService>>,
    keyed: Arc<DashMap<(TypeKey, String), SharedService>>,
}

impl ServiceCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a singleton, replacing any previous instance of the same type.
    pub fn add<T: Any + Send + Sync>(&self, service: T) -> &Self {
        self.add_shared(Arc::new(service))
    }

    pub fn add_shared<T: Any + Send + Sync>(&self, service: Arc<T>) -> &Self {
        self.services.insert(TypeKey::of::<T>(), service);
        self
    }

    pub fn add_keyed<T: Any + Send + Sync>(&self, name: &str, service: T) -> &Self {
        self.keyed
            .insert((TypeKey::of::<T>(), name.to_string()), Arc::new(service));
        self
    }

    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.services.contains_key(&TypeKey::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.services.len() + self.keyed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ServiceProvider for ServiceCollection {
    fn resolve_any(&self, key: TypeKey) -> Option<SharedService> {
        self.services.get(&key).map(|entry| entry.value().clone())
    }

    fn resolve_keyed_any(&self, key: TypeKey, name: &str) -> Option<SharedService> {
        self.keyed
            .get(&(key, name.to_string()))
            .map(|entry| entry.value().clone())
    }
}
