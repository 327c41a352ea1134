//! # Identity Keys
//!
//! Value types used as lookup and cache keys across the bus:
//!
//! - [`TypeKey`]: runtime identity of a request, response or notification type
//! - [`RequestResponseKey`]: a request/response type pair (type-default lookups)
//! - [`HandleKey`]: a type pair plus a handler name (primary registration key)
//! - [`ModuleIdentifier`]: a type pair plus module kind and profile name

use std::any::{type_name, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Profile used when a module is attached without naming one.
pub const DEFAULT_PROFILE: &str = "Default";

/// Runtime identity of a Rust type.
///
/// Equality and hashing only consider the `TypeId`; the type name is carried
/// for diagnostics and log output.
#[derive(Clone, Copy)]
pub struct TypeKey {
    id: TypeId,
    name: &'static str,
}

impl TypeKey {
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    /// Fully qualified type name, e.g. `my_app::orders::PlaceOrder`.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Last path segment of the type name, e.g. `PlaceOrder`.
    pub fn short_name(&self) -> &'static str {
        let base = self.name.split('<').next().unwrap_or(self.name);
        base.rsplit("::").next().unwrap_or(base)
    }
}

impl PartialEq for TypeKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeKey {}

impl Hash for TypeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeKey({})", self.name)
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

/// A request/response type pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestResponseKey {
    pub request: TypeKey,
    pub response: TypeKey,
}

impl RequestResponseKey {
    pub fn new(request: TypeKey, response: TypeKey) -> Self {
        Self { request, response }
    }

    pub fn of<Req: 'static, Res: 'static>() -> Self {
        Self::new(TypeKey::of::<Req>(), TypeKey::of::<Res>())
    }
}

impl fmt::Display for RequestResponseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.request, self.response)
    }
}

/// Primary registration key. An empty `name` means "unnamed".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandleKey {
    pub request: TypeKey,
    pub response: TypeKey,
    pub name: String,
}

impl HandleKey {
    pub fn new(request: TypeKey, response: TypeKey, name: &str) -> Self {
        Self {
            request,
            response,
            name: name.to_string(),
        }
    }

    pub fn of<Req: 'static, Res: 'static>(name: &str) -> Self {
        Self::new(TypeKey::of::<Req>(), TypeKey::of::<Res>(), name)
    }

    pub fn is_named(&self) -> bool {
        !self.name.is_empty()
    }

    pub fn type_pair(&self) -> RequestResponseKey {
        RequestResponseKey::new(self.request, self.response)
    }
}

impl fmt::Display for HandleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_named() {
            write!(f, "{} -> {} ({})", self.request, self.response, self.name)
        } else {
            write!(f, "{} -> {}", self.request, self.response)
        }
    }
}

/// Key of the module configuration and wrapper caches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleIdentifier {
    pub request: TypeKey,
    pub response: TypeKey,
    pub module: String,
    pub profile: String,
}

impl ModuleIdentifier {
    /// A missing or blank profile is normalised to [`DEFAULT_PROFILE`].
    pub fn new(request: TypeKey, response: TypeKey, module: &str, profile: Option<&str>) -> Self {
        let profile = match profile.map(str::trim) {
            Some(profile) if !profile.is_empty() => profile.to_string(),
            _ => DEFAULT_PROFILE.to_string(),
        };
        Self {
            request,
            response,
            module: module.to_string(),
            profile,
        }
    }

    pub fn for_handle(key: &HandleKey, module: &str, profile: Option<&str>) -> Self {
        Self::new(key.request, key.response, module, profile)
    }

    pub fn is_default_profile(&self) -> bool {
        self.profile == DEFAULT_PROFILE
    }
}

impl fmt::Display for ModuleIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}] {} -> {}",
            self.module, self.profile, self.request, self.response
        )
    }
}
