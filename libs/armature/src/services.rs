//! Service registry: name- and interface-keyed lookup of module-published
//! objects.
//!
//! Design notes:
//! - A [`ServiceHandle`] carries the concrete instance plus any number of
//!   *exposed views*: trait objects the provider explicitly casts at
//!   registration time. "Assignable to interface `I`" means the handle
//!   exposes a view under `TypeKey::of::<I>()`.
//! - Entries are immutable records: original name, resolved name, providing
//!   module, type descriptor and registration time never change after
//!   `register` returns. The instance behind the handle may be stateful.
//! - Reads (lookup, interface scan, module scan) take the read lock;
//!   registration takes the write lock.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use thiserror::Error;

/// Stable type key, the fully-qualified `type_name::<T>()`; valid for
/// `T = dyn Trait`.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct TypeKey(&'static str);

impl TypeKey {
    #[inline]
    pub fn of<T: ?Sized + 'static>() -> Self {
        TypeKey(std::any::type_name::<T>())
    }

    pub fn as_str(&self) -> &'static str {
        self.0
    }

    /// Last path segment, used when deriving conflict-resolution suffixes.
    pub fn short(&self) -> &'static str {
        short_type_name(self.0)
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

pub(crate) fn short_type_name(full: &'static str) -> &'static str {
    // `a::b::Type<c::d::Param>` -> `Type<c::d::Param>` is not useful; cut at
    // the first generic bracket before taking the last segment.
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

type Boxed = Box<dyn Any + Send + Sync>;

/// A registered instance together with its exposed interface views.
pub struct ServiceHandle {
    concrete: TypeKey,
    views: HashMap<TypeKey, Arc<Boxed>>,
}

impl ServiceHandle {
    /// Wrap an instance. The registered type itself (which may already be a
    /// trait object) is always retrievable via [`view`](Self::view).
    pub fn new<T: ?Sized + Send + Sync + 'static>(value: Arc<T>) -> Self {
        let key = TypeKey::of::<T>();
        let mut views: HashMap<TypeKey, Arc<Boxed>> = HashMap::new();
        views.insert(key, Arc::new(Box::new(value) as Boxed));
        Self {
            concrete: key,
            views,
        }
    }

    /// Additionally expose the instance under the interface type `I`
    /// (typically `dyn SomeTrait`). The caller performs the cast, which keeps
    /// the registry free of unsizing magic.
    #[must_use]
    pub fn expose<I: ?Sized + Send + Sync + 'static>(mut self, view: Arc<I>) -> Self {
        self.views
            .insert(TypeKey::of::<I>(), Arc::new(Box::new(view) as Boxed));
        self
    }

    /// True when the handle exposes the given interface key.
    pub fn implements(&self, key: TypeKey) -> bool {
        self.views.contains_key(&key)
    }

    /// Fetch a view as `Arc<T>`; `T` may be the concrete type or any exposed
    /// interface.
    pub fn view<T: ?Sized + Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        let boxed = self.views.get(&TypeKey::of::<T>())?;
        boxed.downcast_ref::<Arc<T>>().cloned()
    }

    pub fn concrete_type(&self) -> TypeKey {
        self.concrete
    }

    pub(crate) fn interface_keys(&self) -> Vec<TypeKey> {
        self.views.keys().copied().collect()
    }
}

impl Clone for ServiceHandle {
    fn clone(&self) -> Self {
        Self {
            concrete: self.concrete,
            views: self.views.clone(),
        }
    }
}

impl fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("concrete", &self.concrete)
            .field("views", &self.views.len())
            .finish()
    }
}

/// Identity of the module that registered a service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvidingModule {
    pub name: String,
    /// Short type name of the module's concrete Rust type.
    pub type_name: &'static str,
}

/// Immutable record of one registration.
#[derive(Clone)]
pub struct ServiceEntry {
    original_name: String,
    name: String,
    module: Option<ProvidingModule>,
    handle: ServiceHandle,
    registered_at: DateTime<Utc>,
}

impl ServiceEntry {
    /// Name as declared by the registrant.
    pub fn original_name(&self) -> &str {
        &self.original_name
    }

    /// Name after conflict resolution; unique within the registry.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module(&self) -> Option<&ProvidingModule> {
        self.module.as_ref()
    }

    pub fn handle(&self) -> &ServiceHandle {
        &self.handle
    }

    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }
}

impl fmt::Debug for ServiceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceEntry")
            .field("name", &self.name)
            .field("original_name", &self.original_name)
            .field("module", &self.module.as_ref().map(|m| m.name.as_str()))
            .field("type", &self.handle.concrete)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service '{0}' not found")]
    NotFound(String),

    #[error("service '{name}' does not expose {requested:?}")]
    TypeMismatch { name: String, requested: TypeKey },
}

/// Name- and interface-keyed service registry with deterministic conflict
/// resolution.
#[derive(Default)]
pub struct ServiceRegistry {
    inner: RwLock<Vec<ServiceEntry>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service without module attribution. Returns the resolved
    /// name (equal to `name` unless it collided).
    pub fn register(&self, name: impl Into<String>, handle: ServiceHandle) -> String {
        self.register_inner(name.into(), handle, None)
    }

    /// Register a service on behalf of a module.
    pub fn register_for_module(
        &self,
        name: impl Into<String>,
        handle: ServiceHandle,
        module: ProvidingModule,
    ) -> String {
        self.register_inner(name.into(), handle, Some(module))
    }

    fn register_inner(
        &self,
        name: String,
        handle: ServiceHandle,
        module: Option<ProvidingModule>,
    ) -> String {
        let mut entries = self.inner.write();
        let resolved = resolve_name(&entries, &name, module.as_ref());
        tracing::debug!(
            service = %resolved,
            original = %name,
            module = module.as_ref().map(|m| m.name.as_str()).unwrap_or("-"),
            "service registered"
        );
        entries.push(ServiceEntry {
            original_name: name,
            name: resolved.clone(),
            module,
            handle,
            registered_at: Utc::now(),
        });
        resolved
    }

    /// Remove a service by resolved name; returns whether it was present.
    pub fn unregister(&self, name: &str) -> bool {
        let mut entries = self.inner.write();
        let before = entries.len();
        entries.retain(|e| e.name != name);
        entries.len() != before
    }

    /// Typed lookup by resolved name; `T` may be a concrete type or an
    /// exposed interface.
    pub fn get<T: ?Sized + Send + Sync + 'static>(&self, name: &str) -> Result<Arc<T>, ServiceError> {
        let entries = self.inner.read();
        let entry = entries
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| ServiceError::NotFound(name.to_owned()))?;
        entry.handle.view::<T>().ok_or_else(|| ServiceError::TypeMismatch {
            name: name.to_owned(),
            requested: TypeKey::of::<T>(),
        })
    }

    /// Full record by resolved name.
    pub fn entry(&self, name: &str) -> Result<ServiceEntry, ServiceError> {
        let entries = self.inner.read();
        entries
            .iter()
            .find(|e| e.name == name)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(name.to_owned()))
    }

    /// First entry whose original or resolved name matches, insertion order.
    pub(crate) fn entry_by_any_name(&self, name: &str) -> Option<ServiceEntry> {
        let entries = self.inner.read();
        entries
            .iter()
            .find(|e| e.name == name || e.original_name == name)
            .cloned()
    }

    /// All entries exposing the interface `I`, in insertion order.
    pub fn by_interface<I: ?Sized + 'static>(&self) -> Vec<ServiceEntry> {
        self.by_interface_key(TypeKey::of::<I>())
    }

    pub fn by_interface_key(&self, key: TypeKey) -> Vec<ServiceEntry> {
        let entries = self.inner.read();
        entries
            .iter()
            .filter(|e| e.handle.implements(key))
            .cloned()
            .collect()
    }

    /// All entries attributed to the given module, in insertion order.
    pub fn by_module(&self, module_name: &str) -> Vec<ServiceEntry> {
        let entries = self.inner.read();
        entries
            .iter()
            .filter(|e| e.module.as_ref().is_some_and(|m| m.name == module_name))
            .cloned()
            .collect()
    }

    pub fn entries(&self) -> Vec<ServiceEntry> {
        self.inner.read().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

/// First registration keeps the name. Later ones get
/// `<name>.<ModuleTypeShortName>` when module-attributed (falling through to
/// the counter when that also collides), else `<name>.N` for the smallest
/// free N >= 2.
fn resolve_name(
    entries: &[ServiceEntry],
    name: &str,
    module: Option<&ProvidingModule>,
) -> String {
    let taken = |candidate: &str| entries.iter().any(|e| e.name == candidate);

    if !taken(name) {
        return name.to_owned();
    }

    if let Some(module) = module {
        let candidate = format!("{name}.{}", module.type_name);
        if !taken(&candidate) {
            return candidate;
        }
    }

    let mut n = 2u64;
    loop {
        let candidate = format!("{name}.{n}");
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}
