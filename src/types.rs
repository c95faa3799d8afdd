//! Core value and handle types shared by every engine component.

use crate::descriptor::{Describe, DescribeError, TypeDescriptor};
use std::any::{Any, TypeId, type_name};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Recursive JSON-like configuration value.
pub type ConfigTree = serde_json::Value;

/// Shared, lockable handle to a live configured object.
pub type Shared<T> = Arc<RwLock<T>>;

/// Wrap a value into a [`Shared`] handle.
pub fn shared<T>(value: T) -> Shared<T> {
    Arc::new(RwLock::new(value))
}

/// Read-lock a shared handle, recovering the guard if a writer panicked.
pub fn read<T>(handle: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    handle.read().unwrap_or_else(PoisonError::into_inner)
}

/// Write-lock a shared handle, recovering the guard if a writer panicked.
pub fn write<T>(handle: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    handle.write().unwrap_or_else(PoisonError::into_inner)
}

/// A type whose instances can be driven by configuration trees.
///
/// Implementors declare their properties and lifecycle hooks once; the
/// resulting descriptor is cached by the registry for the process lifetime.
///
/// ```ignore
/// impl Configurable for Car {
///     fn describe(d: &mut Describe<Self>) {
///         d.value("color", |c| &mut c.color).validate(NotNull);
///         d.list_of_objects("wheels", |c| &mut c.wheels);
///         d.after_inject("start", Car::start);
///     }
/// }
/// ```
pub trait Configurable: Send + Sync + 'static {
    fn describe(d: &mut Describe<Self>)
    where
        Self: Sized;
}

type DescribeFn = fn() -> Result<TypeDescriptor, DescribeError>;

/// Identity token for a type known to the engine.
///
/// Tokens built with [`ConfigType::of`] can acquire a descriptor; tokens built
/// with [`ConfigType::opaque`] (strings, numbers, enums, plain data) never can.
#[derive(Clone, Copy)]
pub struct ConfigType {
    id: TypeId,
    name: &'static str,
    describe: Option<DescribeFn>,
}

impl ConfigType {
    /// Token for a configurable type.
    pub fn of<T: Configurable>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
            describe: Some(TypeDescriptor::build::<T>),
        }
    }

    /// Token for a type that can't carry a descriptor.
    pub fn opaque<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
            describe: None,
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    /// Full type name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Last path segment of the type name.
    pub fn short_name(&self) -> &'static str {
        let base = self.name.split('<').next().unwrap_or(self.name);
        base.rsplit("::").next().unwrap_or(base)
    }

    pub fn is_configurable(&self) -> bool {
        self.describe.is_some()
    }

    pub(crate) fn describe_fn(&self) -> Option<DescribeFn> {
        self.describe
    }
}

impl PartialEq for ConfigType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConfigType {}

impl Hash for ConfigType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for ConfigType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConfigType({})", self.name)
    }
}

impl fmt::Display for ConfigType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Object-safe view of a `RwLock<T>` used behind [`Instance`].
trait Slot: Send + Sync {
    fn with_mut(&self, f: &mut dyn FnMut(&mut dyn Any));
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
    fn addr(&self) -> *const ();
}

impl<T: Send + Sync + 'static> Slot for RwLock<T> {
    fn with_mut(&self, f: &mut dyn FnMut(&mut dyn Any)) {
        let mut guard = write(self);
        f(&mut *guard);
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn addr(&self) -> *const () {
        self as *const Self as *const ()
    }
}

/// Type-erased handle to a live object, carrying its type token.
///
/// Clones share the same object; identity is pointer identity.
#[derive(Clone)]
pub struct Instance {
    ty: ConfigType,
    slot: Arc<dyn Slot>,
}

impl Instance {
    /// Wrap a fresh value.
    pub fn new<T: Configurable>(value: T) -> Self {
        Self::from_shared(shared(value))
    }

    /// Wrap an existing shared handle without copying it.
    pub fn from_shared<T: Configurable>(handle: Shared<T>) -> Self {
        Self {
            ty: ConfigType::of::<T>(),
            slot: handle,
        }
    }

    /// Wrap a value of a type that has no descriptor.
    pub fn opaque<T: Send + Sync + 'static>(value: T) -> Self {
        Self {
            ty: ConfigType::opaque::<T>(),
            slot: shared(value),
        }
    }

    pub fn config_type(&self) -> ConfigType {
        self.ty
    }

    /// Typed handle to the underlying object, if it is a `T`.
    pub fn downcast<T: Send + Sync + 'static>(&self) -> Option<Shared<T>> {
        Arc::clone(&self.slot).into_any().downcast::<RwLock<T>>().ok()
    }

    /// Run `f` with exclusive access to the object.
    pub fn with_mut(&self, f: &mut dyn FnMut(&mut dyn Any)) {
        self.slot.with_mut(f);
    }

    pub fn ptr_eq(&self, other: &Instance) -> bool {
        self.slot.addr() == other.slot.addr()
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Instance({} @ {:p})", self.ty.name, self.slot.addr())
    }
}
