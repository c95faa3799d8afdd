//! Per-type property and lifecycle-hook descriptors.
//!
//! A [`TypeDescriptor`] is produced once per configurable type from its
//! [`Configurable::describe`] implementation and is immutable afterwards.

use crate::logging::Logger;
use crate::reconcile::{
    ListProperty, MapProperty, ObjectCodec, ObjectProperty, PropertyApply, ValueCodec,
    ValueProperty,
};
use crate::types::{ConfigTree, ConfigType, Configurable, Shared};
use crate::validation::Validator;
use serde::de::DeserializeOwned;
use std::any::{Any, type_name};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;

/// Lifecycle hook signature. Hooks take no argument besides the object itself.
pub type Hook<T> = fn(&mut T) -> anyhow::Result<()>;

/// The four lifecycle moments a configurable type can react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    /// After the first configuration of a new instance.
    AfterInject,
    /// Before an existing instance is reconfigured.
    BeforeUpdate,
    /// After an existing instance is reconfigured.
    AfterUpdate,
    /// Before an instance leaves the configuration.
    BeforeRemove,
}

impl HookKind {
    pub const ALL: [HookKind; 4] = [
        HookKind::AfterInject,
        HookKind::BeforeUpdate,
        HookKind::AfterUpdate,
        HookKind::BeforeRemove,
    ];

    fn index(self) -> usize {
        match self {
            HookKind::AfterInject => 0,
            HookKind::BeforeUpdate => 1,
            HookKind::AfterUpdate => 2,
            HookKind::BeforeRemove => 3,
        }
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookKind::AfterInject => write!(f, "after_inject"),
            HookKind::BeforeUpdate => write!(f, "before_update"),
            HookKind::AfterUpdate => write!(f, "after_update"),
            HookKind::BeforeRemove => write!(f, "before_remove"),
        }
    }
}

/// Reasons a type can't produce a descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescribeError {
    #[error("property name can't be blank")]
    BlankPropertyName,
    #[error("property '{0}' is declared more than once")]
    DuplicateProperty(String),
    #[error("{kind} hook '{name}' is declared more than once")]
    DuplicateHook { kind: HookKind, name: &'static str },
}

/// Shape of a property, as seen by the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    /// Converted through the serde codec.
    Value,
    /// Nested configurable object, replaced wholesale.
    Object,
    /// Ordered list, reconciled by position.
    List,
    /// Keyed map, reconciled by key.
    Map,
}

struct ErasedHook {
    name: &'static str,
    call: Box<dyn Fn(&mut dyn Any) -> anyhow::Result<()> + Send + Sync>,
}

/// Metadata and apply strategy for one property.
pub struct PropertyDescriptor {
    name: String,
    kind: PropertyKind,
    declared_type: &'static str,
    element_type: Option<&'static str>,
    validators: Vec<Arc<dyn Validator>>,
    apply: Box<dyn PropertyApply>,
}

impl PropertyDescriptor {
    /// Add a validator, run against the raw incoming value before each write.
    pub fn validate(&mut self, validator: impl Validator + 'static) -> &mut Self {
        self.validators.push(Arc::new(validator));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> PropertyKind {
        self.kind
    }

    pub fn declared_type(&self) -> &'static str {
        self.declared_type
    }

    pub fn element_type(&self) -> Option<&'static str> {
        self.element_type
    }

    pub fn validators(&self) -> impl Iterator<Item = &dyn Validator> {
        self.validators.iter().map(|v| v.as_ref())
    }

    /// Name of the first validator rejecting `value`, if any.
    pub(crate) fn first_rejection(&self, value: &ConfigTree) -> Option<&str> {
        self.validators
            .iter()
            .find(|v| !v.validate(value))
            .map(|v| v.name())
    }

    pub(crate) fn applier(&self) -> &dyn PropertyApply {
        self.apply.as_ref()
    }
}

impl fmt::Debug for PropertyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("declared_type", &self.declared_type)
            .field("element_type", &self.element_type)
            .field("validators", &self.validators.iter().map(|v| v.name()).collect::<Vec<_>>())
            .finish()
    }
}

/// Cached description of a configurable type.
pub struct TypeDescriptor {
    ty: ConfigType,
    properties: HashMap<String, PropertyDescriptor>,
    hooks: [Vec<ErasedHook>; 4],
}

impl TypeDescriptor {
    pub(crate) fn build<T: Configurable>() -> Result<Self, DescribeError> {
        let mut describe = Describe::<T>::new();
        T::describe(&mut describe);
        describe.finish()
    }

    pub fn config_type(&self) -> ConfigType {
        self.ty
    }

    pub fn property(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.properties.get(name)
    }

    pub fn properties(&self) -> impl Iterator<Item = &PropertyDescriptor> {
        self.properties.values()
    }

    /// Hook names of one kind, in declaration order.
    pub fn hook_names(&self, kind: HookKind) -> Vec<&'static str> {
        self.hooks[kind.index()].iter().map(|h| h.name).collect()
    }

    /// Invoke every hook of `kind` in declaration order. Failures are logged
    /// and don't stop the remaining hooks.
    pub(crate) fn run_hooks(&self, kind: HookKind, target: &mut dyn Any, logger: &Logger) {
        for hook in &self.hooks[kind.index()] {
            if let Err(e) = (hook.call)(target) {
                logger.error(&format!(
                    "Hook {}::{} ({}) failed: {:#}",
                    self.ty.short_name(),
                    hook.name,
                    kind,
                    e
                ));
            }
        }
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.properties.keys().collect();
        names.sort();
        f.debug_struct("TypeDescriptor")
            .field("type", &self.ty.name())
            .field("properties", &names)
            .finish()
    }
}

/// Manual registration API handed to [`Configurable::describe`].
pub struct Describe<T> {
    properties: Vec<PropertyDescriptor>,
    hooks: [Vec<ErasedHook>; 4],
    _marker: PhantomData<fn(&mut T)>,
}

impl<T: Configurable> Describe<T> {
    fn new() -> Self {
        Self {
            properties: Vec::new(),
            hooks: Default::default(),
            _marker: PhantomData,
        }
    }

    fn push(
        &mut self,
        name: &str,
        kind: PropertyKind,
        declared_type: &'static str,
        element_type: Option<&'static str>,
        apply: Box<dyn PropertyApply>,
    ) -> &mut PropertyDescriptor {
        let index = self.properties.len();
        self.properties.push(PropertyDescriptor {
            name: name.to_string(),
            kind,
            declared_type,
            element_type,
            validators: Vec::new(),
            apply,
        });
        &mut self.properties[index]
    }

    /// Property converted directly through the serde codec.
    ///
    /// A null incoming value is decoded like any other, so nullable
    /// properties should be declared as `Option<V>`.
    pub fn value<V>(&mut self, name: &str, access: fn(&mut T) -> &mut V) -> &mut PropertyDescriptor
    where
        V: DeserializeOwned + 'static,
    {
        self.push(
            name,
            PropertyKind::Value,
            type_name::<V>(),
            None,
            Box::new(ValueProperty::new(access)),
        )
    }

    /// Nested configurable object, rebuilt from scratch on every change.
    pub fn object<S: Configurable>(
        &mut self,
        name: &str,
        access: fn(&mut T) -> &mut Option<Shared<S>>,
    ) -> &mut PropertyDescriptor {
        self.push(
            name,
            PropertyKind::Object,
            type_name::<S>(),
            None,
            Box::new(ObjectProperty::new(access)),
        )
    }

    /// Ordered list of plain values.
    pub fn list_of_values<V>(
        &mut self,
        name: &str,
        access: fn(&mut T) -> &mut Option<Vec<V>>,
    ) -> &mut PropertyDescriptor
    where
        V: DeserializeOwned + PartialEq + Send + Sync + 'static,
    {
        self.push(
            name,
            PropertyKind::List,
            type_name::<Vec<V>>(),
            Some(type_name::<V>()),
            Box::new(ListProperty::new(access, ValueCodec::new(<V as PartialEq>::eq))),
        )
    }

    /// Ordered list of configurable objects. Elements equal by value keep
    /// their identity across reconfiguration.
    pub fn list_of_objects<S: Configurable + PartialEq>(
        &mut self,
        name: &str,
        access: fn(&mut T) -> &mut Option<Vec<Shared<S>>>,
    ) -> &mut PropertyDescriptor {
        self.push(
            name,
            PropertyKind::List,
            type_name::<Vec<Shared<S>>>(),
            Some(type_name::<S>()),
            Box::new(ListProperty::new(access, ObjectCodec::new(<S as PartialEq>::eq))),
        )
    }

    /// Keyed map of plain values.
    pub fn map_of_values<V>(
        &mut self,
        name: &str,
        access: fn(&mut T) -> &mut Option<BTreeMap<String, V>>,
    ) -> &mut PropertyDescriptor
    where
        V: DeserializeOwned + Send + Sync + 'static,
    {
        self.push(
            name,
            PropertyKind::Map,
            type_name::<BTreeMap<String, V>>(),
            Some(type_name::<V>()),
            Box::new(MapProperty::new(access, ValueCodec::<V>::new(|_, _| false))),
        )
    }

    /// Keyed map of configurable objects, updated in place per key.
    pub fn map_of_objects<S: Configurable>(
        &mut self,
        name: &str,
        access: fn(&mut T) -> &mut Option<BTreeMap<String, Shared<S>>>,
    ) -> &mut PropertyDescriptor {
        self.push(
            name,
            PropertyKind::Map,
            type_name::<BTreeMap<String, Shared<S>>>(),
            Some(type_name::<S>()),
            Box::new(MapProperty::new(access, ObjectCodec::<S>::new(|_, _| false))),
        )
    }

    fn hook(&mut self, kind: HookKind, name: &'static str, hook: Hook<T>) -> &mut Self {
        self.hooks[kind.index()].push(ErasedHook {
            name,
            call: Box::new(move |target: &mut dyn Any| match target.downcast_mut::<T>() {
                Some(object) => hook(object),
                None => Err(anyhow::anyhow!("hook target is not a {}", type_name::<T>())),
            }),
        });
        self
    }

    pub fn after_inject(&mut self, name: &'static str, hook: Hook<T>) -> &mut Self {
        self.hook(HookKind::AfterInject, name, hook)
    }

    pub fn before_update(&mut self, name: &'static str, hook: Hook<T>) -> &mut Self {
        self.hook(HookKind::BeforeUpdate, name, hook)
    }

    pub fn after_update(&mut self, name: &'static str, hook: Hook<T>) -> &mut Self {
        self.hook(HookKind::AfterUpdate, name, hook)
    }

    pub fn before_remove(&mut self, name: &'static str, hook: Hook<T>) -> &mut Self {
        self.hook(HookKind::BeforeRemove, name, hook)
    }

    fn finish(self) -> Result<TypeDescriptor, DescribeError> {
        let mut properties = HashMap::with_capacity(self.properties.len());
        for property in self.properties {
            if property.name.trim().is_empty() {
                return Err(DescribeError::BlankPropertyName);
            }
            if properties.contains_key(&property.name) {
                return Err(DescribeError::DuplicateProperty(property.name));
            }
            properties.insert(property.name.clone(), property);
        }

        for kind in HookKind::ALL {
            let mut seen = HashSet::new();
            for hook in &self.hooks[kind.index()] {
                if !seen.insert(hook.name) {
                    return Err(DescribeError::DuplicateHook {
                        kind,
                        name: hook.name,
                    });
                }
            }
        }

        Ok(TypeDescriptor {
            ty: ConfigType::of::<T>(),
            properties,
            hooks: self.hooks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::NotNull;

    #[derive(Default)]
    struct Lamp {
        watts: u32,
        label: Option<String>,
        colors: Option<Vec<String>>,
    }

    impl Lamp {
        fn on(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    impl Configurable for Lamp {
        fn describe(d: &mut Describe<Self>) {
            d.value("watts", |l| &mut l.watts).validate(NotNull);
            d.value("label", |l| &mut l.label);
            d.list_of_values("colors", |l| &mut l.colors);
            d.after_inject("on", Lamp::on).after_update("on", Lamp::on);
        }
    }

    struct Twice {
        x: u8,
    }

    impl Configurable for Twice {
        fn describe(d: &mut Describe<Self>) {
            d.value("x", |t| &mut t.x);
            d.value("x", |t| &mut t.x);
        }
    }

    struct TwiceHook;

    impl TwiceHook {
        fn noop(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    impl Configurable for TwiceHook {
        fn describe(d: &mut Describe<Self>) {
            d.before_remove("noop", TwiceHook::noop);
            d.before_remove("noop", TwiceHook::noop);
        }
    }

    #[test]
    fn test_build_collects_properties_and_hooks() {
        let descriptor = TypeDescriptor::build::<Lamp>().unwrap();
        let watts = descriptor.property("watts").unwrap();
        assert_eq!(watts.kind(), PropertyKind::Value);
        assert_eq!(watts.validators().count(), 1);

        let colors = descriptor.property("colors").unwrap();
        assert_eq!(colors.kind(), PropertyKind::List);
        assert!(colors.element_type().unwrap().contains("String"));

        assert_eq!(descriptor.hook_names(HookKind::AfterInject), vec!["on"]);
        assert_eq!(descriptor.hook_names(HookKind::AfterUpdate), vec!["on"]);
        assert!(descriptor.hook_names(HookKind::BeforeRemove).is_empty());
        assert!(descriptor.property("nope").is_none());
    }

    #[test]
    fn test_duplicate_property_fails_whole_type() {
        let err = TypeDescriptor::build::<Twice>().unwrap_err();
        assert_eq!(err, DescribeError::DuplicateProperty("x".into()));
    }

    #[test]
    fn test_duplicate_hook_fails_whole_type() {
        let err = TypeDescriptor::build::<TwiceHook>().unwrap_err();
        assert!(matches!(err, DescribeError::DuplicateHook { kind: HookKind::BeforeRemove, .. }));
    }
}
