//! Property-level reconciliation of an incoming tree against a live object.
//!
//! Each property kind has its own strategy:
//!
//! - plain values go through the serde codec and are overwritten,
//! - nested objects are rebuilt from scratch and swapped in,
//! - ordered lists are reconciled by position so unchanged elements keep
//!   their identity,
//! - keyed maps are reconciled by key, updating existing objects in place.
//!
//! Strategies are generic over the owning type and reached through the
//! object-safe [`PropertyApply`] trait stored in each property descriptor.

use crate::error::{ConfigError, ConfigResult};
use crate::registry::TypeRegistry;
use crate::types::{ConfigTree, ConfigType, Configurable, Instance, Shared, read};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::{Any, type_name};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

/// Applies one incoming value to one field of a type-erased target.
pub(crate) trait PropertyApply: Send + Sync {
    fn apply(
        &self,
        target: &mut dyn Any,
        property: &str,
        value: &ConfigTree,
        registry: &TypeRegistry,
    ) -> ConfigResult<()>;
}

fn target_as<T: 'static>(target: &mut dyn Any) -> ConfigResult<&mut T> {
    target
        .downcast_mut::<T>()
        .ok_or_else(|| ConfigError::type_mismatch(type_name::<T>(), "a different type"))
}

pub(crate) fn kind_of(value: &ConfigTree) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Build and configure a fresh sub-object from `tree`.
fn build_object<S: Configurable>(
    property: &str,
    tree: &ConfigTree,
    registry: &TypeRegistry,
) -> ConfigResult<Shared<S>> {
    if !tree.is_object() {
        return Err(ConfigError::conversion(
            property,
            format!(
                "expected an object tree for {}, found {}",
                type_name::<S>(),
                kind_of(tree)
            ),
        ));
    }
    let fresh = registry.instantiate::<S>()?;
    registry.configure(
        &ConfigType::of::<S>(),
        &Instance::from_shared(Arc::clone(&fresh)),
        tree,
    )?;
    Ok(fresh)
}

fn release_object<S: Configurable>(object: &Shared<S>, registry: &TypeRegistry) {
    registry.remove(
        &ConfigType::of::<S>(),
        &Instance::from_shared(Arc::clone(object)),
    );
}

// ---------------------------------------------------------------------------
// Plain values
// ---------------------------------------------------------------------------

pub(crate) struct ValueProperty<T, V> {
    access: fn(&mut T) -> &mut V,
}

impl<T, V> ValueProperty<T, V> {
    pub(crate) fn new(access: fn(&mut T) -> &mut V) -> Self {
        Self { access }
    }
}

impl<T: 'static, V: DeserializeOwned + 'static> PropertyApply for ValueProperty<T, V> {
    fn apply(
        &self,
        target: &mut dyn Any,
        property: &str,
        value: &ConfigTree,
        _registry: &TypeRegistry,
    ) -> ConfigResult<()> {
        let converted: V = serde_json::from_value(value.clone())
            .map_err(|e| ConfigError::conversion(property, e))?;
        *(self.access)(target_as::<T>(target)?) = converted;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Nested objects
// ---------------------------------------------------------------------------

pub(crate) struct ObjectProperty<T, S> {
    access: fn(&mut T) -> &mut Option<Shared<S>>,
}

impl<T, S> ObjectProperty<T, S> {
    pub(crate) fn new(access: fn(&mut T) -> &mut Option<Shared<S>>) -> Self {
        Self { access }
    }
}

impl<T: 'static, S: Configurable> PropertyApply for ObjectProperty<T, S> {
    fn apply(
        &self,
        target: &mut dyn Any,
        property: &str,
        value: &ConfigTree,
        registry: &TypeRegistry,
    ) -> ConfigResult<()> {
        let field = (self.access)(target_as::<T>(target)?);
        if value.is_null() {
            if let Some(prior) = field.take() {
                release_object(&prior, registry);
            }
            return Ok(());
        }

        // The replacement is fully configured before the prior object is let go.
        let fresh = build_object::<S>(property, value, registry)?;
        if let Some(prior) = field.take() {
            release_object(&prior, registry);
        }
        *field = Some(fresh);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Container elements
// ---------------------------------------------------------------------------

/// How list and map strategies treat a single element.
pub(crate) trait ElementCodec<E>: Send + Sync {
    fn convert(&self, property: &str, value: &ConfigTree, registry: &TypeRegistry)
    -> ConfigResult<E>;

    fn same(&self, current: &E, desired: &E) -> bool;

    /// Notify an element that it is leaving the container.
    fn release(&self, element: &E, registry: &TypeRegistry);

    /// Update `element` from `value` keeping its identity. `Ok(false)` means
    /// the element has to be replaced instead.
    fn update_in_place(
        &self,
        element: &E,
        value: &ConfigTree,
        registry: &TypeRegistry,
    ) -> ConfigResult<bool>;
}

pub(crate) struct ValueCodec<V> {
    same: fn(&V, &V) -> bool,
    _marker: PhantomData<fn() -> V>,
}

impl<V> ValueCodec<V> {
    pub(crate) fn new(same: fn(&V, &V) -> bool) -> Self {
        Self {
            same,
            _marker: PhantomData,
        }
    }
}

impl<V: DeserializeOwned + Send + Sync + 'static> ElementCodec<V> for ValueCodec<V> {
    fn convert(&self, property: &str, value: &ConfigTree, _: &TypeRegistry) -> ConfigResult<V> {
        serde_json::from_value(value.clone()).map_err(|e| ConfigError::conversion(property, e))
    }

    fn same(&self, current: &V, desired: &V) -> bool {
        (self.same)(current, desired)
    }

    fn release(&self, _: &V, _: &TypeRegistry) {}

    fn update_in_place(&self, _: &V, _: &ConfigTree, _: &TypeRegistry) -> ConfigResult<bool> {
        Ok(false)
    }
}

pub(crate) struct ObjectCodec<S> {
    same: fn(&S, &S) -> bool,
}

impl<S> ObjectCodec<S> {
    pub(crate) fn new(same: fn(&S, &S) -> bool) -> Self {
        Self { same }
    }
}

impl<S: Configurable> ElementCodec<Shared<S>> for ObjectCodec<S> {
    fn convert(
        &self,
        property: &str,
        value: &ConfigTree,
        registry: &TypeRegistry,
    ) -> ConfigResult<Shared<S>> {
        build_object::<S>(property, value, registry)
    }

    fn same(&self, current: &Shared<S>, desired: &Shared<S>) -> bool {
        Arc::ptr_eq(current, desired) || (self.same)(&read(current), &read(desired))
    }

    fn release(&self, element: &Shared<S>, registry: &TypeRegistry) {
        release_object(element, registry);
    }

    fn update_in_place(
        &self,
        element: &Shared<S>,
        value: &ConfigTree,
        registry: &TypeRegistry,
    ) -> ConfigResult<bool> {
        if !value.is_object() {
            return Ok(false);
        }
        registry.reconfigure(
            &ConfigType::of::<S>(),
            &Instance::from_shared(Arc::clone(element)),
            value,
        )?;
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Ordered lists
// ---------------------------------------------------------------------------

pub(crate) struct ListProperty<T, E> {
    access: fn(&mut T) -> &mut Option<Vec<E>>,
    codec: Box<dyn ElementCodec<E>>,
}

impl<T, E> ListProperty<T, E> {
    pub(crate) fn new(
        access: fn(&mut T) -> &mut Option<Vec<E>>,
        codec: impl ElementCodec<E> + 'static,
    ) -> Self {
        Self {
            access,
            codec: Box::new(codec),
        }
    }
}

impl<T: 'static, E: 'static> PropertyApply for ListProperty<T, E> {
    fn apply(
        &self,
        target: &mut dyn Any,
        property: &str,
        value: &ConfigTree,
        registry: &TypeRegistry,
    ) -> ConfigResult<()> {
        let field = (self.access)(target_as::<T>(target)?);
        let codec = self.codec.as_ref();

        match value {
            Value::Null => {
                if let Some(previous) = field.take() {
                    for element in &previous {
                        codec.release(element, registry);
                    }
                }
                Ok(())
            }
            Value::Object(_) => Err(ConfigError::conversion(
                property,
                "can't reconcile a list with an object",
            )),
            Value::Array(entries) => {
                let mut desired = Vec::with_capacity(entries.len());
                for (index, entry) in entries.iter().enumerate() {
                    if entry.is_null() {
                        registry.logger().warning(&format!(
                            "Skipping null entry {} of list {}",
                            index, property
                        ));
                        continue;
                    }
                    desired.push(codec.convert(property, entry, registry)?);
                }
                reconcile_list(field.get_or_insert_with(Vec::new), desired, codec, registry);
                Ok(())
            }
            single => {
                let item = codec.convert(property, single, registry)?;
                let current = field.get_or_insert_with(Vec::new);
                current.retain(|element| {
                    let keep = codec.same(element, &item);
                    if !keep {
                        codec.release(element, registry);
                    }
                    keep
                });
                if current.is_empty() {
                    current.push(item);
                }
                Ok(())
            }
        }
    }
}

/// Positional reconciliation: equal elements stay, unequal ones are
/// replaced, surplus ones from index `desired.len()` onward are dropped.
fn reconcile_list<E>(
    current: &mut Vec<E>,
    desired: Vec<E>,
    codec: &dyn ElementCodec<E>,
    registry: &TypeRegistry,
) {
    let desired_len = desired.len();
    for (index, element) in desired.into_iter().enumerate() {
        match current.get(index) {
            Some(existing) if codec.same(existing, &element) => {}
            Some(existing) => {
                codec.release(existing, registry);
                current[index] = element;
            }
            None => current.push(element),
        }
    }

    if current.len() > desired_len {
        for removed in current.split_off(desired_len) {
            codec.release(&removed, registry);
        }
    }
}

// ---------------------------------------------------------------------------
// Keyed maps
// ---------------------------------------------------------------------------

pub(crate) struct MapProperty<T, E> {
    access: fn(&mut T) -> &mut Option<BTreeMap<String, E>>,
    codec: Box<dyn ElementCodec<E>>,
}

impl<T, E> MapProperty<T, E> {
    pub(crate) fn new(
        access: fn(&mut T) -> &mut Option<BTreeMap<String, E>>,
        codec: impl ElementCodec<E> + 'static,
    ) -> Self {
        Self {
            access,
            codec: Box::new(codec),
        }
    }
}

impl<T: 'static, E: 'static> PropertyApply for MapProperty<T, E> {
    fn apply(
        &self,
        target: &mut dyn Any,
        property: &str,
        value: &ConfigTree,
        registry: &TypeRegistry,
    ) -> ConfigResult<()> {
        let field = (self.access)(target_as::<T>(target)?);
        let codec = self.codec.as_ref();

        let entries = match value {
            Value::Null => {
                if let Some(previous) = field.take() {
                    for element in previous.values() {
                        codec.release(element, registry);
                    }
                }
                return Ok(());
            }
            Value::Object(entries) => entries,
            other => {
                return Err(ConfigError::conversion(
                    property,
                    format!("can't reconcile a map with {}", kind_of(other)),
                ));
            }
        };

        // Keys missing from `entries` are left alone; only an explicit null removes.
        let current = field.get_or_insert_with(BTreeMap::new);
        for (key, entry) in entries {
            if entry.is_null() {
                if let Some(previous) = current.remove(key) {
                    codec.release(&previous, registry);
                }
                continue;
            }

            let updated = match current.get(key) {
                Some(existing) => codec.update_in_place(existing, entry, registry)?,
                None => false,
            };
            if updated {
                continue;
            }

            let replacement = codec.convert(property, entry, registry)?;
            if let Some(previous) = current.insert(key.clone(), replacement) {
                codec.release(&previous, registry);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TypeCatalog;
    use crate::descriptor::Describe;
    use crate::logging::Logger;
    use crate::types::shared;
    use serde_json::json;
    use std::sync::Mutex;

    static RELEASED: Mutex<Vec<String>> = Mutex::new(Vec::new());

    #[derive(Default, PartialEq)]
    struct Tag {
        id: String,
    }

    impl Tag {
        fn gone(&mut self) -> anyhow::Result<()> {
            RELEASED
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(self.id.clone());
            Ok(())
        }
    }

    impl Configurable for Tag {
        fn describe(d: &mut Describe<Self>) {
            d.value("id", |t| &mut t.id);
            d.before_remove("gone", Tag::gone);
        }
    }

    fn registry() -> TypeRegistry {
        let catalog = TypeCatalog::new();
        catalog.register::<Tag>();
        TypeRegistry::new(Arc::new(catalog), Logger::new())
    }

    fn tag(id: &str) -> Shared<Tag> {
        shared(Tag { id: id.into() })
    }

    fn ids(list: &[Shared<Tag>]) -> Vec<String> {
        list.iter().map(|t| read(t).id.clone()).collect()
    }

    #[test]
    fn test_reconcile_list_keeps_equal_prefix() {
        let registry = registry();
        let codec = ObjectCodec::new(<Tag as PartialEq>::eq);
        let a = tag("reconcile-a");
        let mut current = vec![Arc::clone(&a), tag("reconcile-b"), tag("reconcile-c")];

        reconcile_list(
            &mut current,
            vec![tag("reconcile-a"), tag("reconcile-d")],
            &codec,
            &registry,
        );

        assert_eq!(ids(&current), vec!["reconcile-a", "reconcile-d"]);
        assert!(Arc::ptr_eq(&current[0], &a));
        let released = RELEASED.lock().unwrap().clone();
        assert!(released.contains(&"reconcile-b".to_string()));
        assert!(released.contains(&"reconcile-c".to_string()));
        assert!(!released.contains(&"reconcile-a".to_string()));
    }

    #[test]
    fn test_reconcile_list_shrink_boundary_is_exclusive() {
        let registry = registry();
        let codec = ValueCodec::new(<i32 as PartialEq>::eq);
        let mut current = vec![1, 2, 3, 4];
        reconcile_list(&mut current, vec![1, 2], &codec, &registry);
        assert_eq!(current, vec![1, 2]);

        let mut current = vec![1];
        reconcile_list(&mut current, vec![1, 5, 6], &codec, &registry);
        assert_eq!(current, vec![1, 5, 6]);

        let mut current = vec![1, 2];
        reconcile_list(&mut current, Vec::new(), &codec, &registry);
        assert!(current.is_empty());
    }

    #[test]
    fn test_object_codec_same_by_value_or_identity() {
        let codec = ObjectCodec::new(<Tag as PartialEq>::eq);
        let a = tag("x");
        assert!(codec.same(&a, &a));
        assert!(codec.same(&a, &tag("x")));
        assert!(!codec.same(&a, &tag("y")));

        let by_identity = ObjectCodec::<Tag>::new(|_, _| false);
        assert!(by_identity.same(&a, &a));
        assert!(!by_identity.same(&a, &tag("x")));
    }

    #[test]
    fn test_value_codec_never_updates_in_place() {
        let registry = registry();
        let codec = ValueCodec::<String>::new(<String as PartialEq>::eq);
        let updated = codec
            .update_in_place(&"a".to_string(), &json!({"x": 1}), &registry)
            .unwrap();
        assert!(!updated);
        assert!(codec.convert("p", &json!(3), &registry).is_err());
    }

    #[test]
    fn test_kind_of() {
        assert_eq!(kind_of(&json!(null)), "null");
        assert_eq!(kind_of(&json!([1])), "array");
        assert_eq!(kind_of(&json!({})), "object");
    }
}
