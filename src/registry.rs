//! Type registry: descriptor cache plus the configure / reconfigure / remove
//! entry points that drive property reconciliation and lifecycle hooks.

use crate::catalog::InstanceFactory;
use crate::descriptor::{HookKind, TypeDescriptor};
use crate::error::{ConfigError, ConfigResult};
use crate::logging::Logger;
use crate::types::{ConfigTree, ConfigType, Configurable, Instance, Shared};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use serde_json::{Map, Value};
use std::any::{Any, TypeId};
use std::sync::Arc;

/// Per-process registry of configurable types.
///
/// Descriptors are built lazily on first use and cached for the lifetime of
/// the registry. Concurrent first access to the same type builds exactly one
/// descriptor: construction happens while the map shard is locked.
pub struct TypeRegistry {
    descriptors: DashMap<TypeId, Arc<TypeDescriptor>>,
    codec_types: DashSet<TypeId>,
    factory: Arc<dyn InstanceFactory>,
    logger: Logger,
}

impl TypeRegistry {
    pub fn new(factory: Arc<dyn InstanceFactory>, logger: Logger) -> Self {
        Self {
            descriptors: DashMap::new(),
            codec_types: DashSet::new(),
            factory,
            logger,
        }
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn factory(&self) -> &Arc<dyn InstanceFactory> {
        &self.factory
    }

    /// Mark a type as handled by its own codec. It will never get a
    /// descriptor, even if it implements [`Configurable`].
    pub fn register_codec_type(&self, ty: ConfigType) {
        self.codec_types.insert(ty.id());
        self.descriptors.remove(&ty.id());
    }

    pub fn is_blacklisted(&self, ty: &ConfigType) -> bool {
        !ty.is_configurable() || self.codec_types.contains(&ty.id())
    }

    /// Cached descriptor for `ty`, building it on first access.
    ///
    /// Returns `Ok(None)` for blacklisted types.
    pub fn descriptor(&self, ty: &ConfigType) -> ConfigResult<Option<Arc<TypeDescriptor>>> {
        if self.is_blacklisted(ty) {
            return Ok(None);
        }
        if let Some(cached) = self.descriptors.get(&ty.id()) {
            return Ok(Some(Arc::clone(cached.value())));
        }

        let Some(build) = ty.describe_fn() else {
            return Ok(None);
        };
        match self.descriptors.entry(ty.id()) {
            Entry::Occupied(entry) => Ok(Some(Arc::clone(entry.get()))),
            Entry::Vacant(entry) => {
                let descriptor =
                    Arc::new(build().map_err(|e| ConfigError::descriptor(ty.name(), e))?);
                self.logger.debug(&format!(
                    "Built descriptor for {} with {} properties",
                    ty.name(),
                    descriptor.properties().count()
                ));
                entry.insert(Arc::clone(&descriptor));
                Ok(Some(descriptor))
            }
        }
    }

    /// Create a new `S` through the instantiation collaborator.
    pub fn instantiate<S: Configurable>(&self) -> ConfigResult<Shared<S>> {
        let ty = ConfigType::of::<S>();
        let instance = self.factory.new_instance(&ty)?;
        instance
            .downcast::<S>()
            .ok_or_else(|| ConfigError::type_mismatch(ty.name(), instance.config_type().name()))
    }

    /// First configuration of a new instance, followed by its AfterInject hooks.
    ///
    /// A validator rejection or conversion failure stops at the offending
    /// property. Properties applied before it stay applied and no hook runs.
    pub fn configure(
        &self,
        ty: &ConfigType,
        instance: &Instance,
        tree: &ConfigTree,
    ) -> ConfigResult<()> {
        let Some((descriptor, entries)) = self.prepare(ty, instance, tree)? else {
            return Ok(());
        };

        let mut outcome = Ok(());
        instance.with_mut(&mut |target: &mut dyn Any| {
            outcome = self.apply_entries(&descriptor, target, entries);
            if outcome.is_ok() {
                descriptor.run_hooks(HookKind::AfterInject, target, &self.logger);
            }
        });
        outcome
    }

    /// BeforeUpdate hooks, property application, then AfterUpdate hooks.
    pub fn reconfigure(
        &self,
        ty: &ConfigType,
        instance: &Instance,
        tree: &ConfigTree,
    ) -> ConfigResult<()> {
        let Some((descriptor, entries)) = self.prepare(ty, instance, tree)? else {
            return Ok(());
        };

        let mut outcome = Ok(());
        instance.with_mut(&mut |target: &mut dyn Any| {
            descriptor.run_hooks(HookKind::BeforeUpdate, target, &self.logger);
            outcome = self.apply_entries(&descriptor, target, entries);
            if outcome.is_ok() {
                descriptor.run_hooks(HookKind::AfterUpdate, target, &self.logger);
            }
        });
        outcome
    }

    /// BeforeRemove hooks only. The instance itself is left to its owners.
    pub fn remove(&self, ty: &ConfigType, instance: &Instance) {
        let descriptor = match self.descriptor(ty) {
            Ok(Some(descriptor)) => descriptor,
            Ok(None) => return,
            Err(e) => {
                self.logger.error(&format!("Can't remove {}: {}", ty.name(), e));
                return;
            }
        };
        instance.with_mut(&mut |target: &mut dyn Any| {
            descriptor.run_hooks(HookKind::BeforeRemove, target, &self.logger);
        });
    }

    /// Shared preamble: resolve the descriptor and check the tree shape.
    /// `None` means there is nothing to do.
    fn prepare<'t>(
        &self,
        ty: &ConfigType,
        instance: &Instance,
        tree: &'t ConfigTree,
    ) -> ConfigResult<Option<(Arc<TypeDescriptor>, &'t Map<String, Value>)>> {
        if self.is_blacklisted(ty) {
            self.logger
                .debug(&format!("Skipping {}: type can't be configured", ty.name()));
            return Ok(None);
        }
        let entries = match tree {
            Value::Null => return Ok(None),
            Value::Object(entries) if entries.is_empty() => return Ok(None),
            Value::Object(entries) => entries,
            other => {
                return Err(ConfigError::tree(format!(
                    "configuration for {} must be an object, found {}",
                    ty.name(),
                    crate::reconcile::kind_of(other)
                ))
                .with_type(ty.name()));
            }
        };
        if instance.config_type() != *ty {
            return Err(ConfigError::type_mismatch(
                ty.name(),
                instance.config_type().name(),
            ));
        }
        Ok(self.descriptor(ty)?.map(|descriptor| (descriptor, entries)))
    }

    fn apply_entries(
        &self,
        descriptor: &TypeDescriptor,
        target: &mut dyn Any,
        entries: &Map<String, Value>,
    ) -> ConfigResult<()> {
        let type_name = descriptor.config_type().name();
        for (key, value) in entries {
            let Some(property) = descriptor.property(key) else {
                self.logger.warning(&format!(
                    "Unknown property {} for {}, ignoring it",
                    key, type_name
                ));
                continue;
            };
            if let Some(validator) = property.first_rejection(value) {
                return Err(ConfigError::validation(type_name, key, validator));
            }
            property
                .applier()
                .apply(target, key, value, self)
                .map_err(|e| match e.type_name {
                    Some(_) => e,
                    None => e.with_type(type_name),
                })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TypeCatalog;
    use crate::descriptor::Describe;
    use crate::error::ErrorCode;
    use crate::types::{read, shared};
    use crate::validation::NotNull;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    static BUILDS: AtomicUsize = AtomicUsize::new(0);

    #[derive(Default)]
    struct Counted {
        n: i64,
    }

    impl Configurable for Counted {
        fn describe(d: &mut Describe<Self>) {
            BUILDS.fetch_add(1, Ordering::SeqCst);
            d.value("n", |c| &mut c.n).validate(NotNull);
        }
    }

    #[derive(Default)]
    struct Steps {
        a: i64,
        b: i64,
        log: Vec<&'static str>,
    }

    impl Steps {
        fn injected(&mut self) -> anyhow::Result<()> {
            self.log.push("inject");
            Ok(())
        }
        fn before(&mut self) -> anyhow::Result<()> {
            self.log.push("before");
            Ok(())
        }
        fn after(&mut self) -> anyhow::Result<()> {
            self.log.push("after");
            Ok(())
        }
        fn broken(&mut self) -> anyhow::Result<()> {
            anyhow::bail!("broken hook")
        }
        fn removed(&mut self) -> anyhow::Result<()> {
            self.log.push("remove");
            Ok(())
        }
    }

    impl Configurable for Steps {
        fn describe(d: &mut Describe<Self>) {
            d.value("a", |s| &mut s.a);
            d.value("b", |s| &mut s.b)
                .validate(crate::validation::predicate("small", |v| {
                    v.as_i64().is_some_and(|n| n < 100)
                }));
            d.after_inject("broken", Steps::broken)
                .after_inject("injected", Steps::injected)
                .before_update("before", Steps::before)
                .after_update("after", Steps::after)
                .before_remove("removed", Steps::removed);
        }
    }

    fn registry() -> TypeRegistry {
        let catalog = TypeCatalog::new();
        catalog.register::<Counted>().register::<Steps>();
        TypeRegistry::new(Arc::new(catalog), Logger::new())
    }

    #[test]
    fn test_descriptor_built_once_under_concurrent_access() {
        let registry = Arc::new(registry());
        let before = BUILDS.load(Ordering::SeqCst);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    registry
                        .descriptor(&ConfigType::of::<Counted>())
                        .unwrap()
                        .unwrap()
                })
            })
            .collect();
        let descriptors: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(BUILDS.load(Ordering::SeqCst) - before, 1);
        assert!(descriptors.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[test]
    fn test_blacklisted_types_are_noops() {
        let registry = registry();
        let text = Instance::opaque(String::from("x"));
        registry
            .configure(&ConfigType::opaque::<String>(), &text, &json!({"len": 3}))
            .unwrap();
        assert!(registry.descriptor(&ConfigType::opaque::<String>()).unwrap().is_none());

        registry.register_codec_type(ConfigType::of::<Steps>());
        let steps = Instance::new(Steps::default());
        registry
            .configure(&ConfigType::of::<Steps>(), &steps, &json!({"a": 1}))
            .unwrap();
        assert_eq!(read(&steps.downcast::<Steps>().unwrap()).a, 0);
    }

    #[test]
    fn test_configure_runs_hooks_past_failing_one() {
        let registry = registry();
        let handle = shared(Steps::default());
        let instance = Instance::from_shared(Arc::clone(&handle));
        let ty = ConfigType::of::<Steps>();

        registry
            .configure(&ty, &instance, &json!({"a": 1, "b": 2, "zzz": true}))
            .unwrap();
        assert_eq!(read(&handle).a, 1);
        assert_eq!(read(&handle).log, vec!["inject"]);

        registry.reconfigure(&ty, &instance, &json!({"a": 5})).unwrap();
        registry.remove(&ty, &instance);
        assert_eq!(read(&handle).a, 5);
        assert_eq!(read(&handle).log, vec!["inject", "before", "after", "remove"]);
    }

    #[test]
    fn test_validator_rejects_before_write() {
        let registry = registry();
        let handle = shared(Steps::default());
        let instance = Instance::from_shared(Arc::clone(&handle));
        let ty = ConfigType::of::<Steps>();

        registry.configure(&ty, &instance, &json!({"b": 7})).unwrap();
        let err = registry
            .reconfigure(&ty, &instance, &json!({"b": 700}))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationFailed);
        assert_eq!(err.property.as_deref(), Some("b"));
        assert_eq!(read(&handle).b, 7);
        assert_eq!(read(&handle).log, vec!["inject", "before"]);
    }

    #[test]
    fn test_empty_tree_and_wrong_instance() {
        let registry = registry();
        let steps = Instance::new(Steps::default());
        let ty = ConfigType::of::<Steps>();
        registry.configure(&ty, &steps, &json!({})).unwrap();
        assert!(read(&steps.downcast::<Steps>().unwrap()).log.is_empty());

        let err = registry
            .configure(&ConfigType::of::<Counted>(), &steps, &json!({"n": 1}))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::TypeMismatch);

        let err = registry.configure(&ty, &steps, &json!([1])).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidTree);
    }
}
