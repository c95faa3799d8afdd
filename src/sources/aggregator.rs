//! Multi-file aggregation: watched roots to per-type configuration, with
//! lifecycle dispatch to registered instances.
//!
//! Two locks are involved. The sources lock guards the roots and known
//! files; the types lock guards every [`ConfiguredType`]. A rescan takes the
//! sources lock first and the types lock second; instance registration only
//! takes the types lock, so it serializes with the dispatch part of a rescan.

use super::files::{ConfigSourceFile, expand_roots};
use super::formats::FormatSet;
use crate::catalog::TypeResolver;
use crate::error::ConfigResult;
use crate::logging::Logger;
use crate::merge::{NullPolicy, TreeError, merge_all};
use crate::registry::TypeRegistry;
use crate::types::{ConfigTree, ConfigType, Configurable, Instance, Shared};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Engine options.
#[derive(Debug, Clone, Default)]
pub struct AggregatorOptions {
    /// Recognized file formats.
    pub formats: FormatSet,
}

/// A type some file describes, with its aggregated tree and live instances.
#[derive(Debug)]
pub struct ConfiguredType {
    ty: ConfigType,
    tree: ConfigTree,
    instances: Vec<Instance>,
}

impl ConfiguredType {
    pub fn config_type(&self) -> ConfigType {
        self.ty
    }

    /// Ordered merge of every file sub-tree naming this type.
    pub fn tree(&self) -> &ConfigTree {
        &self.tree
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }
}

/// What one rescan pass did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RescanReport {
    pub files_added: Vec<PathBuf>,
    pub files_updated: Vec<PathBuf>,
    pub files_removed: Vec<PathBuf>,
    /// Files that failed to parse, with the reason.
    pub files_failed: Vec<(PathBuf, String)>,
    pub types_created: Vec<String>,
    pub types_updated: Vec<String>,
    pub types_removed: Vec<String>,
    /// Names no type could be resolved for.
    pub unresolved: Vec<String>,
    /// Per-instance reconfiguration failures.
    pub instance_failures: Vec<String>,
}

impl RescanReport {
    pub fn has_changes(&self) -> bool {
        !(self.files_added.is_empty()
            && self.files_updated.is_empty()
            && self.files_removed.is_empty()
            && self.types_created.is_empty()
            && self.types_updated.is_empty()
            && self.types_removed.is_empty())
    }
}

/// Merge the sub-trees naming one type, in file order. Later files win per
/// leaf and explicit nulls are kept.
pub fn aggregate_trees<'a>(
    trees: impl IntoIterator<Item = &'a ConfigTree>,
) -> Result<ConfigTree, TreeError> {
    merge_all(trees, NullPolicy::Keep)
}

#[derive(Default)]
struct Sources {
    roots: Vec<PathBuf>,
    files: Vec<ConfigSourceFile>,
}

#[derive(Default)]
struct Contribution<'a> {
    /// Every file's sub-tree, in discovery order.
    all: Vec<&'a ConfigTree>,
    /// Sub-trees from files read during this pass.
    pending: Vec<&'a ConfigTree>,
}

/// Keeps configured types in sync with the files under a set of roots.
pub struct ConfigSourceAggregator {
    registry: Arc<TypeRegistry>,
    resolver: Arc<dyn TypeResolver>,
    options: AggregatorOptions,
    sources: Mutex<Sources>,
    types: Mutex<HashMap<ConfigType, ConfiguredType>>,
    logger: Logger,
}

impl ConfigSourceAggregator {
    pub fn new(
        registry: Arc<TypeRegistry>,
        resolver: Arc<dyn TypeResolver>,
        options: AggregatorOptions,
        logger: Logger,
    ) -> Self {
        Self {
            registry,
            resolver,
            options,
            sources: Mutex::new(Sources::default()),
            types: Mutex::new(HashMap::new()),
            logger,
        }
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Watch a file or directory. Takes effect on the next rescan.
    pub fn add_root(&self, root: impl Into<PathBuf>) {
        let root = root.into();
        let mut sources = lock(&self.sources);
        if !sources.roots.contains(&root) {
            self.logger
                .debug(&format!("Watching {}", root.display()));
            sources.roots.push(root);
        }
    }

    /// Stop watching a root. Its files are forgotten on the next rescan.
    pub fn remove_root(&self, root: &Path) -> bool {
        let mut sources = lock(&self.sources);
        let before = sources.roots.len();
        sources.roots.retain(|r| r != root);
        before != sources.roots.len()
    }

    pub fn roots(&self) -> Vec<PathBuf> {
        lock(&self.sources).roots.clone()
    }

    /// Known files, in discovery order.
    pub fn files(&self) -> Vec<PathBuf> {
        lock(&self.sources)
            .files
            .iter()
            .map(|f| f.path().to_path_buf())
            .collect()
    }

    pub fn configured_types(&self) -> Vec<ConfigType> {
        let mut types: Vec<ConfigType> = lock(&self.types).keys().copied().collect();
        types.sort_by_key(|ty| ty.name());
        types
    }

    pub fn is_configured(&self, ty: &ConfigType) -> bool {
        lock(&self.types).contains_key(ty)
    }

    /// Current aggregated tree of `ty`.
    pub fn tree_of(&self, ty: &ConfigType) -> Option<ConfigTree> {
        lock(&self.types).get(ty).map(|c| c.tree.clone())
    }

    pub fn instance_count(&self, ty: &ConfigType) -> usize {
        lock(&self.types)
            .get(ty)
            .map(|c| c.instances.len())
            .unwrap_or(0)
    }

    /// Configure `instance` with its type's aggregated tree and keep it in
    /// sync from now on.
    ///
    /// Returns `Ok(false)` when no file describes the type. When the
    /// configuration is rejected the instance is not registered.
    pub fn register_instance(&self, instance: Instance) -> ConfigResult<bool> {
        let ty = instance.config_type();
        let mut types = lock(&self.types);
        let Some(configured) = types.get_mut(&ty) else {
            self.logger.debug(&format!(
                "No configuration for {}, instance left as is",
                ty.name()
            ));
            return Ok(false);
        };
        self.registry.configure(&ty, &instance, &configured.tree)?;
        configured.instances.push(instance);
        Ok(true)
    }

    /// Stop syncing `instance`. Its BeforeRemove hooks run if it was registered.
    pub fn unregister_instance(&self, instance: &Instance) -> bool {
        let ty = instance.config_type();
        let mut types = lock(&self.types);
        let Some(configured) = types.get_mut(&ty) else {
            return false;
        };
        let Some(index) = configured.instances.iter().position(|i| i.ptr_eq(instance)) else {
            return false;
        };
        let removed = configured.instances.remove(index);
        self.registry.remove(&ty, &removed);
        true
    }

    /// Instantiate a `T` through the factory and register it.
    pub fn create<T: Configurable>(&self) -> ConfigResult<Shared<T>> {
        let handle = self.registry.instantiate::<T>()?;
        self.register_instance(Instance::from_shared(Arc::clone(&handle)))?;
        Ok(handle)
    }

    /// One synchronization pass over the watched roots.
    pub fn rescan(&self) -> RescanReport {
        let mut report = RescanReport::default();
        let mut sources = lock(&self.sources);
        let found = expand_roots(&sources.roots, &self.options.formats, &self.logger);
        let mut read_now: Vec<PathBuf> = Vec::new();

        for file in std::mem::take(&mut sources.files) {
            if found.iter().any(|p| p.as_path() == file.path()) {
                sources.files.push(file);
            } else {
                self.logger
                    .info(&format!("Configuration file {} removed", file.path().display()));
                report.files_removed.push(file.path().to_path_buf());
            }
        }

        // A changed file that fails to parse keeps its previous entries.
        for file in sources.files.iter_mut() {
            if !file.is_stale() {
                continue;
            }
            let Some(format) = self.options.formats.for_path(file.path()) else {
                continue;
            };
            let path = file.path().to_path_buf();
            match file.refresh(format) {
                Ok(()) => {
                    self.logger.info(&format!(
                        "Configuration file {} updated ({})",
                        path.display(),
                        file.stamp().map(|s| s.to_string()).unwrap_or_default()
                    ));
                    report.files_updated.push(path.clone());
                    read_now.push(path);
                }
                Err(e) => {
                    self.logger
                        .error(&format!("Can't parse {}: {}", path.display(), e));
                    report.files_failed.push((path, e.to_string()));
                }
            }
        }

        // A new file that fails to parse is not kept, so it is retried next pass.
        for path in found {
            if sources.files.iter().any(|f| f.path() == path.as_path()) {
                continue;
            }
            let Some(format) = self.options.formats.for_path(&path) else {
                continue;
            };
            let mut file = ConfigSourceFile::new(&path);
            match file.refresh(format) {
                Ok(()) => {
                    self.logger.info(&format!(
                        "Configuration file {} added ({} entries)",
                        path.display(),
                        file.entries().len()
                    ));
                    report.files_added.push(path.clone());
                    read_now.push(path);
                    sources.files.push(file);
                }
                Err(e) => {
                    self.logger
                        .error(&format!("Can't parse {}: {}", path.display(), e));
                    report.files_failed.push((path, e.to_string()));
                }
            }
        }

        // Names are resolved on every pass so late registrations get picked up.
        let mut contributions: HashMap<ConfigType, Contribution<'_>> = HashMap::new();
        let mut order: Vec<ConfigType> = Vec::new();
        for file in &sources.files {
            let pending = read_now.iter().any(|p| p.as_path() == file.path());
            for (name, tree) in file.entries() {
                let Some(ty) = self.resolver.resolve(name) else {
                    self.logger.warning(&format!(
                        "Can't resolve type {} from {}, skipping it for now",
                        name,
                        file.path().display()
                    ));
                    if !report.unresolved.contains(name) {
                        report.unresolved.push(name.clone());
                    }
                    continue;
                };
                let contribution = contributions.entry(ty).or_insert_with(|| {
                    order.push(ty);
                    Contribution::default()
                });
                contribution.all.push(tree);
                if pending {
                    contribution.pending.push(tree);
                }
            }
        }

        let mut types = lock(&self.types);

        let gone: Vec<ConfigType> = types
            .keys()
            .filter(|ty| !contributions.contains_key(ty))
            .copied()
            .collect();
        for ty in gone {
            if let Some(configured) = types.remove(&ty) {
                for instance in &configured.instances {
                    self.registry.remove(&ty, instance);
                }
                self.logger.info(&format!(
                    "Type {} no longer configured, released {} instances",
                    ty.name(),
                    configured.instances.len()
                ));
                report.types_removed.push(ty.name().to_string());
            }
        }

        for ty in order {
            let contribution = &contributions[&ty];
            let aggregate = match aggregate_trees(contribution.all.iter().copied()) {
                Ok(tree) => tree,
                Err(e) => {
                    self.logger
                        .error(&format!("Can't merge configuration of {}: {}", ty.name(), e));
                    continue;
                }
            };

            let Some(configured) = types.get_mut(&ty) else {
                self.logger
                    .info(&format!("Type {} is now configured", ty.name()));
                types.insert(
                    ty,
                    ConfiguredType {
                        ty,
                        tree: aggregate,
                        instances: Vec::new(),
                    },
                );
                report.types_created.push(ty.name().to_string());
                continue;
            };
            if configured.tree == aggregate {
                continue;
            }
            let previous = std::mem::replace(&mut configured.tree, aggregate);
            report.types_updated.push(ty.name().to_string());

            let update = update_tree(&previous, &configured.tree, &contribution.pending);
            self.logger.debug(&format!(
                "Reconfiguring {} instances of {}",
                configured.instances.len(),
                ty.name()
            ));
            for instance in &configured.instances {
                if let Err(e) = self.registry.reconfigure(&ty, instance, &update) {
                    self.logger
                        .error(&format!("Can't reconfigure {:?}: {}", instance, e));
                    report
                        .instance_failures
                        .push(format!("{}: {}", ty.name(), e));
                }
            }
        }

        if report.has_changes() {
            self.logger.info(&format!(
                "Rescan: {} files added, {} updated, {} removed, {} types created, {} updated, {} removed",
                report.files_added.len(),
                report.files_updated.len(),
                report.files_removed.len(),
                report.types_created.len(),
                report.types_updated.len(),
                report.types_removed.len()
            ));
        }
        report
    }
}

/// Top-level entries of `aggregate` that a file read this pass names, or
/// whose merged value moved since `previous`. Values always come from the
/// aggregate, so later files keep winning over the ones just re-read.
fn update_tree(previous: &ConfigTree, aggregate: &ConfigTree, pending: &[&ConfigTree]) -> ConfigTree {
    let mut update = Map::new();
    if let Some(entries) = aggregate.as_object() {
        for (key, value) in entries {
            let touched = pending.iter().any(|tree| tree.get(key).is_some());
            if touched || previous.get(key) != Some(value) {
                update.insert(key.clone(), value.clone());
            }
        }
    }
    Value::Object(update)
}
