//! Type resolution and instantiation collaborators.
//!
//! The engine never constructs domain objects by itself: it asks an
//! [`InstanceFactory`], and it maps the names found in configuration files to
//! types through a [`TypeResolver`]. [`TypeCatalog`] implements both from an
//! explicit list of registered types plus an optional mnemonic table.

use crate::error::{ConfigError, ConfigResult};
use crate::logging::Logger;
use crate::sources::formats::key_value_lines;
use crate::types::{ConfigType, Configurable, Instance};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::any::TypeId;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Builds new instances of configurable types.
pub trait InstanceFactory: Send + Sync {
    fn new_instance(&self, ty: &ConfigType) -> ConfigResult<Instance>;
}

/// Maps a type name or mnemonic, as written in a file, to a type.
pub trait TypeResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<ConfigType>;
}

/// Read `mnemonic=type.name` lines, in file order.
pub fn read_mnemonic_table(path: &Path) -> ConfigResult<Vec<(String, String)>> {
    let content = std::fs::read_to_string(path)?;
    let lines = key_value_lines(&content)
        .map_err(|e| ConfigError::parse(format!("{}: {}", path.display(), e)))?;
    Ok(lines
        .into_iter()
        .map(|(_, mnemonic, name)| (mnemonic, name))
        .collect())
}

struct CatalogEntry {
    ty: ConfigType,
    make: Box<dyn Fn() -> Instance + Send + Sync>,
}

/// Registry of constructible types, addressable by full name, short name or
/// mnemonic.
pub struct TypeCatalog {
    entries: DashMap<TypeId, Arc<CatalogEntry>>,
    names: DashMap<String, TypeId>,
    mnemonics: ArcSwap<HashMap<String, String>>,
    logger: Logger,
}

impl TypeCatalog {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            names: DashMap::new(),
            mnemonics: ArcSwap::from_pointee(HashMap::new()),
            logger: Logger::new().with_name("catalog"),
        }
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    /// Register `T`, built with `Default`.
    pub fn register<T: Configurable + Default>(&self) -> &Self {
        self.register_with(T::default)
    }

    /// Register `T` with an explicit constructor.
    pub fn register_with<T: Configurable>(&self, ctor: fn() -> T) -> &Self {
        let ty = ConfigType::of::<T>();
        self.entries.insert(
            ty.id(),
            Arc::new(CatalogEntry {
                ty,
                make: Box::new(move || Instance::new(ctor())),
            }),
        );
        self.names.insert(ty.name().to_string(), ty.id());

        // A short name shared by two types only resolves to the first one.
        let short = ty.short_name();
        match self.names.get(short).map(|id| *id) {
            Some(existing) if existing != ty.id() => self.logger.warning(&format!(
                "Short name {} of {} is already taken, use the full name",
                short,
                ty.name()
            )),
            Some(_) => {}
            None => {
                self.names.insert(short.to_string(), ty.id());
            }
        }
        self
    }

    /// Add or replace one mnemonic.
    pub fn set_mnemonic(&self, mnemonic: impl Into<String>, name: impl Into<String>) {
        let (mnemonic, name) = (mnemonic.into(), name.into());
        self.mnemonics.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(mnemonic.clone(), name.clone());
            next
        });
    }

    /// Load `mnemonic=type.name` lines, replacing the whole table.
    ///
    /// Entries naming unregistered types are skipped. Returns the number of
    /// mnemonics kept.
    pub fn load_mnemonics(&self, path: &Path) -> ConfigResult<usize> {
        let mut table = HashMap::new();
        for (mnemonic, name) in read_mnemonic_table(path)? {
            if !self.names.contains_key(&name) {
                self.logger.debug(&format!(
                    "{}: mnemonic {} names unknown type {}, skipping",
                    path.display(),
                    mnemonic,
                    name
                ));
                continue;
            }
            table.insert(mnemonic, name);
        }

        let count = table.len();
        self.mnemonics.store(Arc::new(table));
        self.logger.info(&format!(
            "Loaded {} mnemonics from {}",
            count,
            path.display()
        ));
        Ok(count)
    }

    /// Registered types, sorted by name.
    pub fn types(&self) -> Vec<ConfigType> {
        let mut types: Vec<ConfigType> = self.entries.iter().map(|e| e.ty).collect();
        types.sort_by_key(|ty| ty.name());
        types
    }
}

impl Default for TypeCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeResolver for TypeCatalog {
    fn resolve(&self, name: &str) -> Option<ConfigType> {
        let mnemonics = self.mnemonics.load();
        let name = mnemonics.get(name).map(String::as_str).unwrap_or(name);
        let id = *self.names.get(name)?;
        self.entries.get(&id).map(|entry| entry.ty)
    }
}

impl InstanceFactory for TypeCatalog {
    fn new_instance(&self, ty: &ConfigType) -> ConfigResult<Instance> {
        let entry = self
            .entries
            .get(&ty.id())
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ConfigError::instantiation(ty.name(), "type is not registered"))?;
        Ok((entry.make)())
    }
}
