//! Config Sync Library
//!
//! Keeps live objects synchronized with layered configuration files. Types
//! describe their properties once ([`Configurable`]); the [`TypeRegistry`]
//! reconciles instances against configuration trees; the
//! [`ConfigSourceAggregator`] turns watched files into those trees.

pub mod catalog;
pub mod cli;
pub mod descriptor;
pub mod error;
pub mod logging;
pub mod merge;
pub mod reconcile;
pub mod registry;
pub mod sources;
pub mod types;
pub mod validation;

pub use catalog::{InstanceFactory, TypeCatalog, TypeResolver};
pub use descriptor::{Describe, DescribeError, HookKind, PropertyKind, TypeDescriptor};
pub use error::{ConfigError, ConfigResult, ErrorCode};
pub use merge::{NullPolicy, TreeChange, TreeVisitor, compare, merge};
pub use registry::TypeRegistry;
pub use sources::{AggregatorOptions, ConfigSourceAggregator, RescanReport};
pub use types::{ConfigTree, ConfigType, Configurable, Instance, Shared, shared};
pub use validation::Validator;
