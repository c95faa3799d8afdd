//! Configuration sources: file formats, watched roots, aggregation and the
//! optional filesystem trigger.

pub mod aggregator;
pub mod files;
pub mod formats;
pub mod watcher;

pub use aggregator::{
    AggregatorOptions, ConfigSourceAggregator, ConfiguredType, RescanReport, aggregate_trees,
};
pub use files::{ConfigSourceFile, FileStamp, expand_roots};
pub use formats::{FileFormat, FormatSet, Ini, Json, ParseError, ParsedFile, Properties, Yaml};
pub use watcher::{SourceWatcher, WatcherConfig, watch_aggregator, watch_roots};
