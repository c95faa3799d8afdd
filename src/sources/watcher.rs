//! Debounced filesystem trigger for rescans.
//!
//! The engine never decides when to rescan; this watcher is one possible
//! driver. It watches each root non-recursively and hands the batch of
//! changed configuration paths to a callback on its own thread.
//! [`watch_aggregator`] wires that callback to
//! [`ConfigSourceAggregator::rescan`].

use super::aggregator::ConfigSourceAggregator;
use super::formats::FormatSet;
use crate::logging::Logger;
use notify_debouncer_mini::{DebouncedEventKind, Debouncer, new_debouncer};
use std::path::{Path, PathBuf};
use std::sync::{Arc, mpsc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Configuration for the file watcher.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Debounce duration for coalescing rapid changes.
    pub debounce_duration: Duration,
    /// Only paths with a recognized extension trigger the callback.
    pub formats: FormatSet,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce_duration: Duration::from_millis(500),
            formats: FormatSet::all(),
        }
    }
}

/// Running watcher. Dropping it stops watching and ends the callback thread.
pub struct SourceWatcher {
    debouncer: Option<Debouncer<notify::RecommendedWatcher>>,
    thread: Option<JoinHandle<()>>,
}

impl SourceWatcher {
    /// Stop watching and wait for the callback thread to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Dropping the debouncer closes the channel the thread reads from.
        self.debouncer.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SourceWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Start watching `roots`, calling `on_change` with each debounced batch of
/// changed configuration files.
pub fn watch_roots<F>(
    roots: &[PathBuf],
    config: WatcherConfig,
    logger: Logger,
    mut on_change: F,
) -> Result<SourceWatcher, notify::Error>
where
    F: FnMut(Vec<PathBuf>) + Send + 'static,
{
    let (notify_tx, notify_rx) = mpsc::channel();
    let mut debouncer = new_debouncer(config.debounce_duration, notify_tx)?;

    let watcher = debouncer.watcher();
    for root in roots {
        if root.exists() {
            logger.info(&format!("Watching {}", root.display()));
            watcher.watch(root, notify::RecursiveMode::NonRecursive)?;
        } else {
            logger.warning(&format!(
                "Root does not exist, skipping watch: {}",
                root.display()
            ));
        }
    }

    let formats = config.formats;
    let thread = thread::spawn(move || {
        loop {
            match notify_rx.recv() {
                Ok(Ok(events)) => {
                    let changed = relevant_paths(
                        events
                            .into_iter()
                            .filter(|e| {
                                matches!(
                                    e.kind,
                                    DebouncedEventKind::Any | DebouncedEventKind::AnyContinuous
                                )
                            })
                            .map(|e| e.path),
                        &formats,
                    );
                    if changed.is_empty() {
                        continue;
                    }
                    logger.debug(&format!("{} configuration files changed", changed.len()));
                    on_change(changed);
                }
                Ok(Err(e)) => logger.error(&format!("File watcher error: {}", e)),
                Err(_) => {
                    logger.debug("Watcher channel closed, stopping");
                    return;
                }
            }
        }
    });

    Ok(SourceWatcher {
        debouncer: Some(debouncer),
        thread: Some(thread),
    })
}

/// Rescan `aggregator` after every debounced batch of changes under the
/// roots it has when this is called.
pub fn watch_aggregator(
    aggregator: Arc<ConfigSourceAggregator>,
    config: WatcherConfig,
    logger: Logger,
) -> Result<SourceWatcher, notify::Error> {
    let roots = aggregator.roots();
    let rescan_logger = logger.clone();
    watch_roots(&roots, config, logger, move |changed| {
        rescan_logger.debug(&format!("Rescanning after {} changed files", changed.len()));
        let report = aggregator.rescan();
        for (path, error) in &report.files_failed {
            rescan_logger.warning(&format!("{} kept its last good state: {}", path.display(), error));
        }
    })
}

fn is_relevant(path: &Path, formats: &FormatSet) -> bool {
    let hidden = path
        .file_name()
        .map(|n| n.to_string_lossy().starts_with('.'))
        .unwrap_or(true);
    !hidden && formats.recognizes(path)
}

/// Keep configuration files, de-duplicated.
fn relevant_paths(changed: impl IntoIterator<Item = PathBuf>, formats: &FormatSet) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = Vec::new();
    for path in changed {
        if is_relevant(&path, formats) && !paths.contains(&path) {
            paths.push(path);
        }
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(path: &str) -> PathBuf {
        PathBuf::from(path)
    }

    #[test]
    fn test_relevant_paths_filters_and_dedups() {
        let events = vec![
            event("conf/car.yaml"),
            event("conf/car.yaml"),
            event("conf/.car.yaml.swp"),
            event("conf/.hidden.json"),
            event("conf/readme.md"),
            event("conf/wheels.INI"),
        ];
        let paths = relevant_paths(events, &FormatSet::all());
        assert_eq!(
            paths,
            vec![PathBuf::from("conf/car.yaml"), PathBuf::from("conf/wheels.INI")]
        );
    }

    #[test]
    fn test_watcher_stops_cleanly() {
        let temp = tempfile::TempDir::new().unwrap();
        let watcher = watch_roots(
            &[temp.path().to_path_buf()],
            WatcherConfig::default(),
            Logger::new(),
            |_| {},
        )
        .unwrap();
        watcher.stop();
    }

    #[test]
    fn test_watch_aggregator_stops_cleanly() {
        use crate::catalog::TypeCatalog;
        use crate::registry::TypeRegistry;
        use crate::sources::AggregatorOptions;

        let temp = tempfile::TempDir::new().unwrap();
        let catalog = Arc::new(TypeCatalog::new());
        let registry = Arc::new(TypeRegistry::new(catalog.clone(), Logger::new()));
        let aggregator = Arc::new(ConfigSourceAggregator::new(
            registry,
            catalog,
            AggregatorOptions::default(),
            Logger::new(),
        ));
        aggregator.add_root(temp.path());

        let watcher =
            watch_aggregator(Arc::clone(&aggregator), WatcherConfig::default(), Logger::new())
                .unwrap();
        watcher.stop();
        assert_eq!(Arc::strong_count(&aggregator), 1);
    }
}
