//! Named logger handed to each engine component.
//!
//! Components never log through a process-wide name: they receive a `Logger`
//! in their constructor, and every event it emits through `tracing` carries
//! the logger's name as the `logger` field. The minimum level is held in a
//! shared atomic filter so it can be adjusted while rescans are running.

use std::sync::{
    Arc,
    atomic::{AtomicU8, Ordering},
};
use tracing::Level;

/// Severity of a log message, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
}

/// Atomic level filter shared between loggers.
pub struct LogLevelFilter(AtomicU8);

impl LogLevelFilter {
    /// Create a new filter with the given minimum level.
    pub fn new(level: LogLevel) -> Self {
        Self(AtomicU8::new(level_to_u8(level)))
    }

    /// Get the current minimum level.
    pub fn get(&self) -> LogLevel {
        u8_to_level(self.0.load(Ordering::Relaxed))
    }

    /// Set the minimum level.
    pub fn set(&self, level: LogLevel) {
        self.0.store(level_to_u8(level), Ordering::Relaxed);
    }

    /// Check if a message at the given level should be logged.
    pub fn should_log(&self, level: LogLevel) -> bool {
        level_to_u8(level) >= self.0.load(Ordering::Relaxed)
    }
}

impl Default for LogLevelFilter {
    fn default() -> Self {
        Self::new(LogLevel::Trace)
    }
}

fn level_to_u8(level: LogLevel) -> u8 {
    match level {
        LogLevel::Trace => 0,
        LogLevel::Debug => 1,
        LogLevel::Info => 2,
        LogLevel::Warning => 3,
        LogLevel::Error => 4,
    }
}

fn u8_to_level(val: u8) -> LogLevel {
    match val {
        0 => LogLevel::Trace,
        1 => LogLevel::Debug,
        2 => LogLevel::Info,
        3 => LogLevel::Warning,
        _ => LogLevel::Error,
    }
}

/// Convert a LogLevel to the tracing Level it is emitted at.
pub fn log_level_to_tracing(level: LogLevel) -> Level {
    match level {
        LogLevel::Trace => Level::TRACE,
        LogLevel::Debug => Level::DEBUG,
        LogLevel::Info => Level::INFO,
        LogLevel::Warning => Level::WARN,
        LogLevel::Error => Level::ERROR,
    }
}

/// Named logger emitting through `tracing`.
#[derive(Clone)]
pub struct Logger {
    level_filter: Arc<LogLevelFilter>,
    name: Option<String>,
}

impl Logger {
    /// Create a new unnamed logger that lets everything through.
    pub fn new() -> Self {
        Self {
            level_filter: Arc::new(LogLevelFilter::default()),
            name: None,
        }
    }

    /// Set the level filter.
    pub fn with_level_filter(mut self, filter: Arc<LogLevelFilter>) -> Self {
        self.level_filter = filter;
        self
    }

    /// Set the logger name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Derive a child logger sharing this one's filter, named `parent.child`.
    pub fn child(&self, name: &str) -> Self {
        let name = match &self.name {
            Some(parent) => format!("{}.{}", parent, name),
            None => name.to_string(),
        };
        Self {
            level_filter: Arc::clone(&self.level_filter),
            name: Some(name),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Check whether a message at `level` would be emitted.
    pub fn enabled(&self, level: LogLevel) -> bool {
        self.level_filter.should_log(level)
    }

    /// Log a message.
    pub fn log(&self, level: LogLevel, message: &str) {
        if !self.level_filter.should_log(level) {
            return;
        }

        let name = self.name.as_deref().unwrap_or("config_sync");
        match level {
            LogLevel::Error => tracing::error!(logger = %name, "{}", message),
            LogLevel::Warning => tracing::warn!(logger = %name, "{}", message),
            LogLevel::Info => tracing::info!(logger = %name, "{}", message),
            LogLevel::Debug => tracing::debug!(logger = %name, "{}", message),
            LogLevel::Trace => tracing::trace!(logger = %name, "{}", message),
        }
    }

    pub fn trace(&self, msg: &str) {
        self.log(LogLevel::Trace, msg);
    }

    pub fn debug(&self, msg: &str) {
        self.log(LogLevel::Debug, msg);
    }

    pub fn info(&self, msg: &str) {
        self.log(LogLevel::Info, msg);
    }

    pub fn warning(&self, msg: &str) {
        self.log(LogLevel::Warning, msg);
    }

    pub fn error(&self, msg: &str) {
        self.log(LogLevel::Error, msg);
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_filter() {
        let filter = LogLevelFilter::new(LogLevel::Warning);

        assert!(!filter.should_log(LogLevel::Trace));
        assert!(!filter.should_log(LogLevel::Debug));
        assert!(!filter.should_log(LogLevel::Info));

        assert!(filter.should_log(LogLevel::Warning));
        assert!(filter.should_log(LogLevel::Error));
    }

    #[test]
    fn test_level_filter_update_is_shared() {
        let filter = Arc::new(LogLevelFilter::new(LogLevel::Debug));
        let logger = Logger::new().with_level_filter(Arc::clone(&filter));
        assert!(logger.enabled(LogLevel::Debug));

        filter.set(LogLevel::Error);
        assert!(!logger.enabled(LogLevel::Warning));
        assert!(logger.child("x").enabled(LogLevel::Error));
    }

    #[test]
    fn test_child_names() {
        let root = Logger::new().with_name("sync");
        assert_eq!(root.child("registry").name(), Some("sync.registry"));
        assert_eq!(Logger::new().child("registry").name(), Some("registry"));
    }

    #[test]
    fn test_log_level_to_tracing() {
        assert_eq!(log_level_to_tracing(LogLevel::Trace), Level::TRACE);
        assert_eq!(log_level_to_tracing(LogLevel::Warning), Level::WARN);
        assert_eq!(log_level_to_tracing(LogLevel::Error), Level::ERROR);
    }

    #[test]
    fn test_level_roundtrip() {
        for level in [
            LogLevel::Trace,
            LogLevel::Debug,
            LogLevel::Info,
            LogLevel::Warning,
            LogLevel::Error,
        ] {
            let filter = LogLevelFilter::new(level);
            assert_eq!(filter.get(), level);
        }
    }
}
