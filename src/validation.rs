//! Validators gating property writes.
//!
//! A validator sees the raw incoming value, before any conversion, and
//! answers whether the write may proceed.

use crate::types::ConfigTree;
use serde_json::Value;
use std::fmt;
use std::path::Path;

/// Predicate over the raw incoming value of one property.
pub trait Validator: Send + Sync {
    /// Name reported when the validator rejects a value.
    fn name(&self) -> &str;

    fn validate(&self, value: &ConfigTree) -> bool;
}

/// Rejects an explicit null.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotNull;

impl Validator for NotNull {
    fn name(&self) -> &str {
        "not_null"
    }

    fn validate(&self, value: &ConfigTree) -> bool {
        !value.is_null()
    }
}

/// Rejects null, empty strings, empty arrays or objects, and zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotEmptyNotZero;

impl Validator for NotEmptyNotZero {
    fn name(&self) -> &str {
        "not_empty_not_zero"
    }

    fn validate(&self, value: &ConfigTree) -> bool {
        match value {
            Value::Null => false,
            Value::Bool(_) => true,
            Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
            Value::String(s) => !s.is_empty(),
            Value::Array(items) => !items.is_empty(),
            Value::Object(entries) => !entries.is_empty(),
        }
    }
}

/// Accepts a string naming an existing, listable directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadableDirectory;

impl Validator for ReadableDirectory {
    fn name(&self) -> &str {
        "readable_directory"
    }

    fn validate(&self, value: &ConfigTree) -> bool {
        let Some(path) = value.as_str() else {
            return false;
        };
        let path = Path::new(path);
        path.is_dir() && std::fs::read_dir(path).is_ok()
    }
}

/// Ad-hoc validator built from a function.
pub struct Predicate {
    name: String,
    check: fn(&ConfigTree) -> bool,
}

impl Validator for Predicate {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, value: &ConfigTree) -> bool {
        (self.check)(value)
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Predicate").field("name", &self.name).finish()
    }
}

/// Build a named validator from a plain function.
pub fn predicate(name: impl Into<String>, check: fn(&ConfigTree) -> bool) -> Predicate {
    Predicate {
        name: name.into(),
        check,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_not_null() {
        assert!(!NotNull.validate(&Value::Null));
        assert!(NotNull.validate(&json!(0)));
        assert!(NotNull.validate(&json!("")));
    }

    #[test]
    fn test_not_empty_not_zero() {
        let v = NotEmptyNotZero;
        assert!(!v.validate(&Value::Null));
        assert!(!v.validate(&json!(0)));
        assert!(!v.validate(&json!(0.0)));
        assert!(!v.validate(&json!("")));
        assert!(!v.validate(&json!([])));
        assert!(!v.validate(&json!({})));
        assert!(v.validate(&json!(-1)));
        assert!(v.validate(&json!("x")));
        assert!(v.validate(&json!([0])));
        assert!(v.validate(&json!(false)));
    }

    #[test]
    fn test_readable_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().to_string_lossy().to_string();
        assert!(ReadableDirectory.validate(&json!(path)));

        let file = dir.path().join("f.txt");
        std::fs::write(&file, "x").unwrap();
        assert!(!ReadableDirectory.validate(&json!(file.to_string_lossy())));
        assert!(!ReadableDirectory.validate(&json!(12)));
    }

    #[test]
    fn test_predicate() {
        let positive = predicate("positive", |v| v.as_i64().is_some_and(|n| n > 0));
        assert_eq!(positive.name(), "positive");
        assert!(positive.validate(&json!(3)));
        assert!(!positive.validate(&json!(-3)));
    }
}
