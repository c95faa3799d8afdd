//! Structural diff and in-place merge for configuration trees.
//!
//! `compare` walks two trees and reports what would have to change in the
//! original to obtain the newer one, through a [`TreeVisitor`]. Objects are
//! compared key by key and recursively; arrays are never diffed positionally
//! here: a newer array replaces the original one wholesale (every original
//! element is reported removed, highest index first, then every newer element
//! is reported added). Positional list reconciliation lives in `reconcile`.
//!
//! `merge` applies those reports to the original tree, with an explicit
//! [`NullPolicy`] deciding whether nulls are written as values or delete keys.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Shape violations detected while comparing two trees.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error("can't compare from a null tree")]
    NullOriginal,
    #[error("can't compare from a primitive value")]
    PrimitiveOriginal,
    #[error("can't put {found} in place of an object at '{path}'")]
    ObjectReplaced { path: String, found: &'static str },
    #[error("can't put an object in place of an array at '{path}'")]
    ArrayReplacedByObject { path: String },
    #[error("no container to update at '{path}'")]
    MissingContainer { path: String },
}

/// What `merge` does with explicit nulls found in the newer tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NullPolicy {
    /// Write null as a real value, keeping "explicitly nulled" distinct from "absent".
    #[default]
    Keep,
    /// Delete the key instead of writing null.
    Remove,
}

/// Receives the changes found by [`compare`].
///
/// `path` is the chain of object keys leading to the container being changed
/// (empty for the root).
pub trait TreeVisitor {
    fn map_add(&mut self, path: &[String], key: &str, value: &Value);
    fn map_remove(&mut self, path: &[String], key: &str, value: &Value);
    fn list_add(&mut self, path: &[String], value: &Value);
    fn list_remove(&mut self, path: &[String], index: usize, value: &Value);
}

/// A single change reported by [`compare`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TreeChange {
    /// Key added to, or replaced in, an object. `value` may be null for keys
    /// that only exist in the newer tree.
    MapAdd {
        path: Vec<String>,
        key: String,
        value: Value,
    },
    /// Key nulled in the newer tree. `value` is the value being removed.
    MapRemove {
        path: Vec<String>,
        key: String,
        value: Value,
    },
    /// Element appended to an array.
    ListAdd { path: Vec<String>, value: Value },
    /// Element removed from an array.
    ListRemove {
        path: Vec<String>,
        index: usize,
        value: Value,
    },
}

impl TreeChange {
    /// Dotted location of the changed entry, for display.
    pub fn location(&self) -> String {
        let (path, leaf) = match self {
            TreeChange::MapAdd { path, key, .. } | TreeChange::MapRemove { path, key, .. } => {
                (path, key.clone())
            }
            TreeChange::ListAdd { path, .. } => (path, "[+]".to_string()),
            TreeChange::ListRemove { path, index, .. } => (path, format!("[{}]", index)),
        };
        let mut parts: Vec<String> = path.clone();
        parts.push(leaf);
        parts.join(".")
    }
}

impl TreeVisitor for Vec<TreeChange> {
    fn map_add(&mut self, path: &[String], key: &str, value: &Value) {
        self.push(TreeChange::MapAdd {
            path: path.to_vec(),
            key: key.to_string(),
            value: value.clone(),
        });
    }

    fn map_remove(&mut self, path: &[String], key: &str, value: &Value) {
        self.push(TreeChange::MapRemove {
            path: path.to_vec(),
            key: key.to_string(),
            value: value.clone(),
        });
    }

    fn list_add(&mut self, path: &[String], value: &Value) {
        self.push(TreeChange::ListAdd {
            path: path.to_vec(),
            value: value.clone(),
        });
    }

    fn list_remove(&mut self, path: &[String], index: usize, value: &Value) {
        self.push(TreeChange::ListRemove {
            path: path.to_vec(),
            index,
            value: value.clone(),
        });
    }
}

/// Compare `original` with `newer`, reporting differences to `visitor`.
///
/// Neither tree is modified.
pub fn compare<V: TreeVisitor + ?Sized>(
    original: &Value,
    newer: &Value,
    visitor: &mut V,
) -> Result<(), TreeError> {
    let mut path = Vec::new();
    compare_at(&mut path, original, newer, visitor)
}

/// Collect the changes between two trees.
pub fn changes(original: &Value, newer: &Value) -> Result<Vec<TreeChange>, TreeError> {
    let mut found = Vec::new();
    compare(original, newer, &mut found)?;
    Ok(found)
}

fn compare_at<V: TreeVisitor + ?Sized>(
    path: &mut Vec<String>,
    original: &Value,
    newer: &Value,
    visitor: &mut V,
) -> Result<(), TreeError> {
    match original {
        Value::Null => Err(TreeError::NullOriginal),
        Value::Bool(_) | Value::Number(_) | Value::String(_) => Err(TreeError::PrimitiveOriginal),
        Value::Object(current) => match newer {
            Value::Object(newer_map) => {
                for (key, current_value) in current {
                    let Some(newer_value) = newer_map.get(key) else {
                        continue;
                    };
                    match (current_value, newer_value) {
                        (_, Value::Null) => visitor.map_remove(path, key, current_value),
                        (a, b) if a == b => {}
                        (Value::Object(_), Value::Object(_)) | (Value::Array(_), Value::Array(_)) => {
                            path.push(key.clone());
                            compare_at(path, current_value, newer_value, visitor)?;
                            path.pop();
                        }
                        _ => visitor.map_add(path, key, newer_value),
                    }
                }
                for (key, newer_value) in newer_map {
                    if !current.contains_key(key) {
                        visitor.map_add(path, key, newer_value);
                    }
                }
                Ok(())
            }
            Value::Null => {
                for (key, current_value) in current {
                    visitor.map_remove(path, key, current_value);
                }
                Ok(())
            }
            Value::Array(_) => Err(TreeError::ObjectReplaced {
                path: path.join("."),
                found: "an array",
            }),
            _ => Err(TreeError::ObjectReplaced {
                path: path.join("."),
                found: "a primitive",
            }),
        },
        Value::Array(items) => {
            match newer {
                Value::Object(_) => {
                    return Err(TreeError::ArrayReplacedByObject {
                        path: path.join("."),
                    });
                }
                _ => {
                    for (index, item) in items.iter().enumerate().rev() {
                        visitor.list_remove(path, index, item);
                    }
                }
            }
            match newer {
                Value::Array(newer_items) => {
                    for item in newer_items {
                        visitor.list_add(path, item);
                    }
                }
                Value::Null => {}
                primitive => visitor.list_add(path, primitive),
            }
            Ok(())
        }
    }
}

/// Merge `newer` into `current` in place.
///
/// `current` must be an object or an array.
pub fn merge(current: &mut Value, newer: &Value, policy: NullPolicy) -> Result<(), TreeError> {
    let found = changes(current, newer)?;
    for change in found {
        apply(current, change, policy)?;
    }
    Ok(())
}

/// Fold `values` into a fresh object, later values winning.
pub fn merge_all<'a>(
    values: impl IntoIterator<Item = &'a Value>,
    policy: NullPolicy,
) -> Result<Value, TreeError> {
    let mut merged = Value::Object(Default::default());
    for value in values {
        merge(&mut merged, value, policy)?;
    }
    Ok(merged)
}

fn container_at<'a>(root: &'a mut Value, path: &[String]) -> Result<&'a mut Value, TreeError> {
    let mut node = root;
    for key in path {
        node = match node.get_mut(key.as_str()) {
            Some(child) => child,
            None => {
                return Err(TreeError::MissingContainer {
                    path: path.join("."),
                });
            }
        };
    }
    Ok(node)
}

fn apply(root: &mut Value, change: TreeChange, policy: NullPolicy) -> Result<(), TreeError> {
    match change {
        TreeChange::MapAdd { path, key, value } => {
            if value.is_null() && policy == NullPolicy::Remove {
                return Ok(());
            }
            object_at(root, &path)?.insert(key, value);
        }
        TreeChange::MapRemove { path, key, .. } => {
            let map = object_at(root, &path)?;
            match policy {
                NullPolicy::Keep => {
                    map.insert(key, Value::Null);
                }
                NullPolicy::Remove => {
                    map.remove(&key);
                }
            }
        }
        TreeChange::ListAdd { path, value } => array_at(root, &path)?.push(value),
        TreeChange::ListRemove { path, index, .. } => {
            let list = array_at(root, &path)?;
            if index < list.len() {
                list.remove(index);
            }
        }
    }
    Ok(())
}

fn object_at<'a>(
    root: &'a mut Value,
    path: &[String],
) -> Result<&'a mut serde_json::Map<String, Value>, TreeError> {
    container_at(root, path)?
        .as_object_mut()
        .ok_or_else(|| TreeError::MissingContainer {
            path: path.join("."),
        })
}

fn array_at<'a>(root: &'a mut Value, path: &[String]) -> Result<&'a mut Vec<Value>, TreeError> {
    container_at(root, path)?
        .as_array_mut()
        .ok_or_else(|| TreeError::MissingContainer {
            path: path.join("."),
        })
}
