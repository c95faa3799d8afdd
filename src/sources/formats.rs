//! File-format collaborators.
//!
//! Every format turns one file into a mapping from type name (or mnemonic)
//! to a configuration sub-tree. Top-level values must be objects.
//!
//! | Format | Extensions | Layout |
//! |---|---|---|
//! | YAML | `.yml`, `.yaml` | `name:` then indented properties, `---` separated overlays |
//! | JSON | `.json` | `{"name": {...}}` |
//! | INI | `.ini`, `.conf` | `[name]` then `key = value` |
//! | Properties | `.properties`, `.property` | `name.key=value` |

use crate::merge::{self, NullPolicy, TreeError};
use crate::reconcile::kind_of;
use crate::types::ConfigTree;
use regex_lite::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use thiserror::Error;

/// Parsed file content: name or mnemonic to object sub-tree.
pub type ParsedFile = BTreeMap<String, ConfigTree>;

/// Why a file couldn't be parsed. The whole file is rejected.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("can't read file: {0}")]
    Io(#[from] std::io::Error),
    #[error("lines starting with a tab: {lines:?}")]
    TabIndentation { lines: Vec<usize> },
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("document must be a mapping, found {0}")]
    NotAMapping(&'static str),
    #[error("value for '{name}' must be a tree, found {found}")]
    NotATree { name: String, found: &'static str },
    #[error("line {line}: {reason}")]
    Syntax { line: usize, reason: String },
    #[error("can't overlay documents: {0}")]
    Merge(#[from] TreeError),
}

/// One supported configuration file format.
pub trait FileFormat: Send + Sync {
    fn name(&self) -> &'static str;

    /// Recognized extensions, lowercase, with the leading dot.
    fn extensions(&self) -> &'static [&'static str];

    fn parse_str(&self, content: &str) -> Result<ParsedFile, ParseError>;

    fn parse(&self, path: &Path) -> Result<ParsedFile, ParseError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_str(&content)
    }
}

/// Split a top-level object into named sub-trees, rejecting non-objects.
fn into_parsed(root: Value) -> Result<ParsedFile, ParseError> {
    let entries = match root {
        Value::Object(entries) => entries,
        Value::Null => return Ok(ParsedFile::new()),
        other => return Err(ParseError::NotAMapping(kind_of(&other))),
    };
    let mut parsed = ParsedFile::new();
    for (name, tree) in entries {
        if !tree.is_object() {
            return Err(ParseError::NotATree {
                name,
                found: kind_of(&tree),
            });
        }
        parsed.insert(name, tree);
    }
    Ok(parsed)
}

/// Scalar values in INI and properties files: JSON when it parses, text otherwise.
fn scalar(raw: &str) -> Value {
    let raw = raw.trim();
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn is_comment(line: &str) -> bool {
    line.is_empty() || line.starts_with('#') || line.starts_with(';') || line.starts_with('!')
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Yaml;

impl FileFormat for Yaml {
    fn name(&self) -> &'static str {
        "yaml"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &[".yml", ".yaml"]
    }

    fn parse_str(&self, content: &str) -> Result<ParsedFile, ParseError> {
        let tabbed: Vec<usize> = content
            .lines()
            .enumerate()
            .filter(|(_, line)| line.starts_with('\t'))
            .map(|(index, _)| index + 1)
            .collect();
        if !tabbed.is_empty() {
            return Err(ParseError::TabIndentation { lines: tabbed });
        }

        // Later documents overlay earlier ones.
        let mut root = Value::Object(Map::new());
        for document in serde_yaml::Deserializer::from_str(content) {
            let value = Value::deserialize(document)?;
            match value {
                Value::Null => continue,
                Value::Object(_) => merge::merge(&mut root, &value, NullPolicy::Keep)?,
                other => return Err(ParseError::NotAMapping(kind_of(&other))),
            }
        }
        into_parsed(root)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Json;

impl FileFormat for Json {
    fn name(&self) -> &'static str {
        "json"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &[".json"]
    }

    fn parse_str(&self, content: &str) -> Result<ParsedFile, ParseError> {
        let root: Value = serde_json::from_str(content)?;
        if root.is_null() {
            return Err(ParseError::NotAMapping("null"));
        }
        into_parsed(root)
    }
}

static INI_SECTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[\s*([^\]]+?)\s*\]$").expect("INI section pattern is valid")
});

static INI_ENTRY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([^=:]+?)\s*[=:]\s*(.*)$").expect("INI entry pattern is valid")
});

#[derive(Debug, Clone, Copy, Default)]
pub struct Ini;

impl FileFormat for Ini {
    fn name(&self) -> &'static str {
        "ini"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &[".ini", ".conf"]
    }

    fn parse_str(&self, content: &str) -> Result<ParsedFile, ParseError> {
        let mut sections: BTreeMap<String, Map<String, Value>> = BTreeMap::new();
        let mut current: Option<String> = None;

        for (index, line) in content.lines().enumerate() {
            let line = line.trim();
            if is_comment(line) {
                continue;
            }
            if let Some(caps) = INI_SECTION.captures(line) {
                let name = caps[1].to_string();
                sections.entry(name.clone()).or_default();
                current = Some(name);
                continue;
            }
            let Some(caps) = INI_ENTRY.captures(line) else {
                return Err(ParseError::Syntax {
                    line: index + 1,
                    reason: format!("expected [section] or key = value, found '{}'", line),
                });
            };
            let Some(section) = current.as_ref() else {
                return Err(ParseError::Syntax {
                    line: index + 1,
                    reason: "entry outside of any [section]".to_string(),
                });
            };
            sections
                .entry(section.clone())
                .or_default()
                .insert(caps[1].trim().to_string(), scalar(&caps[2]));
        }

        Ok(sections
            .into_iter()
            .map(|(name, entries)| (name, Value::Object(entries)))
            .collect())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Properties;

impl Properties {
    /// Split `name.with.dots.field` on its last dot.
    fn split_key(key: &str) -> Option<(&str, &str)> {
        let dot = key.rfind('.')?;
        if dot == 0 || dot + 1 == key.len() {
            return None;
        }
        Some((&key[..dot], &key[dot + 1..]))
    }
}

/// First `=` or single `:` in `line`. A `::` path separator is part of the key.
fn separator(line: &str) -> Option<usize> {
    let bytes = line.as_bytes();
    (0..bytes.len()).find(|&i| match bytes[i] {
        b'=' => true,
        b':' => bytes.get(i + 1) != Some(&b':') && (i == 0 || bytes[i - 1] != b':'),
        _ => false,
    })
}

/// Parse `key=value` / `key: value` lines, skipping comments. Shared with
/// the mnemonic table loader.
pub(crate) fn key_value_lines(content: &str) -> Result<Vec<(usize, String, String)>, ParseError> {
    let mut entries = Vec::new();
    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if is_comment(line) {
            continue;
        }
        let Some(split) = separator(line) else {
            return Err(ParseError::Syntax {
                line: index + 1,
                reason: format!("expected key=value, found '{}'", line),
            });
        };
        let key = line[..split].trim();
        let value = line[split + 1..].trim();
        entries.push((index + 1, key.to_string(), value.to_string()));
    }
    Ok(entries)
}

impl FileFormat for Properties {
    fn name(&self) -> &'static str {
        "properties"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &[".properties", ".property"]
    }

    fn parse_str(&self, content: &str) -> Result<ParsedFile, ParseError> {
        let mut grouped: BTreeMap<String, Map<String, Value>> = BTreeMap::new();
        for (line, key, value) in key_value_lines(content)? {
            let Some((name, field)) = Properties::split_key(&key) else {
                return Err(ParseError::Syntax {
                    line,
                    reason: format!("key '{}' must look like name.field", key),
                });
            };
            grouped
                .entry(name.to_string())
                .or_default()
                .insert(field.to_string(), scalar(&value));
        }
        Ok(grouped
            .into_iter()
            .map(|(name, entries)| (name, Value::Object(entries)))
            .collect())
    }
}

/// The set of formats the aggregator recognizes.
#[derive(Clone)]
pub struct FormatSet {
    formats: Vec<Arc<dyn FileFormat>>,
}

impl FormatSet {
    /// No formats; add some with [`FormatSet::with`].
    pub fn empty() -> Self {
        Self {
            formats: Vec::new(),
        }
    }

    /// YAML, JSON, INI and properties.
    pub fn all() -> Self {
        Self::empty()
            .with(Yaml)
            .with(Json)
            .with(Ini)
            .with(Properties)
    }

    pub fn with(mut self, format: impl FileFormat + 'static) -> Self {
        self.formats.push(Arc::new(format));
        self
    }

    /// Format handling `path`, by case-insensitive extension.
    pub fn for_path(&self, path: &Path) -> Option<&dyn FileFormat> {
        let extension = format!(
            ".{}",
            path.extension()?.to_string_lossy().to_ascii_lowercase()
        );
        self.formats
            .iter()
            .find(|f| f.extensions().contains(&extension.as_str()))
            .map(|f| f.as_ref())
    }

    pub fn recognizes(&self, path: &Path) -> bool {
        self.for_path(path).is_some()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.formats.iter().map(|f| f.name()).collect()
    }
}

impl Default for FormatSet {
    fn default() -> Self {
        Self::all()
    }
}

impl fmt::Debug for FormatSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FormatSet").field(&self.names()).finish()
    }
}
