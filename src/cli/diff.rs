//! Diff subcommand for config-sync CLI
//!
//! Compares two configuration files, of any supported format, name by name.

use crate::merge::{TreeChange, changes};
use crate::sources::{FormatSet, ParsedFile};
use anyhow::{Context, Result, anyhow};
use clap::Args;
use serde::Serialize;
use serde_json::Value;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Arguments for the diff subcommand
#[derive(Args, Debug)]
pub struct DiffArgs {
    /// Original configuration file
    #[arg(value_name = "FILE")]
    pub source: PathBuf,

    /// Newer configuration file
    #[arg(value_name = "FILE")]
    pub target: PathBuf,

    /// Output format: text (default), json, or summary
    #[arg(short, long, default_value = "text", value_name = "FORMAT")]
    pub format: DiffFormat,
}

/// Output format for diff results
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DiffFormat {
    #[default]
    Text,
    Json,
    Summary,
}

impl std::str::FromStr for DiffFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(DiffFormat::Text),
            "json" => Ok(DiffFormat::Json),
            "summary" => Ok(DiffFormat::Summary),
            _ => Err(format!(
                "Invalid format '{}'. Valid options: text, json, summary",
                s
            )),
        }
    }
}

impl std::fmt::Display for DiffFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiffFormat::Text => write!(f, "text"),
            DiffFormat::Json => write!(f, "json"),
            DiffFormat::Summary => write!(f, "summary"),
        }
    }
}

/// Changes between two files. Locations start with the top-level name.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FileDiff {
    pub changes: Vec<TreeChange>,
}

impl FileDiff {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn render(&self, format: DiffFormat) -> String {
        match format {
            DiffFormat::Json => serde_json::to_string_pretty(self)
                .unwrap_or_else(|e| format!("{{\"error\": \"{}\"}}", e)),
            DiffFormat::Summary => {
                let (mut added, mut removed) = (0, 0);
                for change in &self.changes {
                    match change {
                        TreeChange::MapAdd { .. } | TreeChange::ListAdd { .. } => added += 1,
                        TreeChange::MapRemove { .. } | TreeChange::ListRemove { .. } => {
                            removed += 1
                        }
                    }
                }
                format!("{} additions, {} removals\n", added, removed)
            }
            DiffFormat::Text => {
                let mut out = String::new();
                for change in &self.changes {
                    let _ = match change {
                        TreeChange::MapAdd { value, .. } | TreeChange::ListAdd { value, .. } => {
                            writeln!(out, "+ {} = {}", change.location(), value)
                        }
                        TreeChange::MapRemove { value, .. }
                        | TreeChange::ListRemove { value, .. } => {
                            writeln!(out, "- {} = {}", change.location(), value)
                        }
                    };
                }
                out
            }
        }
    }
}

fn parse_file(path: &Path, formats: &FormatSet) -> Result<ParsedFile> {
    let format = formats
        .for_path(path)
        .ok_or_else(|| anyhow!("Unrecognized configuration file: {}", path.display()))?;
    format
        .parse(path)
        .with_context(|| format!("Can't parse {}", path.display()))
}

/// Compare `source` with `target`. A name present only in `source` is
/// reported as removed.
pub fn diff_files(source: &Path, target: &Path, formats: &FormatSet) -> Result<FileDiff> {
    let old = parse_file(source, formats)?;
    let new = parse_file(target, formats)?;

    let mut found = Vec::new();
    for (name, tree) in &old {
        if !new.contains_key(name) {
            found.push(TreeChange::MapRemove {
                path: Vec::new(),
                key: name.clone(),
                value: tree.clone(),
            });
        }
    }

    let old_root = Value::Object(old.into_iter().collect());
    let new_root = Value::Object(new.into_iter().collect());
    found.extend(changes(&old_root, &new_root)?);
    Ok(FileDiff { changes: found })
}
