//! Check subcommand for config-sync CLI
//!
//! Reads every configuration file under a set of roots and reports the merged
//! tree per top-level name, the way the aggregator would see it.

use crate::logging::Logger;
use crate::sources::{ConfigSourceFile, FileStamp, FormatSet, aggregate_trees, expand_roots};
use crate::types::ConfigTree;
use clap::Args;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Arguments for the check and watch subcommands
#[derive(Args, Debug, Clone)]
pub struct CheckArgs {
    /// Files or directories to read (directories are not descended into)
    #[arg(value_name = "PATH", required = true)]
    pub paths: Vec<PathBuf>,

    /// Output format: text (default) or json
    #[arg(short, long, default_value = "text", value_name = "FORMAT")]
    pub format: OutputFormat,
}

/// Output format for check results
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Invalid format '{}'. Valid options: text, json", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

/// Merged configuration for one top-level name.
#[derive(Debug, Clone, Serialize)]
pub struct NameSummary {
    /// Files naming it, in merge order.
    pub sources: Vec<PathBuf>,
    pub tree: ConfigTree,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileFailure {
    pub path: PathBuf,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckReport {
    pub files: Vec<PathBuf>,
    pub names: BTreeMap<String, NameSummary>,
    pub failures: Vec<FileFailure>,
}

impl CheckReport {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn render(&self, format: OutputFormat) -> String {
        match format {
            OutputFormat::Json => {
                serde_json::to_string_pretty(self).unwrap_or_else(|e| format!("{{\"error\": \"{}\"}}", e))
            }
            OutputFormat::Text => self.render_text(),
        }
    }

    fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{} files read", self.files.len());
        for path in &self.files {
            match FileStamp::read(path) {
                Ok(stamp) => {
                    let _ = writeln!(out, "  {} ({})", path.display(), stamp);
                }
                Err(_) => {
                    let _ = writeln!(out, "  {}", path.display());
                }
            }
        }

        for (name, summary) in &self.names {
            let sources: Vec<String> = summary
                .sources
                .iter()
                .map(|p| {
                    p.file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_else(|| p.display().to_string())
                })
                .collect();
            let _ = writeln!(out, "\n[{}] from {}", name, sources.join(", "));
            let _ = writeln!(
                out,
                "{}",
                serde_json::to_string_pretty(&summary.tree).unwrap_or_default()
            );
        }

        if !self.failures.is_empty() {
            let _ = writeln!(out);
            for failure in &self.failures {
                let _ = writeln!(out, "FAILED {}: {}", failure.path.display(), failure.error);
            }
        }
        out
    }
}

/// Parse every file under `roots` and merge sub-trees per name, mapping
/// mnemonics to their full names first. Files are read and merged the way
/// the aggregator does it, without resolving names to types.
pub fn run_check(
    roots: &[PathBuf],
    formats: &FormatSet,
    mnemonics: &HashMap<String, String>,
    logger: &Logger,
) -> CheckReport {
    let mut report = CheckReport::default();
    let mut files: Vec<ConfigSourceFile> = Vec::new();

    for path in expand_roots(roots, formats, logger) {
        let Some(format) = formats.for_path(&path) else {
            continue;
        };
        let mut file = ConfigSourceFile::new(&path);
        match file.refresh(format) {
            Ok(()) => {
                report.files.push(path);
                files.push(file);
            }
            Err(e) => {
                logger.error(&format!("Can't parse {}: {}", path.display(), e));
                report.failures.push(FileFailure {
                    path,
                    error: e.to_string(),
                });
            }
        }
    }

    let mut contributions: BTreeMap<String, Vec<(&Path, &ConfigTree)>> = BTreeMap::new();
    for file in &files {
        for (name, tree) in file.entries() {
            let name = mnemonics.get(name).unwrap_or(name);
            contributions
                .entry(name.clone())
                .or_default()
                .push((file.path(), tree));
        }
    }

    for (name, trees) in contributions {
        match aggregate_trees(trees.iter().map(|(_, tree)| *tree)) {
            Ok(tree) => {
                let sources = trees.iter().map(|(path, _)| path.to_path_buf()).collect();
                report.names.insert(name, NameSummary { sources, tree });
            }
            Err(e) => report.failures.push(FileFailure {
                path: trees
                    .last()
                    .map(|(path, _)| path.to_path_buf())
                    .unwrap_or_default(),
                error: format!("{}: {}", name, e),
            }),
        }
    }
    report
}
