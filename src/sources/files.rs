//! Watched-root expansion and per-file state.

use super::formats::{FileFormat, FormatSet, ParseError, ParsedFile};
use crate::logging::Logger;
use chrono::{DateTime, Local};
use std::collections::HashSet;
use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Modification time and size, compared to detect changed files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    pub modified: SystemTime,
    pub len: u64,
}

impl FileStamp {
    pub fn read(path: &Path) -> io::Result<Self> {
        let metadata = fs::metadata(path)?;
        Ok(Self {
            modified: metadata.modified()?,
            len: metadata.len(),
        })
    }
}

impl fmt::Display for FileStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let modified: DateTime<Local> = self.modified.into();
        write!(
            f,
            "{} bytes, modified {}",
            self.len,
            modified.format("%Y-%m-%d %H:%M:%S")
        )
    }
}

/// A configuration file known to the aggregator.
#[derive(Debug, Clone)]
pub struct ConfigSourceFile {
    path: PathBuf,
    stamp: Option<FileStamp>,
    entries: ParsedFile,
}

impl ConfigSourceFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            stamp: None,
            entries: ParsedFile::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stamp(&self) -> Option<FileStamp> {
        self.stamp
    }

    /// Sub-trees from the last successful parse, keyed by the names used in
    /// the file (type names or mnemonics).
    pub fn entries(&self) -> &ParsedFile {
        &self.entries
    }

    /// Whether the file changed on disk since it was last read.
    pub fn is_stale(&self) -> bool {
        match FileStamp::read(&self.path) {
            Ok(current) => self.stamp != Some(current),
            Err(_) => true,
        }
    }

    /// Re-read the file. The stamp is always recorded; the entries are only
    /// replaced when parsing succeeds.
    pub fn refresh(&mut self, format: &dyn FileFormat) -> Result<(), ParseError> {
        self.stamp = Some(FileStamp::read(&self.path)?);
        self.entries = format.parse(&self.path)?;
        Ok(())
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().starts_with('.'))
        .unwrap_or(true)
}

/// Whether `path` is a file the aggregator should read.
fn is_candidate(path: &Path, formats: &FormatSet) -> bool {
    if is_hidden(path) || !formats.recognizes(path) {
        return false;
    }
    match fs::metadata(path) {
        Ok(metadata) => metadata.is_file() && metadata.len() > 0 && File::open(path).is_ok(),
        Err(_) => false,
    }
}

/// Expand roots into canonical, de-duplicated candidate files.
///
/// A root is either a file or a directory whose direct children are
/// considered; subdirectories are not visited. Order follows the roots,
/// then file name within a directory.
pub fn expand_roots(roots: &[PathBuf], formats: &FormatSet, logger: &Logger) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut files = Vec::new();

    for root in roots {
        let mut candidates = Vec::new();
        if root.is_dir() {
            match fs::read_dir(root) {
                Ok(entries) => {
                    candidates.extend(entries.flatten().map(|entry| entry.path()));
                    candidates.sort();
                }
                Err(e) => {
                    logger.warning(&format!("Can't list {}: {}", root.display(), e));
                    continue;
                }
            }
        } else if root.exists() {
            candidates.push(root.clone());
        } else {
            logger.debug(&format!("Root {} does not exist", root.display()));
            continue;
        }

        for candidate in candidates {
            if !is_candidate(&candidate, formats) {
                continue;
            }
            match candidate.canonicalize() {
                Ok(canonical) => {
                    if seen.insert(canonical.clone()) {
                        files.push(canonical);
                    }
                }
                Err(e) => logger.debug(&format!(
                    "Can't canonicalize {}: {}",
                    candidate.display(),
                    e
                )),
            }
        }
    }
    files
}
