//! Exclusion filtering for snapshot traversal
//!
//! Rules are evaluated against "snapshot paths": `/` followed by the path
//! relative to the source root. For a live backup of `/` these are the real
//! absolute paths, so rule files read naturally (`/proc/*`, `/home/*/.cache`).
//!
//! Three pattern forms are supported:
//!
//! - a literal absolute path (`/data/tmp`) excludes exactly that path
//! - a glob containing `/` (`/home/*/.cache`) is anchored at the root and
//!   `*` never crosses a `/`
//! - a bare glob (`*.tmp`) is matched against the file name only
//!
//! Excluding a path excludes its whole subtree. The walker prunes excluded
//! directories, and [`should_include`] also checks every ancestor so the
//! predicate is correct on its own.
//!
//! Independently of the rules, a set of real absolute paths (the snapshots
//! directory and the state directory) is always excluded so that an archive
//! never contains itself.

use crate::error::{Result, SysbackError};
use crate::utils;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

/// Rules used when no exclude file exists
///
/// Pseudo filesystems and volatile mount points keep their directory entry
/// but lose their contents.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    "/proc/*",
    "/sys/*",
    "/dev/*",
    "/run/*",
    "/tmp/*",
    "/mnt/*",
    "/media/*",
    "/lost+found",
    "/swapfile",
];

/// Compiled exclusion rules
#[derive(Debug, Clone)]
pub struct ExclusionRules {
    patterns: Vec<String>,
    literals: Vec<PathBuf>,
    anchored: GlobSet,
    names: GlobSet,
    implicit: Vec<PathBuf>,
}

fn has_glob_meta(pattern: &str) -> bool {
    pattern.contains(['*', '?', '[', '{'])
}

impl ExclusionRules {
    /// Compile a list of patterns
    ///
    /// # Errors
    ///
    /// - [`SysbackError::InvalidPattern`] if a glob does not compile
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut kept = Vec::new();
        let mut literals = Vec::new();
        let mut anchored = GlobSetBuilder::new();
        let mut names = GlobSetBuilder::new();

        for raw in patterns {
            let raw = raw.as_ref().trim();
            if raw.is_empty() {
                continue;
            }
            let trimmed = raw.trim_end_matches('/');
            let pattern = if trimmed.is_empty() { "/" } else { trimmed };

            if !pattern.contains('/') {
                let glob = GlobBuilder::new(pattern)
                    .literal_separator(true)
                    .build()
                    .map_err(|e| SysbackError::InvalidPattern(format!("'{}': {}", raw, e)))?;
                names.add(glob);
            } else {
                let absolute = if pattern.starts_with('/') {
                    pattern.to_string()
                } else {
                    format!("/{}", pattern)
                };
                if has_glob_meta(&absolute) {
                    let glob = GlobBuilder::new(&absolute)
                        .literal_separator(true)
                        .build()
                        .map_err(|e| SysbackError::InvalidPattern(format!("'{}': {}", raw, e)))?;
                    anchored.add(glob);
                } else {
                    literals.push(normalize(Path::new(&absolute)));
                }
            }
            kept.push(raw.to_string());
        }

        debug!("Compiled {} exclusion patterns", kept.len());

        Ok(Self {
            patterns: kept,
            literals,
            anchored: anchored.build()?,
            names: names.build()?,
            implicit: Vec::new(),
        })
    }

    /// Rules that exclude nothing
    pub fn empty() -> Self {
        Self {
            patterns: Vec::new(),
            literals: Vec::new(),
            anchored: GlobSet::empty(),
            names: GlobSet::empty(),
            implicit: Vec::new(),
        }
    }

    /// The built-in default list
    pub fn defaults() -> Result<Self> {
        Self::new(DEFAULT_EXCLUDES)
    }

    /// Load rules from a line-oriented file, falling back to the defaults
    /// when the file does not exist
    pub fn from_file(path: &Path) -> Result<Self> {
        match utils::read_pattern_file(path)? {
            Some(patterns) => Self::new(patterns),
            None => {
                info!("No exclude file at {:?}; using built-in defaults", path);
                Self::defaults()
            }
        }
    }

    /// Always exclude this real absolute path, whatever the rules say
    pub fn with_implicit(mut self, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let resolved = path.canonicalize().unwrap_or_else(|_| normalize(path));
        if !self.implicit.contains(&resolved) {
            self.implicit.push(resolved);
        }
        self
    }

    /// Patterns as given
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Whether a rule matches this exact snapshot path (ancestors not consulted)
    pub fn matches(&self, snapshot_path: &Path) -> bool {
        if snapshot_path == Path::new("/") {
            return false;
        }
        if self.literals.iter().any(|l| l == snapshot_path) {
            return true;
        }
        if self.anchored.is_match(snapshot_path) {
            return true;
        }
        match snapshot_path.file_name() {
            Some(name) => self.names.is_match(Path::new(name)),
            None => false,
        }
    }

    /// Whether a real path falls inside an implicitly excluded directory
    pub fn is_implicitly_excluded(&self, real_path: &Path) -> bool {
        self.implicit.iter().any(|p| real_path.starts_with(p))
    }
}

/// Turn a path relative to the source root into a snapshot path
pub fn snapshot_path(relative: &Path) -> PathBuf {
    let mut out = PathBuf::from("/");
    for component in relative.components() {
        if let Component::Normal(part) = component {
            out.push(part);
        }
    }
    out
}

/// Lexically normalize an absolute path (drop `.` and trailing slashes)
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                out.pop();
            }
            _ => {}
        }
    }
    out
}

/// Decide whether a snapshot path belongs in the archive
///
/// Returns false when the path or any of its ancestors matches a rule.
pub fn should_include(snapshot_path: &Path, rules: &ExclusionRules) -> bool {
    let mut current = Some(snapshot_path);
    while let Some(path) = current {
        if rules.matches(path) {
            return false;
        }
        current = path.parent();
    }
    true
}
