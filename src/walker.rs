//! Exclusion-pruned tree traversal
//!
//! [`Walker`] is a lazy, depth-first iterator over a source tree. Parents are
//! always yielded before their children, the root comes first as `.`, and
//! excluded directories are pruned so their descendants are never visited.
//! Symlinks are recorded, never followed.
//!
//! Walk errors are surfaced to the caller instead of being skipped: an
//! unreadable directory aborts the backup rather than silently producing an
//! incomplete archive.

use crate::error::{Result, SysbackError};
use crate::exclusion::{self, ExclusionRules};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};
use walkdir::WalkDir;

/// One object found during traversal
#[derive(Debug, Clone)]
pub struct WalkedEntry {
    /// Absolute path on disk
    pub path: PathBuf,
    /// Path relative to the source root (`.` for the root)
    pub relative: PathBuf,
    /// `lstat` metadata
    pub metadata: fs::Metadata,
}

/// Traversal options
#[derive(Debug, Clone, Copy)]
pub struct WalkOptions {
    /// Do not descend into other filesystems
    pub one_file_system: bool,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            one_file_system: true,
        }
    }
}

/// Lazy depth-first walker
pub struct Walker {
    inner: walkdir::FilterEntry<walkdir::IntoIter, Box<dyn FnMut(&walkdir::DirEntry) -> bool + Send>>,
    root: PathBuf,
    failed: bool,
}

impl Walker {
    /// Start walking `root` with the given rules
    pub fn new(root: &Path, rules: &ExclusionRules, options: WalkOptions) -> Self {
        let root = root.to_path_buf();
        let filter_root = root.clone();
        let rules = rules.clone();

        let predicate: Box<dyn FnMut(&walkdir::DirEntry) -> bool + Send> = Box::new(move |entry| {
            if entry.depth() == 0 {
                return true;
            }
            let relative = match entry.path().strip_prefix(&filter_root) {
                Ok(r) => r,
                Err(_) => return true,
            };
            if rules.matches(&exclusion::snapshot_path(relative)) {
                trace!("Pruning excluded path {:?}", entry.path());
                return false;
            }
            if rules.is_implicitly_excluded(entry.path()) {
                debug!("Pruning implicitly excluded path {:?}", entry.path());
                return false;
            }
            true
        });

        let inner = WalkDir::new(&root)
            .follow_links(false)
            .same_file_system(options.one_file_system)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(predicate);

        Self {
            inner,
            root,
            failed: false,
        }
    }

    /// Root being walked
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Iterator for Walker {
    type Item = Result<WalkedEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let entry = match self.inner.next()? {
            Ok(entry) => entry,
            Err(e) => {
                self.failed = true;
                return Some(Err(SysbackError::WalkDir(e)));
            }
        };

        let relative = if entry.depth() == 0 {
            PathBuf::from(".")
        } else {
            match entry.path().strip_prefix(&self.root) {
                Ok(r) => r.to_path_buf(),
                Err(_) => {
                    self.failed = true;
                    return Some(Err(SysbackError::internal(format!(
                        "walked path {:?} is outside {:?}",
                        entry.path(),
                        self.root
                    ))));
                }
            }
        };

        match entry.metadata() {
            Ok(metadata) => Some(Ok(WalkedEntry {
                path: entry.into_path(),
                relative,
                metadata,
            })),
            Err(e) => {
                self.failed = true;
                Some(Err(SysbackError::WalkDir(e)))
            }
        }
    }
}

impl std::fmt::Debug for Walker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Walker")
            .field("root", &self.root)
            .field("failed", &self.failed)
            .finish()
    }
}
