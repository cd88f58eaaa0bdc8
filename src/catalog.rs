//! Durable snapshot catalog
//!
//! The catalog is the single source of truth about which snapshots exist and
//! whether they can be trusted. Each snapshot is one JSON document:
//!
//! ```text
//! state_dir/
//! ├── lock                  # CatalogLock (flock)
//! └── catalog/
//!     ├── 20240309-140507.json
//!     └── 20240310-020000_weekly.json
//! ```
//!
//! Every mutation goes through [`utils::atomic_write`] (temp file, fsync,
//! rename, fsync of the directory) so a completed call survives a crash and
//! a reader never sees a half-written record.
//!
//! ## Status transitions
//!
//! ```text
//! pending ──> verified ──> corrupt
//!    └────────────────────────^
//! ```
//!
//! `corrupt` is terminal.

use crate::error::{Result, SysbackError};
use crate::types::{Snapshot, SnapshotStatus};
use crate::utils;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Name of the catalog directory inside the state directory
pub const CATALOG_DIR: &str = "catalog";

/// Snapshot catalog backed by one JSON file per snapshot
#[derive(Debug, Clone)]
pub struct SnapshotCatalog {
    dir: PathBuf,
}

impl SnapshotCatalog {
    /// Open (creating if needed) the catalog under `state_dir`
    pub fn open(state_dir: &Path) -> Result<Self> {
        let dir = state_dir.join(CATALOG_DIR);
        fs::create_dir_all(&dir).map_err(|e| SysbackError::path_io(&dir, e))?;
        Ok(Self { dir })
    }

    /// Directory holding the records
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || id.starts_with('.') || id.contains('/') || id.contains('\0') {
            return Err(SysbackError::SnapshotNotFound(id.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", id)))
    }

    fn write(&self, snapshot: &Snapshot) -> Result<()> {
        let path = self.record_path(&snapshot.id)?;
        let json = serde_json::to_vec_pretty(snapshot)?;
        utils::atomic_write(&path, &json)
    }

    /// Whether a record with this id exists
    pub fn contains(&self, id: &str) -> bool {
        self.record_path(id).map(|p| p.exists()).unwrap_or(false)
    }

    /// Add a new snapshot record
    ///
    /// # Errors
    ///
    /// - [`SysbackError::Internal`] if the id is already recorded
    pub fn record(&self, snapshot: &Snapshot) -> Result<()> {
        if self.contains(&snapshot.id) {
            return Err(SysbackError::internal(format!(
                "snapshot {} is already recorded",
                snapshot.id
            )));
        }
        self.write(snapshot)?;
        info!(id = %snapshot.id, status = %snapshot.status, "Recorded snapshot");
        Ok(())
    }

    /// Load one record
    ///
    /// # Errors
    ///
    /// - [`SysbackError::SnapshotNotFound`] if no record has this id
    pub fn get(&self, id: &str) -> Result<Snapshot> {
        let path = self.record_path(id)?;
        let json = match fs::read(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SysbackError::SnapshotNotFound(id.to_string()));
            }
            Err(e) => return Err(SysbackError::path_io(&path, e)),
        };
        Ok(serde_json::from_slice(&json)?)
    }

    /// All records, newest first
    ///
    /// Records that cannot be parsed are skipped with a warning.
    pub fn list(&self) -> Result<Vec<Snapshot>> {
        let mut snapshots = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(|e| SysbackError::path_io(&self.dir, e))? {
            let entry = entry?;
            let path = entry.path();
            let is_record = path.extension().map(|e| e == "json").unwrap_or(false)
                && !entry.file_name().to_string_lossy().starts_with('.');
            if !is_record {
                continue;
            }
            match fs::read(&path)
                .map_err(SysbackError::from)
                .and_then(|json| serde_json::from_slice::<Snapshot>(&json).map_err(SysbackError::from))
            {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => warn!("Skipping unreadable catalog record {:?}: {}", path, e),
            }
        }

        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(snapshots)
    }

    fn transition(&self, id: &str, to: SnapshotStatus) -> Result<Snapshot> {
        let mut snapshot = self.get(id)?;
        let allowed = matches!(
            (snapshot.status, to),
            (SnapshotStatus::Pending, SnapshotStatus::Verified)
                | (SnapshotStatus::Pending, SnapshotStatus::Corrupt)
                | (SnapshotStatus::Verified, SnapshotStatus::Verified)
                | (SnapshotStatus::Verified, SnapshotStatus::Corrupt)
                | (SnapshotStatus::Corrupt, SnapshotStatus::Corrupt)
        );
        if !allowed {
            return Err(SysbackError::InvalidTransition {
                id: id.to_string(),
                from: snapshot.status.to_string(),
                to: to.to_string(),
            });
        }
        if snapshot.status != to {
            debug!("Snapshot {} status {} -> {}", id, snapshot.status, to);
            snapshot.status = to;
            self.write(&snapshot)?;
        }
        Ok(snapshot)
    }

    /// Mark a snapshot verified; fails if it is already corrupt
    pub fn mark_verified(&self, id: &str) -> Result<Snapshot> {
        self.transition(id, SnapshotStatus::Verified)
    }

    /// Mark a snapshot corrupt (terminal)
    pub fn mark_corrupt(&self, id: &str) -> Result<Snapshot> {
        let snapshot = self.transition(id, SnapshotStatus::Corrupt)?;
        warn!(id = %id, "Snapshot marked corrupt");
        Ok(snapshot)
    }

    /// Delete a record, returning what it held
    ///
    /// The archive file is left alone; callers decide whether to delete it.
    pub fn remove(&self, id: &str) -> Result<Snapshot> {
        let snapshot = self.get(id)?;
        let path = self.record_path(id)?;
        fs::remove_file(&path).map_err(|e| SysbackError::path_io(&path, e))?;
        utils::sync_dir(&self.dir)?;
        info!(id = %id, "Removed snapshot record");
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HostInfo;
    use chrono::{Duration, TimeZone, Utc};
    use tempfile::TempDir;

    fn snapshot(id: &str, minutes: i64) -> Snapshot {
        Snapshot {
            id: id.to_string(),
            label: None,
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(minutes),
            source_root: PathBuf::from("/"),
            archive_path: PathBuf::from(format!("/var/lib/sysback/snapshots/{}.sba", id)),
            compressed_size: 10,
            uncompressed_size: 20,
            entry_count: 3,
            checksum: "ab".repeat(32),
            status: SnapshotStatus::Pending,
            compression: "fast".to_string(),
            host: HostInfo::default(),
            sysback_version: "0.1.0".to_string(),
        }
    }

    #[test]
    fn test_record_get_and_list_order() {
        let dir = TempDir::new().unwrap();
        let catalog = SnapshotCatalog::open(dir.path()).unwrap();
        catalog.record(&snapshot("older", 0)).unwrap();
        catalog.record(&snapshot("newer", 5)).unwrap();

        assert_eq!(catalog.get("older").unwrap().id, "older");
        let ids: Vec<String> = catalog.list().unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["newer".to_string(), "older".to_string()]);
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let catalog = SnapshotCatalog::open(dir.path()).unwrap();
        assert!(matches!(catalog.get("nope"), Err(SysbackError::SnapshotNotFound(_))));
        assert!(matches!(catalog.get("../etc"), Err(SysbackError::SnapshotNotFound(_))));
    }

    #[test]
    fn test_duplicate_record_rejected() {
        let dir = TempDir::new().unwrap();
        let catalog = SnapshotCatalog::open(dir.path()).unwrap();
        catalog.record(&snapshot("a", 0)).unwrap();
        assert!(catalog.record(&snapshot("a", 1)).is_err());
    }

    #[test]
    fn test_corrupt_is_terminal() {
        let dir = TempDir::new().unwrap();
        let catalog = SnapshotCatalog::open(dir.path()).unwrap();
        catalog.record(&snapshot("a", 0)).unwrap();

        assert_eq!(catalog.mark_verified("a").unwrap().status, SnapshotStatus::Verified);
        assert_eq!(catalog.mark_corrupt("a").unwrap().status, SnapshotStatus::Corrupt);
        assert!(matches!(
            catalog.mark_verified("a"),
            Err(SysbackError::InvalidTransition { .. })
        ));
        assert_eq!(catalog.get("a").unwrap().status, SnapshotStatus::Corrupt);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let catalog = SnapshotCatalog::open(dir.path()).unwrap();
            catalog.record(&snapshot("persisted", 0)).unwrap();
            catalog.mark_verified("persisted").unwrap();
        }
        let reopened = SnapshotCatalog::open(dir.path()).unwrap();
        assert_eq!(reopened.get("persisted").unwrap().status, SnapshotStatus::Verified);
    }

    #[test]
    fn test_remove_and_unreadable_records() {
        let dir = TempDir::new().unwrap();
        let catalog = SnapshotCatalog::open(dir.path()).unwrap();
        catalog.record(&snapshot("gone", 0)).unwrap();
        fs::write(catalog.dir().join("broken.json"), b"{ not json").unwrap();

        assert_eq!(catalog.list().unwrap().len(), 1);
        catalog.remove("gone").unwrap();
        assert!(!catalog.contains("gone"));
        assert!(catalog.list().unwrap().is_empty());
    }
}
