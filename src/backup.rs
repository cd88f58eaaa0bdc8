//! Backup orchestration
//!
//! Drives one backup through `Idle → Traversing → Encoding → Checksumming →
//! Committing → Done`, moving to `Failed` on any error.
//!
//! The archive is streamed into a temporary file inside the snapshots
//! directory and only moved to its final name once it is complete and synced.
//! The move never replaces an existing file. Until that move succeeds the
//! catalog is untouched and dropping the temporary file removes every trace
//! of the attempt.
//!
//! The traversal is a best-effort crawl of a live filesystem, not a
//! transactional snapshot: files changing during the walk are captured in
//! whatever state they are in when read.

use crate::archive::{capture_entry, ArchiveWriter, ARCHIVE_EXTENSION};
use crate::catalog::SnapshotCatalog;
use crate::compression::CompressionMode;
use crate::error::{Result, SysbackError};
use crate::exclusion::ExclusionRules;
use crate::lock::CatalogLock;
use crate::types::{
    BackupHook, BackupReport, BackupStage, HostInfo, NoOpHook, ProgressCallback, ProgressInfo,
    Snapshot, SnapshotStatus, StageLog,
};
use crate::utils;
use crate::walker::{WalkOptions, Walker};
use chrono::Utc;
use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};

/// Report progress every this many entries
const PROGRESS_INTERVAL: usize = 256;

/// Directories whose subtrees must be separately mounted to hold snapshots
const REMOVABLE_ROOTS: &[&str] = &["/media", "/mnt"];

/// Everything a single backup run needs
#[derive(Debug, Clone)]
pub struct BackupOptions {
    /// Root of the tree to capture
    pub source_root: PathBuf,
    /// Where archives are written
    pub snapshots_dir: PathBuf,
    /// Holds the catalog and the lock
    pub state_dir: PathBuf,
    /// Exclusion rules (implicit exclusions are added automatically)
    pub rules: ExclusionRules,
    /// Optional label, sanitized before use
    pub label: Option<String>,
    /// Payload compression
    pub compression: CompressionMode,
    /// Stay on the source root's filesystem
    pub one_file_system: bool,
    /// Refuse snapshot directories under /media or /mnt that are not mounted
    pub require_mounted_target: bool,
}

impl BackupOptions {
    /// Options with defaults for everything but the paths
    pub fn new(source_root: impl Into<PathBuf>, snapshots_dir: impl Into<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_root: source_root.into(),
            snapshots_dir: snapshots_dir.into(),
            state_dir: state_dir.into(),
            rules: ExclusionRules::empty(),
            label: None,
            compression: CompressionMode::default(),
            one_file_system: true,
            require_mounted_target: true,
        }
    }
}

/// Runs backups against a catalog
pub struct BackupOrchestrator {
    catalog: SnapshotCatalog,
    hook: Arc<dyn BackupHook>,
    progress: Option<ProgressCallback>,
}

impl std::fmt::Debug for BackupOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupOrchestrator")
            .field("catalog", &self.catalog)
            .field("hook", &"<hook>")
            .field("progress", &self.progress.as_ref().map(|_| "<callback>"))
            .finish()
    }
}

impl BackupOrchestrator {
    /// Create an orchestrator writing to `catalog`
    pub fn new(catalog: SnapshotCatalog) -> Self {
        Self {
            catalog,
            hook: Arc::new(NoOpHook),
            progress: None,
        }
    }

    /// Install a hook that observes (and may abort) the run
    pub fn with_hook(mut self, hook: Arc<dyn BackupHook>) -> Self {
        self.hook = hook;
        self
    }

    /// Install a progress callback
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Run one backup
    ///
    /// Takes the catalog lock for the whole run.
    ///
    /// # Errors
    ///
    /// - [`SysbackError::LockHeld`] if another backup or restore is running
    /// - [`SysbackError::InvalidConfiguration`] if the snapshots directory fails preflight
    /// - [`SysbackError::Hook`] if a hook aborted the run
    /// - any I/O or walk error; nothing is recorded in that case
    #[instrument(skip(self, options), fields(source = %options.source_root.display()))]
    pub fn run(&self, options: &BackupOptions) -> Result<BackupReport> {
        let _lock = CatalogLock::acquire(&options.state_dir)?;
        let start = Instant::now();
        let mut stages = StageLog::new("backup", BackupStage::Idle);

        match self.execute(options, &mut stages) {
            Ok(snapshot) => {
                // The snapshot is committed; hook failures from here on cannot undo it.
                stages.advance(BackupStage::Done);
                if let Err(e) = self
                    .hook
                    .on_stage(BackupStage::Done)
                    .and_then(|_| self.hook.post_backup(&snapshot))
                {
                    warn!(id = %snapshot.id, "Backup hook failed after commit: {}", e);
                }
                info!(
                    id = %snapshot.id,
                    status = %snapshot.status,
                    entries = snapshot.entry_count,
                    size = %utils::format_bytes(snapshot.compressed_size),
                    "Backup complete"
                );
                Ok(BackupReport {
                    snapshot,
                    stages: stages.history().to_vec(),
                    duration_ms: start.elapsed().as_millis() as u64,
                })
            }
            Err(e) => {
                error!(stage = %stages.current(), "Backup failed: {}", e);
                stages.advance(BackupStage::Failed);
                Err(e)
            }
        }
    }

    fn enter(&self, stages: &mut StageLog<BackupStage>, stage: BackupStage) -> Result<()> {
        stages.advance(stage);
        self.hook.on_stage(stage)
    }

    fn report(&self, processed: usize, bytes: u64, item: Option<&Path>) {
        if let Some(cb) = &self.progress {
            cb(ProgressInfo {
                operation: "Archiving".to_string(),
                current_item: item.map(|p| p.display().to_string()),
                processed,
                bytes_processed: bytes,
            });
        }
    }

    fn execute(&self, options: &BackupOptions, stages: &mut StageLog<BackupStage>) -> Result<Snapshot> {
        let source_root = options
            .source_root
            .canonicalize()
            .map_err(|e| SysbackError::path_io(&options.source_root, e))?;
        fs::create_dir_all(&options.snapshots_dir)
            .map_err(|e| SysbackError::path_io(&options.snapshots_dir, e))?;
        let snapshots_dir = options
            .snapshots_dir
            .canonicalize()
            .map_err(|e| SysbackError::path_io(&options.snapshots_dir, e))?;
        if options.require_mounted_target {
            check_snapshot_target(&snapshots_dir)?;
        }

        let label = options.label.as_deref().map(utils::sanitize_label);
        let created_at = Utc::now();
        let id = self.unique_id(&utils::snapshot_id(created_at, label.as_deref()), &snapshots_dir);
        let final_path = snapshots_dir.join(format!("{}.{}", id, ARCHIVE_EXTENSION));
        info!(id = %id, archive = %final_path.display(), "Starting backup");

        let rules = options
            .rules
            .clone()
            .with_implicit(&snapshots_dir)
            .with_implicit(&options.state_dir);

        self.enter(stages, BackupStage::Traversing)?;
        let walker = Walker::new(
            &source_root,
            &rules,
            WalkOptions {
                one_file_system: options.one_file_system,
            },
        );

        let temp = tempfile::Builder::new()
            .prefix(".sysback-")
            .suffix(".partial")
            .tempfile_in(&snapshots_dir)
            .map_err(|e| SysbackError::path_io(&snapshots_dir, e))?;

        self.enter(stages, BackupStage::Encoding)?;
        let mut writer = ArchiveWriter::new(BufWriter::new(temp.as_file()), options.compression)?;
        let mut processed = 0usize;
        for walked in walker {
            let walked = walked?;
            let entry = capture_entry(&walked.path, &walked.relative, &walked.metadata)?;
            self.hook.on_entry(&entry)?;
            writer.append_captured(&walked.path, entry)?;

            processed += 1;
            if processed % PROGRESS_INTERVAL == 0 {
                self.report(processed, writer.content_bytes(), Some(&walked.relative));
            }
        }
        self.report(processed, writer.content_bytes(), None);

        self.enter(stages, BackupStage::Checksumming)?;
        let (buffered, summary) = writer.finish()?;
        let file = buffered
            .into_inner()
            .map_err(|e| SysbackError::path_io(temp.path(), e.into_error()))?;
        file.sync_all().map_err(|e| SysbackError::path_io(temp.path(), e))?;

        self.enter(stages, BackupStage::Committing)?;
        temp.persist_noclobber(&final_path)
            .map_err(|e| SysbackError::path_io(&final_path, e.error))?;
        utils::sync_dir(&snapshots_dir)?;

        let snapshot = Snapshot {
            id: id.clone(),
            label,
            created_at,
            source_root,
            archive_path: final_path.clone(),
            compressed_size: summary.archive_bytes,
            uncompressed_size: summary.content_bytes,
            entry_count: summary.entries,
            checksum: summary.checksum.clone(),
            status: SnapshotStatus::Pending,
            compression: options.compression.to_string(),
            host: HostInfo::default(),
            sysback_version: crate::VERSION.to_string(),
        };

        if let Err(e) = self.catalog.record(&snapshot) {
            warn!(
                "Archive {} was written but could not be recorded; it is orphaned",
                final_path.display()
            );
            return Err(e);
        }

        let actual = utils::hash_file_content(&final_path)?;
        if actual == summary.checksum {
            self.catalog.mark_verified(&id)
        } else {
            warn!(id = %id, expected = %summary.checksum, actual = %actual, "Committed archive does not match its stream digest");
            self.catalog.mark_corrupt(&id)
        }
    }

    fn unique_id(&self, base: &str, snapshots_dir: &Path) -> String {
        let taken = |id: &str| {
            self.catalog.contains(id)
                || snapshots_dir
                    .join(format!("{}.{}", id, ARCHIVE_EXTENSION))
                    .exists()
        };
        if !taken(base) {
            return base.to_string();
        }
        (1u32..)
            .map(|n| format!("{}-{}", base, n))
            .find(|candidate| !taken(candidate))
            .unwrap_or_else(|| base.to_string())
    }
}

/// Refuse snapshot directories on removable-media paths that are not mounted
///
/// Writing under an unmounted `/media/usb` would silently fill the root
/// filesystem instead of the intended device.
pub fn check_snapshot_target(snapshots_dir: &Path) -> Result<()> {
    if !REMOVABLE_ROOTS.iter().any(|r| snapshots_dir.starts_with(r)) {
        return Ok(());
    }
    let table = utils::read_mount_table()?;
    check_snapshot_target_with(snapshots_dir, &table)
}

fn check_snapshot_target_with(snapshots_dir: &Path, table: &[utils::MountEntry]) -> Result<()> {
    let backing = table
        .iter()
        .filter(|m| snapshots_dir.starts_with(&m.target))
        .max_by_key(|m| m.target.components().count());
    match backing {
        Some(m) if m.target != Path::new("/") => Ok(()),
        _ => Err(SysbackError::InvalidConfiguration(format!(
            "snapshot directory {} is not on a mounted device",
            snapshots_dir.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveReader;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    struct Env {
        _dir: TempDir,
        source: PathBuf,
        state: PathBuf,
        snapshots: PathBuf,
    }

    fn env() -> Env {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("src");
        fs::create_dir_all(source.join("etc")).unwrap();
        fs::write(source.join("etc/hostname"), b"box\n").unwrap();
        fs::write(source.join("data.bin"), vec![1u8; 10_000]).unwrap();
        let state = dir.path().join("state");
        let snapshots = state.join("snapshots");
        Env {
            _dir: dir,
            source,
            state,
            snapshots,
        }
    }

    fn options(env: &Env) -> BackupOptions {
        let mut options = BackupOptions::new(&env.source, &env.snapshots, &env.state);
        options.require_mounted_target = false;
        options
    }

    #[test]
    fn test_backup_records_verified_snapshot() {
        let env = env();
        let catalog = SnapshotCatalog::open(&env.state).unwrap();
        let report = BackupOrchestrator::new(catalog.clone()).run(&options(&env)).unwrap();

        assert_eq!(report.snapshot.status, SnapshotStatus::Verified);
        assert_eq!(
            report.stages,
            vec![
                BackupStage::Idle,
                BackupStage::Traversing,
                BackupStage::Encoding,
                BackupStage::Checksumming,
                BackupStage::Committing,
                BackupStage::Done
            ]
        );
        assert!(report.snapshot.archive_path.exists());
        assert_eq!(catalog.list().unwrap().len(), 1);
        assert_eq!(
            utils::hash_file_content(&report.snapshot.archive_path).unwrap(),
            report.snapshot.checksum
        );
    }

    #[test]
    fn test_label_is_sanitized_into_id() {
        let env = env();
        let catalog = SnapshotCatalog::open(&env.state).unwrap();
        let mut opts = options(&env);
        opts.label = Some("Before Upgrade".to_string());
        let report = BackupOrchestrator::new(catalog).run(&opts).unwrap();
        assert!(report.snapshot.id.ends_with("_before_upgrade"));
        assert_eq!(report.snapshot.label.as_deref(), Some("before_upgrade"));
    }

    #[test]
    fn test_archive_never_contains_itself() {
        let env = env();
        // Snapshots live inside the source tree.
        let snapshots = env.source.join("var/backups");
        let catalog = SnapshotCatalog::open(&env.state).unwrap();
        let mut opts = options(&env);
        opts.snapshots_dir = snapshots.clone();

        let first = BackupOrchestrator::new(catalog.clone()).run(&opts).unwrap();
        let second = BackupOrchestrator::new(catalog).run(&opts).unwrap();
        assert_ne!(first.snapshot.id, second.snapshot.id);

        let file = fs::File::open(&second.snapshot.archive_path).unwrap();
        let paths: Vec<PathBuf> = ArchiveReader::new(file).unwrap().entries().map(|e| e.unwrap().path).collect();
        assert!(!paths.iter().any(|p| p.starts_with("var/backups")));
        assert!(paths.contains(&PathBuf::from("etc/hostname")));
    }

    struct AbortAfter {
        remaining: Mutex<usize>,
    }

    impl BackupHook for AbortAfter {
        fn on_entry(&self, _entry: &crate::types::ArchiveEntry) -> Result<()> {
            let mut left = self.remaining.lock();
            if *left == 0 {
                return Err(SysbackError::Hook("simulated failure".into()));
            }
            *left -= 1;
            Ok(())
        }
    }

    #[test]
    fn test_failed_encoding_leaves_no_trace() {
        let env = env();
        let catalog = SnapshotCatalog::open(&env.state).unwrap();
        let hook = Arc::new(AbortAfter {
            remaining: Mutex::new(2),
        });
        let err = BackupOrchestrator::new(catalog.clone())
            .with_hook(hook)
            .run(&options(&env))
            .unwrap_err();
        assert!(matches!(err, SysbackError::Hook(_)));
        assert!(catalog.list().unwrap().is_empty());
        assert_eq!(fs::read_dir(&env.snapshots).unwrap().count(), 0);
        // Lock released
        assert!(CatalogLock::acquire(&env.state).is_ok());
    }

    struct FailAfterCommit;

    impl BackupHook for FailAfterCommit {
        fn post_backup(&self, _snapshot: &Snapshot) -> Result<()> {
            Err(SysbackError::Hook("notification endpoint down".into()))
        }
    }

    #[test]
    fn test_post_backup_hook_failure_keeps_snapshot() {
        let env = env();
        let catalog = SnapshotCatalog::open(&env.state).unwrap();
        let report = BackupOrchestrator::new(catalog.clone())
            .with_hook(Arc::new(FailAfterCommit))
            .run(&options(&env))
            .unwrap();

        assert_eq!(report.stages.last(), Some(&BackupStage::Done));
        assert_eq!(catalog.get(&report.snapshot.id).unwrap().status, SnapshotStatus::Verified);
        assert!(report.snapshot.archive_path.exists());
    }

    #[test]
    fn test_concurrent_backup_refused() {
        let env = env();
        let catalog = SnapshotCatalog::open(&env.state).unwrap();
        let _held = CatalogLock::acquire(&env.state).unwrap();
        let err = BackupOrchestrator::new(catalog).run(&options(&env)).unwrap_err();
        assert!(matches!(err, SysbackError::LockHeld(_)));
    }

    #[test]
    fn test_progress_callback_reports_totals() {
        let env = env();
        let catalog = SnapshotCatalog::open(&env.state).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        BackupOrchestrator::new(catalog)
            .with_progress(Arc::new(move |p: ProgressInfo| sink.lock().push(p.bytes_processed)))
            .run(&options(&env))
            .unwrap();
        assert_eq!(seen.lock().last().copied(), Some(10_004));
    }

    #[test]
    fn test_mount_guard() {
        let table = utils::parse_mount_table("/dev/sda1 / ext4 rw 0 0\n/dev/sdb1 /media/usb vfat rw 0 0\n");
        assert!(check_snapshot_target_with(Path::new("/media/usb/backups"), &table).is_ok());
        assert!(matches!(
            check_snapshot_target_with(Path::new("/mnt/backups"), &table),
            Err(SysbackError::InvalidConfiguration(_))
        ));
    }
}
