//! Restore orchestration
//!
//! Drives one restore through
//! `Idle → Resolving → Verifying → Provisioning → Extracting →
//! InstallingBootloader → Finalizing → Done`, moving to `Failed` on error.
//!
//! Nothing touches the target device until the archive has been re-hashed
//! and found intact. Errors up to that point are returned unchanged. From
//! `Provisioning` on they are wrapped in [`RestoreFailure`] so the caller
//! knows how far the run got and whether the disk was modified; whatever was
//! mounted is released before returning.

use crate::archive::{decode, ExtractOptions};
use crate::bootloader::BootloaderInstaller;
use crate::catalog::SnapshotCatalog;
use crate::device::{filesystem_uuid, Executor, Provisioner};
use crate::error::{RestoreFailure, Result, SysbackError};
use crate::lock::CatalogLock;
use crate::types::{
    FilesystemType, MountedLayout, PartitionRole, ProgressCallback, ProgressInfo, RestorePlan,
    RestoreReport, RestoreStage, Snapshot, SnapshotStatus, StageLog,
};
use crate::utils;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};

/// Report progress every this many entries
const PROGRESS_INTERVAL: usize = 256;

/// Everything a single restore run needs
#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Snapshot to restore
    pub snapshot_id: String,
    /// Target layout
    pub plan: RestorePlan,
    /// Holds the catalog lock
    pub state_dir: PathBuf,
    /// Restore uid/gid (needs root)
    pub restore_ownership: bool,
    /// Rewrite `/etc/fstab` for the new partitions
    pub write_fstab: bool,
}

impl RestoreOptions {
    /// Options with defaults for everything but the snapshot and plan
    pub fn new(snapshot_id: impl Into<String>, plan: RestorePlan, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            snapshot_id: snapshot_id.into(),
            plan,
            state_dir: state_dir.into(),
            restore_ownership: nix::unistd::Uid::effective().is_root(),
            write_fstab: true,
        }
    }
}

/// Runs restores from a catalog onto a device
pub struct RestoreOrchestrator {
    catalog: SnapshotCatalog,
    provisioner: Arc<dyn Provisioner>,
    bootloader: Arc<dyn BootloaderInstaller>,
    executor: Arc<dyn Executor>,
    progress: Option<ProgressCallback>,
}

impl std::fmt::Debug for RestoreOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestoreOrchestrator")
            .field("catalog", &self.catalog)
            .field("progress", &self.progress.as_ref().map(|_| "<callback>"))
            .finish_non_exhaustive()
    }
}

/// Mutable state of one run
struct RunState {
    stages: StageLog<RestoreStage>,
    last_completed: Option<RestoreStage>,
    layout: Option<MountedLayout>,
    released: bool,
    warnings: Vec<String>,
}

impl RunState {
    fn enter(&mut self, stage: RestoreStage) {
        let current = self.stages.current();
        if current != RestoreStage::Idle {
            self.last_completed = Some(current);
        }
        self.stages.advance(stage);
    }
}

impl RestoreOrchestrator {
    /// Create an orchestrator
    ///
    /// # Arguments
    ///
    /// * `catalog` - Where snapshots are looked up (and marked corrupt)
    /// * `provisioner` - Prepares and releases the target device
    /// * `bootloader` - Makes the restored root bootable
    /// * `executor` - Used for `blkid` and writing `/etc/fstab`
    pub fn new(
        catalog: SnapshotCatalog,
        provisioner: Arc<dyn Provisioner>,
        bootloader: Arc<dyn BootloaderInstaller>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        Self {
            catalog,
            provisioner,
            bootloader,
            executor,
            progress: None,
        }
    }

    /// Install a progress callback
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Run one restore
    ///
    /// # Errors
    ///
    /// - [`SysbackError::LockHeld`] if another backup or restore is running
    /// - [`SysbackError::SnapshotNotFound`] or [`SysbackError::InvalidPlan`]
    ///   while resolving
    /// - [`SysbackError::SnapshotCorrupt`] or
    ///   [`SysbackError::ChecksumMismatch`] while verifying; the device is
    ///   untouched
    /// - [`SysbackError::Restore`] for anything after that
    #[instrument(skip(self, options), fields(id = %options.snapshot_id, device = %options.plan.device.display()))]
    pub fn run(&self, options: &RestoreOptions) -> Result<RestoreReport> {
        let _lock = CatalogLock::acquire(&options.state_dir)?;
        let start = Instant::now();
        let mut state = RunState {
            stages: StageLog::new("restore", RestoreStage::Idle),
            last_completed: None,
            layout: None,
            released: false,
            warnings: Vec::new(),
        };

        match self.execute(options, &mut state) {
            Ok((entries_restored, bytes_written)) => {
                state.enter(RestoreStage::Done);
                let layout = state
                    .layout
                    .ok_or_else(|| SysbackError::internal("restore finished without a layout"))?;
                info!(
                    entries = entries_restored,
                    bytes = %utils::format_bytes(bytes_written),
                    "Restore complete"
                );
                Ok(RestoreReport {
                    snapshot_id: options.snapshot_id.clone(),
                    layout,
                    entries_restored,
                    bytes_written,
                    stages: state.stages.history().to_vec(),
                    duration_ms: start.elapsed().as_millis() as u64,
                    warnings: state.warnings,
                })
            }
            Err(cause) => {
                let failed_stage = state.stages.current();
                error!(stage = %failed_stage, "Restore failed: {}", cause);
                state.stages.advance(RestoreStage::Failed);

                if let (Some(layout), false) = (&state.layout, state.released) {
                    if let Err(e) = self.provisioner.release(layout) {
                        warn!("Could not release target mounts after failure: {}", e);
                    }
                }

                if failed_stage < RestoreStage::Provisioning {
                    return Err(cause);
                }
                let device_mutated = !(failed_stage == RestoreStage::Provisioning && touches_nothing(&cause));
                Err(SysbackError::Restore(Box::new(RestoreFailure {
                    snapshot_id: options.snapshot_id.clone(),
                    failed_stage,
                    last_completed: state.last_completed,
                    device_mutated,
                    cause,
                })))
            }
        }
    }

    fn execute(&self, options: &RestoreOptions, state: &mut RunState) -> Result<(usize, u64)> {
        state.enter(RestoreStage::Resolving);
        let snapshot = self.catalog.get(&options.snapshot_id)?;
        options.plan.validate()?;

        state.enter(RestoreStage::Verifying);
        self.verify(&snapshot)?;

        state.enter(RestoreStage::Provisioning);
        warn!("Provisioning {}; do not interrupt from here on", options.plan.device.display());
        let layout = self.provisioner.provision(&options.plan)?;
        let layout = state.layout.insert(layout).clone();

        state.enter(RestoreStage::Extracting);
        let (entries, bytes) = self.extract(&snapshot, &layout, options.restore_ownership)?;
        if options.write_fstab {
            let fstab = render_fstab(self.executor.as_ref(), &layout, &mut state.warnings)?;
            let etc = layout.staging.join("etc");
            self.executor.create_dir_all(&etc)?;
            self.executor.write_file(&etc.join("fstab"), fstab.as_bytes())?;
        }

        state.enter(RestoreStage::InstallingBootloader);
        self.bootloader.install(&layout, options.plan.boot)?;

        state.enter(RestoreStage::Finalizing);
        state.released = true;
        self.provisioner.release(&layout)?;

        Ok((entries, bytes))
    }

    fn verify(&self, snapshot: &Snapshot) -> Result<()> {
        if snapshot.status == SnapshotStatus::Corrupt {
            return Err(SysbackError::SnapshotCorrupt(snapshot.id.clone()));
        }
        let actual = utils::hash_file_content(&snapshot.archive_path)?;
        if actual != snapshot.checksum {
            self.catalog.mark_corrupt(&snapshot.id)?;
            return Err(SysbackError::ChecksumMismatch {
                expected: snapshot.checksum.clone(),
                actual,
            });
        }
        if snapshot.status == SnapshotStatus::Pending {
            self.catalog.mark_verified(&snapshot.id)?;
        }
        info!(id = %snapshot.id, "Archive checksum verified");
        Ok(())
    }

    fn extract(&self, snapshot: &Snapshot, layout: &MountedLayout, restore_ownership: bool) -> Result<(usize, u64)> {
        let file = File::open(&snapshot.archive_path).map_err(|e| SysbackError::path_io(&snapshot.archive_path, e))?;
        let options = ExtractOptions {
            restore_ownership,
            predicate: None,
        };
        let mut extraction = decode(BufReader::new(file), &layout.staging, options)?;

        let mut processed = 0usize;
        while let Some(entry) = extraction.next() {
            let entry = entry?;
            processed += 1;
            if processed % PROGRESS_INTERVAL == 0 {
                self.report(processed, extraction.bytes_written(), Some(&entry.path));
            }
        }
        let bytes = extraction.bytes_written();
        self.report(processed, bytes, None);
        Ok((processed, bytes))
    }

    fn report(&self, processed: usize, bytes: u64, item: Option<&Path>) {
        if let Some(cb) = &self.progress {
            cb(ProgressInfo {
                operation: "Restoring".to_string(),
                current_item: item.map(|p| p.display().to_string()),
                processed,
                bytes_processed: bytes,
            });
        }
    }
}

/// Provisioning errors raised before the first destructive command
fn touches_nothing(cause: &SysbackError) -> bool {
    matches!(
        cause,
        SysbackError::InvalidPlan(_)
            | SysbackError::Device {
                step: crate::types::ProvisionStep::Preflight,
                ..
            }
    )
}

/// Build `/etc/fstab` for a provisioned layout
///
/// Partitions are referenced by filesystem UUID. When `blkid` reports none
/// the device node is used instead and a warning is added.
pub fn render_fstab(executor: &dyn Executor, layout: &MountedLayout, warnings: &mut Vec<String>) -> Result<String> {
    let mut lines = vec!["# /etc/fstab written by sysback restore".to_string()];

    let mut partitions: Vec<_> = layout.partitions.iter().collect();
    partitions.sort_by_key(|p| match p.spec.relative_mount() {
        Some(rel) => (0, rel.components().count()),
        None => (1, 0),
    });

    for partition in partitions {
        let source = match filesystem_uuid(executor, &partition.node)? {
            Some(uuid) => format!("UUID={}", uuid),
            None => {
                let msg = format!(
                    "no filesystem UUID for {}; fstab refers to the device node",
                    partition.node.display()
                );
                warn!("{}", msg);
                warnings.push(msg);
                partition.node.display().to_string()
            }
        };

        let spec = &partition.spec;
        let fs = spec.filesystem.fstab_type();
        let line = match spec.relative_mount() {
            None => format!("{} none {} sw 0 0", source, fs),
            Some(rel) => {
                let mount_point = Path::new("/").join(rel);
                let (opts, pass) = match (spec.role, spec.filesystem) {
                    (PartitionRole::Root, _) => ("defaults", 1),
                    (PartitionRole::Efi, _) => ("umask=0077", 1),
                    (_, FilesystemType::Fat32) => ("umask=0077", 2),
                    _ => ("defaults", 2),
                };
                format!("{} {} {} {} 0 {}", source, mount_point.display(), fs, opts, pass)
            }
        };
        lines.push(line);
    }

    lines.push(String::new());
    Ok(lines.join("\n"))
}
