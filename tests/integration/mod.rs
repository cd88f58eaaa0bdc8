//! End-to-end tests for sysback
//!
//! Backups run against real temporary trees. Restores run against a
//! recorded device: every partitioning and mount command is captured by a
//! [`RecordingExecutor`] while extraction writes into a real staging
//! directory, so the restored tree can be compared with the source.

use ::sysback::*;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::BufReader;
use std::os::unix::fs::{symlink, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use walkdir::WalkDir;

/// Bootloader stub remembering what it was asked to do
#[derive(Debug, Default)]
pub struct RecordingBootloader {
    pub installs: Mutex<Vec<(PathBuf, BootTarget)>>,
}

impl BootloaderInstaller for RecordingBootloader {
    fn install(&self, layout: &MountedLayout, boot: BootTarget) -> Result<()> {
        self.installs.lock().push((layout.device.clone(), boot));
        Ok(())
    }
}

/// Provisioner stub that only counts calls
#[derive(Debug, Default)]
pub struct CountingProvisioner {
    pub provisions: AtomicUsize,
    pub releases: AtomicUsize,
}

impl Provisioner for CountingProvisioner {
    fn provision(&self, plan: &RestorePlan) -> Result<MountedLayout> {
        self.provisions.fetch_add(1, Ordering::SeqCst);
        Ok(MountedLayout {
            device: plan.device.clone(),
            staging: plan.staging.clone(),
            partitions: Vec::new(),
            mounts: Vec::new(),
        })
    }

    fn release(&self, _layout: &MountedLayout) -> Result<()> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// What a path looks like on disk, for tree comparisons
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Dir { mode: u32 },
    File { mode: u32, mtime: i64, content: Vec<u8> },
    Symlink { target: PathBuf },
}

/// Every path under `root` (relative) with its shape
pub fn tree(root: &Path) -> BTreeMap<PathBuf, Node> {
    let mut nodes = BTreeMap::new();
    for entry in WalkDir::new(root).min_depth(1).follow_links(false) {
        let entry = entry.unwrap();
        let relative = entry.path().strip_prefix(root).unwrap().to_path_buf();
        let meta = entry.path().symlink_metadata().unwrap();
        let node = if meta.file_type().is_symlink() {
            Node::Symlink {
                target: fs::read_link(entry.path()).unwrap(),
            }
        } else if meta.is_dir() {
            Node::Dir {
                mode: meta.permissions().mode() & 0o7777,
            }
        } else {
            Node::File {
                mode: meta.permissions().mode() & 0o7777,
                mtime: meta.mtime(),
                content: fs::read(entry.path()).unwrap(),
            }
        };
        nodes.insert(relative, node);
    }
    nodes
}

/// Paths recorded in an archive, in stream order
pub fn archive_paths(snapshot: &Snapshot) -> Vec<PathBuf> {
    let file = File::open(&snapshot.archive_path).unwrap();
    ArchiveReader::new(BufReader::new(file))
        .unwrap()
        .entries()
        .map(|e| e.unwrap().path)
        .collect()
}

/// Temporary source tree, state directory and staging root
pub struct SysbackTestHarness {
    pub temp_dir: TempDir,
    pub source: PathBuf,
    pub state: PathBuf,
    pub snapshots: PathBuf,
    pub staging: PathBuf,
    pub executor: Arc<RecordingExecutor>,
    pub bootloader: Arc<RecordingBootloader>,
}

impl SysbackTestHarness {
    /// Harness with a small system-like source tree
    pub fn new() -> Self {
        Self::with_executor(RecordingExecutor::new())
    }

    /// Harness whose device commands go to `executor`
    pub fn with_executor(executor: RecordingExecutor) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("source");
        let state = temp_dir.path().join("state");
        let snapshots = temp_dir.path().join("snapshots");
        let staging = temp_dir.path().join("staging");

        let harness = Self {
            source,
            state,
            snapshots,
            staging,
            executor: Arc::new(executor),
            bootloader: Arc::new(RecordingBootloader::default()),
            temp_dir,
        };
        harness.populate();
        harness
    }

    fn populate(&self) {
        self.write("etc/hostname", b"restored-host\n", 0o644);
        self.write("etc/fstab", b"/dev/sda1 / ext4 defaults 0 1\n", 0o644);
        self.write("etc/shadow", b"root:!:19000::::::\n", 0o640);
        self.write("usr/bin/tool", b"#!/bin/sh\necho tool\n", 0o755);
        self.write("var/log/syslog", &vec![b'x'; 200_000], 0o644);
        self.write("home/user/notes.txt", "ünïcödé notes".as_bytes(), 0o600);
        fs::create_dir_all(self.source.join("srv/empty")).unwrap();
        symlink("usr/bin", self.source.join("bin")).unwrap();
        symlink("/etc/hostname", self.source.join("etc/hostname.link")).unwrap();
    }

    /// Write a source file with the given mode
    pub fn write(&self, relative: &str, content: &[u8], mode: u32) {
        let path = self.source.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
    }

    /// Configuration pointing at the harness directories
    pub fn config(&self) -> Config {
        Config {
            source_root: self.source.clone(),
            state_dir: self.state.clone(),
            snapshots_dir: Some(self.snapshots.clone()),
            excludes_path: self.temp_dir.path().join("absent.excludes"),
            includes_path: self.temp_dir.path().join("absent.includes"),
            log_file: None,
            ..Config::default()
        }
    }

    /// Instance using the recorded device and stub bootloader
    pub fn sysback(&self) -> Sysback {
        self.sysback_with(ExclusionRules::empty())
    }

    /// Instance with specific exclusion rules
    pub fn sysback_with(&self, rules: ExclusionRules) -> Sysback {
        SysbackBuilder::new()
            .config(self.config())
            .exclusion_rules(rules)
            .executor(self.executor.clone())
            .bootloader(self.bootloader.clone())
            .build()
            .unwrap()
    }

    /// Two-partition UEFI plan on a loop device, staged in the harness
    pub fn plan(&self) -> RestorePlan {
        RestorePlan::new("/dev/loop7", BootTarget::Uefi, &self.staging)
            .partition(PartitionSpec::new(PartitionRole::Boot, PartitionSize::Mib(512), FilesystemType::Fat32))
            .partition(PartitionSpec::new(PartitionRole::Root, PartitionSize::Remaining, FilesystemType::Ext4))
    }
}

impl Default for SysbackTestHarness {
    fn default() -> Self {
        Self::new()
    }
}

#[test]
fn test_backup_then_restore_reproduces_tree() {
    let harness = SysbackTestHarness::new();
    let sysback = harness.sysback();

    let backup = sysback.backup(Some("full")).unwrap();
    assert_eq!(backup.snapshot.status, SnapshotStatus::Verified);
    assert!(backup.snapshot.id.ends_with("_full"));

    let report = sysback.restore(&backup.snapshot.id, harness.plan()).unwrap();
    assert_eq!(report.entries_restored as u64, backup.snapshot.entry_count);
    assert_eq!(report.bytes_written, backup.snapshot.uncompressed_size);
    assert_eq!(
        report.stages,
        vec![
            RestoreStage::Idle,
            RestoreStage::Resolving,
            RestoreStage::Verifying,
            RestoreStage::Provisioning,
            RestoreStage::Extracting,
            RestoreStage::InstallingBootloader,
            RestoreStage::Finalizing,
            RestoreStage::Done,
        ]
    );

    assert_eq!(tree(&harness.source), tree(&harness.staging));
    assert_eq!(
        *harness.bootloader.installs.lock(),
        vec![(PathBuf::from("/dev/loop7"), BootTarget::Uefi)]
    );
}

#[test]
fn test_restore_writes_fstab_from_uuids() {
    let harness = SysbackTestHarness::with_executor(
        RecordingExecutor::new()
            .with_response("blkid -s UUID -o value /dev/loop7p1", "4A1B-2C3D\n")
            .with_response("blkid -s UUID -o value /dev/loop7p2", "0f5e6d7c-aaaa-bbbb-cccc-1234567890ab\n"),
    );
    let sysback = harness.sysback();
    let id = sysback.backup(None).unwrap().snapshot.id;
    let report = sysback.restore(&id, harness.plan()).unwrap();
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);

    let files = harness.executor.files_written();
    let (path, content) = files.last().unwrap();
    assert_eq!(path, &harness.staging.join("etc/fstab"));
    let fstab = String::from_utf8(content.clone()).unwrap();
    assert!(fstab.contains("UUID=0f5e6d7c-aaaa-bbbb-cccc-1234567890ab / ext4 defaults 0 1"));
    assert!(fstab.contains("UUID=4A1B-2C3D /boot vfat umask=0077 0 2"));
}

#[test]
fn test_default_excludes_keep_mount_points() {
    let harness = SysbackTestHarness::new();
    harness.write("proc/1/status", b"Name: init\n", 0o444);
    harness.write("tmp/scratch", b"junk", 0o644);
    harness.write("swapfile", b"swap", 0o600);

    let sysback = harness.sysback_with(ExclusionRules::defaults().unwrap());
    let snapshot = sysback.backup(None).unwrap().snapshot;
    let paths = archive_paths(&snapshot);

    assert!(paths.contains(&PathBuf::from("proc")));
    assert!(paths.contains(&PathBuf::from("tmp")));
    assert!(!paths.iter().any(|p| p.starts_with("proc/1")));
    assert!(!paths.contains(&PathBuf::from("tmp/scratch")));
    assert!(!paths.contains(&PathBuf::from("swapfile")));
    assert!(paths.contains(&PathBuf::from("etc/hostname")));
}

#[test]
fn test_state_inside_source_is_never_archived() {
    let harness = SysbackTestHarness::new();
    let config = Config {
        state_dir: harness.source.join("var/lib/sysback"),
        snapshots_dir: Some(harness.source.join("var/lib/sysback/snapshots")),
        ..harness.config()
    };
    let sysback = SysbackBuilder::new()
        .config(config)
        .exclusion_rules(ExclusionRules::empty())
        .build()
        .unwrap();

    sysback.backup(None).unwrap();
    let second = sysback.backup(None).unwrap().snapshot;
    let paths = archive_paths(&second);
    assert!(paths.contains(&PathBuf::from("var/lib")));
    assert!(!paths.iter().any(|p| p.starts_with("var/lib/sysback")));
}

#[test]
fn test_corrupt_snapshot_is_refused_before_provisioning() {
    let harness = SysbackTestHarness::new();
    let sysback = harness.sysback();
    let id = sysback.backup(None).unwrap().snapshot.id;
    sysback.catalog().mark_corrupt(&id).unwrap();

    let err = sysback.restore(&id, harness.plan()).unwrap_err();
    assert!(matches!(err, SysbackError::SnapshotCorrupt(_)));
    assert_eq!(err.exit_code(), error::exit_code::VERIFICATION);
    assert!(harness.executor.calls().is_empty());
    assert!(harness.bootloader.installs.lock().is_empty());
}

#[test]
fn test_operations_are_exclusive() {
    let harness = SysbackTestHarness::new();
    let sysback = harness.sysback();
    let _held = lock::CatalogLock::acquire(&harness.state).unwrap();

    assert!(matches!(sysback.backup(None), Err(SysbackError::LockHeld(_))));
    assert!(sysback.catalog().list().unwrap().is_empty());
}

#[test]
fn test_unknown_snapshot_is_validation_error() {
    let harness = SysbackTestHarness::new();
    let err = harness.sysback().restore("20000101-000000", harness.plan()).unwrap_err();
    assert!(matches!(err, SysbackError::SnapshotNotFound(_)));
    assert_eq!(err.exit_code(), error::exit_code::VALIDATION);
    assert!(harness.executor.calls().is_empty());
}

#[test]
fn test_uncompressed_archives_restore_identically() {
    let harness = SysbackTestHarness::new();
    let config = Config {
        compression: CompressionMode::None,
        ..harness.config()
    };
    let sysback = SysbackBuilder::new()
        .config(config)
        .exclusion_rules(ExclusionRules::empty())
        .executor(harness.executor.clone())
        .bootloader(harness.bootloader.clone())
        .build()
        .unwrap();

    let snapshot = sysback.backup(None).unwrap().snapshot;
    assert_eq!(snapshot.compression, "none");
    assert!(snapshot.compressed_size > snapshot.uncompressed_size);

    sysback.restore(&snapshot.id, harness.plan()).unwrap();
    assert_eq!(tree(&harness.source), tree(&harness.staging));
}
