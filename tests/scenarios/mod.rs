//! Acceptance scenarios
//!
//! Each test is one end-to-end story: a selective backup, a tampered
//! archive, a two-partition restore and an interrupted backup.

use crate::integration::{archive_paths, CountingProvisioner, RecordingBootloader, SysbackTestHarness};
use ::sysback::*;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Scenario A: `/data/tmp` is excluded, its sibling survives
#[test]
fn scenario_excluded_directory_and_contents_are_absent() {
    let harness = SysbackTestHarness::new();
    harness.write("data/keep.txt", b"keep me", 0o644);
    harness.write("data/tmp/cache.bin", &[0xAB; 4096], 0o644);

    let rules = ExclusionRules::new(["/data/tmp"]).unwrap();
    let snapshot = harness.sysback_with(rules).backup(None).unwrap().snapshot;
    let paths = archive_paths(&snapshot);

    assert!(paths.contains(&PathBuf::from("data")));
    assert!(paths.contains(&PathBuf::from("data/keep.txt")));
    assert!(!paths.contains(&PathBuf::from("data/tmp/cache.bin")));
    // The excluded directory itself is pruned along with its contents.
    assert!(!paths.contains(&PathBuf::from("data/tmp")));
}

/// Scenario B: a tampered archive is caught before the device is touched
#[test]
fn scenario_checksum_mismatch_never_reaches_provisioner() {
    let harness = SysbackTestHarness::new();
    let snapshot = harness.sysback().backup(None).unwrap().snapshot;

    let mut bytes = fs::read(&snapshot.archive_path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    fs::write(&snapshot.archive_path, bytes).unwrap();

    let provisioner = Arc::new(CountingProvisioner::default());
    let bootloader = Arc::new(RecordingBootloader::default());
    let sysback = SysbackBuilder::new()
        .config(harness.config())
        .exclusion_rules(ExclusionRules::empty())
        .executor(harness.executor.clone())
        .provisioner(provisioner.clone())
        .bootloader(bootloader.clone())
        .build()
        .unwrap();

    let err = sysback.restore(&snapshot.id, harness.plan()).unwrap_err();
    match &err {
        SysbackError::ChecksumMismatch { expected, actual } => {
            assert_eq!(expected, &snapshot.checksum);
            assert_ne!(actual, expected);
        }
        other => panic!("expected a checksum mismatch, got {other}"),
    }
    assert!(err.is_corruption());
    assert_eq!(err.exit_code(), error::exit_code::VERIFICATION);

    assert_eq!(provisioner.provisions.load(Ordering::SeqCst), 0);
    assert_eq!(provisioner.releases.load(Ordering::SeqCst), 0);
    assert!(bootloader.installs.lock().is_empty());
    assert_eq!(sysback.get(&snapshot.id).unwrap().status, SnapshotStatus::Corrupt);
}

/// Scenario C: boot (fat32) plus root (ext4); root mounted first, boot under it
#[test]
fn scenario_two_partition_layout_mount_order() {
    let harness = SysbackTestHarness::new();
    let sysback = harness.sysback();
    let id = sysback.backup(None).unwrap().snapshot.id;

    let report = sysback.restore(&id, harness.plan()).unwrap();
    let layout = &report.layout;

    assert_eq!(layout.partitions.len(), 2);
    assert_eq!(layout.partitions[0].node, PathBuf::from("/dev/loop7p1"));
    assert_eq!(layout.partitions[0].spec.role, PartitionRole::Boot);
    assert_eq!(layout.partitions[1].node, PathBuf::from("/dev/loop7p2"));
    assert_eq!(layout.partitions[1].spec.role, PartitionRole::Root);

    let mounts: Vec<(PathBuf, PathBuf)> = layout
        .mounts
        .iter()
        .map(|m| (m.node.clone(), m.mount_path.clone()))
        .collect();
    assert_eq!(
        mounts,
        vec![
            (PathBuf::from("/dev/loop7p2"), harness.staging.clone()),
            (PathBuf::from("/dev/loop7p1"), harness.staging.join("boot")),
        ]
    );

    let rendered = harness.executor.rendered();
    let mkparts = rendered.iter().filter(|c| c.contains(" mkpart ")).count();
    assert_eq!(mkparts, 2);
    let mount_commands: Vec<&String> = rendered.iter().filter(|c| c.starts_with("mount ")).collect();
    assert_eq!(
        mount_commands,
        vec![
            &format!("mount /dev/loop7p2 {}", harness.staging.display()),
            &format!("mount /dev/loop7p1 {}", harness.staging.join("boot").display()),
        ]
    );
    let unmounts: Vec<&String> = rendered.iter().filter(|c| c.starts_with("umount ")).collect();
    assert_eq!(
        unmounts,
        vec![
            &format!("umount {}", harness.staging.join("boot").display()),
            &format!("umount {}", harness.staging.display()),
        ]
    );
}

/// Hook that fails after a fixed number of entries
struct AbortAfter {
    remaining: AtomicUsize,
}

impl BackupHook for AbortAfter {
    fn on_entry(&self, _entry: &ArchiveEntry) -> Result<()> {
        if self.remaining.fetch_sub(1, Ordering::SeqCst) == 0 {
            return Err(SysbackError::Hook("simulated interruption".to_string()));
        }
        Ok(())
    }
}

/// Scenario D: interrupted encoding leaves no trace
#[test]
fn scenario_interrupted_backup_leaves_catalog_unchanged() {
    let harness = SysbackTestHarness::new();
    let before = harness.sysback().backup(Some("before")).unwrap().snapshot;

    let sysback = SysbackBuilder::new()
        .config(harness.config())
        .exclusion_rules(ExclusionRules::empty())
        .hook(Arc::new(AbortAfter {
            remaining: AtomicUsize::new(4),
        }))
        .build()
        .unwrap();
    let err = sysback.backup(Some("doomed")).unwrap_err();
    assert!(matches!(err, SysbackError::Hook(_)));

    let ids: Vec<String> = sysback.list().unwrap().into_iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![before.id.clone()]);

    let mut leftovers: Vec<String> = fs::read_dir(&harness.snapshots)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    leftovers.sort();
    assert_eq!(leftovers, vec![format!("{}.sba", before.id)]);

    // The lock was released on the error path.
    assert!(lock::CatalogLock::acquire(&harness.state).is_ok());
}
