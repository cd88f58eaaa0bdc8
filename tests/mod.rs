//! Main test module for sysback
//!
//! This module includes all test suites:
//! - Integration tests running backup and restore end to end
//! - Acceptance scenarios
//! - Property-based tests for codec and exclusion invariants

pub mod integration;
pub mod property;
pub mod scenarios;

#[cfg(test)]
mod edge_cases {
    use crate::integration::{tree, SysbackTestHarness};
    use ::sysback::*;
    use std::ffi::OsStr;
    use std::fs;
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    fn test_empty_source_directory() {
        let source = TempDir::new().unwrap();
        let state = TempDir::new().unwrap();
        let config = Config {
            source_root: source.path().to_path_buf(),
            state_dir: state.path().to_path_buf(),
            excludes_path: state.path().join("none"),
            includes_path: state.path().join("none"),
            log_file: None,
            ..Config::default()
        };
        let sysback = SysbackBuilder::new()
            .config(config)
            .exclusion_rules(ExclusionRules::empty())
            .build()
            .unwrap();

        let snapshot = sysback.backup(None).unwrap().snapshot;
        // Only the root entry.
        assert_eq!(snapshot.entry_count, 1);
        assert_eq!(snapshot.uncompressed_size, 0);
        assert!(sysback.verify(&snapshot.id, true).unwrap().is_valid());
    }

    #[test]
    fn test_non_utf8_and_special_filenames() {
        let harness = SysbackTestHarness::new();
        let names: Vec<&[u8]> = vec![
            b"file with spaces.txt",
            b"file@with#special$chars.txt",
            "файл.txt".as_bytes(),
            b"latin1-\xe9t\xe9.txt",
            b"newline\nin-name",
        ];
        for name in &names {
            let path = harness.source.join("names").join(OsStr::from_bytes(name));
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, name).unwrap();
        }

        let sysback = harness.sysback();
        let id = sysback.backup(None).unwrap().snapshot.id;
        sysback.restore(&id, harness.plan()).unwrap();

        for name in &names {
            let restored = harness.staging.join("names").join(OsStr::from_bytes(name));
            assert_eq!(fs::read(&restored).unwrap(), name.to_vec());
        }
    }

    #[test]
    fn test_setuid_and_sticky_bits_survive() {
        let harness = SysbackTestHarness::new();
        harness.write("usr/bin/passwd", b"\x7fELF", 0o4755);
        fs::create_dir_all(harness.source.join("var/tmp")).unwrap();
        fs::set_permissions(harness.source.join("var/tmp"), fs::Permissions::from_mode(0o1777)).unwrap();

        let sysback = harness.sysback();
        let id = sysback.backup(None).unwrap().snapshot.id;
        sysback.restore(&id, harness.plan()).unwrap();

        let mode = |p: &str| fs::metadata(harness.staging.join(p)).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode("usr/bin/passwd"), 0o4755);
        assert_eq!(mode("var/tmp"), 0o1777);
    }

    #[test]
    fn test_file_larger_than_copy_buffer() {
        let harness = SysbackTestHarness::new();
        let big: Vec<u8> = (0..3 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect();
        harness.write("var/lib/big.img", &big, 0o644);

        let sysback = harness.sysback();
        let snapshot = sysback.backup(None).unwrap().snapshot;
        assert!(snapshot.compressed_size < snapshot.uncompressed_size);
        sysback.restore(&snapshot.id, harness.plan()).unwrap();
        assert_eq!(fs::read(harness.staging.join("var/lib/big.img")).unwrap(), big);
    }

    #[test]
    fn test_restore_into_populated_staging_replaces_files() {
        let harness = SysbackTestHarness::new();
        let sysback = harness.sysback();
        let id = sysback.backup(None).unwrap().snapshot.id;

        fs::create_dir_all(harness.staging.join("etc")).unwrap();
        fs::write(harness.staging.join("etc/hostname"), b"stale").unwrap();
        sysback.restore(&id, harness.plan()).unwrap();

        let restored = tree(&harness.staging);
        assert_eq!(restored, tree(&harness.source));
        assert!(restored.contains_key(&PathBuf::from("etc/hostname")));
    }
}
