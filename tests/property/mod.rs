//! Property-based testing for sysback
//!
//! Uses proptest to check the codec and the exclusion filter against
//! randomly generated trees.

use ::sysback::*;
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Relative file paths, 1-3 components deep
fn path_strategy() -> impl Strategy<Value = PathBuf> {
    (
        prop::collection::vec("[a-z]{1,6}", 0..=2),
        prop_oneof!["[a-z]{1,8}\\.(txt|conf|bin)", "[a-z0-9_-]{3,10}"],
    )
        .prop_map(|(dirs, name)| {
            let mut path: PathBuf = dirs.into_iter().collect();
            path.push(name);
            path
        })
}

/// A tree as a map of relative path to content
fn tree_strategy() -> impl Strategy<Value = BTreeMap<PathBuf, Vec<u8>>> {
    prop::collection::btree_map(path_strategy(), prop::collection::vec(any::<u8>(), 0..4096), 1..24)
}

/// Materialize a generated tree, skipping paths that collide with a file
fn build_tree(root: &Path, files: &BTreeMap<PathBuf, Vec<u8>>) -> BTreeMap<PathBuf, Vec<u8>> {
    let mut written = BTreeMap::new();
    for (path, content) in files {
        let full = root.join(path);
        let blocked = path
            .ancestors()
            .skip(1)
            .any(|a| !a.as_os_str().is_empty() && root.join(a).is_file());
        if blocked || full.is_dir() {
            continue;
        }
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&full, content).unwrap();
        written.insert(path.clone(), content.clone());
    }
    written
}

fn read_files(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    walkdir::WalkDir::new(root)
        .into_iter()
        .map(|e| e.unwrap())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            (
                e.path().strip_prefix(root).unwrap().to_path_buf(),
                fs::read(e.path()).unwrap(),
            )
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Encoding then decoding reproduces every file byte for byte
    #[test]
    fn archive_round_trip(files in tree_strategy(), compressed in any::<bool>()) {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let written = build_tree(src.path(), &files);

        let mode = if compressed { CompressionMode::Fast } else { CompressionMode::None };
        let walker = Walker::new(src.path(), &ExclusionRules::empty(), WalkOptions::default());
        let (bytes, summary) = encode(walker, Vec::new(), mode).unwrap();
        prop_assert_eq!(summary.content_bytes, written.values().map(|c| c.len() as u64).sum::<u64>());
        prop_assert_eq!(summary.checksum, utils::hash_data(&bytes));

        let count = decode(bytes.as_slice(), dst.path(), ExtractOptions::default())
            .unwrap()
            .run()
            .unwrap();
        prop_assert_eq!(count as u64, summary.entries);
        prop_assert_eq!(read_files(dst.path()), written);
    }

    /// Every entry's parent directory appears before it
    #[test]
    fn parents_precede_children(files in tree_strategy()) {
        let src = TempDir::new().unwrap();
        build_tree(src.path(), &files);

        let walker = Walker::new(src.path(), &ExclusionRules::empty(), WalkOptions::default());
        let (bytes, _) = encode(walker, Vec::new(), CompressionMode::Fast).unwrap();

        let mut seen = BTreeSet::new();
        for entry in ArchiveReader::new(bytes.as_slice()).unwrap().entries() {
            let entry = entry.unwrap();
            if !entry.is_root() {
                let parent = entry.path.parent().unwrap();
                let parent = if parent.as_os_str().is_empty() { Path::new(".") } else { parent };
                prop_assert!(seen.contains(parent), "{:?} came before its parent", entry.path);
            }
            seen.insert(entry.path.clone());
        }
    }

    /// Excluding one top-level directory removes exactly its subtree
    #[test]
    fn exclusion_removes_only_the_subtree(files in tree_strategy(), pick in any::<prop::sample::Index>()) {
        let src = TempDir::new().unwrap();
        let written = build_tree(src.path(), &files);

        let top_dirs: Vec<PathBuf> = written
            .keys()
            .filter(|p| p.components().count() > 1)
            .filter_map(|p| p.components().next().map(|c| PathBuf::from(c.as_os_str())))
            .collect();
        prop_assume!(!top_dirs.is_empty());
        let excluded = pick.get(&top_dirs).clone();

        let rules = ExclusionRules::new([format!("/{}", excluded.display())]).unwrap();
        let walker = Walker::new(src.path(), &rules, WalkOptions::default());
        let (bytes, _) = encode(walker, Vec::new(), CompressionMode::Fast).unwrap();
        let archived: BTreeSet<PathBuf> = ArchiveReader::new(bytes.as_slice())
            .unwrap()
            .entries()
            .map(|e| e.unwrap().path)
            .collect();

        for path in written.keys() {
            if path.starts_with(&excluded) {
                prop_assert!(!archived.contains(path), "{:?} should be excluded", path);
            } else {
                prop_assert!(archived.contains(path), "{:?} should be kept", path);
            }
        }
    }

    /// Labels always become safe, bounded id suffixes
    #[test]
    fn sanitized_labels_are_safe(label in "\\PC{0,80}") {
        let clean = utils::sanitize_label(&label);
        prop_assert!(!clean.is_empty());
        prop_assert!(clean.chars().count() <= utils::MAX_LABEL_LEN);
        prop_assert!(clean.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "._-".contains(c)));
    }
}
