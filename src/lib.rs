//! # sysback - Whole-system snapshots and bare-metal restore
//!
//! Captures a Linux root filesystem into a single streaming archive, keeps a
//! durable catalog of those archives and restores any of them onto a fresh
//! disk: partitioning, formatting, extracting and making it bootable.
//!
//! ## Overview
//!
//! - **Archive codec** ([`archive`]): a self-describing record stream of
//!   directories, files, symlinks and special files with their metadata,
//!   optionally LZ4-compressed, ending in a trailer that makes truncation
//!   detectable.
//! - **Exclusion filter** ([`exclusion`]): glob rules deciding which subtrees
//!   are left out, plus implicit exclusions for the tool's own state.
//! - **Snapshot catalog** ([`catalog`]): one JSON record per snapshot,
//!   written atomically, with a one-way `pending → verified → corrupt`
//!   status.
//! - **Backup** ([`backup`]) and **restore** ([`restore`]) orchestrators:
//!   explicit stage machines that log every transition and hold the catalog
//!   lock for their whole run.
//! - **Device layer** ([`device`], [`bootloader`]): `parted`, `mkfs`,
//!   `mount` and `grub-install` driven through an [`Executor`] so every
//!   command can be recorded instead of run.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sysback::{BootTarget, Config, RestorePlan, SysbackBuilder};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let sysback = SysbackBuilder::new()
//!     .config(Config::load(std::path::Path::new("/etc/sysback.json"))?)
//!     .build()?;
//!
//! // Capture the running system
//! let report = sysback.backup(Some("nightly"))?;
//! println!("Created {} ({})", report.snapshot.id, report.snapshot.status);
//!
//! // Later, on a rescue system: rebuild /dev/sdb from it
//! let plan = RestorePlan::new("/dev/sdb", BootTarget::Uefi, "/mnt/sysback-target")
//!     .partition("efi:512M:fat32".parse()?)
//!     .partition("swap:2G:swap".parse()?)
//!     .partition("root:remaining:ext4".parse()?);
//! let restored = sysback.restore(&report.snapshot.id, plan)?;
//! println!("Restored {} entries", restored.entries_restored);
//! # Ok(())
//! # }
//! ```
//!
//! ## Safety
//!
//! Restore verifies the archive checksum before touching the target device;
//! a mismatch marks the snapshot corrupt and nothing is written. Once
//! partitioning starts there is no rollback: a failure from that point is
//! reported as [`SysbackError::Restore`] carrying the stage it failed in and
//! whether the disk was modified.

pub mod archive;
pub mod backup;
pub mod bootloader;
pub mod catalog;
pub mod compression;
pub mod config;
pub mod device;
pub mod error;
pub mod exclusion;
pub mod lock;
pub mod restore;
pub mod sysback;
pub mod types;
pub mod utils;
pub mod verification;
pub mod walker;

pub use archive::{decode, encode, ArchiveReader, ArchiveSummary, ArchiveWriter, ExtractOptions};
pub use backup::{BackupOptions, BackupOrchestrator};
pub use bootloader::{BootFixRequest, BootloaderInstaller, GrubInstaller};
pub use catalog::SnapshotCatalog;
pub use compression::CompressionMode;
pub use config::Config;
pub use device::{DeviceProvisioner, Executor, Provisioner, RecordingExecutor, SystemExecutor};
pub use error::{Result, RestoreFailure, SysbackError};
pub use exclusion::ExclusionRules;
pub use restore::{RestoreOptions, RestoreOrchestrator};
pub use sysback::{planned_commands, Sysback, SysbackBuilder};
pub use types::*;
pub use verification::{SnapshotVerifier, VerificationReport};
pub use walker::{WalkOptions, WalkedEntry, Walker};

/// Crate version recorded in every snapshot
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
