//! Core data types used throughout sysback
//!
//! This module contains the data structures shared by the archive codec, the
//! catalog and the two orchestrators.
//!
//! ## Overview
//!
//! - **Archive**: `ArchiveEntry`, `EntryKind`, `ContentRef` - one captured filesystem object
//! - **Catalog**: `Snapshot`, `SnapshotStatus`, `HostInfo` - durable snapshot records
//! - **Restore**: `RestorePlan`, `PartitionSpec`, `MountedLayout` - target device layout
//! - **State machines**: `BackupStage`, `RestoreStage`, `ProvisionStep`, `StageLog`
//! - **Hooks**: `BackupHook` - extensibility points for custom behavior
//!
//! ## Examples
//!
//! ```rust
//! use sysback::types::{RestorePlan, PartitionSpec, BootTarget};
//!
//! let plan = RestorePlan::new("/dev/sdb", BootTarget::Uefi, "/mnt/sysback-root")
//!     .partition("efi:512MiB:fat32".parse::<PartitionSpec>().unwrap())
//!     .partition("root:remaining:ext4".parse::<PartitionSpec>().unwrap());
//! assert!(plan.validate().is_ok());
//! ```

use crate::error::{Result, SysbackError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

/// Kind of special file captured in an archive
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SpecialKind {
    /// Named pipe
    Fifo,
    /// Character device node
    CharDevice,
    /// Block device node
    BlockDevice,
    /// Unix domain socket
    Socket,
}

/// Type of a captured filesystem object
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EntryKind {
    /// Directory
    Directory,
    /// Regular file; content follows the entry in the stream
    File,
    /// Symbolic link
    Symlink,
    /// FIFO, socket or device node
    Special(SpecialKind),
}

/// Location of a regular file's content in the uncompressed payload
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContentRef {
    /// Payload offset of the first content byte
    pub offset: u64,
    /// Number of content bytes
    pub length: u64,
}

/// One filesystem object captured in an archive
///
/// Paths are relative to the snapshot root; the root itself is `.`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Path relative to the snapshot root
    #[serde(with = "path_bytes")]
    pub path: PathBuf,
    /// Object type
    pub kind: EntryKind,
    /// Unix mode bits (permission bits plus setuid/setgid/sticky)
    pub mode: u32,
    /// Owner uid
    pub uid: u32,
    /// Owner gid
    pub gid: u32,
    /// Modification time, seconds since the epoch
    pub mtime: i64,
    /// Modification time, nanosecond part
    pub mtime_nsec: u32,
    /// Content size in bytes (regular files only, 0 otherwise)
    pub size: u64,
    /// Where the content sits in the payload (regular files only)
    pub content: Option<ContentRef>,
    /// Symlink target
    #[serde(with = "opt_path_bytes")]
    pub link_target: Option<PathBuf>,
    /// Device number for device nodes
    pub rdev: u64,
}

impl ArchiveEntry {
    /// Whether this entry is a directory
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Whether this entry is the snapshot root
    pub fn is_root(&self) -> bool {
        self.path == Path::new(".")
    }

    /// Permission bits only
    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }
}

/// Serialize paths as raw bytes so non-UTF-8 names survive
mod path_bytes {
    use serde::{Deserializer, Serializer};
    use std::ffi::OsString;
    use std::os::unix::ffi::{OsStrExt, OsStringExt};
    use std::path::PathBuf;

    pub fn serialize<S: Serializer>(path: &PathBuf, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(path.as_os_str().as_bytes())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<PathBuf, D::Error> {
        let bytes: Vec<u8> = serde_bytes_vec(d)?;
        Ok(PathBuf::from(OsString::from_vec(bytes)))
    }

    pub(super) fn serde_bytes_vec<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        struct BytesVisitor;

        impl<'de> serde::de::Visitor<'de> for BytesVisitor {
            type Value = Vec<u8>;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a byte string")
            }

            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Vec<u8>, E> {
                Ok(v.to_vec())
            }

            fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> Result<Vec<u8>, E> {
                Ok(v)
            }

            fn visit_seq<A: serde::de::SeqAccess<'de>>(self, mut seq: A) -> Result<Vec<u8>, A::Error> {
                let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(b) = seq.next_element::<u8>()? {
                    out.push(b);
                }
                Ok(out)
            }
        }

        d.deserialize_byte_buf(BytesVisitor)
    }
}

mod opt_path_bytes {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::path::PathBuf;

    #[derive(Serialize, Deserialize)]
    struct Raw(#[serde(with = "super::path_bytes")] PathBuf);

    pub fn serialize<S: Serializer>(path: &Option<PathBuf>, s: S) -> Result<S::Ok, S::Error> {
        match path {
            Some(p) => s.serialize_some(&Raw(p.clone())),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<PathBuf>, D::Error> {
        Ok(Option::<Raw>::deserialize(d)?.map(|raw| raw.0))
    }
}

/// Verification status of a snapshot
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotStatus {
    /// Recorded, not yet re-verified
    Pending,
    /// Checksum confirmed against the archive bytes
    Verified,
    /// Checksum mismatch; terminal
    Corrupt,
}

impl fmt::Display for SnapshotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotStatus::Pending => write!(f, "pending"),
            SnapshotStatus::Verified => write!(f, "verified"),
            SnapshotStatus::Corrupt => write!(f, "corrupt"),
        }
    }
}

/// Information about the host system
///
/// Captures system information at the time of snapshot creation for
/// auditing purposes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostInfo {
    /// Hostname
    pub hostname: String,
    /// Operating system
    pub os: String,
    /// Architecture
    pub arch: String,
}

impl Default for HostInfo {
    fn default() -> Self {
        Self {
            hostname: hostname::get()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}

/// A point-in-time backup archive plus its catalog metadata
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Snapshot {
    /// Stable identity derived from the creation timestamp
    pub id: String,
    /// Optional sanitized label
    pub label: Option<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Root of the captured tree
    pub source_root: PathBuf,
    /// Final archive location
    pub archive_path: PathBuf,
    /// Archive size on disk
    pub compressed_size: u64,
    /// Sum of captured file content sizes
    pub uncompressed_size: u64,
    /// Number of archive entries
    pub entry_count: u64,
    /// SHA-256 of the archive bytes (lowercase hex)
    pub checksum: String,
    /// Verification status
    pub status: SnapshotStatus,
    /// Compression mode name
    pub compression: String,
    /// Host that produced the snapshot
    pub host: HostInfo,
    /// sysback version that produced the snapshot
    pub sysback_version: String,
}

impl Snapshot {
    /// Whether this snapshot may be used as a restore source
    pub fn is_restorable(&self) -> bool {
        self.status != SnapshotStatus::Corrupt
    }
}

/// Role of a partition in a restore plan
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PartitionRole {
    /// Separate /boot
    Boot,
    /// EFI system partition at /boot/efi
    Efi,
    /// Root filesystem
    Root,
    /// Swap space
    Swap,
    /// Additional data filesystem at a caller-chosen mount point
    Data,
}

impl fmt::Display for PartitionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PartitionRole::Boot => "boot",
            PartitionRole::Efi => "efi",
            PartitionRole::Root => "root",
            PartitionRole::Swap => "swap",
            PartitionRole::Data => "data",
        };
        f.write_str(s)
    }
}

impl FromStr for PartitionRole {
    type Err = SysbackError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "boot" => Ok(PartitionRole::Boot),
            "efi" | "esp" => Ok(PartitionRole::Efi),
            "root" => Ok(PartitionRole::Root),
            "swap" => Ok(PartitionRole::Swap),
            "data" => Ok(PartitionRole::Data),
            other => Err(SysbackError::InvalidPlan(format!("unknown partition role '{}'", other))),
        }
    }
}

/// Filesystem created on a partition
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FilesystemType {
    /// ext4
    Ext4,
    /// XFS
    Xfs,
    /// Btrfs
    Btrfs,
    /// FAT32 (boot/EFI)
    Fat32,
    /// Swap signature
    Swap,
}

impl FilesystemType {
    /// Type hint passed to `parted mkpart`
    pub fn parted_hint(&self) -> &'static str {
        match self {
            FilesystemType::Ext4 => "ext4",
            FilesystemType::Xfs => "xfs",
            FilesystemType::Btrfs => "btrfs",
            FilesystemType::Fat32 => "fat32",
            FilesystemType::Swap => "linux-swap",
        }
    }

    /// Type name used in fstab
    pub fn fstab_type(&self) -> &'static str {
        match self {
            FilesystemType::Fat32 => "vfat",
            FilesystemType::Swap => "swap",
            other => other.parted_hint(),
        }
    }
}

impl fmt::Display for FilesystemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FilesystemType::Ext4 => "ext4",
            FilesystemType::Xfs => "xfs",
            FilesystemType::Btrfs => "btrfs",
            FilesystemType::Fat32 => "fat32",
            FilesystemType::Swap => "swap",
        })
    }
}

impl FromStr for FilesystemType {
    type Err = SysbackError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ext4" => Ok(FilesystemType::Ext4),
            "xfs" => Ok(FilesystemType::Xfs),
            "btrfs" => Ok(FilesystemType::Btrfs),
            "fat32" | "vfat" => Ok(FilesystemType::Fat32),
            "swap" | "linux-swap" => Ok(FilesystemType::Swap),
            other => Err(SysbackError::InvalidPlan(format!("unsupported filesystem '{}'", other))),
        }
    }
}

/// Size of a partition
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PartitionSize {
    /// Fixed size in MiB
    Mib(u64),
    /// Rest of the device; only valid for the last partition
    Remaining,
}

impl FromStr for PartitionSize {
    type Err = SysbackError;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        if lower == "remaining" || lower == "rest" || lower == "100%" {
            return Ok(PartitionSize::Remaining);
        }
        let (digits, factor) = if let Some(n) = lower.strip_suffix("gib").or_else(|| lower.strip_suffix('g')) {
            (n, 1024)
        } else if let Some(n) = lower.strip_suffix("mib").or_else(|| lower.strip_suffix('m')) {
            (n, 1)
        } else {
            (lower.as_str(), 1)
        };
        digits
            .trim()
            .parse::<u64>()
            .ok()
            .and_then(|n| n.checked_mul(factor))
            .map(PartitionSize::Mib)
            .ok_or_else(|| SysbackError::InvalidPlan(format!("invalid partition size '{}'", s)))
    }
}

/// One partition in a restore plan
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartitionSpec {
    /// Partition role
    pub role: PartitionRole,
    /// Partition size
    pub size: PartitionSize,
    /// Filesystem to create
    pub filesystem: FilesystemType,
    /// Mount point relative to the restored root (data partitions only)
    pub mount_point: Option<PathBuf>,
}

impl PartitionSpec {
    /// Create a partition spec without a custom mount point
    pub fn new(role: PartitionRole, size: PartitionSize, filesystem: FilesystemType) -> Self {
        Self {
            role,
            size,
            filesystem,
            mount_point: None,
        }
    }

    /// Mount path relative to the restored root, `None` for swap
    pub fn relative_mount(&self) -> Option<PathBuf> {
        match self.role {
            PartitionRole::Root => Some(PathBuf::new()),
            PartitionRole::Boot => Some(PathBuf::from("boot")),
            PartitionRole::Efi => Some(PathBuf::from("boot/efi")),
            PartitionRole::Swap => None,
            PartitionRole::Data => self.mount_point.as_ref().map(|p| {
                p.components()
                    .filter(|c| matches!(c, Component::Normal(_)))
                    .collect()
            }),
        }
    }
}

/// Parses `role:size:fs[:mount]`, e.g. `boot:512MiB:fat32` or `data:remaining:xfs:/home`
impl FromStr for PartitionSpec {
    type Err = SysbackError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() < 3 || parts.len() > 4 {
            return Err(SysbackError::InvalidPlan(format!(
                "partition '{}' must look like role:size:filesystem[:mount]",
                s
            )));
        }
        Ok(Self {
            role: parts[0].parse()?,
            size: parts[1].parse()?,
            filesystem: parts[2].parse()?,
            mount_point: parts.get(3).map(PathBuf::from),
        })
    }
}

/// Firmware boot path for the restored system
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BootTarget {
    /// Legacy BIOS, GRUB in the MBR
    Bios,
    /// UEFI, GRUB on the EFI system partition
    Uefi,
}

impl fmt::Display for BootTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BootTarget::Bios => "bios",
            BootTarget::Uefi => "uefi",
        })
    }
}

impl FromStr for BootTarget {
    type Err = SysbackError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bios" | "mbr" | "legacy" => Ok(BootTarget::Bios),
            "uefi" | "efi" => Ok(BootTarget::Uefi),
            other => Err(SysbackError::InvalidPlan(format!("unknown boot target '{}'", other))),
        }
    }
}

/// A partition that already exists on the target
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExistingPartition {
    /// Device node, e.g. `/dev/sda2`
    pub node: PathBuf,
    /// What the partition is used for
    pub role: PartitionRole,
    /// Filesystem it holds, or is formatted with when `format` is set
    pub filesystem: FilesystemType,
    /// Run mkfs/mkswap on it before mounting
    pub format: bool,
    /// Mount point relative to the restored root (data partitions only)
    pub mount_point: Option<PathBuf>,
}

impl ExistingPartition {
    /// Reuse `node` as is, without formatting
    pub fn new(role: PartitionRole, node: impl Into<PathBuf>, filesystem: FilesystemType) -> Self {
        Self {
            node: node.into(),
            role,
            filesystem,
            format: false,
            mount_point: None,
        }
    }

    /// Format the partition before it is mounted
    pub fn with_format(mut self, format: bool) -> Self {
        self.format = format;
        self
    }

    /// Spec the partition is treated as once mounted
    ///
    /// The size is never used for an existing partition.
    pub fn as_spec(&self) -> PartitionSpec {
        PartitionSpec {
            role: self.role,
            size: PartitionSize::Remaining,
            filesystem: self.filesystem,
            mount_point: self.mount_point.clone(),
        }
    }
}

/// How the target device is prepared
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RestoreMode {
    /// Wipe the device and create the planned partitions
    #[default]
    Disk,
    /// Restore into partitions that already exist; the partition table is not touched
    Partition(Vec<ExistingPartition>),
}

/// Caller-supplied target layout for a restore
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RestorePlan {
    /// Target block device, e.g. `/dev/sdb`; in partition mode the disk GRUB is installed to
    pub device: PathBuf,
    /// Partitions in creation order (disk mode)
    pub partitions: Vec<PartitionSpec>,
    /// Bootloader target
    pub boot: BootTarget,
    /// Where the restored root is assembled
    pub staging: PathBuf,
    /// Disk or partition mode
    #[serde(default)]
    pub mode: RestoreMode,
}

impl RestorePlan {
    /// Start a plan with no partitions
    pub fn new(device: impl Into<PathBuf>, boot: BootTarget, staging: impl Into<PathBuf>) -> Self {
        Self {
            device: device.into(),
            partitions: Vec::new(),
            boot,
            staging: staging.into(),
            mode: RestoreMode::Disk,
        }
    }

    /// Append a partition
    pub fn partition(mut self, spec: PartitionSpec) -> Self {
        self.partitions.push(spec);
        self
    }

    /// Reuse an existing partition; switches the plan to partition mode
    pub fn existing(mut self, part: ExistingPartition) -> Self {
        match &mut self.mode {
            RestoreMode::Partition(parts) => parts.push(part),
            RestoreMode::Disk => self.mode = RestoreMode::Partition(vec![part]),
        }
        self
    }

    /// Switch to partition mode before any partition is named
    pub fn in_partition_mode(mut self) -> Self {
        if self.mode == RestoreMode::Disk {
            self.mode = RestoreMode::Partition(Vec::new());
        }
        self
    }

    /// Existing partitions, empty in disk mode
    pub fn existing_partitions(&self) -> &[ExistingPartition] {
        match &self.mode {
            RestoreMode::Partition(parts) => parts,
            RestoreMode::Disk => &[],
        }
    }

    /// Index of the partition that GRUB's EFI files go on
    pub fn efi_partition(&self) -> Option<usize> {
        self.partitions
            .iter()
            .position(|p| p.role == PartitionRole::Efi)
            .or_else(|| {
                self.partitions
                    .iter()
                    .position(|p| p.role == PartitionRole::Boot && p.filesystem == FilesystemType::Fat32)
            })
    }

    /// Check the plan before anything touches the device
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(SysbackError::InvalidPlan(msg));

        if !self.device.is_absolute() {
            return invalid(format!("device {:?} must be an absolute path", self.device));
        }
        if self.staging.as_os_str().is_empty() || self.staging == Path::new("/") {
            return invalid(format!("staging mount point {:?} is not usable", self.staging));
        }
        if let RestoreMode::Partition(parts) = &self.mode {
            if !self.partitions.is_empty() {
                return invalid("partition mode reuses existing partitions and cannot create new ones".to_string());
            }
            return self.validate_existing(parts);
        }
        if self.partitions.is_empty() {
            return invalid("plan has no partitions".to_string());
        }

        let roots = self.partitions.iter().filter(|p| p.role == PartitionRole::Root).count();
        if roots != 1 {
            return invalid(format!("plan needs exactly one root partition, found {}", roots));
        }

        let last = self.partitions.len() - 1;
        let mut mounts: Vec<PathBuf> = Vec::new();
        // Partitions start after the first MiB.
        let mut end_mib: u64 = 1;
        for (i, part) in self.partitions.iter().enumerate() {
            match part.size {
                PartitionSize::Remaining if i != last => {
                    return invalid(format!("partition {} uses 'remaining' but is not last", i + 1));
                }
                PartitionSize::Mib(0) => {
                    return invalid(format!("partition {} has zero size", i + 1));
                }
                PartitionSize::Mib(mib) => match end_mib.checked_add(mib) {
                    Some(end) => end_mib = end,
                    None => return invalid(format!("partition {} is too large", i + 1)),
                },
                PartitionSize::Remaining => {}
            }

            check_role(&format!("partition {}", i + 1), part)?;

            if let Some(mount) = part.relative_mount() {
                if mounts.contains(&mount) {
                    return invalid(format!("two partitions mount at /{}", mount.display()));
                }
                mounts.push(mount);
            }
        }

        match self.boot {
            BootTarget::Uefi if self.efi_partition().is_none() => {
                invalid("UEFI boot needs a fat32 efi or boot partition".to_string())
            }
            BootTarget::Bios if self.partitions.len() > 4 => {
                invalid("BIOS plans use an msdos label and allow at most 4 partitions".to_string())
            }
            _ => Ok(()),
        }
    }

    fn validate_existing(&self, parts: &[ExistingPartition]) -> Result<()> {
        let invalid = |msg: String| Err(SysbackError::InvalidPlan(msg));

        if parts.is_empty() {
            return invalid("plan has no partitions".to_string());
        }
        let roots = parts.iter().filter(|p| p.role == PartitionRole::Root).count();
        if roots != 1 {
            return invalid(format!("plan needs exactly one root partition, found {}", roots));
        }

        let mut nodes: Vec<&Path> = Vec::new();
        let mut mounts: Vec<PathBuf> = Vec::new();
        for part in parts {
            let what = part.node.display().to_string();
            if !part.node.is_absolute() {
                return invalid(format!("partition {:?} must be an absolute device path", part.node));
            }
            if part.node == self.device {
                return invalid(format!("{} is the whole disk, not a partition", what));
            }
            if nodes.contains(&part.node.as_path()) {
                return invalid(format!("{} is listed twice", what));
            }
            nodes.push(&part.node);

            let spec = part.as_spec();
            check_role(&what, &spec)?;
            if let Some(mount) = spec.relative_mount() {
                if mounts.contains(&mount) {
                    return invalid(format!("two partitions mount at /{}", mount.display()));
                }
                mounts.push(mount);
            }
        }

        let has_esp = parts.iter().any(|p| {
            p.role == PartitionRole::Efi || (p.role == PartitionRole::Boot && p.filesystem == FilesystemType::Fat32)
        });
        if self.boot == BootTarget::Uefi && !has_esp {
            return invalid("UEFI restore needs an existing EFI system partition".to_string());
        }
        Ok(())
    }
}

/// Role and filesystem rules shared by both restore modes
fn check_role(what: &str, part: &PartitionSpec) -> Result<()> {
    let invalid = |msg: String| Err(SysbackError::InvalidPlan(msg));

    let is_swap_fs = part.filesystem == FilesystemType::Swap;
    if (part.role == PartitionRole::Swap) != is_swap_fs {
        return invalid(format!("{}: swap role and swap filesystem must go together", what));
    }
    if part.role == PartitionRole::Efi && part.filesystem != FilesystemType::Fat32 {
        return invalid(format!("{}: EFI partition must be fat32", what));
    }
    if part.role == PartitionRole::Root && part.filesystem == FilesystemType::Fat32 {
        return invalid("root filesystem cannot be fat32".to_string());
    }
    if part.role == PartitionRole::Data {
        match &part.mount_point {
            Some(mp)
                if mp.components().all(|c| matches!(c, Component::Normal(_) | Component::RootDir))
                    && mp.components().any(|c| matches!(c, Component::Normal(_))) => {}
            _ => {
                return invalid(format!("{}: data partitions need a mount point like /home", what));
            }
        }
    }
    Ok(())
}

/// A partition created during provisioning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProvisionedPartition {
    /// 1-based partition number, 0 for a partition sysback did not create
    pub number: u32,
    /// Device node, e.g. `/dev/sdb1`
    pub node: PathBuf,
    /// Spec it was created from
    pub spec: PartitionSpec,
}

/// A mounted partition under the staging root
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MountRecord {
    /// Device node
    pub node: PathBuf,
    /// Partition role
    pub role: PartitionRole,
    /// Absolute mount path
    pub mount_path: PathBuf,
}

/// Result of provisioning: what was created and where it is mounted
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MountedLayout {
    /// Target device
    pub device: PathBuf,
    /// Staging root (the restored `/`)
    pub staging: PathBuf,
    /// Created partitions in table order
    pub partitions: Vec<ProvisionedPartition>,
    /// Mounts in the order they were made
    pub mounts: Vec<MountRecord>,
}

impl MountedLayout {
    /// Partition with the given role
    pub fn partition(&self, role: PartitionRole) -> Option<&ProvisionedPartition> {
        self.partitions.iter().find(|p| p.spec.role == role)
    }

    /// Mount path of the partition holding GRUB's EFI files
    pub fn efi_mount(&self) -> Option<&Path> {
        self.mounts
            .iter()
            .find(|m| m.role == PartitionRole::Efi)
            .or_else(|| {
                self.mounts.iter().find(|m| {
                    m.role == PartitionRole::Boot
                        && self
                            .partition(PartitionRole::Boot)
                            .map(|p| p.spec.filesystem == FilesystemType::Fat32)
                            .unwrap_or(false)
                })
            })
            .map(|m| m.mount_path.as_path())
    }
}

/// Backup state machine
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BackupStage {
    /// Not started
    Idle,
    /// Walking the source tree
    Traversing,
    /// Streaming entries into the temporary archive
    Encoding,
    /// Finalizing the archive digest
    Checksumming,
    /// Publishing the archive and recording it
    Committing,
    /// Finished
    Done,
    /// Aborted
    Failed,
}

impl fmt::Display for BackupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackupStage::Idle => "idle",
            BackupStage::Traversing => "traversing",
            BackupStage::Encoding => "encoding",
            BackupStage::Checksumming => "checksumming",
            BackupStage::Committing => "committing",
            BackupStage::Done => "done",
            BackupStage::Failed => "failed",
        })
    }
}

/// Restore state machine
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum RestoreStage {
    /// Not started
    Idle,
    /// Looking up the snapshot
    Resolving,
    /// Rechecking the archive checksum
    Verifying,
    /// Partitioning, formatting and mounting the target
    Provisioning,
    /// Writing files into the staging root
    Extracting,
    /// Installing and configuring the bootloader
    InstallingBootloader,
    /// Unmounting and syncing
    Finalizing,
    /// Finished
    Done,
    /// Aborted
    Failed,
}

impl RestoreStage {
    /// Whether reaching this stage implies the target device was modified
    pub fn mutates_device(&self) -> bool {
        matches!(
            self,
            RestoreStage::Provisioning
                | RestoreStage::Extracting
                | RestoreStage::InstallingBootloader
                | RestoreStage::Finalizing
        )
    }
}

impl fmt::Display for RestoreStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RestoreStage::Idle => "idle",
            RestoreStage::Resolving => "resolving",
            RestoreStage::Verifying => "verifying",
            RestoreStage::Provisioning => "provisioning",
            RestoreStage::Extracting => "extracting",
            RestoreStage::InstallingBootloader => "installing bootloader",
            RestoreStage::Finalizing => "finalizing",
            RestoreStage::Done => "done",
            RestoreStage::Failed => "failed",
        })
    }
}

/// Device provisioning steps, strictly ordered
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProvisionStep {
    /// Validating the plan and device
    Preflight,
    /// Removing old filesystem and partition-table signatures
    WipeSignatures,
    /// Writing the partition table
    Partition,
    /// Re-reading the partition table and waiting for nodes
    ReloadPartitionTable,
    /// Creating filesystems and swap signatures
    Format,
    /// Mounting under the staging root
    Mount,
    /// Unmounting after restore
    Release,
}

impl fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProvisionStep::Preflight => "preflight",
            ProvisionStep::WipeSignatures => "wipe signatures",
            ProvisionStep::Partition => "partition",
            ProvisionStep::ReloadPartitionTable => "reload partition table",
            ProvisionStep::Format => "format",
            ProvisionStep::Mount => "mount",
            ProvisionStep::Release => "release",
        })
    }
}

/// One-way stage tracker that logs every transition
#[derive(Debug, Clone)]
pub struct StageLog<S> {
    operation: &'static str,
    current: S,
    history: Vec<S>,
}

impl<S: Copy + fmt::Display + PartialEq> StageLog<S> {
    /// Start tracking in the initial stage
    pub fn new(operation: &'static str, initial: S) -> Self {
        Self {
            operation,
            current: initial,
            history: vec![initial],
        }
    }

    /// Move to the next stage
    pub fn advance(&mut self, next: S) {
        info!(operation = self.operation, from = %self.current, to = %next, "stage transition");
        self.current = next;
        self.history.push(next);
    }

    /// Current stage
    pub fn current(&self) -> S {
        self.current
    }

    /// Every stage entered so far, in order
    pub fn history(&self) -> &[S] {
        &self.history
    }
}

/// Progress callback for long-running operations
pub type ProgressCallback = Arc<dyn Fn(ProgressInfo) + Send + Sync>;

/// Information passed to progress callbacks
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    /// Operation being performed
    pub operation: String,
    /// Current item being processed
    pub current_item: Option<String>,
    /// Items processed so far
    pub processed: usize,
    /// Bytes processed so far
    pub bytes_processed: u64,
}

/// Outcome of a completed backup
#[derive(Debug, Clone)]
pub struct BackupReport {
    /// The recorded snapshot (verified or corrupt)
    pub snapshot: Snapshot,
    /// Stages entered, in order
    pub stages: Vec<BackupStage>,
    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
}

/// Outcome of a completed restore
#[derive(Debug, Clone)]
pub struct RestoreReport {
    /// Snapshot that was restored
    pub snapshot_id: String,
    /// Layout that was provisioned
    pub layout: MountedLayout,
    /// Entries written to the target
    pub entries_restored: usize,
    /// File bytes written
    pub bytes_written: u64,
    /// Stages entered, in order
    pub stages: Vec<RestoreStage>,
    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
    /// Non-fatal problems
    pub warnings: Vec<String>,
}

/// Hook trait for observing and vetoing backup progress
pub trait BackupHook: Send + Sync {
    /// Called on every stage transition; an error aborts the backup
    fn on_stage(&self, _stage: BackupStage) -> Result<()> {
        Ok(())
    }

    /// Called before each entry is encoded; an error aborts the backup
    fn on_entry(&self, _entry: &ArchiveEntry) -> Result<()> {
        Ok(())
    }

    /// Called once the snapshot is recorded
    fn post_backup(&self, _snapshot: &Snapshot) -> Result<()> {
        Ok(())
    }
}

/// Hook that does nothing
#[derive(Debug)]
pub struct NoOpHook;

impl BackupHook for NoOpHook {}

#[cfg(test)]
mod tests {
    use super::*;

    fn uefi_plan() -> RestorePlan {
        RestorePlan::new("/dev/sdb", BootTarget::Uefi, "/mnt/staging")
            .partition(PartitionSpec::new(
                PartitionRole::Efi,
                PartitionSize::Mib(512),
                FilesystemType::Fat32,
            ))
            .partition(PartitionSpec::new(
                PartitionRole::Root,
                PartitionSize::Remaining,
                FilesystemType::Ext4,
            ))
    }

    #[test]
    fn test_partition_spec_parsing() {
        let spec: PartitionSpec = "boot:512MiB:fat32".parse().unwrap();
        assert_eq!(spec.role, PartitionRole::Boot);
        assert_eq!(spec.size, PartitionSize::Mib(512));
        assert_eq!(spec.filesystem, FilesystemType::Fat32);

        let spec: PartitionSpec = "data:2G:xfs:/home".parse().unwrap();
        assert_eq!(spec.size, PartitionSize::Mib(2048));
        assert_eq!(spec.relative_mount(), Some(PathBuf::from("home")));

        assert!("root:lots:ext4".parse::<PartitionSpec>().is_err());
        assert!("root:ext4".parse::<PartitionSpec>().is_err());
    }

    #[test]
    fn test_oversized_partition_size_rejected() {
        assert!(matches!(
            "18446744073709551615G".parse::<PartitionSize>(),
            Err(SysbackError::InvalidPlan(_))
        ));
        assert_eq!("18446744073709551615".parse::<PartitionSize>().unwrap(), PartitionSize::Mib(u64::MAX));

        let plan = RestorePlan::new("/dev/sdb", BootTarget::Bios, "/mnt/staging")
            .partition(PartitionSpec::new(PartitionRole::Root, PartitionSize::Mib(u64::MAX), FilesystemType::Ext4));
        assert!(matches!(plan.validate(), Err(SysbackError::InvalidPlan(_))));
    }

    fn partition_mode_plan(boot: BootTarget) -> RestorePlan {
        RestorePlan::new("/dev/sda", boot, "/mnt/staging")
            .existing(ExistingPartition::new(PartitionRole::Root, "/dev/sda2", FilesystemType::Ext4).with_format(true))
            .existing(ExistingPartition::new(PartitionRole::Efi, "/dev/sda1", FilesystemType::Fat32))
    }

    #[test]
    fn test_partition_mode_plan() {
        let plan = partition_mode_plan(BootTarget::Uefi);
        assert!(plan.validate().is_ok());
        assert!(plan.partitions.is_empty());
        assert_eq!(plan.existing_partitions().len(), 2);
        assert!(plan.existing_partitions()[0].format);
        assert!(!plan.existing_partitions()[1].format);

        let empty = RestorePlan::new("/dev/sda", BootTarget::Bios, "/mnt/staging").in_partition_mode();
        assert_eq!(empty.mode, RestoreMode::Partition(Vec::new()));
        assert!(matches!(empty.validate(), Err(SysbackError::InvalidPlan(_))));

        let mixed = partition_mode_plan(BootTarget::Uefi)
            .partition(PartitionSpec::new(PartitionRole::Data, PartitionSize::Mib(100), FilesystemType::Ext4));
        assert!(mixed.validate().is_err());
    }

    #[test]
    fn test_partition_mode_uefi_needs_esp() {
        let plan = RestorePlan::new("/dev/sda", BootTarget::Uefi, "/mnt/staging")
            .existing(ExistingPartition::new(PartitionRole::Root, "/dev/sda2", FilesystemType::Ext4));
        assert!(matches!(plan.validate(), Err(SysbackError::InvalidPlan(_))));

        let bios = RestorePlan::new("/dev/sda", BootTarget::Bios, "/mnt/staging")
            .existing(ExistingPartition::new(PartitionRole::Root, "/dev/sda2", FilesystemType::Ext4));
        assert!(bios.validate().is_ok());
    }

    #[test]
    fn test_partition_mode_rejects_bad_nodes() {
        let whole_disk = RestorePlan::new("/dev/sda", BootTarget::Bios, "/mnt/staging")
            .existing(ExistingPartition::new(PartitionRole::Root, "/dev/sda", FilesystemType::Ext4));
        assert!(whole_disk.validate().is_err());

        let twice = partition_mode_plan(BootTarget::Bios)
            .existing(ExistingPartition::new(PartitionRole::Swap, "/dev/sda2", FilesystemType::Swap));
        assert!(twice.validate().is_err());

        let mixed = partition_mode_plan(BootTarget::Uefi).partition(PartitionSpec::new(
            PartitionRole::Data,
            PartitionSize::Remaining,
            FilesystemType::Xfs,
        ));
        assert!(mixed.validate().is_err());
    }

    #[test]
    fn test_valid_plan() {
        assert!(uefi_plan().validate().is_ok());
    }

    #[test]
    fn test_plan_requires_single_root() {
        let plan = RestorePlan::new("/dev/sdb", BootTarget::Bios, "/mnt/staging").partition(
            PartitionSpec::new(PartitionRole::Swap, PartitionSize::Mib(1024), FilesystemType::Swap),
        );
        assert!(matches!(plan.validate(), Err(SysbackError::InvalidPlan(_))));
    }

    #[test]
    fn test_remaining_must_be_last() {
        let plan = RestorePlan::new("/dev/sdb", BootTarget::Bios, "/mnt/staging")
            .partition(PartitionSpec::new(
                PartitionRole::Root,
                PartitionSize::Remaining,
                FilesystemType::Ext4,
            ))
            .partition(PartitionSpec::new(
                PartitionRole::Swap,
                PartitionSize::Mib(1024),
                FilesystemType::Swap,
            ));
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_uefi_needs_fat_partition() {
        let plan = RestorePlan::new("/dev/sdb", BootTarget::Uefi, "/mnt/staging").partition(
            PartitionSpec::new(PartitionRole::Root, PartitionSize::Remaining, FilesystemType::Ext4),
        );
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_swap_role_and_fs_match() {
        let plan = RestorePlan::new("/dev/sdb", BootTarget::Bios, "/mnt/staging")
            .partition(PartitionSpec::new(
                PartitionRole::Swap,
                PartitionSize::Mib(512),
                FilesystemType::Ext4,
            ))
            .partition(PartitionSpec::new(
                PartitionRole::Root,
                PartitionSize::Remaining,
                FilesystemType::Ext4,
            ));
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_stage_log_history() {
        let mut log = StageLog::new("backup", BackupStage::Idle);
        log.advance(BackupStage::Traversing);
        log.advance(BackupStage::Encoding);
        assert_eq!(log.current(), BackupStage::Encoding);
        assert_eq!(
            log.history(),
            &[BackupStage::Idle, BackupStage::Traversing, BackupStage::Encoding]
        );
    }

    #[test]
    fn test_archive_entry_serializes_non_utf8_path() {
        use std::ffi::OsString;
        use std::os::unix::ffi::OsStringExt;

        let entry = ArchiveEntry {
            path: PathBuf::from(OsString::from_vec(vec![b'a', 0xff, b'b'])),
            kind: EntryKind::Symlink,
            mode: 0o777,
            uid: 0,
            gid: 0,
            mtime: 0,
            mtime_nsec: 0,
            size: 0,
            content: None,
            link_target: Some(PathBuf::from(OsString::from_vec(vec![0xfe, b'x']))),
            rdev: 0,
        };
        let bytes = bincode::serde::encode_to_vec(&entry, bincode::config::standard()).unwrap();
        let (decoded, _): (ArchiveEntry, _) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard()).unwrap();
        assert_eq!(decoded, entry);
    }
}
