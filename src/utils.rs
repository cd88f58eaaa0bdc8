//! Utility functions for sysback
//!
//! Common helpers used by the catalog, the orchestrators and the command
//! line front end.
//!
//! ## Categories of Utilities
//!
//! ### File Operations
//! - File content hashing (SHA-256)
//! - Durable atomic file writing
//! - Permission and symlink helpers
//!
//! ### Mount Table
//! - Parsing `/proc/self/mounts`
//! - Mount point checks used by backup preflight
//!
//! ### Naming
//! - Snapshot label sanitizing and id generation
//! - Human-readable byte formatting
//!
//! ## Example Usage
//!
//! ```rust
//! use sysback::utils::{format_bytes, sanitize_label};
//!
//! assert_eq!(format_bytes(1536), "1.50 KB");
//! assert_eq!(sanitize_label("Before Upgrade!"), "before_upgrade_");
//! ```

use crate::error::{Result, SysbackError};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Longest label kept after sanitizing
pub const MAX_LABEL_LEN: usize = 40;

/// Hash a file's content using SHA-256
///
/// Reads the file in 64KB chunks so arbitrarily large archives can be
/// verified without loading them into memory.
///
/// # Arguments
///
/// * `path` - Path to the file to hash
///
/// # Returns
///
/// Returns the SHA-256 hash as a 64-character lowercase hexadecimal string.
///
/// # Errors
///
/// - [`SysbackError::PathIo`] if the file cannot be opened or read
pub fn hash_file_content(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| SysbackError::path_io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let bytes_read = file
            .read(&mut buffer)
            .map_err(|e| SysbackError::path_io(path, e))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Hash arbitrary data using SHA-256
pub fn hash_data(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Format bytes in human-readable form
///
/// Uses 1024 as the conversion factor.
///
/// # Example
///
/// ```rust
/// use sysback::utils::format_bytes;
///
/// assert_eq!(format_bytes(0), "0 B");
/// assert_eq!(format_bytes(1024), "1.00 KB");
/// assert_eq!(format_bytes(1_073_741_824), "1.00 GB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// Durable atomic file write
///
/// Writes `content` to a temporary file in the same directory, flushes it to
/// disk, renames it over `path` and finally syncs the directory so the rename
/// itself survives a crash. Readers see either the old file or the new one,
/// never a partial write.
///
/// # Errors
///
/// - [`SysbackError::PathIo`] if any write, sync or rename fails
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| SysbackError::internal(format!("{:?} has no parent directory", path)))?;

    let mut temp = tempfile::Builder::new()
        .prefix(".sysback-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| SysbackError::path_io(dir, e))?;
    temp.write_all(content)
        .and_then(|_| temp.as_file().sync_all())
        .map_err(|e| SysbackError::path_io(temp.path(), e))?;
    temp.persist(path)
        .map_err(|e| SysbackError::path_io(path, e.error))?;

    sync_dir(dir)?;
    trace!("Atomically wrote {} bytes to {:?}", content.len(), path);
    Ok(())
}

/// fsync a directory so renames and unlinks inside it are durable
pub fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| SysbackError::path_io(dir, e))
}

/// Set Unix permissions without following symlinks' targets
pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| SysbackError::path_io(path, e))
}

/// Create a symlink at `link` pointing to `target`
pub fn create_symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link).map_err(|e| SysbackError::path_io(link, e))
}

/// Normalize a user-supplied snapshot label
///
/// Lowercases, replaces anything outside `[a-z0-9._-]` with `_` and caps the
/// length at [`MAX_LABEL_LEN`]. An empty result becomes `auto`.
pub fn sanitize_label(label: &str) -> String {
    let cleaned: String = label
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_LABEL_LEN)
        .collect();

    if cleaned.is_empty() {
        "auto".to_string()
    } else {
        cleaned
    }
}

/// Build a snapshot id from a creation time and optional label
///
/// Ids sort lexicographically in creation order: `YYYYmmdd-HHMMSS[_label]`.
pub fn snapshot_id(created_at: DateTime<Utc>, label: Option<&str>) -> String {
    let stamp = created_at.format("%Y%m%d-%H%M%S").to_string();
    match label {
        Some(l) => format!("{}_{}", stamp, l),
        None => stamp,
    }
}

/// One line of the kernel mount table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Mounted source (device or pseudo filesystem name)
    pub source: String,
    /// Absolute mount point
    pub target: PathBuf,
    /// Filesystem type
    pub fstype: String,
}

/// Parse a mount table in `/proc/self/mounts` format
pub fn parse_mount_table(contents: &str) -> Vec<MountEntry> {
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let target = fields.next()?;
            let fstype = fields.next()?;
            Some(MountEntry {
                source: unescape_mount_field(source),
                target: PathBuf::from(unescape_mount_field(target)),
                fstype: fstype.to_string(),
            })
        })
        .collect()
}

/// Decode the octal escapes (`\040` etc.) the kernel uses in mount fields
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let decoded = std::str::from_utf8(&bytes[i + 1..i + 4])
                .ok()
                .and_then(|oct| u8::from_str_radix(oct, 8).ok());
            if let Some(v) = decoded {
                out.push(v);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Read the live mount table
pub fn read_mount_table() -> Result<Vec<MountEntry>> {
    let path = Path::new("/proc/self/mounts");
    let contents = fs::read_to_string(path).map_err(|e| SysbackError::path_io(path, e))?;
    Ok(parse_mount_table(&contents))
}

/// Whether `path` is exactly a mount point in the given table
pub fn is_mount_point(table: &[MountEntry], path: &Path) -> bool {
    table.iter().any(|m| m.target == path)
}

/// Parse active swap devices from `/proc/swaps`
pub fn parse_swaps(contents: &str) -> Vec<PathBuf> {
    contents
        .lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .map(|dev| PathBuf::from(unescape_mount_field(dev)))
        .collect()
}

/// Read the active swap devices
pub fn read_swaps() -> Result<Vec<PathBuf>> {
    let path = Path::new("/proc/swaps");
    match fs::read_to_string(path) {
        Ok(contents) => Ok(parse_swaps(&contents)),
        // Kernels built without swap support have no /proc/swaps.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(SysbackError::path_io(path, e)),
    }
}

/// Read a pattern list file, skipping blanks and `#` comments
///
/// A missing file yields `None` so callers can fall back to defaults.
pub fn read_pattern_file(path: &Path) -> Result<Option<Vec<String>>> {
    match fs::read_to_string(path) {
        Ok(contents) => {
            let patterns: Vec<String> = contents
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(str::to_string)
                .collect();
            debug!("Read {} patterns from {:?}", patterns.len(), path);
            Ok(Some(patterns))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(SysbackError::path_io(path, e)),
    }
}
