//! Snapshot integrity checking
//!
//! A snapshot is trusted when the SHA-256 of its archive file matches the
//! checksum recorded at backup time. Deep verification additionally walks the
//! whole record stream: every header must decode, every content block must be
//! present and the trailer counts must agree with the catalog.
//!
//! ```rust,no_run
//! use sysback::catalog::SnapshotCatalog;
//! use sysback::verification::SnapshotVerifier;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let catalog = SnapshotCatalog::open(Path::new("/var/lib/sysback"))?;
//! let report = SnapshotVerifier::new().verify_and_update(&catalog, "20240309-140507", true)?;
//! println!("{}", report.summary());
//! # Ok(())
//! # }
//! ```

use crate::archive::ArchiveReader;
use crate::catalog::SnapshotCatalog;
use crate::error::{Result, SysbackError};
use crate::types::{Snapshot, SnapshotStatus};
use crate::utils;
use std::fs::File;
use std::io::BufReader;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Outcome of verifying one snapshot
#[derive(Debug, Clone)]
pub struct VerificationReport {
    /// Snapshot that was checked
    pub snapshot_id: String,
    /// Checksum recorded in the catalog
    pub expected: String,
    /// Checksum of the archive as it is now
    pub actual: String,
    /// `Verified` or `Corrupt`
    pub status: SnapshotStatus,
    /// Entries decoded in deep mode
    pub entries_checked: Option<u64>,
    /// What went wrong, if anything
    pub problems: Vec<String>,
    /// Time taken
    pub duration: Duration,
}

impl VerificationReport {
    /// Whether the archive can be trusted
    pub fn is_valid(&self) -> bool {
        self.status == SnapshotStatus::Verified
    }

    /// One-line human readable summary
    pub fn summary(&self) -> String {
        if self.is_valid() {
            match self.entries_checked {
                Some(n) => format!("{}: OK ({} entries decoded)", self.snapshot_id, n),
                None => format!("{}: OK", self.snapshot_id),
            }
        } else {
            format!("{}: CORRUPT ({})", self.snapshot_id, self.problems.join("; "))
        }
    }
}

/// Checks archives against their catalog records
#[derive(Debug, Default, Clone, Copy)]
pub struct SnapshotVerifier;

impl SnapshotVerifier {
    /// Create a verifier
    pub fn new() -> Self {
        Self
    }

    /// Verify one snapshot without touching the catalog
    ///
    /// Only bytes that were read and failed a check make a snapshot corrupt.
    ///
    /// # Errors
    ///
    /// - [`SysbackError::PathIo`] or [`SysbackError::Io`] if the archive is
    ///   missing or cannot be read
    #[instrument(skip(self, snapshot), fields(id = %snapshot.id))]
    pub fn verify(&self, snapshot: &Snapshot, deep: bool) -> Result<VerificationReport> {
        let start = Instant::now();
        let mut problems = Vec::new();

        let actual = utils::hash_file_content(&snapshot.archive_path)?;
        if actual != snapshot.checksum {
            problems.push(format!(
                "checksum mismatch: expected {}, found {}",
                snapshot.checksum, actual
            ));
        }

        let entries_checked = if deep && problems.is_empty() {
            match self.decode_all(snapshot) {
                Ok(count) => {
                    if count != snapshot.entry_count {
                        problems.push(format!(
                            "archive holds {} entries, catalog records {}",
                            count, snapshot.entry_count
                        ));
                    }
                    Some(count)
                }
                Err(e @ (SysbackError::Io(_) | SysbackError::PathIo { .. })) => return Err(e),
                Err(e) => {
                    problems.push(format!("archive does not decode: {}", e));
                    None
                }
            }
        } else {
            None
        };

        let status = if problems.is_empty() {
            SnapshotStatus::Verified
        } else {
            SnapshotStatus::Corrupt
        };
        debug!(status = %status, "Verification finished");

        Ok(VerificationReport {
            snapshot_id: snapshot.id.clone(),
            expected: snapshot.checksum.clone(),
            actual,
            status,
            entries_checked,
            problems,
            duration: start.elapsed(),
        })
    }

    fn decode_all(&self, snapshot: &Snapshot) -> Result<u64> {
        let file = File::open(&snapshot.archive_path).map_err(|e| SysbackError::path_io(&snapshot.archive_path, e))?;
        let mut count = 0;
        for entry in ArchiveReader::new(BufReader::new(file))?.entries() {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    /// Verify a catalogued snapshot and record the outcome
    ///
    /// A passing archive moves `pending` to `verified`; a failing one is
    /// marked `corrupt`. A record already marked corrupt stays corrupt even
    /// if its archive now checks out. An archive that cannot be read leaves
    /// the record untouched.
    ///
    /// # Errors
    ///
    /// - [`SysbackError::SnapshotNotFound`] if `id` is not recorded
    /// - [`SysbackError::PathIo`] if the archive cannot be read
    pub fn verify_and_update(&self, catalog: &SnapshotCatalog, id: &str, deep: bool) -> Result<VerificationReport> {
        let snapshot = catalog.get(id)?;
        let mut report = self.verify(&snapshot, deep)?;

        match (report.status, snapshot.status) {
            (SnapshotStatus::Verified, SnapshotStatus::Corrupt) => {
                warn!(id = %id, "Archive checks out but the record is marked corrupt; leaving it corrupt");
                report.status = SnapshotStatus::Corrupt;
                report.problems.push("previously marked corrupt".to_string());
            }
            (SnapshotStatus::Verified, _) => {
                catalog.mark_verified(id)?;
            }
            _ => {
                catalog.mark_corrupt(id)?;
            }
        }
        info!(id = %id, status = %report.status, "Verified snapshot");
        Ok(report)
    }
}
