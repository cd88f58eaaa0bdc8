//! Error types for sysback
//!
//! Every fallible operation in the crate returns [`Result<T>`]. Errors name
//! the stage or path that failed so that an operator can decide whether a
//! target device is in a known state.

use crate::types::{ProvisionStep, RestoreStage};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Type alias for Results in sysback
pub type Result<T> = std::result::Result<T, SysbackError>;

/// Main error type for all sysback operations
#[derive(Debug, Error)]
pub enum SysbackError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// I/O error tied to a specific path
    #[error("IO error at {path:?}: {source}")]
    PathIo {
        /// Path being read or written
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors during bincode serialization/deserialization
    #[error("Bincode error: {0}")]
    Bincode(String),

    /// Archive stream is truncated or malformed
    #[error("Archive format error: {0}")]
    Format(String),

    /// Archive bytes do not match the recorded checksum
    #[error("Checksum mismatch - expected: {expected}, actual: {actual}")]
    ChecksumMismatch {
        /// Checksum recorded in the catalog
        expected: String,
        /// Checksum computed from the archive now
        actual: String,
    },

    /// Snapshot id not present in the catalog
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// Snapshot already marked corrupt
    #[error("Snapshot {0} is marked corrupt and cannot be restored")]
    SnapshotCorrupt(String),

    /// Illegal snapshot status transition
    #[error("Invalid status transition for snapshot {id}: {from} -> {to}")]
    InvalidTransition {
        /// Snapshot id
        id: String,
        /// Current status
        from: String,
        /// Requested status
        to: String,
    },

    /// Partitioning, formatting or mounting failed
    #[error("Device error during {step}: {message}")]
    Device {
        /// Provisioning step that failed
        step: ProvisionStep,
        /// What went wrong
        message: String,
    },

    /// Bootloader installation or configuration failed
    #[error("Bootloader error: {0}")]
    Bootloader(String),

    /// Device nodes did not appear in time
    #[error("Timed out after {waited:?} waiting for device nodes: {missing:?}")]
    Timeout {
        /// Nodes still missing when the wait expired
        missing: Vec<PathBuf>,
        /// How long we waited
        waited: Duration,
    },

    /// Another process holds the catalog lock
    #[error("Another sysback operation is in progress (lock held: {0:?})")]
    LockHeld(PathBuf),

    /// Restore plan failed validation
    #[error("Invalid restore plan: {0}")]
    InvalidPlan(String),

    /// Exclusion pattern could not be compiled
    #[error("Invalid exclusion pattern: {0}")]
    InvalidPattern(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// External command could not be run or exited non-zero
    #[error("Command `{command}` failed: {message}")]
    Command {
        /// Rendered command line
        command: String,
        /// Exit status or spawn error
        message: String,
    },

    /// Directory traversal error from walkdir
    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// Restore failed after the target device was touched
    #[error("{0}")]
    Restore(Box<RestoreFailure>),

    /// A backup hook aborted the operation
    #[error("Hook aborted operation: {0}")]
    Hook(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Structured report for a restore that failed after provisioning started
#[derive(Debug)]
pub struct RestoreFailure {
    /// Snapshot being restored
    pub snapshot_id: String,
    /// Stage that was running when the failure happened
    pub failed_stage: RestoreStage,
    /// Furthest stage that completed successfully
    pub last_completed: Option<RestoreStage>,
    /// Whether the target device has already been modified
    pub device_mutated: bool,
    /// Underlying cause
    pub cause: SysbackError,
}

impl std::fmt::Display for RestoreFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Restore of {} failed during {} (last completed: {}, device modified: {}): {}",
            self.snapshot_id,
            self.failed_stage,
            self.last_completed
                .map(|s| s.to_string())
                .unwrap_or_else(|| "none".to_string()),
            if self.device_mutated { "yes" } else { "no" },
            self.cause
        )
    }
}

impl From<bincode::error::DecodeError> for SysbackError {
    fn from(err: bincode::error::DecodeError) -> Self {
        SysbackError::Bincode(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for SysbackError {
    fn from(err: bincode::error::EncodeError) -> Self {
        SysbackError::Bincode(err.to_string())
    }
}

impl From<globset::Error> for SysbackError {
    fn from(err: globset::Error) -> Self {
        SysbackError::InvalidPattern(err.to_string())
    }
}

/// Process exit codes handed to callers of the command surface
pub mod exit_code {
    /// Operation succeeded
    pub const SUCCESS: i32 = 0;
    /// Anything not covered below
    pub const GENERAL: i32 = 1;
    /// Bad plan, unknown snapshot or bad configuration
    pub const VALIDATION: i32 = 2;
    /// Archive failed checksum verification
    pub const VERIFICATION: i32 = 3;
    /// Provisioning, extraction or bootloader failure
    pub const DEVICE: i32 = 4;
}

impl SysbackError {
    /// Create a format error with a custom message
    pub fn format(msg: impl Into<String>) -> Self {
        SysbackError::Format(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        SysbackError::Internal(msg.into())
    }

    /// Attach a path to an I/O error
    pub fn path_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SysbackError::PathIo {
            path: path.into(),
            source,
        }
    }

    /// Check if this error indicates archive corruption
    pub fn is_corruption(&self) -> bool {
        match self {
            SysbackError::ChecksumMismatch { .. }
            | SysbackError::SnapshotCorrupt(_)
            | SysbackError::Format(_) => true,
            SysbackError::Restore(failure) => failure.cause.is_corruption(),
            _ => false,
        }
    }

    /// Map the error onto the documented exit code table
    pub fn exit_code(&self) -> i32 {
        match self {
            SysbackError::SnapshotNotFound(_)
            | SysbackError::InvalidPlan(_)
            | SysbackError::InvalidPattern(_)
            | SysbackError::InvalidConfiguration(_) => exit_code::VALIDATION,
            SysbackError::ChecksumMismatch { .. } | SysbackError::SnapshotCorrupt(_) => {
                exit_code::VERIFICATION
            }
            SysbackError::Device { .. }
            | SysbackError::Bootloader(_)
            | SysbackError::Timeout { .. }
            | SysbackError::Restore(_) => exit_code::DEVICE,
            _ => exit_code::GENERAL,
        }
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            SysbackError::SnapshotNotFound(id) => {
                format!("Snapshot '{}' not found. Run 'sysback list' to see available snapshots.", id)
            }
            SysbackError::LockHeld(path) => {
                format!(
                    "Another backup or restore is running (lock {:?}). Wait for it to finish.",
                    path
                )
            }
            SysbackError::ChecksumMismatch { .. } | SysbackError::SnapshotCorrupt(_) => {
                format!("{}. The archive is damaged; nothing was written to the target.", self)
            }
            SysbackError::Restore(failure) if failure.device_mutated => {
                format!(
                    "{}. The target device was modified and may not be bootable; inspect it before retrying.",
                    failure
                )
            }
            _ => self.to_string(),
        }
    }
}
