// Centralized error handling module
// Every fallible operation in the crate reports a ResidueError; callers
// branch on ErrorKind rather than on individual variants.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Coarse classification used by the cleaner's retry/defer logic and by reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PermissionDenied,
    NotFound,
    BusyInUse,
    BackupFailure,
    ProtectedResource,
    Timeout,
    Cancelled,
    NotEmpty,
    Unsupported,
    InvalidConfig,
    Io,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::NotFound => "not_found",
            ErrorKind::BusyInUse => "busy_in_use",
            ErrorKind::BackupFailure => "backup_failure",
            ErrorKind::ProtectedResource => "protected_resource",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::NotEmpty => "not_empty",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::InvalidConfig => "invalid_config",
            ErrorKind::Io => "io",
        }
    }
}

/// Main error type for scanning, cleaning and restoring.
#[derive(Debug, Error)]
pub enum ResidueError {
    #[error("Permission denied while {operation} {path}")]
    PermissionDenied { path: String, operation: String },

    #[error("Resource not found: {path}")]
    NotFound { path: String },

    #[error("Resource busy while {operation} {path}")]
    BusyInUse { path: String, operation: String },

    #[error("Backup of {path} failed: {reason}")]
    BackupFailure { path: String, reason: String },

    #[error("Refusing to modify protected resource: {path}")]
    ProtectedResource { path: String },

    #[error("{what} exceeded its time limit of {limit:?}")]
    Timeout { what: String, limit: Duration },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Container is not empty: {path}")]
    NotEmpty { path: String },

    #[error("{operation} is not supported by the {backend} backend")]
    Unsupported { backend: String, operation: String },

    #[error("Invalid scan root {path}: {reason}")]
    InvalidRoot { path: String, reason: String },

    #[error("Invalid backup directory {}: {reason}", path.display())]
    InvalidBackupDir { path: PathBuf, reason: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Backup manifest {} is unreadable: {reason}", path.display())]
    ManifestCorrupt { path: PathBuf, reason: String },

    #[error("Cannot move {module} from {from} to {to}")]
    InvalidTransition {
        module: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("I/O error while {operation} {path}: {source}")]
    Io {
        path: String,
        operation: String,
        #[source]
        source: io::Error,
    },
}

pub type Result<T, E = ResidueError> = std::result::Result<T, E>;

impl ResidueError {
    /// Classify this error for retry/defer decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ResidueError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            ResidueError::NotFound { .. } => ErrorKind::NotFound,
            ResidueError::BusyInUse { .. } => ErrorKind::BusyInUse,
            ResidueError::BackupFailure { .. } => ErrorKind::BackupFailure,
            ResidueError::ProtectedResource { .. } => ErrorKind::ProtectedResource,
            ResidueError::Timeout { .. } => ErrorKind::Timeout,
            ResidueError::Cancelled => ErrorKind::Cancelled,
            ResidueError::NotEmpty { .. } => ErrorKind::NotEmpty,
            ResidueError::Unsupported { .. } => ErrorKind::Unsupported,
            ResidueError::InvalidRoot { .. }
            | ResidueError::InvalidBackupDir { .. }
            | ResidueError::InvalidConfig { .. }
            | ResidueError::InvalidTransition { .. } => ErrorKind::InvalidConfig,
            ResidueError::ManifestCorrupt { .. } | ResidueError::Io { .. } => ErrorKind::Io,
        }
    }

    /// Errors that abort a whole run before any traversal starts.
    pub fn is_config_error(&self) -> bool {
        self.kind() == ErrorKind::InvalidConfig
    }

    pub fn not_found(path: impl Into<String>) -> Self {
        ResidueError::NotFound { path: path.into() }
    }

    pub fn denied(path: impl Into<String>, operation: &str) -> Self {
        ResidueError::PermissionDenied {
            path: path.into(),
            operation: operation.to_string(),
        }
    }

    pub fn unsupported(backend: &str, operation: &str) -> Self {
        ResidueError::Unsupported {
            backend: backend.to_string(),
            operation: operation.to_string(),
        }
    }

    pub fn backup_failure(path: impl Into<String>, reason: impl ToString) -> Self {
        ResidueError::BackupFailure {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Create an error from an io::Error with context about the operation and path.
    /// Specific error kinds map onto the taxonomy; everything else stays `Io`.
    pub fn from_io_error(err: io::Error, operation: &str, path: impl Into<String>) -> Self {
        let path = path.into();
        if is_busy(&err) {
            return ResidueError::BusyInUse {
                path,
                operation: operation.to_string(),
            };
        }
        match err.kind() {
            io::ErrorKind::NotFound => ResidueError::NotFound { path },
            io::ErrorKind::PermissionDenied => ResidueError::PermissionDenied {
                path,
                operation: operation.to_string(),
            },
            io::ErrorKind::DirectoryNotEmpty => ResidueError::NotEmpty { path },
            io::ErrorKind::TimedOut => ResidueError::Timeout {
                what: format!("{} {}", operation, path),
                limit: Duration::ZERO,
            },
            _ => ResidueError::Io {
                path,
                operation: operation.to_string(),
                source: err,
            },
        }
    }
}

#[cfg(unix)]
fn is_busy(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(code) if code == libc::EBUSY || code == libc::ETXTBSY)
}

// ERROR_SHARING_VIOLATION / ERROR_LOCK_VIOLATION
#[cfg(windows)]
fn is_busy(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(32) | Some(33))
}

#[cfg(not(any(unix, windows)))]
fn is_busy(_err: &io::Error) -> bool {
    false
}
