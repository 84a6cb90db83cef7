//! Error types for appfocus-core operations.
//!
//! Release failures are deliberately absent: an unlock that fails is logged at
//! the release site and never surfaces to callers.

use std::path::PathBuf;

use appfocus_protocol::ErrorInfo;

/// All errors that can occur in appfocus-core operations.
#[derive(Debug, thiserror::Error)]
pub enum FocusError {
    // ─────────────────────────────────────────────────────────────────────
    // Lock Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Timed out after {timeout_ms}ms waiting for process lock {path}")]
    LockTimeout { path: PathBuf, timeout_ms: u64 },

    #[error("Process lock I/O error: {path}: {source}")]
    LockIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Shared Store Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Shared store I/O error: {context}: {source}")]
    Store {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Shared store malformed: {path}: {details}")]
    StoreFormat { path: PathBuf, details: String },

    // ─────────────────────────────────────────────────────────────────────
    // Broadcast Bus Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Broadcast bus I/O error: {context}: {source}")]
    Bus {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Broadcast bus protocol error: {code}: {message}")]
    BusProtocol { code: String, message: String },

    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Logging setup failed: {context}: {source}")]
    Logging {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn {name} thread: {source}")]
    WorkerSpawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

impl FocusError {
    /// True for the errors that leave the lock untaken; the guarded update is
    /// skipped and the next lifecycle event retries naturally.
    pub fn is_lock_failure(&self) -> bool {
        matches!(
            self,
            FocusError::LockTimeout { .. } | FocusError::LockIo { .. }
        )
    }
}

impl From<ErrorInfo> for FocusError {
    fn from(info: ErrorInfo) -> Self {
        FocusError::BusProtocol {
            code: info.code,
            message: info.message,
        }
    }
}

/// Convenience type alias for Results using FocusError.
pub type Result<T> = std::result::Result<T, FocusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_failures_are_classified() {
        let timeout = FocusError::LockTimeout {
            path: PathBuf::from("/tmp/process.lock"),
            timeout_ms: 10,
        };
        assert!(timeout.is_lock_failure());
        assert!(timeout.to_string().contains("10ms"));

        let write = FocusError::Store {
            context: "Failed to commit shared store".to_string(),
            source: std::io::Error::other("disk full"),
        };
        assert!(!write.is_lock_failure());

        let bus: FocusError = ErrorInfo::new("invalid_json", "bad frame").into();
        assert!(!bus.is_lock_failure());
        assert_eq!(
            bus.to_string(),
            "Broadcast bus protocol error: invalid_json: bad frame"
        );
    }
}
