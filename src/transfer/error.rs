use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by an [`ObjectBackend`](super::ObjectBackend).
///
/// The engine only looks at the variant: `Transient` is retried, everything
/// else is surfaced immediately.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Object or bucket does not exist
    #[error("Object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    /// Network failure, 5xx, throttling, empty or short body
    #[error("Transient backend error: {0}")]
    Transient(String),

    /// Access denied, invalid argument and anything else not worth retrying
    #[error("Backend error: {0}")]
    Permanent(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Errors returned by the transfer engine entry points
#[derive(Error, Debug)]
pub enum TransferError {
    /// The request itself is malformed (zero chunk size, too many parts, ...)
    #[error("Invalid transfer request: {0}")]
    InvalidRequest(String),

    /// A backend call failed, after retries where they apply
    #[error("{op} failed: {source}")]
    Backend {
        op: &'static str,
        #[source]
        source: BackendError,
    },

    /// Local filesystem error
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Multipart ordering or response-shape violation; a bug, not a condition
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Checkpoint record could not be persisted
    #[error("Checkpoint error for {}: {message}", path.display())]
    Checkpoint { path: PathBuf, message: String },

    /// Caller-level deadline passed before the next chunk was issued
    #[error("Transfer of {} timed out after {after:?}", path.display())]
    TimedOut { path: PathBuf, after: Duration },

    /// Local file length changed while it was being uploaded
    #[error("{} changed during upload: expected {expected} bytes, read {actual}", path.display())]
    SourceChanged {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    /// Downloaded content does not match the remote ETag
    #[error("Checksum mismatch for {}: expected {expected}, got {actual}", path.display())]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// First failure observed by `run_many`
    #[error("Transfer of {} failed: {source}", path.display())]
    FileFailed {
        path: PathBuf,
        #[source]
        source: Box<TransferError>,
    },

    /// A worker task panicked or was cancelled
    #[error("Transfer worker failed: {0}")]
    Worker(String),
}

impl TransferError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn backend(op: &'static str, source: BackendError) -> Self {
        Self::Backend { op, source }
    }

    /// The innermost error, looking through `FileFailed`
    pub fn root(&self) -> &TransferError {
        match self {
            Self::FileFailed { source, .. } => source.root(),
            other => other,
        }
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self.root() {
            Self::Backend {
                source: BackendError::NotFound { bucket, key },
                ..
            } => {
                format!(
                    "Object not found: cos://{}/{}\n\nPossible solutions:\n  \
                     1. Check the bucket and key spelling\n  \
                     2. Verify the region or endpoint points at the right service",
                    bucket, key
                )
            }
            Self::Backend {
                source: BackendError::Transient(message),
                op,
            } => {
                format!(
                    "{} kept failing: {}\n\nPossible solutions:\n  \
                     1. Check your network connection\n  \
                     2. Raise --max-retries or --retry-backoff-max-ms\n  \
                     3. Re-run the same command; downloads resume from the last checkpoint",
                    op, message
                )
            }
            Self::Io { path, source } => {
                format!(
                    "Local I/O error on {}: {}\n\nPossible solutions:\n  \
                     1. Check free disk space\n  \
                     2. Check permissions: ls -l {}",
                    path.display(),
                    source,
                    path.display()
                )
            }
            Self::TimedOut { path, after } => {
                format!(
                    "Transfer of {} stopped after {:?}\n\nPossible solutions:\n  \
                     1. Increase --timeout-secs\n  \
                     2. Re-run the command to resume",
                    path.display(),
                    after
                )
            }
            _ => self.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_classification() {
        assert!(BackendError::Transient("reset".into()).is_transient());
        assert!(!BackendError::Permanent("denied".into()).is_transient());
        let nf = BackendError::NotFound {
            bucket: "b".into(),
            key: "k".into(),
        };
        assert!(nf.is_not_found());
        assert!(!nf.is_transient());
    }

    #[test]
    fn test_root_unwraps_file_failed() {
        let err = TransferError::FileFailed {
            path: PathBuf::from("a.bin"),
            source: Box::new(TransferError::Protocol("out of order".into())),
        };
        assert!(matches!(err.root(), TransferError::Protocol(_)));
        assert!(err.to_string().contains("a.bin"));
    }

    #[test]
    fn test_user_message_not_found() {
        let err = TransferError::backend(
            "stat",
            BackendError::NotFound {
                bucket: "media".into(),
                key: "a/b.mp4".into(),
            },
        );
        let msg = err.user_message();
        assert!(msg.contains("cos://media/a/b.mp4"));
        assert!(msg.contains("Possible solutions"));
    }
}
