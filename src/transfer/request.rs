use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use super::backend::CompletedPart;
use super::error::{Result, TransferError};
use super::retry::RetryPolicy;

/// Default bytes per part / range (8 MiB)
pub const DEFAULT_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Upload,
    Download,
}

impl Direction {
    /// Operation name used in checkpoint identities and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Download => "download",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable description of one file transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub direction: Direction,
    pub local_path: PathBuf,
    pub remote_bucket: String,
    pub remote_key: String,
    pub chunk_size: u64,
    pub retry: RetryPolicy,
    pub resume_enabled: bool,
    /// Stop issuing chunk requests once this much time has passed
    pub deadline: Option<Duration>,
    pub max_bytes_per_sec: Option<u64>,
    /// Compare the local MD5 with the remote ETag after a download
    pub verify_checksum: bool,
}

impl TransferRequest {
    pub fn new(
        direction: Direction,
        local_path: impl Into<PathBuf>,
        bucket: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            direction,
            local_path: local_path.into(),
            remote_bucket: bucket.into(),
            remote_key: key.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            retry: RetryPolicy::default(),
            resume_enabled: true,
            deadline: None,
            max_bytes_per_sec: None,
            verify_checksum: false,
        }
    }

    pub fn upload(
        local_path: impl Into<PathBuf>,
        bucket: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self::new(Direction::Upload, local_path, bucket, key)
    }

    pub fn download(
        bucket: impl Into<String>,
        key: impl Into<String>,
        local_path: impl Into<PathBuf>,
    ) -> Self {
        Self::new(Direction::Download, local_path, bucket, key)
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_resume(mut self, enabled: bool) -> Self {
        self.resume_enabled = enabled;
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_rate_limit(mut self, max_bytes_per_sec: Option<u64>) -> Self {
        self.max_bytes_per_sec = max_bytes_per_sec;
        self
    }

    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify_checksum = verify;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(TransferError::InvalidRequest(
                "chunk size must be positive".to_string(),
            ));
        }
        if self.remote_bucket.is_empty() || self.remote_key.is_empty() {
            return Err(TransferError::InvalidRequest(format!(
                "remote location cos://{}/{} is incomplete",
                self.remote_bucket, self.remote_key
            )));
        }
        if self.max_bytes_per_sec == Some(0) {
            return Err(TransferError::InvalidRequest(
                "bandwidth limit must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    /// `cos://bucket/key`, for log lines
    pub fn remote_uri(&self) -> String {
        format!("cos://{}/{}", self.remote_bucket, self.remote_key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Aborted,
}

/// Mutable runtime state of one request, owned by the pipeline running it
#[derive(Debug)]
pub struct TransferSession {
    pub total_size: Option<u64>,
    bytes_transferred: u64,
    pub parts_completed: Vec<CompletedPart>,
    status: SessionStatus,
}

impl TransferSession {
    pub fn new() -> Self {
        Self {
            total_size: None,
            bytes_transferred: 0,
            parts_completed: Vec::new(),
            status: SessionStatus::Pending,
        }
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn set_status(&mut self, status: SessionStatus) {
        debug!("session {:?} -> {:?}", self.status, status);
        self.status = status;
    }

    /// Move the byte counter forward. It never moves back.
    pub fn record_bytes(&mut self, n: u64) {
        self.bytes_transferred = self.bytes_transferred.saturating_add(n);
    }

    pub fn resume_at(&mut self, offset: u64) {
        self.bytes_transferred = self.bytes_transferred.max(offset);
    }

    pub fn record_part(&mut self, part_number: u32, content_tag: String) {
        self.parts_completed.push(CompletedPart {
            part_number,
            content_tag,
        });
    }

    /// Completed parts, checked for strictly increasing part numbers
    pub fn ordered_parts(&self) -> Result<&[CompletedPart]> {
        for pair in self.parts_completed.windows(2) {
            if pair[1].part_number <= pair[0].part_number {
                return Err(TransferError::Protocol(format!(
                    "part {} recorded after part {}",
                    pair[1].part_number, pair[0].part_number
                )));
            }
        }
        if let Some(first) = self.parts_completed.first() {
            if first.part_number != 1 {
                return Err(TransferError::Protocol(format!(
                    "first part is {}, expected 1",
                    first.part_number
                )));
            }
        }
        Ok(&self.parts_completed)
    }
}

impl Default for TransferSession {
    fn default() -> Self {
        Self::new()
    }
}
