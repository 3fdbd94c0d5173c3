//! Chunked, resumable transfers between local files and an object store.
//!
//! Everything here talks to storage through [`ObjectBackend`], so the same
//! pipelines run against S3/COS in production and an in-memory store in tests.

pub mod backend;
pub mod checkpoint;
mod download;
pub mod error;
mod orchestrator;
pub mod plan;
pub mod progress;
pub mod request;
pub mod retry;
pub mod throttle;
mod upload;
pub mod verify;

#[cfg(test)]
pub(crate) mod testing;

use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub use backend::{CompletedPart, ObjectBackend, ObjectStat, RangeResponse};
pub use checkpoint::{CheckpointRecord, CheckpointStore};
pub use error::{BackendError, Result, TransferError};
pub use plan::{ChunkPlan, ChunkRange, MAX_PARTS};
pub use progress::{ChannelSink, NoProgress, ProgressEvent, ProgressSink, no_progress};
pub use request::{
    DEFAULT_CHUNK_SIZE, Direction, SessionStatus, TransferRequest, TransferSession,
};
pub use retry::RetryPolicy;

/// Wall-clock budget for one transfer, checked before each chunk request
pub(crate) struct Deadline {
    started: Instant,
    limit: Option<Duration>,
}

impl Deadline {
    pub(crate) fn start(limit: Option<Duration>) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    pub(crate) fn check(&self, path: &Path) -> Result<()> {
        let elapsed = self.started.elapsed();
        match self.limit {
            Some(limit) if elapsed >= limit => Err(TransferError::TimedOut {
                path: path.to_path_buf(),
                after: elapsed,
            }),
            _ => Ok(()),
        }
    }
}

/// What a previous, interrupted transfer left behind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeState {
    pub checkpoint: Option<CheckpointRecord>,
    pub local_size: Option<u64>,
}

impl ResumeState {
    /// A later run would pick up where the last one stopped
    pub fn is_resumable(&self) -> bool {
        self.checkpoint
            .as_ref()
            .is_some_and(|c| c.offset > 0 && c.offset < c.total_size)
    }
}

/// Entry point for single and batch transfers.
///
/// Cloning is cheap and shares the backend. Two transfers writing the same
/// local file at the same time, from one engine or several, are not
/// coordinated; callers must not start them.
#[derive(Clone)]
pub struct TransferEngine {
    backend: Arc<dyn ObjectBackend>,
    checkpoints: CheckpointStore,
}

impl TransferEngine {
    pub fn new(backend: Arc<dyn ObjectBackend>, checkpoints: CheckpointStore) -> Self {
        Self {
            backend,
            checkpoints,
        }
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Upload `request.local_path` and return the backend's content tag
    pub async fn upload(
        &self,
        request: &TransferRequest,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<String> {
        upload::upload(self.backend.as_ref(), request, sink).await
    }

    pub async fn download(
        &self,
        request: &TransferRequest,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<()> {
        download::download(self.backend.as_ref(), &self.checkpoints, request, sink).await
    }

    /// Run one request in whichever direction it names
    pub async fn transfer(
        &self,
        request: &TransferRequest,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<()> {
        match request.direction {
            Direction::Upload => self.upload(request, sink).await.map(|_| ()),
            Direction::Download => self.download(request, sink).await,
        }
    }

    /// Run many requests on at most `concurrency` workers. The first failure
    /// stops new work from starting; transfers already running finish.
    pub async fn run_many(
        &self,
        requests: Vec<TransferRequest>,
        concurrency: usize,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<()> {
        orchestrator::run_many(self, requests, concurrency, sink).await
    }

    pub async fn resume_state(&self, request: &TransferRequest) -> Result<ResumeState> {
        let path = request.local_path();
        let checkpoint = self.checkpoints.load(path, request.direction).await?;
        let local_size = match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => Some(meta.len()),
            Ok(_) => None,
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(TransferError::io(path, e)),
        };
        Ok(ResumeState {
            checkpoint,
            local_size,
        })
    }
}
