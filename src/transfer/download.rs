use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Deadline;
use super::backend::{ObjectBackend, ObjectReader};
use super::checkpoint::CheckpointStore;
use super::error::{BackendError, Result, TransferError};
use super::plan::{ChunkPlan, ChunkRange};
use super::progress::{ProgressSink, ProgressTracker};
use super::request::{Direction, SessionStatus, TransferRequest, TransferSession};
use super::retry::with_retry;
use super::throttle::BandwidthThrottle;
use super::verify::{EtagCheck, etag_matches};

/// How often the polling fallback samples the local file size
const POLL_INTERVAL: Duration = Duration::from_millis(100);

const STREAM_BUFFER: usize = 1024 * 1024;

/// Download one object to a local file.
///
/// With a known size the object is fetched as a sequence of ranged GETs,
/// each retried on transient failures and followed by a checkpoint, so an
/// interrupted download resumes where it stopped. Without a size the whole
/// object is streamed while a background task reports the growing file size.
pub(crate) async fn download(
    backend: &dyn ObjectBackend,
    checkpoints: &CheckpointStore,
    request: &TransferRequest,
    sink: Arc<dyn ProgressSink>,
) -> Result<()> {
    request.validate()?;
    if request.direction != Direction::Download {
        return Err(TransferError::InvalidRequest(format!(
            "{} request passed to download",
            request.direction
        )));
    }

    let path = request.local_path();
    let deadline = Deadline::start(request.deadline);
    let mut session = TransferSession::new();

    debug!("Resolving size of {}", request.remote_uri());
    session.total_size = resolve_size(backend, request).await?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| TransferError::io(parent, e))?;
    }

    session.set_status(SessionStatus::InProgress);
    let result = match session.total_size {
        Some(total_size) => {
            download_ranged(
                backend,
                checkpoints,
                request,
                &deadline,
                total_size,
                &mut session,
                sink,
            )
            .await
        }
        None => download_polling(backend, request, &deadline, &mut session, sink).await,
    };

    match result {
        Ok(()) => {
            session.set_status(SessionStatus::Completed);
            info!(
                "Downloaded {} -> {} ({} bytes)",
                request.remote_uri(),
                path.display(),
                session.bytes_transferred()
            );
            Ok(())
        }
        Err(e) => {
            session.set_status(SessionStatus::Failed);
            Err(e)
        }
    }
}

/// Object size from metadata, then from a one-byte ranged read.
/// `None` means the size cannot be known before the download finishes.
async fn resolve_size(backend: &dyn ObjectBackend, request: &TransferRequest) -> Result<Option<u64>> {
    let bucket = request.remote_bucket.as_str();
    let key = request.remote_key.as_str();

    match backend.stat_size(bucket, key).await {
        Ok(Some(size)) => return Ok(Some(size)),
        Ok(None) => debug!("No size in metadata for {}", request.remote_uri()),
        Err(e) if e.is_transient() => {
            warn!("Size lookup for {} failed: {}", request.remote_uri(), e)
        }
        Err(e) => return Err(TransferError::backend("stat_size", e)),
    }

    match backend
        .get_object_range(bucket, key, ChunkRange { start: 0, end: 0 })
        .await
    {
        Ok(response) => Ok(response.total_size_hint),
        Err(e) if e.is_not_found() => Err(TransferError::backend("get_object_range", e)),
        Err(e) => {
            debug!("Ranged size lookup for {} failed: {}", request.remote_uri(), e);
            Ok(None)
        }
    }
}

/// Where a resumed download should start.
///
/// The local file length counts when it is shorter than the object. A
/// checkpoint counts only if it was recorded against an object of the same
/// size and does not point past the bytes actually on disk; a size mismatch
/// throws the checkpoint away and restarts from zero.
async fn resume_offset(
    checkpoints: &CheckpointStore,
    path: &Path,
    total_size: u64,
) -> Result<u64> {
    let local_len = match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Some(meta.len()),
        Ok(_) => None,
        Err(e) if e.kind() == ErrorKind::NotFound => None,
        Err(e) => return Err(TransferError::io(path, e)),
    };

    let mut start = 0;
    if let Some(record) = checkpoints.load(path, Direction::Download).await? {
        if !record.matches(total_size) {
            warn!(
                "Checkpoint for {} was taken against a {}-byte object but the remote is {} bytes; restarting from zero",
                path.display(),
                record.total_size,
                total_size
            );
            checkpoints.delete(path, Direction::Download).await?;
            return Ok(0);
        }
        match local_len {
            Some(len) if record.offset <= len => start = record.offset,
            _ => warn!(
                "Checkpoint offset {} for {} is past the local file; ignoring it",
                record.offset,
                path.display()
            ),
        }
    }

    if let Some(len) = local_len {
        if len < total_size {
            start = start.max(len);
        }
    }
    Ok(start)
}

async fn open_at(path: &Path, start: u64) -> Result<File> {
    if start == 0 {
        return File::create(path)
            .await
            .map_err(|e| TransferError::io(path, e));
    }
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .await
        .map_err(|e| TransferError::io(path, e))?;
    file.seek(SeekFrom::Start(start))
        .await
        .map_err(|e| TransferError::io(path, e))?;
    Ok(file)
}

async fn download_ranged(
    backend: &dyn ObjectBackend,
    checkpoints: &CheckpointStore,
    request: &TransferRequest,
    deadline: &Deadline,
    total_size: u64,
    session: &mut TransferSession,
    sink: Arc<dyn ProgressSink>,
) -> Result<()> {
    let path = request.local_path();
    let bucket = request.remote_bucket.as_str();
    let key = request.remote_key.as_str();

    let start = if request.resume_enabled {
        resume_offset(checkpoints, path, total_size).await?
    } else {
        0
    };
    if start > 0 {
        info!(
            "Resuming {} at byte {} of {}",
            path.display(),
            start,
            total_size
        );
    }

    let mut file = open_at(path, start).await?;
    session.resume_at(start);
    let mut progress = ProgressTracker::new(sink, total_size, start);
    progress.start();
    let mut throttle = BandwidthThrottle::new(request.max_bytes_per_sec);
    let mut position = start;

    for range in ChunkPlan::new(total_size, request.chunk_size, start)? {
        let mut pending = Some(range);
        while let Some(wanted) = pending {
            deadline.check(path)?;

            let what = format!("range {} of {}", wanted.header(), request.remote_uri());
            let response = with_retry(&request.retry, &what, || async move {
                let response = backend.get_object_range(bucket, key, wanted).await?;
                if response.data.is_empty() {
                    return Err(BackendError::Transient(format!(
                        "empty body for {}",
                        wanted.header()
                    )));
                }
                Ok(response)
            })
            .await
            .map_err(|e| TransferError::backend("get_object_range", e))?;

            let received = response.data.len() as u64;
            if received > wanted.len() {
                return Err(TransferError::Protocol(format!(
                    "asked for {} bytes ({}), got {}",
                    wanted.len(),
                    wanted.header(),
                    received
                )));
            }
            if received < wanted.len() {
                debug!(
                    "Short read for {}: {} of {} bytes",
                    wanted.header(),
                    received,
                    wanted.len()
                );
            }

            file.write_all(&response.data)
                .await
                .map_err(|e| TransferError::io(path, e))?;
            file.flush().await.map_err(|e| TransferError::io(path, e))?;

            position += received;
            session.record_bytes(received);
            progress.advance(received);
            if request.resume_enabled {
                checkpoints
                    .save(path, Direction::Download, position, total_size)
                    .await?;
            }
            throttle.consume(received).await;

            pending = wanted.remainder(position);
        }
    }

    // A longer stale file may have been resumed into
    file.set_len(total_size)
        .await
        .map_err(|e| TransferError::io(path, e))?;
    file.sync_all()
        .await
        .map_err(|e| TransferError::io(path, e))?;
    drop(file);

    progress.finish();
    checkpoints.delete(path, Direction::Download).await?;

    if request.verify_checksum {
        verify_download(backend, request).await?;
    }
    Ok(())
}

async fn verify_download(backend: &dyn ObjectBackend, request: &TransferRequest) -> Result<()> {
    let path = request.local_path();
    let stat = backend
        .head_object(&request.remote_bucket, &request.remote_key)
        .await
        .map_err(|e| TransferError::backend("head_object", e))?;
    let Some(etag) = stat.etag else {
        debug!("No ETag for {}, skipping verification", request.remote_uri());
        return Ok(());
    };

    match etag_matches(path, &etag).await? {
        EtagCheck::Match => {
            debug!("Verified {} against ETag {}", path.display(), etag);
            Ok(())
        }
        EtagCheck::Composite => {
            debug!(
                "ETag {} of {} is a multipart ETag, skipping verification",
                etag,
                request.remote_uri()
            );
            Ok(())
        }
        EtagCheck::Mismatch { expected, actual } => Err(TransferError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected,
            actual,
        }),
    }
}

/// Whole-object download with progress taken from the growing local file
async fn download_polling(
    backend: &dyn ObjectBackend,
    request: &TransferRequest,
    deadline: &Deadline,
    session: &mut TransferSession,
    sink: Arc<dyn ProgressSink>,
) -> Result<()> {
    let path = request.local_path();
    info!(
        "Size of {} is unknown, streaming the whole object",
        request.remote_uri()
    );

    // Truncate before polling starts so a stale, longer file is never reported
    let file = File::create(path)
        .await
        .map_err(|e| TransferError::io(path, e))?;

    let cancel = CancellationToken::new();
    let poller = spawn_size_poller(path.to_path_buf(), Arc::clone(&sink), cancel.clone());

    let result = async {
        let reader = backend
            .get_object(&request.remote_bucket, &request.remote_key)
            .await
            .map_err(|e| TransferError::backend("get_object", e))?;
        stream_to_file(reader, file, path, deadline, request.max_bytes_per_sec).await
    }
    .await;

    cancel.cancel();
    if let Err(e) = poller.await {
        warn!("Size poller for {} failed: {}", path.display(), e);
    }

    let written = result?;
    session.total_size = Some(written);
    session.record_bytes(written);
    sink.update(written, written);
    Ok(())
}

async fn stream_to_file(
    mut reader: ObjectReader,
    mut file: File,
    path: &Path,
    deadline: &Deadline,
    max_bytes_per_sec: Option<u64>,
) -> Result<u64> {
    let mut throttle = BandwidthThrottle::new(max_bytes_per_sec);
    let mut buffer = vec![0u8; STREAM_BUFFER];
    let mut written = 0u64;
    loop {
        deadline.check(path)?;
        let n = reader.read(&mut buffer).await.map_err(|e| {
            TransferError::backend("get_object", BackendError::Transient(e.to_string()))
        })?;
        if n == 0 {
            break;
        }
        file.write_all(&buffer[..n])
            .await
            .map_err(|e| TransferError::io(path, e))?;
        written += n as u64;
        throttle.consume(n as u64).await;
    }
    file.flush().await.map_err(|e| TransferError::io(path, e))?;
    file.sync_all()
        .await
        .map_err(|e| TransferError::io(path, e))?;
    Ok(written)
}

/// Report the local file size every [`POLL_INTERVAL`] until cancelled.
/// The total is reported as 0 because it is not known.
fn spawn_size_poller(
    path: PathBuf,
    sink: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(POLL_INTERVAL);
        let mut reported = 0u64;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    // The file may not exist yet
                    if let Ok(meta) = tokio::fs::metadata(&path).await {
                        if meta.len() > reported {
                            reported = meta.len();
                            sink.update(reported, 0);
                        }
                    }
                }
            }
        }
    })
}
