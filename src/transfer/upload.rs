use bytes::Bytes;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use super::backend::ObjectBackend;
use super::error::{Result, TransferError};
use super::plan::{MAX_PARTS, part_count};
use super::progress::{ProgressSink, ProgressTracker};
use super::request::{Direction, SessionStatus, TransferRequest, TransferSession};
use super::retry::with_retry;
use super::throttle::BandwidthThrottle;
use super::Deadline;

/// Upload one local file as a multipart upload, returning the object's content tag.
///
/// Parts are read strictly forward and sent one at a time, so part numbers
/// reach the backend in order. Any failure after the upload was initiated
/// aborts it before the error is returned.
///
/// Zero-byte files skip multipart entirely and use a single `put_object`.
pub(crate) async fn upload(
    backend: &dyn ObjectBackend,
    request: &TransferRequest,
    sink: Arc<dyn ProgressSink>,
) -> Result<String> {
    request.validate()?;
    if request.direction != Direction::Upload {
        return Err(TransferError::InvalidRequest(format!(
            "{} request passed to upload",
            request.direction
        )));
    }

    let path = request.local_path();
    let bucket = request.remote_bucket.as_str();
    let key = request.remote_key.as_str();
    let deadline = Deadline::start(request.deadline);

    let mut file = File::open(path)
        .await
        .map_err(|e| TransferError::io(path, e))?;
    let total_size = file
        .metadata()
        .await
        .map_err(|e| TransferError::io(path, e))?
        .len();

    let mut session = TransferSession::new();
    session.total_size = Some(total_size);
    let mut progress = ProgressTracker::new(sink, total_size, 0);

    if total_size == 0 {
        debug!("Empty file {}, using single put", path.display());
        session.set_status(SessionStatus::InProgress);
        let tag = backend
            .put_object(bucket, key, Bytes::new())
            .await
            .map_err(|e| TransferError::backend("put_object", e))?;
        progress.finish();
        session.set_status(SessionStatus::Completed);
        info!("Uploaded empty file {} -> {}", path.display(), request.remote_uri());
        return Ok(tag);
    }

    let parts = part_count(total_size, request.chunk_size);
    if parts > MAX_PARTS {
        return Err(TransferError::InvalidRequest(format!(
            "{} bytes in {}-byte parts needs {} parts (max {}); use a larger chunk size",
            total_size, request.chunk_size, parts, MAX_PARTS
        )));
    }

    info!(
        "Starting multipart upload for {} ({} bytes, {} parts)",
        path.display(),
        total_size,
        parts
    );

    let upload_id = backend
        .initiate_multipart(bucket, key)
        .await
        .map_err(|e| TransferError::backend("initiate_multipart", e))?;
    debug!("Multipart upload initiated with ID: {}", upload_id);
    session.set_status(SessionStatus::InProgress);

    let result = send_parts(
        backend,
        request,
        &upload_id,
        &deadline,
        &mut file,
        &mut session,
        &mut progress,
    )
    .await;

    match result {
        Ok(tag) => {
            progress.finish();
            session.set_status(SessionStatus::Completed);
            info!(
                "Successfully completed multipart upload: {} -> {}",
                path.display(),
                request.remote_uri()
            );
            Ok(tag)
        }
        Err(e) => {
            session.set_status(SessionStatus::Failed);
            match backend.abort_multipart(bucket, key, &upload_id).await {
                Ok(()) => {
                    session.set_status(SessionStatus::Aborted);
                    debug!("Aborted multipart upload {}", upload_id);
                }
                Err(abort_err) => {
                    warn!(
                        "Failed to abort multipart upload {} for {}: {}",
                        upload_id,
                        request.remote_uri(),
                        abort_err
                    );
                }
            }
            Err(e)
        }
    }
}

async fn send_parts(
    backend: &dyn ObjectBackend,
    request: &TransferRequest,
    upload_id: &str,
    deadline: &Deadline,
    file: &mut File,
    session: &mut TransferSession,
    progress: &mut ProgressTracker,
) -> Result<String> {
    let path = request.local_path();
    let bucket = request.remote_bucket.as_str();
    let key = request.remote_key.as_str();
    let total_size = session.total_size.unwrap_or_default();
    let mut throttle = BandwidthThrottle::new(request.max_bytes_per_sec);
    let mut part_number = 1u32;

    loop {
        deadline.check(path)?;

        let capacity = request
            .chunk_size
            .min(total_size.saturating_sub(session.bytes_transferred()).max(1));
        let mut buffer = Vec::with_capacity(capacity as usize);
        let bytes_read = (&mut *file)
            .take(request.chunk_size)
            .read_to_end(&mut buffer)
            .await
            .map_err(|e| TransferError::io(path, e))? as u64;

        if bytes_read == 0 {
            break;
        }
        if session.bytes_transferred() + bytes_read > total_size {
            return Err(TransferError::SourceChanged {
                path: path.to_path_buf(),
                expected: total_size,
                actual: session.bytes_transferred() + bytes_read,
            });
        }

        debug!("Uploading part {} ({} bytes)", part_number, bytes_read);
        let data = Bytes::from(buffer);
        let what = format!("part {} of {}", part_number, request.remote_uri());
        let tag = with_retry(&request.retry, &what, || {
            backend.upload_part(bucket, key, upload_id, part_number, data.clone())
        })
        .await
        .map_err(|e| TransferError::backend("upload_part", e))?;

        session.record_part(part_number, tag);
        session.record_bytes(bytes_read);
        progress.advance(bytes_read);
        throttle.consume(bytes_read).await;
        part_number += 1;
    }

    if session.bytes_transferred() != total_size {
        return Err(TransferError::SourceChanged {
            path: path.to_path_buf(),
            expected: total_size,
            actual: session.bytes_transferred(),
        });
    }

    let parts = session.ordered_parts()?;
    debug!(
        "All {} parts uploaded, completing multipart upload",
        parts.len()
    );
    backend
        .complete_multipart(bucket, key, upload_id, parts)
        .await
        .map_err(|e| TransferError::backend("complete_multipart", e))
}
