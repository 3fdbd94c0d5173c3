use async_trait::async_trait;
use bytes::Bytes;
use std::pin::Pin;
use tokio::io::AsyncRead;

use super::error::BackendError;
use super::plan::ChunkRange;

pub type BackendResult<T> = Result<T, BackendError>;

/// Streaming body of a whole-object GET
pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

/// A finished part of a multipart upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    /// Opaque tag returned by `upload_part`, passed back verbatim on completion
    pub content_tag: String,
}

/// Result of a ranged GET
#[derive(Debug, Clone, Default)]
pub struct RangeResponse {
    pub data: Bytes,
    /// Full object size as stated by the response (`Content-Range: bytes a-b/N`)
    pub total_size_hint: Option<u64>,
}

/// Object metadata from a HEAD request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectStat {
    pub size: Option<u64>,
    pub etag: Option<String>,
}

/// Primitive operations the transfer engine needs from object storage.
///
/// Implementations map their native failures onto [`BackendError`]:
/// `NotFound` for missing buckets/keys, `Transient` for anything worth
/// retrying, `Permanent` for the rest.
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    async fn initiate_multipart(&self, bucket: &str, key: &str) -> BackendResult<String>;

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> BackendResult<String>;

    /// `parts` must be ordered by strictly increasing part number
    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> BackendResult<String>;

    async fn abort_multipart(&self, bucket: &str, key: &str, upload_id: &str) -> BackendResult<()>;

    /// Single-shot upload, used for zero-byte objects
    async fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> BackendResult<String>;

    async fn get_object_range(
        &self,
        bucket: &str,
        key: &str,
        range: ChunkRange,
    ) -> BackendResult<RangeResponse>;

    /// Whole-object GET, used when the size cannot be resolved up front
    async fn get_object(&self, bucket: &str, key: &str) -> BackendResult<ObjectReader>;

    async fn head_object(&self, bucket: &str, key: &str) -> BackendResult<ObjectStat>;

    /// Object size, `Ok(None)` when the backend does not report one
    async fn stat_size(&self, bucket: &str, key: &str) -> BackendResult<Option<u64>> {
        Ok(self.head_object(bucket, key).await?.size)
    }
}
