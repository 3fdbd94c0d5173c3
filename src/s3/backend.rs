use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart as S3CompletedPart};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use md5::{Digest, Md5};
use tracing::debug;

use super::error::classify;
use crate::transfer::backend::{
    BackendResult, CompletedPart, ObjectBackend, ObjectReader, ObjectStat, RangeResponse,
};
use crate::transfer::{BackendError, ChunkRange};

/// [`ObjectBackend`] over the AWS S3 SDK, for S3 and S3-compatible stores such as COS
#[derive(Debug, Clone)]
pub struct S3Backend {
    client: Client,
}

impl S3Backend {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Total object size from a `Content-Range: bytes 0-9/1234` header.
/// `*` means the server does not know.
fn total_from_content_range(header: &str) -> Option<u64> {
    header.rsplit_once('/')?.1.trim().parse().ok()
}

/// Content-Type from the key's extension, for the formats we commonly move
fn content_type_for(key: &str) -> &'static str {
    let ext = key.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("mp4") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("mkv") => "video/x-matroska",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("pdf") => "application/pdf",
        Some("json") => "application/json",
        Some("txt") | Some("log") => "text/plain",
        Some("csv") => "text/csv",
        Some("html") | Some("htm") => "text/html",
        Some("zip") => "application/zip",
        Some("gz") | Some("tgz") => "application/gzip",
        Some("tar") => "application/x-tar",
        _ => "application/octet-stream",
    }
}

fn part_number_i32(part_number: u32) -> BackendResult<i32> {
    i32::try_from(part_number)
        .map_err(|_| BackendError::Permanent(format!("part number {} out of range", part_number)))
}

fn content_length(len: usize) -> BackendResult<i64> {
    i64::try_from(len).map_err(|_| BackendError::Permanent(format!("body of {} bytes too large", len)))
}

#[async_trait]
impl ObjectBackend for S3Backend {
    async fn initiate_multipart(&self, bucket: &str, key: &str) -> BackendResult<String> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .content_type(content_type_for(key))
            .send()
            .await
            .map_err(|e| classify(e, bucket, key))?;

        let upload_id = output
            .upload_id()
            .ok_or_else(|| BackendError::Permanent("No upload ID returned".to_string()))?;
        debug!("Multipart upload initiated with ID: {}", upload_id);
        Ok(upload_id.to_string())
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> BackendResult<String> {
        let content_md5 = STANDARD.encode(Md5::digest(&data));
        let length = content_length(data.len())?;
        let output = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number_i32(part_number)?)
            .content_md5(content_md5)
            .content_length(length)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| classify(e, bucket, key))?;

        output
            .e_tag()
            .map(str::to_string)
            .ok_or_else(|| BackendError::Permanent(format!("No ETag for part {}", part_number)))
    }

    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> BackendResult<String> {
        let parts = parts
            .iter()
            .map(|p| {
                Ok(S3CompletedPart::builder()
                    .part_number(part_number_i32(p.part_number)?)
                    .e_tag(&p.content_tag)
                    .build())
            })
            .collect::<BackendResult<Vec<_>>>()?;
        let upload = CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();

        let output = self
            .client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(upload)
            .send()
            .await
            .map_err(|e| classify(e, bucket, key))?;
        Ok(output.e_tag().unwrap_or_default().to_string())
    }

    async fn abort_multipart(&self, bucket: &str, key: &str, upload_id: &str) -> BackendResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| classify(e, bucket, key))?;
        debug!("Aborted multipart upload {}", upload_id);
        Ok(())
    }

    async fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> BackendResult<String> {
        let length = content_length(data.len())?;
        let output = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(content_type_for(key))
            .content_length(length)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| classify(e, bucket, key))?;
        Ok(output.e_tag().unwrap_or_default().to_string())
    }

    async fn get_object_range(
        &self,
        bucket: &str,
        key: &str,
        range: ChunkRange,
    ) -> BackendResult<RangeResponse> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .range(range.header())
            .send()
            .await
            .map_err(|e| classify(e, bucket, key))?;

        let total_size_hint = output.content_range().and_then(total_from_content_range);
        let data = output
            .body
            .collect()
            .await
            .map_err(|e| BackendError::Transient(format!("reading {}: {}", range.header(), e)))?
            .into_bytes();

        Ok(RangeResponse {
            data,
            total_size_hint,
        })
    }

    async fn get_object(&self, bucket: &str, key: &str) -> BackendResult<ObjectReader> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(e, bucket, key))?;
        Ok(Box::pin(output.body.into_async_read()))
    }

    async fn head_object(&self, bucket: &str, key: &str) -> BackendResult<ObjectStat> {
        let output = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(e, bucket, key))?;

        Ok(ObjectStat {
            size: output
                .content_length()
                .and_then(|len| u64::try_from(len).ok()),
            etag: output.e_tag().map(str::to_string),
        })
    }
}
