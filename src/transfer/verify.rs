use md5::{Digest, Md5};
use std::path::Path;
use tokio::io::AsyncReadExt;

use super::error::{Result, TransferError};

const READ_BUFFER: usize = 1024 * 1024;

#[derive(Debug, PartialEq, Eq)]
pub enum EtagCheck {
    /// Local MD5 equals the ETag
    Match,
    /// Local MD5 differs from the ETag
    Mismatch { expected: String, actual: String },
    /// Multipart ETag (`<md5-of-md5s>-<parts>`), not comparable with a file MD5
    Composite,
}

/// Hex MD5 of a local file
pub async fn md5_hex(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| TransferError::io(path, e))?;
    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; READ_BUFFER];
    loop {
        let n = file
            .read(&mut buffer)
            .await
            .map_err(|e| TransferError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Compare a local file with a remote ETag
///
/// Quotes around the ETag are ignored. Composite ETags from multipart uploads
/// are never compared.
pub async fn etag_matches(path: &Path, etag: &str) -> Result<EtagCheck> {
    let expected = etag.trim().trim_matches('"').to_ascii_lowercase();
    if expected.contains('-') {
        return Ok(EtagCheck::Composite);
    }
    let actual = md5_hex(path).await?;
    if actual == expected {
        Ok(EtagCheck::Match)
    } else {
        Ok(EtagCheck::Mismatch { expected, actual })
    }
}
