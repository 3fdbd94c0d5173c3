//! In-memory backend and helpers for engine tests

use async_trait::async_trait;
use bytes::Bytes;
use md5::{Digest, Md5};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::backend::{
    BackendResult, CompletedPart, ObjectBackend, ObjectReader, ObjectStat, RangeResponse,
};
use super::error::BackendError;
use super::plan::ChunkRange;
use super::progress::ProgressSink;
use super::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Initiate(String),
    UploadPart(String, u32),
    Complete(String, Vec<u32>),
    Abort(String),
    Put(String),
    Range(String, u64, u64),
    Get(String),
    Head(String),
}

#[derive(Default)]
struct State {
    objects: HashMap<String, Vec<u8>>,
    uploads: HashMap<String, (String, BTreeMap<u32, Vec<u8>>)>,
    next_upload: u64,
    calls: Vec<Call>,
    /// part number -> transient failures left
    part_failures: HashMap<u32, u32>,
    /// range start -> transient failures left
    range_failures: HashMap<u64, u32>,
    /// range start -> empty bodies left
    empty_ranges: HashMap<u64, u32>,
    permanent_keys: HashSet<String>,
    /// key -> ETag reported by HEAD instead of the content hash
    etag_overrides: HashMap<String, String>,
    max_range_body: Option<usize>,
    hide_size: bool,
    hide_range_total: bool,
    abort_fails: bool,
    latency: Option<Duration>,
}

/// Object store held in memory, with failure injection and a call log
#[derive(Clone, Default)]
pub(crate) struct MemoryBackend {
    state: Arc<Mutex<State>>,
}

impl MemoryBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub(crate) fn insert(&self, key: &str, data: Vec<u8>) {
        self.with(|s| s.objects.insert(key.to_string(), data));
    }

    pub(crate) fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.with(|s| s.objects.get(key).cloned())
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.with(|s| s.calls.clone())
    }

    pub(crate) fn fail_part(&self, part_number: u32, times: u32) {
        self.with(|s| s.part_failures.insert(part_number, times));
    }

    pub(crate) fn fail_range(&self, start: u64, times: u32) {
        self.with(|s| s.range_failures.insert(start, times));
    }

    pub(crate) fn empty_range(&self, start: u64, times: u32) {
        self.with(|s| s.empty_ranges.insert(start, times));
    }

    /// Every call touching `key` fails with a permanent error
    pub(crate) fn break_key(&self, key: &str) {
        self.with(|s| s.permanent_keys.insert(key.to_string()));
    }

    /// HEAD on `key` reports `etag` whatever the content is
    pub(crate) fn fake_etag(&self, key: &str, etag: &str) {
        self.with(|s| s.etag_overrides.insert(key.to_string(), etag.to_string()));
    }

    pub(crate) fn short_reads(&self, max_body: usize) {
        self.with(|s| s.max_range_body = Some(max_body));
    }

    /// HEAD reports no size and ranged responses no total: size is unknown
    pub(crate) fn hide_sizes(&self, head: bool, range: bool) {
        self.with(|s| {
            s.hide_size = head;
            s.hide_range_total = range;
        });
    }

    pub(crate) fn fail_aborts(&self) {
        self.with(|s| s.abort_fails = true);
    }

    pub(crate) fn set_latency(&self, latency: Duration) {
        self.with(|s| s.latency = Some(latency));
    }

    async fn enter(&self, call: Call, key: &str) -> BackendResult<()> {
        let latency = self.with(|s| {
            s.calls.push(call);
            s.latency
        });
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.with(|s| {
            if s.permanent_keys.contains(key) {
                Err(BackendError::Permanent(format!("access denied: {}", key)))
            } else {
                Ok(())
            }
        })
    }
}

fn not_found(key: &str) -> BackendError {
    BackendError::NotFound {
        bucket: "test".to_string(),
        key: key.to_string(),
    }
}

fn take_failure<K: std::hash::Hash + Eq>(map: &mut HashMap<K, u32>, k: &K) -> bool {
    match map.get_mut(k) {
        Some(left) if *left > 0 => {
            *left -= 1;
            true
        }
        _ => false,
    }
}

fn md5_etag(data: &[u8]) -> String {
    format!("\"{:x}\"", Md5::digest(data))
}

#[async_trait]
impl ObjectBackend for MemoryBackend {
    async fn initiate_multipart(&self, _bucket: &str, key: &str) -> BackendResult<String> {
        self.enter(Call::Initiate(key.to_string()), key).await?;
        Ok(self.with(|s| {
            s.next_upload += 1;
            let id = format!("upload-{}", s.next_upload);
            s.uploads
                .insert(id.clone(), (key.to_string(), BTreeMap::new()));
            id
        }))
    }

    async fn upload_part(
        &self,
        _bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> BackendResult<String> {
        self.enter(Call::UploadPart(key.to_string(), part_number), key)
            .await?;
        self.with(|s| {
            if take_failure(&mut s.part_failures, &part_number) {
                return Err(BackendError::Transient("connection reset".to_string()));
            }
            let (_, parts) = s
                .uploads
                .get_mut(upload_id)
                .ok_or_else(|| BackendError::NotFound {
                    bucket: "test".to_string(),
                    key: upload_id.to_string(),
                })?;
            let tag = md5_etag(&data);
            parts.insert(part_number, data.to_vec());
            Ok(tag)
        })
    }

    async fn complete_multipart(
        &self,
        _bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> BackendResult<String> {
        let numbers: Vec<u32> = parts.iter().map(|p| p.part_number).collect();
        self.enter(Call::Complete(key.to_string(), numbers.clone()), key)
            .await?;
        self.with(|s| {
            let (object_key, stored) = s
                .uploads
                .remove(upload_id)
                .ok_or_else(|| BackendError::Permanent("NoSuchUpload".to_string()))?;
            assert!(
                numbers.windows(2).all(|w| w[0] < w[1]),
                "parts submitted out of order: {:?}",
                numbers
            );
            let mut data = Vec::new();
            for part in parts {
                let bytes = stored
                    .get(&part.part_number)
                    .ok_or_else(|| BackendError::Permanent("InvalidPart".to_string()))?;
                if md5_etag(bytes) != part.content_tag {
                    return Err(BackendError::Permanent("InvalidPart".to_string()));
                }
                data.extend_from_slice(bytes);
            }
            let tag = format!("\"{:x}-{}\"", Md5::digest(&data), parts.len());
            s.objects.insert(object_key, data);
            Ok(tag)
        })
    }

    async fn abort_multipart(&self, _bucket: &str, key: &str, upload_id: &str) -> BackendResult<()> {
        self.enter(Call::Abort(key.to_string()), key).await.ok();
        self.with(|s| {
            if s.abort_fails {
                return Err(BackendError::Transient("abort timed out".to_string()));
            }
            s.uploads.remove(upload_id);
            Ok(())
        })
    }

    async fn put_object(&self, _bucket: &str, key: &str, data: Bytes) -> BackendResult<String> {
        self.enter(Call::Put(key.to_string()), key).await?;
        Ok(self.with(|s| {
            let tag = md5_etag(&data);
            s.objects.insert(key.to_string(), data.to_vec());
            tag
        }))
    }

    async fn get_object_range(
        &self,
        _bucket: &str,
        key: &str,
        range: ChunkRange,
    ) -> BackendResult<RangeResponse> {
        self.enter(Call::Range(key.to_string(), range.start, range.end), key)
            .await?;
        self.with(|s| {
            if take_failure(&mut s.range_failures, &range.start) {
                return Err(BackendError::Transient("read timed out".to_string()));
            }
            let object = s.objects.get(key).ok_or_else(|| not_found(key))?;
            let total = object.len() as u64;
            if range.start >= total {
                return Err(BackendError::Permanent("InvalidRange".to_string()));
            }
            let total_size_hint = (!s.hide_range_total).then_some(total);
            if take_failure(&mut s.empty_ranges, &range.start) {
                return Ok(RangeResponse {
                    data: Bytes::new(),
                    total_size_hint,
                });
            }
            let end = range.end.min(total - 1) as usize;
            let mut slice = &object[range.start as usize..=end];
            if let Some(max) = s.max_range_body {
                slice = &slice[..slice.len().min(max)];
            }
            Ok(RangeResponse {
                data: Bytes::copy_from_slice(slice),
                total_size_hint,
            })
        })
    }

    async fn get_object(&self, _bucket: &str, key: &str) -> BackendResult<ObjectReader> {
        self.enter(Call::Get(key.to_string()), key).await?;
        let data = self.with(|s| s.objects.get(key).cloned().ok_or_else(|| not_found(key)))?;
        Ok(Box::pin(std::io::Cursor::new(data)))
    }

    async fn head_object(&self, _bucket: &str, key: &str) -> BackendResult<ObjectStat> {
        self.enter(Call::Head(key.to_string()), key).await?;
        self.with(|s| {
            let object = s.objects.get(key).ok_or_else(|| not_found(key))?;
            Ok(ObjectStat {
                size: (!s.hide_size).then_some(object.len() as u64),
                etag: Some(
                    s.etag_overrides
                        .get(key)
                        .cloned()
                        .unwrap_or_else(|| md5_etag(object)),
                ),
            })
        })
    }
}

/// Sink that records every update
pub(crate) fn recording_sink() -> (Arc<dyn ProgressSink>, Arc<Mutex<Vec<(u64, u64)>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let inner = Arc::clone(&log);
    let sink: Arc<dyn ProgressSink> =
        Arc::new(move |d: u64, t: u64| inner.lock().unwrap().push((d, t)));
    (sink, log)
}

pub(crate) fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        backoff_base: Duration::from_millis(1),
        backoff_cap: Duration::from_millis(4),
    }
}

/// Deterministic, non-repeating-ish test content
pub(crate) fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 + i / 251) as u8).collect()
}

/// Progress updates must never go backwards
pub(crate) fn assert_monotonic(log: &[(u64, u64)]) {
    for pair in log.windows(2) {
        assert!(pair[1].0 >= pair[0].0, "progress went backwards: {:?}", log);
    }
}
