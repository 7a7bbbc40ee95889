//! In-memory storage adapter for local development and tests.

use crate::{
    adapters::{
        ChunkReceipt, FileListing, FileMetadata, PresignedUrl, StorageAdapter, StorageQuota,
        StorageStats, TransferOptions, UploadOutcome, synthetic_presigned_url,
    },
    errors::{CoreError, CoreResult},
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Mutex,
};

const DEFAULT_URL_EXPIRY_SECS: u64 = 3600;

#[derive(Default)]
struct MemoryState {
    objects: BTreeMap<String, StoredObject>,
    /// key -> chunk_index -> payload, staged until completion.
    parts: HashMap<String, BTreeMap<u32, Bytes>>,
}

struct StoredObject {
    data: Bytes,
    etag: String,
    content_type: Option<String>,
    last_modified: chrono::DateTime<Utc>,
}

/// Storage adapter keeping everything in process memory.
#[derive(Default)]
pub struct MemoryAdapter {
    state: Mutex<MemoryState>,
    quota_bytes: Option<u64>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(mut self, quota_bytes: u64) -> Self {
        self.quota_bytes = Some(quota_bytes);
        self
    }

    fn store(&self, key: &str, data: Bytes, content_type: Option<String>) -> UploadOutcome {
        let etag = format!("{:x}", md5::compute(&data));
        let size = data.len() as u64;
        self.state.lock().unwrap().objects.insert(
            key.to_string(),
            StoredObject {
                data,
                etag: etag.clone(),
                content_type,
                last_modified: Utc::now(),
            },
        );
        UploadOutcome {
            key: key.to_string(),
            etag,
            size,
        }
    }
}

#[async_trait]
impl StorageAdapter for MemoryAdapter {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn initialize(&self) -> CoreResult<()> {
        Ok(())
    }

    async fn upload_file(
        &self,
        key: &str,
        data: Bytes,
        opts: &TransferOptions,
    ) -> CoreResult<UploadOutcome> {
        Ok(self.store(key, data, opts.content_type.clone()))
    }

    async fn upload_chunk(
        &self,
        key: &str,
        data: Bytes,
        chunk_index: u32,
        _total_chunks: u32,
        _opts: &TransferOptions,
    ) -> CoreResult<ChunkReceipt> {
        let etag = format!("{:x}", md5::compute(&data));
        self.state
            .lock()
            .unwrap()
            .parts
            .entry(key.to_string())
            .or_default()
            .insert(chunk_index, data);
        Ok(ChunkReceipt {
            etag,
            part_number: chunk_index + 1,
        })
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        _upload_id: &str,
        parts: &[ChunkReceipt],
        opts: &TransferOptions,
    ) -> CoreResult<UploadOutcome> {
        let staged = self
            .state
            .lock()
            .unwrap()
            .parts
            .remove(key)
            .unwrap_or_default();

        // A retried completion finds no staged parts; the earlier call
        // already assembled them into the stored object.
        if staged.is_empty() {
            let state = self.state.lock().unwrap();
            if let Some(obj) = state.objects.get(key) {
                return Ok(UploadOutcome {
                    key: key.to_string(),
                    etag: obj.etag.clone(),
                    size: obj.data.len() as u64,
                });
            }
        }

        let mut ordered: Vec<&ChunkReceipt> = parts.iter().collect();
        ordered.sort_by_key(|p| p.part_number);

        let mut assembled = Vec::new();
        for part in ordered {
            let data = staged.get(&(part.part_number - 1)).ok_or_else(|| {
                CoreError::Transfer(format!("missing part {} for `{key}`", part.part_number))
            })?;
            assembled.extend_from_slice(data);
        }
        Ok(self.store(key, Bytes::from(assembled), opts.content_type.clone()))
    }

    async fn generate_presigned_upload_url(
        &self,
        key: &str,
        opts: &TransferOptions,
    ) -> CoreResult<PresignedUrl> {
        let expiry = opts.expires_in_secs.unwrap_or(DEFAULT_URL_EXPIRY_SECS);
        Ok(synthetic_presigned_url("mem", key, "PUT", expiry))
    }

    async fn generate_presigned_download_url(
        &self,
        key: &str,
        opts: &TransferOptions,
    ) -> CoreResult<PresignedUrl> {
        let expiry = opts.expires_in_secs.unwrap_or(DEFAULT_URL_EXPIRY_SECS);
        Ok(synthetic_presigned_url("mem", key, "GET", expiry))
    }

    async fn download_file(&self, key: &str, _opts: &TransferOptions) -> CoreResult<Bytes> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(key)
            .map(|obj| obj.data.clone())
            .ok_or_else(|| CoreError::not_found("file", key))
    }

    async fn get_file_metadata(&self, key: &str) -> CoreResult<FileMetadata> {
        let state = self.state.lock().unwrap();
        let obj = state
            .objects
            .get(key)
            .ok_or_else(|| CoreError::not_found("file", key))?;
        Ok(FileMetadata {
            key: key.to_string(),
            size: obj.data.len() as u64,
            etag: Some(obj.etag.clone()),
            content_type: obj.content_type.clone(),
            last_modified: Some(obj.last_modified),
        })
    }

    async fn delete_file(&self, key: &str) -> CoreResult<()> {
        self.state.lock().unwrap().objects.remove(key);
        Ok(())
    }

    async fn list_files(
        &self,
        prefix: &str,
        max_keys: usize,
        continuation_token: Option<&str>,
    ) -> CoreResult<FileListing> {
        let max_keys = max_keys.clamp(1, 1000);
        let state = self.state.lock().unwrap();
        let mut keys: Vec<String> = state
            .objects
            .keys()
            .filter(|key| key.starts_with(prefix))
            .filter(|key| continuation_token.is_none_or(|token| key.as_str() > token))
            .cloned()
            .collect();

        let is_truncated = keys.len() > max_keys;
        keys.truncate(max_keys);
        let next_continuation_token = if is_truncated {
            keys.last().cloned()
        } else {
            None
        };

        Ok(FileListing {
            keys,
            is_truncated,
            next_continuation_token,
        })
    }

    async fn file_exists(&self, key: &str) -> CoreResult<bool> {
        Ok(self.state.lock().unwrap().objects.contains_key(key))
    }

    async fn copy_file(&self, src: &str, dst: &str) -> CoreResult<()> {
        let (data, content_type) = {
            let state = self.state.lock().unwrap();
            let obj = state
                .objects
                .get(src)
                .ok_or_else(|| CoreError::not_found("file", src))?;
            (obj.data.clone(), obj.content_type.clone())
        };
        self.store(dst, data, content_type);
        Ok(())
    }

    async fn get_storage_quota(&self) -> CoreResult<StorageQuota> {
        let used_bytes = {
            let state = self.state.lock().unwrap();
            state.objects.values().map(|o| o.data.len() as u64).sum()
        };
        Ok(StorageQuota {
            used_bytes,
            limit_bytes: self.quota_bytes,
        })
    }

    async fn get_storage_stats(&self) -> CoreResult<StorageStats> {
        let state = self.state.lock().unwrap();
        Ok(StorageStats {
            object_count: state.objects.len() as u64,
            total_bytes: state.objects.values().map(|o| o.data.len() as u64).sum(),
        })
    }
}
