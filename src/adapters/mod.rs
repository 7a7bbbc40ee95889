//! The pluggable storage provider contract.
//!
//! One implementation exists per physical provider. The data plane only ever
//! talks to providers through this trait, so upload sessions and transform
//! jobs are provider-agnostic. Fault injection for tests lives behind
//! dedicated test adapters, never in production implementations.

pub mod filesystem;
pub mod memory;

use crate::errors::CoreResult;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use filesystem::FilesystemAdapter;
pub use memory::MemoryAdapter;

/// Per-call options. `content_type` applies to uploads; `expires_in_secs`
/// applies to presigned URLs.
#[derive(Clone, Debug, Default)]
pub struct TransferOptions {
    pub content_type: Option<String>,
    pub expires_in_secs: Option<u64>,
}

/// Outcome of a whole-object upload.
#[derive(Clone, Debug, Serialize)]
pub struct UploadOutcome {
    pub key: String,
    pub etag: String,
    pub size: u64,
}

/// Receipt for one uploaded chunk of a multipart transfer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkReceipt {
    pub etag: String,
    /// 1-based part number, S3 convention.
    pub part_number: u32,
}

/// A presigned URL and its expiry.
#[derive(Clone, Debug, Serialize)]
pub struct PresignedUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// Metadata about a stored file.
#[derive(Clone, Debug, Serialize)]
pub struct FileMetadata {
    pub key: String,
    pub size: u64,
    pub etag: Option<String>,
    pub content_type: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// One page of a listing.
#[derive(Clone, Debug, Serialize)]
pub struct FileListing {
    pub keys: Vec<String>,
    pub is_truncated: bool,
    pub next_continuation_token: Option<String>,
}

/// Capacity view of a provider.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct StorageQuota {
    pub used_bytes: u64,
    pub limit_bytes: Option<u64>,
}

/// Aggregate usage counters for a provider.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct StorageStats {
    pub object_count: u64,
    pub total_bytes: u64,
}

/// Uniform byte-transfer contract implemented once per storage provider.
///
/// Implementations must be safe for concurrent use; chunk uploads for
/// independent sessions may interleave freely.
#[async_trait]
pub trait StorageAdapter: Send + Sync + 'static {
    /// Static identifier for the adapter type, used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Prepare the backend (create directories, verify credentials).
    async fn initialize(&self) -> CoreResult<()>;

    /// Upload a whole object atomically.
    async fn upload_file(
        &self,
        key: &str,
        data: Bytes,
        opts: &TransferOptions,
    ) -> CoreResult<UploadOutcome>;

    /// Upload one chunk of a multipart transfer.
    async fn upload_chunk(
        &self,
        key: &str,
        data: Bytes,
        chunk_index: u32,
        total_chunks: u32,
        opts: &TransferOptions,
    ) -> CoreResult<ChunkReceipt>;

    /// Assemble previously uploaded chunks into the final object.
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[ChunkReceipt],
        opts: &TransferOptions,
    ) -> CoreResult<UploadOutcome>;

    /// Presigned URL a client can PUT bytes to.
    async fn generate_presigned_upload_url(
        &self,
        key: &str,
        opts: &TransferOptions,
    ) -> CoreResult<PresignedUrl>;

    /// Presigned URL a client can GET bytes from.
    async fn generate_presigned_download_url(
        &self,
        key: &str,
        opts: &TransferOptions,
    ) -> CoreResult<PresignedUrl>;

    /// Fetch a whole object.
    async fn download_file(&self, key: &str, opts: &TransferOptions) -> CoreResult<Bytes>;

    /// Fetch metadata without the payload.
    async fn get_file_metadata(&self, key: &str) -> CoreResult<FileMetadata>;

    /// Delete an object. Idempotent.
    async fn delete_file(&self, key: &str) -> CoreResult<()>;

    /// List keys under a prefix with simple continuation-token paging.
    async fn list_files(
        &self,
        prefix: &str,
        max_keys: usize,
        continuation_token: Option<&str>,
    ) -> CoreResult<FileListing>;

    /// Check existence without fetching.
    async fn file_exists(&self, key: &str) -> CoreResult<bool>;

    /// Server-side copy.
    async fn copy_file(&self, src: &str, dst: &str) -> CoreResult<()>;

    /// Capacity view, if the backend can report one.
    async fn get_storage_quota(&self) -> CoreResult<StorageQuota>;

    /// Aggregate usage counters.
    async fn get_storage_stats(&self) -> CoreResult<StorageStats>;

    /// Verify the backend is reachable and writable.
    async fn health_check(&self) -> CoreResult<()> {
        Ok(())
    }
}

/// Synthetic presigned URL for adapters without a native signing scheme.
///
/// The signature binds the key and expiry; it is not a security boundary on
/// its own, the fronting layer still authenticates requests.
pub(crate) fn synthetic_presigned_url(
    scheme: &str,
    key: &str,
    method: &str,
    expires_in_secs: u64,
) -> PresignedUrl {
    use base64::{Engine as _, engine::general_purpose};

    let expires_at = Utc::now() + chrono::Duration::seconds(expires_in_secs as i64);
    let signature = general_purpose::URL_SAFE_NO_PAD.encode(
        md5::compute(format!("{method}:{key}:{}", expires_at.timestamp())).as_slice(),
    );
    PresignedUrl {
        url: format!(
            "{scheme}://{key}?method={method}&expires={}&sig={signature}",
            expires_at.timestamp()
        ),
        expires_at,
    }
}
