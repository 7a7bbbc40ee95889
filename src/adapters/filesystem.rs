//! Local-disk storage adapter.
//!
//! Object payloads land beneath `base_path/{shard}/{shard}/{key}` where the
//! shards are the first two bytes of `md5(key)` — this keeps per-directory
//! file counts bounded. Writes go through a temp file, are fsynced, and are
//! atomically renamed into place. Multipart chunks are staged as part files
//! and concatenated on completion.

use crate::{
    adapters::{
        ChunkReceipt, FileListing, FileMetadata, PresignedUrl, StorageAdapter, StorageQuota,
        StorageStats, TransferOptions, UploadOutcome, synthetic_presigned_url,
    },
    errors::{CoreError, CoreResult},
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use md5::Context;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

const DEFAULT_URL_EXPIRY_SECS: u64 = 3600;
const PARTS_DIR: &str = ".parts";
const MAX_KEY_LEN: usize = 1024;

/// Storage adapter backed by a local directory tree.
#[derive(Clone, Debug)]
pub struct FilesystemAdapter {
    base_path: PathBuf,
    quota_bytes: Option<u64>,
}

impl FilesystemAdapter {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            quota_bytes: None,
        }
    }

    pub fn with_quota(mut self, quota_bytes: u64) -> Self {
        self.quota_bytes = Some(quota_bytes);
        self
    }

    /// Basic key validation to avoid trivial path traversal vectors.
    ///
    /// Rejects empty/oversized keys, absolute paths, `..` components, and
    /// control characters.
    fn ensure_key_safe(key: &str) -> CoreResult<()> {
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Err(CoreError::Validation("invalid object key".into()));
        }
        if key.starts_with('/') || key.contains("..") {
            return Err(CoreError::Validation("invalid object key".into()));
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(CoreError::Validation("invalid object key".into()));
        }
        Ok(())
    }

    /// Generate two-level shard identifiers for an object key.
    fn shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// Fully-qualified payload path for a key. Parents may not exist yet.
    fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::shards(key);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    /// Staging directory holding the part files of one multipart key.
    fn parts_dir(&self, key: &str) -> PathBuf {
        let digest = md5::compute(key);
        self.base_path.join(PARTS_DIR).join(format!("{digest:x}"))
    }

    /// Write bytes to a temp file, fsync, and rename into `dest`.
    async fn write_atomic(&self, dest: &Path, data: &[u8]) -> CoreResult<()> {
        let parent = dest.parent().map(Path::to_path_buf).ok_or_else(|| {
            CoreError::Io(io::Error::other("object path missing parent directory"))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let write_result = async {
            file.write_all(data).await?;
            file.flush().await?;
            file.sync_all().await?;
            Ok::<_, io::Error>(())
        }
        .await;
        if let Err(err) = write_result {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(CoreError::Io(err));
        }

        if let Err(err) = fs::rename(&tmp_path, dest).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(dest).await?;
                fs::rename(&tmp_path, dest).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(CoreError::Io(err));
            }
        }
        Ok(())
    }

    /// Recursively remove empty directories up to the base path.
    ///
    /// Stops on the first non-empty or missing directory.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.base_path) && current != self.base_path {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }

    /// Walk the shard tree and collect every stored key with its size.
    ///
    /// Listing has no index to lean on, so it is a full walk; acceptable for
    /// the file counts a single node holds.
    async fn walk_keys(&self) -> CoreResult<Vec<(String, u64)>> {
        let mut out = Vec::new();
        let mut stack = vec![self.base_path.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(CoreError::Io(err)),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    if path != self.base_path.join(PARTS_DIR) {
                        stack.push(path);
                    }
                    continue;
                }
                if let Some(key) = self.key_from_path(&path) {
                    let size = entry.metadata().await?.len();
                    out.push((key, size));
                }
            }
        }
        out.sort();
        Ok(out)
    }

    /// Reverse of `object_path`: strip base and the two shard components.
    fn key_from_path(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.base_path).ok()?;
        let mut components = rel.components();
        components.next()?;
        components.next()?;
        let key = components.as_path().to_str()?.to_string();
        if key.is_empty() || key.starts_with(".tmp-") {
            None
        } else {
            Some(key)
        }
    }
}

#[async_trait]
impl StorageAdapter for FilesystemAdapter {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    async fn initialize(&self) -> CoreResult<()> {
        fs::create_dir_all(&self.base_path).await?;
        Ok(())
    }

    async fn upload_file(
        &self,
        key: &str,
        data: Bytes,
        _opts: &TransferOptions,
    ) -> CoreResult<UploadOutcome> {
        Self::ensure_key_safe(key)?;
        let etag = format!("{:x}", md5::compute(&data));
        let size = data.len() as u64;
        self.write_atomic(&self.object_path(key), &data).await?;
        Ok(UploadOutcome {
            key: key.to_string(),
            etag,
            size,
        })
    }

    async fn upload_chunk(
        &self,
        key: &str,
        data: Bytes,
        chunk_index: u32,
        _total_chunks: u32,
        _opts: &TransferOptions,
    ) -> CoreResult<ChunkReceipt> {
        Self::ensure_key_safe(key)?;
        let etag = format!("{:x}", md5::compute(&data));
        let part_path = self.parts_dir(key).join(format!("{:05}", chunk_index));
        self.write_atomic(&part_path, &data).await?;
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
        _opts: &TransferOptions,
    ) -> CoreResult<UploadOutcome> {
        Self::ensure_key_safe(key)?;
        let parts_dir = self.parts_dir(key);

        // A retried completion finds its staging directory already cleaned
        // up; the earlier call assembled the parts into the final object.
        if let Err(err) = fs::metadata(&parts_dir).await {
            if err.kind() == ErrorKind::NotFound {
                return match fs::read(self.object_path(key)).await {
                    Ok(data) => Ok(UploadOutcome {
                        key: key.to_string(),
                        etag: format!("{:x}-{}", md5::compute(&data), parts.len()),
                        size: data.len() as u64,
                    }),
                    Err(err) if err.kind() == ErrorKind::NotFound => Err(CoreError::Transfer(
                        format!("no parts staged for `{key}`"),
                    )),
                    Err(err) => Err(CoreError::Io(err)),
                };
            }
        }

        let mut ordered: Vec<&ChunkReceipt> = parts.iter().collect();
        ordered.sort_by_key(|p| p.part_number);

        let mut assembled = Vec::new();
        let mut digest = Context::new();
        for part in &ordered {
            let part_path = parts_dir.join(format!("{:05}", part.part_number - 1));
            let data = fs::read(&part_path).await.map_err(|err| {
                CoreError::Transfer(format!(
                    "missing part {} for `{}`: {}",
                    part.part_number, key, err
                ))
            })?;
            digest.consume(&data);
            assembled.extend_from_slice(&data);
        }

        let size = assembled.len() as u64;
        let etag = format!("{:x}-{}", digest.compute(), ordered.len());
        self.write_atomic(&self.object_path(key), &assembled)
            .await?;

        if let Err(err) = fs::remove_dir_all(&parts_dir).await {
            if err.kind() != ErrorKind::NotFound {
                debug!("failed to clean part files for {}: {}", key, err);
            }
        }

        Ok(UploadOutcome {
            key: key.to_string(),
            etag,
            size,
        })
    }

    async fn generate_presigned_upload_url(
        &self,
        key: &str,
        opts: &TransferOptions,
    ) -> CoreResult<PresignedUrl> {
        Self::ensure_key_safe(key)?;
        let expiry = opts.expires_in_secs.unwrap_or(DEFAULT_URL_EXPIRY_SECS);
        Ok(synthetic_presigned_url("file", key, "PUT", expiry))
    }

    async fn generate_presigned_download_url(
        &self,
        key: &str,
        opts: &TransferOptions,
    ) -> CoreResult<PresignedUrl> {
        Self::ensure_key_safe(key)?;
        let expiry = opts.expires_in_secs.unwrap_or(DEFAULT_URL_EXPIRY_SECS);
        Ok(synthetic_presigned_url("file", key, "GET", expiry))
    }

    async fn download_file(&self, key: &str, _opts: &TransferOptions) -> CoreResult<Bytes> {
        Self::ensure_key_safe(key)?;
        match fs::read(self.object_path(key)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(CoreError::not_found("file", key))
            }
            Err(err) => Err(CoreError::Io(err)),
        }
    }

    async fn get_file_metadata(&self, key: &str) -> CoreResult<FileMetadata> {
        Self::ensure_key_safe(key)?;
        let meta = match fs::metadata(self.object_path(key)).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(CoreError::not_found("file", key));
            }
            Err(err) => return Err(CoreError::Io(err)),
        };
        let last_modified = meta
            .modified()
            .ok()
            .map(|time| DateTime::<Utc>::from(time));
        Ok(FileMetadata {
            key: key.to_string(),
            size: meta.len(),
            etag: None,
            content_type: None,
            last_modified,
        })
    }

    async fn delete_file(&self, key: &str) -> CoreResult<()> {
        Self::ensure_key_safe(key)?;
        let path = self.object_path(key);
        match fs::remove_file(&path).await {
            Ok(_) => debug!("removed {}", path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", path.display());
            }
            Err(err) => return Err(CoreError::Io(err)),
        }
        if let Some(parent) = path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }

    async fn list_files(
        &self,
        prefix: &str,
        max_keys: usize,
        continuation_token: Option<&str>,
    ) -> CoreResult<FileListing> {
        let max_keys = max_keys.clamp(1, 1000);
        let all = self.walk_keys().await?;
        let mut keys: Vec<String> = all
            .into_iter()
            .map(|(key, _)| key)
            .filter(|key| key.starts_with(prefix))
            .filter(|key| continuation_token.is_none_or(|token| key.as_str() > token))
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
        Self::ensure_key_safe(key)?;
        match fs::metadata(self.object_path(key)).await {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(CoreError::Io(err)),
        }
    }

    async fn copy_file(&self, src: &str, dst: &str) -> CoreResult<()> {
        Self::ensure_key_safe(src)?;
        Self::ensure_key_safe(dst)?;
        let data = self.download_file(src, &TransferOptions::default()).await?;
        self.write_atomic(&self.object_path(dst), &data).await?;
        Ok(())
    }

    async fn get_storage_quota(&self) -> CoreResult<StorageQuota> {
        let used_bytes = self.walk_keys().await?.iter().map(|(_, size)| size).sum();
        Ok(StorageQuota {
            used_bytes,
            limit_bytes: self.quota_bytes,
        })
    }

    async fn get_storage_stats(&self) -> CoreResult<StorageStats> {
        let all = self.walk_keys().await?;
        Ok(StorageStats {
            object_count: all.len() as u64,
            total_bytes: all.iter().map(|(_, size)| size).sum(),
        })
    }

    /// Best-effort write/read/delete probe under the base path.
    async fn health_check(&self) -> CoreResult<()> {
        let tmp_path = self.base_path.join(format!(".healthz-{}", Uuid::new_v4()));
        fs::write(&tmp_path, b"healthz").await?;
        let bytes = fs::read(&tmp_path).await?;
        let _ = fs::remove_file(&tmp_path).await;
        if bytes != b"healthz" {
            return Err(CoreError::Io(io::Error::other("probe content mismatch")));
        }
        Ok(())
    }
}
