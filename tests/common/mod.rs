//! Shared fixtures: an always-working in-memory plane, a fault-injecting
//! adapter, and instrumented transform executors.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use media_plane::{
    adapters::{
        ChunkReceipt, FileListing, FileMetadata, MemoryAdapter, PresignedUrl, StorageAdapter,
        StorageQuota, StorageStats, TransferOptions, UploadOutcome,
    },
    errors::{CoreError, CoreResult},
    models::{
        allocation::{AllocationContext, ProviderConfig, ProviderProfile},
        transform::{OpKind, TransformOp},
    },
    services::{
        allocator::StorageAllocator,
        events::EventBus,
        transform_scheduler::{TransformConfig, TransformExecutor, TransformScheduler},
        upload_manager::{UploadConfig, UploadManager},
    },
};
use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};
use tokio::sync::{Semaphore, mpsc};

pub const PROVIDER: &str = "mem";

/// Fault-injecting wrapper around the memory adapter. Fails the first
/// `fail_first` chunk uploads with a retryable transfer error and counts
/// every attempt; optionally parks inside `complete_multipart_upload`
/// until the test releases it.
pub struct FlakyAdapter {
    inner: MemoryAdapter,
    fail_first: u32,
    attempts: AtomicU32,
    completion_entered: Option<mpsc::UnboundedSender<()>>,
    completion_gate: Semaphore,
}

impl FlakyAdapter {
    pub fn new(fail_first: u32) -> Self {
        Self {
            inner: MemoryAdapter::new(),
            fail_first,
            attempts: AtomicU32::new(0),
            completion_entered: None,
            completion_gate: Semaphore::new(Semaphore::MAX_PERMITS),
        }
    }

    /// Adapter whose multipart completions block until released. The
    /// returned receiver fires once per completion call entering the gate.
    pub fn gated() -> (Arc<Self>, mpsc::UnboundedReceiver<()>) {
        let (entered_tx, entered_rx) = mpsc::unbounded_channel();
        let adapter = Arc::new(Self {
            inner: MemoryAdapter::new(),
            fail_first: 0,
            attempts: AtomicU32::new(0),
            completion_entered: Some(entered_tx),
            completion_gate: Semaphore::new(0),
        });
        (adapter, entered_rx)
    }

    pub fn chunk_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Allow `n` parked or future completion calls to proceed.
    pub fn release_completions(&self, n: usize) {
        self.completion_gate.add_permits(n);
    }
}

#[async_trait]
impl StorageAdapter for FlakyAdapter {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn initialize(&self) -> CoreResult<()> {
        self.inner.initialize().await
    }

    async fn upload_file(
        &self,
        key: &str,
        data: Bytes,
        opts: &TransferOptions,
    ) -> CoreResult<UploadOutcome> {
        self.inner.upload_file(key, data, opts).await
    }

    async fn upload_chunk(
        &self,
        key: &str,
        data: Bytes,
        chunk_index: u32,
        total_chunks: u32,
        opts: &TransferOptions,
    ) -> CoreResult<ChunkReceipt> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.fail_first {
            return Err(CoreError::Transfer(format!(
                "injected failure on attempt {attempt}"
            )));
        }
        self.inner
            .upload_chunk(key, data, chunk_index, total_chunks, opts)
            .await
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[ChunkReceipt],
        opts: &TransferOptions,
    ) -> CoreResult<UploadOutcome> {
        if let Some(tx) = &self.completion_entered {
            let _ = tx.send(());
        }
        let permit = self
            .completion_gate
            .acquire()
            .await
            .map_err(|_| CoreError::Transfer("completion gate closed".into()))?;
        permit.forget();
        self.inner
            .complete_multipart_upload(key, upload_id, parts, opts)
            .await
    }

    async fn generate_presigned_upload_url(
        &self,
        key: &str,
        opts: &TransferOptions,
    ) -> CoreResult<PresignedUrl> {
        self.inner.generate_presigned_upload_url(key, opts).await
    }

    async fn generate_presigned_download_url(
        &self,
        key: &str,
        opts: &TransferOptions,
    ) -> CoreResult<PresignedUrl> {
        self.inner.generate_presigned_download_url(key, opts).await
    }

    async fn download_file(&self, key: &str, opts: &TransferOptions) -> CoreResult<Bytes> {
        self.inner.download_file(key, opts).await
    }

    async fn get_file_metadata(&self, key: &str) -> CoreResult<FileMetadata> {
        self.inner.get_file_metadata(key).await
    }

    async fn delete_file(&self, key: &str) -> CoreResult<()> {
        self.inner.delete_file(key).await
    }

    async fn list_files(
        &self,
        prefix: &str,
        max_keys: usize,
        continuation_token: Option<&str>,
    ) -> CoreResult<FileListing> {
        self.inner
            .list_files(prefix, max_keys, continuation_token)
            .await
    }

    async fn file_exists(&self, key: &str) -> CoreResult<bool> {
        self.inner.file_exists(key).await
    }

    async fn copy_file(&self, src: &str, dst: &str) -> CoreResult<()> {
        self.inner.copy_file(src, dst).await
    }

    async fn get_storage_quota(&self) -> CoreResult<StorageQuota> {
        self.inner.get_storage_quota().await
    }

    async fn get_storage_stats(&self) -> CoreResult<StorageStats> {
        self.inner.get_storage_stats().await
    }
}

/// Executor that counts operation invocations and optionally sleeps to
/// simulate real work.
pub struct CountingExecutor {
    calls: AtomicU32,
    delay: Duration,
}

impl CountingExecutor {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            delay,
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransformExecutor for CountingExecutor {
    async fn execute(&self, source: &Bytes, _op: &TransformOp) -> CoreResult<Bytes> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(source.clone())
    }
}

/// Executor that fails its first `fail_first` invocations with a retryable
/// error.
pub struct FailingExecutor {
    calls: AtomicU32,
    fail_first: u32,
}

impl FailingExecutor {
    pub fn new(fail_first: u32) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            fail_first,
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransformExecutor for FailingExecutor {
    async fn execute(&self, source: &Bytes, _op: &TransformOp) -> CoreResult<Bytes> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.fail_first {
            return Err(CoreError::Transfer(format!("injected op failure {call}")));
        }
        Ok(source.clone())
    }
}

/// Allocator with a single registered adapter as the default provider.
pub fn allocator_with(adapter: Arc<dyn StorageAdapter>) -> Arc<StorageAllocator> {
    let allocator = Arc::new(StorageAllocator::new("test-bucket"));
    allocator.add_provider(ProviderConfig {
        name: PROVIDER.into(),
        adapter,
        priority: 10,
        enabled: true,
        quota_bytes: None,
        profile: ProviderProfile::default(),
    });
    allocator
}

/// Upload manager wired to the given adapter with fast test timings.
pub fn upload_manager(adapter: Arc<dyn StorageAdapter>) -> Arc<UploadManager> {
    let allocator = allocator_with(adapter);
    Arc::new(UploadManager::new(
        allocator,
        Arc::new(EventBus::new()),
        test_upload_config(),
    ))
}

pub fn test_upload_config() -> UploadConfig {
    UploadConfig {
        default_chunk_size: 4,
        max_retries: 3,
        base_delay_ms: 1,
        retention_secs: 3600,
    }
}

pub fn test_transform_config(max_concurrent_jobs: usize) -> TransformConfig {
    TransformConfig {
        max_concurrent_jobs,
        retry_attempts: 3,
        base_delay_ms: 1,
        job_timeout_ms: 5_000,
        cache_ttl_secs: 3600,
        retention_secs: 3600,
        source_provider: PROVIDER.into(),
    }
}

/// Scheduler over a fresh memory adapter preloaded with one source file.
/// Returns the scheduler, the allocator, and the source key.
pub async fn scheduler_with_source(
    executor: Arc<dyn TransformExecutor>,
    cfg: TransformConfig,
) -> (TransformScheduler, Arc<StorageAllocator>, String) {
    let adapter = Arc::new(MemoryAdapter::new());
    let source_key = "org1/proj1/1700000000000_abcd1234_source.png".to_string();
    adapter
        .upload_file(
            &source_key,
            Bytes::from_static(b"source bytes"),
            &TransferOptions::default(),
        )
        .await
        .expect("preload source");
    let allocator = allocator_with(adapter);
    let scheduler = TransformScheduler::new(
        allocator.clone(),
        executor,
        Arc::new(EventBus::new()),
        cfg,
    );
    (scheduler, allocator, source_key)
}

pub fn resize_op() -> TransformOp {
    let mut options = std::collections::BTreeMap::new();
    options.insert("width".to_string(), serde_json::json!(320));
    TransformOp {
        kind: OpKind::Resize,
        options,
    }
}

pub fn default_ctx() -> AllocationContext {
    AllocationContext {
        organization_id: "org1".into(),
        project_id: "proj1".into(),
        user_id: None,
        user_tier: None,
    }
}
