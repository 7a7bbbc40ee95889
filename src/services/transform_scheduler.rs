//! Transform job scheduler.
//!
//! Jobs enter an unbounded FIFO queue; a dispatcher task acquires one of
//! `max_concurrent_jobs` semaphore permits *before* spawning each job, so
//! admission is fair and the concurrency bound is hard. Results are cached
//! by a fingerprint of source + canonicalized operations; concurrent
//! submissions sharing a fingerprint collapse onto a single in-flight
//! computation through a watch channel.

use crate::{
    adapters::TransferOptions,
    errors::{CoreError, CoreResult},
    models::{
        allocation::AllocationContext,
        transform::{JobStatus, TransformJob, TransformOp, TransformResult, fingerprint},
    },
    services::{
        allocator::StorageAllocator,
        events::{Event, EventBus},
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::{RwLock, Semaphore, mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

const MAX_BACKOFF_MS: u64 = 30_000;

/// Tunables for the scheduler. Cache hits bypass every one of these.
#[derive(Clone, Debug)]
pub struct TransformConfig {
    /// Hard bound on concurrently executing jobs.
    pub max_concurrent_jobs: usize,
    /// Execution attempts per job (first try included).
    pub retry_attempts: u32,
    /// Base delay for exponential backoff between attempts.
    pub base_delay_ms: u64,
    /// Wall-clock budget per job; exceeding it fails the job regardless of
    /// remaining retries.
    pub job_timeout_ms: u64,
    /// How long cached results stay servable.
    pub cache_ttl_secs: u64,
    /// How long terminal jobs stay queryable before GC.
    pub retention_secs: u64,
    /// Provider the source files are read from.
    pub source_provider: String,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            retry_attempts: 3,
            base_delay_ms: 500,
            job_timeout_ms: 300_000,
            cache_ttl_secs: 3600,
            retention_secs: 3600,
            source_provider: "local".into(),
        }
    }
}

/// Applies one operation to the working bytes of a transform chain.
///
/// Production wires a real codec pipeline here; tests substitute counting
/// or failing executors.
#[async_trait]
pub trait TransformExecutor: Send + Sync + 'static {
    async fn execute(&self, source: &Bytes, op: &TransformOp) -> CoreResult<Bytes>;
}

/// Placeholder executor until real codec integration lands: every operation
/// yields a byte copy of its input.
pub struct PassthroughExecutor;

#[async_trait]
impl TransformExecutor for PassthroughExecutor {
    async fn execute(&self, source: &Bytes, _op: &TransformOp) -> CoreResult<Bytes> {
        Ok(source.clone())
    }
}

type SharedOutcome = Option<Result<TransformResult, String>>;

struct CachedResult {
    result: TransformResult,
    expires_at: DateTime<Utc>,
}

enum CacheSlot {
    Ready(CachedResult),
    InFlight(watch::Receiver<SharedOutcome>),
}

struct QueueItem {
    job_id: Uuid,
    outcome_tx: watch::Sender<SharedOutcome>,
}

struct Inner {
    jobs: RwLock<HashMap<Uuid, TransformJob>>,
    cache: Mutex<HashMap<String, CacheSlot>>,
    allocator: Arc<StorageAllocator>,
    executor: Arc<dyn TransformExecutor>,
    events: Arc<EventBus>,
    cfg: TransformConfig,
}

pub struct TransformScheduler {
    inner: Arc<Inner>,
    queue_tx: mpsc::UnboundedSender<QueueItem>,
}

impl TransformScheduler {
    /// Build the scheduler and spawn its dispatcher task.
    pub fn new(
        allocator: Arc<StorageAllocator>,
        executor: Arc<dyn TransformExecutor>,
        events: Arc<EventBus>,
        cfg: TransformConfig,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            jobs: RwLock::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
            allocator,
            executor,
            events,
            cfg,
        });
        tokio::spawn(dispatch(inner.clone(), queue_rx));
        Self { inner, queue_tx }
    }

    /// Submit a transform request. Cache hits complete immediately; an
    /// identical in-flight request turns this job into a follower that
    /// inherits the leader's outcome without executing anything.
    pub async fn submit(
        &self,
        source_key: &str,
        project_id: &str,
        operations: Vec<TransformOp>,
    ) -> CoreResult<TransformJob> {
        if operations.is_empty() {
            return Err(CoreError::Validation(
                "at least one operation is required".into(),
            ));
        }

        let print = fingerprint(source_key, &operations);
        let mut job = TransformJob::new(
            source_key.to_string(),
            project_id.to_string(),
            operations,
            print.clone(),
        );

        enum Admission {
            Cached(TransformResult),
            Follower(watch::Receiver<SharedOutcome>),
            Leader(watch::Sender<SharedOutcome>),
        }

        let admission = {
            let mut cache = self.inner.cache.lock().unwrap();
            match cache.get(&print) {
                Some(CacheSlot::Ready(entry)) if entry.expires_at > Utc::now() => {
                    Admission::Cached(entry.result.clone())
                }
                Some(CacheSlot::InFlight(rx)) => Admission::Follower(rx.clone()),
                _ => {
                    // Vacant or expired: this job leads the computation.
                    let (tx, rx) = watch::channel(None);
                    cache.insert(print.clone(), CacheSlot::InFlight(rx));
                    Admission::Leader(tx)
                }
            }
        };

        if let Admission::Cached(result) = &admission {
            debug!(job_id = %job.id, fingerprint = %print, "transform served from cache");
            job.status = JobStatus::Completed;
            job.progress = 100;
            job.result = Some(result.clone());
            job.finished_at = Some(Utc::now());
        }

        info!(
            job_id = %job.id,
            source_key,
            operations = job.operations.len(),
            status = ?job.status,
            "transform job submitted"
        );
        let response = job.clone();
        let job_id = job.id;
        self.inner.jobs.write().await.insert(job_id, job);

        // The job is visible in the table before anything can act on it.
        match admission {
            Admission::Cached(_) => {}
            Admission::Follower(rx) => {
                debug!(job_id = %job_id, fingerprint = %print, "transform coalesced onto in-flight computation");
                tokio::spawn(follow(self.inner.clone(), job_id, rx));
            }
            Admission::Leader(outcome_tx) => {
                let _ = self.queue_tx.send(QueueItem { job_id, outcome_tx });
            }
        }
        Ok(response)
    }

    /// Current job state.
    pub async fn get_status(&self, job_id: Uuid) -> CoreResult<TransformJob> {
        self.inner
            .jobs
            .read()
            .await
            .get(&job_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("transform job", job_id))
    }

    /// Cancel a job that has not started executing. A processing job runs
    /// to completion; the status enum has no cancelled state.
    pub async fn cancel(&self, job_id: Uuid) -> CoreResult<TransformJob> {
        let mut jobs = self.inner.jobs.write().await;
        let job = jobs
            .get_mut(&job_id)
            .ok_or_else(|| CoreError::not_found("transform job", job_id))?;
        match job.status {
            JobStatus::Pending => {
                job.status = JobStatus::Failed;
                job.error = Some("cancelled before execution".into());
                job.finished_at = Some(Utc::now());
                info!(job_id = %job_id, "transform job cancelled");
                Ok(job.clone())
            }
            other => Err(CoreError::InvalidState {
                from: format!("{other:?}"),
                to: "Cancelled".into(),
            }),
        }
    }

    /// Drop terminal jobs past retention and purge expired cache entries.
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        {
            let mut cache = self.inner.cache.lock().unwrap();
            cache.retain(|_, slot| match slot {
                CacheSlot::Ready(entry) => entry.expires_at > now,
                CacheSlot::InFlight(_) => true,
            });
        }

        let cutoff = now - chrono::Duration::seconds(self.inner.cfg.retention_secs as i64);
        let mut jobs = self.inner.jobs.write().await;
        let stale: Vec<Uuid> = jobs
            .iter()
            .filter(|(_, job)| {
                job.status.is_terminal() && job.finished_at.is_some_and(|t| t < cutoff)
            })
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            jobs.remove(id);
        }
        if !stale.is_empty() {
            debug!(count = stale.len(), "swept expired transform jobs");
        }
        stale.len()
    }
}

/// Dispatcher: FIFO admission under a hard permit bound.
async fn dispatch(inner: Arc<Inner>, mut queue_rx: mpsc::UnboundedReceiver<QueueItem>) {
    let permits = Arc::new(Semaphore::new(inner.cfg.max_concurrent_jobs));
    while let Some(item) = queue_rx.recv().await {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };

        // A job cancelled while queued is skipped; release its cache slot
        // so later submissions can lead a fresh computation.
        let still_pending = inner
            .jobs
            .read()
            .await
            .get(&item.job_id)
            .is_some_and(|job| job.status == JobStatus::Pending);
        if !still_pending {
            release_slot(&inner, item.job_id).await;
            let _ = item.outcome_tx.send(Some(Err("cancelled before execution".into())));
            continue;
        }

        let inner = inner.clone();
        tokio::spawn(async move {
            let _permit = permit;
            run_job(inner, item).await;
        });
    }
}

/// Execute one job: attempt loop with backoff inside a wall-clock timeout,
/// then publish the outcome to followers and the cache.
async fn run_job(inner: Arc<Inner>, item: QueueItem) {
    let job_id = item.job_id;
    {
        let mut jobs = inner.jobs.write().await;
        let Some(job) = jobs.get_mut(&job_id) else {
            return;
        };
        job.status = JobStatus::Processing;
        job.started_at = Some(Utc::now());
    }

    let budget = Duration::from_millis(inner.cfg.job_timeout_ms);
    let outcome = match tokio::time::timeout(budget, attempt_loop(&inner, job_id)).await {
        Ok(result) => result,
        Err(_) => Err(CoreError::Timeout(format!(
            "transform job exceeded its {}ms budget",
            inner.cfg.job_timeout_ms
        ))),
    };

    match outcome {
        Ok(result) => {
            let (fingerprint, source_key) = {
                let mut jobs = inner.jobs.write().await;
                let Some(job) = jobs.get_mut(&job_id) else {
                    return;
                };
                job.status = JobStatus::Completed;
                job.progress = 100;
                job.result = Some(result.clone());
                job.finished_at = Some(Utc::now());
                (job.fingerprint.clone(), job.source_key.clone())
            };
            {
                let mut cache = inner.cache.lock().unwrap();
                cache.insert(
                    fingerprint,
                    CacheSlot::Ready(CachedResult {
                        result: result.clone(),
                        expires_at: Utc::now()
                            + chrono::Duration::seconds(inner.cfg.cache_ttl_secs as i64),
                    }),
                );
            }
            info!(job_id = %job_id, result_key = %result.key, "transform job completed");
            inner.events.emit(
                None,
                Event::FileTransformed {
                    job_id,
                    source_key,
                    result_key: result.key.clone(),
                },
            );
            let _ = item.outcome_tx.send(Some(Ok(result)));
        }
        Err(err) => {
            let reason = err.to_string();
            warn!(job_id = %job_id, "transform job failed: {reason}");
            {
                let mut jobs = inner.jobs.write().await;
                if let Some(job) = jobs.get_mut(&job_id) {
                    job.status = JobStatus::Failed;
                    job.error = Some(reason.clone());
                    job.finished_at = Some(Utc::now());
                }
            }
            release_slot(&inner, job_id).await;
            let _ = item.outcome_tx.send(Some(Err(reason)));
        }
    }
}

/// Bounded attempt loop with exponential backoff between attempts.
async fn attempt_loop(inner: &Arc<Inner>, job_id: Uuid) -> CoreResult<TransformResult> {
    let attempts = inner.cfg.retry_attempts.max(1);
    let mut last_err = None;
    for attempt in 1..=attempts {
        {
            let mut jobs = inner.jobs.write().await;
            if let Some(job) = jobs.get_mut(&job_id) {
                job.attempts = attempt;
                job.progress = 0;
            }
        }
        match execute_chain(inner, job_id).await {
            Ok(result) => return Ok(result),
            Err(err) if err.is_retryable() && attempt < attempts => {
                let delay_ms = backoff_ms(inner.cfg.base_delay_ms, attempt);
                warn!(job_id = %job_id, attempt, delay_ms, "transform attempt failed, retrying: {err}");
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                last_err = Some(err);
            }
            Err(err) if err.is_retryable() => {
                return Err(CoreError::RetriesExhausted {
                    attempts,
                    last_error: err.to_string(),
                });
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_err.unwrap_or_else(|| CoreError::Transfer("no attempts executed".into())))
}

/// Run the operation chain once and persist the artifact.
async fn execute_chain(inner: &Arc<Inner>, job_id: Uuid) -> CoreResult<TransformResult> {
    let (source_key, project_id, operations) = {
        let jobs = inner.jobs.read().await;
        let job = jobs
            .get(&job_id)
            .ok_or_else(|| CoreError::not_found("transform job", job_id))?;
        (
            job.source_key.clone(),
            job.project_id.clone(),
            job.operations.clone(),
        )
    };

    let opts = TransferOptions::default();
    let source_adapter = inner.allocator.adapter_for(&inner.cfg.source_provider)?;
    let mut working = source_adapter.download_file(&source_key, &opts).await?;

    let total = operations.len();
    for (index, op) in operations.iter().enumerate() {
        working = inner.executor.execute(&working, op).await?;
        let progress = (((index + 1) * 100) / total) as u8;
        let mut jobs = inner.jobs.write().await;
        if let Some(job) = jobs.get_mut(&job_id) {
            job.progress = progress;
        }
    }

    // Derived artifacts are allocated like any other upload; the org
    // segment comes from the source key's own layout.
    let ctx = AllocationContext {
        organization_id: source_key
            .split('/')
            .next()
            .unwrap_or("transforms")
            .to_string(),
        project_id,
        user_id: None,
        user_tier: None,
    };
    let derived_name = derived_name(&source_key, &operations);
    let allocation = inner
        .allocator
        .allocate(&derived_name, working.len() as u64, &ctx)
        .await?;
    let artifact_adapter = inner.allocator.adapter_for(&allocation.provider)?;
    let outcome = artifact_adapter
        .upload_file(&allocation.key, working, &opts)
        .await?;

    Ok(TransformResult {
        key: allocation.key,
        provider: allocation.provider,
        size: outcome.size,
    })
}

/// Follower task for a coalesced submission: wait on the leader's watch
/// channel and inherit its outcome.
async fn follow(inner: Arc<Inner>, job_id: Uuid, mut rx: watch::Receiver<SharedOutcome>) {
    let outcome = loop {
        {
            let value = rx.borrow();
            if let Some(outcome) = value.clone() {
                break outcome;
            }
        }
        if rx.changed().await.is_err() {
            break Err("in-flight computation abandoned".to_string());
        }
    };

    let mut jobs = inner.jobs.write().await;
    let Some(job) = jobs.get_mut(&job_id) else {
        return;
    };
    if job.status.is_terminal() {
        return;
    }
    match outcome {
        Ok(result) => {
            job.status = JobStatus::Completed;
            job.progress = 100;
            job.result = Some(result);
        }
        Err(error) => {
            job.status = JobStatus::Failed;
            job.error = Some(error);
        }
    }
    job.finished_at = Some(Utc::now());
}

/// Remove a job's in-flight cache slot, keeping Ready entries intact.
async fn release_slot(inner: &Arc<Inner>, job_id: Uuid) {
    let fingerprint = inner
        .jobs
        .read()
        .await
        .get(&job_id)
        .map(|job| job.fingerprint.clone());
    if let Some(print) = fingerprint {
        let mut cache = inner.cache.lock().unwrap();
        if matches!(cache.get(&print), Some(CacheSlot::InFlight(_))) {
            cache.remove(&print);
        }
    }
}

fn backoff_ms(base_delay_ms: u64, attempt: u32) -> u64 {
    base_delay_ms
        .saturating_mul(1u64 << (attempt.saturating_sub(1)).min(16))
        .min(MAX_BACKOFF_MS)
}

/// `{op labels}_{source file name}` keeps derived keys self-describing.
fn derived_name(source_key: &str, operations: &[TransformOp]) -> String {
    let file_name = source_key.rsplit('/').next().unwrap_or(source_key);
    let labels: Vec<&str> = operations.iter().map(|op| op.kind.label()).collect();
    format!("{}_{}", labels.join("-"), file_name)
}
