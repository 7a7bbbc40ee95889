//! Upload session manager: drives the per-upload chunk state machine.
//!
//! Sessions live only in memory. Chunks advance strictly sequentially
//! within a session; retry/backoff is an explicit bounded loop with timed
//! waits, never recursion. Cancellation flips the status synchronously —
//! adapter calls that were already in flight finish on their own, but their
//! results are discarded rather than applied to a cancelled session.

use crate::{
    adapters::{ChunkReceipt, StorageAdapter, TransferOptions},
    errors::{CoreError, CoreResult},
    models::{
        allocation::AllocationContext,
        session::{ChunkOutcome, ProgressSnapshot, SessionStatus, UploadSession},
    },
    services::{
        allocator::StorageAllocator,
        events::{Event, EventBus},
    },
};
use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Refuse sessions that would need more presigned chunk URLs than this.
const MAX_CHUNKS_PER_SESSION: u32 = 10_000;

/// Backoff never sleeps longer than this, whatever the retry count.
const MAX_BACKOFF_MS: u64 = 30_000;

/// Tunables for the session state machine.
#[derive(Clone, Debug)]
pub struct UploadConfig {
    /// Chunk size used when the init request does not specify one.
    pub default_chunk_size: u64,
    /// Retries per chunk before the session fails.
    pub max_retries: u32,
    /// Base delay for exponential backoff.
    pub base_delay_ms: u64,
    /// How long terminal sessions stay queryable before GC.
    pub retention_secs: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            default_chunk_size: 5 * 1024 * 1024,
            max_retries: 3,
            base_delay_ms: 500,
            retention_secs: 3600,
        }
    }
}

/// Response to a successful init request.
#[derive(Clone, Debug, Serialize)]
pub struct InitializedUpload {
    pub upload_id: Uuid,
    pub file_key: String,
    pub total_chunks: u32,
    pub chunk_urls: Vec<String>,
    pub session: ProgressSnapshot,
}

/// Response to a resume request: what is still missing and where to put it.
#[derive(Clone, Debug, Serialize)]
pub struct ResumedUpload {
    pub upload_id: Uuid,
    pub missing_chunks: Vec<u32>,
    pub chunk_urls: Vec<String>,
    pub session: ProgressSnapshot,
}

enum RetryDecision {
    After(Duration),
    Exhausted(CoreError),
}

pub struct UploadManager {
    sessions: RwLock<HashMap<Uuid, UploadSession>>,
    allocator: Arc<StorageAllocator>,
    events: Arc<EventBus>,
    cfg: UploadConfig,
}

impl UploadManager {
    pub fn new(allocator: Arc<StorageAllocator>, events: Arc<EventBus>, cfg: UploadConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            allocator,
            events,
            cfg,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Allocate storage and register a new session in `Pending`.
    pub async fn create_session(
        &self,
        file_name: &str,
        file_size: u64,
        chunk_size: Option<u64>,
        ctx: &AllocationContext,
    ) -> CoreResult<InitializedUpload> {
        if file_size == 0 {
            return Err(CoreError::Validation("file_size must be positive".into()));
        }
        let chunk_size = chunk_size.unwrap_or(self.cfg.default_chunk_size);
        if chunk_size == 0 {
            return Err(CoreError::Validation("chunk_size must be positive".into()));
        }
        let total_chunks = file_size.div_ceil(chunk_size);
        if total_chunks > MAX_CHUNKS_PER_SESSION as u64 {
            return Err(CoreError::Validation(format!(
                "upload would need {total_chunks} chunks (max {MAX_CHUNKS_PER_SESSION}); use a larger chunk_size"
            )));
        }
        let total_chunks = total_chunks as u32;

        let allocation = self.allocator.allocate(file_name, file_size, ctx).await?;
        let chunk_urls = chunk_urls(&allocation.url, total_chunks);

        let now = Utc::now();
        let session = UploadSession {
            id: Uuid::new_v4(),
            file_key: allocation.key.clone(),
            file_name: file_name.to_string(),
            file_size,
            chunk_size,
            total_chunks,
            current_chunk: 0,
            bytes_uploaded: 0,
            status: SessionStatus::Pending,
            upload_speed: None,
            estimated_time_remaining: None,
            retry_count: 0,
            max_retries: self.cfg.max_retries,
            started_at: now,
            last_update: now,
            error: None,
            allocation,
            parts: Vec::new(),
        };

        info!(
            upload_id = %session.id,
            file_key = %session.file_key,
            provider = %session.allocation.provider,
            file_size,
            total_chunks,
            "created upload session"
        );

        let response = InitializedUpload {
            upload_id: session.id,
            file_key: session.file_key.clone(),
            total_chunks,
            chunk_urls,
            session: session.snapshot(),
        };
        self.sessions.write().await.insert(session.id, session);
        Ok(response)
    }

    /// Move a pending session into `Uploading`.
    pub async fn start(&self, id: Uuid) -> CoreResult<ProgressSnapshot> {
        let snapshot = {
            let mut sessions = self.sessions.write().await;
            let session = get_mut(&mut sessions, id)?;
            transition(session, SessionStatus::Uploading)?;
            session.snapshot()
        };
        self.events.emit(Some(id), Event::Progress(snapshot.clone()));
        Ok(snapshot)
    }

    /// Server-driven chunk transfer: push `data` through the allocation's
    /// adapter, retrying with exponential backoff up to `max_retries`.
    pub async fn upload_chunk(
        &self,
        id: Uuid,
        chunk_index: u32,
        data: Bytes,
    ) -> CoreResult<ProgressSnapshot> {
        let (adapter, key, total_chunks) = self
            .prepare_transfer(id, chunk_index, data.len() as u64)
            .await?;
        let opts = TransferOptions::default();

        loop {
            match adapter
                .upload_chunk(&key, data.clone(), chunk_index, total_chunks, &opts)
                .await
            {
                Ok(receipt) => {
                    return self
                        .apply_chunk_success(id, chunk_index, data.len() as u64, receipt)
                        .await;
                }
                Err(err) if err.is_retryable() => {
                    match self.apply_chunk_failure(id, chunk_index, &err.to_string()).await? {
                        RetryDecision::After(delay) => {
                            tokio::time::sleep(delay).await;
                            self.ensure_uploading(id).await?;
                        }
                        RetryDecision::Exhausted(err) => return Err(err),
                    }
                }
                Err(err) => {
                    self.fail(id, err.to_string()).await;
                    return Err(err);
                }
            }
        }
    }

    /// Client-driven outcome report for one chunk (the client transfers via
    /// presigned URLs and tells us how it went).
    pub async fn report_chunk_result(
        &self,
        id: Uuid,
        chunk_index: u32,
        outcome: ChunkOutcome,
    ) -> CoreResult<ProgressSnapshot> {
        match outcome {
            ChunkOutcome::Success { etag } => {
                let expected = {
                    let mut sessions = self.sessions.write().await;
                    let session = get_mut(&mut sessions, id)?;
                    ensure_chunk_accepted(session, chunk_index)?;
                    session.chunk_len(chunk_index)
                };
                let receipt = ChunkReceipt {
                    etag,
                    part_number: chunk_index + 1,
                };
                self.apply_chunk_success(id, chunk_index, expected, receipt)
                    .await
            }
            ChunkOutcome::Failure { error } => {
                match self.apply_chunk_failure(id, chunk_index, &error).await? {
                    RetryDecision::After(_) | RetryDecision::Exhausted(_) => self.get(id).await,
                }
            }
        }
    }

    /// `Uploading -> Paused`.
    pub async fn pause(&self, id: Uuid) -> CoreResult<ProgressSnapshot> {
        let snapshot = {
            let mut sessions = self.sessions.write().await;
            let session = get_mut(&mut sessions, id)?;
            transition(session, SessionStatus::Paused)?;
            session.snapshot()
        };
        self.events.emit(Some(id), Event::Paused { upload_id: id });
        Ok(snapshot)
    }

    /// `Paused -> Uploading`, returning the chunks still missing and fresh
    /// presigned URLs for them.
    pub async fn resume(&self, id: Uuid) -> CoreResult<ResumedUpload> {
        let (snapshot, missing, provider, key, pending_completion) = {
            let mut sessions = self.sessions.write().await;
            let session = get_mut(&mut sessions, id)?;
            transition(session, SessionStatus::Uploading)?;
            // A pause that landed while the final multipart completion was
            // in flight discarded its result; every chunk is confirmed but
            // the session never turned terminal.
            let pending_completion = (session.current_chunk == session.total_chunks)
                .then(|| session.parts.clone());
            (
                session.snapshot(),
                session.missing_chunks(),
                session.allocation.provider.clone(),
                session.file_key.clone(),
                pending_completion,
            )
        };

        if let Some(parts) = pending_completion {
            self.events.emit(Some(id), Event::Resumed { upload_id: id });
            let snapshot = self.complete(id, &provider, &key, &parts).await?;
            return Ok(ResumedUpload {
                upload_id: id,
                missing_chunks: Vec::new(),
                chunk_urls: Vec::new(),
                session: snapshot,
            });
        }

        let adapter = self.allocator.adapter_for(&provider)?;
        let url = adapter
            .generate_presigned_upload_url(&key, &TransferOptions::default())
            .await?;
        let chunk_urls = missing
            .iter()
            .map(|index| format!("{}&part={}", url.url, index + 1))
            .collect();

        self.events.emit(Some(id), Event::Resumed { upload_id: id });
        Ok(ResumedUpload {
            upload_id: id,
            missing_chunks: missing,
            chunk_urls,
            session: snapshot,
        })
    }

    /// Cancel immediately. The status flips before this returns; any chunk
    /// transfer still in flight will have its result discarded.
    pub async fn cancel(&self, id: Uuid) -> CoreResult<ProgressSnapshot> {
        let snapshot = {
            let mut sessions = self.sessions.write().await;
            let session = get_mut(&mut sessions, id)?;
            transition(session, SessionStatus::Cancelled)?;
            session.error = Some("cancelled by caller".into());
            session.last_update = Utc::now();
            session.snapshot()
        };
        info!(upload_id = %id, "upload session cancelled");
        self.events.emit(Some(id), Event::Cancelled { upload_id: id });
        Ok(snapshot)
    }

    /// Current progress snapshot.
    pub async fn get(&self, id: Uuid) -> CoreResult<ProgressSnapshot> {
        self.sessions
            .read()
            .await
            .get(&id)
            .map(|s| s.snapshot())
            .ok_or_else(|| CoreError::not_found("upload session", id))
    }

    /// Drop terminal sessions whose retention window has elapsed. Returns
    /// how many were collected.
    pub async fn sweep_expired(&self) -> usize {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.cfg.retention_secs as i64);
        let mut sessions = self.sessions.write().await;
        let stale: Vec<Uuid> = sessions
            .iter()
            .filter(|(_, s)| s.status.is_terminal() && s.last_update < cutoff)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            sessions.remove(id);
            self.events.remove_session(*id);
        }
        if !stale.is_empty() {
            debug!(count = stale.len(), "swept expired upload sessions");
        }
        stale.len()
    }

    /// Validate the transfer and hand back what the chunk loop needs.
    /// A `Pending` session starts implicitly on its first chunk.
    async fn prepare_transfer(
        &self,
        id: Uuid,
        chunk_index: u32,
        data_len: u64,
    ) -> CoreResult<(Arc<dyn StorageAdapter>, String, u32)> {
        let mut sessions = self.sessions.write().await;
        let session = get_mut(&mut sessions, id)?;
        ensure_chunk_accepted(session, chunk_index)?;

        let expected = session.chunk_len(chunk_index);
        if data_len != expected {
            return Err(CoreError::Validation(format!(
                "chunk {chunk_index} is {data_len} bytes, expected {expected}"
            )));
        }

        let adapter = self.allocator.adapter_for(&session.allocation.provider)?;
        Ok((adapter, session.file_key.clone(), session.total_chunks))
    }

    /// Record a confirmed chunk: advance the cursor, recompute speed/ETA,
    /// and complete the multipart upload when this was the last chunk.
    async fn apply_chunk_success(
        &self,
        id: Uuid,
        chunk_index: u32,
        bytes: u64,
        receipt: ChunkReceipt,
    ) -> CoreResult<ProgressSnapshot> {
        let etag = receipt.etag.clone();
        let (snapshot, completion) = {
            let mut sessions = self.sessions.write().await;
            let session = get_mut(&mut sessions, id)?;
            discard_if_not_uploading(session)?;
            if chunk_index != session.current_chunk {
                return Err(CoreError::Validation(format!(
                    "chunk {chunk_index} out of order, expected {}",
                    session.current_chunk
                )));
            }

            let now = Utc::now();
            session.parts.push(receipt);
            session.bytes_uploaded += bytes;
            session.current_chunk = chunk_index + 1;
            session.retry_count = 0;

            // Speed is the latest chunk's delta over the elapsed interval,
            // not a cumulative average. Bursty on purpose; consumers may
            // depend on the instantaneous semantic.
            let elapsed_ms = (now - session.last_update).num_milliseconds();
            if elapsed_ms > 0 {
                let speed = bytes as f64 / (elapsed_ms as f64 / 1000.0);
                session.upload_speed = Some(speed);
                let remaining = session.file_size - session.bytes_uploaded;
                session.estimated_time_remaining = if speed > 0.0 && remaining > 0 {
                    Some(remaining as f64 / speed)
                } else {
                    None
                };
            }
            session.last_update = now;

            let completion = if session.current_chunk == session.total_chunks {
                Some((
                    session.allocation.provider.clone(),
                    session.file_key.clone(),
                    session.parts.clone(),
                ))
            } else {
                None
            };
            (session.snapshot(), completion)
        };

        self.events.emit(
            Some(id),
            Event::ChunkUploaded {
                upload_id: id,
                chunk_index,
                etag,
            },
        );
        self.events.emit(Some(id), Event::Progress(snapshot.clone()));

        match completion {
            None => Ok(snapshot),
            Some((provider, key, parts)) => self.complete(id, &provider, &key, &parts).await,
        }
    }

    /// Assemble the multipart upload and finish the session.
    async fn complete(
        &self,
        id: Uuid,
        provider: &str,
        key: &str,
        parts: &[ChunkReceipt],
    ) -> CoreResult<ProgressSnapshot> {
        let adapter = self.allocator.adapter_for(provider)?;
        let outcome = adapter
            .complete_multipart_upload(key, &id.to_string(), parts, &TransferOptions::default())
            .await;

        match outcome {
            Ok(result) => {
                let snapshot = {
                    let mut sessions = self.sessions.write().await;
                    let session = get_mut(&mut sessions, id)?;
                    // A cancel may have landed while the adapter assembled
                    // the parts; the completion result is then discarded.
                    discard_if_not_uploading(session)?;
                    session.status = SessionStatus::Completed;
                    session.last_update = Utc::now();
                    session.snapshot()
                };
                info!(upload_id = %id, key = %key, etag = %result.etag, "upload completed");
                self.events.emit(Some(id), Event::Completed(snapshot.clone()));
                Ok(snapshot)
            }
            Err(err) => {
                warn!(upload_id = %id, key = %key, "multipart completion failed: {err}");
                self.fail(id, format!("multipart completion failed: {err}"))
                    .await;
                Err(err)
            }
        }
    }

    /// Count a chunk failure and decide between a scheduled retry and
    /// terminal failure.
    async fn apply_chunk_failure(
        &self,
        id: Uuid,
        chunk_index: u32,
        error: &str,
    ) -> CoreResult<RetryDecision> {
        let decision = {
            let mut sessions = self.sessions.write().await;
            let session = get_mut(&mut sessions, id)?;
            if session.status == SessionStatus::Pending {
                transition(session, SessionStatus::Uploading)?;
            }
            discard_if_not_uploading(session)?;

            session.retry_count += 1;
            if session.retry_count <= session.max_retries {
                let delay_ms = backoff_ms(self.cfg.base_delay_ms, session.retry_count);
                warn!(
                    upload_id = %id,
                    chunk_index,
                    attempt = session.retry_count,
                    delay_ms,
                    "chunk failed, retrying: {error}"
                );
                Ok((session.retry_count, delay_ms))
            } else {
                session.status = SessionStatus::Failed;
                session.error = Some(error.to_string());
                session.last_update = Utc::now();
                Err((session.retry_count, error.to_string()))
            }
        };

        match decision {
            Ok((attempt, delay_ms)) => {
                self.events.emit(
                    Some(id),
                    Event::Retry {
                        upload_id: id,
                        chunk_index,
                        attempt,
                        delay_ms,
                    },
                );
                Ok(RetryDecision::After(Duration::from_millis(delay_ms)))
            }
            Err((attempts, last_error)) => {
                warn!(upload_id = %id, chunk_index, attempts, "chunk retries exhausted");
                self.events.emit(
                    Some(id),
                    Event::Failed {
                        upload_id: id,
                        error: last_error.clone(),
                    },
                );
                Ok(RetryDecision::Exhausted(CoreError::RetriesExhausted {
                    attempts,
                    last_error,
                }))
            }
        }
    }

    /// Terminal failure with a recorded reason, from any non-terminal state.
    async fn fail(&self, id: Uuid, error: String) {
        let emitted = {
            let mut sessions = self.sessions.write().await;
            match sessions.get_mut(&id) {
                Some(session) if !session.status.is_terminal() => {
                    session.status = SessionStatus::Failed;
                    session.error = Some(error.clone());
                    session.last_update = Utc::now();
                    true
                }
                _ => false,
            }
        };
        if emitted {
            self.events.emit(
                Some(id),
                Event::Failed {
                    upload_id: id,
                    error,
                },
            );
        }
    }

    /// Re-check after a backoff sleep; cancel/pause during the wait stops
    /// the retry loop.
    async fn ensure_uploading(&self, id: Uuid) -> CoreResult<()> {
        let sessions = self.sessions.read().await;
        let session = sessions
            .get(&id)
            .ok_or_else(|| CoreError::not_found("upload session", id))?;
        match session.status {
            SessionStatus::Uploading => Ok(()),
            SessionStatus::Cancelled => {
                Err(CoreError::Cancelled("session cancelled during backoff".into()))
            }
            other => Err(CoreError::InvalidState {
                from: format!("{other:?}"),
                to: "Uploading".into(),
            }),
        }
    }
}

/// `base × 2^(attempt-1)`, capped.
fn backoff_ms(base_delay_ms: u64, attempt: u32) -> u64 {
    base_delay_ms
        .saturating_mul(1u64 << (attempt.saturating_sub(1)).min(16))
        .min(MAX_BACKOFF_MS)
}

fn chunk_urls(base_url: &str, total_chunks: u32) -> Vec<String> {
    (0..total_chunks)
        .map(|index| format!("{base_url}&part={}", index + 1))
        .collect()
}

fn get_mut(
    sessions: &mut HashMap<Uuid, UploadSession>,
    id: Uuid,
) -> CoreResult<&mut UploadSession> {
    sessions
        .get_mut(&id)
        .ok_or_else(|| CoreError::not_found("upload session", id))
}

/// Results arriving for a session that is no longer uploading are discarded.
fn discard_if_not_uploading(session: &mut UploadSession) -> CoreResult<()> {
    match session.status {
        SessionStatus::Uploading => Ok(()),
        SessionStatus::Cancelled => Err(CoreError::Cancelled(
            "result discarded: session was cancelled".into(),
        )),
        other => Err(CoreError::InvalidState {
            from: format!("{other:?}"),
            to: "Uploading".into(),
        }),
    }
}

/// Chunk admission: implicit start from `Pending`, strict ordering, and a
/// rejection for every terminal or paused state.
fn ensure_chunk_accepted(session: &mut UploadSession, chunk_index: u32) -> CoreResult<()> {
    match session.status {
        SessionStatus::Pending => {
            transition(session, SessionStatus::Uploading)?;
        }
        SessionStatus::Uploading => {}
        SessionStatus::Cancelled => {
            return Err(CoreError::Cancelled(
                "chunk rejected: session was cancelled".into(),
            ));
        }
        other => {
            return Err(CoreError::InvalidState {
                from: format!("{other:?}"),
                to: "Uploading".into(),
            });
        }
    }
    if chunk_index != session.current_chunk {
        return Err(CoreError::Validation(format!(
            "chunk {chunk_index} out of order, expected {}",
            session.current_chunk
        )));
    }
    if chunk_index >= session.total_chunks {
        return Err(CoreError::Validation(format!(
            "chunk {chunk_index} out of range (total {})",
            session.total_chunks
        )));
    }
    Ok(())
}

fn transition(session: &mut UploadSession, next: SessionStatus) -> CoreResult<()> {
    if !session.status.can_transition_to(next) {
        return Err(CoreError::InvalidState {
            from: format!("{:?}", session.status),
            to: format!("{next:?}"),
        });
    }
    debug!(upload_id = %session.id, from = ?session.status, to = ?next, "session transition");
    session.status = next;
    session.last_update = Utc::now();
    Ok(())
}
