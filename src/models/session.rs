//! Upload session state and progress snapshots.

use crate::{adapters::ChunkReceipt, models::allocation::StorageAllocation};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of an upload session.
///
/// Transitions are one-directional (`Pending -> Uploading -> terminal`)
/// except for the `Uploading <-> Paused` pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Uploading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    /// Check if the session reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (*self, next) {
            (Pending, Uploading) => true,
            (Pending, Cancelled) | (Pending, Failed) => true,
            (Uploading, Paused) | (Paused, Uploading) => true,
            (Uploading, Completed) | (Uploading, Failed) | (Uploading, Cancelled) => true,
            (Paused, Cancelled) | (Paused, Failed) => true,
            _ => false,
        }
    }
}

/// The stateful tracker for one in-progress chunked upload.
///
/// Mutated only by the owning `UploadManager`. Chunks advance strictly
/// sequentially; `bytes_uploaded` never decreases before a terminal state.
#[derive(Clone, Debug, Serialize)]
pub struct UploadSession {
    /// Unique session identifier, returned to the client as the upload id.
    pub id: Uuid,

    /// Generated storage key the upload is written under.
    pub file_key: String,

    /// Original filename of the uploaded file.
    pub file_name: String,

    /// Total file size in bytes.
    pub file_size: u64,

    /// Size of each chunk in bytes (the last chunk may be shorter).
    pub chunk_size: u64,

    /// `ceil(file_size / chunk_size)`.
    pub total_chunks: u32,

    /// Index of the next chunk expected (0-based).
    pub current_chunk: u32,

    /// Bytes confirmed uploaded so far.
    pub bytes_uploaded: u64,

    /// Current lifecycle state.
    pub status: SessionStatus,

    /// Instantaneous upload speed in bytes/sec, from the latest chunk only.
    pub upload_speed: Option<f64>,

    /// Estimated seconds remaining, derived from `upload_speed`.
    pub estimated_time_remaining: Option<f64>,

    /// Failed attempts for the chunk currently in flight.
    pub retry_count: u32,

    /// Maximum retries per chunk before the session fails.
    pub max_retries: u32,

    /// When the session was created.
    pub started_at: DateTime<Utc>,

    /// When progress was last applied (feeds the speed computation).
    pub last_update: DateTime<Utc>,

    /// Human-readable reason for a terminal failure or cancellation.
    pub error: Option<String>,

    /// The provider/key/URL decision this session uploads against.
    pub allocation: StorageAllocation,

    /// Part receipts collected for multipart completion.
    #[serde(skip)]
    pub parts: Vec<ChunkReceipt>,
}

impl UploadSession {
    /// Percentage of bytes uploaded, rounded to the nearest integer.
    pub fn percentage(&self) -> u32 {
        if self.file_size == 0 {
            return 100;
        }
        ((self.bytes_uploaded as f64 / self.file_size as f64) * 100.0).round() as u32
    }

    /// Size in bytes of the chunk at `index`.
    pub fn chunk_len(&self, index: u32) -> u64 {
        let start = index as u64 * self.chunk_size;
        self.chunk_size.min(self.file_size.saturating_sub(start))
    }

    /// Chunk indices not yet confirmed, for resume responses.
    pub fn missing_chunks(&self) -> Vec<u32> {
        (self.current_chunk..self.total_chunks).collect()
    }

    /// Read-only view suitable for API responses and progress events.
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            upload_id: self.id,
            file_key: self.file_key.clone(),
            status: self.status,
            current_chunk: self.current_chunk,
            total_chunks: self.total_chunks,
            bytes_uploaded: self.bytes_uploaded,
            file_size: self.file_size,
            percentage: self.percentage(),
            upload_speed: self.upload_speed,
            estimated_time_remaining: self.estimated_time_remaining,
            retry_count: self.retry_count,
            error: self.error.clone(),
        }
    }
}

/// Point-in-time view of a session's progress.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub upload_id: Uuid,
    pub file_key: String,
    pub status: SessionStatus,
    pub current_chunk: u32,
    pub total_chunks: u32,
    pub bytes_uploaded: u64,
    pub file_size: u64,
    pub percentage: u32,
    pub upload_speed: Option<f64>,
    pub estimated_time_remaining: Option<f64>,
    pub retry_count: u32,
    pub error: Option<String>,
}

/// Client-reported outcome of one chunk transfer.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum ChunkOutcome {
    /// The chunk landed on the provider.
    Success { etag: String },
    /// The transfer failed; the manager decides whether to retry.
    Failure { error: String },
}
