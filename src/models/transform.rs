//! Transform jobs: derived-asset requests, their operations, and results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Lifecycle state of a transform job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Kind of derivation applied to the source bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Resize,
    Convert,
    Thumbnail,
    Compress,
    Watermark,
}

impl OpKind {
    /// Short label used in derived keys and log lines.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Resize => "resize",
            Self::Convert => "convert",
            Self::Thumbnail => "thumbnail",
            Self::Compress => "compress",
            Self::Watermark => "watermark",
        }
    }
}

/// One step of a transform chain. Options use a `BTreeMap` so serialization
/// is canonical, which keeps cache fingerprints deterministic.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransformOp {
    pub kind: OpKind,
    #[serde(default)]
    pub options: BTreeMap<String, serde_json::Value>,
}

/// Reference to a persisted derived artifact.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransformResult {
    /// Storage key of the artifact.
    pub key: String,
    /// Provider the artifact was written to.
    pub provider: String,
    /// Artifact size in bytes.
    pub size: u64,
}

/// An asynchronous request to derive a new artifact from a stored file.
#[derive(Clone, Debug, Serialize)]
pub struct TransformJob {
    pub id: Uuid,
    pub source_key: String,
    pub project_id: String,
    pub operations: Vec<TransformOp>,
    pub status: JobStatus,
    /// 0–100, advanced after each completed operation.
    pub progress: u8,
    /// Execution attempts so far (cache hits never attempt).
    pub attempts: u32,
    /// Deterministic hash of source + canonicalized operations.
    pub fingerprint: String,
    pub result: Option<TransformResult>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl TransformJob {
    pub fn new(
        source_key: String,
        project_id: String,
        operations: Vec<TransformOp>,
        fingerprint: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_key,
            project_id,
            operations,
            status: JobStatus::Pending,
            progress: 0,
            attempts: 0,
            fingerprint,
            result: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
        }
    }
}

/// Compute the cache fingerprint for a transform request.
///
/// The operations list serializes with ordered option maps, so two requests
/// differing only in option key order share a fingerprint. Operation order
/// is significant and preserved.
pub fn fingerprint(source_key: &str, operations: &[TransformOp]) -> String {
    let canonical = serde_json::to_string(operations).unwrap_or_default();
    format!("{:x}", md5::compute(format!("{source_key}\n{canonical}")))
}
