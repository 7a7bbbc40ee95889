//! HTTP handlers for the chunked-upload surface.
//!
//! Chunk bytes can flow through `PUT .../chunks/{n}` (the server pushes them
//! to the provider) or the client can upload against the presigned chunk
//! URLs and report outcomes via `POST .../report`.

use crate::{
    errors::AppError,
    handlers::AppState,
    models::{allocation::AllocationContext, session::ChunkOutcome},
};
use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use uuid::Uuid;

/// Body for `POST /uploads` (init).
#[derive(Debug, Deserialize)]
pub struct InitUploadReq {
    pub file_name: String,
    pub file_size: u64,
    pub chunk_size: Option<u64>,
    pub organization_id: String,
    pub project_id: String,
    pub user_id: Option<String>,
    pub user_tier: Option<String>,
}

/// Body for `POST /uploads/{id}/report`.
#[derive(Debug, Deserialize)]
pub struct ReportChunkReq {
    pub chunk_index: u32,
    #[serde(flatten)]
    pub outcome: ChunkOutcome,
}

/// `POST /uploads` — allocate storage and open a session.
pub async fn init_upload(
    State(state): State<AppState>,
    Json(req): Json<InitUploadReq>,
) -> Result<impl IntoResponse, AppError> {
    let ctx = AllocationContext {
        organization_id: req.organization_id,
        project_id: req.project_id,
        user_id: req.user_id,
        user_tier: req.user_tier,
    };
    let initialized = state
        .uploads
        .create_session(&req.file_name, req.file_size, req.chunk_size, &ctx)
        .await?;
    Ok((StatusCode::CREATED, Json(initialized)))
}

/// `POST /uploads/{id}/start` — move a pending session into uploading.
pub async fn start_upload(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.uploads.start(id).await?))
}

/// `PUT /uploads/{id}/chunks/{n}` — server-driven chunk transfer.
pub async fn put_chunk(
    State(state): State<AppState>,
    Path((id, chunk_index)): Path<(Uuid, u32)>,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.uploads.upload_chunk(id, chunk_index, body).await?))
}

/// `POST /uploads/{id}/report` — client-driven chunk outcome.
pub async fn report_chunk(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ReportChunkReq>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(
        state
            .uploads
            .report_chunk_result(id, req.chunk_index, req.outcome)
            .await?,
    ))
}

/// `POST /uploads/{id}/pause`
pub async fn pause_upload(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.uploads.pause(id).await?))
}

/// `POST /uploads/{id}/resume` — returns missing chunks plus fresh URLs.
pub async fn resume_upload(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.uploads.resume(id).await?))
}

/// `GET /uploads/{id}` — progress snapshot.
pub async fn get_upload(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.uploads.get(id).await?))
}

/// `DELETE /uploads/{id}` — immediate cancellation.
pub async fn cancel_upload(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.uploads.cancel(id).await?))
}
