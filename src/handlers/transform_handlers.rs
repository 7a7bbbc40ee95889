//! HTTP handlers for transform job submission and status.

use crate::{errors::AppError, handlers::AppState, models::transform::TransformOp};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use uuid::Uuid;

/// Body for `POST /transforms`.
#[derive(Debug, Deserialize)]
pub struct SubmitTransformReq {
    pub source_key: String,
    pub project_id: String,
    pub operations: Vec<TransformOp>,
}

/// `POST /transforms` — submit a derived-asset request. Cache hits come
/// back already completed.
pub async fn submit_transform(
    State(state): State<AppState>,
    Json(req): Json<SubmitTransformReq>,
) -> Result<impl IntoResponse, AppError> {
    let job = state
        .transforms
        .submit(&req.source_key, &req.project_id, req.operations)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

/// `GET /transforms/{id}` — job status, progress, and result.
pub async fn get_transform(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.transforms.get_status(id).await?))
}

/// `DELETE /transforms/{id}` — cancel a job that has not started running.
pub async fn cancel_transform(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.transforms.cancel(id).await?))
}
