//! Admin surface: provider listing and strategy management.
//!
//! Providers carry live adapter handles, so registration itself happens at
//! bootstrap; the HTTP surface toggles and reprioritizes what is already
//! wired in.

use crate::{errors::AppError, handlers::AppState, models::allocation::StorageStrategy};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct SetEnabledReq {
    pub enabled: bool,
}

/// `GET /admin/providers` — registered providers with profiles.
pub async fn list_providers(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.allocator.providers())
}

/// `POST /admin/strategies` — append a routing strategy.
pub async fn add_strategy(
    State(state): State<AppState>,
    Json(strategy): Json<StorageStrategy>,
) -> Result<impl IntoResponse, AppError> {
    if strategy.name.trim().is_empty() {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "strategy name must not be empty",
        ));
    }
    state.allocator.add_strategy(strategy);
    Ok(StatusCode::CREATED)
}

/// `PUT /admin/providers/{name}/default`
pub async fn set_default_provider(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    state.allocator.set_default_provider(&name)?;
    Ok(StatusCode::NO_CONTENT)
}

/// `PUT /admin/providers/{name}/enabled`
pub async fn set_provider_enabled(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<SetEnabledReq>,
) -> Result<impl IntoResponse, AppError> {
    state.allocator.set_provider_enabled(&name, req.enabled)?;
    Ok(StatusCode::NO_CONTENT)
}
