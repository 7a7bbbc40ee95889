//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that probes every enabled storage provider

use crate::handlers::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;

/// `GET /healthz`
///
/// Very small liveness probe — always returns 200 OK with a plain JSON body.
/// This endpoint should be cheap and never perform I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Runs `health_check` on every enabled provider's adapter. Returns JSON
/// describing each check; HTTP 200 when all pass, 503 otherwise.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = HashMap::new();
    let mut overall_ok = true;

    for provider in state.allocator.providers() {
        if !provider.enabled {
            continue;
        }
        let check = match state.allocator.adapter_for(&provider.name) {
            Ok(adapter) => match adapter.health_check().await {
                Ok(()) => CheckStatus {
                    ok: true,
                    error: None,
                },
                Err(err) => CheckStatus {
                    ok: false,
                    error: Some(err.to_string()),
                },
            },
            Err(err) => CheckStatus {
                ok: false,
                error: Some(err.to_string()),
            },
        };
        overall_ok &= check.ok;
        checks.insert(provider.name, check);
    }

    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        checks,
    };
    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<String, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}
