//! Route table for the media data plane.
//!
//! ## Structure
//! - **Upload sessions**
//!   - `POST   /uploads` — init (allocate + open session)
//!   - `POST   /uploads/{id}/start` — begin uploading
//!   - `PUT    /uploads/{id}/chunks/{n}` — server-driven chunk transfer
//!   - `POST   /uploads/{id}/report` — client-driven chunk outcome
//!   - `POST   /uploads/{id}/pause` / `POST /uploads/{id}/resume`
//!   - `GET    /uploads/{id}` — progress snapshot
//!   - `DELETE /uploads/{id}` — cancel
//!
//! - **Transforms**
//!   - `POST   /transforms` — submit; `GET /transforms/{id}`;
//!     `DELETE /transforms/{id}` — cancel a pending job
//!
//! - **Admin**
//!   - `GET /admin/providers`, `POST /admin/strategies`,
//!     `PUT /admin/providers/{name}/default`,
//!     `PUT /admin/providers/{name}/enabled`

use crate::handlers::{
    AppState,
    admin_handlers::{add_strategy, list_providers, set_default_provider, set_provider_enabled},
    health_handlers::{healthz, readyz},
    transform_handlers::{cancel_transform, get_transform, submit_transform},
    upload_handlers::{
        cancel_upload, get_upload, init_upload, pause_upload, put_chunk, report_chunk,
        resume_upload, start_upload,
    },
};
use axum::{
    Router,
    routing::{get, post, put},
};

/// Build and return the router for the whole data-plane surface.
///
/// The router carries shared state (`AppState`) to all handlers.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // upload sessions
        .route("/uploads", post(init_upload))
        .route("/uploads/{id}", get(get_upload).delete(cancel_upload))
        .route("/uploads/{id}/start", post(start_upload))
        .route("/uploads/{id}/chunks/{n}", put(put_chunk))
        .route("/uploads/{id}/report", post(report_chunk))
        .route("/uploads/{id}/pause", post(pause_upload))
        .route("/uploads/{id}/resume", post(resume_upload))
        // transforms
        .route("/transforms", post(submit_transform))
        .route(
            "/transforms/{id}",
            get(get_transform).delete(cancel_transform),
        )
        // admin
        .route("/admin/providers", get(list_providers))
        .route("/admin/strategies", post(add_strategy))
        .route("/admin/providers/{name}/default", put(set_default_provider))
        .route("/admin/providers/{name}/enabled", put(set_provider_enabled))
}
