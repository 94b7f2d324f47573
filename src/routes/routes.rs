//! Defines the HTTP surface of the relay.
//!
//! ## Structure
//! - `GET  /healthz`: liveness
//! - `GET  /readyz`: readiness (cache + B2 authorization)
//! - `GET  /api`: `checkFile`, `checkServer`
//! - `POST /api`: `authFile`, `finishFile`, `uploadSmallFile`
//!
//! `/api.php` is served as an alias so existing browser uploaders that post
//! to that path keep working.

use crate::{
    handlers::{
        api_handlers::{api_get, api_post},
        health_handlers::{healthz, readyz},
    },
    state::AppState,
};
use axum::{Router, routing::get};

/// Build the router. Handlers share [`AppState`].
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // upload protocol
        .route("/api", get(api_get).post(api_post))
        .route("/api.php", get(api_get).post(api_post))
}
