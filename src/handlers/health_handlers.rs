//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks the token cache and B2 authorization

use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::{collections::HashMap, time::Duration};
use tracing::warn;
use uuid::Uuid;

/// `GET /healthz`
///
/// Liveness probe. Always 200, never performs I/O.
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
/// Readiness probe that:
/// 1. Writes, reads back and removes a throwaway cache entry.
/// 2. Obtains a B2 account authorization (cached when available).
///
/// HTTP 200 when both pass, HTTP 503 otherwise.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    // 1) Cache round trip
    let store = state.cache().store();
    let key = format!("readyz:{}", Uuid::new_v4());
    let cache_check = match store.set(&key, "readyz".into(), Duration::from_secs(10)).await {
        Ok(()) => match store.take(&key).await {
            Ok(Some(value)) if value == "readyz" => (true, None::<String>),
            Ok(_) => (false, Some("value did not round trip".to_string())),
            Err(e) => {
                warn!("readyz: cache read failed: {}", e);
                (false, Some("could not read back".to_string()))
            }
        },
        Err(e) => {
            warn!("readyz: cache write failed: {}", e);
            (false, Some("could not write".to_string()))
        }
    };

    // 2) B2 authorization
    let b2_check = match state.coordinator.b2().authorize_account(false).await {
        Ok(_) => (true, None::<String>),
        Err(e) => {
            warn!("readyz: B2 authorization failed: {}", e);
            (false, Some("authorization unavailable".to_string()))
        }
    };

    let overall_ok = cache_check.0 && b2_check.0;

    let mut checks = HashMap::new();
    checks.insert(
        "cache",
        CheckStatus {
            ok: cache_check.0,
            error: cache_check.1,
        },
    );
    checks.insert(
        "b2",
        CheckStatus {
            ok: b2_check.0,
            error: b2_check.1,
        },
    );

    let body = ReadyResponse {
        status: if overall_ok { "ok" } else { "error" }.into(),
        backend: state.cache().backend(),
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
    backend: &'static str,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}
