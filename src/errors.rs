use crate::services::{
    b2_client::B2Error,
    coordinator::UploadError,
    relay::RelayError,
};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use tracing::{error, warn};

/// A lightweight wrapper for general errors that keeps the message local.
///
/// Serialized as `{"error": message, "status": code}` plus a machine
/// readable `code` when one is known.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    pub code: Option<String>,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg).with_code("bad_request")
    }

    /// Map a provider-side failure. Provider envelopes keep their own status
    /// and code; everything else becomes `fallback`.
    fn from_b2(err: B2Error, fallback: StatusCode) -> Self {
        match err {
            B2Error::Provider(envelope) => {
                warn!("B2 request failed: {}", envelope);
                let status = StatusCode::from_u16(envelope.status)
                    .ok()
                    .filter(|s| s.is_client_error() || s.is_server_error())
                    .unwrap_or(fallback);
                Self::new(status, envelope.message).with_code(envelope.code)
            }
            B2Error::SizeMismatch { expected, actual } => {
                Self::from(UploadError::SizeMismatch { expected, actual })
            }
            B2Error::NoBucket => {
                error!("no bucket configured and the B2 key is not restricted to one");
                Self::internal("storage bucket is not configured")
            }
            other => {
                error!("B2 unavailable: {}", other);
                Self::new(fallback, "storage provider unavailable").with_code("provider_unavailable")
            }
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "error": self.message,
            "status": self.status.as_u16()
        });
        if let Some(code) = self.code {
            body["code"] = json!(code);
        }

        (self.status, Json(body)).into_response()
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::DuplicateFile { file_name, file_id } => {
                warn!(file_name = %file_name, file_id = %file_id, "rejecting duplicate upload");
                AppError::new(StatusCode::CONFLICT, "file already exists").with_code("duplicate_file")
            }
            UploadError::LookupFailed(err) => AppError::from_b2(err, StatusCode::BAD_GATEWAY),
            UploadError::ProviderRejected(err) => match err {
                B2Error::Provider(envelope) => {
                    warn!("B2 refused upload credentials: {}", envelope);
                    AppError::new(StatusCode::BAD_GATEWAY, envelope.message).with_code(envelope.code)
                }
                other => AppError::from_b2(other, StatusCode::BAD_GATEWAY),
            },
            UploadError::ProtocolViolation(msg) => AppError::bad_request(msg),
            UploadError::NameRejected => {
                AppError::new(StatusCode::FORBIDDEN, "file name not allowed").with_code("forbidden")
            }
            UploadError::SizeMismatch { expected, actual } => AppError::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                format!(
                    "uploaded parts add up to {} bytes but fileSize is {}",
                    actual, expected
                ),
            )
            .with_code("size_mismatch"),
            UploadError::Finish(err) => AppError::from_b2(err, StatusCode::BAD_GATEWAY),
            UploadError::Cache(err) => {
                error!("token cache failure: {}", err);
                AppError::internal("internal error")
            }
        }
    }
}

impl From<RelayError> for AppError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::MissingHeader(_) => AppError::bad_request(err.to_string()),
            RelayError::PayloadTooLarge { .. } => {
                AppError::new(StatusCode::PAYLOAD_TOO_LARGE, err.to_string()).with_code("too_large")
            }
            RelayError::InvalidToken => {
                AppError::new(StatusCode::UNAUTHORIZED, err.to_string()).with_code("unauthorized")
            }
            RelayError::UploadUrl(err) => AppError::from_b2(err, StatusCode::BAD_GATEWAY),
            RelayError::Transport(err) => {
                error!("small-file relay failed: {}", err);
                AppError::new(StatusCode::BAD_GATEWAY, "relay to storage failed")
                    .with_code("provider_unavailable")
            }
            RelayError::Cache(err) => {
                error!("token cache failure: {}", err);
                AppError::internal("internal error")
            }
        }
    }
}
