//! src/services/relay.rs
//!
//! ChunkRelay: forwards a small-file body to B2's single-file upload
//! endpoint. The destination name is taken from the redeemed token; nothing
//! in the incoming request can change where the bytes land.

use crate::{
    models::file::{AUTO_CONTENT_TYPE, SRC_LAST_MODIFIED_MILLIS},
    services::{
        b2_client::{B2Client, B2Error},
        cache::CacheError,
    },
};
use axum::http::HeaderMap;
use bytes::Bytes;
use futures::Stream;
use reqwest::{
    Body, Client,
    header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE},
};
use std::{io, time::Duration};
use thiserror::Error;
use tracing::{info, warn};

/// Headers a client may use to declare the SHA-1 of the body.
pub const CONTENT_SHA1_HEADERS: [&str; 2] = ["x-content-sha1", "x-bz-content-sha1"];

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("missing or invalid `{0}` header")]
    MissingHeader(&'static str),
    #[error("declared length {declared} exceeds the small-file limit of {limit} bytes")]
    PayloadTooLarge { declared: u64, limit: u64 },
    #[error("upload token is missing, expired or already used")]
    InvalidToken,
    #[error("could not obtain an upload URL: {0}")]
    UploadUrl(B2Error),
    #[error("relay to B2 failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// The parts of a relay request the server acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayHeaders {
    pub token: String,
    pub content_length: u64,
    pub content_sha1: String,
}

impl RelayHeaders {
    /// Extract length, digest and token. Length and digest are checked first
    /// so a malformed request never gets as far as the token.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, RelayError> {
        let content_length = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or(RelayError::MissingHeader("Content-Length"))?;

        let content_sha1 = CONTENT_SHA1_HEADERS
            .iter()
            .find_map(|name| headers.get(*name))
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or(RelayError::MissingHeader("X-Bz-Content-Sha1"))?
            .to_string();

        let token = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().trim_start_matches("Bearer ").trim())
            .filter(|v| !v.is_empty())
            .ok_or(RelayError::InvalidToken)?
            .to_string();

        Ok(Self {
            token,
            content_length,
            content_sha1,
        })
    }
}

/// What B2 answered, passed through to the client unchanged.
#[derive(Debug, Clone)]
pub struct RelayResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

#[derive(Clone)]
pub struct ChunkRelay {
    b2: B2Client,
    http: Client,
    /// Largest body accepted, in bytes.
    max_size: u64,
}

impl ChunkRelay {
    /// `connect_timeout` bounds connection setup and `read_timeout` each
    /// idle wait on the upstream, so a stalled B2 host fails the relay
    /// instead of holding it open. The transfer as a whole is unbounded.
    pub fn new(
        b2: B2Client,
        max_size: u64,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self, RelayError> {
        let http = Client::builder()
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .build()?;
        Ok(Self { b2, http, max_size })
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Redeem the token in `headers` and stream `body` to B2.
    ///
    /// The token is consumed before the upload starts, so a failed relay
    /// needs a new `authFile`.
    pub async fn relay<S>(&self, headers: RelayHeaders, body: S) -> Result<RelayResponse, RelayError>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        if headers.content_length > self.max_size {
            return Err(RelayError::PayloadTooLarge {
                declared: headers.content_length,
                limit: self.max_size,
            });
        }

        let token = self
            .b2
            .cache()
            .take_small_file_token(&headers.token)
            .await?
            .ok_or(RelayError::InvalidToken)?;

        if token.file_size != headers.content_length {
            warn!(
                file_name = %token.file_name,
                authorized = token.file_size,
                declared = headers.content_length,
                "small-file length differs from authorized size"
            );
        }

        let target = self
            .b2
            .get_upload_url(token.bucket_id.as_deref())
            .await
            .map_err(RelayError::UploadUrl)?;

        info!(
            file_name = %token.file_name,
            size = headers.content_length,
            "relaying small file to B2"
        );

        let response = self
            .http
            .post(&target.upload_url)
            .header(AUTHORIZATION, &target.authorization_token)
            .header(CONTENT_LENGTH, headers.content_length)
            .header(CONTENT_TYPE, AUTO_CONTENT_TYPE)
            .header("X-Bz-File-Name", urlencoding::encode(&token.file_name).as_ref())
            .header("X-Bz-Content-Sha1", &headers.content_sha1)
            .header(
                format!("X-Bz-Info-{}", SRC_LAST_MODIFIED_MILLIS),
                &token.last_modified,
            )
            .body(Body::wrap_stream(body))
            .send()
            .await?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?;

        if status >= 400 {
            warn!(file_name = %token.file_name, status, "B2 rejected small-file upload");
        }

        Ok(RelayResponse {
            status,
            content_type,
            body,
        })
    }
}
