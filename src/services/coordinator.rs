//! src/services/coordinator.rs
//!
//! UploadCoordinator: decides how each upload proceeds and hands out the
//! matching credentials.
//!
//! For a requested `(file_name, size)` pair the provider's listing decides
//! between four outcomes, checked in priority order:
//!
//! 1. a completed version with the same name and size exists: conflict
//! 2. an unfinished large file with the same name and original size exists: resume it
//! 3. the size is above the large-file threshold: start a new large file
//! 4. otherwise: issue a single-use small-file token for the relay

use crate::{
    models::{
        file::{FileVersion, SRC_LAST_MODIFIED_MILLIS, SRC_SIZE},
        session::UploadSession,
        small_file::SmallFileToken,
    },
    services::{
        b2_client::{B2Client, B2Error, B2Result},
        cache::CacheError,
    },
};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info};

/// Fields of a `b2_finish_large_file` response passed back to clients.
pub const FINISH_RESPONSE_FIELDS: [&str; 10] = [
    "action",
    "contentLength",
    "contentType",
    "fileId",
    "fileInfo",
    "fileName",
    "uploadTimestamp",
    "status",
    "code",
    "message",
];

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("`{file_name}` already exists with the same size")]
    DuplicateFile { file_name: String, file_id: String },
    #[error("looking up existing uploads failed: {0}")]
    LookupFailed(B2Error),
    #[error("B2 did not issue upload credentials: {0}")]
    ProviderRejected(B2Error),
    #[error("{0}")]
    ProtocolViolation(String),
    #[error("file name rejected by policy")]
    NameRejected,
    #[error("uploaded parts add up to {actual} bytes but {expected} were declared")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("finishing the large file failed: {0}")]
    Finish(B2Error),
    #[error("could not store the upload token: {0}")]
    Cache(#[from] CacheError),
}

/// How a requested upload proceeds.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Conflict { file_id: String },
    Resume(UploadSession),
    NewLarge(UploadSession),
    NewSmall(SmallFileToken),
}

impl Disposition {
    pub fn name(&self) -> &'static str {
        match self {
            Disposition::Conflict { .. } => "conflict",
            Disposition::Resume(_) => "resume",
            Disposition::NewLarge(_) => "new-large",
            Disposition::NewSmall(_) => "new-small",
        }
    }
}

/// Result of matching a listing against a requested name and size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VersionMatch<'a> {
    Completed(&'a FileVersion),
    InProgress(&'a FileVersion),
    NoMatch,
}

/// Find the version a new upload of `(file_name, size)` collides with.
///
/// The listing is prefix-based, so names are compared exactly. A completed
/// file wins over an unfinished one wherever they appear in the listing.
pub fn match_file_version<'a>(
    versions: &'a [FileVersion],
    file_name: &str,
    size: u64,
) -> VersionMatch<'a> {
    let same_name = || versions.iter().filter(move |v| v.file_name == file_name);

    if let Some(done) = same_name().find(|v| v.is_completed() && v.content_length == size) {
        return VersionMatch::Completed(done);
    }
    if let Some(started) =
        same_name().find(|v| v.is_unfinished_large_file() && v.src_size() == Some(size))
    {
        return VersionMatch::InProgress(started);
    }
    VersionMatch::NoMatch
}

/// Credentials handed to a client by `authFile`.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UploadGrant {
    pub file_id: String,
    pub upload_url: String,
    pub authorization_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket_id: Option<String>,
    pub disposition: &'static str,
    /// Parts B2 already holds for a resumed file.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub parts_uploaded: Vec<u32>,
}

/// Keep only the allow-listed fields of a finish response.
pub fn filter_finish_response(response: Value) -> Value {
    match response {
        Value::Object(mut fields) => {
            fields.retain(|key, _| FINISH_RESPONSE_FIELDS.contains(&key.as_str()));
            Value::Object(fields)
        }
        other => other,
    }
}

#[derive(Clone)]
pub struct UploadCoordinator {
    b2: B2Client,
    large_file_threshold: u64,
    /// Where clients send small files (the relay endpoint).
    small_file_url: String,
}

impl UploadCoordinator {
    pub fn new(b2: B2Client, large_file_threshold: u64, small_file_url: impl Into<String>) -> Self {
        Self {
            b2,
            large_file_threshold,
            small_file_url: small_file_url.into(),
        }
    }

    pub fn b2(&self) -> &B2Client {
        &self.b2
    }

    pub fn large_file_threshold(&self) -> u64 {
        self.large_file_threshold
    }

    /// Decide how an upload of `file_name` (already resolved by the naming
    /// policy) proceeds, creating whatever provider or cache state the
    /// chosen path needs.
    pub async fn resolve_disposition(
        &self,
        file_name: &str,
        file_size: u64,
        last_modified: &str,
    ) -> Result<Disposition, UploadError> {
        let versions = self
            .b2
            .list_file_versions(file_name)
            .await
            .map_err(UploadError::LookupFailed)?;

        match match_file_version(&versions, file_name, file_size) {
            VersionMatch::Completed(existing) => {
                info!(file_name, file_id = %existing.file_id, "upload conflicts with existing file");
                Ok(Disposition::Conflict {
                    file_id: existing.file_id.clone(),
                })
            }
            VersionMatch::InProgress(started) => {
                // The cache may be behind B2; resume from the provider's view.
                let parts = self
                    .b2
                    .list_parts(&started.file_id, false)
                    .await
                    .map_err(UploadError::LookupFailed)?;
                let session =
                    UploadSession::new(&started.file_id, file_name, file_size).with_parts(parts);
                self.b2.cache().put_upload_session(&session).await;
                info!(
                    file_name,
                    file_id = %session.file_id,
                    parts = session.parts_uploaded.len(),
                    uploaded_bytes = session.uploaded_bytes(),
                    "resuming large file"
                );
                Ok(Disposition::Resume(session))
            }
            VersionMatch::NoMatch if file_size > self.large_file_threshold => {
                let file_info = BTreeMap::from([
                    (SRC_LAST_MODIFIED_MILLIS.to_string(), last_modified.to_string()),
                    (SRC_SIZE.to_string(), file_size.to_string()),
                ]);
                let started = self
                    .b2
                    .start_large_file(file_name, &file_info)
                    .await
                    .map_err(UploadError::ProviderRejected)?;
                let session = UploadSession::new(started.file_id, file_name, file_size);
                self.b2.cache().put_upload_session(&session).await;
                Ok(Disposition::NewLarge(session))
            }
            VersionMatch::NoMatch => {
                let token = SmallFileToken::issue(file_name, file_size, last_modified, None);
                self.b2.cache().put_small_file_token(&token).await?;
                debug!(file_name, file_size, "issued small-file token");
                Ok(Disposition::NewSmall(token))
            }
        }
    }

    /// `authFile`: resolve the disposition and return upload credentials.
    pub async fn authorize_file(
        &self,
        file_name: &str,
        file_size: u64,
        last_modified: &str,
    ) -> Result<UploadGrant, UploadError> {
        let disposition = self
            .resolve_disposition(file_name, file_size, last_modified)
            .await?;
        let name = disposition.name();

        match disposition {
            Disposition::Conflict { file_id } => Err(UploadError::DuplicateFile {
                file_name: file_name.to_string(),
                file_id,
            }),
            Disposition::NewSmall(token) => Ok(UploadGrant {
                file_id: token.token.clone(),
                upload_url: self.small_file_url.clone(),
                authorization_token: token.token,
                bucket_id: Some(String::new()),
                disposition: name,
                parts_uploaded: Vec::new(),
            }),
            Disposition::Resume(session) | Disposition::NewLarge(session) => {
                let target = self
                    .b2
                    .get_upload_part_url(&session.file_id)
                    .await
                    .map_err(UploadError::ProviderRejected)?;
                Ok(UploadGrant {
                    file_id: target.file_id,
                    upload_url: target.upload_url,
                    authorization_token: target.authorization_token,
                    bucket_id: None,
                    disposition: name,
                    parts_uploaded: session.part_numbers(),
                })
            }
        }
    }

    /// `finishFile`: assemble a large file from its uploaded parts.
    ///
    /// Returns the provider's response reduced to
    /// [`FINISH_RESPONSE_FIELDS`].
    pub async fn finalize(
        &self,
        file_id: Option<&str>,
        file_size: Option<u64>,
        part_hashes: Option<Vec<String>>,
    ) -> Result<Value, UploadError> {
        let file_id = file_id.map(str::trim).filter(|id| !id.is_empty());
        let file_size = file_size.filter(|size| *size > 0);
        let (Some(file_id), Some(file_size)) = (file_id, file_size) else {
            return Err(UploadError::ProtocolViolation(
                "fileId and fileSize are required".into(),
            ));
        };

        match self.b2.finish_large_file(file_id, file_size, part_hashes).await {
            Ok(response) => {
                self.b2.cache().forget_upload(file_id).await;
                Ok(filter_finish_response(response))
            }
            Err(B2Error::SizeMismatch { expected, actual }) => {
                Err(UploadError::SizeMismatch { expected, actual })
            }
            Err(err) => Err(UploadError::Finish(err)),
        }
    }

    /// Whether part `part_number` of `file_id` is already stored, using the
    /// cached part listing when there is one.
    pub async fn part_exists(&self, file_id: &str, part_number: u32) -> B2Result<bool> {
        // Parts are never removed, so a cached session that has it is enough.
        if let Some(session) = self.b2.cache().upload_session(file_id).await {
            if session.has_part(part_number) {
                return Ok(true);
            }
        }
        let parts = self.b2.list_parts(file_id, true).await?;
        Ok(parts.iter().any(|part| part.part_number == part_number))
    }
}
