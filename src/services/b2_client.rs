//! src/services/b2_client.rs
//!
//! B2Client: a stateless wrapper around the Backblaze B2 v2 JSON API.
//!
//! Every call ensures an account authorization is available (cache first),
//! issues the signed request and, when B2 answers with `bad_auth_token` or
//! `expired_auth_token`, re-authorizes without the cache and re-issues the
//! call exactly once. Any other provider error envelope is handed back to the
//! caller as [`B2Error::Provider`] without further interpretation.

use crate::{
    models::{
        auth::{AccountAuth, B2Credentials},
        file::{AUTO_CONTENT_TYPE, FileVersion, PartInfo, UploadPartUrl, UploadUrl},
    },
    services::cache::TokenCache,
};
use base64::{Engine as _, engine::general_purpose};
use reqwest::{
    Client, Response,
    header::{ACCEPT, AUTHORIZATION},
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use std::{collections::BTreeMap, fmt, time::Duration};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Public entry point used for `b2_authorize_account`.
pub const DEFAULT_API_BASE: &str = "https://api.backblazeb2.com";

/// Timeout for every API request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Page size for `b2_list_parts` (the API maximum).
const MAX_PART_COUNT: u32 = 1000;

/// Error codes B2 uses for an unusable account token.
const EXPIRED_TOKEN_CODES: [&str; 2] = ["bad_auth_token", "expired_auth_token"];

/// The error envelope B2 returns with every non-2xx response.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ProviderError {
    #[serde(default)]
    pub status: u16,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

impl ProviderError {
    /// True for the 401 responses that a fresh account token can fix.
    pub fn is_expired_token(&self) -> bool {
        self.status == 401 && EXPIRED_TOKEN_CODES.contains(&self.code.as_str())
    }

    async fn from_response(response: Response) -> Self {
        let status = response.status().as_u16();
        let body = response.bytes().await.unwrap_or_default();
        match serde_json::from_slice::<ProviderError>(&body) {
            Ok(mut envelope) => {
                if envelope.status == 0 {
                    envelope.status = status;
                }
                envelope
            }
            Err(_) => ProviderError {
                status,
                code: "unknown".into(),
                message: String::from_utf8_lossy(&body).chars().take(200).collect(),
            },
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.status, self.code, self.message)
    }
}

#[derive(Debug, Error)]
pub enum B2Error {
    #[error("account authorization unavailable: {0}")]
    AuthUnavailable(String),
    #[error("B2 returned {0}")]
    Provider(ProviderError),
    #[error("transport failure talking to B2: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected B2 response: {0}")]
    Decode(String),
    #[error("part lengths sum to {actual} bytes but {expected} were declared")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("no bucket configured and the application key is not restricted to one")]
    NoBucket,
}

pub type B2Result<T> = Result<T, B2Error>;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListFileVersionsResponse {
    #[serde(default)]
    files: Vec<FileVersion>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListPartsResponse {
    #[serde(default)]
    parts: Vec<PartInfo>,
    #[serde(default)]
    next_part_number: Option<u32>,
}

/// Client for the B2 API. Cheap to clone; all clones share the HTTP pool and
/// the token cache.
#[derive(Clone)]
pub struct B2Client {
    http: Client,
    credentials: B2Credentials,
    /// Base URL for `b2_authorize_account` (no trailing path).
    api_base: String,
    /// Bucket used when the caller does not name one.
    bucket_id: Option<String>,
    cache: TokenCache,
}

impl B2Client {
    pub fn new(
        credentials: B2Credentials,
        api_base: impl Into<String>,
        bucket_id: Option<String>,
        cache: TokenCache,
    ) -> B2Result<Self> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            credentials,
            api_base: api_base.into(),
            bucket_id,
            cache,
        })
    }

    pub fn cache(&self) -> &TokenCache {
        &self.cache
    }

    /// Obtain the account authorization, from the cache unless
    /// `force_refresh` is set.
    pub async fn authorize_account(&self, force_refresh: bool) -> B2Result<AccountAuth> {
        let key_id = &self.credentials.account_id;
        if !force_refresh {
            if let Some(auth) = self.cache.account_auth(key_id).await {
                return Ok(auth);
            }
        }

        let url = format!(
            "{}/b2api/v2/b2_authorize_account",
            self.api_base.trim_end_matches('/')
        );
        let basic = general_purpose::STANDARD.encode(format!(
            "{}:{}",
            key_id, self.credentials.application_key
        ));

        let response = self
            .http
            .get(&url)
            .header(ACCEPT, "application/json")
            .header(AUTHORIZATION, format!("Basic {}", basic))
            .send()
            .await
            .map_err(|err| B2Error::AuthUnavailable(format!("request failed: {}", err)))?;

        if !response.status().is_success() {
            let envelope = ProviderError::from_response(response).await;
            return Err(B2Error::AuthUnavailable(envelope.to_string()));
        }

        let auth: AccountAuth = response
            .json()
            .await
            .map_err(|err| B2Error::AuthUnavailable(format!("malformed response: {}", err)))?;

        self.cache.put_account_auth(key_id, &auth).await;
        info!(
            account_id = %auth.account_id,
            api_url = %auth.api_url,
            forced = force_refresh,
            "authorized B2 account"
        );
        Ok(auth)
    }

    /// Issue `operation` with a body built from the current authorization,
    /// re-authorizing and retrying once on an expired token.
    async fn call<T, F>(&self, operation: &'static str, build: F) -> B2Result<T>
    where
        T: DeserializeOwned,
        F: Fn(&AccountAuth) -> B2Result<Value>,
    {
        let auth = self.authorize_account(false).await?;
        let body = build(&auth)?;
        match self.post(&auth, operation, &body).await {
            Err(B2Error::Provider(err)) if err.is_expired_token() => {
                warn!(operation, code = %err.code, "B2 rejected account token, re-authorizing once");
                let auth = self.authorize_account(true).await?;
                let body = build(&auth)?;
                self.post(&auth, operation, &body).await
            }
            other => other,
        }
    }

    async fn post<T: DeserializeOwned>(
        &self,
        auth: &AccountAuth,
        operation: &'static str,
        body: &Value,
    ) -> B2Result<T> {
        let response = self
            .http
            .post(auth.endpoint(operation))
            .header(ACCEPT, "application/json")
            .header(AUTHORIZATION, &auth.authorization_token)
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let envelope = ProviderError::from_response(response).await;
            debug!(operation, "B2 error envelope: {}", envelope);
            return Err(B2Error::Provider(envelope));
        }

        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|err| B2Error::Decode(format!("{}: {}", operation, err)))
    }

    /// Resolve the bucket: explicit argument, configured bucket, then the
    /// bucket the application key is restricted to.
    fn bucket_for(&self, auth: &AccountAuth, explicit: Option<&str>) -> B2Result<String> {
        explicit
            .filter(|id| !id.is_empty())
            .or(self.bucket_id.as_deref())
            .or(auth.allowed_bucket_id())
            .map(str::to_string)
            .ok_or(B2Error::NoBucket)
    }

    /// Start a large file; `file_info` is stored by B2 with the file.
    pub async fn start_large_file(
        &self,
        file_name: &str,
        file_info: &BTreeMap<String, String>,
    ) -> B2Result<FileVersion> {
        let started: FileVersion = self
            .call("b2_start_large_file", |auth| {
                Ok(json!({
                    "bucketId": self.bucket_for(auth, None)?,
                    "fileName": file_name,
                    "contentType": AUTO_CONTENT_TYPE,
                    "fileInfo": file_info,
                }))
            })
            .await?;
        info!(file_id = %started.file_id, file_name, "started large file");
        Ok(started)
    }

    /// Finish a large file after checking that the uploaded parts add up to
    /// `total_size`.
    ///
    /// The part listing is always fetched from B2 here; when the lengths do
    /// not add up, `b2_finish_large_file` is never called. Without
    /// `part_hashes` the SHA-1 list is taken from the listing in part order.
    pub async fn finish_large_file(
        &self,
        file_id: &str,
        total_size: u64,
        part_hashes: Option<Vec<String>>,
    ) -> B2Result<Value> {
        let mut parts = self.list_parts(file_id, false).await?;
        parts.sort_by_key(|p| p.part_number);

        let actual: u64 = parts.iter().map(|p| p.content_length).sum();
        if actual != total_size {
            warn!(file_id, expected = total_size, actual, "refusing to finish large file");
            return Err(B2Error::SizeMismatch {
                expected: total_size,
                actual,
            });
        }

        let hashes = match part_hashes {
            Some(hashes) if !hashes.is_empty() => hashes,
            _ => parts.into_iter().map(|p| p.content_sha1).collect(),
        };

        let finished: Value = self
            .call("b2_finish_large_file", |_| {
                Ok(json!({ "fileId": file_id, "partSha1Array": hashes }))
            })
            .await?;
        info!(file_id, total_size, "finished large file");
        Ok(finished)
    }

    /// All parts uploaded so far, cache first unless `use_cache` is false.
    pub async fn list_parts(&self, file_id: &str, use_cache: bool) -> B2Result<Vec<PartInfo>> {
        if use_cache {
            if let Some(parts) = self.cache.parts(file_id).await {
                return Ok(parts);
            }
        }

        let mut parts = Vec::new();
        let mut start_part_number: Option<u32> = None;
        loop {
            let page: ListPartsResponse = self
                .call("b2_list_parts", |_| {
                    let mut body = json!({ "fileId": file_id, "maxPartCount": MAX_PART_COUNT });
                    if let Some(start) = start_part_number {
                        body["startPartNumber"] = json!(start);
                    }
                    Ok(body)
                })
                .await?;
            parts.extend(page.parts);
            match page.next_part_number {
                Some(next) if Some(next) != start_part_number => start_part_number = Some(next),
                _ => break,
            }
        }

        debug!(file_id, count = parts.len(), "listed parts from B2");
        self.cache.put_parts(file_id, &parts).await;
        Ok(parts)
    }

    /// Versions of files whose names start with `file_name`.
    pub async fn list_file_versions(&self, file_name: &str) -> B2Result<Vec<FileVersion>> {
        let listing: ListFileVersionsResponse = self
            .call("b2_list_file_versions", |auth| {
                Ok(json!({
                    "bucketId": self.bucket_for(auth, None)?,
                    "prefix": file_name,
                }))
            })
            .await?;
        debug!(file_name, count = listing.files.len(), "listed file versions");
        Ok(listing.files)
    }

    /// Per-part upload destination for a started large file.
    pub async fn get_upload_part_url(&self, file_id: &str) -> B2Result<UploadPartUrl> {
        self.call("b2_get_upload_part_url", |_| Ok(json!({ "fileId": file_id })))
            .await
    }

    /// Single-file upload destination for `bucket_id` (or the default bucket).
    pub async fn get_upload_url(&self, bucket_id: Option<&str>) -> B2Result<UploadUrl> {
        self.call("b2_get_upload_url", |auth| {
            Ok(json!({ "bucketId": self.bucket_for(auth, bucket_id)? }))
        })
        .await
    }

    /// Unfinished large files whose names start with `name_prefix`.
    pub async fn list_unfinished_large_files(
        &self,
        name_prefix: &str,
    ) -> B2Result<Vec<FileVersion>> {
        let listing: ListFileVersionsResponse = self
            .call("b2_list_unfinished_large_files", |auth| {
                Ok(json!({
                    "bucketId": self.bucket_for(auth, None)?,
                    "namePrefix": name_prefix,
                }))
            })
            .await?;
        Ok(listing.files)
    }
}
