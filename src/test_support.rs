//! In-process stand-in for the B2 API, shared by the unit tests.
//!
//! Serves the handful of `b2api/v2` operations the relay uses plus the
//! part/file upload endpoints, verifies SHA-1 digests the way B2 does, and
//! records what it was asked to do.

use crate::{
    config::LARGE_FILE_THRESHOLD,
    models::{auth::B2Credentials, file::FileVersion},
    routes::routes::routes,
    services::{
        b2_client::B2Client,
        cache::{CacheTtls, TokenCache},
        coordinator::UploadCoordinator,
        naming::PrefixedBasename,
        relay::ChunkRelay,
    },
    state::AppState,
};
use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use bytes::Bytes;
use serde_json::{Value, json};
use sha1::{Digest, Sha1};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::net::TcpListener;

const ACCOUNT_ID: &str = "acct-1";
const PART_TOKEN: &str = "part-token";
const UPLOAD_TOKEN: &str = "upload-token";

/// A single-file upload received on the upload URL.
#[derive(Debug, Clone)]
pub struct SmallUpload {
    pub bucket_id: String,
    pub file_name: String,
    pub content_length: u64,
    pub content_sha1: String,
    pub last_modified: Option<String>,
}

#[derive(Debug, Clone)]
struct StoredPart {
    length: u64,
    sha1: String,
}

#[derive(Debug)]
pub struct MockState {
    /// Reject `b2_authorize_account`.
    pub fail_auth: bool,
    /// Answer this many API calls with `expired_auth_token`.
    pub expire_next: u32,
    /// Restrict the issued key to [`MockB2::BUCKET_ID`].
    pub restrict_bucket: bool,
    /// Answer uploads of this part number with 400.
    pub fail_part: Option<u32>,
    /// Answer this many part uploads with 503.
    pub reject_part_uploads: u32,
    /// `(fileId, partSha1Array)` of every finished large file.
    pub finished: Vec<(String, Vec<String>)>,
    pub small_uploads: Vec<SmallUpload>,
    /// Hand out this URL from `b2_get_upload_url` instead of the mock's own.
    pub upload_url_override: Option<String>,
    auth_calls: u32,
    calls: HashMap<String, u32>,
    token: String,
    files: Vec<FileVersion>,
    parts: HashMap<String, BTreeMap<u32, StoredPart>>,
    next_id: u32,
    base_url: String,
}

type Shared = Arc<Mutex<MockState>>;

#[derive(Clone)]
pub struct MockB2 {
    base_url: String,
    state: Shared,
}

fn provider_error(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(json!({ "status": status.as_u16(), "code": code, "message": message })),
    )
        .into_response()
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn sha1_hex(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

fn part_json(file_id: &str, number: u32, part: &StoredPart) -> Value {
    json!({
        "fileId": file_id,
        "partNumber": number,
        "contentLength": part.length,
        "contentSha1": part.sha1,
        "uploadTimestamp": 1_700_000_000_000i64,
    })
}

impl MockB2 {
    pub const BUCKET_ID: &'static str = "bucket-1";
    pub const KEY_ID: &'static str = "key-1";

    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let state: Shared = Arc::new(Mutex::new(MockState {
            fail_auth: false,
            expire_next: 0,
            restrict_bucket: true,
            fail_part: None,
            reject_part_uploads: 0,
            finished: Vec::new(),
            small_uploads: Vec::new(),
            upload_url_override: None,
            auth_calls: 0,
            calls: HashMap::new(),
            token: String::new(),
            files: Vec::new(),
            parts: HashMap::new(),
            next_id: 0,
            base_url: base_url.clone(),
        }));

        let app = Router::new()
            .route("/b2api/v2/b2_authorize_account", get(authorize))
            .route("/b2api/v2/{op}", post(api))
            .route("/upload_part/{file_id}", post(upload_part))
            .route("/upload_file/{bucket_id}", post(upload_file))
            .layer(DefaultBodyLimit::disable())
            .with_state(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        Self { base_url, state }
    }

    /// A client with its own fresh in-memory cache.
    pub fn client(&self) -> B2Client {
        B2Client::new(
            B2Credentials {
                account_id: Self::KEY_ID.into(),
                application_key: "secret".into(),
            },
            &self.base_url,
            None,
            TokenCache::in_memory("b2:", CacheTtls::default()),
        )
        .unwrap()
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn auth_calls(&self) -> u32 {
        self.with(|s| s.auth_calls)
    }

    pub fn calls(&self, operation: &str) -> u32 {
        self.with(|s| s.calls.get(operation).copied().unwrap_or(0))
    }

    /// Digest recorded for parts seeded with [`MockB2::add_part`].
    pub fn part_sha1(part_number: u32) -> String {
        sha1_hex(format!("part-{part_number}").as_bytes())
    }

    /// Record part `part_number` of `file_id` as uploaded.
    pub fn add_part(&self, file_id: &str, part_number: u32, length: u64) {
        self.with(|s| {
            s.parts.entry(file_id.to_string()).or_default().insert(
                part_number,
                StoredPart {
                    length,
                    sha1: Self::part_sha1(part_number),
                },
            );
        });
    }

    /// Record a completed file.
    pub fn add_file(&self, file_name: &str, length: u64) -> String {
        self.with(|s| {
            let file_id = s.new_file_id();
            s.files.push(FileVersion {
                file_id: file_id.clone(),
                file_name: file_name.into(),
                action: "upload".into(),
                content_length: length,
                content_type: Some("application/octet-stream".into()),
                file_info: BTreeMap::new(),
                upload_timestamp: Some(1_700_000_000_000),
            });
            file_id
        })
    }

    /// Content length B2 holds for a completed `file_name`.
    pub fn completed_length(&self, file_name: &str) -> Option<u64> {
        self.with(|s| {
            s.files
                .iter()
                .find(|f| f.file_name == file_name && f.is_completed())
                .map(|f| f.content_length)
        })
    }
}

impl MockState {
    fn new_file_id(&mut self) -> String {
        self.next_id += 1;
        format!(
            "4_z{}_f2000000000000{:04}_d20261017_m120000_c002_v0001001_t0001",
            MockB2::BUCKET_ID,
            self.next_id
        )
    }

    fn started_file(&mut self, file_id: &str) -> Option<&mut FileVersion> {
        self.files
            .iter_mut()
            .find(|f| f.file_id == file_id && f.is_unfinished_large_file())
    }
}

/// Application state wired to `mock` with production defaults.
pub fn app_state(mock: &MockB2) -> AppState {
    let b2 = mock.client();
    let coordinator =
        UploadCoordinator::new(b2.clone(), LARGE_FILE_THRESHOLD, "/api?action=uploadSmallFile");
    let relay = ChunkRelay::new(
        b2,
        LARGE_FILE_THRESHOLD,
        Duration::from_secs(5),
        Duration::from_secs(5),
    )
    .unwrap();
    AppState::new(coordinator, relay, Arc::new(PrefixedBasename::new("test/")))
}

/// Serve the relay on an ephemeral port; returns the `/api` URL.
pub async fn spawn_app(state: AppState) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let api_url = format!("http://{}/api", listener.local_addr().unwrap());
    let app = routes().with_state(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    api_url
}

async fn authorize(State(state): State<Shared>, headers: HeaderMap) -> Response {
    let mut s = state.lock().unwrap();
    s.auth_calls += 1;
    let basic = header(&headers, "authorization").unwrap_or_default();
    if s.fail_auth || !basic.starts_with("Basic ") {
        return provider_error(StatusCode::UNAUTHORIZED, "unauthorized", "invalid application key");
    }
    s.token = format!("account-token-{}", s.auth_calls);

    let bucket_id = s.restrict_bucket.then_some(MockB2::BUCKET_ID);
    Json(json!({
        "accountId": ACCOUNT_ID,
        "authorizationToken": s.token,
        "apiUrl": s.base_url,
        "downloadUrl": s.base_url,
        "recommendedPartSize": 100_000_000,
        "absoluteMinimumPartSize": 5_000_000,
        "allowed": {
            "bucketId": bucket_id,
            "bucketName": bucket_id.map(|_| "uploads"),
            "namePrefix": null,
            "capabilities": ["listFiles", "readFiles", "writeFiles"],
        },
    }))
    .into_response()
}

async fn api(
    State(state): State<Shared>,
    Path(op): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let mut s = state.lock().unwrap();
    *s.calls.entry(op.clone()).or_default() += 1;

    if s.expire_next > 0 {
        s.expire_next -= 1;
        return provider_error(
            StatusCode::UNAUTHORIZED,
            "expired_auth_token",
            "Authorization token has expired",
        );
    }
    if header(&headers, "authorization") != Some(s.token.as_str()) || s.token.is_empty() {
        return provider_error(StatusCode::UNAUTHORIZED, "bad_auth_token", "Invalid authorization token");
    }

    let file_id = body["fileId"].as_str().unwrap_or_default().to_string();
    match op.as_str() {
        "b2_list_file_versions" => {
            let prefix = body["prefix"].as_str().unwrap_or_default();
            let files: Vec<&FileVersion> =
                s.files.iter().filter(|f| f.file_name.starts_with(prefix)).collect();
            Json(json!({ "files": files, "nextFileName": null, "nextFileId": null })).into_response()
        }
        "b2_list_unfinished_large_files" => {
            let prefix = body["namePrefix"].as_str().unwrap_or_default();
            let files: Vec<&FileVersion> = s
                .files
                .iter()
                .filter(|f| f.is_unfinished_large_file() && f.file_name.starts_with(prefix))
                .collect();
            Json(json!({ "files": files, "nextFileId": null })).into_response()
        }
        "b2_start_large_file" => {
            let file_id = s.new_file_id();
            let file_info: BTreeMap<String, Value> = body["fileInfo"]
                .as_object()
                .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default();
            let started = FileVersion {
                file_id,
                file_name: body["fileName"].as_str().unwrap_or_default().into(),
                action: "start".into(),
                content_length: 0,
                content_type: body["contentType"].as_str().map(str::to_string),
                file_info,
                upload_timestamp: Some(1_700_000_000_000),
            };
            s.files.push(started.clone());
            Json(started).into_response()
        }
        "b2_get_upload_part_url" => {
            if s.started_file(&file_id).is_none() {
                return provider_error(StatusCode::BAD_REQUEST, "bad_request", "No active upload for file");
            }
            Json(json!({
                "fileId": file_id,
                "uploadUrl": format!("{}/upload_part/{}", s.base_url, file_id),
                "authorizationToken": PART_TOKEN,
            }))
            .into_response()
        }
        "b2_get_upload_url" => {
            let bucket_id = body["bucketId"].as_str().unwrap_or_default();
            Json(json!({
                "bucketId": bucket_id,
                "uploadUrl": s
                    .upload_url_override
                    .clone()
                    .unwrap_or_else(|| format!("{}/upload_file/{}", s.base_url, bucket_id)),
                "authorizationToken": UPLOAD_TOKEN,
            }))
            .into_response()
        }
        "b2_list_parts" => {
            let start = body["startPartNumber"].as_u64().unwrap_or(1) as u32;
            let max = body["maxPartCount"].as_u64().unwrap_or(100) as usize;
            let stored = s.parts.get(&file_id).cloned().unwrap_or_default();
            let mut remaining = stored.range(start..);
            let page: Vec<Value> = remaining
                .by_ref()
                .take(max)
                .map(|(n, part)| part_json(&file_id, *n, part))
                .collect();
            let next = remaining.next().map(|(n, _)| *n);
            Json(json!({ "parts": page, "nextPartNumber": next })).into_response()
        }
        "b2_finish_large_file" => {
            let hashes: Vec<String> = body["partSha1Array"]
                .as_array()
                .map(|a| a.iter().filter_map(|h| h.as_str().map(str::to_string)).collect())
                .unwrap_or_default();
            let stored = s.parts.get(&file_id).cloned().unwrap_or_default();
            let expected: Vec<String> = stored.values().map(|p| p.sha1.clone()).collect();
            if hashes != expected {
                return provider_error(StatusCode::BAD_REQUEST, "bad_request", "Part SHA1s do not match");
            }
            let length = stored.values().map(|p| p.length).sum();
            let Some(file) = s.started_file(&file_id) else {
                return provider_error(StatusCode::BAD_REQUEST, "bad_request", "No active upload for file");
            };
            file.action = "upload".into();
            file.content_length = length;
            let mut response = serde_json::to_value(&*file).unwrap_or(Value::Null);
            response["accountId"] = json!(ACCOUNT_ID);
            response["bucketId"] = json!(MockB2::BUCKET_ID);
            response["contentSha1"] = json!("none");
            s.finished.push((file_id, hashes));
            Json(response).into_response()
        }
        _ => provider_error(StatusCode::BAD_REQUEST, "bad_request", "unknown operation"),
    }
}

async fn upload_part(
    State(state): State<Shared>,
    Path(file_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut s = state.lock().unwrap();
    if header(&headers, "authorization") != Some(PART_TOKEN) {
        return provider_error(StatusCode::UNAUTHORIZED, "bad_auth_token", "Invalid upload token");
    }
    if s.reject_part_uploads > 0 {
        s.reject_part_uploads -= 1;
        return provider_error(StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", "c002 too busy");
    }
    let Some(part_number) = header(&headers, "x-bz-part-number").and_then(|v| v.parse::<u32>().ok())
    else {
        return provider_error(StatusCode::BAD_REQUEST, "bad_request", "missing part number");
    };
    if s.fail_part == Some(part_number) {
        return provider_error(StatusCode::BAD_REQUEST, "bad_request", "part rejected");
    }
    let actual = sha1_hex(&body);
    if header(&headers, "x-bz-content-sha1") != Some(actual.as_str()) {
        return provider_error(StatusCode::BAD_REQUEST, "bad_request", "Sha1 did not match data received");
    }
    if s.started_file(&file_id).is_none() {
        return provider_error(StatusCode::BAD_REQUEST, "bad_request", "No active upload for file");
    }

    let part = StoredPart {
        length: body.len() as u64,
        sha1: actual,
    };
    let response = part_json(&file_id, part_number, &part);
    s.parts.entry(file_id).or_default().insert(part_number, part);
    Json(response).into_response()
}

async fn upload_file(
    State(state): State<Shared>,
    Path(bucket_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut s = state.lock().unwrap();
    if header(&headers, "authorization") != Some(UPLOAD_TOKEN) {
        return provider_error(StatusCode::UNAUTHORIZED, "bad_auth_token", "Invalid upload token");
    }
    let actual = sha1_hex(&body);
    if header(&headers, "x-bz-content-sha1") != Some(actual.as_str()) {
        return provider_error(StatusCode::BAD_REQUEST, "bad_request", "Sha1 did not match data received");
    }
    let Some(file_name) = header(&headers, "x-bz-file-name")
        .and_then(|raw| urlencoding::decode(raw).ok())
        .map(|name| name.into_owned())
    else {
        return provider_error(StatusCode::BAD_REQUEST, "bad_request", "missing file name");
    };

    let file_id = s.new_file_id();
    s.files.push(FileVersion {
        file_id: file_id.clone(),
        file_name: file_name.clone(),
        action: "upload".into(),
        content_length: body.len() as u64,
        content_type: header(&headers, "content-type").map(str::to_string),
        file_info: BTreeMap::new(),
        upload_timestamp: Some(1_700_000_000_000),
    });
    s.small_uploads.push(SmallUpload {
        bucket_id: bucket_id.clone(),
        file_name: file_name.clone(),
        content_length: body.len() as u64,
        content_sha1: actual.clone(),
        last_modified: header(&headers, "x-bz-info-src_last_modified_millis").map(str::to_string),
    });

    Json(json!({
        "accountId": ACCOUNT_ID,
        "action": "upload",
        "bucketId": bucket_id,
        "contentLength": body.len(),
        "contentSha1": actual,
        "fileId": file_id,
        "fileName": file_name,
    }))
    .into_response()
}
