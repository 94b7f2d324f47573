//! The action endpoint (`/api`).
//!
//! A single URL serves every step of the upload protocol. The step is picked
//! by `action`, read from the query string first and then from the form body:
//!
//! - `authFile`        (POST) resolve name, decide disposition, hand out credentials
//! - `checkFile`       (GET)  does part N of a large file already exist?
//! - `finishFile`      (POST) assemble a large file from its parts
//! - `uploadSmallFile` (POST) relay a small file body to B2; query string only
//! - `checkServer`     (GET)  plain-text summary of server limits

use crate::{
    errors::AppError,
    handlers::form::FormFields,
    models::small_file::SmallFileToken,
    services::{coordinator::UploadError, naming::basename, relay::RelayHeaders},
    state::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{FromRequest, Query, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::Deserialize;
use std::{io, str::FromStr};
use tracing::{debug, warn};

/// Headers carrying the part number for `checkFile`.
const PART_NUMBER_HEADERS: [&str; 2] = ["x-part-number", "x-bz-part-number"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    AuthFile,
    CheckFile,
    FinishFile,
    UploadSmallFile,
    CheckServer,
}

impl FromStr for Action {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "authFile" => Ok(Action::AuthFile),
            "checkFile" => Ok(Action::CheckFile),
            "finishFile" => Ok(Action::FinishFile),
            "uploadSmallFile" => Ok(Action::UploadSmallFile),
            "checkServer" => Ok(Action::CheckServer),
            other => Err(AppError::bad_request(format!("unknown action `{}`", other))),
        }
    }
}

/// Query parameters understood by the endpoint. Anything else in the query
/// string (a `fileName`, say) is ignored.
#[derive(Debug, Default, Deserialize)]
pub struct ApiQuery {
    pub action: Option<String>,
    #[serde(rename = "fileId")]
    pub file_id: Option<String>,
}

impl ApiQuery {
    fn action(&self) -> Result<Option<Action>, AppError> {
        self.action
            .as_deref()
            .filter(|a| !a.trim().is_empty())
            .map(str::parse)
            .transpose()
    }
}

/// `GET /api`
pub async fn api_get(
    State(state): State<AppState>,
    Query(query): Query<ApiQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    match query.action()? {
        Some(Action::CheckFile) => check_file(&state, query.file_id.as_deref(), &headers).await,
        Some(Action::CheckServer) => Ok(check_server(&state)),
        Some(other) => Err(AppError::new(
            StatusCode::METHOD_NOT_ALLOWED,
            format!("{:?} requires POST", other),
        )),
        None => Err(AppError::bad_request("missing action")),
    }
}

/// `POST /api`
pub async fn api_post(
    State(state): State<AppState>,
    Query(query): Query<ApiQuery>,
    request: Request,
) -> Result<Response, AppError> {
    let query_action = query.action()?;
    if query_action == Some(Action::UploadSmallFile) {
        // The body is the file itself; it must not be parsed as a form.
        return upload_small_file(&state, request).await;
    }

    let headers = request.headers().clone();
    let form = FormFields::from_request(request, &state).await?;
    let action = match query_action {
        Some(action) => action,
        None => form
            .get("action")
            .ok_or_else(|| AppError::bad_request("missing action"))?
            .parse::<Action>()?,
    };

    match action {
        Action::AuthFile => auth_file(&state, &form).await,
        Action::FinishFile => finish_file(&state, &form).await,
        Action::CheckFile => {
            let file_id = form.get("fileId").or(query.file_id.as_deref());
            check_file(&state, file_id, &headers).await
        }
        Action::CheckServer => Ok(check_server(&state)),
        Action::UploadSmallFile => Err(AppError::bad_request(
            "uploadSmallFile must be selected in the query string",
        )),
    }
}

fn protocol_violation(msg: &str) -> AppError {
    UploadError::ProtocolViolation(msg.to_string()).into()
}

async fn auth_file(state: &AppState, form: &FormFields) -> Result<Response, AppError> {
    let (Some(requested), Some(size), Some(last_modified)) = (
        form.first_of(&["fileName", "b2FileName"]),
        form.first_of(&["fileSize", "b2FileSize"]),
        form.first_of(&["lastModified", "b2LastModified"]),
    ) else {
        return Err(protocol_violation(
            "fileName, fileSize and lastModified are required",
        ));
    };

    let file_size = size
        .parse::<u64>()
        .ok()
        .filter(|size| *size > 0)
        .ok_or_else(|| protocol_violation("fileSize must be a positive integer"))?;
    // Forwarded verbatim as B2 file info, so only plain millis are accepted.
    let last_modified = last_modified
        .trim()
        .parse::<u64>()
        .map_err(|_| protocol_violation("lastModified must be unix milliseconds"))?
        .to_string();
    if basename(requested).is_none() {
        return Err(protocol_violation("fileName has no usable base name"));
    }

    let file_name = state
        .name_policy
        .resolve(requested, file_size)
        .ok_or(UploadError::NameRejected)?;
    debug!(requested, file_name = %file_name, file_size, "authFile");

    let grant = state
        .coordinator
        .authorize_file(&file_name, file_size, &last_modified)
        .await?;
    Ok(Json(grant).into_response())
}

async fn check_file(
    state: &AppState,
    file_id: Option<&str>,
    headers: &HeaderMap,
) -> Result<Response, AppError> {
    let file_id = file_id
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AppError::bad_request("fileId is required"))?;

    // Small files are never resumed.
    if SmallFileToken::looks_like_token(file_id) {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    let part_number = PART_NUMBER_HEADERS
        .iter()
        .find_map(|name| headers.get(*name))
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u32>().ok())
        .ok_or_else(|| AppError::bad_request("X-Part-Number header is required"))?;

    match state.coordinator.part_exists(file_id, part_number).await {
        Ok(true) => Ok((StatusCode::OK, Json("part exists")).into_response()),
        Ok(false) => Ok(StatusCode::NO_CONTENT.into_response()),
        Err(err) => {
            warn!(file_id, part_number, "part lookup failed, reporting missing: {}", err);
            Ok(StatusCode::NO_CONTENT.into_response())
        }
    }
}

/// `partSha1Array` as a JSON array or a comma separated list.
fn parse_part_hashes(raw: &str) -> Result<Vec<String>, AppError> {
    let hashes: Vec<String> = if raw.starts_with('[') {
        serde_json::from_str(raw)
            .map_err(|_| protocol_violation("partSha1Array must be a JSON array of strings"))?
    } else {
        raw.split(',').map(|h| h.trim().to_string()).collect()
    };

    if hashes.iter().any(|h| h.is_empty()) {
        return Err(protocol_violation("partSha1Array contains an empty digest"));
    }
    Ok(hashes)
}

async fn finish_file(state: &AppState, form: &FormFields) -> Result<Response, AppError> {
    let file_size = match form.get("fileSize") {
        Some(raw) => Some(
            raw.parse::<u64>()
                .map_err(|_| protocol_violation("fileSize must be a positive integer"))?,
        ),
        None => None,
    };
    let part_hashes = form.get("partSha1Array").map(parse_part_hashes).transpose()?;

    let finished = state
        .coordinator
        .finalize(form.get("fileId"), file_size, part_hashes)
        .await?;
    Ok(Json(finished).into_response())
}

async fn upload_small_file(state: &AppState, request: Request) -> Result<Response, AppError> {
    let relay_headers = RelayHeaders::from_headers(request.headers())?;
    let body = request
        .into_body()
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other));

    let relayed = state.relay.relay(relay_headers, body).await?;

    let mut response = Response::new(Body::from(relayed.body));
    *response.status_mut() =
        StatusCode::from_u16(relayed.status).unwrap_or(StatusCode::BAD_GATEWAY);
    if let Some(content_type) = relayed
        .content_type
        .and_then(|ct| HeaderValue::from_str(&ct).ok())
    {
        response.headers_mut().insert(CONTENT_TYPE, content_type);
    }
    Ok(response)
}

fn check_server(state: &AppState) -> Response {
    let text = format!(
        "Max small-file upload size: {} bytes\nLarge-file threshold: {} bytes\nCache backend: {}\nUpload token lifetime: {}s\n",
        state.relay.max_size(),
        state.coordinator.large_file_threshold(),
        state.cache().backend(),
        state.cache().ttls().small_file.as_secs(),
    );
    ([(CONTENT_TYPE, "text/plain; charset=utf-8")], text).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        routes::routes::routes,
        services::naming::FileNamePolicy,
        test_support::{MockB2, app_state},
    };
    use axum::{Router, http::Method};
    use serde_json::Value;
    use sha1::{Digest, Sha1};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app(mock: &MockB2) -> Router {
        routes().with_state(app_state(mock))
    }

    fn form_post(body: &str) -> Request {
        Request::builder()
            .method(Method::POST)
            .uri("/api")
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn send(app: &Router, request: Request) -> (StatusCode, Vec<u8>) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body.to_vec())
    }

    async fn send_json(app: &Router, request: Request) -> (StatusCode, Value) {
        let (status, body) = send(app, request).await;
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    async fn auth_small(app: &Router, name: &str, size: u64) -> Value {
        let (status, grant) = send_json(
            app,
            form_post(&format!(
                "action=authFile&fileName={name}&fileSize={size}&lastModified=1700000000000"
            )),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{grant}");
        grant
    }

    fn small_upload(token: &str, data: &'static [u8], query: &str) -> Request {
        Request::builder()
            .method(Method::POST)
            .uri(format!("/api?action=uploadSmallFile{query}"))
            .header("authorization", token)
            .header("content-length", data.len())
            .header("x-bz-content-sha1", hex::encode(Sha1::digest(data)))
            .body(Body::from(data))
            .unwrap()
    }

    #[tokio::test]
    async fn test_auth_file_requires_fields() {
        let mock = MockB2::start().await;
        let app = app(&mock);

        let (status, body) =
            send_json(&app, form_post("action=authFile&fileName=a.txt&fileSize=10")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], 400);
        assert_eq!(mock.auth_calls(), 0);
    }

    #[tokio::test]
    async fn test_auth_file_rejects_non_numeric_last_modified() {
        let mock = MockB2::start().await;
        let app = app(&mock);

        for last_modified in ["12%7F34", "yesterday", "-5"] {
            let (status, body) = send_json(
                &app,
                form_post(&format!(
                    "action=authFile&fileName=a.txt&fileSize=10&lastModified={last_modified}"
                )),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{last_modified}: {body}");
        }
        assert_eq!(mock.auth_calls(), 0);

        let (status, grant) = send_json(
            &app,
            form_post("action=authFile&fileName=a.txt&fileSize=5&lastModified=%201700000000000%20"),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{grant}");
        let token = grant["authorizationToken"].as_str().unwrap();
        let (status, _) = send(&app, small_upload(token, b"hello", "")).await;
        assert_eq!(status, StatusCode::OK);
        let uploads = mock.with(|s| s.small_uploads.clone());
        assert_eq!(uploads[0].last_modified.as_deref(), Some("1700000000000"));
    }

    #[tokio::test]
    async fn test_auth_file_small_and_large() {
        let mock = MockB2::start().await;
        let app = app(&mock);

        let small = auth_small(&app, "notes.txt", 5_000_000).await;
        assert_eq!(small["disposition"], "new-small");
        assert_eq!(small["bucketId"], "");
        assert_eq!(small["uploadUrl"], "/api?action=uploadSmallFile");
        assert_eq!(small["fileId"].as_str().unwrap().len(), 40);

        let (status, large) = send_json(
            &app,
            form_post("action=authFile&b2FileName=dir%2Freport.pdf&b2FileSize=12000000&b2LastModified=1"),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{large}");
        assert_eq!(large["disposition"], "new-large");
        assert_eq!(large["authorizationToken"], "part-token");

        let unfinished = mock.client().list_unfinished_large_files("test/").await.unwrap();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].file_name, "test/report.pdf");
        assert_eq!(unfinished[0].src_size(), Some(12_000_000));
    }

    #[tokio::test]
    async fn test_auth_file_accepts_multipart() {
        let mock = MockB2::start().await;
        let app = app(&mock);

        let boundary = "XBOUNDARYX";
        let mut body = String::new();
        for (name, value) in [
            ("action", "authFile"),
            ("fileName", "photo.jpg"),
            ("fileSize", "1234"),
            ("lastModified", "1700000000000"),
        ] {
            body.push_str(&format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            ));
        }
        body.push_str(&format!("--{boundary}--\r\n"));

        let request = Request::builder()
            .method(Method::POST)
            .uri("/api")
            .header(CONTENT_TYPE, format!("multipart/form-data; boundary={boundary}"))
            .body(Body::from(body))
            .unwrap();
        let (status, grant) = send_json(&app, request).await;
        assert_eq!(status, StatusCode::OK, "{grant}");
        assert_eq!(grant["disposition"], "new-small");
    }

    #[tokio::test]
    async fn test_auth_file_duplicate_is_conflict() {
        let mock = MockB2::start().await;
        mock.add_file("test/report.pdf", 2_000);
        let app = app(&mock);

        let (status, body) = send_json(
            &app,
            form_post("action=authFile&fileName=report.pdf&fileSize=2000&lastModified=1"),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "duplicate_file");
    }

    #[tokio::test]
    async fn test_auth_file_policy_rejection_is_forbidden() {
        struct DenyAll;
        impl FileNamePolicy for DenyAll {
            fn resolve(&self, _requested: &str, _file_size: u64) -> Option<String> {
                None
            }
        }

        let mock = MockB2::start().await;
        let mut state = app_state(&mock);
        state.name_policy = Arc::new(DenyAll);
        let app = routes().with_state(state);

        let (status, _) = send_json(
            &app,
            form_post("action=authFile&fileName=a.txt&fileSize=10&lastModified=1"),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(mock.auth_calls(), 0);
    }

    #[tokio::test]
    async fn test_auth_file_lookup_failure_is_bad_gateway() {
        let mock = MockB2::start().await;
        mock.with(|s| s.fail_auth = true);
        let app = app(&mock);

        let (status, body) = send_json(
            &app,
            form_post("action=authFile&fileName=a.txt&fileSize=10&lastModified=1"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["code"], "provider_unavailable");
    }

    #[tokio::test]
    async fn test_check_file() {
        let mock = MockB2::start().await;
        let app = app(&mock);

        let (_, grant) = send_json(
            &app,
            form_post("action=authFile&fileName=big.bin&fileSize=12000000&lastModified=1"),
        )
        .await;
        let file_id = grant["fileId"].as_str().unwrap().to_string();
        mock.add_part(&file_id, 1, 5_000_000);

        let check = |part: &str, header: &'static str| {
            Request::builder()
                .uri(format!("/api?action=checkFile&fileId={file_id}"))
                .header(header, part)
                .body(Body::empty())
                .unwrap()
        };

        let (status, body) = send(&app, check("1", "x-part-number")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"\"part exists\"");

        let (status, _) = send(&app, check("2", "x-bz-part-number")).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let no_header = Request::builder()
            .uri(format!("/api?action=checkFile&fileId={file_id}"))
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&app, no_header).await.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_check_file_small_token_never_exists() {
        let mock = MockB2::start().await;
        let app = app(&mock);
        let grant = auth_small(&app, "a.txt", 10).await;

        let request = Request::builder()
            .uri(format!("/api?action=checkFile&fileId={}", grant["fileId"].as_str().unwrap()))
            .header("x-part-number", "1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&app, request).await.0, StatusCode::NO_CONTENT);
        assert_eq!(mock.calls("b2_list_parts"), 0);
    }

    #[tokio::test]
    async fn test_finish_file() {
        let mock = MockB2::start().await;
        let app = app(&mock);

        let (status, _) = send_json(&app, form_post("action=finishFile&fileSize=10")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, grant) = send_json(
            &app,
            form_post("action=authFile&fileName=big.bin&fileSize=6000000&lastModified=1"),
        )
        .await;
        let file_id = grant["fileId"].as_str().unwrap().to_string();
        mock.add_part(&file_id, 1, 5_000_000);

        let (status, body) = send_json(
            &app,
            form_post(&format!("action=finishFile&fileId={file_id}&fileSize=6000000")),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "size_mismatch");

        mock.add_part(&file_id, 2, 1_000_000);
        let hashes = format!("{},{}", MockB2::part_sha1(1), MockB2::part_sha1(2));
        let (status, body) = send_json(
            &app,
            form_post(&format!(
                "action=finishFile&fileId={file_id}&fileSize=6000000&partSha1Array={hashes}"
            )),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["fileName"], "test/big.bin");
        assert_eq!(body["contentLength"], 6_000_000);
        assert!(body.get("accountId").is_none());
        assert!(body.get("bucketId").is_none());
    }

    #[tokio::test]
    async fn test_upload_small_file_ignores_request_name() {
        let mock = MockB2::start().await;
        let app = app(&mock);
        let grant = auth_small(&app, "hello.txt", 5).await;
        let token = grant["authorizationToken"].as_str().unwrap().to_string();

        let (status, body) = send_json(
            &app,
            small_upload(&token, b"hello", "&fileName=..%2F..%2Fetc%2Fpasswd"),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["fileName"], "test/hello.txt");
        assert_eq!(mock.completed_length("test/hello.txt"), Some(5));
        assert_eq!(mock.with(|s| s.small_uploads[0].file_name.clone()), "test/hello.txt");

        // Tokens are single use.
        let (status, _) = send_json(&app, small_upload(&token, b"hello", "")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(mock.calls("b2_get_upload_url"), 1);
    }

    #[tokio::test]
    async fn test_upload_small_file_rejections() {
        let mock = MockB2::start().await;
        let app = app(&mock);

        let (status, _) = send_json(&app, small_upload(&"f".repeat(40), b"hello", "")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(mock.calls("b2_get_upload_url"), 0);

        let grant = auth_small(&app, "hello.txt", 5).await;
        let token = grant["authorizationToken"].as_str().unwrap().to_string();
        let missing_digest = Request::builder()
            .method(Method::POST)
            .uri("/api?action=uploadSmallFile")
            .header("authorization", token.as_str())
            .header("content-length", 5)
            .body(Body::from("hello"))
            .unwrap();
        assert_eq!(send(&app, missing_digest).await.0, StatusCode::BAD_REQUEST);

        // The malformed request did not consume the token.
        let (status, _) = send_json(&app, small_upload(&token, b"hello", "")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_upload_small_file_passes_provider_error_through() {
        let mock = MockB2::start().await;
        let app = app(&mock);
        let grant = auth_small(&app, "hello.txt", 5).await;

        let request = Request::builder()
            .method(Method::POST)
            .uri("/api?action=uploadSmallFile")
            .header("authorization", grant["authorizationToken"].as_str().unwrap())
            .header("content-length", 5)
            .header("x-content-sha1", "0000000000000000000000000000000000000000")
            .body(Body::from("hello"))
            .unwrap();
        let (status, body) = send_json(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "bad_request");
    }

    #[tokio::test]
    async fn test_check_server_and_unknown_action() {
        let mock = MockB2::start().await;
        let app = app(&mock);

        let request = Request::builder()
            .uri("/api?action=checkServer")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("5000000 bytes"));
        assert!(text.contains("Cache backend: memory"));

        let (status, _) = send_json(&app, form_post("action=deleteEverything")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
