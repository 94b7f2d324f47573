//! Command-line uploader speaking the relay's action protocol.
//!
//! Per file: `authFile` once, then either one `uploadSmallFile` request or a
//! pool of workers pushing parts straight to B2, followed by `finishFile`.
//! Parts the server already knows about are skipped via `checkFile`, so an
//! interrupted upload picks up where it stopped when run again.

use crate::client::chunker::{
    ChunkDescriptor, ChunkerOptions, digest_range, open_range, unique_id,
};
use futures::future::try_join_all;
use reqwest::{
    Body, Client, Response, StatusCode, Url,
    header::{AUTHORIZATION, CONTENT_LENGTH},
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::{
    collections::{BTreeMap, VecDeque},
    io,
    path::Path,
    time::{Duration, UNIX_EPOCH},
};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

/// Upper bound on concurrent part uploads per file.
pub const MAX_CONCURRENCY: usize = 4;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Longest wait on a silent server between reads.
const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Statuses from a part upload URL that call for a fresh URL and one retry.
const RETARGET_STATUSES: [StatusCode; 3] = [
    StatusCode::UNAUTHORIZED,
    StatusCode::REQUEST_TIMEOUT,
    StatusCode::SERVICE_UNAVAILABLE,
];

/// What `authFile` hands back.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTarget {
    pub file_id: String,
    pub upload_url: String,
    pub authorization_token: String,
    #[serde(default)]
    pub disposition: String,
    #[serde(default)]
    pub parts_uploaded: Vec<u32>,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("server rejected {action} with status {status}: {body}")]
    Rejected {
        action: &'static str,
        status: u16,
        body: String,
    },
    #[error("part {part_number} failed with status {status}: {body}")]
    ChunkFailed {
        part_number: u32,
        status: u16,
        body: String,
    },
    #[error("server switched upload from {expected} to {actual}")]
    FileChanged { expected: String, actual: String },
    #[error("invalid server URL: {0}")]
    Url(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Summary of one uploaded file.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadReport {
    pub file_name: String,
    pub file_size: u64,
    pub file_id: String,
    pub disposition: String,
    pub parts_sent: Vec<u32>,
    pub parts_skipped: Vec<u32>,
    /// B2's description of the stored file.
    pub stored: Value,
}

#[derive(Debug, Clone, Copy)]
pub struct UploaderOptions {
    pub chunker: ChunkerOptions,
    pub concurrency: usize,
}

impl Default for UploaderOptions {
    fn default() -> Self {
        Self {
            chunker: ChunkerOptions::default(),
            concurrency: 1,
        }
    }
}

struct FileContext<'a> {
    path: &'a Path,
    file_name: String,
    file_size: u64,
    last_modified: String,
    file_id: String,
}

enum Delivery {
    Accepted,
    Retarget { status: u16, body: String },
}

enum ChunkOutcome {
    Sent { part_number: u32, sha1: String },
    Skipped(u32),
}

pub struct Uploader {
    http: Client,
    api_url: Url,
    options: UploaderOptions,
}

impl Uploader {
    pub fn new(api_url: &str, options: UploaderOptions) -> Result<Self, ClientError> {
        let api_url = Url::parse(api_url).map_err(|err| ClientError::Url(err.to_string()))?;
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            api_url,
            options: UploaderOptions {
                concurrency: options.concurrency.clamp(1, MAX_CONCURRENCY),
                ..options
            },
        })
    }

    /// Upload (or finish uploading) the file at `path`.
    pub async fn upload_file(&self, path: &Path) -> Result<UploadReport, ClientError> {
        let metadata = tokio::fs::metadata(path).await?;
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no UTF-8 file name"))?;
        let last_modified = metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|since| since.as_millis())
            .unwrap_or_default()
            .to_string();

        let mut ctx = FileContext {
            path,
            file_name,
            file_size: metadata.len(),
            last_modified,
            file_id: String::new(),
        };

        let target = self.authorize(&ctx).await?;
        ctx.file_id = target.file_id.clone();
        info!(
            file = %ctx.file_name,
            size = ctx.file_size,
            disposition = %target.disposition,
            "upload authorized"
        );

        let file_unique_id = unique_id(&ctx.file_name, ctx.file_size);
        if target.disposition == "new-small" {
            let whole = ChunkDescriptor {
                file_unique_id,
                part_number: 1,
                start_byte: 0,
                end_byte: ctx.file_size,
            };
            let stored = self.send_small(&ctx, &target, &whole).await?;
            return Ok(UploadReport {
                file_name: ctx.file_name,
                file_size: ctx.file_size,
                file_id: ctx.file_id,
                disposition: target.disposition,
                parts_sent: vec![1],
                parts_skipped: Vec::new(),
                stored,
            });
        }

        let chunks = self.options.chunker.plan(&file_unique_id, ctx.file_size);
        let queue = Mutex::new(chunks.into_iter().collect::<VecDeque<_>>());
        let known = target.parts_uploaded.clone();
        let workers = (0..self.options.concurrency).map(|worker| {
            // Only the first worker can use the bundle from the initial
            // authFile; the others ask for their own.
            let bundle = (worker == 0).then(|| target.clone());
            self.run_worker(&ctx, &queue, &known, bundle)
        });

        let mut sent = BTreeMap::new();
        let mut skipped = Vec::new();
        for outcome in try_join_all(workers).await?.into_iter().flatten() {
            match outcome {
                ChunkOutcome::Sent { part_number, sha1 } => {
                    sent.insert(part_number, sha1);
                }
                ChunkOutcome::Skipped(part_number) => skipped.push(part_number),
            }
        }
        skipped.sort_unstable();

        // Local digests describe the whole file only if every part was sent
        // in this run; otherwise the server derives them from B2's listing.
        let hashes = skipped
            .is_empty()
            .then(|| sent.values().cloned().collect::<Vec<_>>());
        let stored = self.finish(&ctx, hashes).await?;
        info!(file = %ctx.file_name, file_id = %ctx.file_id, parts = sent.len(), "large file finished");

        Ok(UploadReport {
            file_name: ctx.file_name,
            file_size: ctx.file_size,
            file_id: ctx.file_id,
            disposition: target.disposition,
            parts_sent: sent.into_keys().collect(),
            parts_skipped: skipped,
            stored,
        })
    }

    async fn run_worker(
        &self,
        ctx: &FileContext<'_>,
        queue: &Mutex<VecDeque<ChunkDescriptor>>,
        known: &[u32],
        mut target: Option<UploadTarget>,
    ) -> Result<Vec<ChunkOutcome>, ClientError> {
        let mut outcomes = Vec::new();
        loop {
            let Some(chunk) = queue.lock().await.pop_front() else {
                break;
            };
            let part_number = chunk.part_number;

            if known.contains(&part_number) || self.part_exists(&ctx.file_id, part_number).await? {
                debug!(part_number, "part already uploaded, skipping");
                outcomes.push(ChunkOutcome::Skipped(part_number));
                continue;
            }

            let current = match target.take() {
                Some(current) => current,
                None => self.reauthorize(ctx).await?,
            };
            let sha1 = digest_range(ctx.path, &chunk).await?;

            let current = match self.send_part(&current, ctx.path, &chunk, &sha1).await? {
                Delivery::Accepted => current,
                Delivery::Retarget { status, body } => {
                    warn!(part_number, status, "upload URL refused part, retrying with a new one: {}", body);
                    let fresh = self.reauthorize(ctx).await?;
                    match self.send_part(&fresh, ctx.path, &chunk, &sha1).await? {
                        Delivery::Accepted => fresh,
                        Delivery::Retarget { status, body } => {
                            return Err(ClientError::ChunkFailed {
                                part_number,
                                status,
                                body,
                            });
                        }
                    }
                }
            };
            debug!(part_number, bytes = chunk.len(), "part uploaded");
            target = Some(current);
            outcomes.push(ChunkOutcome::Sent { part_number, sha1 });
        }
        Ok(outcomes)
    }

    fn resolve(&self, target: &str) -> Result<Url, ClientError> {
        self.api_url
            .join(target)
            .map_err(|err| ClientError::Url(err.to_string()))
    }

    async fn expect_json<T: DeserializeOwned>(
        response: Response,
        action: &'static str,
    ) -> Result<T, ClientError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Rejected {
                action,
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }

    async fn authorize(&self, ctx: &FileContext<'_>) -> Result<UploadTarget, ClientError> {
        let file_size = ctx.file_size.to_string();
        let response = self
            .http
            .post(self.api_url.clone())
            .form(&[
                ("action", "authFile"),
                ("fileName", ctx.file_name.as_str()),
                ("fileSize", file_size.as_str()),
                ("lastModified", ctx.last_modified.as_str()),
            ])
            .send()
            .await?;
        Self::expect_json(response, "authFile").await
    }

    /// A fresh part upload URL for the file already being uploaded.
    async fn reauthorize(&self, ctx: &FileContext<'_>) -> Result<UploadTarget, ClientError> {
        let target = self.authorize(ctx).await?;
        if target.file_id != ctx.file_id {
            return Err(ClientError::FileChanged {
                expected: ctx.file_id.clone(),
                actual: target.file_id,
            });
        }
        Ok(target)
    }

    async fn part_exists(&self, file_id: &str, part_number: u32) -> Result<bool, ClientError> {
        let mut url = self.api_url.clone();
        url.query_pairs_mut()
            .append_pair("action", "checkFile")
            .append_pair("fileId", file_id);
        let response = self
            .http
            .get(url)
            .header("X-Bz-Part-Number", part_number)
            .send()
            .await?;
        Ok(response.status() == StatusCode::OK)
    }

    async fn send_part(
        &self,
        target: &UploadTarget,
        path: &Path,
        chunk: &ChunkDescriptor,
        sha1: &str,
    ) -> Result<Delivery, ClientError> {
        let reader = open_range(path, chunk).await?;
        let response = self
            .http
            .post(self.resolve(&target.upload_url)?)
            .header(AUTHORIZATION, &target.authorization_token)
            .header(CONTENT_LENGTH, chunk.len())
            .header("X-Bz-Part-Number", chunk.part_number)
            .header("X-Bz-Content-Sha1", sha1)
            .body(Body::wrap_stream(ReaderStream::new(reader)))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(Delivery::Accepted);
        }
        let body = response.text().await.unwrap_or_default();
        if RETARGET_STATUSES.contains(&status) {
            return Ok(Delivery::Retarget {
                status: status.as_u16(),
                body,
            });
        }
        Err(ClientError::ChunkFailed {
            part_number: chunk.part_number,
            status: status.as_u16(),
            body,
        })
    }

    async fn send_small(
        &self,
        ctx: &FileContext<'_>,
        target: &UploadTarget,
        whole: &ChunkDescriptor,
    ) -> Result<Value, ClientError> {
        let sha1 = digest_range(ctx.path, whole).await?;
        let reader = open_range(ctx.path, whole).await?;
        let response = self
            .http
            .post(self.resolve(&target.upload_url)?)
            .header(AUTHORIZATION, &target.authorization_token)
            .header(CONTENT_LENGTH, whole.len())
            .header("X-Bz-Content-Sha1", sha1)
            .body(Body::wrap_stream(ReaderStream::new(reader)))
            .send()
            .await?;
        Self::expect_json(response, "uploadSmallFile").await
    }

    async fn finish(
        &self,
        ctx: &FileContext<'_>,
        part_hashes: Option<Vec<String>>,
    ) -> Result<Value, ClientError> {
        let mut form = vec![
            ("action", "finishFile".to_string()),
            ("fileId", ctx.file_id.clone()),
            ("fileSize", ctx.file_size.to_string()),
        ];
        if let Some(hashes) = part_hashes {
            form.push(("partSha1Array", hashes.join(",")));
        }
        let response = self
            .http
            .post(self.api_url.clone())
            .form(&form)
            .send()
            .await?;
        Self::expect_json(response, "finishFile").await
    }
}
