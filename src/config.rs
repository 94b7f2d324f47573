use crate::{models::auth::B2Credentials, services::cache::CacheTtls};
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::{env, fmt, path::PathBuf, str::FromStr, time::Duration};

/// Files larger than this go through the multi-part path; files at or below
/// it are relayed in one piece. Shared by the server and the uploader so the
/// two can never disagree.
pub const LARGE_FILE_THRESHOLD: u64 = 5_000_000;

/// Default part size for the uploader (B2's minimum part size).
pub const DEFAULT_CHUNK_SIZE: u64 = 5_000_000;

/// Upper bound for any TTL or timeout read from the environment (10 years).
const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Which [`KeyValueStore`](crate::services::cache::KeyValueStore) backs the token cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum CacheBackend {
    Memory,
    Sqlite,
}

impl FromStr for CacheBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Self as ValueEnum>::from_str(s, true)
    }
}

/// What the binary should do after configuration is loaded.
#[derive(Debug, Clone, PartialEq)]
pub enum Mode {
    Serve,
    Migrate,
    Upload(UploadArgs),
}

/// Options for `--upload`.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadArgs {
    pub path: PathBuf,
    pub server_url: String,
    pub chunk_size: u64,
    pub concurrency: usize,
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub cache_backend: CacheBackend,
    /// Namespace prepended to every cache key.
    pub cache_prefix: String,
    pub ttls: CacheTtls,
    pub b2_account_id: Option<String>,
    pub b2_application_key: Option<String>,
    pub b2_bucket_id: Option<String>,
    pub b2_api_base: String,
    /// Server-controlled folder every upload lands in.
    pub name_prefix: String,
    pub large_file_threshold: u64,
    /// URL handed to clients for small-file uploads.
    pub small_file_url: String,
    pub relay_connect_timeout: Duration,
    /// Longest the relay waits on a silent upstream between reads.
    pub relay_read_timeout: Duration,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database_url", &self.database_url)
            .field("cache_backend", &self.cache_backend)
            .field("cache_prefix", &self.cache_prefix)
            .field("ttls", &self.ttls)
            .field("b2_account_id", &self.b2_account_id)
            .field(
                "b2_application_key",
                &self.b2_application_key.as_ref().map(|_| "<redacted>"),
            )
            .field("b2_bucket_id", &self.b2_bucket_id)
            .field("b2_api_base", &self.b2_api_base)
            .field("name_prefix", &self.name_prefix)
            .field("large_file_threshold", &self.large_file_threshold)
            .field("small_file_url", &self.small_file_url)
            .field("relay_connect_timeout", &self.relay_connect_timeout)
            .field("relay_read_timeout", &self.relay_read_timeout)
            .finish()
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Resumable Backblaze B2 upload relay")]
pub struct Args {
    /// Host to bind to (overrides B2_UPLOAD_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides B2_UPLOAD_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// SQLite URL for the sqlite cache backend (overrides B2_UPLOAD_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Cache backend (overrides B2_UPLOAD_CACHE_BACKEND)
    #[arg(long, value_enum)]
    pub cache_backend: Option<CacheBackend>,

    /// Bucket to upload into (overrides B2_BUCKET_ID)
    #[arg(long)]
    pub bucket_id: Option<String>,

    /// B2 API base URL used for authorization (overrides B2_API_BASE)
    #[arg(long)]
    pub api_base: Option<String>,

    /// Folder uploads are placed under (overrides B2_UPLOAD_NAME_PREFIX)
    #[arg(long)]
    pub name_prefix: Option<String>,

    /// Small/large cutover in bytes (overrides B2_UPLOAD_LARGE_FILE_THRESHOLD)
    #[arg(long)]
    pub large_file_threshold: Option<u64>,

    /// Create the SQLite cache schema and exit
    #[arg(long)]
    pub migrate: bool,

    /// Upload a file through a running relay instead of serving
    #[arg(long, value_name = "PATH")]
    pub upload: Option<PathBuf>,

    /// Relay endpoint used by --upload (defaults to the local server)
    #[arg(long)]
    pub server_url: Option<String>,

    /// Part size used by --upload
    #[arg(long)]
    pub chunk_size: Option<u64>,

    /// Concurrent part uploads used by --upload
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..=4))]
    pub concurrency: u16,
}

/// Parse `name` from the environment, falling back to `default` when unset.
fn env_or<T>(lookup: &dyn Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(name) {
        Some(value) => value
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("{}", err))
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        None => Ok(default),
    }
}

fn env_secs(lookup: &dyn Fn(&str) -> Option<String>, name: &str, default: Duration) -> Result<Duration> {
    let secs = env_or(lookup, name, default.as_secs())?;
    if secs > MAX_DURATION_SECS {
        anyhow::bail!("{} must be at most {} seconds, got {}", name, MAX_DURATION_SECS, secs);
    }
    Ok(Duration::from_secs(secs))
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and run mode.
    pub fn from_env_and_args() -> Result<(Self, Mode)> {
        let args = Args::parse();
        Self::resolve(args, &|name| {
            env::var(name).ok().filter(|value| !value.trim().is_empty())
        })
    }

    /// Merge `args` over the variables provided by `lookup`.
    pub fn resolve(args: Args, lookup: &dyn Fn(&str) -> Option<String>) -> Result<(Self, Mode)> {
        // --- Environment fallback ---
        let env_host = lookup("B2_UPLOAD_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let env_port = env_or(lookup, "B2_UPLOAD_PORT", 3000u16)?;
        let env_db = lookup("B2_UPLOAD_DATABASE_URL")
            .unwrap_or_else(|| "sqlite://./data/cache/b2_upload.db".into());
        let env_backend = env_or(lookup, "B2_UPLOAD_CACHE_BACKEND", CacheBackend::Memory)?;
        let env_threshold =
            env_or(lookup, "B2_UPLOAD_LARGE_FILE_THRESHOLD", LARGE_FILE_THRESHOLD)?;

        let defaults = CacheTtls::default();
        let ttls = CacheTtls {
            account_auth: env_secs(lookup, "B2_UPLOAD_AUTH_TTL_SECS", defaults.account_auth)?,
            parts: env_secs(lookup, "B2_UPLOAD_PARTS_TTL_SECS", defaults.parts)?,
            upload_session: env_secs(
                lookup,
                "B2_UPLOAD_SESSION_TTL_SECS",
                defaults.upload_session,
            )?,
            small_file: env_secs(lookup, "B2_UPLOAD_SMALL_FILE_TTL_SECS", defaults.small_file)?,
        };

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.unwrap_or(env_db),
            cache_backend: args.cache_backend.unwrap_or(env_backend),
            cache_prefix: lookup("B2_UPLOAD_CACHE_PREFIX").unwrap_or_else(|| "b2:".into()),
            ttls,
            b2_account_id: lookup("B2_ACCOUNT_ID"),
            b2_application_key: lookup("B2_APPLICATION_KEY"),
            b2_bucket_id: args.bucket_id.or_else(|| lookup("B2_BUCKET_ID")),
            b2_api_base: args
                .api_base
                .or_else(|| lookup("B2_API_BASE"))
                .unwrap_or_else(|| crate::services::b2_client::DEFAULT_API_BASE.into()),
            name_prefix: args
                .name_prefix
                .or_else(|| lookup("B2_UPLOAD_NAME_PREFIX"))
                .unwrap_or_else(|| "test/".into()),
            large_file_threshold: args.large_file_threshold.unwrap_or(env_threshold),
            small_file_url: lookup("B2_UPLOAD_SMALL_FILE_URL")
                .unwrap_or_else(|| "/api?action=uploadSmallFile".into()),
            relay_connect_timeout: env_secs(
                lookup,
                "B2_UPLOAD_RELAY_CONNECT_TIMEOUT_SECS",
                Duration::from_secs(30),
            )?,
            relay_read_timeout: env_secs(
                lookup,
                "B2_UPLOAD_RELAY_READ_TIMEOUT_SECS",
                Duration::from_secs(60),
            )?,
        };

        let mode = if let Some(path) = args.upload {
            Mode::Upload(UploadArgs {
                path,
                server_url: args
                    .server_url
                    .unwrap_or_else(|| format!("http://127.0.0.1:{}/api", cfg.port)),
                chunk_size: args.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE),
                concurrency: usize::from(args.concurrency),
            })
        } else if args.migrate {
            Mode::Migrate
        } else {
            Mode::Serve
        };

        Ok((cfg, mode))
    }

    /// B2 credentials, required to serve.
    pub fn credentials(&self) -> Result<B2Credentials> {
        Ok(B2Credentials {
            account_id: self
                .b2_account_id
                .clone()
                .context("B2_ACCOUNT_ID must be set")?,
            application_key: self
                .b2_application_key
                .clone()
                .context("B2_APPLICATION_KEY must be set")?,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
