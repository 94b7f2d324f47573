use anyhow::{Context, Result};
use axum::Router;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::{io::ErrorKind, path::Path, str::FromStr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod client;
mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
mod state;
#[cfg(test)]
mod test_support;

use client::{
    chunker::ChunkerOptions,
    uploader::{Uploader, UploaderOptions},
};
use config::{AppConfig, CacheBackend, Mode, UploadArgs};
use services::cache::{KeyValueStore, MemoryStore, SqliteStore, TokenCache};

/// How often expired cache entries are swept.
const PURGE_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + run mode ---
    let (cfg, mode) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting b2-upload-relay with config: {:?}", cfg);

    match mode {
        Mode::Upload(upload) => return run_upload(&cfg, upload).await,
        Mode::Migrate => {
            let db = connect_sqlite(&cfg.database_url).await?;
            SqliteStore::migrate(&db).await?;
            tracing::info!("Cache schema migration complete.");
            return Ok(()); // exit after migration
        }
        Mode::Serve => {}
    }

    // --- Token cache ---
    let store: Arc<dyn KeyValueStore> = match cfg.cache_backend {
        CacheBackend::Memory => Arc::new(MemoryStore::new()),
        CacheBackend::Sqlite => {
            let db = connect_sqlite(&cfg.database_url).await?;
            SqliteStore::migrate(&db).await?;
            Arc::new(SqliteStore::new(Arc::new(db)))
        }
    };
    let cache = TokenCache::new(store, cfg.cache_prefix.clone(), cfg.ttls.clone());
    let _purger = cache.spawn_purger(PURGE_INTERVAL);

    // --- Build router ---
    let state = state::AppState::from_config(&cfg, cache)?;
    report_unfinished_uploads(&state, &cfg.name_prefix);
    let app: Router = routes::routes::routes().with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Log large files left unfinished under `prefix`; clients can resume them.
fn report_unfinished_uploads(state: &state::AppState, prefix: &str) {
    let b2 = state.coordinator.b2().clone();
    let prefix = prefix.to_string();
    tokio::spawn(async move {
        match b2.list_unfinished_large_files(&prefix).await {
            Ok(files) if files.is_empty() => {}
            Ok(files) => tracing::info!(
                count = files.len(),
                prefix = %prefix,
                "unfinished large files awaiting resume"
            ),
            Err(err) => tracing::warn!("could not list unfinished large files: {}", err),
        }
    });
}

/// Open (creating if needed) the SQLite database behind the cache.
async fn connect_sqlite(database_url: &str) -> Result<SqlitePool> {
    tracing::debug!("Connecting using raw URL => {}", database_url);

    let db_path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("invalid database URL {}", database_url))?
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// `--upload`: push one file through a running relay and print the report.
async fn run_upload(cfg: &AppConfig, upload: UploadArgs) -> Result<()> {
    let uploader = Uploader::new(
        &upload.server_url,
        UploaderOptions {
            chunker: ChunkerOptions {
                multi_min_size: cfg.large_file_threshold,
                chunk_size: upload.chunk_size,
            },
            concurrency: upload.concurrency,
        },
    )?;

    let report = uploader
        .upload_file(&upload.path)
        .await
        .with_context(|| format!("uploading {}", upload.path.display()))?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
