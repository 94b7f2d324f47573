//! src/services/cache.rs
//!
//! Keyed, expiring storage shared by every request: account authorization,
//! upload sessions, part listings and small-file tokens.
//!
//! The backend is chosen once at startup behind [`KeyValueStore`]:
//! - [`MemoryStore`] keeps entries in-process (single instance deployments)
//! - [`SqliteStore`] keeps entries in SQLite so several instances can share them
//!
//! Everything except small-file tokens is an advisory accelerator: read and
//! write failures are logged and treated as cache misses.

use crate::models::{
    auth::AccountAuth, file::PartInfo, session::UploadSession, small_file::SmallFileToken,
};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Serialize, de::DeserializeOwned};
use sqlx::SqlitePool;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::{sync::RwLock, task::JoinHandle};
use tracing::{debug, warn};

/// Schema for the SQLite backend, also applied by `--migrate`.
const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend failure: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("cached value is not valid JSON: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// A keyed store whose entries expire after a per-entry TTL.
///
/// A zero TTL means the entry never expires.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> CacheResult<()>;

    /// Remove and return a live entry. At most one caller observes the value.
    async fn take(&self, key: &str) -> CacheResult<Option<String>>;

    /// Drop expired entries, returning how many were removed.
    async fn purge_expired(&self) -> CacheResult<u64>;

    /// Short backend name for logs and diagnostics.
    fn backend(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// Process-local store. Expired entries are hidden on read and dropped by
/// [`KeyValueStore::purge_expired`].
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, MemoryEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|entry| entry.is_live(Instant::now()))
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> CacheResult<()> {
        // Past the clock's range counts as never expiring.
        let expires_at = if ttl.is_zero() {
            None
        } else {
            Instant::now().checked_add(ttl)
        };
        self.entries
            .write()
            .await
            .insert(key.to_string(), MemoryEntry { value, expires_at });
        Ok(())
    }

    async fn take(&self, key: &str) -> CacheResult<Option<String>> {
        let removed = self.entries.write().await.remove(key);
        Ok(removed
            .filter(|entry| entry.is_live(Instant::now()))
            .map(|entry| entry.value))
    }

    async fn purge_expired(&self) -> CacheResult<u64> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        Ok((before - entries.len()) as u64)
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

// ---------------------------------------------------------------------------
// SqliteStore
// ---------------------------------------------------------------------------

/// SQLite-backed store. `expires_at` holds unix millis, `0` for no expiry.
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<SqlitePool>,
}

impl SqliteStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Create the `cache_entries` table if it does not exist yet.
    pub async fn migrate(db: &SqlitePool) -> CacheResult<()> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        tracing::info!("Running {} migration statements...", statements.len());

        for stmt in statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(db).await?;
        }
        Ok(())
    }

    fn now_millis() -> i64 {
        Utc::now().timestamp_millis()
    }

    fn is_live(expires_at: i64, now: i64) -> bool {
        expires_at == 0 || now < expires_at
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let row = sqlx::query_as::<_, (String, i64)>(
            "SELECT value, expires_at FROM cache_entries WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&*self.db)
        .await?;

        match row {
            Some((value, expires_at)) if Self::is_live(expires_at, Self::now_millis()) => {
                Ok(Some(value))
            }
            Some(_) => {
                sqlx::query("DELETE FROM cache_entries WHERE key = ? AND expires_at > 0 AND expires_at <= ?")
                    .bind(key)
                    .bind(Self::now_millis())
                    .execute(&*self.db)
                    .await?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> CacheResult<()> {
        let expires_at = if ttl.is_zero() {
            0
        } else {
            i64::try_from(ttl.as_millis())
                .ok()
                .and_then(|millis| Self::now_millis().checked_add(millis))
                .unwrap_or(0)
        };

        sqlx::query(
            r#"
            INSERT INTO cache_entries (key, value, expires_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    async fn take(&self, key: &str) -> CacheResult<Option<String>> {
        let row = sqlx::query_as::<_, (String, i64)>(
            "DELETE FROM cache_entries WHERE key = ? RETURNING value, expires_at",
        )
        .bind(key)
        .fetch_optional(&*self.db)
        .await?;

        let now = Self::now_millis();
        Ok(row
            .filter(|(_, expires_at)| Self::is_live(*expires_at, now))
            .map(|(value, _)| value))
    }

    async fn purge_expired(&self) -> CacheResult<u64> {
        let result =
            sqlx::query("DELETE FROM cache_entries WHERE expires_at > 0 AND expires_at <= ?")
                .bind(Self::now_millis())
                .execute(&*self.db)
                .await?;
        Ok(result.rows_affected())
    }

    fn backend(&self) -> &'static str {
        "sqlite"
    }
}

// ---------------------------------------------------------------------------
// TokenCache
// ---------------------------------------------------------------------------

/// Independent lifetimes of each kind of cached record.
#[derive(Clone, Debug)]
pub struct CacheTtls {
    pub account_auth: Duration,
    pub parts: Duration,
    pub upload_session: Duration,
    pub small_file: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            account_auth: Duration::from_secs(12 * 60 * 60),
            parts: Duration::from_secs(60 * 60),
            upload_session: Duration::from_secs(24 * 60 * 60),
            small_file: Duration::from_secs(60 * 60),
        }
    }
}

/// Typed view over a [`KeyValueStore`], with every key namespaced by `prefix`.
#[derive(Clone)]
pub struct TokenCache {
    store: Arc<dyn KeyValueStore>,
    prefix: String,
    ttls: CacheTtls,
}

impl TokenCache {
    pub fn new(store: Arc<dyn KeyValueStore>, prefix: impl Into<String>, ttls: CacheTtls) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            ttls,
        }
    }

    /// Cache over a fresh [`MemoryStore`].
    pub fn in_memory(prefix: impl Into<String>, ttls: CacheTtls) -> Self {
        Self::new(Arc::new(MemoryStore::new()), prefix, ttls)
    }

    pub fn backend(&self) -> &'static str {
        self.store.backend()
    }

    pub fn ttls(&self) -> &CacheTtls {
        &self.ttls
    }

    /// Raw store, used by readiness probes.
    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    fn key(&self, kind: &str, id: &str) -> String {
        format!("{}{}:{}", self.prefix, kind, id)
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        match self.store.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> CacheResult<()> {
        let raw = serde_json::to_string(value)?;
        self.store.set(key, raw, ttl).await
    }

    async fn lookup<T: DeserializeOwned>(&self, kind: &'static str, id: &str) -> Option<T> {
        match self.get_json(&self.key(kind, id)).await {
            Ok(value) => value,
            Err(err) => {
                warn!(kind, "cache read failed, treating as miss: {}", err);
                None
            }
        }
    }

    async fn remember<T: Serialize>(&self, kind: &'static str, id: &str, value: &T, ttl: Duration) {
        if let Err(err) = self.set_json(&self.key(kind, id), value, ttl).await {
            warn!(kind, "cache write failed: {}", err);
        }
    }

    /// Cached authorization for the application key `key_id`.
    pub async fn account_auth(&self, key_id: &str) -> Option<AccountAuth> {
        self.lookup("auth", key_id).await
    }

    pub async fn put_account_auth(&self, key_id: &str, auth: &AccountAuth) {
        self.remember("auth", key_id, auth, self.ttls.account_auth)
            .await
    }

    pub async fn parts(&self, file_id: &str) -> Option<Vec<PartInfo>> {
        self.lookup("parts", file_id).await
    }

    pub async fn put_parts(&self, file_id: &str, parts: &[PartInfo]) {
        self.remember("parts", file_id, &parts, self.ttls.parts).await
    }

    pub async fn upload_session(&self, file_id: &str) -> Option<UploadSession> {
        self.lookup("session", file_id).await
    }

    pub async fn put_upload_session(&self, session: &UploadSession) {
        self.remember(
            "session",
            &session.file_id,
            session,
            self.ttls.upload_session,
        )
        .await
    }

    /// Drop the session and part listing of a finished or abandoned file.
    pub async fn forget_upload(&self, file_id: &str) {
        for kind in ["session", "parts"] {
            if let Err(err) = self.store.take(&self.key(kind, file_id)).await {
                warn!(kind, "cache delete failed: {}", err);
            }
        }
    }

    /// Store a freshly issued small-file token. Failure is fatal for the
    /// request since the client could never redeem the token.
    pub async fn put_small_file_token(&self, token: &SmallFileToken) -> CacheResult<()> {
        self.set_json(
            &self.key("smallFile", &token.token),
            token,
            self.ttls.small_file,
        )
        .await
    }

    /// Consume a small-file token. A second call for the same token yields
    /// `None`.
    pub async fn take_small_file_token(&self, token: &str) -> CacheResult<Option<SmallFileToken>> {
        match self.store.take(&self.key("smallFile", token)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn purge_expired(&self) -> CacheResult<u64> {
        self.store.purge_expired().await
    }

    /// Periodically purge expired entries in the background.
    pub fn spawn_purger(&self, every: Duration) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match cache.purge_expired().await {
                    Ok(0) => {}
                    Ok(n) => debug!("purged {} expired cache entries", n),
                    Err(err) => warn!("cache purge failed: {}", err),
                }
            }
        })
    }
}
