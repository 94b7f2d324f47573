//! Shared state handed to every handler.

use crate::{
    config::AppConfig,
    services::{
        b2_client::B2Client,
        cache::TokenCache,
        coordinator::UploadCoordinator,
        naming::{FileNamePolicy, PrefixedBasename},
        relay::ChunkRelay,
    },
};
use anyhow::Result;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: UploadCoordinator,
    pub relay: ChunkRelay,
    pub name_policy: Arc<dyn FileNamePolicy>,
}

impl AppState {
    pub fn new(
        coordinator: UploadCoordinator,
        relay: ChunkRelay,
        name_policy: Arc<dyn FileNamePolicy>,
    ) -> Self {
        Self {
            coordinator,
            relay,
            name_policy,
        }
    }

    /// Wire the services described by `cfg` on top of `cache`.
    pub fn from_config(cfg: &AppConfig, cache: TokenCache) -> Result<Self> {
        let b2 = B2Client::new(
            cfg.credentials()?,
            cfg.b2_api_base.clone(),
            cfg.b2_bucket_id.clone(),
            cache,
        )?;
        let coordinator = UploadCoordinator::new(
            b2.clone(),
            cfg.large_file_threshold,
            cfg.small_file_url.clone(),
        );
        let relay = ChunkRelay::new(
            b2,
            cfg.large_file_threshold,
            cfg.relay_connect_timeout,
            cfg.relay_read_timeout,
        )?;

        Ok(Self::new(
            coordinator,
            relay,
            Arc::new(PrefixedBasename::new(cfg.name_prefix.clone())),
        ))
    }

    pub fn cache(&self) -> &TokenCache {
        self.coordinator.b2().cache()
    }
}
