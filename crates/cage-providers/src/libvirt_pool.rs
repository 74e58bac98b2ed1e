// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Libvirt storage-pool image provider (§4.2): resolves a path already
//! inside a configured storage-pool directory, defining the pool's catalog
//! entry if it isn't registered yet. No network I/O, no checksum — the pool
//! is trusted. Grounded on
//! `original_source/see/image_providers/libvirt_pool.py`'s
//! `LibvirtPoolProvider`.

use crate::pool::LibvirtPoolBackend;
use async_trait::async_trait;
use cage_core::{CoreError, CoreResult, ImageProvider};
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
pub struct LibvirtPoolConfiguration {
    #[serde(default = "default_hypervisor")]
    pub hypervisor: String,
    pub storage_pool_path: PathBuf,
}

fn default_hypervisor() -> String {
    "qemu:///system".to_string()
}

pub struct LibvirtPoolProvider<B: LibvirtPoolBackend> {
    backend: Arc<B>,
}

impl<B: LibvirtPoolBackend> LibvirtPoolProvider<B> {
    pub fn new(backend: B) -> Self {
        Self { backend: Arc::new(backend) }
    }
}

#[async_trait]
impl<B: LibvirtPoolBackend> ImageProvider for LibvirtPoolProvider<B> {
    async fn resolve(&self, uri: &str, provider_configuration: &Value) -> CoreResult<PathBuf> {
        let config: LibvirtPoolConfiguration =
            serde_json::from_value(provider_configuration.clone()).map_err(|e| CoreError::Configuration(e.to_string()))?;

        let base = config.storage_pool_path.to_string_lossy().trim_end_matches('/').to_string();
        let relative = uri.trim_start_matches('/');
        let path = PathBuf::from(format!("{base}/{relative}"));

        if !path.exists() {
            return Err(CoreError::ImageNotFound(path.display().to_string()));
        }

        if let Some(volume_path) = self.backend.lookup_volume_path(&config.hypervisor, &path).await? {
            return Ok(volume_path);
        }

        self.backend.define_and_create_pool(&config.hypervisor, &config.storage_pool_path, uri).await
    }
}
