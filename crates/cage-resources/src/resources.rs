// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The `Resources` contract (§3, §4.3): atomic allocate, best-effort
//! deallocate, and liveness-guarded accessors.
//!
//! Grounded on `original_source/see/context/resources/resources.py`'s
//! `Resources` base class. The original's `provider_image` property
//! performs image-provider resolution inline; here that resolution happens
//! one layer up, in `cage-runtime`, via `cage-providers::ProviderRegistry` —
//! `cage-resources` never depends on `cage-providers`, so `DiskConfig`
//! carries an already-resolved `image_path` instead of a raw descriptor.
//! See `DESIGN.md` for the full rationale.

use crate::driver::{DomainHandle, HypervisorDriver, HypervisorHandle, NetworkHandle, PoolHandle};
use crate::network::NetworkConfig;
use cage_core::CoreResult;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
pub struct CloneConfig {
    pub storage_pool_path: PathBuf,
    #[serde(default)]
    pub copy_on_write: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiskConfig {
    pub image_path: PathBuf,
    pub clone: Option<CloneConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DomainConfig {
    pub configuration: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LxcFilesystemConfig {
    pub source_path: PathBuf,
    pub target_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResourcesConfig {
    #[serde(default = "default_hypervisor_uri")]
    pub hypervisor: String,
    pub domain: DomainConfig,
    pub disk: DiskConfig,
    pub network: Option<NetworkConfig>,
    /// LXC-only: bind-mount filesystem descriptors (§4.3's LXC driver).
    #[serde(default)]
    pub filesystem: Vec<LxcFilesystemConfig>,
}

fn default_hypervisor_uri() -> String {
    "qemu:///system".to_string()
}

/// Driver-specific resource bundle: acquires, in order, hypervisor
/// connection, storage pool, network, disk, domain; releases in reverse,
/// each step fault-isolated.
#[async_trait::async_trait]
pub trait Resources: Send + Sync {
    async fn allocate(&mut self) -> CoreResult<()>;

    /// Releases every handle currently held, logging and continuing past
    /// any individual failure. Idempotent: a second call is a no-op.
    async fn deallocate(&mut self);

    fn hypervisor(&self) -> CoreResult<&HypervisorHandle>;
    fn domain(&self) -> CoreResult<&DomainHandle>;
    fn network(&self) -> CoreResult<Option<&NetworkHandle>>;
    fn storage_pool(&self) -> CoreResult<Option<&PoolHandle>>;

    /// The driver this bundle was allocated against. `Context` drives the
    /// domain lifecycle (§4.4) through this handle and the handles above,
    /// rather than `Resources` exposing lifecycle verbs itself.
    fn driver(&self) -> &Arc<dyn HypervisorDriver>;
}
