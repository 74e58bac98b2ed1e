// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Seams onto the hypervisor's storage-pool catalog, used by
//! [`crate::s3::S3Provider`]'s optional post-download refresh and by
//! [`crate::libvirt_pool::LibvirtPoolProvider`]. Kept independent of
//! `cage-resources`'s `HypervisorDriver` so `cage-providers` has no
//! dependency in that direction (mirroring the decision recorded in
//! `DESIGN.md` to resolve image paths in `cage-runtime` rather than have
//! `cage-resources` depend on `cage-providers`): a production embedder wires
//! an adapter backed by their `HypervisorDriver` at the `cage-runtime`
//! composition layer.

use async_trait::async_trait;
use cage_core::CoreResult;
use std::path::{Path, PathBuf};

/// Refreshes a named storage pool's catalog after an out-of-band file lands
/// in its backing directory, so the hypervisor picks up the new volume.
#[async_trait]
pub trait PoolRefresher: Send + Sync {
    async fn refresh(&self, hypervisor: &str, pool_name: &str) -> CoreResult<()>;
}

/// Resolves paths against a hypervisor's storage-pool catalog, defining a
/// new directory-backed pool on demand. Grounded on
/// `original_source/see/image_providers/libvirt_pool.py`.
#[async_trait]
pub trait LibvirtPoolBackend: Send + Sync {
    /// The path of the storage volume that already owns `path`, if any.
    async fn lookup_volume_path(&self, hypervisor: &str, path: &Path) -> CoreResult<Option<PathBuf>>;

    /// Defines, autostarts, and creates a new `dir`-type pool rooted at
    /// `pool_path`, then returns the path of `volume_name` within it.
    async fn define_and_create_pool(&self, hypervisor: &str, pool_path: &Path, volume_name: &str) -> CoreResult<PathBuf>;
}
