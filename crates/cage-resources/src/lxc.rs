// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! LXC driver specialization (§4.3): bind-mount filesystem descriptors
//! `(source_path, target_path)`. On allocation each mount's `source_path/
//! <identifier>` directory is created on the host and injected into the
//! domain definition; on deallocation those directories are removed.
//! Grounded on `original_source/see/context/resources/lxc.py`'s
//! `LXCResources`.

use crate::driver::{DomainHandle, HypervisorDriver, HypervisorHandle, NetworkHandle};
use crate::network;
use crate::resources::{Resources, ResourcesConfig};
use crate::xml;
use cage_core::{CoreError, CoreResult};
use std::path::PathBuf;
use std::sync::Arc;

pub struct LxcResources {
    identifier: String,
    configuration: ResourcesConfig,
    driver: Arc<dyn HypervisorDriver>,
    hypervisor: Option<HypervisorHandle>,
    network: Option<NetworkHandle>,
    domain: Option<DomainHandle>,
    mount_points: Vec<PathBuf>,
}

impl LxcResources {
    pub fn new(identifier: impl Into<String>, configuration: ResourcesConfig, driver: Arc<dyn HypervisorDriver>) -> Self {
        Self {
            identifier: identifier.into(),
            configuration,
            driver,
            hypervisor: None,
            network: None,
            domain: None,
            mount_points: Vec::new(),
        }
    }

    fn prepare_mounts(&mut self) -> CoreResult<Vec<(PathBuf, PathBuf)>> {
        let mut mounts = Vec::new();
        for filesystem in &self.configuration.filesystem {
            let source = filesystem.source_path.join(&self.identifier);
            std::fs::create_dir_all(&source)?;
            self.mount_points.push(source.clone());
            mounts.push((source, filesystem.target_path.clone()));
        }
        Ok(mounts)
    }

    async fn allocate_inner(&mut self) -> CoreResult<()> {
        let hypervisor = self.driver.open(&self.configuration.hypervisor).await?;
        self.hypervisor = Some(hypervisor.clone());

        if let Some(net_config) = &self.configuration.network {
            self.network = Some(network::create(self.driver.as_ref(), &hypervisor, &self.identifier, net_config).await?);
        }

        let mounts = self.prepare_mounts()?;
        let domain_template = std::fs::read_to_string(&self.configuration.domain.configuration)?;
        let network_name = match &self.network {
            Some(handle) => Some(self.driver.network_name(handle).await?),
            None => None,
        };
        let xml = xml::domain_xml(&self.identifier, &domain_template, &self.configuration.disk.image_path, network_name.as_deref())?;
        let xml = xml::add_filesystem_mounts(&xml, &mounts)?;
        let domain = self.driver.define_domain(&hypervisor, &xml).await?;
        self.domain = Some(domain);

        Ok(())
    }
}

#[async_trait::async_trait]
impl Resources for LxcResources {
    async fn allocate(&mut self) -> CoreResult<()> {
        match self.allocate_inner().await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.deallocate().await;
                Err(err)
            }
        }
    }

    async fn deallocate(&mut self) {
        if let Some(domain) = self.domain.take() {
            if let Err(err) = self.driver.domain_destroy(&domain).await {
                tracing::warn!(identifier = %self.identifier, error = %err, "unable to destroy domain");
            }
            if let Err(err) = self.driver.domain_undefine(&domain).await {
                tracing::warn!(identifier = %self.identifier, error = %err, "unable to undefine domain");
            }
        }
        for mount_point in self.mount_points.drain(..) {
            if mount_point.exists() {
                if let Err(err) = std::fs::remove_dir_all(&mount_point) {
                    tracing::warn!(identifier = %self.identifier, error = %err, "unable to remove the shared folder");
                }
            }
        }
        if let Some(network) = self.network.take() {
            if let Err(err) = self.driver.network_destroy(&network).await {
                tracing::warn!(identifier = %self.identifier, error = %err, "unable to destroy network");
            }
        }
        if let Some(hypervisor) = self.hypervisor.take() {
            if let Err(err) = self.driver.close(&hypervisor).await {
                tracing::warn!(identifier = %self.identifier, error = %err, "unable to close hypervisor connection");
            }
        }
    }

    fn hypervisor(&self) -> CoreResult<&HypervisorHandle> {
        self.hypervisor.as_ref().ok_or_else(|| CoreError::ResourceUnavailable("hypervisor".into()))
    }

    fn domain(&self) -> CoreResult<&DomainHandle> {
        self.domain.as_ref().ok_or_else(|| CoreError::ResourceUnavailable("domain".into()))
    }

    fn network(&self) -> CoreResult<Option<&NetworkHandle>> {
        Ok(self.network.as_ref())
    }

    fn storage_pool(&self) -> CoreResult<Option<&crate::driver::PoolHandle>> {
        Ok(None)
    }

    fn driver(&self) -> &Arc<dyn HypervisorDriver> {
        &self.driver
    }
}
