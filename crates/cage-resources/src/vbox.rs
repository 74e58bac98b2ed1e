// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! VirtualBox driver specialization (§4.3): minimal — a domain with a
//! single file-backed disk, no network, no cloning. Grounded on
//! `original_source/see/context/resources/vbox.py`'s `VBoxResources`. The
//! original falls back from a plain `undefine` to a flags-based one
//! (`VIR_DOMAIN_UNDEFINE_SNAPSHOTS_METADATA`) on failure; `HypervisorDriver`
//! abstracts both behind a single `domain_undefine` call, so that fallback
//! collapses into the driver's own responsibility rather than this crate's.

use crate::driver::{DomainHandle, HypervisorDriver, HypervisorHandle};
use crate::resources::{Resources, ResourcesConfig};
use crate::xml;
use cage_core::{CoreError, CoreResult};
use std::sync::Arc;

pub struct VboxResources {
    identifier: String,
    configuration: ResourcesConfig,
    driver: Arc<dyn HypervisorDriver>,
    hypervisor: Option<HypervisorHandle>,
    domain: Option<DomainHandle>,
}

impl VboxResources {
    pub fn new(identifier: impl Into<String>, configuration: ResourcesConfig, driver: Arc<dyn HypervisorDriver>) -> Self {
        Self { identifier: identifier.into(), configuration, driver, hypervisor: None, domain: None }
    }

    async fn allocate_inner(&mut self) -> CoreResult<()> {
        let hypervisor = self.driver.open(&self.configuration.hypervisor).await?;
        self.hypervisor = Some(hypervisor.clone());

        let domain_template = std::fs::read_to_string(&self.configuration.domain.configuration)?;
        let xml = xml::domain_xml(&self.identifier, &domain_template, &self.configuration.disk.image_path, None)?;
        let domain = self.driver.define_domain(&hypervisor, &xml).await?;
        self.domain = Some(domain);

        Ok(())
    }
}

#[async_trait::async_trait]
impl Resources for VboxResources {
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

    fn network(&self) -> CoreResult<Option<&crate::driver::NetworkHandle>> {
        Ok(None)
    }

    fn storage_pool(&self) -> CoreResult<Option<&crate::driver::PoolHandle>> {
        Ok(None)
    }

    fn driver(&self) -> &Arc<dyn HypervisorDriver> {
        &self.driver
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::MockDriver;
    use crate::resources::{DiskConfig, DomainConfig};
    use std::io::Write;

    #[tokio::test]
    async fn allocate_then_deallocate_leaves_no_handles() {
        let dir = tempfile::tempdir().unwrap();
        let domain_path = dir.path().join("domain.xml");
        let mut file = std::fs::File::create(&domain_path).unwrap();
        writeln!(file, "<domain type='vbox'></domain>").unwrap();
        let disk = dir.path().join("image.vdi");
        std::fs::write(&disk, b"disk").unwrap();

        let driver: Arc<dyn HypervisorDriver> = Arc::new(MockDriver::new());
        let config = ResourcesConfig {
            hypervisor: "vbox:///session".into(),
            domain: DomainConfig { configuration: domain_path },
            disk: DiskConfig { image_path: disk, clone: None },
            network: None,
            filesystem: Vec::new(),
        };
        let mut resources = VboxResources::new("env-vbox-1", config, driver);
        resources.allocate().await.unwrap();
        assert!(resources.domain().is_ok());
        resources.deallocate().await;
        assert!(resources.domain().is_err());
    }
}
