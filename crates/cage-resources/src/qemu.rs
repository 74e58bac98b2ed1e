// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! QEMU driver specialization (§4.3): supports disk cloning via COW backing
//! store or full copy. Grounded on
//! `original_source/see/context/resources/qemu.py`'s `QEMUResources`.

use crate::driver::{DomainHandle, HypervisorDriver, HypervisorHandle, NetworkHandle, PoolHandle};
use crate::network;
use crate::resources::{Resources, ResourcesConfig};
use crate::xml;
use cage_core::{CoreError, CoreResult};
use std::path::PathBuf;
use std::sync::Arc;

pub struct QemuResources {
    identifier: String,
    configuration: ResourcesConfig,
    driver: Arc<dyn HypervisorDriver>,
    hypervisor: Option<HypervisorHandle>,
    storage_pool: Option<PoolHandle>,
    owns_storage_pool: bool,
    network: Option<NetworkHandle>,
    domain: Option<DomainHandle>,
}

impl QemuResources {
    pub fn new(identifier: impl Into<String>, configuration: ResourcesConfig, driver: Arc<dyn HypervisorDriver>) -> Self {
        Self {
            identifier: identifier.into(),
            configuration,
            driver,
            hypervisor: None,
            storage_pool: None,
            owns_storage_pool: false,
            network: None,
            domain: None,
        }
    }

    async fn retrieve_pool(&mut self, hypervisor: &HypervisorHandle) -> CoreResult<()> {
        if let Some(clone) = &self.configuration.disk.clone {
            let pool = self.driver.storage_pool_create(hypervisor, &self.identifier, &clone.storage_pool_path).await?;
            self.storage_pool = Some(pool);
            self.owns_storage_pool = true;
        } else {
            self.storage_pool = self.driver.storage_pool_lookup_by_path(hypervisor, &self.configuration.disk.image_path).await?;
            self.owns_storage_pool = false;
        }
        Ok(())
    }

    async fn retrieve_disk_path(&mut self) -> CoreResult<PathBuf> {
        match &self.configuration.disk.clone {
            Some(clone) => {
                let pool = self.storage_pool.as_ref().ok_or_else(|| CoreError::ResourceUnavailable("storage pool".into()))?;
                self.driver.volume_clone(pool, &self.configuration.disk.image_path, &self.identifier, clone.copy_on_write).await
            }
            None => Ok(self.configuration.disk.image_path.clone()),
        }
    }

    async fn allocate_inner(&mut self) -> CoreResult<()> {
        let hypervisor = self.driver.open(&self.configuration.hypervisor).await?;
        self.hypervisor = Some(hypervisor.clone());

        self.retrieve_pool(&hypervisor).await?;

        if let Some(net_config) = &self.configuration.network {
            self.network = Some(network::create(self.driver.as_ref(), &hypervisor, &self.identifier, net_config).await?);
        }

        let disk_path = self.retrieve_disk_path().await?;
        let domain_template = std::fs::read_to_string(&self.configuration.domain.configuration)?;
        let network_name = match &self.network {
            Some(handle) => Some(self.driver.network_name(handle).await?),
            None => None,
        };
        let xml = xml::domain_xml(&self.identifier, &domain_template, &disk_path, network_name.as_deref())?;
        let domain = self.driver.define_domain(&hypervisor, &xml).await?;
        self.domain = Some(domain.clone());

        if self.network.is_none() {
            if let Some(name) = self.driver.domain_network_name(&domain).await? {
                self.network = self.driver.network_lookup_by_name(&hypervisor, &name).await?;
            }
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl Resources for QemuResources {
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
        if let Some(network) = self.network.take() {
            if let Err(err) = self.driver.network_destroy(&network).await {
                tracing::warn!(identifier = %self.identifier, error = %err, "unable to destroy network");
            }
        }
        if self.owns_storage_pool {
            if let Some(pool) = self.storage_pool.take() {
                if let Err(err) = self.driver.storage_pool_destroy(&pool).await {
                    tracing::warn!(identifier = %self.identifier, error = %err, "unable to destroy storage pool");
                }
            }
        } else {
            self.storage_pool = None;
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

    fn storage_pool(&self) -> CoreResult<Option<&PoolHandle>> {
        Ok(self.storage_pool.as_ref())
    }

    fn driver(&self) -> &Arc<dyn HypervisorDriver> {
        &self.driver
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::MockDriver;
    use crate::resources::{CloneConfig, DiskConfig, DomainConfig};
    use std::io::Write;

    fn write_domain_template(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("domain.xml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "<domain type='kvm'></domain>").unwrap();
        path
    }

    #[tokio::test]
    async fn allocate_then_deallocate_leaves_no_handles() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("base.qcow2");
        std::fs::write(&image, b"base-image").unwrap();
        let driver: Arc<dyn HypervisorDriver> = Arc::new(MockDriver::new());

        let config = ResourcesConfig {
            hypervisor: "qemu:///system".into(),
            domain: DomainConfig { configuration: write_domain_template(&dir) },
            disk: DiskConfig { image_path: image, clone: None },
            network: None,
            filesystem: Vec::new(),
        };
        let mut resources = QemuResources::new("env-1", config, driver.clone());
        resources.allocate().await.unwrap();
        assert!(resources.domain().is_ok());

        resources.deallocate().await;
        assert!(resources.domain().is_err());
    }

    #[tokio::test]
    async fn clone_config_creates_and_owns_a_storage_pool() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("base.qcow2");
        std::fs::write(&image, b"base-image").unwrap();
        let pool_dir = dir.path().join("pools");
        std::fs::create_dir_all(&pool_dir).unwrap();
        let driver: Arc<dyn HypervisorDriver> = Arc::new(MockDriver::new());

        let config = ResourcesConfig {
            hypervisor: "qemu:///system".into(),
            domain: DomainConfig { configuration: write_domain_template(&dir) },
            disk: DiskConfig {
                image_path: image,
                clone: Some(CloneConfig { storage_pool_path: pool_dir, copy_on_write: true }),
            },
            network: None,
            filesystem: Vec::new(),
        };
        let mut resources = QemuResources::new("env-2", config, driver);
        resources.allocate().await.unwrap();
        assert!(resources.storage_pool().unwrap().is_some());
        resources.deallocate().await;
        assert!(resources.storage_pool().unwrap().is_none());
    }

    #[tokio::test]
    async fn allocate_failure_rolls_back_partial_state() {
        let driver: Arc<dyn HypervisorDriver> = Arc::new(MockDriver::new());
        let config = ResourcesConfig {
            hypervisor: "qemu:///system".into(),
            domain: DomainConfig { configuration: PathBuf::from("/nonexistent/domain.xml") },
            disk: DiskConfig { image_path: PathBuf::from("/nonexistent/image.qcow2"), clone: None },
            network: None,
            filesystem: Vec::new(),
        };
        let mut resources = QemuResources::new("env-3", config, driver);
        let err = resources.allocate().await.unwrap_err();
        assert!(matches!(err, CoreError::Io(_)));
        assert!(resources.hypervisor().is_err());
    }
}
