// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `HypervisorDriver` — the seam between the in-scope `Resources`
//! choreography (§4.3) and the out-of-scope concrete hypervisor library.
//!
//! A production embedder implements this trait against a real hypervisor
//! (e.g. via the `virt` crate's libvirt bindings); [`mock`] ships a fully
//! functional in-process implementation used by every test in this
//! workspace and by any embedder exercising the framework without one.

use cage_core::{CoreError, CoreResult};
use std::path::{Path, PathBuf};

/// Back-end domain state, as queried from the hypervisor. Maps directly to
/// the rows of the transition map in §4.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DomainState {
    Running,
    Paused,
    #[default]
    Shutoff,
    Shutdown,
    Crashed,
    Suspended,
    NoState,
    Blocked,
}

/// Opaque handle to a defined domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DomainHandle(pub String);

/// Opaque handle to a created virtual network.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NetworkHandle(pub String);

/// Opaque handle to a storage pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolHandle(pub String);

/// A single entry from a network's DHCP lease table (§4.4's address
/// derivation fallback).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpLease {
    pub mac_address: String,
    pub ipv4_address: Option<std::net::Ipv4Addr>,
    pub ipv6_address: Option<std::net::Ipv6Addr>,
}

/// The hypervisor connection, as returned by `open`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HypervisorHandle(pub String);

/// Translates the `Resources` allocation contract into concrete back-end
/// calls. Every method mirrors a libvirt operation the original source
/// calls directly (`open`, `defineXML`, domain lifecycle, storage pool and
/// network CRUD, volume cloning).
#[async_trait::async_trait]
pub trait HypervisorDriver: Send + Sync {
    async fn open(&self, uri: &str) -> CoreResult<HypervisorHandle>;
    async fn close(&self, hypervisor: &HypervisorHandle) -> CoreResult<()>;

    async fn define_domain(&self, hypervisor: &HypervisorHandle, xml: &str) -> CoreResult<DomainHandle>;
    async fn domain_state(&self, domain: &DomainHandle) -> CoreResult<DomainState>;
    async fn domain_create(&self, domain: &DomainHandle) -> CoreResult<()>;
    async fn domain_pause(&self, domain: &DomainHandle) -> CoreResult<()>;
    async fn domain_resume(&self, domain: &DomainHandle) -> CoreResult<()>;
    async fn domain_shutdown(&self, domain: &DomainHandle) -> CoreResult<()>;
    async fn domain_reboot(&self, domain: &DomainHandle) -> CoreResult<()>;
    async fn domain_destroy(&self, domain: &DomainHandle) -> CoreResult<()>;
    async fn domain_undefine(&self, domain: &DomainHandle) -> CoreResult<()>;
    async fn domain_mac_address(&self, domain: &DomainHandle) -> CoreResult<Option<String>>;
    async fn domain_network_name(&self, domain: &DomainHandle) -> CoreResult<Option<String>>;

    async fn storage_pool_create(&self, hypervisor: &HypervisorHandle, identifier: &str, path: &Path) -> CoreResult<PoolHandle>;
    async fn storage_pool_lookup_by_path(&self, hypervisor: &HypervisorHandle, path: &Path) -> CoreResult<Option<PoolHandle>>;
    async fn storage_pool_path(&self, pool: &PoolHandle) -> CoreResult<PathBuf>;
    async fn storage_pool_destroy(&self, pool: &PoolHandle) -> CoreResult<()>;

    async fn network_create(&self, hypervisor: &HypervisorHandle, xml: &str) -> CoreResult<NetworkHandle>;
    async fn network_lookup_by_name(&self, hypervisor: &HypervisorHandle, name: &str) -> CoreResult<Option<NetworkHandle>>;
    async fn network_name(&self, network: &NetworkHandle) -> CoreResult<String>;
    async fn network_destroy(&self, network: &NetworkHandle) -> CoreResult<()>;
    async fn active_network_subnets(&self, hypervisor: &HypervisorHandle) -> CoreResult<Vec<ipnet::Ipv4Net>>;

    /// The network's current DHCP lease table, used as the address-lookup
    /// fallback when the hypervisor's own lease query is unavailable (§4.4).
    async fn network_dhcp_leases(&self, network: &NetworkHandle) -> CoreResult<Vec<DhcpLease>>;

    /// Clones `source_path` into `pool`, naming the new volume after
    /// `identifier`; returns the path of the new volume.
    async fn volume_clone(
        &self,
        pool: &PoolHandle,
        source_path: &Path,
        identifier: &str,
        copy_on_write: bool,
    ) -> CoreResult<PathBuf>;
}

pub mod mock {
    //! In-process reference `HypervisorDriver`. No real virtualization;
    //! state lives entirely in memory and on a scratch directory for
    //! "volumes", which are empty files standing in for disk images.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct DomainRecord {
        state: DomainState,
        network_name: Option<String>,
        mac_address: Option<String>,
        /// Test hook: when set, `domain_shutdown` becomes a no-op instead of
        /// flipping the domain to SHUTOFF, so shutdown-polling tests can
        /// exercise the timeout branch.
        shutdown_disabled: bool,
    }

    struct NetworkRecord {
        name: String,
        subnet: Option<ipnet::Ipv4Net>,
        leases: Vec<DhcpLease>,
    }

    struct PoolRecord {
        path: PathBuf,
    }

    /// Deterministic, in-memory `HypervisorDriver`. Every allocated handle
    /// is tracked so tests can assert on leaks after `deallocate`.
    #[derive(Default)]
    pub struct MockDriver {
        counter: AtomicU64,
        hypervisors: Mutex<HashMap<String, ()>>,
        domains: Mutex<HashMap<String, DomainRecord>>,
        networks: Mutex<HashMap<String, NetworkRecord>>,
        pools: Mutex<HashMap<String, PoolRecord>>,
        /// Initial state assigned to a domain the moment it's defined.
        /// Tests use this to construct a context that starts RUNNING, for
        /// example, without going through `domain_create` first.
        pub initial_domain_state: Mutex<DomainState>,
    }

    impl MockDriver {
        pub fn new() -> Self {
            Self { initial_domain_state: Mutex::new(DomainState::Shutoff), ..Default::default() }
        }

        fn next_id(&self, prefix: &str) -> String {
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            format!("{prefix}-{n}")
        }

        /// Test hook: forces a domain directly into a state, bypassing the
        /// lifecycle verbs (used to set up scenarios that start RUNNING).
        pub fn set_domain_state(&self, domain: &DomainHandle, state: DomainState) {
            if let Some(record) = self.domains.lock().get_mut(&domain.0) {
                record.state = state;
            }
        }

        /// Test hook: seeds a network's DHCP lease table.
        pub fn set_dhcp_leases(&self, network: &NetworkHandle, leases: Vec<DhcpLease>) {
            if let Some(record) = self.networks.lock().get_mut(&network.0) {
                record.leases = leases;
            }
        }

        /// Test hook: makes `domain_shutdown` a no-op for `domain`, so a
        /// shutdown-timeout scenario can be exercised without the mock
        /// racing straight to SHUTOFF.
        pub fn disable_shutdown(&self, domain: &DomainHandle) {
            if let Some(record) = self.domains.lock().get_mut(&domain.0) {
                record.shutdown_disabled = true;
            }
        }

        pub fn is_empty(&self) -> bool {
            self.hypervisors.lock().is_empty()
                && self.domains.lock().is_empty()
                && self.networks.lock().is_empty()
                && self.pools.lock().is_empty()
        }
    }

    #[async_trait::async_trait]
    impl HypervisorDriver for MockDriver {
        async fn open(&self, _uri: &str) -> CoreResult<HypervisorHandle> {
            let id = self.next_id("hv");
            self.hypervisors.lock().insert(id.clone(), ());
            Ok(HypervisorHandle(id))
        }

        async fn close(&self, hypervisor: &HypervisorHandle) -> CoreResult<()> {
            self.hypervisors
                .lock()
                .remove(&hypervisor.0)
                .ok_or_else(|| CoreError::ResourceUnavailable("hypervisor".into()))?;
            Ok(())
        }

        async fn define_domain(&self, _hypervisor: &HypervisorHandle, xml: &str) -> CoreResult<DomainHandle> {
            let id = self.next_id("dom");
            let network_name = crate::xml::extract_interface_network(xml);
            let mac_address = Some(format!("52:54:00:{:02x}:{:02x}:{:02x}", id.len() % 256, 0, 1));
            let state = *self.initial_domain_state.lock();
            self.domains.lock().insert(id.clone(), DomainRecord { state, network_name, mac_address, shutdown_disabled: false });
            Ok(DomainHandle(id))
        }

        async fn domain_state(&self, domain: &DomainHandle) -> CoreResult<DomainState> {
            self.domains
                .lock()
                .get(&domain.0)
                .map(|r| r.state)
                .ok_or_else(|| CoreError::ResourceUnavailable("domain".into()))
        }

        async fn domain_create(&self, domain: &DomainHandle) -> CoreResult<()> {
            let mut domains = self.domains.lock();
            let record = domains.get_mut(&domain.0).ok_or_else(|| CoreError::ResourceUnavailable("domain".into()))?;
            record.state = DomainState::Running;
            Ok(())
        }

        async fn domain_pause(&self, domain: &DomainHandle) -> CoreResult<()> {
            let mut domains = self.domains.lock();
            let record = domains.get_mut(&domain.0).ok_or_else(|| CoreError::ResourceUnavailable("domain".into()))?;
            record.state = DomainState::Paused;
            Ok(())
        }

        async fn domain_resume(&self, domain: &DomainHandle) -> CoreResult<()> {
            let mut domains = self.domains.lock();
            let record = domains.get_mut(&domain.0).ok_or_else(|| CoreError::ResourceUnavailable("domain".into()))?;
            record.state = DomainState::Running;
            Ok(())
        }

        async fn domain_shutdown(&self, domain: &DomainHandle) -> CoreResult<()> {
            let mut domains = self.domains.lock();
            let record = domains.get_mut(&domain.0).ok_or_else(|| CoreError::ResourceUnavailable("domain".into()))?;
            if !record.shutdown_disabled {
                record.state = DomainState::Shutoff;
            }
            Ok(())
        }

        async fn domain_reboot(&self, domain: &DomainHandle) -> CoreResult<()> {
            let domains = self.domains.lock();
            domains.get(&domain.0).ok_or_else(|| CoreError::ResourceUnavailable("domain".into()))?;
            Ok(())
        }

        async fn domain_destroy(&self, domain: &DomainHandle) -> CoreResult<()> {
            let mut domains = self.domains.lock();
            let record = domains.get_mut(&domain.0).ok_or_else(|| CoreError::ResourceUnavailable("domain".into()))?;
            record.state = DomainState::Shutoff;
            Ok(())
        }

        async fn domain_undefine(&self, domain: &DomainHandle) -> CoreResult<()> {
            self.domains.lock().remove(&domain.0).ok_or_else(|| CoreError::ResourceUnavailable("domain".into()))?;
            Ok(())
        }

        async fn domain_mac_address(&self, domain: &DomainHandle) -> CoreResult<Option<String>> {
            Ok(self.domains.lock().get(&domain.0).and_then(|r| r.mac_address.clone()))
        }

        async fn domain_network_name(&self, domain: &DomainHandle) -> CoreResult<Option<String>> {
            Ok(self.domains.lock().get(&domain.0).and_then(|r| r.network_name.clone()))
        }

        async fn storage_pool_create(&self, _hypervisor: &HypervisorHandle, identifier: &str, path: &Path) -> CoreResult<PoolHandle> {
            let target = path.join(identifier);
            std::fs::create_dir_all(&target)?;
            let id = self.next_id("pool");
            self.pools.lock().insert(id.clone(), PoolRecord { path: target });
            Ok(PoolHandle(id))
        }

        async fn storage_pool_lookup_by_path(&self, _hypervisor: &HypervisorHandle, path: &Path) -> CoreResult<Option<PoolHandle>> {
            let pools = self.pools.lock();
            Ok(pools.iter().find(|(_, record)| path.starts_with(&record.path)).map(|(id, _)| PoolHandle(id.clone())))
        }

        async fn storage_pool_path(&self, pool: &PoolHandle) -> CoreResult<PathBuf> {
            self.pools.lock().get(&pool.0).map(|r| r.path.clone()).ok_or_else(|| CoreError::ResourceUnavailable("storage pool".into()))
        }

        async fn storage_pool_destroy(&self, pool: &PoolHandle) -> CoreResult<()> {
            let record = self.pools.lock().remove(&pool.0).ok_or_else(|| CoreError::ResourceUnavailable("storage pool".into()))?;
            if record.path.exists() {
                std::fs::remove_dir_all(&record.path)?;
            }
            Ok(())
        }

        async fn network_create(&self, _hypervisor: &HypervisorHandle, xml: &str) -> CoreResult<NetworkHandle> {
            let id = self.next_id("net");
            let name = crate::xml::extract_name(xml).unwrap_or_else(|| id.clone());
            let subnet = crate::xml::extract_ip_subnet(xml);
            self.networks.lock().insert(id.clone(), NetworkRecord { name, subnet, leases: Vec::new() });
            Ok(NetworkHandle(id))
        }

        async fn network_lookup_by_name(&self, _hypervisor: &HypervisorHandle, name: &str) -> CoreResult<Option<NetworkHandle>> {
            let networks = self.networks.lock();
            Ok(networks.iter().find(|(_, record)| record.name == name).map(|(id, _)| NetworkHandle(id.clone())))
        }

        async fn network_name(&self, network: &NetworkHandle) -> CoreResult<String> {
            self.networks.lock().get(&network.0).map(|r| r.name.clone()).ok_or_else(|| CoreError::ResourceUnavailable("network".into()))
        }

        async fn network_destroy(&self, network: &NetworkHandle) -> CoreResult<()> {
            self.networks.lock().remove(&network.0).ok_or_else(|| CoreError::ResourceUnavailable("network".into()))?;
            Ok(())
        }

        async fn active_network_subnets(&self, _hypervisor: &HypervisorHandle) -> CoreResult<Vec<ipnet::Ipv4Net>> {
            Ok(self.networks.lock().values().filter_map(|r| r.subnet).collect())
        }

        async fn network_dhcp_leases(&self, network: &NetworkHandle) -> CoreResult<Vec<DhcpLease>> {
            self.networks.lock().get(&network.0).map(|r| r.leases.clone()).ok_or_else(|| CoreError::ResourceUnavailable("network".into()))
        }

        async fn volume_clone(
            &self,
            pool: &PoolHandle,
            source_path: &Path,
            identifier: &str,
            _copy_on_write: bool,
        ) -> CoreResult<PathBuf> {
            let pool_path = self.storage_pool_path(pool).await?;
            let target = pool_path.join(format!("{identifier}.qcow2"));
            if source_path.exists() {
                std::fs::copy(source_path, &target)?;
            } else {
                std::fs::write(&target, [])?;
            }
            Ok(target)
        }
    }
}
