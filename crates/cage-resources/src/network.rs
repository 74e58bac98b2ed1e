// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Dynamic network address allocation (§4.3), grounded on
//! `original_source/see/context/resources/network.py`'s `generate_address`/
//! `address_lookup`.

use crate::driver::{HypervisorDriver, HypervisorHandle, NetworkHandle};
use crate::xml::network_xml;
use cage_core::{CoreError, CoreResult};
use rand::seq::SliceRandom;
use serde::Deserialize;

pub const MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_NETWORK_XML: &str = "<network><forward mode=\"nat\"/></network>";

#[derive(Debug, Clone, Deserialize)]
pub struct DynamicAddressConfig {
    pub ipv4: std::net::Ipv4Addr,
    pub prefix: u8,
    pub subnet_prefix: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub configuration: Option<std::path::PathBuf>,
    pub dynamic_address: Option<DynamicAddressConfig>,
}

/// Generates the full candidate pool of `/subnet_prefix` subnets inside the
/// `ipv4/prefix` supernet.
pub fn candidate_subnets(config: &DynamicAddressConfig) -> CoreResult<Vec<ipnet::Ipv4Net>> {
    let supernet = ipnet::Ipv4Net::new(config.ipv4, config.prefix)
        .map_err(|e| CoreError::Configuration(e.to_string()))?;
    Ok(supernet.subnets(config.subnet_prefix).map_err(|e| CoreError::Configuration(e.to_string()))?.collect())
}

/// Picks a subnet from `candidates` that isn't in `active`, at random.
/// Fails `address-exhausted` once `candidates` has none left to offer.
pub fn pick_address(candidates: &[ipnet::Ipv4Net], active: &[ipnet::Ipv4Net]) -> CoreResult<ipnet::Ipv4Net> {
    let available: Vec<_> = candidates.iter().filter(|c| !active.contains(c)).copied().collect();
    available.choose(&mut rand::thread_rng()).copied().ok_or(CoreError::AddressExhausted { attempts: 0 })
}

/// Creates a virtual network according to `config`, retrying on a race
/// against another environment claiming the same dynamically generated
/// address, up to [`MAX_ATTEMPTS`] times.
pub async fn create(
    driver: &dyn HypervisorDriver,
    hypervisor: &HypervisorHandle,
    identifier: &str,
    config: &NetworkConfig,
) -> CoreResult<NetworkHandle> {
    let base_xml = match &config.configuration {
        Some(path) => std::fs::read_to_string(path)?,
        None => DEFAULT_NETWORK_XML.to_string(),
    };

    if config.configuration.is_none() && config.dynamic_address.is_none() {
        return Err(CoreError::Configuration(
            "either configuration or dynamic_address must be specified".into(),
        ));
    }

    let Some(dynamic) = &config.dynamic_address else {
        let xml = network_xml(identifier, &base_xml, None)?;
        return driver.network_create(hypervisor, &xml).await;
    };

    let candidates = candidate_subnets(dynamic)?;
    let mut last_error = None;
    for _ in 0..MAX_ATTEMPTS {
        let active = driver.active_network_subnets(hypervisor).await?;
        let address = match pick_address(&candidates, &active) {
            Ok(address) => address,
            Err(_) => return Err(CoreError::AddressExhausted { attempts: MAX_ATTEMPTS }),
        };
        let xml = network_xml(identifier, &base_xml, Some(address))?;
        match driver.network_create(hypervisor, &xml).await {
            Ok(handle) => return Ok(handle),
            Err(err) => last_error = Some(err),
        }
    }
    Err(last_error.unwrap_or(CoreError::AddressExhausted { attempts: MAX_ATTEMPTS }))
}
