// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Resource allocation contract, QEMU/LXC/VBox driver specializations, and
//! dynamic network addressing for the sandboxed execution environment
//! framework.

#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod driver;
pub mod lxc;
pub mod network;
pub mod qemu;
pub mod resources;
pub mod vbox;
pub mod xml;

pub use driver::{DhcpLease, DomainHandle, DomainState, HypervisorDriver, HypervisorHandle, NetworkHandle, PoolHandle};
pub use lxc::LxcResources;
pub use network::{DynamicAddressConfig, NetworkConfig};
pub use qemu::QemuResources;
pub use resources::{CloneConfig, DiskConfig, DomainConfig, LxcFilesystemConfig, Resources, ResourcesConfig};
pub use vbox::VboxResources;
