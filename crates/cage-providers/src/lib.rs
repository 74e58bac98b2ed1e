// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Image-provider resolution policy (§4.2) and concrete Glance-like,
//! S3-like, libvirt-pool, and bare-path providers.

#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod checksum;
pub mod glance;
pub mod libvirt_pool;
pub mod path;
pub mod policy;
pub mod pool;
pub mod s3;

pub use glance::{GlanceClient, GlanceConfiguration, GlanceProvider, HttpGlanceClient, ImageMetadata};
pub use libvirt_pool::{LibvirtPoolConfiguration, LibvirtPoolProvider};
pub use path::PathProvider;
pub use pool::{LibvirtPoolBackend, PoolRefresher};
pub use s3::{HttpS3Client, LibvirtPoolRefreshConfig, ObjectMetadata, S3Client, S3Configuration, S3Provider};
