// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The backward-compatible bare-path shortcut (§4.2, last paragraph):
//! resolves to the configured path verbatim, performing no I/O of its own.
//! `ImageDescriptor::Path` bypasses the registry entirely and reaches this
//! behavior without a named provider at all; `PathProvider` exists so the
//! same behavior is also reachable explicitly via
//! `{"provider": "path", "uri": "..."}`.

use async_trait::async_trait;
use cage_core::{CoreResult, ImageProvider};
use serde_json::Value;
use std::path::PathBuf;

#[derive(Debug, Default)]
pub struct PathProvider;

#[async_trait]
impl ImageProvider for PathProvider {
    async fn resolve(&self, uri: &str, _provider_configuration: &Value) -> CoreResult<PathBuf> {
        Ok(PathBuf::from(uri))
    }
}
