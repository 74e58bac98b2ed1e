// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Image-provider contract (§3, §4.2) and the image descriptor shape.

use crate::error::CoreError;
use crate::registry::Registry;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// How an environment's image is specified in configuration (§6).
///
/// A bare string is accepted as a path, for backward compatibility with
/// configurations written before providers existed (§4.2's "backward
/// compatible shortcut").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImageDescriptor {
    Path(PathBuf),
    Provider {
        provider: String,
        uri: String,
        #[serde(default)]
        provider_configuration: serde_json::Value,
    },
}

/// A provider resolves an `ImageDescriptor` to a local, ready-to-use path,
/// downloading or refreshing it first if required (§4.2 steps 1-7).
#[async_trait::async_trait]
pub trait ImageProvider: Send + Sync {
    /// Resolves `uri` to a local path, fetching or refreshing it under
    /// `provider_configuration` as needed. Idempotent: a second call against
    /// an up-to-date local copy returns immediately without re-downloading.
    async fn resolve(&self, uri: &str, provider_configuration: &serde_json::Value) -> Result<PathBuf, CoreError>;
}

/// Process-wide registry mapping a provider name (as it appears in the
/// `provider` field of an `ImageDescriptor`) to a constructed instance.
/// Concrete providers register themselves at startup, the same way hooks do
/// via `HookRegistry`.
pub type ProviderRegistry = Registry<Arc<dyn ImageProvider>>;
