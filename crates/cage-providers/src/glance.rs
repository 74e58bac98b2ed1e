// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Glance-like image provider (§4.2): queries a remote metadata endpoint for
//! an image by name or id, compares freshness, downloads and verifies a
//! whole-file MD5. Grounded on
//! `original_source/see/image_providers/os_glance.py`'s `GlanceProvider`.
//! The HTTP/auth surface is abstracted behind [`GlanceClient`] so the
//! resolution policy is testable without a live Glance/Keystone deployment —
//! [`HttpGlanceClient`] is the `reqwest`-backed production implementation.

use crate::checksum;
use crate::policy;
use async_trait::async_trait;
use cage_core::{CoreError, CoreResult, ImageProvider};
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

#[derive(Debug, Clone, Deserialize)]
pub struct GlanceConfiguration {
    pub target_path: PathBuf,
    pub glance_url: String,
    #[serde(default)]
    pub os_auth: Value,
}

#[derive(Debug, Clone)]
pub struct ImageMetadata {
    pub id: String,
    pub updated_at: SystemTime,
    pub checksum: String,
}

/// The subset of Glance's image-listing and data-download API the provider
/// needs, factored out so tests can substitute an in-memory double.
#[async_trait]
pub trait GlanceClient: Send + Sync {
    /// The newest `active` image matching `uri` by id or name.
    async fn active_image(&self, uri: &str) -> CoreResult<ImageMetadata>;
    /// Non-active images matching `uri`, newest first — candidates for the
    /// "metadata lookup failed but a prior download already landed" fallback.
    async fn inactive_images(&self, uri: &str) -> CoreResult<Vec<ImageMetadata>>;
    async fn download(&self, id: &str, dest: &Path) -> CoreResult<()>;
}

pub struct GlanceProvider<C: GlanceClient> {
    client: Arc<C>,
}

impl<C: GlanceClient> GlanceProvider<C> {
    pub fn new(client: C) -> Self {
        Self { client: Arc::new(client) }
    }
}

#[async_trait]
impl<C: GlanceClient> ImageProvider for GlanceProvider<C> {
    async fn resolve(&self, uri: &str, provider_configuration: &Value) -> Result<PathBuf, CoreError> {
        let config: GlanceConfiguration =
            serde_json::from_value(provider_configuration.clone()).map_err(|e| CoreError::Configuration(e.to_string()))?;

        match self.client.active_image(uri).await {
            Ok(metadata) => {
                if policy::is_fresh(&config.target_path, metadata.updated_at) {
                    return Ok(config.target_path);
                }
                let target = policy::resolve_target_path(&config.target_path, &metadata.id);
                let client = Arc::clone(&self.client);
                let id = metadata.id.clone();
                let checksum = metadata.checksum.clone();
                policy::download_verify_rename(&target, |part| async move { client.download(&id, &part).await }, |path| checksum::verify(path, &checksum)).await
            }
            Err(CoreError::ImageNotFound(_)) => {
                if config.target_path.is_file() {
                    return Ok(config.target_path);
                }
                if config.target_path.is_dir() {
                    for candidate in self.client.inactive_images(uri).await? {
                        let path = config.target_path.join(&candidate.id);
                        if path.is_file() {
                            return Ok(path);
                        }
                    }
                }
                Err(CoreError::ImageNotFound(uri.to_string()))
            }
            Err(other) => Err(other),
        }
    }
}

/// Production `GlanceClient` backed by plain HTTP calls against a Glance v2
/// image API; authentication is a bearer token carried in `os_auth.token`
/// (Keystone's own authentication dance is out of scope, same as the rest of
/// this provider's upstream SDK integration).
pub struct HttpGlanceClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpGlanceClient {
    pub fn new(base_url: impl Into<String>, os_auth: &Value) -> Self {
        let token = os_auth.get("token").and_then(Value::as_str).map(str::to_owned);
        Self { http: reqwest::Client::new(), base_url: base_url.into(), token }
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let builder = self.http.get(url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GlanceImagesResponse {
    images: Vec<GlanceImage>,
}

#[derive(Debug, Deserialize)]
struct GlanceImage {
    id: String,
    name: Option<String>,
    status: String,
    updated_at: String,
    checksum: Option<String>,
}

impl GlanceImage {
    fn matches(&self, uri: &str) -> bool {
        self.id == uri || self.name.as_deref() == Some(uri)
    }

    fn parsed_updated_at(&self) -> CoreResult<SystemTime> {
        let naive = chrono::NaiveDateTime::parse_from_str(&self.updated_at, "%Y-%m-%dT%H:%M:%SZ")
            .map_err(|e| CoreError::OperationFailed(format!("invalid updated_at from glance: {e}")))?;
        Ok(SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(naive.and_utc().timestamp() as u64))
    }
}

#[async_trait]
impl GlanceClient for HttpGlanceClient {
    async fn active_image(&self, uri: &str) -> CoreResult<ImageMetadata> {
        let url = format!("{}/v2/images", self.base_url);
        let response: GlanceImagesResponse =
            self.request(&url).send().await.map_err(|e| CoreError::OperationFailed(e.to_string()))?.json().await.map_err(|e| CoreError::OperationFailed(e.to_string()))?;
        let mut matches: Vec<GlanceImage> = response.images.into_iter().filter(|image| image.matches(uri) && image.status == "active").collect();
        matches.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        let image = matches.into_iter().next().ok_or_else(|| CoreError::ImageNotFound(uri.to_string()))?;
        let updated_at = image.parsed_updated_at()?;
        Ok(ImageMetadata { id: image.id, updated_at, checksum: image.checksum.unwrap_or_default() })
    }

    async fn inactive_images(&self, uri: &str) -> CoreResult<Vec<ImageMetadata>> {
        let url = format!("{}/v2/images", self.base_url);
        let response: GlanceImagesResponse =
            self.request(&url).send().await.map_err(|e| CoreError::OperationFailed(e.to_string()))?.json().await.map_err(|e| CoreError::OperationFailed(e.to_string()))?;
        let mut matches: Vec<GlanceImage> = response.images.into_iter().filter(|image| image.matches(uri) && image.status != "active").collect();
        matches.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        matches.into_iter().map(|image| { let updated_at = image.parsed_updated_at()?; Ok(ImageMetadata { id: image.id, updated_at, checksum: image.checksum.unwrap_or_default() }) }).collect()
    }

    async fn download(&self, id: &str, dest: &Path) -> CoreResult<()> {
        let url = format!("{}/v2/images/{id}/file", self.base_url);
        let bytes = self.request(&url).send().await.map_err(|e| CoreError::OperationFailed(e.to_string()))?.bytes().await.map_err(|e| CoreError::OperationFailed(e.to_string()))?;
        tokio::fs::write(dest, &bytes).await?;
        Ok(())
    }
}
