// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! S3-like image provider (§4.2): queries object metadata (ETag,
//! last-modified), applies the shared freshness/`.part`-sibling policy, and
//! verifies the multipart-ETag checksum scheme. Grounded on
//! `original_source/see/image_providers/s3.py`'s `S3Provider`. As in
//! `glance.rs`, the object-store surface is abstracted behind [`S3Client`] so
//! the policy is testable without a live S3-compatible endpoint.

use crate::checksum;
use crate::pool::PoolRefresher;
use crate::policy;
use async_trait::async_trait;
use cage_core::{CoreError, CoreResult, ImageProvider};
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

#[derive(Debug, Clone, Deserialize)]
pub struct S3Configuration {
    pub bucket_name: String,
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub auth: Value,
    #[serde(default)]
    pub libvirt_pool: Option<LibvirtPoolRefreshConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LibvirtPoolRefreshConfig {
    #[serde(default = "default_hypervisor")]
    pub hypervisor: String,
    pub name: String,
}

fn default_hypervisor() -> String {
    "qemu:///system".to_string()
}

#[derive(Debug, Clone)]
pub struct ObjectMetadata {
    pub etag: String,
    pub last_modified: SystemTime,
}

/// The subset of an S3-compatible object store's API the provider needs.
#[async_trait]
pub trait S3Client: Send + Sync {
    /// Head-style lookup; errors (missing key, unreachable endpoint) are all
    /// treated alike by the caller, matching `boto3`'s `ClientError` catch-all.
    async fn head(&self, bucket: &str, key: &str) -> CoreResult<ObjectMetadata>;
    /// Prior object versions' ETags, newest-`last_modified`-first.
    async fn list_version_etags(&self, bucket: &str, key: &str) -> CoreResult<Vec<String>>;
    async fn download(&self, bucket: &str, key: &str, dest: &Path) -> CoreResult<()>;
}

pub struct S3Provider<C: S3Client> {
    client: Arc<C>,
    pool_refresher: Option<Arc<dyn PoolRefresher>>,
}

impl<C: S3Client> S3Provider<C> {
    pub fn new(client: C) -> Self {
        Self { client: Arc::new(client), pool_refresher: None }
    }

    pub fn with_pool_refresher(mut self, refresher: Arc<dyn PoolRefresher>) -> Self {
        self.pool_refresher = Some(refresher);
        self
    }
}

#[async_trait]
impl<C: S3Client> ImageProvider for S3Provider<C> {
    async fn resolve(&self, _uri: &str, provider_configuration: &Value) -> Result<PathBuf, CoreError> {
        let config: S3Configuration =
            serde_json::from_value(provider_configuration.clone()).map_err(|e| CoreError::Configuration(e.to_string()))?;

        let metadata = match self.client.head(&config.bucket_name, &config.name).await {
            Ok(metadata) => metadata,
            Err(_) if config.path.is_file() => return Ok(config.path),
            Err(_) => return Err(CoreError::ImageNotFound(config.name.clone())),
        };

        if policy::is_fresh(&config.path, metadata.last_modified) {
            return Ok(config.path);
        }

        let target = if config.path.is_file() { config.path.clone() } else { config.path.join(etag_filename(&metadata.etag)) };

        let part = policy::part_path(&target);
        if part.exists() {
            let versions = self.client.list_version_etags(&config.bucket_name, &config.name).await?;
            let candidates: Vec<String> = versions.iter().map(|etag| etag_filename(etag)).collect();
            return policy::find_existing_sibling(&target, &candidates).ok_or(CoreError::NoViableImage);
        }

        if target.exists() {
            return Ok(target);
        }

        let etag = metadata.etag.clone();
        let client = Arc::clone(&self.client);
        let bucket = config.bucket_name.clone();
        let key = config.name.clone();
        let resolved = policy::download_verify_rename(&target, |part| async move { client.download(&bucket, &key, &part).await }, |path| checksum::verify(path, &etag)).await?;

        if let (Some(refresher), Some(pool)) = (&self.pool_refresher, &config.libvirt_pool) {
            refresher.refresh(&pool.hypervisor, &pool.name).await?;
        }
        Ok(resolved)
    }
}

fn etag_filename(etag: &str) -> String {
    etag.trim_matches('"').to_string()
}

/// Production `S3Client` backed by plain HTTP calls against an S3-compatible
/// virtual-hosted-style endpoint; `auth` carries an optional bearer token the
/// way `boto3.Session` credentials would in the original.
pub struct HttpS3Client {
    http: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpS3Client {
    pub fn new(endpoint: impl Into<String>, auth: &Value) -> Self {
        let token = auth.get("token").and_then(Value::as_str).map(str::to_owned);
        Self { http: reqwest::Client::new(), endpoint: endpoint.into(), token }
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

#[async_trait]
impl S3Client for HttpS3Client {
    async fn head(&self, bucket: &str, key: &str) -> CoreResult<ObjectMetadata> {
        let url = format!("{}/{bucket}/{key}", self.endpoint);
        let response = self.request(reqwest::Method::HEAD, &url).send().await.map_err(|e| CoreError::OperationFailed(e.to_string()))?;
        let etag = response.headers().get(reqwest::header::ETAG).and_then(|v| v.to_str().ok()).ok_or_else(|| CoreError::ImageNotFound(key.to_string()))?.to_string();
        let last_modified = response
            .headers()
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(|raw| chrono::DateTime::parse_from_rfc2822(raw).ok())
            .map(|dt| SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(dt.timestamp() as u64))
            .ok_or_else(|| CoreError::OperationFailed("missing Last-Modified header".into()))?;
        Ok(ObjectMetadata { etag: etag_filename(&etag), last_modified })
    }

    async fn list_version_etags(&self, bucket: &str, key: &str) -> CoreResult<Vec<String>> {
        let url = format!("{}/{bucket}?versions&prefix={key}", self.endpoint);
        let body = self.request(reqwest::Method::GET, &url).send().await.map_err(|e| CoreError::OperationFailed(e.to_string()))?.text().await.map_err(|e| CoreError::OperationFailed(e.to_string()))?;
        Ok(body.lines().filter_map(|line| line.strip_prefix("etag:").map(str::to_owned)).collect())
    }

    async fn download(&self, bucket: &str, key: &str, dest: &Path) -> CoreResult<()> {
        let url = format!("{}/{bucket}/{key}", self.endpoint);
        let bytes = self.request(reqwest::Method::GET, &url).send().await.map_err(|e| CoreError::OperationFailed(e.to_string()))?.bytes().await.map_err(|e| CoreError::OperationFailed(e.to_string()))?;
        tokio::fs::write(dest, &bytes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeClient {
        metadata: Mutex<Option<ObjectMetadata>>,
        versions: Mutex<Vec<String>>,
        payload: &'static [u8],
    }

    #[async_trait]
    impl S3Client for FakeClient {
        async fn head(&self, _bucket: &str, _key: &str) -> CoreResult<ObjectMetadata> {
            self.metadata.lock().unwrap().clone().ok_or(CoreError::NoViableImage)
        }

        async fn list_version_etags(&self, _bucket: &str, _key: &str) -> CoreResult<Vec<String>> {
            Ok(self.versions.lock().unwrap().clone())
        }

        async fn download(&self, _bucket: &str, _key: &str, dest: &Path) -> CoreResult<()> {
            std::fs::write(dest, self.payload)?;
            Ok(())
        }
    }

    fn etag_for(bytes: &[u8]) -> String {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, bytes).unwrap();
        checksum::multipart_etag(&path).unwrap()
    }

    #[tokio::test]
    async fn downloads_into_directory_using_etag_as_filename() {
        let dir = tempfile::tempdir().unwrap();
        let client = FakeClient { metadata: Mutex::new(Some(ObjectMetadata { etag: etag_for(b"payload"), last_modified: SystemTime::now() - std::time::Duration::from_secs(60) })), versions: Mutex::new(Vec::new()), payload: b"payload" };
        let etag = client.metadata.lock().unwrap().clone().unwrap().etag;
        let provider = S3Provider::new(client);
        let config = serde_json::json!({"bucket_name": "images", "name": "base", "path": dir.path()});
        let resolved = provider.resolve("base", &config).await.unwrap();
        assert_eq!(resolved, dir.path().join(&etag));
        assert_eq!(std::fs::read(&resolved).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn falls_back_to_existing_file_when_head_fails() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("image.qcow2");
        std::fs::write(&target, b"already here").unwrap();
        let client = FakeClient { metadata: Mutex::new(None), versions: Mutex::new(Vec::new()), payload: b"" };
        let provider = S3Provider::new(client);
        let config = serde_json::json!({"bucket_name": "images", "name": "base", "path": target});
        let resolved = provider.resolve("base", &config).await.unwrap();
        assert_eq!(std::fs::read(&resolved).unwrap(), b"already here");
    }

    #[tokio::test]
    async fn part_file_present_falls_back_to_older_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let new_etag = etag_for(b"new payload");
        let old_etag = etag_for(b"old payload");
        let older_path = dir.path().join(&old_etag);
        std::fs::write(&older_path, b"old payload").unwrap();
        std::fs::write(policy::part_path(&dir.path().join(&new_etag)), b"in flight").unwrap();

        let client = FakeClient { metadata: Mutex::new(Some(ObjectMetadata { etag: new_etag.clone(), last_modified: SystemTime::now() })), versions: Mutex::new(vec![new_etag.clone(), old_etag.clone()]), payload: b"new payload" };
        let provider = S3Provider::new(client);
        let config = serde_json::json!({"bucket_name": "images", "name": "base", "path": dir.path()});
        let resolved = provider.resolve("base", &config).await.unwrap();
        assert_eq!(resolved, older_path);
    }

    #[tokio::test]
    async fn refreshes_pool_after_successful_download_when_configured() {
        struct Recorder(Mutex<Vec<(String, String)>>);
        #[async_trait]
        impl PoolRefresher for Recorder {
            async fn refresh(&self, hypervisor: &str, pool_name: &str) -> CoreResult<()> {
                self.0.lock().unwrap().push((hypervisor.to_string(), pool_name.to_string()));
                Ok(())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let client = FakeClient { metadata: Mutex::new(Some(ObjectMetadata { etag: etag_for(b"payload"), last_modified: SystemTime::now() })), versions: Mutex::new(Vec::new()), payload: b"payload" };
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let provider = S3Provider::new(client).with_pool_refresher(recorder.clone());
        let config = serde_json::json!({
            "bucket_name": "images", "name": "base", "path": dir.path(),
            "libvirt_pool": {"hypervisor": "qemu:///system", "name": "images-pool"},
        });
        provider.resolve("base", &config).await.unwrap();
        assert_eq!(recorder.0.lock().unwrap().as_slice(), &[("qemu:///system".to_string(), "images-pool".to_string())]);
    }
}
