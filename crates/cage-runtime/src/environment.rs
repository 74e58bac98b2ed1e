// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The Environment (§4.6): scoped acquisition of a full sandbox with
//! guaranteed release.
//!
//! Grounded on `original_source/see/environment.py`'s `Environment`. The
//! original's `_contextfactory` is a bare callable; here it's an async trait
//! so a context factory can itself perform async work (resolving an image
//! descriptor through `cage-providers::ProviderRegistry`, for instance)
//! before handing back an allocated [`Context`].

use crate::context::Context;
use crate::hooks::{HookManager, HookManagerConfig};
use cage_core::{CoreError, CoreResult, HookRegistry, Identifier};
use std::path::PathBuf;
use std::time::Duration;

/// Builds an allocated [`Context`] for a new environment. Implementations
/// typically resolve the environment's disk image via
/// `cage-providers::ProviderRegistry` and construct the driver-specific
/// `Resources` bundle (QEMU/LXC/VirtualBox) before allocating it.
#[async_trait::async_trait]
pub trait ContextFactory: Send + Sync {
    async fn build(&self, identifier: &Identifier) -> CoreResult<Context>;
}

/// Hook manager configuration, accepted either as an already-parsed value
/// or a path to a JSON file (§4.6's `load_configuration`).
#[derive(Debug, Clone)]
pub enum ConfigurationSource {
    Value(serde_json::Value),
    Path(PathBuf),
}

impl ConfigurationSource {
    fn load(&self) -> CoreResult<HookManagerConfig> {
        let value = match self {
            ConfigurationSource::Value(value) => value.clone(),
            ConfigurationSource::Path(path) => {
                let text = std::fs::read_to_string(path)?;
                serde_json::from_str(&text).map_err(|err| CoreError::Configuration(err.to_string()))?
            }
        };
        serde_json::from_value(value).map_err(|err| CoreError::Configuration(err.to_string()))
    }
}

/// Scoped acquisition of a full sandbox (one Context plus its Hooks) with
/// guaranteed release (§4.6).
pub struct Environment<F: ContextFactory> {
    identifier: Identifier,
    context_factory: F,
    configuration: ConfigurationSource,
    registry: HookRegistry,
    drain_timeout: Option<Duration>,
    allocated: Option<(Context, HookManager)>,
}

impl<F: ContextFactory> Environment<F> {
    pub fn new(context_factory: F, configuration: ConfigurationSource, registry: HookRegistry) -> Self {
        Self::with_identifier(Identifier::generate(), context_factory, configuration, registry)
    }

    pub fn with_identifier(
        identifier: Identifier,
        context_factory: F,
        configuration: ConfigurationSource,
        registry: HookRegistry,
    ) -> Self {
        Self { identifier, context_factory, configuration, registry, drain_timeout: None, allocated: None }
    }

    /// Bounds how long `deallocate` waits for outstanding asynchronous
    /// handlers to drain before tearing down resources. `None` (the
    /// default) matches the original's behavior of never waiting.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = Some(timeout);
        self
    }

    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    /// Returns the Context, failing `not-allocated` outside the allocated
    /// state.
    pub fn context(&self) -> CoreResult<&Context> {
        self.allocated.as_ref().map(|(context, _)| context).ok_or(CoreError::NotAllocated)
    }

    /// Loads configuration, calls the context factory (which internally
    /// allocates Resources), constructs the Hook Manager, and loads hooks.
    pub async fn allocate(&mut self) -> CoreResult<()> {
        tracing::debug!(identifier = %self.identifier, "allocating environment");
        let config = self.configuration.load()?;
        let context = self.context_factory.build(&self.identifier).await?;
        let hooks = HookManager::load(&self.identifier, &config, context.observable(), &self.registry);
        self.allocated = Some((context, hooks));
        tracing::debug!(identifier = %self.identifier, "environment successfully allocated");
        Ok(())
    }

    /// Cleans hooks, then cleans the context; each step is individually
    /// fault-isolated so a failure in one does not skip the other.
    /// Idempotent: calling this when not allocated is a no-op.
    pub async fn deallocate(&mut self) {
        tracing::debug!(identifier = %self.identifier, "deallocating environment");
        if let Some((mut context, mut hooks)) = self.allocated.take() {
            hooks.cleanup();
            context.deallocate(self.drain_timeout).await;
        }
        tracing::debug!(identifier = %self.identifier, "environment successfully deallocated");
    }
}

impl<F: ContextFactory> Drop for Environment<F> {
    /// Best-effort release for an `Environment` dropped without an explicit
    /// `deallocate` call (§4.6: "exiting always deallocates regardless of
    /// normal or exceptional exit"). `deallocate` is async, so this blocks
    /// on it synchronously rather than leaking the driver handles.
    fn drop(&mut self) {
        if self.allocated.is_none() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tokio::task::block_in_place(|| handle.block_on(self.deallocate()));
            }
            Err(_) => {
                tracing::warn!(
                    identifier = %self.identifier,
                    "environment dropped without an explicit deallocate and no tokio runtime is available; driver handles may leak"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cage_resources::driver::mock::MockDriver;
    use cage_resources::driver::HypervisorDriver;
    use cage_resources::{DiskConfig, DomainConfig, LxcResources, Resources, ResourcesConfig};
    use std::io::Write;
    use std::sync::Arc;

    struct MockContextFactory {
        driver: Arc<MockDriver>,
        domain_template: PathBuf,
    }

    #[async_trait::async_trait]
    impl ContextFactory for MockContextFactory {
        async fn build(&self, identifier: &Identifier) -> CoreResult<Context> {
            let config = ResourcesConfig {
                hypervisor: "lxc:///".into(),
                domain: DomainConfig { configuration: self.domain_template.clone() },
                disk: DiskConfig { image_path: PathBuf::new(), clone: None },
                network: None,
                filesystem: Vec::new(),
            };
            let dyn_driver: Arc<dyn HypervisorDriver> = self.driver.clone();
            let mut resources = LxcResources::new(identifier.as_str(), config, dyn_driver);
            resources.allocate().await?;
            Ok(Context::new(identifier.clone(), Box::new(resources)))
        }
    }

    fn domain_template(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("domain.xml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "<domain type='lxc'></domain>").unwrap();
        path
    }

    #[tokio::test]
    async fn context_is_unavailable_before_allocate() {
        let dir = tempfile::tempdir().unwrap();
        let factory = MockContextFactory { driver: Arc::new(MockDriver::new()), domain_template: domain_template(&dir) };
        let env = Environment::new(factory, ConfigurationSource::Value(serde_json::json!({})), HookRegistry::new());
        assert!(matches!(env.context(), Err(CoreError::NotAllocated)));
    }

    #[tokio::test]
    async fn allocate_then_deallocate_leaves_no_driver_handles() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(MockDriver::new());
        let factory = MockContextFactory { driver: driver.clone(), domain_template: domain_template(&dir) };
        let mut env = Environment::new(factory, ConfigurationSource::Value(serde_json::json!({})), HookRegistry::new());

        env.allocate().await.unwrap();
        assert!(env.context().is_ok());

        env.deallocate().await;
        assert!(matches!(env.context(), Err(CoreError::NotAllocated)));
        assert!(driver.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn drop_without_explicit_deallocate_releases_driver_handles() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(MockDriver::new());
        let factory = MockContextFactory { driver: driver.clone(), domain_template: domain_template(&dir) };
        let mut env = Environment::new(factory, ConfigurationSource::Value(serde_json::json!({})), HookRegistry::new());

        env.allocate().await.unwrap();
        assert!(!driver.is_empty());

        drop(env);
        assert!(driver.is_empty());
    }

    #[tokio::test]
    async fn deallocate_without_allocate_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let factory = MockContextFactory { driver: Arc::new(MockDriver::new()), domain_template: domain_template(&dir) };
        let mut env = Environment::new(factory, ConfigurationSource::Value(serde_json::json!({})), HookRegistry::new());
        env.deallocate().await;
    }

    #[tokio::test]
    async fn hooks_load_from_configuration_at_allocate_time() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(MockDriver::new());
        let factory = MockContextFactory { driver, domain_template: domain_template(&dir) };

        let registry = HookRegistry::new();
        let cleaned = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let cleaned2 = cleaned.clone();
        registry.register(
            "test.Hook",
            Arc::new(move |_params| {
                struct CountingHook(Arc<std::sync::atomic::AtomicUsize>);
                impl cage_core::Hook for CountingHook {
                    fn cleanup(&mut self) -> Result<(), CoreError> {
                        self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        Ok(())
                    }
                }
                Ok(Box::new(CountingHook(cleaned2.clone())) as Box<dyn cage_core::Hook>)
            }),
        );

        let config = serde_json::json!({"hooks": [{"name": "test.Hook"}]});
        let mut env = Environment::new(factory, ConfigurationSource::Value(config), registry);
        env.allocate().await.unwrap();
        env.deallocate().await;
        assert_eq!(cleaned.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn configuration_from_path_loads_correctly() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(MockDriver::new());
        let factory = MockContextFactory { driver, domain_template: domain_template(&dir) };

        let config_path = dir.path().join("hooks.json");
        std::fs::write(&config_path, serde_json::json!({"hooks": []}).to_string()).unwrap();

        let mut env = Environment::new(factory, ConfigurationSource::Path(config_path), HookRegistry::new());
        env.allocate().await.unwrap();
        assert!(env.context().is_ok());
        env.deallocate().await;
    }
}
