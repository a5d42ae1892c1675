//! ModelRuntime: builds the registry, managers, loader and executor from a
//! [`RuntimeConfig`].
use std::{fs, path::Path, sync::Arc};
use model_plugin::ModelDescriptor;
use tracing::info;
use uuid::Uuid;

use crate::{
    config::RuntimeConfig,
    error::{Result, RuntimeError},
    executor::{JobDescriptor, JobExecutor, JobResult},
    loader::{ModelDefinition, ModelLoader},
    plugins::{PluginPackage, PluginRegistry},
    repos::RepositoryManager,
    shim::ShimLoader,
    storage::StorageManager,
};

pub struct ModelRuntime {
    config: RuntimeConfig,
    registry: Arc<PluginRegistry>,
    repositories: Arc<RepositoryManager>,
    storage: Arc<StorageManager>,
    loader: Arc<ModelLoader>,
    executor: JobExecutor,
}

impl ModelRuntime {
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        Self::with_plugin_packages(config, &[])
    }

    /// `available` are the plugin packages linked into this binary. The
    /// extension package is registered when present; packages named in the
    /// config must be among them.
    pub fn with_plugin_packages(config: RuntimeConfig, available: &[PluginPackage]) -> Result<Self> {
        let registry = PluginRegistry::new();
        registry.register_core_plugins()?;
        registry.register_extension_package(available)?;
        for name in &config.plugin_packages {
            let package = available
                .iter()
                .find(|p| &p.name == name)
                .ok_or_else(|| RuntimeError::Config(format!("plugin package `{name}` is not available")))?;
            registry.register_plugin_package(package)?;
        }
        let registry = Arc::new(registry);

        let repositories = Arc::new(RepositoryManager::new(&registry, &config.repositories)?);
        let storage = Arc::new(StorageManager::new(&registry, &config.storage)?);
        let shims = Arc::new(ShimLoader::new(config.host_module_paths.clone(), &config.guard));
        let loader = Arc::new(ModelLoader::new(config.scratch_dir.clone(), Arc::clone(&repositories), shims));
        let executor = JobExecutor::new(Arc::clone(&loader), Arc::clone(&storage));

        info!(scratch = %config.scratch_dir.display(), "model runtime started");
        Ok(Self { config, registry, repositories, storage, loader, executor })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn repositories(&self) -> &Arc<RepositoryManager> {
        &self.repositories
    }

    pub fn storage(&self) -> &Arc<StorageManager> {
        &self.storage
    }

    pub fn loader(&self) -> &Arc<ModelLoader> {
        &self.loader
    }

    pub fn run_job(&self, job: &JobDescriptor) -> Result<JobResult> {
        self.executor.run_job(job)
    }

    /// Load a model in a throwaway scope and return its declarations.
    pub fn scan(&self, descriptor: &ModelDescriptor) -> Result<ModelDefinition> {
        let scope = format!("scan-{}", Uuid::new_v4());
        self.loader.create_scope(&scope)?;
        let result = self
            .loader
            .load_model_class(&scope, descriptor)
            .and_then(|class| self.loader.scan_model(descriptor, &class));
        self.loader.destroy_scope(&scope)?;
        result
    }
}

/// Read a job descriptor from YAML (or JSON, which is valid YAML).
pub fn load_job(path: &Path) -> Result<JobDescriptor> {
    let text = fs::read_to_string(path)
        .map_err(|e| RuntimeError::Config(format!("cannot read job `{}`: {e}", path.display())))?;
    serde_yaml_bw::from_str(&text).map_err(|e| RuntimeError::Config(format!("invalid job `{}`: {e}", path.display())))
}
