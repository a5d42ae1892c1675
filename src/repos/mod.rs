//! RepositoryManager: the configured model repositories, resolved to
//! repository plugins at construction.
pub mod git;
pub mod integrated;
pub mod local;
pub mod package_index;

use std::{collections::BTreeMap, sync::Arc};
use model_plugin::{ModelRepository, PluginConfig};
use tracing::info;

use crate::{
    error::{Result, RuntimeError},
    plugins::PluginRegistry,
};

pub struct RepositoryManager {
    repos: BTreeMap<String, Arc<dyn ModelRepository>>,
}

impl RepositoryManager {
    /// Load a plugin for every configured repository. Any failure is a
    /// configuration error naming the repository.
    pub fn new(registry: &PluginRegistry, configs: &BTreeMap<String, PluginConfig>) -> Result<Self> {
        let mut repos = BTreeMap::new();
        for (name, config) in configs {
            let repo = registry.load_plugin::<dyn ModelRepository>(name, config).map_err(|e| match e {
                RuntimeError::PluginNotAvailable { protocol, .. } => RuntimeError::Config(format!(
                    "repository `{name}`: no repository plugin for protocol `{protocol}`"
                )),
                RuntimeError::PluginConformance { .. } | RuntimeError::RuntimeValidation(_) => e,
                other => RuntimeError::Config(format!("repository `{name}`: {other}")),
            })?;
            info!(repository = %name, protocol = %config.protocol, "repository configured");
            repos.insert(name.clone(), Arc::from(repo));
        }
        Ok(Self { repos })
    }

    pub fn get_repository(&self, name: &str) -> Result<Arc<dyn ModelRepository>> {
        self.repos
            .get(name)
            .cloned()
            .ok_or_else(|| RuntimeError::Config(format!("model repository `{name}` is not configured")))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.repos.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> PluginRegistry {
        let registry = PluginRegistry::new();
        registry.register_core_plugins().unwrap();
        registry
    }

    #[test]
    fn configured_repositories_resolve() {
        let configs = BTreeMap::from([
            ("builtin".to_string(), PluginConfig::new("integrated")),
            ("models".to_string(), PluginConfig::new("local").with_property("repoUrl", "/srv/models")),
        ]);
        let manager = RepositoryManager::new(&registry(), &configs).unwrap();
        assert!(manager.get_repository("models").is_ok());
        assert_eq!(manager.names().collect::<Vec<_>>(), vec!["builtin", "models"]);

        let err = manager.get_repository("other").err().unwrap();
        assert!(matches!(err, RuntimeError::Config(ref m) if m.contains("other")));
    }

    #[test]
    fn bad_configuration_names_the_repository() {
        let unknown = BTreeMap::from([("remote".to_string(), PluginConfig::new("svn"))]);
        let err = RepositoryManager::new(&registry(), &unknown).err().unwrap();
        assert!(matches!(err, RuntimeError::Config(ref m) if m.contains("remote") && m.contains("svn")));

        let incomplete = BTreeMap::from([("models".to_string(), PluginConfig::new("local"))]);
        let err = RepositoryManager::new(&registry(), &incomplete).err().unwrap();
        assert!(matches!(err, RuntimeError::Config(ref m) if m.contains("models") && m.contains("repoUrl")));
    }
}
