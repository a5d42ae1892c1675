//! The core plugin package: built-in repository and storage backends.
use model_plugin::{DataStorage, FileStorage, ModelRepository};

use super::registry::{PluginModule, PluginPackage, PluginRegistry};
use crate::{
    error::Result,
    repos::{git::GitRepository, integrated::IntegratedRepository, local::LocalRepository, package_index::PackageIndexRepository},
    storage::{data::LocalDataStorage, local::LocalFileStorage},
};

pub const CORE_PACKAGE: &str = "modelrt.core";

pub fn core_package() -> PluginPackage {
    PluginPackage::new(
        CORE_PACKAGE,
        vec![
            PluginModule::new("modelrt.core.repositories", register_repositories),
            PluginModule::new("modelrt.core.storage", register_storage),
        ],
    )
}

fn register_repositories(registry: &PluginRegistry) -> Result<()> {
    registry.register_plugin::<dyn ModelRepository>(IntegratedRepository::plugin_class(), &["integrated"])?;
    registry.register_plugin::<dyn ModelRepository>(LocalRepository::plugin_class(), &["local"])?;
    registry.register_plugin::<dyn ModelRepository>(GitRepository::plugin_class(), &["git"])?;
    registry.register_plugin::<dyn ModelRepository>(PackageIndexRepository::plugin_class(), &["package-index", "index"])?;
    Ok(())
}

fn register_storage(registry: &PluginRegistry) -> Result<()> {
    registry.register_plugin::<dyn FileStorage>(LocalFileStorage::plugin_class(), &["local", "file"])?;
    registry.register_plugin::<dyn DataStorage>(LocalDataStorage::plugin_class(), &["local", "file"])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_plugins_cover_every_built_in_protocol() {
        let registry = PluginRegistry::new();
        assert_eq!(registry.register_core_plugins().unwrap(), 2);

        for protocol in ["integrated", "local", "git", "package-index"] {
            assert!(registry.is_plugin_available::<dyn ModelRepository>(protocol).unwrap(), "{protocol}");
        }
        assert!(registry.is_plugin_available::<dyn FileStorage>("LOCAL").unwrap());
        assert!(registry.is_plugin_available::<dyn DataStorage>("local").unwrap());
        assert!(!registry.is_plugin_available::<dyn FileStorage>("git").unwrap());
    }
}
