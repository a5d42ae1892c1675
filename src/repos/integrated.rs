use std::path::{Path, PathBuf};
use model_plugin::{ModelPackage, ModelRepository, PluginClass, PluginError};

/// Model code that is already importable from the host module path.
#[derive(Debug, Default)]
pub struct IntegratedRepository;

impl IntegratedRepository {
    pub fn plugin_class() -> PluginClass<dyn ModelRepository> {
        PluginClass::new("IntegratedRepository", &[], |_| Ok(Box::new(IntegratedRepository) as Box<dyn ModelRepository>))
    }
}

impl ModelRepository for IntegratedRepository {
    fn checkout(&self, _package: &ModelPackage, _checkout_dir: &Path) -> Result<Option<PathBuf>, PluginError> {
        Ok(None)
    }

    fn get_checkout_path(&self, _package: &ModelPackage, _checkout_dir: &Path) -> Result<Option<PathBuf>, PluginError> {
        Ok(None)
    }
}
