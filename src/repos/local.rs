use std::path::{Path, PathBuf};
use model_plugin::{plugin::PARAM_PROPERTIES, ModelPackage, ModelRepository, PluginClass, PluginError};
use tracing::debug;

/// Property naming the directory that holds the repository's packages.
pub const PROP_REPO_URL: &str = "repoUrl";

/// A directory on the local filesystem. Nothing is copied: the checkout
/// path points straight into the repository.
#[derive(Debug)]
pub struct LocalRepository {
    root: PathBuf,
}

impl LocalRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn plugin_class() -> PluginClass<dyn ModelRepository> {
        PluginClass::new("LocalRepository", &[PARAM_PROPERTIES], |args| {
            let root = args.require_property(PROP_REPO_URL)?;
            let root = root.strip_prefix("file://").unwrap_or(&root);
            Ok(Box::new(LocalRepository::new(root)) as Box<dyn ModelRepository>)
        })
    }

    fn package_dir(&self, package: &ModelPackage) -> PathBuf {
        match &package.path {
            Some(path) => self.root.join(path),
            None => self.root.clone(),
        }
    }
}

impl ModelRepository for LocalRepository {
    fn checkout(&self, package: &ModelPackage, _checkout_dir: &Path) -> Result<Option<PathBuf>, PluginError> {
        let dir = self.package_dir(package);
        if !dir.is_dir() {
            return Err(PluginError::NotFound(format!("package directory `{}`", dir.display())));
        }
        debug!(%package, dir = %dir.display(), "local checkout");
        Ok(Some(dir))
    }

    fn get_checkout_path(&self, package: &ModelPackage, _checkout_dir: &Path) -> Result<Option<PathBuf>, PluginError> {
        Ok(Some(self.package_dir(package)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model_plugin::ModelDescriptor;

    #[test]
    fn checkout_points_into_the_repository() {
        let repo_dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(repo_dir.path().join("models/src")).unwrap();
        let repo = LocalRepository::new(repo_dir.path());

        let package = ModelDescriptor::new("local", "models", "1.0", "m.M").with_path("models/src").package();
        let scratch = tempfile::tempdir().unwrap();
        let path = repo.checkout(&package, scratch.path()).unwrap().unwrap();
        assert_eq!(path, repo_dir.path().join("models/src"));
        assert_eq!(repo.get_checkout_path(&package, scratch.path()).unwrap(), Some(path));
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);

        let missing = ModelDescriptor::new("local", "models", "1.0", "m.M").with_path("nope").package();
        assert!(matches!(repo.checkout(&missing, scratch.path()), Err(PluginError::NotFound(_))));
    }
}
