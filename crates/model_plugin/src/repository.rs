use std::path::{Path, PathBuf};

use crate::{package::ModelPackage, plugin::PluginError};

/// A source of model code.
///
/// Implementations are registered with the plugin registry under one or more
/// protocol names and constructed from repository configuration.
pub trait ModelRepository: Send + Sync {
    /// Materialize `package` into `checkout_dir`, which the caller created
    /// fresh and empty. Returns the directory holding the importable module
    /// root, or `None` when the code is already on the host module path.
    fn checkout(&self, package: &ModelPackage, checkout_dir: &Path) -> Result<Option<PathBuf>, PluginError>;

    /// Where `checkout` would place the module root for `package`. Pure: must
    /// not touch the filesystem or the network.
    fn get_checkout_path(&self, package: &ModelPackage, checkout_dir: &Path) -> Result<Option<PathBuf>, PluginError>;
}
