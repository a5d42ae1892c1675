//! ModelLoader: checks model packages out into per-scope scratch
//! directories, loads their classes under namespace shims and caches the
//! results for the lifetime of the scope.
pub mod checkout_key;
pub mod scan;

use std::{
    collections::HashMap,
    fs, io,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
};
use dashmap::DashMap;
use model_plugin::{ModelDescriptor, PluginError};
use tracing::{debug, info, instrument, warn};

pub use checkout_key::checkout_key;
pub use scan::{scan_model, ModelDefinition, ParameterDefinition, TableDefinition};

use crate::{
    error::{Result, RuntimeError},
    guard::ensure_host_code,
    repos::RepositoryManager,
    shim::{ScriptClass, ShimLoader},
};

/// Kind every loadable model class must declare.
pub const MODEL_KIND: &str = "model";

/// Identity of a model within a scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClassKey {
    repository: String,
    path: Option<String>,
    version: String,
    entry_point: String,
}

impl From<&ModelDescriptor> for ClassKey {
    fn from(d: &ModelDescriptor) -> Self {
        Self {
            repository: d.repository.clone(),
            path: d.path.clone(),
            version: d.version.clone(),
            entry_point: d.entry_point.clone(),
        }
    }
}

#[derive(Default)]
struct ScopeCaches {
    classes: HashMap<ClassKey, Arc<ScriptClass>>,
    checkouts: HashMap<String, PathBuf>,
}

struct ModelScope {
    scratch: PathBuf,
    caches: Mutex<ScopeCaches>,
}

impl ModelScope {
    fn lock(&self) -> MutexGuard<'_, ScopeCaches> {
        self.caches.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct ModelLoader {
    scratch_dir: PathBuf,
    repositories: Arc<RepositoryManager>,
    shims: Arc<ShimLoader>,
    scopes: DashMap<String, Arc<ModelScope>>,
}

impl ModelLoader {
    pub fn new(scratch_dir: impl Into<PathBuf>, repositories: Arc<RepositoryManager>, shims: Arc<ShimLoader>) -> Self {
        Self { scratch_dir: scratch_dir.into(), repositories, shims, scopes: DashMap::new() }
    }

    pub fn shims(&self) -> &Arc<ShimLoader> {
        &self.shims
    }

    /// Scratch directory of a live scope.
    pub fn scope_dir(&self, scope_id: &str) -> Option<PathBuf> {
        self.scopes.get(scope_id).map(|s| s.scratch.clone())
    }

    /// Start a scope with its own scratch directory. Scope ids are single use:
    /// creating one whose directory exists already fails.
    #[instrument(skip(self))]
    pub fn create_scope(&self, scope_id: &str) -> Result<()> {
        checkout_key::validate_segment(scope_id)?;
        fs::create_dir_all(&self.scratch_dir).map_err(|e| {
            RuntimeError::Startup(format!("scratch directory `{}`: {e}", self.scratch_dir.display()))
        })?;

        let scratch = self.scratch_dir.join(scope_id);
        fs::create_dir(&scratch).map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => RuntimeError::Startup(format!("model scope `{scope_id}` already exists")),
            _ => RuntimeError::Startup(format!("cannot create scope directory `{}`: {e}", scratch.display())),
        })?;

        self.scopes.insert(
            scope_id.to_string(),
            Arc::new(ModelScope { scratch, caches: Mutex::new(ScopeCaches::default()) }),
        );
        info!(scope = scope_id, "model scope created");
        Ok(())
    }

    /// Drop a scope's caches. Its scratch files are left in place.
    #[instrument(skip(self))]
    pub fn destroy_scope(&self, scope_id: &str) -> Result<()> {
        self.scopes
            .remove(scope_id)
            .ok_or_else(|| RuntimeError::Startup(format!("model scope `{scope_id}` does not exist")))?;
        info!(scope = scope_id, "model scope destroyed");
        Ok(())
    }

    fn scope(&self, scope_id: &str) -> Result<Arc<ModelScope>> {
        self.scopes
            .get(scope_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| RuntimeError::Startup(format!("model scope `{scope_id}` does not exist")))
    }

    /// Load the class a descriptor names, checking it out first if needed.
    /// Repeated loads of the same model in a scope return the cached class.
    #[instrument(skip(self, descriptor), fields(entry_point = %descriptor.entry_point, version = %descriptor.version))]
    pub fn load_model_class(&self, scope_id: &str, descriptor: &ModelDescriptor) -> Result<Arc<ScriptClass>> {
        ensure_host_code("load_model_class")?;
        let scope = self.scope(scope_id)?;
        let mut caches = scope.lock();

        // 1) already loaded in this scope
        let class_key = ClassKey::from(descriptor);
        if let Some(class) = caches.classes.get(&class_key) {
            debug!(scope = scope_id, "model class cache hit");
            return Ok(Arc::clone(class));
        }

        // 2) checkout key, validated before any path is built from it
        let package = descriptor.package();
        let key = checkout_key(&package)?;
        let repository = self.repositories.get_repository(&descriptor.repository)?;
        let repo_err = |e: PluginError| RuntimeError::Repository {
            repository: descriptor.repository.clone(),
            version: descriptor.version.clone(),
            reason: e.to_string(),
        };

        // 3) reuse or perform the checkout
        let package_path = match caches.checkouts.get(&key) {
            Some(dir) => {
                debug!(scope = scope_id, checkout = %key, "checkout cache hit");
                repository.get_checkout_path(&package, dir).map_err(repo_err)?
            }
            None => {
                let dir = scope.scratch.join(&key);
                fs::create_dir(&dir).map_err(|e| {
                    RuntimeError::Internal(format!("cannot create checkout directory `{}`: {e}", dir.display()))
                })?;
                match repository.checkout(&package, &dir) {
                    Ok(path) => {
                        info!(scope = scope_id, %package, checkout = %key, "package checked out");
                        caches.checkouts.insert(key, dir);
                        path
                    }
                    Err(e) => {
                        if let Err(cleanup) = fs::remove_dir_all(&dir) {
                            warn!(dir = %dir.display(), error = %cleanup, "could not remove failed checkout");
                        }
                        return Err(repo_err(e));
                    }
                }
            }
        };

        // 4) the package directory's shim, shared by every load from it
        let shim = match package_path {
            None => None,
            Some(path) => Some(self.shims.create_shim(&path).map_err(|e| match e {
                RuntimeError::Internal(reason) => repo_err(PluginError::NotFound(reason)),
                other => other,
            })?),
        };

        // 5) load and check the class under the shim
        let (module, class_name) = descriptor.split_entry_point().ok_or_else(|| {
            RuntimeError::model_load(&descriptor.entry_point, "", "entry point must have the form `module.Class`")
        })?;
        let class = self
            .shims
            .use_shim(shim.as_ref(), || self.shims.load_class(module, class_name, MODEL_KIND))?;

        caches.classes.insert(class_key, Arc::clone(&class));
        info!(scope = scope_id, class = %class.qualified_name(), "model class loaded");
        Ok(class)
    }

    /// Read a class's declarations. The class is not instantiated.
    pub fn scan_model(&self, stub: &ModelDescriptor, class: &ScriptClass) -> Result<ModelDefinition> {
        scan::scan_model(stub, class)
    }
}
