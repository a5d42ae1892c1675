//! Namespace shims: isolated module namespaces for model code checked out
//! from different repositories or versions.
//!
//! Each shim owns a root directory and a unique id, and a root never has more
//! than one shim: asking again for the same directory returns the existing
//! shim together with the modules already loaded under it. Modules loaded under a
//! shim are stored under `modelrt.shim._<id>.<dotted name>`, so two versions
//! of the same package never collide. While a shim is active on a thread,
//! raw imports (`import "pkg.mod"` with no module context) resolve inside it;
//! imports made from a module always stay in the shim that module came from.

mod class;
mod resolver;

use std::{
    fmt,
    marker::PhantomData,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use dashmap::mapref::entry::Entry;
use rhai::{Engine, Map};
use tracing::{debug, info, instrument};

pub use class::{ScriptClass, KIND_KEY, MODULE_KEY};
pub use resolver::{ImportError, LoadedModule};

use crate::{
    error::{Result, RuntimeError},
    guard::{self, GuardLimits},
};
use resolver::{ShimResolver, ShimState};

/// Prefix of every module loaded under a shim.
pub const SHIM_PREFIX: &str = "modelrt.shim._";
/// Prefix of modules loaded from the host module path.
pub const HOST_PREFIX: &str = "modelrt.host.";
pub const MODULE_EXTENSION: &str = "rhai";
/// File stem of a package initialiser: `pkg/mod.rhai`.
pub const PACKAGE_INIT: &str = "mod";

// process-wide so ids stay unique across loaders
static NEXT_SHIM_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShimNamespace {
    id: u64,
}

impl ShimNamespace {
    fn mint() -> Self {
        Self { id: NEXT_SHIM_ID.fetch_add(1, Ordering::Relaxed) }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Fully qualified name of `module` inside this shim.
    pub fn qualify(&self, module: &str) -> String {
        format!("{self}.{module}")
    }

    /// Split a qualified name into its shim and dotted module name.
    pub fn parse_qualified(name: &str) -> Option<(ShimNamespace, &str)> {
        let rest = name.strip_prefix(SHIM_PREFIX)?;
        let (id, module) = rest.split_once('.')?;
        Some((ShimNamespace { id: id.parse().ok()? }, module))
    }
}

impl fmt::Display for ShimNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SHIM_PREFIX}{}", self.id)
    }
}

/// Owns the model engine and every shim created on it.
pub struct ShimLoader {
    state: Arc<ShimState>,
    engine: Arc<Engine>,
}

impl ShimLoader {
    /// `host_paths` are searched, in order, for imports made with no shim active.
    pub fn new(host_paths: Vec<PathBuf>, limits: &GuardLimits) -> Self {
        let state = Arc::new(ShimState::new(host_paths));
        let mut engine = guard::sandboxed_engine(limits);
        engine.set_module_resolver(ShimResolver::new(Arc::clone(&state)));
        Self { state, engine: Arc::new(engine) }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// The shim rooted at `root`, minted on first use. The root must exist.
    #[instrument(skip(self), fields(root = %root.display()))]
    pub fn create_shim(&self, root: &Path) -> Result<ShimNamespace> {
        let root = root
            .canonicalize()
            .map_err(|e| RuntimeError::Internal(format!("shim root `{}`: {e}", root.display())))?;
        match self.state.shims_by_root.entry(root) {
            Entry::Occupied(existing) => {
                debug!(shim = %existing.get(), "shim reused");
                Ok(existing.get().clone())
            }
            Entry::Vacant(slot) => {
                let shim = ShimNamespace::mint();
                self.state.roots.insert(shim.clone(), slot.key().clone());
                info!(%shim, root = %slot.key().display(), "shim created");
                slot.insert(shim.clone());
                Ok(shim)
            }
        }
    }

    pub fn shim_root(&self, shim: &ShimNamespace) -> Option<PathBuf> {
        self.state.roots.get(shim).map(|r| r.value().clone())
    }

    /// The shim active on the calling thread, if any.
    pub fn active_shim(&self) -> Option<ShimNamespace> {
        self.state.active_shim()
    }

    /// Make `shim` the calling thread's active shim.
    pub fn activate_shim(&self, shim: &ShimNamespace) -> Result<()> {
        if !self.state.roots.contains_key(shim) {
            return Err(RuntimeError::Internal(format!("unknown shim `{shim}`")));
        }
        self.state.activate(shim).map_err(|current| {
            RuntimeError::Internal(format!("cannot activate `{shim}`: `{current}` is already active"))
        })?;
        debug!(%shim, "shim activated");
        Ok(())
    }

    /// Clear the active shim, forgetting every raw import made while it was active.
    pub fn deactivate_shim(&self) -> Result<()> {
        let (shim, purged) = self
            .state
            .deactivate()
            .ok_or_else(|| RuntimeError::Internal("no shim is active on this thread".into()))?;
        debug!(%shim, purged = purged.len(), "shim deactivated");
        Ok(())
    }

    /// Activate `shim` until the returned guard is dropped.
    pub fn activate(&self, shim: &ShimNamespace) -> Result<ShimActivation<'_>> {
        self.activate_shim(shim)?;
        Ok(ShimActivation { loader: self, _not_send: PhantomData })
    }

    /// Run `f` with `shim` active. `None` runs `f` against the host module path.
    pub fn use_shim<T>(&self, shim: Option<&ShimNamespace>, f: impl FnOnce() -> Result<T>) -> Result<T> {
        match shim {
            Some(shim) => {
                let _active = self.activate(shim)?;
                f()
            }
            None => f(),
        }
    }

    /// Run `f` with the shim for a checkout directory active.
    pub fn use_checkout<T>(&self, path: &Path, f: impl FnOnce(&ShimNamespace) -> Result<T>) -> Result<T> {
        let shim = self.create_shim(path)?;
        let _active = self.activate(&shim)?;
        f(&shim)
    }

    /// Import `module` in the current context: the active shim, or the host path.
    pub fn import_module(&self, module: &str) -> Result<Arc<LoadedModule>> {
        self.state
            .resolve(&self.engine, None, module)
            .map_err(|e| RuntimeError::model_load(module, "", e))
    }

    /// Import `module` and fetch `class` from it, checking it derives from `expected_kind`.
    #[instrument(skip(self))]
    pub fn load_class(&self, module: &str, class: &str, expected_kind: &str) -> Result<Arc<ScriptClass>> {
        let loaded = self
            .state
            .resolve(&self.engine, None, module)
            .map_err(|e| RuntimeError::model_load(module, class, e))?;
        self.class_from_module(&loaded, class, expected_kind)
    }

    /// Fetch `class` from an already loaded module.
    pub fn class_from_module(&self, loaded: &LoadedModule, class: &str, expected_kind: &str) -> Result<Arc<ScriptClass>> {
        let module = loaded.name();
        let value = loaded
            .module()
            .get_var(class)
            .ok_or_else(|| RuntimeError::model_load(module, class, "module does not define this class"))?;
        let members = value
            .try_cast::<Map>()
            .ok_or_else(|| RuntimeError::model_load(module, class, "exported value is not a class"))?;

        let script_class = ScriptClass::new(class, loaded.qualified_name(), members, Arc::clone(&self.engine));
        if !script_class.is_subtype_of(expected_kind) {
            return Err(RuntimeError::model_load(
                module,
                class,
                format!("class is not a `{expected_kind}` (kind: {:?})", script_class.kinds()),
            ));
        }
        debug!(class = %script_class.qualified_name(), "class loaded");
        Ok(Arc::new(script_class))
    }
}

impl fmt::Debug for ShimLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShimLoader").field("shims", &self.state.roots.len()).finish_non_exhaustive()
    }
}

/// Deactivates its shim on drop, including on unwind.
pub struct ShimActivation<'a> {
    loader: &'a ShimLoader,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ShimActivation<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.loader.deactivate_shim() {
            tracing::warn!(error = %e, "shim deactivation failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified_names_round_trip() {
        let shim = ShimNamespace { id: 12 };
        let qualified = shim.qualify("pkg.models");
        assert_eq!(qualified, "modelrt.shim._12.pkg.models");
        let (parsed, module) = ShimNamespace::parse_qualified(&qualified).unwrap();
        assert_eq!(parsed, shim);
        assert_eq!(module, "pkg.models");

        assert!(ShimNamespace::parse_qualified("modelrt.host.pkg").is_none());
        assert!(ShimNamespace::parse_qualified("modelrt.shim._x.pkg").is_none());
    }

    #[test]
    fn minted_ids_are_unique() {
        let a = ShimNamespace::mint();
        let b = ShimNamespace::mint();
        assert_ne!(a, b);
        assert_ne!(a.to_string(), b.to_string());
    }

    #[test]
    fn one_shim_per_root() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        let loader = ShimLoader::new(vec![], &GuardLimits::default());

        let a = loader.create_shim(first.path()).unwrap();
        assert_eq!(loader.create_shim(first.path()).unwrap(), a);
        assert_eq!(loader.create_shim(&first.path().join(".")).unwrap(), a);
        assert_ne!(loader.create_shim(second.path()).unwrap(), a);
        assert_eq!(loader.shim_root(&a), Some(first.path().canonicalize().unwrap()));
        assert!(loader.create_shim(&first.path().join("missing")).is_err());
    }

    #[test]
    fn activation_is_exclusive_and_scoped() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        let loader = ShimLoader::new(vec![], &GuardLimits::default());
        let a = loader.create_shim(first.path()).unwrap();
        let b = loader.create_shim(second.path()).unwrap();

        {
            let _active = loader.activate(&a).unwrap();
            assert_eq!(loader.active_shim(), Some(a.clone()));
            assert!(loader.activate_shim(&b).is_err());
        }
        assert_eq!(loader.active_shim(), None);
        assert!(loader.deactivate_shim().is_err());
    }
}
