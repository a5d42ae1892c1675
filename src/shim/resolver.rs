use std::{
    cell::RefCell,
    collections::HashMap,
    fs, io,
    path::PathBuf,
    sync::Arc,
};
use dashmap::DashMap;
use rhai::{Dynamic, Engine, EvalAltResult, Map, Module, ModuleResolver, Position, Scope};
use thiserror::Error;
use tracing::{debug, trace};

use crate::guard::ModelCodeGuard;
use super::{
    class::{KIND_KEY, MODULE_KEY},
    ShimNamespace, HOST_PREFIX, MODULE_EXTENSION, PACKAGE_INIT,
};

/// A compiled and evaluated module, keyed in the arena by `(shim, dotted name)`.
#[derive(Debug)]
pub struct LoadedModule {
    qualified_name: String,
    name: String,
    shim: Option<ShimNamespace>,
    path: PathBuf,
    is_package: bool,
    module: Arc<Module>,
}

impl LoadedModule {
    /// Globally unique name: the dotted name under its shim (or host) prefix.
    pub fn qualified_name(&self) -> &str {
        &self.qualified_name
    }

    /// Dotted name as written in import statements.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shim(&self) -> Option<&ShimNamespace> {
        self.shim.as_ref()
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub fn is_package(&self) -> bool {
        self.is_package
    }

    pub fn module(&self) -> &Arc<Module> {
        &self.module
    }
}

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("no module named `{0}`")]
    NotFound(String),

    #[error("invalid module name `{0}`")]
    InvalidName(String),

    #[error("relative import `{0}` {1}")]
    Relative(String, &'static str),

    #[error("circular import of `{0}`")]
    Circular(String),

    #[error("unknown shim `{0}`")]
    UnknownShim(String),

    #[error("cannot read `{}`: {source}", .path.display())]
    Io { path: PathBuf, #[source] source: io::Error },

    #[error("syntax error in `{}`: {message}", .path.display())]
    Syntax { path: PathBuf, message: String },

    #[error("error executing module `{name}`: {message}")]
    Execution { name: String, message: String },
}

/// Raw-name imports made while a shim is active on this thread.
struct Activation {
    owner: usize,
    shim: ShimNamespace,
    raw_modules: HashMap<String, Arc<LoadedModule>>,
}

thread_local! {
    static ACTIVE: RefCell<Option<Activation>> = const { RefCell::new(None) };
    // (qualified name, is package) of every module being evaluated
    static IMPORT_STACK: RefCell<Vec<(String, bool)>> = const { RefCell::new(Vec::new()) };
}

/// Pops the import stack even if module evaluation unwinds.
struct ImportFrame;

impl ImportFrame {
    fn push(qualified: &str, is_package: bool) -> Self {
        IMPORT_STACK.with(|s| s.borrow_mut().push((qualified.to_string(), is_package)));
        ImportFrame
    }
}

impl Drop for ImportFrame {
    fn drop(&mut self) {
        IMPORT_STACK.with(|s| {
            s.borrow_mut().pop();
        });
    }
}

/// Shared state behind a [`super::ShimLoader`] and its engine's module resolver.
pub(crate) struct ShimState {
    pub(crate) roots: DashMap<ShimNamespace, PathBuf>,
    pub(crate) shims_by_root: DashMap<PathBuf, ShimNamespace>,
    modules: DashMap<(Option<ShimNamespace>, String), Arc<LoadedModule>>,
    host_paths: Vec<PathBuf>,
}

impl ShimState {
    pub(crate) fn new(host_paths: Vec<PathBuf>) -> Self {
        Self { roots: DashMap::new(), shims_by_root: DashMap::new(), modules: DashMap::new(), host_paths }
    }

    fn owner(&self) -> usize {
        self as *const ShimState as usize
    }

    pub(crate) fn active_shim(&self) -> Option<ShimNamespace> {
        let owner = self.owner();
        ACTIVE.with(|a| {
            a.borrow()
                .as_ref()
                .filter(|act| act.owner == owner)
                .map(|act| act.shim.clone())
        })
    }

    /// Install `shim` as this thread's active shim. Fails if one is active already.
    pub(crate) fn activate(&self, shim: &ShimNamespace) -> Result<(), ShimNamespace> {
        let owner = self.owner();
        ACTIVE.with(|a| {
            let mut slot = a.borrow_mut();
            if let Some(current) = slot.as_ref() {
                return Err(current.shim.clone());
            }
            *slot = Some(Activation { owner, shim: shim.clone(), raw_modules: HashMap::new() });
            Ok(())
        })
    }

    /// Clear this thread's active shim, returning it and the raw names purged.
    pub(crate) fn deactivate(&self) -> Option<(ShimNamespace, Vec<String>)> {
        let owner = self.owner();
        ACTIVE.with(|a| {
            let mut slot = a.borrow_mut();
            if slot.as_ref().is_some_and(|act| act.owner == owner) {
                slot.take().map(|act| {
                    let mut purged: Vec<String> = act.raw_modules.into_keys().collect();
                    purged.sort();
                    (act.shim, purged)
                })
            } else {
                None
            }
        })
    }

    fn active_raw(&self, name: &str) -> Option<Arc<LoadedModule>> {
        let owner = self.owner();
        ACTIVE.with(|a| {
            a.borrow()
                .as_ref()
                .filter(|act| act.owner == owner)
                .and_then(|act| act.raw_modules.get(name).cloned())
        })
    }

    fn record_raw(&self, name: &str, module: &Arc<LoadedModule>) {
        let owner = self.owner();
        ACTIVE.with(|a| {
            if let Some(act) = a.borrow_mut().as_mut().filter(|act| act.owner == owner) {
                act.raw_modules.insert(name.to_string(), Arc::clone(module));
            }
        });
    }

    pub(crate) fn module_by_qualified_name(&self, qualified: &str) -> Option<Arc<LoadedModule>> {
        let key = match ShimNamespace::parse_qualified(qualified) {
            Some((ns, name)) => (Some(ns), name.to_string()),
            None => (None, qualified.strip_prefix(HOST_PREFIX)?.to_string()),
        };
        self.modules.get(&key).map(|m| Arc::clone(m.value()))
    }

    /// Work out which shim an import belongs to and which module performs it.
    ///
    /// Imports issued from a module loaded under a shim always stay inside that
    /// shim, whatever is active now. Imports with no module context follow the
    /// thread's active shim, or the host module path when none is active.
    fn importer_context(&self, source: Option<&str>) -> (Option<ShimNamespace>, Option<String>) {
        if let Some(src) = source {
            if let Some((ns, name)) = ShimNamespace::parse_qualified(src) {
                return (Some(ns), Some(name.to_string()));
            }
            if let Some(name) = src.strip_prefix(HOST_PREFIX) {
                return (None, Some(name.to_string()));
            }
        }
        (self.active_shim(), None)
    }

    fn absolute_name(&self, shim: &Option<ShimNamespace>, importer: Option<&str>, path: &str) -> Result<String, ImportError> {
        let dots = path.chars().take_while(|c| *c == '.').count();
        if dots == 0 {
            validate_module_name(path)?;
            return Ok(path.to_string());
        }

        let importer = importer.ok_or_else(|| ImportError::Relative(path.to_string(), "has no parent package"))?;
        // a package initialiser importing at top level is still on the stack
        let importer_is_package = self
            .modules
            .get(&(shim.clone(), importer.to_string()))
            .map(|m| m.is_package)
            .or_else(|| {
                let qualified = match shim {
                    Some(ns) => ns.qualify(importer),
                    None => format!("{HOST_PREFIX}{importer}"),
                };
                IMPORT_STACK.with(|s| s.borrow().iter().rev().find(|(q, _)| *q == qualified).map(|(_, p)| *p))
            })
            .unwrap_or(false);

        let mut base: Vec<&str> = importer.split('.').collect();
        if !importer_is_package {
            base.pop();
        }
        for _ in 1..dots {
            base.pop();
        }
        if base.is_empty() {
            return Err(ImportError::Relative(path.to_string(), "goes beyond the top-level package"));
        }

        let rest = &path[dots..];
        let mut name = base.join(".");
        if !rest.is_empty() {
            validate_module_name(rest)?;
            name.push('.');
            name.push_str(rest);
        }
        Ok(name)
    }

    pub(crate) fn resolve(&self, engine: &Engine, source: Option<&str>, path: &str) -> Result<Arc<LoadedModule>, ImportError> {
        // an evaluated module importing its own qualified name gets itself back
        if source == Some(path) {
            if let Some(module) = self.module_by_qualified_name(path) {
                return Ok(module);
            }
        }

        let (shim, importer) = self.importer_context(source);
        let name = self.absolute_name(&shim, importer.as_deref(), path)?;
        let raw = importer.is_none() && shim.is_some();

        if raw {
            if let Some(module) = self.active_raw(&name) {
                trace!(module = %name, "raw import served from active shim");
                return Ok(module);
            }
        }

        let key = (shim.clone(), name.clone());
        let cached = self.modules.get(&key).map(|m| Arc::clone(m.value()));
        let module = match cached {
            Some(module) => module,
            None => {
                let loaded = self.load(engine, shim.as_ref(), &name)?;
                Arc::clone(self.modules.entry(key).or_insert(loaded).value())
            }
        };

        if raw {
            self.record_raw(&name, &module);
        }
        Ok(module)
    }

    /// Find the file for `name`. A package (`name/mod.rhai`) wins over a plain
    /// module (`name.rhai`) in the same directory.
    fn locate(&self, shim: Option<&ShimNamespace>, name: &str) -> Result<(PathBuf, bool), ImportError> {
        let roots: Vec<PathBuf> = match shim {
            Some(ns) => vec![self
                .roots
                .get(ns)
                .map(|r| r.value().clone())
                .ok_or_else(|| ImportError::UnknownShim(ns.to_string()))?],
            None => self.host_paths.clone(),
        };

        let relative: PathBuf = name.split('.').collect();
        for root in roots {
            let base = root.join(&relative);
            let package_init = base.join(format!("{PACKAGE_INIT}.{MODULE_EXTENSION}"));
            if package_init.is_file() {
                return Ok((package_init, true));
            }
            let module_file = base.with_extension(MODULE_EXTENSION);
            if module_file.is_file() {
                return Ok((module_file, false));
            }
        }
        Err(ImportError::NotFound(name.to_string()))
    }

    fn load(&self, engine: &Engine, shim: Option<&ShimNamespace>, name: &str) -> Result<Arc<LoadedModule>, ImportError> {
        let (path, is_package) = self.locate(shim, name)?;
        let qualified = match shim {
            Some(ns) => ns.qualify(name),
            None => format!("{HOST_PREFIX}{name}"),
        };

        if IMPORT_STACK.with(|s| s.borrow().iter().any(|(q, _)| *q == qualified)) {
            return Err(ImportError::Circular(name.to_string()));
        }

        let source = fs::read_to_string(&path).map_err(|source| ImportError::Io { path: path.clone(), source })?;
        let mut ast = engine
            .compile(&source)
            .map_err(|e| ImportError::Syntax { path: path.clone(), message: e.to_string() })?;
        ast.set_source(qualified.clone());

        let evaluated = {
            let _frame = ImportFrame::push(&qualified, is_package);
            let _guard = ModelCodeGuard::enter();
            Module::eval_ast_as_new(Scope::new(), &ast, engine)
        };
        let mut module = evaluated.map_err(|e| ImportError::Execution { name: name.to_string(), message: e.to_string() })?;

        stamp_classes(&mut module, &qualified);
        module.set_id(qualified.clone());
        module.build_index();

        debug!(module = %qualified, path = %path.display(), is_package, "module loaded");
        Ok(Arc::new(LoadedModule {
            qualified_name: qualified,
            name: name.to_string(),
            shim: shim.cloned(),
            path,
            is_package,
            module: Arc::new(module),
        }))
    }
}

/// Record the defining module on every exported class so its functions can be
/// called later, even after the class has been re-exported elsewhere.
fn stamp_classes(module: &mut Module, qualified: &str) {
    let classes: Vec<(String, Map)> = module
        .iter_var()
        .filter_map(|(name, value)| {
            let map = value.clone().try_cast::<Map>()?;
            (map.contains_key(KIND_KEY) && !map.contains_key(MODULE_KEY)).then(|| (name.to_string(), map))
        })
        .collect();

    for (name, mut map) in classes {
        map.insert(MODULE_KEY.into(), Dynamic::from(qualified.to_string()));
        module.set_var(name, map);
    }
}

/// Dotted names are identifier segments. `mod` is reserved for package initialisers.
pub(crate) fn validate_module_name(name: &str) -> Result<(), ImportError> {
    let valid = !name.is_empty()
        && name.split('.').all(|segment| {
            !segment.is_empty()
                && segment != PACKAGE_INIT
                && segment.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    if valid { Ok(()) } else { Err(ImportError::InvalidName(name.to_string())) }
}

/// Plugs the shim arena into the engine's `import` statement.
pub(crate) struct ShimResolver {
    state: Arc<ShimState>,
}

impl ShimResolver {
    pub(crate) fn new(state: Arc<ShimState>) -> Self {
        Self { state }
    }
}

impl ModuleResolver for ShimResolver {
    fn resolve(
        &self,
        engine: &Engine,
        source: Option<&str>,
        path: &str,
        pos: Position,
    ) -> Result<Arc<Module>, Box<EvalAltResult>> {
        match self.state.resolve(engine, source, path) {
            Ok(loaded) => Ok(Arc::clone(&loaded.module)),
            Err(ImportError::NotFound(_)) => Err(Box::new(EvalAltResult::ErrorModuleNotFound(path.to_string(), pos))),
            Err(other) => Err(Box::new(EvalAltResult::ErrorInModule(
                path.to_string(),
                Box::new(EvalAltResult::ErrorRuntime(other.to_string().into(), pos)),
                pos,
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_names_are_validated() {
        assert!(validate_module_name("pkg.sub_1.mod_a").is_ok());
        assert!(validate_module_name("").is_err());
        assert!(validate_module_name("pkg..x").is_err());
        assert!(validate_module_name("pkg/x").is_err());
        assert!(validate_module_name("pkg.mod").is_err());
    }

    #[test]
    fn relative_names_resolve_against_the_importer() {
        let state = ShimState::new(vec![]);
        let ns = None;

        assert_eq!(state.absolute_name(&ns, Some("pkg.a.b"), ".c").unwrap(), "pkg.a.c");
        assert_eq!(state.absolute_name(&ns, Some("pkg.a.b"), "..c").unwrap(), "pkg.c");
        assert_eq!(state.absolute_name(&ns, Some("pkg.a.b"), "..").unwrap(), "pkg");
        assert!(matches!(
            state.absolute_name(&ns, Some("pkg.a.b"), "...c"),
            Err(ImportError::Relative(_, _))
        ));
        assert!(matches!(state.absolute_name(&ns, None, ".c"), Err(ImportError::Relative(_, _))));
        assert_eq!(state.absolute_name(&ns, None, "pkg.c").unwrap(), "pkg.c");
    }
}
