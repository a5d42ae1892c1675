use std::{fmt, sync::Arc};
use rhai::{Array, Dynamic, Engine, EvalAltResult, FnPtr, FuncArgs, Map, Position, Scope};

use crate::guard::ModelCodeGuard;

/// Map key naming the base kind(s) a class derives from, e.g. `"model"`.
pub const KIND_KEY: &str = "kind";
/// Map key stamped on every exported class with its defining module.
pub const MODULE_KEY: &str = "__module__";

/// A model class loaded from script code.
///
/// Classes are exported maps whose function-pointer members are the class's
/// methods. A method is called as a function of the already evaluated
/// defining module, so it sees that module's top-level imports
/// without the module's top-level code running again. Imports made inside a
/// method resolve in the class's own shim.
pub struct ScriptClass {
    name: String,
    module: String,
    defining_module: String,
    kinds: Vec<String>,
    members: Map,
    engine: Arc<Engine>,
}

impl ScriptClass {
    pub(crate) fn new(name: &str, module: &str, members: Map, engine: Arc<Engine>) -> Self {
        let defining_module = members
            .get(MODULE_KEY)
            .and_then(|m| m.clone().into_string().ok())
            .unwrap_or_else(|| module.to_string());
        let kinds = kinds_of(&members);
        Self { name: name.to_string(), module: module.to_string(), defining_module, kinds, members, engine }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Qualified name of the module the class was requested from.
    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn defining_module(&self) -> &str {
        &self.defining_module
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.defining_module, self.name)
    }

    pub fn kinds(&self) -> &[String] {
        &self.kinds
    }

    pub fn is_subtype_of(&self, kind: &str) -> bool {
        self.kinds.iter().any(|k| k == kind)
    }

    pub fn member(&self, key: &str) -> Option<&Dynamic> {
        self.members.get(key)
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.method_name(method).is_some()
    }

    fn method_name(&self, method: &str) -> Option<String> {
        let member = self.members.get(method)?;
        if let Some(ptr) = member.clone().try_cast::<FnPtr>() {
            return Some(ptr.fn_name().to_string());
        }
        member.clone().into_string().ok()
    }

    /// Call a class method as model code.
    pub fn call_method(&self, method: &str, args: impl FuncArgs) -> Result<Dynamic, Box<EvalAltResult>> {
        let fn_name = self
            .method_name(method)
            .filter(|name| is_identifier(name))
            .ok_or_else(|| Box::new(EvalAltResult::ErrorFunctionNotFound(method.to_string(), Position::NONE)))?;

        let mut values: Vec<Dynamic> = Vec::new();
        args.parse(&mut values);
        let mut scope = Scope::new();
        let mut params = Vec::with_capacity(values.len());
        for (i, value) in values.into_iter().enumerate() {
            let param = format!("arg{i}");
            scope.push_dynamic(param.as_str(), value);
            params.push(param);
        }

        // the resolver hands a module back to itself, so this import reuses the
        // evaluated module instead of running its body again
        let mut caller = self.engine.compile(format!(
            "import \"{}\" as defining; defining::{fn_name}({})",
            self.defining_module,
            params.join(", ")
        ))?;
        caller.set_source(self.defining_module.as_str());

        let _guard = ModelCodeGuard::enter();
        self.engine.eval_ast_with_scope::<Dynamic>(&mut scope, &caller)
    }

    /// Construct an instance: runs `init` when the class defines one.
    pub fn instantiate(&self) -> Result<Map, Box<EvalAltResult>> {
        if !self.has_method("init") {
            return Ok(Map::new());
        }
        let state = self.call_method("init", ())?;
        if state.is_unit() {
            return Ok(Map::new());
        }
        state.try_cast::<Map>().ok_or_else(|| {
            Box::new(EvalAltResult::ErrorRuntime(
                format!("`{}.init` must return a map", self.name).into(),
                Position::NONE,
            ))
        })
    }
}

impl fmt::Debug for ScriptClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptClass")
            .field("name", &self.name)
            .field("module", &self.module)
            .field("defining_module", &self.defining_module)
            .field("kinds", &self.kinds)
            .finish_non_exhaustive()
    }
}

fn is_identifier(name: &str) -> bool {
    name.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// `kind` may be a single string or an array of strings.
pub(crate) fn kinds_of(members: &Map) -> Vec<String> {
    let Some(kind) = members.get(KIND_KEY) else {
        return Vec::new();
    };
    if let Some(array) = kind.clone().try_cast::<Array>() {
        return array.into_iter().filter_map(|k| k.into_string().ok()).collect();
    }
    kind.clone().into_string().map(|k| vec![k]).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{guard::GuardLimits, shim::ShimLoader};

    fn class_from(script: &str, name: &str) -> (tempfile::TempDir, Arc<ScriptClass>) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("models.rhai"), script).unwrap();
        std::fs::write(dir.path().join("helper.rhai"), "fn base() { 40 }").unwrap();
        let loader = ShimLoader::new(vec![dir.path().to_path_buf()], &GuardLimits::default());
        let class = loader.load_class("models", name, "model").unwrap();
        (dir, class)
    }

    #[test]
    fn kinds_accept_strings_and_arrays() {
        let members = |script: &str| Engine::new().eval::<Map>(script).unwrap();

        assert_eq!(kinds_of(&members(r#"#{ kind: "model" }"#)), vec!["model"]);
        assert_eq!(kinds_of(&members(r#"#{ kind: ["model", "reporting"] }"#)), vec!["model", "reporting"]);
        assert!(kinds_of(&members(r#"#{ }"#)).is_empty());
    }

    #[test]
    fn methods_run_in_the_defining_module() {
        let (_dir, class) = class_from(
            r#"
            import "helper" as helper;
            fn answer() { helper::base() + 2 }
            fn add(a, b) { a + b }
            fn setup() { #{ ready: true } }
            export const Answer = #{ kind: ["model", "reporting"], answer: Fn("answer"), add: Fn("add"), init: Fn("setup") };
            "#,
            "Answer",
        );
        assert!(class.is_subtype_of("reporting"));
        assert!(class.has_method("answer"));
        assert_eq!(class.call_method("answer", ()).unwrap().as_int().unwrap(), 42);
        assert_eq!(class.call_method("add", (1_i64, 2_i64)).unwrap().as_int().unwrap(), 3);

        let state = class.instantiate().unwrap();
        assert!(state.get("ready").unwrap().as_bool().unwrap());

        assert!(class.call_method("missing", ()).is_err());
    }

    #[test]
    fn method_names_must_be_identifiers() {
        let (_dir, class) = class_from(
            r#"
            fn ok() { 1 }
            export const Odd = #{ kind: "model", ok: Fn("ok"), odd: "ok(); ok" };
            "#,
            "Odd",
        );
        assert!(class.call_method("ok", ()).is_ok());
        assert!(matches!(*class.call_method("odd", ()).unwrap_err(), EvalAltResult::ErrorFunctionNotFound(..)));
    }

    #[test]
    fn defining_module_comes_from_the_stamp() {
        let (_dir, class) = class_from(r#"export const M = #{ kind: "model" };"#, "M");
        assert_eq!(class.defining_module(), "modelrt.host.models");
        assert_eq!(class.qualified_name(), "modelrt.host.models.M");
        assert_eq!(class.module(), "modelrt.host.models");
    }
}
