//! The object model code sees while it runs: parameters, input tables and a
//! place to put output tables.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
};
use model_plugin::{Table, TableSchema};
use rhai::{Array, Dynamic, Engine, EvalAltResult, Map, Position};
use serde_json::Value;
use tracing::info;

type ScriptResult<T> = Result<T, Box<EvalAltResult>>;

struct ContextState {
    model: String,
    parameters: BTreeMap<String, Value>,
    inputs: BTreeMap<String, Table>,
    output_schemas: BTreeMap<String, TableSchema>,
    outputs: BTreeMap<String, Table>,
    state: Map,
}

/// Shared handle passed to `run_model`. Clones refer to the same context.
#[derive(Clone)]
pub struct ModelContext {
    inner: Arc<Mutex<ContextState>>,
}

fn script_error(message: impl Into<String>) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(Dynamic::from(message.into()), Position::NONE))
}

impl ModelContext {
    pub fn new(
        model: &str,
        parameters: BTreeMap<String, Value>,
        inputs: BTreeMap<String, Table>,
        output_schemas: BTreeMap<String, TableSchema>,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ContextState {
                model: model.to_string(),
                parameters,
                inputs,
                output_schemas,
                outputs: BTreeMap::new(),
                state: Map::new(),
            })),
        }
    }

    /// Instance state produced by the class's `init`.
    pub fn with_state(self, state: Map) -> Self {
        self.lock().state = state;
        self
    }

    fn lock(&self) -> MutexGuard<'_, ContextState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Tables the model produced, leaving the context empty.
    pub fn take_outputs(&self) -> BTreeMap<String, Table> {
        std::mem::take(&mut self.lock().outputs)
    }

    fn get_parameter(&mut self, name: &str) -> ScriptResult<Dynamic> {
        let guard = self.lock();
        let value = guard
            .parameters
            .get(name)
            .ok_or_else(|| script_error(format!("unknown parameter `{name}`")))?;
        rhai::serde::to_dynamic(value)
    }

    fn parameters(&mut self) -> ScriptResult<Dynamic> {
        rhai::serde::to_dynamic(&self.lock().parameters)
    }

    fn state(&mut self) -> Map {
        self.lock().state.clone()
    }

    fn get_table(&mut self, name: &str) -> ScriptResult<Dynamic> {
        let guard = self.lock();
        let table = guard
            .inputs
            .get(name)
            .ok_or_else(|| script_error(format!("unknown input `{name}`")))?;
        rhai::serde::to_dynamic(&table.rows)
    }

    fn put_table(&mut self, name: &str, rows: Array) -> ScriptResult<()> {
        let mut guard = self.lock();
        let schema = guard
            .output_schemas
            .get(name)
            .cloned()
            .ok_or_else(|| script_error(format!("unknown output `{name}`")))?;
        let rows: Vec<serde_json::Map<String, Value>> = rhai::serde::from_dynamic(&Dynamic::from_array(rows))?;
        let table = Table::conform(schema, rows).map_err(|e| script_error(format!("output `{name}`: {e}")))?;
        guard.outputs.insert(name.to_string(), table);
        Ok(())
    }

    fn log(&mut self, message: &str) {
        let model = self.lock().model.clone();
        info!(target: "model", model = %model, "{message}");
    }
}

pub fn register_context_api(engine: &mut Engine) {
    engine
        .register_type_with_name::<ModelContext>("ModelContext")
        .register_fn("get_parameter", ModelContext::get_parameter)
        .register_get("parameters", ModelContext::parameters)
        .register_get("state", ModelContext::state)
        .register_fn("get_table", ModelContext::get_table)
        .register_fn("put_table", ModelContext::put_table)
        .register_fn("log", ModelContext::log);
}
