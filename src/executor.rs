//! JobExecutor: runs one job end to end. It loads the model in a fresh
//! scope, validates the job against the model's declarations, feeds inputs
//! from storage, runs the model and writes its outputs back.
use std::{collections::BTreeMap, sync::Arc};
use model_plugin::{ModelDescriptor, Table, TableSchema};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    context::ModelContext,
    error::{Result, RuntimeError},
    loader::{scan::RUN_MODEL, ModelDefinition, ModelLoader},
    storage::{StorageLocation, StorageManager},
};

/// A request to run one model with parameters and storage bindings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct JobDescriptor {
    #[serde(default)]
    pub job_id: Option<String>,
    pub model: ModelDescriptor,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    #[serde(default)]
    pub inputs: BTreeMap<String, StorageLocation>,
    #[serde(default)]
    pub outputs: BTreeMap<String, StorageLocation>,
    #[serde(default)]
    pub overwrite_outputs: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    pub job_id: String,
    pub definition: ModelDefinition,
    /// Rows written per output.
    pub outputs: BTreeMap<String, usize>,
}

pub struct JobExecutor {
    loader: Arc<ModelLoader>,
    storage: Arc<StorageManager>,
}

impl JobExecutor {
    pub fn new(loader: Arc<ModelLoader>, storage: Arc<StorageManager>) -> Self {
        Self { loader, storage }
    }

    /// Run `job` in its own scope. The scope is destroyed whatever the outcome.
    #[instrument(skip(self, job), fields(entry_point = %job.model.entry_point))]
    pub fn run_job(&self, job: &JobDescriptor) -> Result<JobResult> {
        let job_id = job.job_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        self.loader.create_scope(&job_id)?;

        let result = self.run_in_scope(&job_id, job);

        if let Err(e) = self.loader.destroy_scope(&job_id) {
            warn!(job = %job_id, error = %e, "could not destroy job scope");
        }
        match &result {
            Ok(r) => info!(job = %job_id, outputs = r.outputs.len(), "job succeeded"),
            Err(e) => warn!(job = %job_id, category = %e.category(), error = %e, "job failed"),
        }
        result
    }

    fn run_in_scope(&self, job_id: &str, job: &JobDescriptor) -> Result<JobResult> {
        let class = self.loader.load_model_class(job_id, &job.model)?;
        let definition = self.loader.scan_model(&job.model, &class)?;
        let model_name = class.qualified_name();

        let parameters = resolve_parameters(&definition, &job.parameters)?;
        check_bindings("input", &definition.inputs, &job.inputs)?;
        check_bindings("output", &definition.outputs, &job.outputs)?;

        let mut inputs = BTreeMap::new();
        for (name, location) in &job.inputs {
            let schema = &definition.inputs[name].schema;
            let table = self.storage.read_table(location, schema)?;
            debug!(input = %name, rows = table.len(), "input loaded");
            inputs.insert(name.clone(), table);
        }
        let output_schemas: BTreeMap<String, TableSchema> = definition
            .outputs
            .iter()
            .map(|(name, def)| (name.clone(), def.schema.clone()))
            .collect();

        let state = class
            .instantiate()
            .map_err(|e| RuntimeError::model_validation(&model_name, format!("`init` failed: {e}")))?;
        let ctx = ModelContext::new(&model_name, parameters, inputs, output_schemas).with_state(state);

        info!(job = %job_id, model = %model_name, "running model");
        class
            .call_method(RUN_MODEL, (ctx.clone(),))
            .map_err(|e| RuntimeError::RuntimeValidation(format!("model `{model_name}` failed in `{RUN_MODEL}`: {e}")))?;

        let produced = ctx.take_outputs();
        let written = self.write_outputs(&definition, job, produced)?;
        Ok(JobResult { job_id: job_id.to_string(), definition, outputs: written })
    }

    fn write_outputs(
        &self,
        definition: &ModelDefinition,
        job: &JobDescriptor,
        mut produced: BTreeMap<String, Table>,
    ) -> Result<BTreeMap<String, usize>> {
        let mut written = BTreeMap::new();
        for (name, def) in &definition.outputs {
            let table = match produced.remove(name) {
                Some(table) => table,
                None if def.optional => continue,
                None => {
                    return Err(RuntimeError::RuntimeValidation(format!(
                        "model did not produce required output `{name}`"
                    )));
                }
            };
            match job.outputs.get(name) {
                Some(location) => {
                    self.storage.write_table(location, &table, job.overwrite_outputs)?;
                    written.insert(name.clone(), table.len());
                }
                None => debug!(output = %name, "optional output produced but not bound"),
            }
        }
        Ok(written)
    }
}

/// Supplied values merged over declared defaults, all type checked.
pub(crate) fn resolve_parameters(
    definition: &ModelDefinition,
    supplied: &BTreeMap<String, Value>,
) -> Result<BTreeMap<String, Value>> {
    if let Some(unknown) = supplied.keys().find(|k| !definition.parameters.contains_key(*k)) {
        return Err(RuntimeError::RuntimeValidation(format!("unknown parameter `{unknown}`")));
    }

    let mut resolved = BTreeMap::new();
    for (name, param) in &definition.parameters {
        let value = supplied
            .get(name)
            .or(param.default_value.as_ref())
            .ok_or_else(|| RuntimeError::RuntimeValidation(format!("missing parameter `{name}`")))?;
        if !param.param_type.accepts(value) {
            return Err(RuntimeError::RuntimeValidation(format!(
                "parameter `{name}` expects {} but got {value}",
                param.param_type
            )));
        }
        resolved.insert(name.clone(), value.clone());
    }
    Ok(resolved)
}

/// Every binding must name a declared dataset and every required dataset must be bound.
fn check_bindings<T>(
    kind: &str,
    declared: &BTreeMap<String, crate::loader::TableDefinition>,
    bound: &BTreeMap<String, T>,
) -> Result<()> {
    if let Some(unknown) = bound.keys().find(|k| !declared.contains_key(*k)) {
        return Err(RuntimeError::RuntimeValidation(format!("unknown {kind} `{unknown}`")));
    }
    if let Some((missing, _)) = declared.iter().find(|(name, def)| !def.optional && !bound.contains_key(*name)) {
        return Err(RuntimeError::RuntimeValidation(format!("required {kind} `{missing}` is not bound")));
    }
    Ok(())
}
