//! Scanning: read a model class's declarations into a [`ModelDefinition`]
//! without running its `init`.
use std::collections::{BTreeMap, BTreeSet};
use model_plugin::{BasicType, FieldSchema, ModelDescriptor, TableSchema};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::{
    error::{Result, RuntimeError},
    shim::ScriptClass,
};

pub const DEFINE_PARAMETERS: &str = "define_parameters";
pub const DEFINE_INPUTS: &str = "define_inputs";
pub const DEFINE_OUTPUTS: &str = "define_outputs";
pub const DEFINE_ATTRIBUTES: &str = "define_attributes";
pub const RUN_MODEL: &str = "run_model";

const REQUIRED_METHODS: [&str; 4] = [DEFINE_PARAMETERS, DEFINE_INPUTS, DEFINE_OUTPUTS, RUN_MODEL];

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ParameterDefinition {
    pub param_type: BasicType,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub default_value: Option<Value>,
}

/// An input or output dataset a model declares.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct TableDefinition {
    pub schema: TableSchema,
    #[serde(default)]
    pub optional: bool,
}

/// Declarative metadata of a model class.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ModelDefinition {
    pub descriptor: ModelDescriptor,
    pub class_name: String,
    pub module: String,
    pub attributes: BTreeMap<String, Value>,
    pub parameters: BTreeMap<String, ParameterDefinition>,
    pub inputs: BTreeMap<String, TableDefinition>,
    pub outputs: BTreeMap<String, TableDefinition>,
}

/// Call the class's declaration functions and assemble its definition.
/// Anything that goes wrong is a validation error naming the class.
pub fn scan_model(stub: &ModelDescriptor, class: &ScriptClass) -> Result<ModelDefinition> {
    let class_name = class.qualified_name();
    let invalid = |reason: String| RuntimeError::model_validation(&class_name, reason);

    for method in REQUIRED_METHODS {
        if !class.has_method(method) {
            return Err(invalid(format!("missing required function `{method}`")));
        }
    }

    let declare = |method: &str| -> Result<Value> {
        let value = class
            .call_method(method, ())
            .map_err(|e| invalid(format!("`{method}` failed: {e}")))?;
        if value.is_unit() {
            return Ok(Value::Object(Map::new()));
        }
        rhai::serde::from_dynamic::<Value>(&value).map_err(|e| invalid(format!("`{method}` returned unusable data: {e}")))
    };

    let parameters = parse_parameters(declare(DEFINE_PARAMETERS)?).map_err(|e| invalid(format!("parameters: {e}")))?;
    let inputs = parse_tables(declare(DEFINE_INPUTS)?).map_err(|e| invalid(format!("inputs: {e}")))?;
    let outputs = parse_tables(declare(DEFINE_OUTPUTS)?).map_err(|e| invalid(format!("outputs: {e}")))?;
    let attributes = if class.has_method(DEFINE_ATTRIBUTES) {
        parse_attributes(declare(DEFINE_ATTRIBUTES)?).map_err(|e| invalid(format!("attributes: {e}")))?
    } else {
        BTreeMap::new()
    };

    debug!(class = %class_name, parameters = parameters.len(), inputs = inputs.len(), outputs = outputs.len(), "model scanned");
    Ok(ModelDefinition {
        descriptor: stub.clone(),
        class_name: class.name().to_string(),
        module: class.defining_module().to_string(),
        attributes,
        parameters,
        inputs,
        outputs,
    })
}

fn as_object(value: Value, what: &str) -> std::result::Result<Map<String, Value>, String> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(format!("{what} must be a map, got {other}")),
    }
}

fn parse_type(value: Option<&Value>) -> std::result::Result<BasicType, String> {
    match value {
        Some(Value::String(name)) => name.parse(),
        Some(other) => Err(format!("type must be a string, got {other}")),
        None => Err("missing `type`".to_string()),
    }
}

fn optional_string(entry: &Map<String, Value>, key: &str) -> std::result::Result<Option<String>, String> {
    match entry.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(format!("`{key}` must be a string, got {other}")),
    }
}

fn flag(entry: &Map<String, Value>, key: &str) -> std::result::Result<bool, String> {
    match entry.get(key) {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(other) => Err(format!("`{key}` must be a boolean, got {other}")),
    }
}

pub(crate) fn parse_parameters(value: Value) -> std::result::Result<BTreeMap<String, ParameterDefinition>, String> {
    let mut parameters = BTreeMap::new();
    for (name, entry) in as_object(value, "declaration")? {
        let entry = as_object(entry, &format!("parameter `{name}`"))?;
        let param_type = parse_type(entry.get("type")).map_err(|e| format!("parameter `{name}`: {e}"))?;
        let label = optional_string(&entry, "label").map_err(|e| format!("parameter `{name}`: {e}"))?;
        let default_value = match entry.get("default") {
            None | Some(Value::Null) => None,
            Some(v) if param_type.accepts(v) => Some(v.clone()),
            Some(v) => return Err(format!("parameter `{name}`: default {v} is not a valid {param_type}")),
        };
        parameters.insert(name, ParameterDefinition { param_type, label, default_value });
    }
    Ok(parameters)
}

pub(crate) fn parse_tables(value: Value) -> std::result::Result<BTreeMap<String, TableDefinition>, String> {
    let mut tables = BTreeMap::new();
    for (name, entry) in as_object(value, "declaration")? {
        let entry = as_object(entry, &format!("dataset `{name}`"))?;
        let fields = match entry.get("fields") {
            Some(Value::Array(fields)) if !fields.is_empty() => fields.clone(),
            Some(Value::Array(_)) => return Err(format!("dataset `{name}` declares no fields")),
            _ => return Err(format!("dataset `{name}` must have a `fields` array")),
        };

        let mut seen = BTreeSet::new();
        let mut schema = Vec::with_capacity(fields.len());
        for field in fields {
            let field = as_object(field, &format!("a field of `{name}`"))?;
            let field_name = match field.get("name") {
                Some(Value::String(n)) if !n.is_empty() => n.clone(),
                _ => return Err(format!("a field of `{name}` has no name")),
            };
            if !seen.insert(field_name.clone()) {
                return Err(format!("dataset `{name}` declares field `{field_name}` twice"));
            }
            let context = |e: String| format!("field `{name}.{field_name}`: {e}");
            schema.push(FieldSchema {
                field_type: parse_type(field.get("type")).map_err(context)?,
                label: optional_string(&field, "label").map_err(context)?,
                business_key: flag(&field, "business_key").map_err(context)?,
                not_null: flag(&field, "not_null").map_err(context)?,
                field_name,
            });
        }

        let optional = flag(&entry, "optional").map_err(|e| format!("dataset `{name}`: {e}"))?;
        tables.insert(name, TableDefinition { schema: TableSchema::new(schema), optional });
    }
    Ok(tables)
}

pub(crate) fn parse_attributes(value: Value) -> std::result::Result<BTreeMap<String, Value>, String> {
    let mut attributes = BTreeMap::new();
    for (name, v) in as_object(value, "declaration")? {
        if v.is_array() || v.is_object() {
            return Err(format!("attribute `{name}` must be a single value"));
        }
        attributes.insert(name, v);
    }
    Ok(attributes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parameters_parse_with_defaults() {
        let params = parse_parameters(json!({
            "name": { "type": "string", "label": "Who to greet", "default": "World" },
            "count": { "type": "INTEGER" }
        }))
        .unwrap();
        assert_eq!(params["name"].param_type, BasicType::String);
        assert_eq!(params["name"].default_value, Some(json!("World")));
        assert_eq!(params["count"].default_value, None);

        assert!(parse_parameters(json!({ "n": { "type": "INTEGER", "default": "ten" } })).is_err());
        assert!(parse_parameters(json!({ "n": { "label": "no type" } })).is_err());
        assert!(parse_parameters(json!([1, 2])).is_err());
    }

    #[test]
    fn tables_parse_field_flags() {
        let tables = parse_tables(json!({
            "customers": {
                "fields": [
                    { "name": "id", "type": "INTEGER", "business_key": true, "not_null": true },
                    { "name": "joined", "type": "DATE", "label": "Joined" }
                ],
                "optional": true
            }
        }))
        .unwrap();
        let customers = &tables["customers"];
        assert!(customers.optional);
        assert!(customers.schema.fields[0].business_key);
        assert_eq!(customers.schema.field("joined").unwrap().field_type, BasicType::Date);
    }

    #[test]
    fn malformed_tables_are_rejected() {
        assert!(parse_tables(json!({ "t": { "fields": [] } })).is_err());
        assert!(parse_tables(json!({ "t": {} })).is_err());
        assert!(parse_tables(json!({ "t": { "fields": [{ "name": "a", "type": "BLOB" }] } })).is_err());
        let dup = parse_tables(json!({ "t": { "fields": [
            { "name": "a", "type": "STRING" }, { "name": "a", "type": "STRING" }
        ] } }));
        assert!(dup.unwrap_err().contains("twice"));
    }

    #[test]
    fn attributes_must_be_scalars() {
        assert_eq!(parse_attributes(json!({ "owner": "team-a", "tier": 2 })).unwrap().len(), 2);
        assert!(parse_attributes(json!({ "tags": ["a"] })).is_err());
    }
}
