use std::{collections::BTreeMap, fs, path::Path};

use model_plugin::{ModelDescriptor, PluginConfig};
use modelrt::{
    config::RuntimeConfig,
    error::{ErrorCategory, RuntimeError},
    executor::JobDescriptor,
    runtime::ModelRuntime,
    storage::{StorageConfig, StorageLocation},
};
use serde_json::{json, Value};
use tempfile::{tempdir, TempDir};

const GREETER: &str = r#"
fn define_parameters() {
    #{
        greeting: #{ "type": "STRING", label: "Greeting word", "default": "Hello" },
        repeat: #{ "type": "INTEGER", "default": 1 },
    }
}

fn define_inputs() {
    #{ names: #{ fields: [ #{ name: "name", "type": "STRING", not_null: true } ] } }
}

fn define_outputs() {
    #{
        greetings: #{ fields: [
            #{ name: "name", "type": "STRING", business_key: true },
            #{ name: "message", "type": "STRING", not_null: true },
        ] },
        audit: #{ fields: [ #{ name: "count", "type": "INTEGER" } ], optional: true },
    }
}

fn define_attributes() { #{ owner: "examples", tier: 1 } }

fn setup() { #{ punctuation: "!" } }

fn run_model(ctx) {
    let word = ctx.get_parameter("greeting");
    let repeat = ctx.get_parameter("repeat");
    let punctuation = ctx.state.punctuation;
    let rows = [];
    for row in ctx.get_table("names") {
        let message = word;
        for i in 1..repeat { message += " " + word; }
        rows.push(#{ name: row.name, message: message + ", " + row.name + punctuation });
    }
    ctx.log("greeted " + rows.len() + " people");
    ctx.put_table("greetings", rows);
}

export const GreeterModel = #{
    kind: ["model", "greeting"],
    define_parameters: Fn("define_parameters"),
    define_inputs: Fn("define_inputs"),
    define_outputs: Fn("define_outputs"),
    define_attributes: Fn("define_attributes"),
    init: Fn("setup"),
    run_model: Fn("run_model"),
};

fn forget_outputs(ctx) { }

export const LazyModel = #{
    kind: "model",
    define_parameters: Fn("define_parameters"),
    define_inputs: Fn("define_inputs"),
    define_outputs: Fn("define_outputs"),
    run_model: Fn("forget_outputs"),
};

fn fail(ctx) { throw "no greetings today"; }

export const FailingModel = #{
    kind: "model",
    define_parameters: Fn("define_parameters"),
    define_inputs: Fn("define_inputs"),
    define_outputs: Fn("define_outputs"),
    run_model: Fn("fail"),
};
"#;

struct Fixture {
    _dirs: [TempDir; 3],
    data: std::path::PathBuf,
    runtime: ModelRuntime,
}

fn fixture() -> Fixture {
    let models = tempdir().unwrap();
    let data = tempdir().unwrap();
    let scratch = tempdir().unwrap();
    fs::write(models.path().join("greeter.rhai"), GREETER).unwrap();
    fs::write(
        data.path().join("names.json"),
        json!([{ "name": "Ada" }, { "name": "Linus" }]).to_string(),
    )
    .unwrap();

    let config = RuntimeConfig {
        scratch_dir: scratch.path().join("scratch"),
        repositories: BTreeMap::from([(
            "models".to_string(),
            PluginConfig::new("local").with_property("repoUrl", models.path().to_string_lossy()),
        )]),
        storage: StorageConfig {
            buckets: BTreeMap::from([(
                "data".to_string(),
                PluginConfig::new("local").with_property("rootPath", data.path().to_string_lossy()),
            )]),
            default_bucket: Some("data".to_string()),
            ..StorageConfig::default()
        },
        ..RuntimeConfig::default()
    };
    let runtime = ModelRuntime::new(config).unwrap();
    let data_path = data.path().to_path_buf();
    Fixture { _dirs: [models, data, scratch], data: data_path, runtime }
}

fn job(entry_point: &str) -> JobDescriptor {
    JobDescriptor {
        job_id: None,
        model: ModelDescriptor::new("models", "greeter", "1.0", entry_point),
        parameters: BTreeMap::from([("repeat".to_string(), json!(2))]),
        inputs: BTreeMap::from([("names".to_string(), StorageLocation::new("data", "names.json"))]),
        outputs: BTreeMap::from([(
            "greetings".to_string(),
            StorageLocation::new("data", "out/greetings.jsonl").with_format("JSONL"),
        )]),
        overwrite_outputs: false,
    }
}

fn read_lines(path: &Path) -> Vec<Value> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

#[test]
fn job_reads_inputs_runs_model_and_writes_outputs() {
    let f = fixture();
    let result = f.runtime.run_job(&job("greeter.GreeterModel")).unwrap();

    assert_eq!(result.outputs["greetings"], 2);
    assert!(!result.outputs.contains_key("audit"));
    assert_eq!(result.definition.attributes["owner"], json!("examples"));

    let rows = read_lines(&f.data.join("out/greetings.jsonl"));
    assert_eq!(rows[0], json!({ "name": "Ada", "message": "Hello Hello, Ada!" }));
    assert_eq!(rows[1]["message"], json!("Hello Hello, Linus!"));

    // the job scope is gone afterwards
    assert!(f.runtime.loader().scope_dir(&result.job_id).is_none());
}

#[test]
fn existing_outputs_need_overwrite() {
    let f = fixture();
    f.runtime.run_job(&job("greeter.GreeterModel")).unwrap();

    let err = f.runtime.run_job(&job("greeter.GreeterModel")).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Storage);

    let mut again = job("greeter.GreeterModel");
    again.overwrite_outputs = true;
    again.parameters.insert("greeting".to_string(), json!("Hi"));
    again.parameters.insert("repeat".to_string(), json!(1));
    f.runtime.run_job(&again).unwrap();
    let rows = read_lines(&f.data.join("out/greetings.jsonl"));
    assert_eq!(rows[0]["message"], json!("Hi, Ada!"));
}

#[test]
fn job_validation_failures_are_reported_by_category() {
    let f = fixture();

    let mut bad_param = job("greeter.GreeterModel");
    bad_param.parameters.insert("repeat".to_string(), json!("twice"));
    assert!(matches!(f.runtime.run_job(&bad_param), Err(RuntimeError::RuntimeValidation(_))));

    let mut unbound = job("greeter.GreeterModel");
    unbound.inputs.clear();
    assert!(matches!(f.runtime.run_job(&unbound), Err(RuntimeError::RuntimeValidation(ref m)) if m.contains("names")));

    let lazy = f.runtime.run_job(&job("greeter.LazyModel")).unwrap_err();
    assert!(matches!(lazy, RuntimeError::RuntimeValidation(ref m) if m.contains("greetings")));

    let failing = f.runtime.run_job(&job("greeter.FailingModel")).unwrap_err();
    assert!(matches!(failing, RuntimeError::RuntimeValidation(ref m) if m.contains("no greetings today")));

    let missing = f.runtime.run_job(&job("greeter.NoSuchModel")).unwrap_err();
    assert_eq!(missing.category(), ErrorCategory::ModelLoad);

    let mut bad_input = job("greeter.GreeterModel");
    fs::write(f.data.join("broken.json"), r#"[{ "nom": "Ada" }]"#).unwrap();
    bad_input.inputs.insert("names".to_string(), StorageLocation::new("data", "broken.json"));
    assert_eq!(f.runtime.run_job(&bad_input).unwrap_err().category(), ErrorCategory::Storage);
}

#[test]
fn scan_reports_declarations_without_running_the_model() {
    let f = fixture();
    let descriptor = ModelDescriptor::new("models", "greeter", "1.0", "greeter.GreeterModel");
    let definition = f.runtime.scan(&descriptor).unwrap();

    assert_eq!(definition.class_name, "GreeterModel");
    assert_eq!(definition.parameters["greeting"].label.as_deref(), Some("Greeting word"));
    assert_eq!(definition.parameters["repeat"].default_value, Some(json!(1)));
    assert!(!definition.inputs["names"].optional);
    assert!(definition.outputs["audit"].optional);
    assert!(definition.outputs["greetings"].schema.fields[0].business_key);
    assert!(!f.data.join("out").exists());
}
