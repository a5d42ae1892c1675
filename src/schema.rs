// src/schema.rs

use std::{fs, path::{Path, PathBuf}};

use anyhow::Error;
use schemars::{Schema, schema_for};

use crate::{config::RuntimeConfig, executor::JobDescriptor, loader::ModelDefinition};

/// Write JSON schemas for the runtime config, job descriptors and scan
/// output into `out_dir`. Returns the files written.
pub fn write_schema(out_dir: &Path) -> Result<Vec<PathBuf>, Error> {
    fs::create_dir_all(out_dir)?;

    let schemas: [(&str, Schema); 3] = [
        ("runtime-config", schema_for!(RuntimeConfig)),
        ("job", schema_for!(JobDescriptor)),
        ("model-definition", schema_for!(ModelDefinition)),
    ];

    let mut written = Vec::with_capacity(schemas.len());
    for (name, schema) in schemas {
        let path = out_dir.join(format!("{name}.schema.json"));
        fs::write(&path, serde_json::to_string_pretty(&schema)?)?;
        written.push(path);
    }
    Ok(written)
}
