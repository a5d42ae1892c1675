use std::io::{BufRead, BufReader, Read, Write};
use model_plugin::{plugin::PARAM_PROPERTIES, DataStorage, FileStorage, PluginClass, PluginError, Table, TableSchema};
use serde_json::{Map, Value};
use tracing::debug;

use super::local::{LocalFileStorage, PROP_ROOT_PATH};

/// On-disk encodings understood by [`LocalDataStorage`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DataFormat {
    /// A single JSON array of row objects.
    Json,
    /// One row object per line.
    JsonLines,
}

impl DataFormat {
    pub fn parse(format: &str) -> Result<Self, PluginError> {
        match format.trim().to_ascii_uppercase().as_str() {
            "JSON" => Ok(DataFormat::Json),
            "JSONL" | "NDJSON" => Ok(DataFormat::JsonLines),
            other => Err(PluginError::Config(format!("unsupported data format `{other}`"))),
        }
    }
}

/// Tables stored as JSON files on top of [`LocalFileStorage`].
#[derive(Debug, Clone)]
pub struct LocalDataStorage {
    files: LocalFileStorage,
}

impl LocalDataStorage {
    pub fn new(files: LocalFileStorage) -> Self {
        Self { files }
    }

    pub fn plugin_class() -> PluginClass<dyn DataStorage> {
        PluginClass::new("LocalDataStorage", &[PARAM_PROPERTIES], |args| {
            let files = LocalFileStorage::new(args.require_property(PROP_ROOT_PATH)?)?;
            Ok(Box::new(LocalDataStorage::new(files)) as Box<dyn DataStorage>)
        })
    }

    fn decode(reader: Box<dyn Read + Send>, format: DataFormat) -> Result<Vec<Map<String, Value>>, PluginError> {
        match format {
            DataFormat::Json => Ok(serde_json::from_reader(reader)?),
            DataFormat::JsonLines => {
                let mut rows = Vec::new();
                for (i, line) in BufReader::new(reader).lines().enumerate() {
                    let line = line?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    let row = serde_json::from_str(&line)
                        .map_err(|e| PluginError::Json(format!("line {}: {e}", i + 1)))?;
                    rows.push(row);
                }
                Ok(rows)
            }
        }
    }
}

impl DataStorage for LocalDataStorage {
    fn read_table(&self, path: &str, schema: &TableSchema, format: &str) -> Result<Table, PluginError> {
        let format = DataFormat::parse(format)?;
        let rows = Self::decode(self.files.read_byte_stream(path)?, format)?;
        let table = Table::conform(schema.clone(), rows).map_err(|e| PluginError::Schema(format!("`{path}`: {e}")))?;
        debug!(path, rows = table.len(), "table read");
        Ok(table)
    }

    fn write_table(&self, path: &str, table: &Table, format: &str, overwrite: bool) -> Result<(), PluginError> {
        let format = DataFormat::parse(format)?;
        for (i, row) in table.rows.iter().enumerate() {
            table
                .schema
                .validate_row(row)
                .map_err(|e| PluginError::Schema(format!("`{path}` row {i}: {e}")))?;
        }

        let mut writer = self.files.write_byte_stream(path, overwrite)?;
        match format {
            DataFormat::Json => serde_json::to_writer(&mut writer, &table.rows)?,
            DataFormat::JsonLines => {
                for row in &table.rows {
                    serde_json::to_writer(&mut writer, row)?;
                    writer.write_all(b"\n")?;
                }
            }
        }
        writer.flush()?;
        debug!(path, rows = table.len(), "table written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model_plugin::{BasicType, FieldSchema};
    use serde_json::json;

    fn schema() -> TableSchema {
        TableSchema::new(vec![
            FieldSchema::new("id", BasicType::Integer).not_null(),
            FieldSchema::new("amount", BasicType::Float),
        ])
    }

    fn table() -> Table {
        let rows = vec![
            json!({"id": 1, "amount": 2.5}).as_object().cloned().unwrap(),
            json!({"id": 2}).as_object().cloned().unwrap(),
        ];
        Table::conform(schema(), rows).unwrap()
    }

    #[test]
    fn tables_round_trip_in_both_formats() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalDataStorage::new(LocalFileStorage::new(dir.path()).unwrap());

        for (path, format) in [("t.json", "JSON"), ("t.jsonl", "jsonl")] {
            storage.write_table(path, &table(), format, false).unwrap();
            let read = storage.read_table(path, &schema(), format).unwrap();
            assert_eq!(read, table());
        }

        assert!(matches!(storage.write_table("t.json", &table(), "JSON", false), Err(PluginError::AlreadyExists(_))));
        assert!(matches!(storage.write_table("t.csv", &table(), "CSV", false), Err(PluginError::Config(_))));
    }

    #[test]
    fn reads_are_checked_against_the_schema() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.jsonl"), "{\"id\": 1}\n\n{\"amount\": 3.0}\n").unwrap();
        let storage = LocalDataStorage::new(LocalFileStorage::new(dir.path()).unwrap());

        let err = storage.read_table("bad.jsonl", &schema(), "JSONL").unwrap_err();
        assert!(matches!(err, PluginError::Schema(ref m) if m.contains("row 1")));
    }
}
