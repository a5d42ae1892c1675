use std::{fmt, str::FromStr};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Primitive field types a table column can hold.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum BasicType {
    Boolean,
    Integer,
    Float,
    String,
    Date,
    Datetime,
}

impl BasicType {
    /// Whether a non-null JSON value is a valid instance of this type.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (BasicType::Boolean, Value::Bool(_)) => true,
            (BasicType::Integer, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (BasicType::Float, Value::Number(_)) => true,
            (BasicType::String, Value::String(_)) => true,
            (BasicType::Date, Value::String(s)) => NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok(),
            (BasicType::Datetime, Value::String(s)) => {
                DateTime::parse_from_rfc3339(s).is_ok()
                    || NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
            }
            _ => false,
        }
    }
}

impl FromStr for BasicType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BOOLEAN" | "BOOL" => Ok(BasicType::Boolean),
            "INTEGER" | "INT" => Ok(BasicType::Integer),
            "FLOAT" | "DECIMAL" => Ok(BasicType::Float),
            "STRING" => Ok(BasicType::String),
            "DATE" => Ok(BasicType::Date),
            "DATETIME" => Ok(BasicType::Datetime),
            other => Err(format!("unknown field type `{other}`")),
        }
    }
}

impl fmt::Display for BasicType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BasicType::Boolean => "BOOLEAN",
            BasicType::Integer => "INTEGER",
            BasicType::Float => "FLOAT",
            BasicType::String => "STRING",
            BasicType::Date => "DATE",
            BasicType::Datetime => "DATETIME",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct FieldSchema {
    pub field_name: String,
    pub field_type: BasicType,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub business_key: bool,
    #[serde(default)]
    pub not_null: bool,
}

impl FieldSchema {
    pub fn new(field_name: &str, field_type: BasicType) -> Self {
        Self { field_name: field_name.to_string(), field_type, label: None, business_key: false, not_null: false }
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct TableSchema {
    pub fields: Vec<FieldSchema>,
}

impl TableSchema {
    pub fn new(fields: Vec<FieldSchema>) -> Self {
        Self { fields }
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.field_name == name)
    }

    /// Check one row against the schema. Missing fields count as null.
    pub fn validate_row(&self, row: &Map<String, Value>) -> Result<(), String> {
        for key in row.keys() {
            if self.field(key).is_none() {
                return Err(format!("unexpected field `{key}`"));
            }
        }
        for field in &self.fields {
            match row.get(&field.field_name) {
                None | Some(Value::Null) => {
                    if field.not_null {
                        return Err(format!("field `{}` must not be null", field.field_name));
                    }
                }
                Some(value) => {
                    if !field.field_type.accepts(value) {
                        return Err(format!(
                            "field `{}` expects {} but got {}",
                            field.field_name, field.field_type, value
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

/// A schema'd set of rows, the unit exchanged with data storage and model code.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Table {
    pub schema: TableSchema,
    pub rows: Vec<Map<String, Value>>,
}

impl Table {
    /// Build a table, rejecting the first row that does not conform.
    pub fn conform(schema: TableSchema, rows: Vec<Map<String, Value>>) -> Result<Self, String> {
        for (i, row) in rows.iter().enumerate() {
            schema.validate_row(row).map_err(|e| format!("row {i}: {e}"))?;
        }
        Ok(Self { schema, rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
