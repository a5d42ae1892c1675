use std::io::{Read, Write};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{plugin::PluginError, table::{Table, TableSchema}};

#[derive(Debug, Copy, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    File,
    Directory,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct FileStat {
    /// Storage-relative path, always using `/` separators.
    pub path: String,
    pub name: String,
    pub file_type: FileType,
    pub size: u64,
    pub mtime: Option<DateTime<Utc>>,
}

/// Byte-level storage addressed by storage-relative paths.
///
/// Streams returned by `read_byte_stream` / `write_byte_stream` release their
/// handles on drop; writers flush on drop as well.
pub trait FileStorage: Send + Sync {
    fn exists(&self, path: &str) -> Result<bool, PluginError>;
    fn size(&self, path: &str) -> Result<u64, PluginError>;
    fn stat(&self, path: &str) -> Result<FileStat, PluginError>;
    fn ls(&self, path: &str, recursive: bool) -> Result<Vec<FileStat>, PluginError>;
    fn mkdir(&self, path: &str, recursive: bool) -> Result<(), PluginError>;
    fn rm(&self, path: &str) -> Result<(), PluginError>;
    fn rmdir(&self, path: &str) -> Result<(), PluginError>;
    fn read_byte_stream(&self, path: &str) -> Result<Box<dyn Read + Send>, PluginError>;
    /// Fails with [`PluginError::AlreadyExists`] when the file exists and
    /// `overwrite` is false.
    fn write_byte_stream(&self, path: &str, overwrite: bool) -> Result<Box<dyn Write + Send>, PluginError>;
}

/// Schema'd table storage. `format` names the on-disk encoding (e.g. `JSON`).
pub trait DataStorage: Send + Sync {
    fn read_table(&self, path: &str, schema: &TableSchema, format: &str) -> Result<Table, PluginError>;
    fn write_table(&self, path: &str, table: &Table, format: &str, overwrite: bool) -> Result<(), PluginError>;
}
