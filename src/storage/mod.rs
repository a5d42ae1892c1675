//! StorageManager: named storage locations resolved to file and data storage
//! plugins.
pub mod data;
pub mod local;

use std::{
    collections::BTreeMap,
    io::{Read, Write},
    sync::Arc,
};
use model_plugin::{DataStorage, FileStat, FileStorage, PluginConfig, PluginError, Table, TableSchema};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    error::{Result, RuntimeError},
    plugins::PluginRegistry,
};

pub const DEFAULT_FORMAT: &str = "JSON";

fn default_format() -> String {
    DEFAULT_FORMAT.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct StorageConfig {
    #[serde(default)]
    pub buckets: BTreeMap<String, PluginConfig>,
    #[serde(default)]
    pub default_bucket: Option<String>,
    #[serde(default = "default_format")]
    pub default_format: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { buckets: BTreeMap::new(), default_bucket: None, default_format: default_format() }
    }
}

/// Where a table lives: storage key, path inside it and an optional format.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct StorageLocation {
    #[serde(default)]
    pub storage: Option<String>,
    pub path: String,
    #[serde(default)]
    pub format: Option<String>,
}

impl StorageLocation {
    pub fn new(storage: &str, path: &str) -> Self {
        Self { storage: Some(storage.to_string()), path: path.to_string(), format: None }
    }

    pub fn with_format(mut self, format: &str) -> Self {
        self.format = Some(format.to_string());
        self
    }
}

pub struct StorageManager {
    files: BTreeMap<String, Arc<dyn FileStorage>>,
    data: BTreeMap<String, Arc<dyn DataStorage>>,
    default_bucket: Option<String>,
    default_format: String,
}

impl StorageManager {
    /// Load file and data plugins for every bucket. A bucket needs at least one of the two.
    pub fn new(registry: &PluginRegistry, config: &StorageConfig) -> Result<Self> {
        let mut files = BTreeMap::new();
        let mut data = BTreeMap::new();

        for (key, bucket) in &config.buckets {
            let has_files = registry.is_plugin_available::<dyn FileStorage>(&bucket.protocol)?;
            let has_data = registry.is_plugin_available::<dyn DataStorage>(&bucket.protocol)?;
            if !has_files && !has_data {
                return Err(RuntimeError::Config(format!(
                    "storage `{key}`: no storage plugin for protocol `{}`",
                    bucket.protocol
                )));
            }
            let named = |e: RuntimeError| match e {
                RuntimeError::PluginConformance { .. } => e,
                other => RuntimeError::Config(format!("storage `{key}`: {other}")),
            };
            if has_files {
                let storage = registry.load_plugin::<dyn FileStorage>(key, bucket).map_err(named)?;
                files.insert(key.clone(), Arc::from(storage));
            }
            if has_data {
                let storage = registry.load_plugin::<dyn DataStorage>(key, bucket).map_err(named)?;
                data.insert(key.clone(), Arc::from(storage));
            }
            info!(storage = %key, protocol = %bucket.protocol, has_files, has_data, "storage configured");
        }

        if let Some(default) = &config.default_bucket {
            if !config.buckets.contains_key(default) {
                return Err(RuntimeError::Config(format!("default storage `{default}` is not configured")));
            }
        }

        Ok(Self {
            files,
            data,
            default_bucket: config.default_bucket.clone(),
            default_format: config.default_format.clone(),
        })
    }

    pub fn default_format(&self) -> &str {
        &self.default_format
    }

    /// The storage key a location refers to, falling back to the default bucket.
    pub fn storage_key<'a>(&'a self, location: &'a StorageLocation) -> Result<&'a str> {
        location
            .storage
            .as_deref()
            .or(self.default_bucket.as_deref())
            .ok_or_else(|| RuntimeError::Config(format!("no storage given for `{}` and no default storage", location.path)))
    }

    pub fn has_file_storage(&self, key: &str) -> bool {
        self.files.contains_key(key)
    }

    pub fn has_data_storage(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn get_file_storage(&self, key: &str) -> Result<Arc<dyn FileStorage>> {
        self.files
            .get(key)
            .cloned()
            .ok_or_else(|| RuntimeError::Config(format!("file storage `{key}` is not configured")))
    }

    pub fn get_data_storage(&self, key: &str) -> Result<Arc<dyn DataStorage>> {
        self.data
            .get(key)
            .cloned()
            .ok_or_else(|| RuntimeError::Config(format!("data storage `{key}` is not configured")))
    }

    fn storage_err(key: &str) -> impl Fn(PluginError) -> RuntimeError + '_ {
        move |source| RuntimeError::Storage { storage: key.to_string(), source }
    }

    pub fn exists(&self, key: &str, path: &str) -> Result<bool> {
        self.get_file_storage(key)?.exists(path).map_err(Self::storage_err(key))
    }

    pub fn size(&self, key: &str, path: &str) -> Result<u64> {
        self.get_file_storage(key)?.size(path).map_err(Self::storage_err(key))
    }

    pub fn stat(&self, key: &str, path: &str) -> Result<FileStat> {
        self.get_file_storage(key)?.stat(path).map_err(Self::storage_err(key))
    }

    pub fn ls(&self, key: &str, path: &str, recursive: bool) -> Result<Vec<FileStat>> {
        self.get_file_storage(key)?.ls(path, recursive).map_err(Self::storage_err(key))
    }

    pub fn mkdir(&self, key: &str, path: &str, recursive: bool) -> Result<()> {
        self.get_file_storage(key)?.mkdir(path, recursive).map_err(Self::storage_err(key))
    }

    pub fn rm(&self, key: &str, path: &str) -> Result<()> {
        self.get_file_storage(key)?.rm(path).map_err(Self::storage_err(key))
    }

    pub fn rmdir(&self, key: &str, path: &str) -> Result<()> {
        self.get_file_storage(key)?.rmdir(path).map_err(Self::storage_err(key))
    }

    /// Run `f` over a read stream that is closed when `f` returns or unwinds.
    pub fn with_read_stream<T>(&self, key: &str, path: &str, f: impl FnOnce(&mut dyn Read) -> Result<T>) -> Result<T> {
        let mut reader = self.get_file_storage(key)?.read_byte_stream(path).map_err(Self::storage_err(key))?;
        f(&mut reader)
    }

    /// Run `f` over a write stream, flushing it on success. The stream is
    /// closed on every path out of `f`.
    pub fn with_write_stream<T>(
        &self,
        key: &str,
        path: &str,
        overwrite: bool,
        f: impl FnOnce(&mut dyn Write) -> Result<T>,
    ) -> Result<T> {
        let mut writer = self
            .get_file_storage(key)?
            .write_byte_stream(path, overwrite)
            .map_err(Self::storage_err(key))?;
        let value = f(&mut writer)?;
        writer.flush().map_err(|e| Self::storage_err(key)(PluginError::Io(e)))?;
        Ok(value)
    }

    pub fn read_table(&self, location: &StorageLocation, schema: &TableSchema) -> Result<Table> {
        let key = self.storage_key(location)?;
        let format = location.format.as_deref().unwrap_or(&self.default_format);
        self.get_data_storage(key)?
            .read_table(&location.path, schema, format)
            .map_err(Self::storage_err(key))
    }

    pub fn write_table(&self, location: &StorageLocation, table: &Table, overwrite: bool) -> Result<()> {
        let key = self.storage_key(location)?;
        let format = location.format.as_deref().unwrap_or(&self.default_format);
        self.get_data_storage(key)?
            .write_table(&location.path, table, format, overwrite)
            .map_err(Self::storage_err(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(root: &std::path::Path) -> StorageManager {
        let registry = PluginRegistry::new();
        registry.register_core_plugins().unwrap();
        let config = StorageConfig {
            buckets: BTreeMap::from([(
                "data".to_string(),
                PluginConfig::new("LOCAL").with_property(local::PROP_ROOT_PATH, root.to_string_lossy()),
            )]),
            default_bucket: Some("data".into()),
            default_format: DEFAULT_FORMAT.into(),
        };
        StorageManager::new(&registry, &config).unwrap()
    }

    #[test]
    fn streams_are_scoped_and_writes_default_to_no_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let storage = manager(dir.path());

        storage.with_write_stream("data", "out/a.txt", false, |w| Ok(w.write_all(b"abc").map_err(|e| RuntimeError::Internal(e.to_string()))?)).unwrap();
        let err = storage.with_write_stream("data", "out/a.txt", false, |_| Ok(())).unwrap_err();
        assert!(matches!(err, RuntimeError::Storage { ref storage, source: PluginError::AlreadyExists(_) } if storage == "data"));

        let body = storage
            .with_read_stream("data", "out/a.txt", |r| {
                let mut s = String::new();
                r.read_to_string(&mut s).map_err(|e| RuntimeError::Internal(e.to_string()))?;
                Ok(s)
            })
            .unwrap();
        assert_eq!(body, "abc");
        assert_eq!(storage.size("data", "out/a.txt").unwrap(), 3);

        let failed: Result<()> = storage.with_write_stream("data", "out/b.txt", false, |_| Err(RuntimeError::Internal("boom".into())));
        assert!(failed.is_err());
        assert!(storage.exists("data", "out/b.txt").unwrap());

        assert_eq!(storage.ls("data", "out", false).unwrap().len(), 2);
    }

    #[test]
    fn locations_fall_back_to_the_default_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let storage = manager(dir.path());
        let location = StorageLocation { storage: None, path: "x.json".into(), format: None };
        assert_eq!(storage.storage_key(&location).unwrap(), "data");
        assert!(storage.get_file_storage("other").is_err());
    }

    #[test]
    fn unknown_protocols_are_configuration_errors() {
        let registry = PluginRegistry::new();
        registry.register_core_plugins().unwrap();
        let config = StorageConfig {
            buckets: BTreeMap::from([("s3".to_string(), PluginConfig::new("S3"))]),
            ..StorageConfig::default()
        };
        let err = StorageManager::new(&registry, &config).err().unwrap();
        assert!(matches!(err, RuntimeError::Config(ref m) if m.contains("s3")));
    }
}
