use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
};
use dashmap::DashMap;
use model_plugin::PluginConfig;
use once_cell::sync::Lazy;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    error::{Result, RuntimeError},
    guard::GuardLimits,
    storage::StorageConfig,
};

/// Where `${NAME}` placeholders in configuration are looked up.
pub trait ConfigLookup: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// Process environment, optionally primed from a `.env` file.
#[derive(Clone, Debug)]
pub struct EnvConfig;

impl EnvConfig {
    pub fn new(env_file: Option<&Path>) -> Self {
        if let Some(env_file) = env_file {
            if env_file.exists() {
                dotenvy::from_path(env_file).ok();
                info!("Loaded .env from {}", env_file.display());
            } else {
                debug!("no .env at {}", env_file.display());
            }
        }
        Self
    }
}

impl ConfigLookup for EnvConfig {
    fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }
}

/// In-memory lookup, mostly for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct MapConfig {
    map: DashMap<String, String>,
}

impl MapConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: &str, value: &str) {
        self.map.insert(key.to_string(), value.to_string());
    }
}

impl ConfigLookup for MapConfig {
    fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }
}

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap_or_else(|e| unreachable!("placeholder pattern: {e}"))
});

/// Replace every `${NAME}` in `value`. An undefined name is a configuration error.
pub fn expand_placeholders(value: &str, lookup: &dyn ConfigLookup) -> Result<String> {
    let mut missing = None;
    let expanded = PLACEHOLDER.replace_all(value, |caps: &regex::Captures| {
        let name = &caps[1];
        lookup.get(name).unwrap_or_else(|| {
            missing.get_or_insert_with(|| name.to_string());
            String::new()
        })
    });
    match missing {
        Some(name) => Err(RuntimeError::Config(format!("undefined configuration variable `{name}`"))),
        None => Ok(expanded.into_owned()),
    }
}

fn expand_plugin_config(config: &mut PluginConfig, lookup: &dyn ConfigLookup) -> Result<()> {
    for value in config.properties.values_mut().chain(config.secrets.values_mut()) {
        *value = expand_placeholders(value, lookup)?;
    }
    Ok(())
}

fn default_scratch_dir() -> PathBuf {
    env::temp_dir().join("modelrt")
}

/// Everything the runtime needs at startup.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Parent of every scope's scratch directory.
    pub scratch_dir: PathBuf,
    /// Searched for model modules when no shim is active.
    pub host_module_paths: Vec<PathBuf>,
    pub repositories: BTreeMap<String, PluginConfig>,
    pub storage: StorageConfig,
    pub guard: GuardLimits,
    /// Third-party plugin packages to register after the core plugins.
    pub plugin_packages: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            scratch_dir: default_scratch_dir(),
            host_module_paths: Vec::new(),
            repositories: BTreeMap::new(),
            storage: StorageConfig::default(),
            guard: GuardLimits::default(),
            plugin_packages: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    /// Parse YAML and expand placeholders in plugin properties and secrets.
    pub fn from_yaml(text: &str, lookup: &dyn ConfigLookup) -> Result<Self> {
        let mut config: RuntimeConfig =
            serde_yaml_bw::from_str(text).map_err(|e| RuntimeError::Config(format!("invalid runtime config: {e}")))?;
        for repo in config.repositories.values_mut() {
            expand_plugin_config(repo, lookup)?;
        }
        for bucket in config.storage.buckets.values_mut() {
            expand_plugin_config(bucket, lookup)?;
        }
        Ok(config)
    }

    /// Load a config file. A `.env` beside it is read first, and relative
    /// paths are taken relative to the file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| RuntimeError::Config(format!("cannot read `{}`: {e}", path.display())))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let lookup = EnvConfig::new(Some(&base.join(".env")));

        let mut config = Self::from_yaml(&text, &lookup)?;
        config.resolve_paths(base);
        info!(config = %path.display(), repositories = config.repositories.len(), buckets = config.storage.buckets.len(), "runtime config loaded");
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        if self.scratch_dir.is_relative() {
            self.scratch_dir = base.join(&self.scratch_dir);
        }
        for path in &mut self.host_module_paths {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }
}
