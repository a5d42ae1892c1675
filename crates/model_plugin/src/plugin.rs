use std::{collections::{BTreeMap, HashMap}, fmt, sync::Arc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Constructor parameter carrying the name the host configured the resource under.
pub const PARAM_RESOURCE_NAME: &str = "resource_name";
/// Constructor parameter carrying the typed [`PluginConfig`].
pub const PARAM_CONFIG: &str = "config";
/// Constructor parameter carrying public and secret properties flattened into one map.
pub const PARAM_PROPERTIES: &str = "properties";

/// The only constructor parameters the host knows how to supply.
pub const RECOGNIZED_PARAMS: [&str; 3] = [PARAM_RESOURCE_NAME, PARAM_CONFIG, PARAM_PROPERTIES];

/// Configuration for one plugin instance: which protocol to use and its properties.
///
/// Secrets are kept apart from public properties so they never show up in
/// diagnostics. They are only merged when the host flattens the configuration
/// into the `properties` constructor argument.
#[derive(Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct PluginConfig {
    pub protocol: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
}

impl PluginConfig {
    pub fn new(protocol: impl Into<String>) -> Self {
        Self { protocol: protocol.into(), properties: BTreeMap::new(), secrets: BTreeMap::new() }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_secret(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(key.into(), value.into());
        self
    }

    /// Public properties overlaid with secrets. A secret wins over a public
    /// property of the same name.
    pub fn flattened_properties(&self) -> HashMap<String, String> {
        let mut flat: HashMap<String, String> = self.properties.clone().into_iter().collect();
        for (k, v) in &self.secrets {
            flat.insert(k.clone(), v.clone());
        }
        flat
    }
}

impl fmt::Debug for PluginConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secret_keys: Vec<&String> = self.secrets.keys().collect();
        f.debug_struct("PluginConfig")
            .field("protocol", &self.protocol)
            .field("properties", &self.properties)
            .field("secrets", &secret_keys)
            .finish()
    }
}

/// The arguments handed to a plugin constructor.
///
/// Only the parameters the plugin declared are populated. Asking for one that
/// was not declared is an error, and the host reports it as a conformance
/// problem of the plugin.
#[derive(Debug, Clone, Default)]
pub struct PluginArgs {
    resource_name: Option<String>,
    config: Option<PluginConfig>,
    properties: Option<HashMap<String, String>>,
}

impl PluginArgs {
    /// Build the argument set for a constructor that declared `declared`.
    /// Unknown names are ignored here; the registry rejects them before construction.
    pub fn for_declared(declared: &[String], resource_name: &str, config: &PluginConfig) -> Self {
        let mut args = PluginArgs::default();
        for param in declared {
            match param.as_str() {
                PARAM_RESOURCE_NAME => args.resource_name = Some(resource_name.to_string()),
                PARAM_CONFIG => args.config = Some(config.clone()),
                PARAM_PROPERTIES => args.properties = Some(config.flattened_properties()),
                _ => {}
            }
        }
        args
    }

    pub fn resource_name(&self) -> Result<&str, PluginError> {
        self.resource_name.as_deref().ok_or(PluginError::MissingArgument(PARAM_RESOURCE_NAME))
    }

    pub fn config(&self) -> Result<&PluginConfig, PluginError> {
        self.config.as_ref().ok_or(PluginError::MissingArgument(PARAM_CONFIG))
    }

    pub fn properties(&self) -> Result<&HashMap<String, String>, PluginError> {
        self.properties.as_ref().ok_or(PluginError::MissingArgument(PARAM_PROPERTIES))
    }

    /// Look up a property that must be present, from `properties` if declared,
    /// otherwise from the public part of `config`.
    pub fn require_property(&self, key: &str) -> Result<String, PluginError> {
        self.optional_property(key)?
            .ok_or_else(|| PluginError::Config(format!("missing required property `{key}`")))
    }

    pub fn optional_property(&self, key: &str) -> Result<Option<String>, PluginError> {
        if let Some(props) = &self.properties {
            return Ok(props.get(key).cloned());
        }
        if let Some(config) = &self.config {
            return Ok(config.properties.get(key).cloned());
        }
        Err(PluginError::MissingArgument(PARAM_PROPERTIES))
    }
}

type Constructor<S> = dyn Fn(&PluginArgs) -> Result<Box<S>, PluginError> + Send + Sync;

/// A registrable plugin implementation for the service interface `S`.
///
/// `params` is the constructor signature: the list of argument names the
/// implementation wants the host to supply.
pub struct PluginClass<S: ?Sized> {
    name: String,
    params: Vec<String>,
    constructor: Arc<Constructor<S>>,
}

impl<S: ?Sized> PluginClass<S> {
    pub fn new<F>(name: impl Into<String>, params: &[&str], constructor: F) -> Self
    where
        F: Fn(&PluginArgs) -> Result<Box<S>, PluginError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            params: params.iter().map(|p| p.to_string()).collect(),
            constructor: Arc::new(constructor),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    /// Declared parameters the host cannot supply.
    pub fn unrecognized_params(&self) -> Vec<&str> {
        self.params
            .iter()
            .map(String::as_str)
            .filter(|p| !RECOGNIZED_PARAMS.contains(p))
            .collect()
    }

    pub fn construct(&self, args: &PluginArgs) -> Result<Box<S>, PluginError> {
        (self.constructor)(args)
    }
}

impl<S: ?Sized> Clone for PluginClass<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            params: self.params.clone(),
            constructor: Arc::clone(&self.constructor),
        }
    }
}

impl<S: ?Sized> fmt::Debug for PluginClass<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginClass")
            .field("name", &self.name)
            .field("params", &self.params)
            .finish()
    }
}

/// Errors that repository and storage plugins return.
#[derive(Error, Debug)]
pub enum PluginError {
    /// The constructor asked for an argument it did not declare.
    #[error("constructor argument `{0}` was not declared")]
    MissingArgument(&'static str),

    #[error("invalid plugin configuration: {0}")]
    Config(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("checkout failed: {0}")]
    Checkout(String),

    #[error("operation timed out after {0} ms")]
    Timeout(u64),

    #[error("data does not match schema: {0}")]
    Schema(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("plugin error: {0}")]
    Other(String),
}

impl PluginError {
    /// Whether retrying the same operation could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, PluginError::Timeout(_) | PluginError::Checkout(_) | PluginError::Io(_))
    }
}

impl From<serde_json::Error> for PluginError {
    fn from(err: serde_json::Error) -> PluginError {
        PluginError::Json(err.to_string())
    }
}

impl From<anyhow::Error> for PluginError {
    fn from(err: anyhow::Error) -> PluginError {
        PluginError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flattened_properties_prefer_secrets() {
        let config = PluginConfig::new("local")
            .with_property("repoUrl", "/models")
            .with_property("token", "public")
            .with_secret("token", "s3cr3t");

        let flat = config.flattened_properties();
        assert_eq!(flat.get("repoUrl").map(String::as_str), Some("/models"));
        assert_eq!(flat.get("token").map(String::as_str), Some("s3cr3t"));
    }

    #[test]
    fn debug_hides_secret_values() {
        let config = PluginConfig::new("git").with_secret("token", "s3cr3t");
        let dbg = format!("{config:?}");
        assert!(dbg.contains("token"));
        assert!(!dbg.contains("s3cr3t"));
    }

    #[test]
    fn undeclared_arguments_are_reported() {
        let config = PluginConfig::new("local").with_property("repoUrl", "/models");
        let args = PluginArgs::for_declared(&["config".to_string()], "models", &config);

        assert!(args.config().is_ok());
        assert!(matches!(args.resource_name(), Err(PluginError::MissingArgument("resource_name"))));
        assert!(matches!(args.properties(), Err(PluginError::MissingArgument("properties"))));
        assert_eq!(args.require_property("repoUrl").unwrap(), "/models");
    }

    #[test]
    fn unrecognized_params_are_listed() {
        let class: PluginClass<str> = PluginClass::new("Odd", &["config", "credentials"], |_| {
            Err(PluginError::Other("never built".into()))
        });
        assert_eq!(class.unrecognized_params(), vec!["credentials"]);
    }
}
