use std::fmt;
use model_plugin::PluginError;
use thiserror::Error;

/// Every failure the runtime reports to its callers.
///
/// Variants map one-to-one onto operational categories so tooling can tell a
/// bad repository configuration from bad model code from a bug in the runtime.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("startup error: {0}")]
    Startup(String),

    #[error("plugin not available: no {service} plugin for protocol `{protocol}`")]
    PluginNotAvailable { service: String, protocol: String },

    #[error("plugin `{plugin}` does not conform to the plugin contract: {reason}")]
    PluginConformance { plugin: String, reason: String },

    #[error("repository `{repository}` failed for version `{version}`: {reason}")]
    Repository { repository: String, version: String, reason: String },

    #[error("could not load `{class}` from module `{module}`: {reason}")]
    ModelLoad { module: String, class: String, reason: String },

    #[error("model `{class}` failed validation: {reason}")]
    ModelValidation { class: String, reason: String },

    #[error("runtime validation failed: {0}")]
    RuntimeValidation(String),

    #[error("storage `{storage}` error: {source}")]
    Storage { storage: String, #[source] source: PluginError },

    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse grouping of [`RuntimeError`] for operators.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Config,
    Plugin,
    Repository,
    ModelLoad,
    ModelValidation,
    RuntimeValidation,
    Storage,
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Config => "config",
            ErrorCategory::Plugin => "plugin",
            ErrorCategory::Repository => "repository",
            ErrorCategory::ModelLoad => "model_load",
            ErrorCategory::ModelValidation => "model_validation",
            ErrorCategory::RuntimeValidation => "runtime_validation",
            ErrorCategory::Storage => "storage",
            ErrorCategory::Internal => "internal",
        };
        f.write_str(name)
    }
}

impl RuntimeError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            RuntimeError::Config(_) | RuntimeError::Startup(_) => ErrorCategory::Config,
            RuntimeError::PluginNotAvailable { .. } | RuntimeError::PluginConformance { .. } => ErrorCategory::Plugin,
            RuntimeError::Repository { .. } => ErrorCategory::Repository,
            RuntimeError::ModelLoad { .. } => ErrorCategory::ModelLoad,
            RuntimeError::ModelValidation { .. } => ErrorCategory::ModelValidation,
            RuntimeError::RuntimeValidation(_) => ErrorCategory::RuntimeValidation,
            RuntimeError::Storage { .. } => ErrorCategory::Storage,
            RuntimeError::Internal(_) => ErrorCategory::Internal,
        }
    }

    pub(crate) fn model_load(module: &str, class: &str, reason: impl fmt::Display) -> Self {
        RuntimeError::ModelLoad { module: module.to_string(), class: class.to_string(), reason: reason.to_string() }
    }

    pub(crate) fn model_validation(class: &str, reason: impl fmt::Display) -> Self {
        RuntimeError::ModelValidation { class: class.to_string(), reason: reason.to_string() }
    }
}

pub type Result<T, E = RuntimeError> = std::result::Result<T, E>;
