use std::fmt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Language tag for model code the runtime can load.
pub const LANGUAGE_RHAI: &str = "rhai";

fn default_language() -> String {
    LANGUAGE_RHAI.to_string()
}

/// A checkoutable unit of model code. Immutable once built and used as a
/// cache key for checkouts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct ModelPackage {
    #[serde(default = "default_language")]
    pub language: String,
    pub repository: String,
    #[serde(default)]
    pub package_group: Option<String>,
    pub package: String,
    pub version: String,
    /// Sub-path inside the checkout holding the importable module root.
    #[serde(default)]
    pub path: Option<String>,
}

impl fmt::Display for ModelPackage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.package_group {
            Some(group) => write!(f, "{}:{}/{}@{}", self.repository, group, self.package, self.version),
            None => write!(f, "{}:{}@{}", self.repository, self.package, self.version),
        }
    }
}

/// Everything needed to locate and load one model: its package plus the
/// dotted `module.Class` entry point inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct ModelDescriptor {
    #[serde(default = "default_language")]
    pub language: String,
    pub repository: String,
    #[serde(default)]
    pub package_group: Option<String>,
    pub package: String,
    pub version: String,
    #[serde(default)]
    pub path: Option<String>,
    pub entry_point: String,
}

impl ModelDescriptor {
    pub fn new(repository: &str, package: &str, version: &str, entry_point: &str) -> Self {
        Self {
            language: default_language(),
            repository: repository.to_string(),
            package_group: None,
            package: package.to_string(),
            version: version.to_string(),
            path: None,
            entry_point: entry_point.to_string(),
        }
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.path = Some(path.to_string());
        self
    }

    pub fn with_group(mut self, group: &str) -> Self {
        self.package_group = Some(group.to_string());
        self
    }

    pub fn package(&self) -> ModelPackage {
        ModelPackage {
            language: self.language.clone(),
            repository: self.repository.clone(),
            package_group: self.package_group.clone(),
            package: self.package.clone(),
            version: self.version.clone(),
            path: self.path.clone(),
        }
    }

    /// Split the entry point into `(module, class)`. The class is the last
    /// dotted segment; everything before it is the module.
    pub fn split_entry_point(&self) -> Option<(&str, &str)> {
        let (module, class) = self.entry_point.rsplit_once('.')?;
        if module.is_empty() || class.is_empty() {
            return None;
        }
        Some((module, class))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_point_splits_on_last_dot() {
        let d = ModelDescriptor::new("local", "demo", "1.0", "pkg.models.HelloWorldModel");
        assert_eq!(d.split_entry_point(), Some(("pkg.models", "HelloWorldModel")));

        let bad = ModelDescriptor::new("local", "demo", "1.0", "HelloWorldModel");
        assert_eq!(bad.split_entry_point(), None);

        let trailing = ModelDescriptor::new("local", "demo", "1.0", "hello.");
        assert_eq!(trailing.split_entry_point(), None);
    }

    #[test]
    fn descriptor_defaults_language_when_deserialized() {
        let d: ModelDescriptor = serde_json::from_str(
            r#"{"repository":"local","package":"demo","version":"1.0","entry_point":"a.B"}"#,
        )
        .unwrap();
        assert_eq!(d.language, LANGUAGE_RHAI);
        assert_eq!(d.package().to_string(), "local:demo@1.0");
    }
}
