use std::{
    fs,
    io::Read,
    path::{Component, Path, PathBuf},
    time::Duration,
};
use model_plugin::{plugin::PARAM_PROPERTIES, ModelPackage, ModelRepository, PluginClass, PluginError};
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

pub const PROP_INDEX_URL: &str = "indexUrl";
pub const PROP_TIMEOUT_SECONDS: &str = "timeoutSeconds";
pub const MANIFEST_FILE: &str = "manifest.json";

const DEFAULT_TIMEOUT_SECONDS: u64 = 60;

/// Files published for one package version.
#[derive(Debug, Deserialize)]
pub struct PackageManifest {
    pub files: Vec<String>,
}

/// Downloads versioned packages from an index laid out as
/// `<index>/[<group>/]<package>/<version>/manifest.json` plus the files it lists.
/// `file://` and `http(s)://` indexes are supported.
#[derive(Debug)]
pub struct PackageIndexRepository {
    index: Url,
    timeout: Duration,
}

impl PackageIndexRepository {
    pub fn new(index_url: &str) -> Result<Self, PluginError> {
        let mut index = Url::parse(index_url).map_err(|e| PluginError::Config(format!("invalid index url `{index_url}`: {e}")))?;
        if !matches!(index.scheme(), "file" | "http" | "https") {
            return Err(PluginError::Config(format!("unsupported index scheme `{}`", index.scheme())));
        }
        if !index.path().ends_with('/') {
            let path = format!("{}/", index.path());
            index.set_path(&path);
        }
        Ok(Self { index, timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECONDS) })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn plugin_class() -> PluginClass<dyn ModelRepository> {
        PluginClass::new("PackageIndexRepository", &[PARAM_PROPERTIES], |args| {
            let mut repo = PackageIndexRepository::new(&args.require_property(PROP_INDEX_URL)?)?;
            if let Some(secs) = args.optional_property(PROP_TIMEOUT_SECONDS)? {
                let secs: u64 = secs
                    .parse()
                    .map_err(|_| PluginError::Config(format!("property `{PROP_TIMEOUT_SECONDS}` has invalid value `{secs}`")))?;
                repo = repo.with_timeout(Duration::from_secs(secs));
            }
            Ok(Box::new(repo) as Box<dyn ModelRepository>)
        })
    }

    fn version_url(&self, package: &ModelPackage) -> Result<Url, PluginError> {
        let mut relative = String::new();
        if let Some(group) = &package.package_group {
            relative.push_str(group);
            relative.push('/');
        }
        relative.push_str(&format!("{}/{}/", package.package, package.version));
        self.index
            .join(&relative)
            .map_err(|e| PluginError::Config(format!("cannot address {package} in the index: {e}")))
    }

    fn fetch(&self, url: &Url) -> Result<Vec<u8>, PluginError> {
        match url.scheme() {
            "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|_| PluginError::Config(format!("invalid file url `{url}`")))?;
                fs::read(&path).map_err(|e| match e.kind() {
                    std::io::ErrorKind::NotFound => PluginError::NotFound(url.to_string()),
                    _ => PluginError::Io(e),
                })
            }
            _ => {
                let client = reqwest::blocking::Client::builder()
                    .timeout(self.timeout)
                    .build()
                    .map_err(|e| PluginError::Other(e.to_string()))?;
                let response = client.get(url.clone()).send().map_err(|e| {
                    if e.is_timeout() {
                        PluginError::Timeout(self.timeout.as_millis() as u64)
                    } else {
                        PluginError::Checkout(e.to_string())
                    }
                })?;
                if response.status() == reqwest::StatusCode::NOT_FOUND {
                    return Err(PluginError::NotFound(url.to_string()));
                }
                let mut response = response
                    .error_for_status()
                    .map_err(|e| PluginError::Checkout(e.to_string()))?;
                let mut body = Vec::new();
                response.read_to_end(&mut body)?;
                Ok(body)
            }
        }
    }
}

/// Manifest entries must stay inside the checkout directory.
fn safe_relative_path(entry: &str) -> Result<PathBuf, PluginError> {
    let path = Path::new(entry);
    let safe = !entry.is_empty() && path.components().all(|c| matches!(c, Component::Normal(_)));
    if safe {
        Ok(path.to_path_buf())
    } else {
        Err(PluginError::Checkout(format!("manifest entry `{entry}` is not a safe relative path")))
    }
}

impl ModelRepository for PackageIndexRepository {
    fn checkout(&self, package: &ModelPackage, checkout_dir: &Path) -> Result<Option<PathBuf>, PluginError> {
        let base = self.version_url(package)?;
        let manifest_url = base
            .join(MANIFEST_FILE)
            .map_err(|e| PluginError::Config(e.to_string()))?;
        let manifest: PackageManifest = serde_json::from_slice(&self.fetch(&manifest_url)?)?;
        info!(%package, files = manifest.files.len(), index = %self.index, "package index checkout");

        for entry in &manifest.files {
            let relative = safe_relative_path(entry)?;
            let url = base.join(entry).map_err(|e| PluginError::Config(e.to_string()))?;
            let target = checkout_dir.join(&relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&target, self.fetch(&url)?)?;
            debug!(file = %relative.display(), "downloaded");
        }
        self.get_checkout_path(package, checkout_dir)
    }

    fn get_checkout_path(&self, package: &ModelPackage, checkout_dir: &Path) -> Result<Option<PathBuf>, PluginError> {
        Ok(Some(match &package.path {
            Some(path) => checkout_dir.join(path),
            None => checkout_dir.to_path_buf(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model_plugin::ModelDescriptor;

    fn publish(index: &Path, version_dir: &str, files: &[(&str, &str)]) {
        let dir = index.join(version_dir);
        for (name, body) in files {
            let path = dir.join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, body).unwrap();
        }
        let names: Vec<&str> = files.iter().map(|(n, _)| *n).collect();
        fs::write(dir.join(MANIFEST_FILE), serde_json::json!({ "files": names }).to_string()).unwrap();
    }

    #[test]
    fn checkout_downloads_manifest_files() {
        let index = tempfile::tempdir().unwrap();
        publish(
            index.path(),
            "acme/hello/1.2.0",
            &[("hello/mod.rhai", "export const A = 1;"), ("hello/util.rhai", "export const B = 2;")],
        );

        let url = Url::from_directory_path(index.path()).unwrap();
        let repo = PackageIndexRepository::new(url.as_str()).unwrap();
        let package = ModelDescriptor::new("index", "hello", "1.2.0", "hello.A").with_group("acme").package();
        let checkout = tempfile::tempdir().unwrap();

        let path = repo.checkout(&package, checkout.path()).unwrap().unwrap();
        assert_eq!(path, checkout.path());
        assert!(path.join("hello/util.rhai").is_file());
    }

    #[test]
    fn missing_versions_and_unsafe_entries_fail() {
        let index = tempfile::tempdir().unwrap();
        publish(index.path(), "hello/1.0", &[("../escape.rhai", "")]);
        let url = Url::from_directory_path(index.path()).unwrap();
        let repo = PackageIndexRepository::new(url.as_str()).unwrap();
        let checkout = tempfile::tempdir().unwrap();

        let missing = ModelDescriptor::new("index", "hello", "9.9", "hello.A").package();
        assert!(matches!(repo.checkout(&missing, checkout.path()), Err(PluginError::NotFound(_))));

        let unsafe_pkg = ModelDescriptor::new("index", "hello", "1.0", "hello.A").package();
        assert!(matches!(repo.checkout(&unsafe_pkg, checkout.path()), Err(PluginError::Checkout(_))));
    }

    #[test]
    fn only_file_and_http_indexes_are_supported() {
        assert!(PackageIndexRepository::new("ftp://example.com/index").is_err());
        assert!(PackageIndexRepository::new("not a url").is_err());
        assert!(PackageIndexRepository::new("https://example.com/index").is_ok());
    }
}
