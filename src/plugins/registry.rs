//! PluginRegistry: maps (service interface, protocol) to a plugin class and
//! builds configured instances from it.
use std::{
    any::{Any, TypeId},
    collections::HashMap,
    sync::RwLock,
};
use model_plugin::{plugin::RECOGNIZED_PARAMS, PluginArgs, PluginClass, PluginConfig, PluginError};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    error::{Result, RuntimeError},
    guard::ensure_host_code,
};

/// Package names under this prefix belong to the runtime itself.
pub const RESERVED_PREFIX: &str = "modelrt.";

/// Registration hook run for one module of a plugin package.
pub type RegistrationHook = fn(&PluginRegistry) -> Result<()>;

/// One module of a plugin package.
#[derive(Debug, Clone)]
pub struct PluginModule {
    pub name: String,
    pub register: RegistrationHook,
}

impl PluginModule {
    pub fn new(name: &str, register: RegistrationHook) -> Self {
        Self { name: name.to_string(), register }
    }
}

/// A named group of plugin modules registered together.
#[derive(Debug, Clone)]
pub struct PluginPackage {
    pub name: String,
    pub modules: Vec<PluginModule>,
}

impl PluginPackage {
    pub fn new(name: &str, modules: Vec<PluginModule>) -> Self {
        Self { name: name.to_string(), modules }
    }
}

/// A row of [`PluginRegistry::list_plugins`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct PluginListing {
    pub service: String,
    pub protocol: String,
    pub class: String,
}

struct Registration {
    service: String,
    class_name: String,
    class: Box<dyn Any + Send + Sync>,
}

/// Registry of plugin classes, keyed by service interface and protocol.
///
/// Protocol names are matched case-insensitively. Registrations are additive;
/// registering the same (service, protocol) again replaces the earlier class.
#[derive(Default)]
pub struct PluginRegistry {
    entries: RwLock<HashMap<(TypeId, String), Registration>>,
}

/// Short, readable name of a service interface, e.g. `FileStorage`.
pub fn service_name<S: ?Sized + 'static>() -> String {
    let full = std::any::type_name::<S>();
    let full = full.strip_prefix("dyn ").unwrap_or(full);
    full.rsplit("::").next().unwrap_or(full).to_string()
}

fn protocol_key(protocol: &str) -> String {
    protocol.trim().to_ascii_lowercase()
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `class` for the service `S` under every protocol in `protocols`.
    pub fn register_plugin<S: ?Sized + 'static>(&self, class: PluginClass<S>, protocols: &[&str]) -> Result<()> {
        ensure_host_code("register_plugin")?;
        let service = service_name::<S>();
        let mut entries = self
            .entries
            .write()
            .map_err(|_| RuntimeError::Internal("plugin registry lock poisoned".into()))?;

        for protocol in protocols {
            let key = (TypeId::of::<S>(), protocol_key(protocol));
            let previous = entries.insert(
                key,
                Registration {
                    service: service.clone(),
                    class_name: class.name().to_string(),
                    class: Box::new(class.clone()),
                },
            );
            match previous {
                Some(old) => info!(%service, protocol, class = class.name(), replaced = %old.class_name, "plugin re-registered"),
                None => info!(%service, protocol, class = class.name(), "plugin registered"),
            }
        }
        Ok(())
    }

    pub fn is_plugin_available<S: ?Sized + 'static>(&self, protocol: &str) -> Result<bool> {
        ensure_host_code("is_plugin_available")?;
        Ok(self
            .entries
            .read()
            .map(|entries| entries.contains_key(&(TypeId::of::<S>(), protocol_key(protocol))))
            .unwrap_or(false))
    }

    fn find_class<S: ?Sized + 'static>(&self, protocol: &str) -> Result<PluginClass<S>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| RuntimeError::Internal("plugin registry lock poisoned".into()))?;
        entries
            .get(&(TypeId::of::<S>(), protocol_key(protocol)))
            .and_then(|reg| reg.class.downcast_ref::<PluginClass<S>>())
            .cloned()
            .ok_or_else(|| RuntimeError::PluginNotAvailable {
                service: service_name::<S>(),
                protocol: protocol.to_string(),
            })
    }

    /// Construct the plugin registered for `config.protocol`.
    ///
    /// The constructor receives exactly the arguments it declared. Declaring an
    /// argument the host cannot supply, or using one that was not declared,
    /// is a conformance failure of the plugin.
    pub fn load_plugin<S: ?Sized + 'static>(&self, resource_name: &str, config: &PluginConfig) -> Result<Box<S>> {
        ensure_host_code("load_plugin")?;
        let class = self.find_class::<S>(&config.protocol)?;

        let unsupported = class.unrecognized_params();
        if !unsupported.is_empty() {
            return Err(RuntimeError::PluginConformance {
                plugin: class.name().to_string(),
                reason: format!(
                    "constructor declares unsupported parameter(s) {:?}; supported parameters are {:?}",
                    unsupported, RECOGNIZED_PARAMS
                ),
            });
        }

        let args = PluginArgs::for_declared(class.params(), resource_name, config);
        let instance = class.construct(&args).map_err(|e| match e {
            PluginError::MissingArgument(param) => RuntimeError::PluginConformance {
                plugin: class.name().to_string(),
                reason: format!("constructor used `{param}` without declaring it"),
            },
            other => RuntimeError::Config(format!(
                "cannot create `{resource_name}` with plugin `{}`: {other}",
                class.name()
            )),
        })?;

        debug!(resource_name, protocol = %config.protocol, class = class.name(), "plugin loaded");
        Ok(instance)
    }

    /// Everything registered, sorted by service then protocol.
    pub fn list_plugins(&self) -> Vec<PluginListing> {
        let mut listing: Vec<PluginListing> = self
            .entries
            .read()
            .map(|entries| {
                entries
                    .iter()
                    .map(|((_, protocol), reg)| PluginListing {
                        service: reg.service.clone(),
                        protocol: protocol.clone(),
                        class: reg.class_name.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        listing.sort();
        listing
    }

    /// Register the plugins that ship with the runtime.
    pub fn register_core_plugins(&self) -> Result<usize> {
        self.register_package(&super::builtin::core_package())
    }

    /// Register a third-party plugin package. Names under the reserved
    /// `modelrt.` prefix are refused.
    pub fn register_plugin_package(&self, package: &PluginPackage) -> Result<usize> {
        if package.name.starts_with(RESERVED_PREFIX) {
            return Err(RuntimeError::Config(format!(
                "plugin package `{}` uses the reserved prefix `{RESERVED_PREFIX}`",
                package.name
            )));
        }
        self.register_package(package)
    }

    /// Register the extension package if it is present in `available`.
    /// A missing extension package is not an error.
    pub fn register_extension_package(&self, available: &[PluginPackage]) -> Result<usize> {
        match available.iter().find(|p| p.name == super::EXTENSION_PACKAGE) {
            Some(package) => self.register_package(package),
            None => {
                debug!(package = super::EXTENSION_PACKAGE, "no extension plugins available");
                Ok(0)
            }
        }
    }

    /// Run every module's hook. A failing module is logged and skipped.
    fn register_package(&self, package: &PluginPackage) -> Result<usize> {
        ensure_host_code("register_plugin_package")?;
        let mut registered = 0;
        for module in &package.modules {
            match (module.register)(self) {
                Ok(()) => {
                    debug!(package = %package.name, module = %module.name, "plugin module registered");
                    registered += 1;
                }
                Err(e) => warn!(package = %package.name, module = %module.name, error = %e, "skipping plugin module"),
            }
        }
        info!(package = %package.name, modules = registered, "plugin package registered");
        Ok(registered)
    }
}
