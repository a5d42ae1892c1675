//! Plugin registry and the plugins that ship with the runtime.
pub mod builtin;
pub mod registry;

pub use registry::{service_name, PluginListing, PluginModule, PluginPackage, PluginRegistry, RegistrationHook, RESERVED_PREFIX};

/// Name of the optional extension package, registered when the binary carries it.
pub const EXTENSION_PACKAGE: &str = "modelrt.ext";
