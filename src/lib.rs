pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod guard;
pub mod loader;
pub mod logger;
pub mod plugins;
pub mod repos;
pub mod runtime;
pub mod schema;
pub mod shim;
pub mod storage;
