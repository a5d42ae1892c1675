pub mod package;
pub mod plugin;
pub mod repository;
pub mod storage;
pub mod table;

pub use package::{ModelDescriptor, ModelPackage};
pub use plugin::{PluginArgs, PluginClass, PluginConfig, PluginError};
pub use repository::ModelRepository;
pub use storage::{DataStorage, FileStat, FileStorage, FileType};
pub use table::{BasicType, FieldSchema, Table, TableSchema};
