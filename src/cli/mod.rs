use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

pub mod plugins;
pub mod run;
pub mod scan;
pub mod schema;

use plugins::PluginsArgs;
use run::RunArgs;
use scan::ScanArgs;
use schema::SchemaArgs;

use modelrt::{config::RuntimeConfig, logger::LogConfig};

#[derive(Parser, Debug)]
#[command(
    name = "modelrt",
    about = "Run models from versioned repositories in isolated namespaces",
    version = "0.2.0"
)]
pub struct Cli {
    /// Runtime configuration (YAML). Falls back to $MODELRT_CONFIG, then built-in defaults.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (e.g. error, warn, info, debug, trace). RUST_LOG wins when set.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Also write rolling log files into this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a job descriptor
    Run(RunArgs),

    /// Load a model and print its declared parameters, inputs and outputs
    Scan(ScanArgs),

    /// List registered plugins
    Plugins(PluginsArgs),

    /// Emit JSON‐Schema
    Schema(SchemaArgs),
}

#[derive(Clone, Debug)]
pub struct CliContext {
    pub config: RuntimeConfig,
    pub log: LogConfig,
}

impl CliContext {
    pub fn new(config: RuntimeConfig, log: LogConfig) -> Self {
        Self { config, log }
    }

    /// Read the runtime config named on the command line or in the environment.
    pub fn load(config: Option<PathBuf>, log: LogConfig) -> anyhow::Result<Self> {
        let path = config.or_else(|| std::env::var("MODELRT_CONFIG").ok().map(PathBuf::from));
        let config = match path {
            Some(path) => RuntimeConfig::load(&path).with_context(|| format!("loading {}", path.display()))?,
            None => RuntimeConfig::default(),
        };
        Ok(Self::new(config, log))
    }
}

pub async fn execute(context: &CliContext, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Run(args) => run::execute(args, context).await,
        Commands::Scan(args) => scan::execute(args, context).await,
        Commands::Plugins(args) => plugins::execute(args, context).await,
        Commands::Schema(args) => schema::execute(args, context).await,
    }
}
