use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct LogConfig {
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
}

impl LogConfig {
    pub fn new(log_level: &str, log_dir: Option<PathBuf>) -> Self {
        Self { log_level: log_level.to_string(), log_dir }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { log_level: "info".to_string(), log_dir: None }
    }
}

/// Keeps the file writers flushing until dropped. Hold it for the life of the process.
pub struct LogGuards {
    _guards: Vec<WorkerGuard>,
}

fn rolling(dir: &Path, file: &str) -> RollingFileAppender {
    RollingFileAppender::new(Rotation::DAILY, dir, file)
}

/// Install the global subscriber.
///
/// Human-readable logs always go to stderr. With a log directory, a plain
/// text log and a JSON event log (`<log_file>.json`, model output and job
/// events only) are written there as well, rotated daily.
pub fn init_tracing(config: &LogConfig, log_file: &str) -> Result<LogGuards> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .with_context(|| format!("invalid log level `{}`", config.log_level))?;

    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);

    let mut guards = Vec::new();
    let file_layers = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).with_context(|| format!("cannot create log directory `{}`", dir.display()))?;

            let (txt_writer, txt_guard) = tracing_appender::non_blocking(rolling(dir, log_file));
            let (json_writer, json_guard) = tracing_appender::non_blocking(rolling(dir, &format!("{log_file}.json")));
            guards.push(txt_guard);
            guards.push(json_guard);

            let txt_layer = fmt::layer().with_writer(txt_writer).with_ansi(false);
            let json_layer = fmt::layer()
                .json()
                .with_writer(json_writer)
                .with_target(true)
                .with_filter(EnvFilter::new("model=info,modelrt::executor=info"));
            Some(txt_layer.and_then(json_layer))
        }
        None => None,
    };

    Registry::default()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layers)
        .try_init()
        .context("a global tracing subscriber is already installed")?;

    Ok(LogGuards { _guards: guards })
}
