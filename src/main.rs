mod cli;

use clap::Parser;
use std::process;
use tracing::error;

use cli::{Cli, CliContext};
use modelrt::logger::{init_tracing, LogConfig};

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log = LogConfig::new(&cli.log_level, cli.log_dir.clone());
    let _guards = init_tracing(&log, "modelrt.log")?;

    let context = CliContext::load(cli.config, log)?;
    if let Err(e) = cli::execute(&context, cli.command).await {
        error!("{e:#}");
        eprintln!("error: {e:#}");
        process::exit(1);
    }
    Ok(())
}
