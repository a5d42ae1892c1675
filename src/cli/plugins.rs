use clap::Args;

use super::CliContext;
use modelrt::runtime::ModelRuntime;

#[derive(Args, Debug)]
pub struct PluginsArgs {
    /// Print JSON instead of a table
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

pub async fn execute(args: PluginsArgs, context: &CliContext) -> anyhow::Result<()> {
    let runtime = ModelRuntime::new(context.config.clone())?;
    let plugins = runtime.registry().list_plugins();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&plugins)?);
        return Ok(());
    }
    for p in plugins {
        println!("{:<16} {:<16} {}", p.service, p.protocol, p.class);
    }
    Ok(())
}
