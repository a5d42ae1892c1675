use clap::Args;

use super::CliContext;
use model_plugin::ModelDescriptor;
use modelrt::runtime::ModelRuntime;

#[derive(Args, Debug)]
pub struct ScanArgs {
    /// Configured repository name
    pub repository: String,
    pub package: String,
    pub version: String,
    /// `module.Class` inside the package
    pub entry_point: String,

    /// Sub-path of the module root inside the checkout
    #[arg(long)]
    pub path: Option<String>,

    #[arg(long)]
    pub group: Option<String>,
}

pub async fn execute(args: ScanArgs, context: &CliContext) -> anyhow::Result<()> {
    let mut descriptor = ModelDescriptor::new(&args.repository, &args.package, &args.version, &args.entry_point);
    if let Some(path) = &args.path {
        descriptor = descriptor.with_path(path);
    }
    if let Some(group) = &args.group {
        descriptor = descriptor.with_group(group);
    }

    let config = context.config.clone();
    let definition = tokio::task::spawn_blocking(move || {
        let runtime = ModelRuntime::new(config)?;
        runtime.scan(&descriptor)
    })
    .await??;

    println!("{}", serde_json::to_string_pretty(&definition)?);
    Ok(())
}
