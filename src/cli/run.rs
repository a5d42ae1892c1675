use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use tracing::{error, info};

use super::CliContext;
use modelrt::runtime::{load_job, ModelRuntime};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Job descriptor (YAML or JSON)
    pub job: PathBuf,

    /// Replace outputs that already exist
    #[arg(long, default_value_t = false)]
    pub overwrite: bool,
}

pub async fn execute(args: RunArgs, context: &CliContext) -> anyhow::Result<()> {
    let mut job = load_job(&args.job)?;
    job.overwrite_outputs |= args.overwrite;
    let config = context.config.clone();

    info!(job = %args.job.display(), "modelrt starting job");
    let result = tokio::task::spawn_blocking(move || {
        let runtime = ModelRuntime::new(config)?;
        runtime.run_job(&job)
    })
    .await
    .context("job worker panicked")?;

    match result {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Err(e) => {
            error!(category = %e.category(), "job failed: {e}");
            Err(e.into())
        }
    }
}
