use std::path::PathBuf;

use clap::Args;

use super::CliContext;
use modelrt::schema::write_schema;

#[derive(Args, Debug)]
pub struct SchemaArgs {
    /// Directory to write `*.schema.json` into
    #[arg(long, default_value = "schemas")]
    pub out_dir: PathBuf,
}

pub async fn execute(args: SchemaArgs, _context: &CliContext) -> anyhow::Result<()> {
    let written = write_schema(&args.out_dir)?;
    println!("{} schemas written to {}", written.len(), args.out_dir.display());
    Ok(())
}
