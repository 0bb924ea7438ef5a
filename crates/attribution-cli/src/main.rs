use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = attribution_cli::Cli::parse();
    attribution_cli::run_cli(cli)
}
