use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    record_toggle_cli::init_tracing();
    let cli = record_toggle_cli::Cli::parse();
    record_toggle_cli::run_cli(cli)
}
