use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = correction_ledger_cli::Cli::parse();
    correction_ledger_cli::run_cli(cli)
}
