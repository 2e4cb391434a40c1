use anyhow::Result;
use clap::Parser;
use ledger_tx::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    ledger_tx::telemetry::init(cli.verbose);
    cli.run().await
}
