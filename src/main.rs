use anyhow::Result;
use clap::Parser;

use wirecache::{cli::Cli, logging, run, settings::Settings};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // Usage and argument errors exit 1, matching the CLI contract.
            let _ = err.print();
            std::process::exit(1);
        }
    };
    let settings = Settings::from_cli(&cli);
    logging::init_logger(settings.verbose)?;
    run(settings).await
}
