//! converged daemon and command-line tools.

use clap::Parser;
use log::debug;

use converged::cli::{self, Cli};
use converged::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    let args = Cli::parse();

    // Load configuration
    let cfg = Config::load()?;
    debug!("Loaded configuration: {:?}", cfg);

    cli::run(args, cfg).await
}
