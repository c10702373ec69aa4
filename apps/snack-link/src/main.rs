mod cli;

use anyhow::Result;
use clap::Parser;
use snack_link::config::Config;
use snack_link::telemetry::logging::{self, LogConfig};

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
        rotation: cli.log_rotation,
    })?;

    match cli.command {
        Commands::Resolve { address } => cli::resolve(&address),
        Commands::Features { version, table } => cli::features(&version, table.as_ref()),
        Commands::Watch {
            address,
            test_transport,
            experimental,
        } => {
            let config = Config::from_env();
            cli::watch(&config, &address, test_transport, experimental).await
        }
    }
}
