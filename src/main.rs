//! orchestra-core CLI entry point.
//!
//! A thin composition layer: parse arguments, set up logging, dispatch to
//! the planning client and orchestrator, and report errors.

use clap::Parser;

use orchestra_core::app::{handle_fatal_error, init_logging, AppConfig};
use orchestra_core::cli::{execute_command, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let app_config = match AppConfig::new(cli.verbose) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to initialize application configuration: {e}");
            std::process::exit(1);
        }
    };

    init_logging(&app_config);

    let result = execute_command(cli.command, &app_config.planning_base_url, app_config.planning_token.clone()).await;

    if let Err(e) = result {
        handle_fatal_error(e, cli.verbose);
    }
}
