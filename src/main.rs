use clap::Parser;
use tracing::error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use netmon::cli::{self, Cli};
use netmon::config::Config;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load_or_default(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("netmon: {e:#}");
            std::process::exit(1);
        }
    };

    let default_level = if cli.debug {
        "debug".to_string()
    } else {
        config.general.log_level.clone()
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = cli::run_command(cli, config).await {
        error!("{e:#}");
        std::process::exit(1);
    }
}
