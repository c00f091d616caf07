use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use skillserve::config::{AppConfig, CliConfig};
use skillserve::server::{bootstrap, run_server, BootError, RequestsLoggingLevel};

#[derive(Parser, Debug)]
#[command(about = "Cloud-native MCP server for declarative skills")]
struct CliArgs {
    /// The port to listen on.
    #[clap(short, long, default_value_t = 8000)]
    pub port: u16,

    /// Directory for local storage (object bucket, database, skill cache).
    #[clap(long, default_value = "./data")]
    pub data_dir: PathBuf,

    /// The level of logging to perform on each request.
    #[clap(long, default_value = "path")]
    pub logging_level: RequestsLoggingLevel,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .unwrap();

    let cli = CliConfig {
        port: cli_args.port,
        data_dir: cli_args.data_dir,
        logging_level: cli_args.logging_level,
    };
    let config = AppConfig::resolve(&cli)?;

    info!(
        "starting {} v{} ({} storage backend)",
        config.server_name(),
        config.server_version(),
        config.storage_backend.as_str()
    );

    let shutdown = CancellationToken::new();

    let state = match bootstrap(config, shutdown.clone()).await {
        Ok(state) => state,
        Err(BootError::Storage(reason)) => {
            error!("storage unreachable: {}", reason);
            std::process::exit(2);
        }
        Err(BootError::Other(e)) => return Err(e),
    };

    // Ctrl-C triggers a graceful shutdown of the serve loop and every
    // background task.
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal_token.cancel();
        }
    });

    run_server(state, shutdown.clone()).await?;
    shutdown.cancel();
    info!("shutdown complete");
    Ok(())
}
