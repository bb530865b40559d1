// stationwatch-monitor: keeps a live local copy of the test rig state and
// serves it, with the operator commands, on a localhost control API.

use clap::Parser;
use monitor::Monitor;
use monitor::api::HttpControlApi;
use monitor::config::{DEFAULT_CONFIG_PATH, load_config_from_path};
use monitor::control_api::{AppState, build_router};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "stationwatch-monitor", version, about = "Test rig monitor")]
struct Args {
    /// Path to the TOML config file.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(version = env!("CARGO_PKG_VERSION"), "stationwatch-monitor starting");

    let config = load_config_from_path(&args.config).unwrap_or_else(|e| {
        eprintln!("FATAL: failed to load config: {e}");
        std::process::exit(1);
    });

    let api = HttpControlApi::new(&config.server.base_url).unwrap_or_else(|e| {
        eprintln!("FATAL: failed to build HTTP client: {e}");
        std::process::exit(1);
    });

    let monitor = Arc::new(Monitor::init(&config, Arc::new(api)));

    let bind = config.control_api.bind;
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .unwrap_or_else(|e| {
            eprintln!("FATAL: failed to bind control API on {bind}: {e}");
            std::process::exit(1);
        });
    info!(%bind, "control API listening");

    let router = build_router(AppState::new(Arc::clone(&monitor)));
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            error!(error = %e, "control API exited");
        }
    });

    monitor.start();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
        _ = server => error!("control API stopped unexpectedly"),
    }
    monitor.reset();
}
