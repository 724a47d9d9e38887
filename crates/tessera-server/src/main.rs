//! Host process for Tessera sessions.
//!
//! Configuration is loaded from `config.ron` and can be overridden via CLI flags.
//! Run with `cargo run -p tessera-server -- --port 40000 --max-peers 4`.

mod sink;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tessera_config::{CliArgs, Config};
use tessera_net::ReliableServer;
use tracing::{error, info};

use crate::sink::LoggingSink;

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();

    // Resolve config directory
    let config_dir = args.config.clone().unwrap_or_else(|| {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tessera")
    });

    // Load or create config, then apply CLI overrides
    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);

    let log_dir = config_dir.join("logs");
    tessera_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));
    info!(
        "Tessera host starting: max {} peers, reply timeout {:?}, reconnect grace {:?}",
        config.network.max_peers,
        config.reliability.reply_timeout(),
        config.reliability.reconnect_grace()
    );

    let sink = Arc::new(LoggingSink::default());
    let server = Arc::new(ReliableServer::new(&config, sink.clone()));

    if config.debug.report_interval_secs > 0 {
        let reporter = Arc::clone(&server);
        let every = Duration::from_secs(config.debug.report_interval_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                let hub = reporter.hub();
                info!(
                    "{} peers connected, {} payloads delivered\n{}",
                    hub.connected_count(),
                    sink.delivered(),
                    hub.report()
                );
                match hub.reliability().metrics.to_json() {
                    Ok(json) => tracing::debug!(target: "tessera_server::metrics", "{json}"),
                    Err(e) => error!("Metrics export failed: {e}"),
                }
            }
        });
    }

    let stopper = Arc::clone(&server);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received");
            stopper.shutdown();
        }
    });

    if let Err(e) = server.run().await {
        error!("Server failed: {e}");
        std::process::exit(1);
    }
    info!("Tessera host stopped");
}
