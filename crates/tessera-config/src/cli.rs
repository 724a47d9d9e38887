//! Command-line argument parsing.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Tessera host command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "tessera-server", about = "Tessera reliable session host")]
pub struct CliArgs {
    /// Address to bind the listener to.
    #[arg(long)]
    pub bind: Option<String>,

    /// Listener port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Maximum number of peers.
    #[arg(long)]
    pub max_peers: Option<u32>,

    /// Base reply timeout in seconds.
    #[arg(long)]
    pub reply_timeout_secs: Option<u64>,

    /// Reconnection grace period in seconds.
    #[arg(long)]
    pub reconnect_grace_secs: Option<u64>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref bind) = args.bind {
            self.network.bind_address = bind.clone();
        }
        if let Some(port) = args.port {
            self.network.port = port;
        }
        if let Some(max) = args.max_peers {
            self.network.max_peers = max;
        }
        if let Some(secs) = args.reply_timeout_secs {
            self.reliability.reply_timeout_secs = secs;
        }
        if let Some(secs) = args.reconnect_grace_secs {
            self.reliability.reconnect_grace_secs = secs;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
