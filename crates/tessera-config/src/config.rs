//! Configuration structs with sensible defaults and RON persistence.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// File name used inside the config directory.
const CONFIG_FILE: &str = "config.ron";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Listener and peer-limit settings.
    pub network: NetworkConfig,
    /// Sequencing, flow control, reply and reconnection tuning.
    pub reliability: ReliabilityConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the host listens on.
    pub bind_address: String,
    /// Port the host listens on.
    pub port: u16,
    /// Maximum number of simultaneously registered peers.
    pub max_peers: u32,
    /// Address a client connects to.
    pub server_address: String,
}

/// Reliability-layer tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReliabilityConfig {
    /// Sent messages retained per recipient for retransmission.
    pub history_capacity: usize,
    /// Base reply wait in seconds, scaled by the connected-peer count.
    pub reply_timeout_secs: u64,
    /// How long a dropped peer may take to resume its session.
    pub reconnect_grace_secs: u64,
    /// How long buffered messages may sit behind a gap before a resend is requested.
    pub gap_timeout_ms: u64,
    /// Admission window used before the first RTT sample.
    pub initial_window: u32,
    /// Period of the housekeeping tick (deadline expiry, gap sweep).
    pub tick_interval_ms: u64,
    /// Queued outbound bytes above which a transport reports itself unwritable.
    pub write_high_water: usize,
    /// Largest accepted frame payload in bytes.
    pub max_frame_size: u32,
    /// Outbound messages a peer may hold while its window is closed or its
    /// transport is gone. Sends beyond this are refused.
    pub max_backlog: usize,
    /// How far past the next expected sequence inbound messages are buffered.
    pub reorder_window: u64,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
    /// Seconds between periodic health reports (0 disables them).
    pub report_interval_secs: u64,
}

// --- Default implementations ---

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 36743,
            max_peers: 8,
            server_address: "127.0.0.1".to_string(),
        }
    }
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            history_capacity: 100,
            reply_timeout_secs: 600,
            reconnect_grace_secs: 60,
            gap_timeout_ms: 2000,
            initial_window: 25,
            tick_interval_ms: 100,
            write_high_water: 1_048_576,
            max_frame_size: 1_048_576,
            max_backlog: 1024,
            reorder_window: 1024,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            report_interval_secs: 60,
        }
    }
}

impl ReliabilityConfig {
    /// Unscaled reply deadline.
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.reply_timeout_secs)
    }

    /// Reconnection deadline measured from transport loss.
    pub fn reconnect_grace(&self) -> Duration {
        Duration::from_secs(self.reconnect_grace_secs)
    }

    /// Age after which a sequence gap triggers a resend request.
    pub fn gap_timeout(&self) -> Duration {
        Duration::from_millis(self.gap_timeout_ms)
    }

    /// Housekeeping tick period.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(2)
            .enumerate_arrays(false);
        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(config_dir.join(CONFIG_FILE), serialized).map_err(ConfigError::WriteError)
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let contents = std::fs::read_to_string(config_dir.join(CONFIG_FILE))
            .map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}
