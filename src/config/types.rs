//! Configuration Types

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default port for Modbus-family TCP servers
pub const DEFAULT_SERVER_PORT: u16 = 502;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub link: LinkConfig,
    pub monitoring: MonitoringConfig,
}

/// Target server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Connection lifecycle tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LinkConfig {
    /// Bound on a single TCP connect attempt
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Bound on a single blocking read; elapsing is a liveness tick, not an error
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Bound on a single write + flush in the send path
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
    /// Delay between reconnect attempts after a connection failure
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    /// How long a sender waits for a live connection before giving up
    #[serde(with = "humantime_serde")]
    pub send_wait_timeout: Duration,
    /// Sleep increment of the connection-wait poll loop
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Size of the inbound read buffer in bytes
    pub read_buffer_size: usize,
    /// How long shutdown waits for the lifecycle loop to exit
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            link: LinkConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_SERVER_PORT,
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            retry_delay: Duration::from_secs(2),
            send_wait_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
            read_buffer_size: 1024,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}
