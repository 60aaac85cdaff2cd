//! Configuration Manager

use super::Config;
use crate::Result;
use anyhow::{bail, Context};
use std::path::Path;

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config
                .validate()
                .with_context(|| "Configuration validation failed")?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!(
                "Configuration file not found at {}, using defaults",
                path.display()
            );
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Config> {
        let mut config = Config::default();

        if let Ok(host) = std::env::var("BUSLINK_SERVER_HOST") {
            config.server.host = host;
        }

        if let Ok(port) = std::env::var("BUSLINK_SERVER_PORT") {
            config.server.port = port
                .parse::<u16>()
                .with_context(|| format!("Invalid BUSLINK_SERVER_PORT: {}", port))?;
        }

        if let Ok(timeout) = std::env::var("BUSLINK_CONNECT_TIMEOUT") {
            config.link.connect_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid BUSLINK_CONNECT_TIMEOUT: {}", timeout))?;
        }

        if let Ok(delay) = std::env::var("BUSLINK_RETRY_DELAY") {
            config.link.retry_delay = humantime::parse_duration(&delay)
                .with_context(|| format!("Invalid BUSLINK_RETRY_DELAY: {}", delay))?;
        }

        if let Ok(buffer_size) = std::env::var("BUSLINK_READ_BUFFER_SIZE") {
            config.link.read_buffer_size = buffer_size
                .parse::<usize>()
                .with_context(|| format!("Invalid BUSLINK_READ_BUFFER_SIZE: {}", buffer_size))?;
        }

        if let Ok(log_level) = std::env::var("BUSLINK_LOG_LEVEL") {
            config.monitoring.log_level = log_level;
        }

        config.validate()?;
        Ok(config)
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_server_config()
            .with_context(|| "Server configuration validation failed")?;

        self.validate_link_config()
            .with_context(|| "Link configuration validation failed")?;

        Ok(())
    }

    /// Apply command-line overrides on top of the loaded configuration
    pub fn merge_with_cli_args(
        &mut self,
        host: Option<&str>,
        port: Option<u16>,
        retry_delay_secs: Option<u64>,
        buffer_size: Option<usize>,
    ) {
        if let Some(host) = host {
            self.server.host = host.to_string();
        }

        if let Some(port) = port {
            self.server.port = port;
        }

        if let Some(secs) = retry_delay_secs {
            self.link.retry_delay = std::time::Duration::from_secs(secs);
        }

        if let Some(size) = buffer_size {
            self.link.read_buffer_size = size;
        }
    }

    fn validate_server_config(&self) -> Result<()> {
        if self.server.host.is_empty() {
            bail!("server.host must not be empty");
        }

        if self.server.port == 0 {
            bail!("server.port must be greater than 0");
        }

        Ok(())
    }

    fn validate_link_config(&self) -> Result<()> {
        if self.link.connect_timeout.is_zero() {
            bail!("connect_timeout must be greater than 0");
        }

        if self.link.connect_timeout.as_secs() > 300 {
            bail!("connect_timeout cannot exceed 5 minutes");
        }

        if self.link.read_timeout.is_zero() {
            bail!("read_timeout must be greater than 0");
        }

        if self.link.write_timeout.is_zero() {
            bail!("write_timeout must be greater than 0");
        }

        if self.link.retry_delay.is_zero() {
            bail!("retry_delay must be greater than 0");
        }

        if self.link.poll_interval.is_zero() {
            bail!("poll_interval must be greater than 0");
        }

        if self.link.poll_interval > self.link.send_wait_timeout {
            bail!("poll_interval cannot exceed send_wait_timeout");
        }

        if self.link.shutdown_grace.is_zero() {
            bail!("shutdown_grace must be greater than 0");
        }

        if self.link.read_buffer_size == 0 {
            bail!("read_buffer_size must be greater than 0");
        }

        if self.link.read_buffer_size > 1048576 {
            bail!("read_buffer_size cannot exceed 1MB");
        }

        Ok(())
    }
}
