//! Buslink - Resilient TCP Bridge Client
//!
//! Maintains a persistent connection to a Modbus-family field server,
//! logs inbound traffic, and forwards bytes from stdin to the server.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use buslink::{config::ConfigManager, sink::HexLogSink, ConnectionManager, ShutdownCoordinator};

/// CLI arguments for Buslink
#[derive(Parser, Debug)]
#[command(name = "buslink")]
#[command(about = "Buslink - Resilient TCP bridge client")]
#[command(version)]
#[command(long_about = "
Buslink - Resilient TCP bridge client

Keeps a persistent TCP connection to a remote field server, reconnecting
automatically on failure. Inbound bytes are logged as hex; bytes written
to stdin are forwarded to the server.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  BUSLINK_SERVER_HOST      - Target server host (e.g., 192.168.1.10)
  BUSLINK_SERVER_PORT      - Target server port (default 502)
  BUSLINK_CONNECT_TIMEOUT  - Connect timeout (e.g., 10s)
  BUSLINK_RETRY_DELAY      - Delay between reconnect attempts (e.g., 2s)
  BUSLINK_READ_BUFFER_SIZE - Inbound read buffer size in bytes
  BUSLINK_LOG_LEVEL        - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(
        short,
        long,
        default_value = "config.toml",
        help = "Path to configuration file"
    )]
    pub config: PathBuf,

    /// Server host (overrides config file)
    #[arg(short = 'H', long, help = "Target server host")]
    pub host: Option<String>,

    /// Server port (overrides config file)
    #[arg(short, long, help = "Target server port")]
    pub port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", help = "Log level")]
    pub log_level: String,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Delay between reconnect attempts in seconds
    #[arg(long, help = "Delay between reconnect attempts in seconds")]
    pub retry_delay: Option<u64>,

    /// Read buffer size in bytes
    #[arg(long, help = "Read buffer size in bytes")]
    pub buffer_size: Option<usize>,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Initialize tracing
    init_tracing(&args)?;

    info!("Starting Buslink v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration with priority: CLI args > config file > environment > defaults
    let mut config = if args.config.exists() {
        ConfigManager::load_from_file(&args.config)?
    } else {
        info!("Config file not found, checking environment variables");
        ConfigManager::load_from_env()?
    };

    // Apply CLI argument overrides (highest priority)
    config.merge_with_cli_args(
        args.host.as_deref(),
        args.port,
        args.retry_delay,
        args.buffer_size,
    );

    // Final validation after all overrides
    config
        .validate()
        .context("Final configuration validation failed")?;

    // If validate-config flag is set, just validate and exit
    if args.validate_config {
        info!("Configuration is valid");
        info!("Configuration summary:");
        info!("  Server: {}:{}", config.server.host, config.server.port);
        info!("  Connect timeout: {:?}", config.link.connect_timeout);
        info!("  Read timeout: {:?}", config.link.read_timeout);
        info!("  Retry delay: {:?}", config.link.retry_delay);
        info!("  Read buffer: {} bytes", config.link.read_buffer_size);
        return Ok(());
    }

    info!("Configuration loaded successfully");
    info!("Target server: {}:{}", config.server.host, config.server.port);

    // Create shutdown coordinator
    let shutdown_coordinator = ShutdownCoordinator::new(config.link.shutdown_grace);

    // Start the connection manager with a hex-logging downstream sink
    let manager = Arc::new(ConnectionManager::new(&config, Arc::new(HexLogSink)));
    let lifecycle = Arc::clone(&manager).start();

    // Forward stdin to the server; EOF just stops the pump
    let stdin_pump = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            let mut stdin = tokio::io::stdin();
            let mut buf = vec![0u8; 1024];

            loop {
                match stdin.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Err(e) = manager.send(&buf[..n]).await {
                            warn!("Outbound send failed: {}", e);
                        }
                    }
                    Err(e) => {
                        warn!("Stdin read failed: {}", e);
                        break;
                    }
                }
            }

            info!("Stdin closed, outbound pump stopped");
        })
    };

    info!("Buslink started, press Ctrl+C or send SIGTERM/SIGINT to shutdown");

    // Block until a shutdown signal arrives
    if let Err(e) = shutdown_coordinator.listen_for_signals().await {
        error!("Error setting up signal handlers: {}", e);
    }

    info!("Initiating graceful shutdown...");
    stdin_pump.abort();
    shutdown_coordinator
        .shutdown_client(&manager, lifecycle)
        .await?;

    info!("Client shutdown complete");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(args: &CliArgs) -> Result<()> {
    let log_level = if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}
