//! Buslink Library
//!
//! Resilient TCP bridge client for Modbus-family field servers.
//!
//! Maintains a single persistent connection to a remote server, forwards
//! inbound bytes to a downstream sink, and accepts outbound payloads from
//! any task — reconnecting transparently whenever the link drops.

pub mod config;
pub mod connection;
pub mod shutdown;
pub mod sink;

pub use config::Config;
pub use connection::{ConnectionManager, SendError};
pub use shutdown::ShutdownCoordinator;
pub use sink::DownstreamSink;

/// Common error type for the bridge client
pub type Result<T> = anyhow::Result<T>;
