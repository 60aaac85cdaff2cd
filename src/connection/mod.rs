//! Connection Management Module
//!
//! Owns the persistent upstream TCP connection and its lifecycle.

pub mod manager;

pub use manager::{ConnectionManager, SendError};
