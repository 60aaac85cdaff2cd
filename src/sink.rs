//! Downstream Sink
//!
//! The seam between the connection manager's receive loop and whatever
//! component consumes the inbound byte stream.

use crate::Result;
use bytes::Bytes;
use tracing::info;

/// Consumer of inbound chunks read from the upstream server.
///
/// Implementations must be callable from the background receive task and
/// should return quickly; the receive loop does not read again until the
/// call returns. Returning an error tells the loop to stop forwarding and
/// drop the connection.
pub trait DownstreamSink: Send + Sync {
    /// Handle one chunk of inbound bytes. The chunk contains exactly the
    /// bytes read from the wire and is owned by the callee after the call.
    fn send_data(&self, chunk: Bytes) -> Result<()>;
}

/// Sink that logs each inbound chunk as hex and discards it.
///
/// Used by the binary when no real consumer is wired in.
#[derive(Debug, Default)]
pub struct HexLogSink;

impl DownstreamSink for HexLogSink {
    fn send_data(&self, chunk: Bytes) -> Result<()> {
        info!("Server: {}", to_hex(&chunk));
        Ok(())
    }
}

/// Render a byte slice as a lowercase hex string
pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}
