//! Error types for the control boundary and the frame source seam.

use std::net::Ipv4Addr;

use thiserror::Error;

/// Errors rejected synchronously at the control boundary.
///
/// Everything else in the system surfaces as a slot's `Failed` state plus a
/// short message rather than as a returned error.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A slot is not Idle; configuration is read-only until `stop_all`.
    #[error("locked")]
    Locked,

    #[error("invalid multicast address: {0}")]
    InvalidMulticastAddr(Ipv4Addr),

    /// Ports must be even (RTP) and leave room for the monitor flow at +2.
    #[error("port out of range: {0}")]
    PortOutOfRange(u16),

    #[error("unknown slot: {0}")]
    UnknownSlot(u8),

    #[error("config persistence failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("config encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Errors from the frame source adapter.
///
/// `NotFound` and `Init` are startup errors; `Disconnected` and `Terminal`
/// end a running pipeline. Timeouts are not errors - `next_frame` returns
/// `Ok(None)` for those.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("source not found: {0}")]
    NotFound(String),

    #[error("receiver setup failed: {0}")]
    Init(String),

    #[error("source disconnected")]
    Disconnected,

    #[error("receiver error: {0}")]
    Terminal(String),
}
