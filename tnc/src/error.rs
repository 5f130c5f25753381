//! TNC backend error types.

use hamstr_wire::WireError;
use thiserror::Error;

/// Failures surfaced by a TNC backend.
#[derive(Error, Debug)]
pub enum TncError {
    /// The transport channel to the TNC or modem vanished.
    #[error("transport closed")]
    TransportClosed,

    /// No frame arrived inside the requested deadline.
    #[error("receive timeout")]
    Timeout,

    /// The codec rejected data on the transport channel.
    #[error("bad frame: {0}")]
    BadFrame(#[from] WireError),

    /// The backend refused to accept an outbound frame.
    #[error("write refused: {0}")]
    WriteRefused(String),

    /// Underlying socket or serial failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// VARA control-channel failure.
    #[error("modem error: {0}")]
    Modem(String),
}
