//! Wire-level error types.

use thiserror::Error;

/// Errors raised by the KISS, AX.25 and packet codecs.
#[derive(Error, Debug)]
pub enum WireError {
    /// FESC followed by a byte other than TFEND/TFESC
    #[error("invalid KISS escape sequence")]
    InvalidEscape,

    /// AX.25 frame shorter than the minimum header
    #[error("truncated frame ({0} bytes)")]
    Truncated(usize),

    /// AX.25 frame check sequence mismatch
    #[error("AX.25 FCS mismatch")]
    BadFcs,

    /// Packet body CRC mismatch
    #[error("packet body CRC mismatch")]
    BadCrc,

    /// Unknown packet message type
    #[error("unknown message type 0x{0:02x}")]
    UnknownType(u8),

    /// Session id is not 8 ASCII hex characters
    #[error("malformed session id")]
    BadSessionId,

    /// Callsign outside 1..=6 uppercase alphanumerics or SSID > 15
    #[error("invalid callsign: {0}")]
    BadCallsign(String),

    /// Encoded size exceeds the configured packet limit
    #[error("packet size {0} exceeds limit {1}")]
    Oversize(usize, usize),

    /// Frame structure does not parse
    #[error("malformed frame")]
    Malformed,

    /// Underlying stream error (surfaced through the codec traits)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
