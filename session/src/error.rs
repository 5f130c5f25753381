//! Errors surfaced to callers of the link core.

use hamstr_tnc::TncError;
use thiserror::Error;

/// The protocol phase a timeout occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connect,
    Ack,
    Data,
    Ready,
    Done,
    Disconnect,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Connect => "CONNECT",
            Phase::Ack => "ACK",
            Phase::Data => "DATA",
            Phase::Ready => "READY",
            Phase::Done => "DONE",
            Phase::Disconnect => "DISCONNECT",
        };
        f.write_str(name)
    }
}

/// Session-level failures. Timeouts are only surfaced after the retry
/// budget for their phase is exhausted; the session is in a terminal state
/// by the time the caller sees any of these.
#[derive(Error, Debug)]
pub enum LinkError {
    /// The transport vanished; no further operations on this handle.
    #[error("link closed")]
    LinkClosed,

    /// Retry budget exhausted waiting in the given phase.
    #[error("timeout in {0} phase")]
    Timeout(Phase),

    /// Wrong message for the current state, oversized packet, malformed body.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Send retries exhausted with packets still unacknowledged.
    #[error("incomplete transmission, missing {missing:?}")]
    IncompleteTransmission { missing: Vec<u16> },

    /// Receive recovery exhausted with packets still absent.
    #[error("incomplete reception, missing {missing:?}")]
    ReceiveIncomplete { missing: Vec<u16> },

    /// Cooperative abort requested.
    #[error("cancelled")]
    Cancelled,

    /// The peer reported a failure in an ERROR message.
    #[error("remote error: {0}")]
    Remote(String),

    /// Opaque TNC or modem failure.
    #[error("backend: {0}")]
    Backend(TncError),
}

impl From<TncError> for LinkError {
    fn from(e: TncError) -> Self {
        match e {
            TncError::TransportClosed => LinkError::LinkClosed,
            other => LinkError::Backend(other),
        }
    }
}

impl From<hamstr_wire::WireError> for LinkError {
    fn from(e: hamstr_wire::WireError) -> Self {
        LinkError::ProtocolViolation(e.to_string())
    }
}
