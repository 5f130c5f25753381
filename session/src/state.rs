//! Session phase as a sum type with a guarded transition function.
//!
//! Deadlines live with the waits that need them; the phase only answers
//! "what may happen next". Illegal transitions are protocol violations,
//! not silent flag soup.

use crate::error::LinkError;

/// Where a session stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Connecting,
    Connected,
    Requesting,
    ReadyTx,
    Sending,
    Receiving,
    Delivered,
    Disconnecting,
    Closed,
    Failed,
}

impl SessionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionPhase::Closed | SessionPhase::Failed)
    }

    fn allows(self, next: SessionPhase) -> bool {
        use SessionPhase::*;
        match (self, next) {
            // Anything non-terminal may fail or start tearing down.
            (from, Failed) if !from.is_terminal() => true,
            (from, Disconnecting) if !from.is_terminal() => true,
            (Disconnecting, Closed) => true,

            (Idle, Connecting) => true,
            (Connecting, Connected) => true,
            // A fresh exchange starts from Connected or from a finished one.
            (Connected | Delivered, Requesting) => true,
            (Connected | Delivered, Sending) => true,
            (Requesting, ReadyTx) => true,
            // Payload sends open with the READY pair straight from Connected.
            (Connected | Delivered, ReadyTx) => true,
            (ReadyTx, Receiving) => true,
            (ReadyTx, Sending) => true,
            (Sending, Receiving) => true,
            // The VARA stream starts the response without a READY pair.
            (Connected | Delivered, Receiving) => true,
            (Sending | Receiving, Delivered) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionPhase::Idle => "IDLE",
            SessionPhase::Connecting => "CONNECTING",
            SessionPhase::Connected => "CONNECTED",
            SessionPhase::Requesting => "REQUESTING",
            SessionPhase::ReadyTx => "READY_TX",
            SessionPhase::Sending => "SENDING",
            SessionPhase::Receiving => "RECEIVING",
            SessionPhase::Delivered => "DELIVERED",
            SessionPhase::Disconnecting => "DISCONNECTING",
            SessionPhase::Closed => "CLOSED",
            SessionPhase::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Current phase plus the transition guard.
#[derive(Debug)]
pub struct PhaseTracker {
    phase: SessionPhase,
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self {
            phase: SessionPhase::Idle,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Move to `next`, or report the illegal transition.
    pub fn advance(&mut self, next: SessionPhase) -> Result<(), LinkError> {
        if self.phase == next {
            return Ok(());
        }
        if !self.phase.allows(next) {
            return Err(LinkError::ProtocolViolation(format!(
                "illegal transition {} -> {next}",
                self.phase
            )));
        }
        tracing::debug!("session phase {} -> {next}", self.phase);
        self.phase = next;
        Ok(())
    }

    /// Force a terminal state during teardown; always legal.
    pub fn force(&mut self, terminal: SessionPhase) {
        debug_assert!(terminal.is_terminal());
        self.phase = terminal;
    }
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}
