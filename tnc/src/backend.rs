//! Uniform TNC link interface over the KISS backends.
//!
//! The session layer sees one type with `send_frame` / `recv_frame` /
//! `set_ptt`, regardless of whether the TNC hangs off a TCP socket or a
//! serial line. The VARA modem is a separate type ([`crate::vara::VaraModem`])
//! because it bypasses the packet layer entirely.

use std::time::Duration;

use hamstr_wire::{UiFrame, WireError};
use tracing::{debug, trace};

use crate::error::TncError;
use crate::serial::KissSerial;
use crate::tcp::KissTcp;

enum Transport {
    Tcp(KissTcp),
    Serial(KissSerial),
}

/// A KISS TNC reachable over TCP or serial.
///
/// PTT on a KISS TNC is keyed by the TNC itself when data arrives; the
/// `set_ptt` flag here is the software-side gate state the radio scheduler
/// asserts around transmissions so the half-duplex discipline is observable
/// and testable (never transmit before the TX delay has elapsed, never hold
/// PTT while listening for a reply).
pub struct TncLink {
    transport: Transport,
    ptt: bool,
}

impl TncLink {
    pub fn tcp(tnc: KissTcp) -> Self {
        Self {
            transport: Transport::Tcp(tnc),
            ptt: false,
        }
    }

    pub fn serial(tnc: KissSerial) -> Self {
        Self {
            transport: Transport::Serial(tnc),
            ptt: false,
        }
    }

    /// Send one AX.25 UI frame. Returns only after the bytes have left the
    /// software queue for the transport.
    pub async fn send_frame(&mut self, frame: &UiFrame) -> Result<(), TncError> {
        if !self.ptt {
            return Err(TncError::WriteRefused("PTT not asserted".into()));
        }
        let raw = frame.encode();
        trace!(len = raw.len(), dest = %frame.dest, "tx frame");
        match &mut self.transport {
            Transport::Tcp(tnc) => tnc.send_raw(raw).await,
            Transport::Serial(tnc) => tnc.send_raw(raw).await,
        }
    }

    /// Next validated UI frame within `timeout`.
    ///
    /// Frames failing the AX.25 FCS (or arriving as undecodable noise) are
    /// dropped here without notice; the reliability layer treats them the
    /// same as frames that never arrived.
    pub async fn recv_frame(&mut self, timeout: Duration) -> Result<UiFrame, TncError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or(TncError::Timeout)?;
            let raw = match &mut self.transport {
                Transport::Tcp(tnc) => tnc.recv_raw(remaining).await?,
                Transport::Serial(tnc) => tnc.recv_raw(remaining).await?,
            };
            match UiFrame::decode(&raw) {
                Ok(frame) => {
                    trace!(len = raw.len(), src = %frame.src, "rx frame");
                    return Ok(frame);
                }
                Err(WireError::BadFcs) => debug!("dropping frame with bad FCS"),
                Err(e) => debug!("dropping undecodable frame: {e}"),
            }
        }
    }

    /// Assert or drop the software PTT gate.
    pub fn set_ptt(&mut self, on: bool) {
        if self.ptt != on {
            trace!(ptt = on, "ptt state change");
        }
        self.ptt = on;
    }

    pub fn ptt_keyed(&self) -> bool {
        self.ptt
    }

    pub async fn close(&mut self) {
        if let Transport::Tcp(tnc) = &mut self.transport {
            tnc.close().await;
        }
    }
}
