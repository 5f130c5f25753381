//! The radio scheduler: one gate all TNC I/O funnels through.
//!
//! The channel is strictly half duplex, so a single owner serializes every
//! transmission and enforces the PTT timing discipline around it: assert
//! PTT, wait the TX delay, send, wait the tail, drop PTT, wait the RX
//! delay. Receives never run with PTT asserted, and consecutive
//! transmissions keep at least the configured inter-packet spacing apart.
//!
//! Cancellation is cooperative: every suspension point wakes with
//! `Cancelled` once the session's token fires. Teardown traffic uses the
//! unchecked transmit path so a cancelled session can still say goodbye.

use std::sync::Arc;
use std::time::Duration;

use hamstr_tnc::{TncError, TncLink};
use hamstr_wire::{MessageType, Packet, SessionId, UiFrame};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::LinkConfig;
use crate::error::{LinkError, Phase};
use crate::event::{EventBus, LinkEvent};

/// Serializes all radio I/O for one session.
pub struct RadioGate {
    tnc: TncLink,
    cfg: Arc<LinkConfig>,
    bus: Arc<EventBus>,
    cancel: CancellationToken,
    last_tx: Option<Instant>,
    active_session: Option<SessionId>,
    session_mismatches: u64,
}

impl RadioGate {
    pub fn new(
        tnc: TncLink,
        cfg: Arc<LinkConfig>,
        bus: Arc<EventBus>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            tnc,
            cfg,
            bus,
            cancel,
            last_tx: None,
            active_session: None,
            session_mismatches: 0,
        }
    }

    pub fn cfg(&self) -> &LinkConfig {
        &self.cfg
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn emit(&self, event: LinkEvent) {
        self.bus.emit(event);
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Restrict inbound traffic to one session id.
    pub fn bind_session(&mut self, id: SessionId) {
        self.active_session = Some(id);
    }

    pub fn unbind_session(&mut self) {
        self.active_session = None;
    }

    /// Packets discarded for carrying a foreign session id.
    pub fn session_mismatches(&self) -> u64 {
        self.session_mismatches
    }

    pub fn ptt_keyed(&self) -> bool {
        self.tnc.ptt_keyed()
    }

    /// Cancellable sleep.
    pub async fn pause(&self, duration: Duration) -> Result<(), LinkError> {
        if self.cancel.is_cancelled() {
            return Err(LinkError::Cancelled);
        }
        if duration.is_zero() {
            return Ok(());
        }
        let cancel = self.cancel.clone();
        tokio::select! {
            _ = cancel.cancelled() => Err(LinkError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Transmit one packet through the PTT gate.
    pub async fn transmit(&mut self, pkt: &Packet) -> Result<(), LinkError> {
        if self.cancel.is_cancelled() {
            return Err(LinkError::Cancelled);
        }
        self.transmit_inner(pkt, false).await
    }

    /// Transmit during teardown, ignoring cancellation.
    pub async fn transmit_final(&mut self, pkt: &Packet) -> Result<(), LinkError> {
        self.transmit_inner(pkt, true).await
    }

    async fn transmit_inner(&mut self, pkt: &Packet, teardown: bool) -> Result<(), LinkError> {
        // Inter-frame spacing, measured send-start to send-start.
        if let Some(last) = self.last_tx {
            let since = last.elapsed();
            if since < self.cfg.packet_send_delay {
                self.gate_pause(self.cfg.packet_send_delay - since, teardown)
                    .await?;
            }
        }

        let raw = pkt.encode(self.cfg.max_packet_size)?;
        let frame = UiFrame::new(
            self.cfg.local_callsign.clone(),
            self.cfg.remote_callsign.clone(),
            raw,
        );
        let wire_len = 16 + frame.payload.len() + 2;
        let est_secs = self.cfg.estimate_tx_secs(wire_len);

        self.tnc.set_ptt(true);
        let result = self.keyed_transmit(&frame, teardown).await;
        self.tnc.set_ptt(false);
        result?;

        self.bus.emit(LinkEvent::PacketSent {
            ty: pkt.ty,
            seq: pkt.seq,
            total: pkt.total,
            est_secs,
        });

        self.gate_pause(self.cfg.ptt_rx_delay, teardown).await?;
        if pkt.ty == MessageType::Ack {
            self.gate_pause(self.cfg.ack_spacing, teardown).await?;
        }
        self.last_tx = Some(Instant::now());
        Ok(())
    }

    /// The PTT-high portion of a transmission.
    async fn keyed_transmit(&mut self, frame: &UiFrame, teardown: bool) -> Result<(), LinkError> {
        self.gate_pause(self.cfg.ptt_tx_delay, teardown).await?;
        self.tnc.send_frame(frame).await?;
        self.gate_pause(self.cfg.ptt_tail, teardown).await?;
        Ok(())
    }

    async fn gate_pause(&self, duration: Duration, teardown: bool) -> Result<(), LinkError> {
        if teardown {
            tokio::time::sleep(duration).await;
            Ok(())
        } else {
            self.pause(duration).await
        }
    }

    /// Next packet for this station within `timeout`.
    ///
    /// Frames for other stations, undecodable payloads and packets carrying
    /// a foreign session id are discarded here; only the mismatch counter
    /// and a WARNING event betray the latter.
    pub async fn recv(&mut self, timeout: Duration, phase: Phase) -> Result<Packet, LinkError> {
        self.recv_inner(timeout, phase, false).await
    }

    /// Receive during teardown, ignoring cancellation.
    pub async fn recv_final(&mut self, timeout: Duration, phase: Phase) -> Result<Packet, LinkError> {
        self.recv_inner(timeout, phase, true).await
    }

    async fn recv_inner(
        &mut self,
        timeout: Duration,
        phase: Phase,
        teardown: bool,
    ) -> Result<Packet, LinkError> {
        let deadline = Instant::now() + timeout;
        let cancel = self.cancel.clone();
        loop {
            if !teardown && cancel.is_cancelled() {
                return Err(LinkError::Cancelled);
            }
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(d) if !d.is_zero() => d,
                _ => return Err(LinkError::Timeout(phase)),
            };

            let inbound = if teardown {
                self.tnc.recv_frame(remaining).await
            } else {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(LinkError::Cancelled),
                    result = self.tnc.recv_frame(remaining) => result,
                }
            };
            let frame = match inbound {
                Ok(frame) => frame,
                Err(TncError::Timeout) => return Err(LinkError::Timeout(phase)),
                Err(e) => return Err(e.into()),
            };

            if frame.dest != self.cfg.local_callsign {
                trace!("frame for {} ignored", frame.dest);
                continue;
            }

            let pkt = match Packet::decode(&frame.payload) {
                Ok(pkt) => pkt,
                Err(e) => {
                    // Indistinguishable from air corruption; no NACK.
                    debug!("dropping undecodable packet: {e}");
                    continue;
                }
            };

            if let Some(active) = self.active_session {
                if pkt.session != active {
                    self.session_mismatches += 1;
                    self.bus.emit(LinkEvent::Warning(format!(
                        "Discarded packet with foreign session id {}",
                        pkt.session
                    )));
                    continue;
                }
            }

            if pkt.ty.is_control() {
                self.bus.emit(LinkEvent::ControlReceived {
                    ty: pkt.ty,
                    content: String::from_utf8_lossy(&pkt.body).into_owned(),
                });
            }
            return Ok(pkt);
        }
    }

    pub async fn shutdown(&mut self) {
        self.tnc.close().await;
    }
}
