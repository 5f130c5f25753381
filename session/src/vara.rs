//! VARA mode: the session surface over the modem's reliable stream.
//!
//! VARA already delivers bytes in order or not at all, so the whole
//! segmentation protocol collapses into a thin block framing: each logical
//! message travels as one length-prefixed block (`u32 BE length`, then a
//! message-type byte and the body), the peer answers with one block, and a
//! bare one-byte DONE marker / DONE_ACK marker closes the exchange before
//! the modem link is dropped. PTT belongs to the modem; nothing here may
//! key it. Progress is phase-based; no packet-layer events exist in this
//! mode.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use hamstr_tnc::VaraModem;
use hamstr_wire::MessageType;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::LinkConfig;
use crate::error::{LinkError, Phase};
use crate::event::{EventBus, LinkEvent};
use crate::handle::{Command, SessionHandle};
use crate::session::{encode_request, decode_request, PayloadHandler, PayloadKind, RequestKind};
use crate::state::{PhaseTracker, SessionPhase};

/// End-of-exchange marker byte.
const DONE_MARKER: u8 = 0x04;
/// Acknowledgment marker byte.
const DONE_ACK_MARKER: u8 = 0x06;

/// Upper bound on one block; also guarantees the first length byte is
/// always zero, keeping markers unambiguous in the stream.
const MAX_BLOCK: usize = 0x00FF_FFFF;

/// One session over the VARA stream.
pub struct VaraSession {
    modem: VaraModem,
    cfg: Arc<LinkConfig>,
    bus: Arc<EventBus>,
    cancel: CancellationToken,
    phase: PhaseTracker,
    stash: BytesMut,
}

impl VaraSession {
    pub fn new(
        modem: VaraModem,
        cfg: Arc<LinkConfig>,
        bus: Arc<EventBus>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            modem,
            cfg,
            bus,
            cancel,
            phase: PhaseTracker::new(),
            stash: BytesMut::new(),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase.phase()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Bring the modem link up toward the configured remote.
    pub async fn connect(&mut self) -> Result<(), LinkError> {
        self.phase.advance(SessionPhase::Connecting)?;
        let local = self.cfg.local_callsign.clone();
        let remote = self.cfg.remote_callsign.clone();
        self.modem
            .connect_remote(&local, &remote, self.cfg.connection_attempt_timeout)
            .await
            .map_err(LinkError::from)?;
        self.phase.advance(SessionPhase::Connected)?;
        self.bus.emit(LinkEvent::SessionConnected { remote });
        Ok(())
    }

    /// Responder side: wait for an inbound link.
    pub async fn await_link(&mut self) -> Result<(), LinkError> {
        self.phase.advance(SessionPhase::Connecting)?;
        self.modem
            .await_link(self.cfg.keep_alive_final_interval)
            .await?;
        self.phase.advance(SessionPhase::Connected)?;
        self.bus.emit(LinkEvent::SessionConnected {
            remote: self.cfg.remote_callsign.clone(),
        });
        Ok(())
    }

    pub async fn request(&mut self, kind: RequestKind, params: &[u8]) -> Result<Bytes, LinkError> {
        let body = encode_request(kind, params);
        self.write_block(MessageType::DataRequest, &body).await?;

        self.phase.advance(SessionPhase::Receiving)?;
        let (ty, payload) = self.read_block(self.cfg.connection_timeout).await?;
        self.phase.advance(SessionPhase::Delivered)?;
        self.bus.emit(LinkEvent::Progress { pct: 100.0 });
        if ty == MessageType::Error {
            return Err(LinkError::Remote(
                String::from_utf8_lossy(&payload).into_owned(),
            ));
        }
        Ok(payload)
    }

    pub async fn send_payload(
        &mut self,
        kind: PayloadKind,
        payload: &[u8],
    ) -> Result<Option<Bytes>, LinkError> {
        self.phase.advance(SessionPhase::Sending)?;
        self.write_block(kind.message_type(), payload).await?;

        if kind.expects_reply() {
            self.phase.advance(SessionPhase::Receiving)?;
            let (ty, reply) = self.read_block(self.cfg.connection_timeout).await?;
            self.phase.advance(SessionPhase::Delivered)?;
            self.bus.emit(LinkEvent::Progress { pct: 100.0 });
            if ty == MessageType::Error {
                return Err(LinkError::Remote(
                    String::from_utf8_lossy(&reply).into_owned(),
                ));
            }
            Ok(Some(reply))
        } else {
            self.phase.advance(SessionPhase::Delivered)?;
            Ok(None)
        }
    }

    /// DONE marker, DONE_ACK marker, modem disconnect.
    pub async fn disconnect(&mut self) -> Result<(), LinkError> {
        if self.phase.phase().is_terminal() {
            return Ok(());
        }
        let _ = self.phase.advance(SessionPhase::Disconnecting);

        if self.modem.is_connected() {
            if let Err(e) = self.modem.send_block(&[DONE_MARKER]).await {
                debug!("DONE marker not sent: {e}");
            } else {
                match self.read_exact(1, self.cfg.disconnect_timeout).await {
                    Ok(marker) if marker[0] == DONE_ACK_MARKER => {}
                    Ok(_) => warn!("unexpected byte instead of DONE_ACK marker"),
                    Err(e) => debug!("no DONE_ACK marker: {e}"),
                }
            }
            let _ = self.modem.disconnect_remote().await;
        }

        self.phase.force(SessionPhase::Closed);
        self.bus.emit(LinkEvent::DisconnectComplete);
        Ok(())
    }

    /// Serve one inbound exchange until the peer's DONE marker.
    pub async fn serve_one(&mut self, handler: &dyn PayloadHandler) -> Result<(), LinkError> {
        loop {
            let first = self.read_exact(1, self.cfg.connection_timeout).await?;
            if first[0] == DONE_MARKER {
                let _ = self.modem.send_block(&[DONE_ACK_MARKER]).await;
                let _ = self.modem.disconnect_remote().await;
                self.phase.force(SessionPhase::Closed);
                self.bus.emit(LinkEvent::Session("Session closed by remote".into()));
                return Ok(());
            }
            let (ty, body) = self.read_block_after(first[0]).await?;
            self.dispatch(ty, body, handler).await?;
        }
    }

    async fn dispatch(
        &mut self,
        ty: MessageType,
        body: Bytes,
        handler: &dyn PayloadHandler,
    ) -> Result<(), LinkError> {
        match ty {
            MessageType::DataRequest => {
                let (kind, params) = decode_request(&body)?;
                match handler.handle_request(kind, params).await {
                    Ok(payload) => self.write_block(MessageType::Response, &payload).await?,
                    Err(text) => self.write_block(MessageType::Error, text.as_bytes()).await?,
                }
            }
            MessageType::Note => {
                if let Err(text) = handler.handle_note(body).await {
                    self.bus
                        .emit(LinkEvent::Error(format!("Note handler failed: {text}")));
                }
            }
            MessageType::ZapKind9734Request => match handler.handle_zap_request(body).await {
                Ok(invoice) => self.write_block(MessageType::Response, &invoice).await?,
                Err(text) => self.write_block(MessageType::Error, text.as_bytes()).await?,
            },
            MessageType::NwcPaymentRequest => match handler.handle_payment(body).await {
                Ok(result) => self.write_block(MessageType::Response, &result).await?,
                Err(text) => self.write_block(MessageType::Error, text.as_bytes()).await?,
            },
            MessageType::ZapSuccessConfirm => {
                if let Err(text) = handler.handle_zap_confirm(body).await {
                    self.bus
                        .emit(LinkEvent::Error(format!("Zap confirm handler failed: {text}")));
                }
            }
            other => debug!("vara responder ignoring {other} block"),
        }
        Ok(())
    }

    async fn write_block(&mut self, ty: MessageType, body: &[u8]) -> Result<(), LinkError> {
        if body.len() + 1 > MAX_BLOCK {
            return Err(LinkError::ProtocolViolation(format!(
                "block of {} bytes exceeds the VARA limit",
                body.len()
            )));
        }
        let mut block = BytesMut::with_capacity(5 + body.len());
        block.put_u32(body.len() as u32 + 1);
        block.put_u8(ty as u8);
        block.put_slice(body);
        self.modem.send_block(&block).await?;
        Ok(())
    }

    async fn read_block(
        &mut self,
        timeout: std::time::Duration,
    ) -> Result<(MessageType, Bytes), LinkError> {
        let first = self.read_exact(1, timeout).await?;
        self.read_block_after(first[0]).await
    }

    /// Parse a block whose first length byte was already consumed.
    async fn read_block_after(&mut self, first: u8) -> Result<(MessageType, Bytes), LinkError> {
        if first != 0 {
            return Err(LinkError::ProtocolViolation(format!(
                "unexpected stream byte 0x{first:02x}"
            )));
        }
        let rest = self.read_exact(3, self.cfg.no_packet_timeout).await?;
        let len = u32::from_be_bytes([first, rest[0], rest[1], rest[2]]) as usize;
        if len == 0 || len > MAX_BLOCK {
            return Err(LinkError::ProtocolViolation(format!(
                "implausible block length {len}"
            )));
        }
        let content = self.read_exact(len, self.cfg.no_packet_timeout).await?;
        let ty = MessageType::try_from(content[0])?;
        Ok((ty, content.slice(1..)))
    }

    /// Pull exactly `n` bytes out of the stream, buffering the excess.
    async fn read_exact(
        &mut self,
        n: usize,
        timeout: std::time::Duration,
    ) -> Result<Bytes, LinkError> {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.stash.len() < n {
            if self.cancel.is_cancelled() {
                return Err(LinkError::Cancelled);
            }
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or(LinkError::Timeout(Phase::Data))?;
            let cancel = self.cancel.clone();
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(LinkError::Cancelled),
                chunk = self.modem.recv_block(remaining) => chunk?,
            };
            self.stash.extend_from_slice(&chunk);
        }
        Ok(self.stash.split_to(n).freeze())
    }
}

/// Open a VARA-mode session toward the configured remote and park it on
/// its own task behind the ordinary [`SessionHandle`].
pub async fn open_vara_session(
    modem: VaraModem,
    cfg: Arc<LinkConfig>,
    bus: Arc<EventBus>,
) -> Result<SessionHandle, LinkError> {
    let cancel = CancellationToken::new();
    let mut session = VaraSession::new(modem, cfg, bus, cancel.clone());
    session.connect().await?;

    let (tx, rx) = mpsc::channel(4);
    tokio::spawn(run_vara_session(session, rx));
    Ok(SessionHandle::new(tx, cancel))
}

async fn run_vara_session(mut session: VaraSession, mut commands: mpsc::Receiver<Command>) {
    while let Some(command) = commands.recv().await {
        match command {
            Command::Request { kind, params, resp } => {
                let result = session.request(kind, &params).await;
                let _ = resp.send(result);
            }
            Command::Send {
                kind,
                payload,
                resp,
            } => {
                let result = session.send_payload(kind, &payload).await;
                let _ = resp.send(result);
            }
            Command::Close { resp } => {
                let result = session.disconnect().await;
                let _ = resp.send(result);
                return;
            }
        }
        if session.is_cancelled() || session.phase().is_terminal() {
            break;
        }
    }
    if !session.phase().is_terminal() {
        let _ = session.disconnect().await;
    }
}

/// Serve one inbound VARA session against `handler`.
pub async fn serve_vara_session(
    modem: VaraModem,
    cfg: Arc<LinkConfig>,
    bus: Arc<EventBus>,
    handler: &dyn PayloadHandler,
) -> Result<(), LinkError> {
    let cancel = CancellationToken::new();
    let mut session = VaraSession::new(modem, cfg, bus, cancel);
    session.await_link().await?;
    session.serve_one(handler).await
}
