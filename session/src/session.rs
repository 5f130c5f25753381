//! Role-aware session driver.
//!
//! One `Session` owns the radio gate for its lifetime and walks the
//! connect / transfer / disconnect state machine from either side. All
//! mutation happens on the single task driving these methods; the handle
//! layer feeds it commands over a channel.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hamstr_wire::{MessageType, Packet, SessionId};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{LinkError, Phase};
use crate::event::LinkEvent;
use crate::proto;
use crate::radio::RadioGate;
use crate::state::{PhaseTracker, SessionPhase};

/// What a DATA_REQUEST is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestKind {
    Following = 1,
    SpecificUser = 2,
    Global = 3,
    SearchText = 4,
    SearchHashtag = 5,
    SearchUser = 6,
}

impl RequestKind {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => RequestKind::Following,
            2 => RequestKind::SpecificUser,
            3 => RequestKind::Global,
            4 => RequestKind::SearchText,
            5 => RequestKind::SearchHashtag,
            6 => RequestKind::SearchUser,
            _ => return None,
        })
    }
}

/// Outbound payload kinds accepted by `send_payload`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Note,
    ZapKind9734Request,
    NwcPaymentRequest,
    ZapSuccessConfirm,
}

impl PayloadKind {
    pub fn message_type(self) -> MessageType {
        match self {
            PayloadKind::Note => MessageType::Note,
            PayloadKind::ZapKind9734Request => MessageType::ZapKind9734Request,
            PayloadKind::NwcPaymentRequest => MessageType::NwcPaymentRequest,
            PayloadKind::ZapSuccessConfirm => MessageType::ZapSuccessConfirm,
        }
    }

    /// Zap negotiation payloads are answered with a data message (invoice,
    /// payment result); notes and confirmations only need the DONE_ACK.
    pub fn expects_reply(self) -> bool {
        matches!(
            self,
            PayloadKind::ZapKind9734Request | PayloadKind::NwcPaymentRequest
        )
    }
}

/// `<kind>|<params>` request body.
pub fn encode_request(kind: RequestKind, params: &[u8]) -> Vec<u8> {
    let mut body = format!("{}|", kind as u8).into_bytes();
    body.extend_from_slice(params);
    body
}

/// Inverse of [`encode_request`].
pub fn decode_request(body: &[u8]) -> Result<(RequestKind, Bytes), LinkError> {
    let split = body
        .iter()
        .position(|&b| b == b'|')
        .ok_or_else(|| LinkError::ProtocolViolation("request body without kind".into()))?;
    let code: u8 = std::str::from_utf8(&body[..split])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| LinkError::ProtocolViolation("unparseable request kind".into()))?;
    let kind = RequestKind::from_code(code)
        .ok_or_else(|| LinkError::ProtocolViolation(format!("unknown request kind {code}")))?;
    Ok((kind, Bytes::copy_from_slice(&body[split + 1..])))
}

/// Application seam on the responder side. Implementations produce and
/// consume opaque payloads; everything radio stays in the core.
#[async_trait]
pub trait PayloadHandler: Send + Sync {
    /// Produce the response payload for a DATA_REQUEST.
    async fn handle_request(&self, kind: RequestKind, params: Bytes) -> Result<Bytes, String>;
    /// Accept an inbound note.
    async fn handle_note(&self, note: Bytes) -> Result<(), String>;
    /// Turn a zap request into an invoice payload.
    async fn handle_zap_request(&self, request: Bytes) -> Result<Bytes, String>;
    /// Execute a wallet payment command, returning the result payload.
    async fn handle_payment(&self, request: Bytes) -> Result<Bytes, String>;
    /// Accept a zap success confirmation.
    async fn handle_zap_confirm(&self, confirm: Bytes) -> Result<(), String>;
}

/// One point-to-point session over the radio gate.
pub struct Session {
    gate: RadioGate,
    phase: PhaseTracker,
    id: Option<SessionId>,
}

impl Session {
    pub fn new(gate: RadioGate) -> Self {
        Self {
            gate,
            phase: PhaseTracker::new(),
            id: None,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase.phase()
    }

    pub fn id(&self) -> Option<SessionId> {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.gate.is_cancelled()
    }

    pub fn gate(&self) -> &RadioGate {
        &self.gate
    }

    /// Hand the radio gate back for the next session on this TNC.
    pub fn into_gate(mut self) -> RadioGate {
        self.gate.unbind_session();
        self.gate
    }

    fn require_id(&self) -> Result<SessionId, LinkError> {
        self.id
            .ok_or_else(|| LinkError::ProtocolViolation("no established session".into()))
    }

    /// Mark the session failed after a best-effort DISCONNECT, per the
    /// fatal-error row of the state machine. Returns the error unchanged.
    async fn fail(&mut self, err: LinkError) -> LinkError {
        if self.phase.phase().is_terminal() {
            return err;
        }
        let already_closed = matches!(err, LinkError::LinkClosed);
        if let (Some(id), false) = (self.id, already_closed) {
            let bye = Packet::control(id, MessageType::Disconnect, Bytes::new());
            let _ = self.gate.transmit_final(&bye).await;
        }
        self.phase.force(SessionPhase::Failed);
        self.gate.emit(LinkEvent::Error(format!("Session failed: {err}")));
        err
    }

    /// Wait for one packet of `wanted` type, ignoring unrelated traffic.
    async fn await_type(
        &mut self,
        wanted: MessageType,
        wait: Duration,
        phase: Phase,
    ) -> Result<Packet, LinkError> {
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(LinkError::Timeout(phase))?;
            let pkt = self.gate.recv(remaining, phase).await?;
            if pkt.ty == wanted {
                return Ok(pkt);
            }
            if pkt.ty == MessageType::Disconnect {
                if let Some(id) = self.id {
                    let ack = Packet::control(id, MessageType::DisconnectAck, Bytes::new());
                    let _ = self.gate.transmit_final(&ack).await;
                }
                return Err(LinkError::LinkClosed);
            }
            debug!("ignoring {} while waiting for {wanted}", pkt.ty);
        }
    }

    // ------------------------------------------------------------------
    // Initiator side
    // ------------------------------------------------------------------

    /// CONNECT with a fresh session id and wait for CONNECT_ACK.
    pub async fn connect(&mut self) -> Result<SessionId, LinkError> {
        self.phase.advance(SessionPhase::Connecting)?;
        let id = SessionId::generate();
        self.gate.bind_session(id);

        let attempts = self.gate.cfg().disconnect_retry + 1;
        let wait = self.gate.cfg().connect_ack_timeout;
        let settle = self.gate.cfg().connection_stabilization_delay;

        for attempt in 1..=attempts {
            let hello = Packet::control(id, MessageType::Connect, Bytes::new());
            if let Err(e) = self.gate.transmit(&hello).await {
                return Err(self.fail(e).await);
            }
            match self.await_type(MessageType::ConnectAck, wait, Phase::Connect).await {
                Ok(_) => {
                    self.id = Some(id);
                    self.phase.advance(SessionPhase::Connected)?;
                    self.gate.emit(LinkEvent::SessionConnected {
                        remote: self.gate.cfg().remote_callsign.clone(),
                    });
                    self.gate.pause(settle).await?;
                    return Ok(id);
                }
                Err(LinkError::Timeout(_)) => {
                    warn!("no CONNECT_ACK on attempt {attempt}/{attempts}");
                }
                Err(e) => return Err(self.fail(e).await),
            }
        }
        Err(self.fail(LinkError::Timeout(Phase::Connect)).await)
    }

    /// Full request/response exchange: DATA_REQUEST, READY pair, RESPONSE.
    pub async fn request(&mut self, kind: RequestKind, params: &[u8]) -> Result<Bytes, LinkError> {
        let id = self.require_id()?;
        self.phase.advance(SessionPhase::Requesting)?;
        let body = encode_request(kind, params);

        let attempts = self.gate.cfg().send_retries;
        let ready_wait = self.gate.cfg().ready_timeout;

        for attempt in 1..=attempts {
            if let Err(e) = proto::send_unacked(&mut self.gate, id, MessageType::DataRequest, &body).await
            {
                return Err(self.fail(e).await);
            }
            match self.await_type(MessageType::Ready, ready_wait, Phase::Ready).await {
                Ok(_) => return self.finish_request(id).await,
                Err(LinkError::Timeout(_)) => {
                    warn!("no READY after DATA_REQUEST, attempt {attempt}/{attempts}");
                }
                Err(e) => return Err(self.fail(e).await),
            }
        }
        Err(self.fail(LinkError::Timeout(Phase::Ready)).await)
    }

    async fn finish_request(&mut self, id: SessionId) -> Result<Bytes, LinkError> {
        self.phase.advance(SessionPhase::ReadyTx)?;
        let ready = Packet::control(id, MessageType::Ready, Bytes::new());
        if let Err(e) = self.gate.transmit(&ready).await {
            return Err(self.fail(e).await);
        }

        self.phase.advance(SessionPhase::Receiving)?;
        match proto::recv_message(&mut self.gate, id, &[MessageType::Response]).await {
            Ok((_, payload)) => {
                self.phase.advance(SessionPhase::Delivered)?;
                Ok(payload)
            }
            // The peer answered properly with an ERROR message; the session
            // itself is still healthy.
            Err(LinkError::Remote(text)) => {
                self.phase.advance(SessionPhase::Delivered)?;
                Err(LinkError::Remote(text))
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Send a note or zap payload, returning the peer's data reply where
    /// the exchange defines one.
    pub async fn send_payload(
        &mut self,
        kind: PayloadKind,
        payload: &[u8],
    ) -> Result<Option<Bytes>, LinkError> {
        let id = self.require_id()?;
        self.phase.advance(SessionPhase::ReadyTx)?;
        if let Err(e) = self.ready_handshake(id).await {
            return match e {
                LinkError::Timeout(_) => Err(self.fail(LinkError::Timeout(Phase::Ready)).await),
                other => Err(self.fail(other).await),
            };
        }

        self.phase.advance(SessionPhase::Sending)?;
        if let Err(e) = proto::send_message(&mut self.gate, id, kind.message_type(), payload).await
        {
            return Err(self.fail(e).await);
        }

        if kind.expects_reply() {
            self.phase.advance(SessionPhase::Receiving)?;
            match proto::recv_message(&mut self.gate, id, &[MessageType::Response]).await {
                Ok((_, reply)) => {
                    self.phase.advance(SessionPhase::Delivered)?;
                    Ok(Some(reply))
                }
                Err(LinkError::Remote(text)) => {
                    self.phase.advance(SessionPhase::Delivered)?;
                    Err(LinkError::Remote(text))
                }
                Err(e) => Err(self.fail(e).await),
            }
        } else {
            self.phase.advance(SessionPhase::Delivered)?;
            Ok(None)
        }
    }

    /// Announce READY and wait for the peer's echo, re-prompting once at
    /// the halfway mark.
    async fn ready_handshake(&mut self, id: SessionId) -> Result<(), LinkError> {
        let ready = Packet::control(id, MessageType::Ready, Bytes::new());
        self.gate.transmit(&ready).await?;

        let total_wait = self.gate.cfg().ready_timeout;
        let deadline = Instant::now() + total_wait;
        let mut prompted = false;
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(LinkError::Timeout(Phase::Ready))?;
            let wait = if prompted {
                remaining
            } else {
                remaining.min(total_wait / 2)
            };
            match self.await_type(MessageType::Ready, wait, Phase::Ready).await {
                Ok(_) => {
                    self.gate
                        .pause(self.gate.cfg().connection_stabilization_delay)
                        .await?;
                    return Ok(());
                }
                Err(LinkError::Timeout(_)) if !prompted => {
                    prompted = true;
                    let again = Packet::control(id, MessageType::Ready, Bytes::new());
                    self.gate.transmit(&again).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// DISCONNECT / DISCONNECT_ACK exchange. Idempotent: a closed session
    /// returns success without traffic, and a timeout still closes.
    pub async fn disconnect(&mut self) -> Result<(), LinkError> {
        if self.phase.phase().is_terminal() {
            return Ok(());
        }
        let Some(id) = self.id else {
            self.phase.force(SessionPhase::Closed);
            return Ok(());
        };
        let _ = self.phase.advance(SessionPhase::Disconnecting);

        // A cancelled session gets exactly one goodbye inside the shutdown
        // budget; a graceful close retries per configuration.
        let (attempts, wait) = if self.gate.is_cancelled() {
            (1, self.gate.cfg().shutdown_timeout.min(self.gate.cfg().disconnect_timeout))
        } else {
            (
                self.gate.cfg().disconnect_retry + 1,
                self.gate.cfg().disconnect_timeout,
            )
        };

        for _ in 0..attempts {
            let bye = Packet::control(id, MessageType::Disconnect, Bytes::new());
            if self.gate.transmit_final(&bye).await.is_err() {
                break;
            }
            match self.await_disconnect_ack(wait).await {
                Ok(()) => break,
                Err(LinkError::Timeout(_)) => continue,
                Err(_) => break,
            }
        }

        self.phase.force(SessionPhase::Closed);
        self.gate.emit(LinkEvent::DisconnectComplete);
        Ok(())
    }

    /// Teardown wait; ignores cancellation so a cancelled session can still
    /// finish its goodbye inside the shutdown budget.
    async fn await_disconnect_ack(&mut self, wait: Duration) -> Result<(), LinkError> {
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(LinkError::Timeout(Phase::Disconnect))?;
            match self.gate.recv_final(remaining, Phase::Disconnect).await {
                Ok(pkt) if pkt.ty == MessageType::DisconnectAck => return Ok(()),
                // Simultaneous close: answer theirs and be done.
                Ok(pkt) if pkt.ty == MessageType::Disconnect => {
                    if let Some(id) = self.id {
                        let ack = Packet::control(id, MessageType::DisconnectAck, Bytes::new());
                        let _ = self.gate.transmit_final(&ack).await;
                    }
                    return Ok(());
                }
                Ok(pkt) => debug!("ignoring {} during disconnect", pkt.ty),
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn shutdown_transport(&mut self) {
        self.gate.shutdown().await;
    }

    // ------------------------------------------------------------------
    // Responder side
    // ------------------------------------------------------------------

    /// Serve one complete inbound session: CONNECT through DISCONNECT.
    pub async fn serve_one(&mut self, handler: &dyn PayloadHandler) -> Result<(), LinkError> {
        let id = self.await_connect().await?;
        self.phase.advance(SessionPhase::Connecting)?;
        self.id = Some(id);
        self.gate.bind_session(id);

        let ack = Packet::control(id, MessageType::ConnectAck, Bytes::new());
        self.gate.transmit(&ack).await?;
        self.phase.advance(SessionPhase::Connected)?;
        self.gate.emit(LinkEvent::SessionConnected {
            remote: self.gate.cfg().remote_callsign.clone(),
        });

        loop {
            let pkt = match self
                .gate
                .recv(self.gate.cfg().connection_timeout, Phase::Data)
                .await
            {
                Ok(pkt) => pkt,
                Err(LinkError::Timeout(_)) => {
                    warn!("session {id} idle past connection timeout");
                    return Err(self.fail(LinkError::Timeout(Phase::Data)).await);
                }
                Err(e) => return Err(self.fail(e).await),
            };

            match pkt.ty {
                // The initiator retried; our ack was lost.
                MessageType::Connect => {
                    let ack = Packet::control(id, MessageType::ConnectAck, Bytes::new());
                    self.gate.transmit(&ack).await?;
                }

                MessageType::DataRequest => {
                    if let Err(e) = self.serve_request(id, pkt, handler).await {
                        return Err(self.fail(e).await);
                    }
                }

                MessageType::Ready => {
                    if let Err(e) = self.serve_inbound_payload(id, handler).await {
                        return Err(self.fail(e).await);
                    }
                }

                MessageType::Disconnect => {
                    let ack = Packet::control(id, MessageType::DisconnectAck, Bytes::new());
                    let _ = self.gate.transmit_final(&ack).await;
                    self.phase.force(SessionPhase::Closed);
                    self.gate.emit(LinkEvent::Session(format!(
                        "Session {id} closed by remote"
                    )));
                    return Ok(());
                }

                other => debug!("responder ignoring {other}"),
            }
        }
    }

    /// Block until a CONNECT arrives, bounded by the idle interval.
    async fn await_connect(&mut self) -> Result<SessionId, LinkError> {
        self.gate.unbind_session();
        let wait = self.gate.cfg().keep_alive_final_interval;
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(LinkError::Timeout(Phase::Connect))?;
            let pkt = self.gate.recv(remaining, Phase::Connect).await?;
            if pkt.ty == MessageType::Connect {
                return Ok(pkt.session);
            }
            debug!("ignoring {} while idle", pkt.ty);
        }
    }

    async fn serve_request(
        &mut self,
        id: SessionId,
        first: Packet,
        handler: &dyn PayloadHandler,
    ) -> Result<(), LinkError> {
        self.phase.advance(SessionPhase::Requesting)?;
        let body = proto::gather_unacked(&mut self.gate, first).await?;
        let (kind, params) = decode_request(&body)?;
        self.gate.emit(LinkEvent::System(format!(
            "Handling {kind:?} request ({} parameter bytes)",
            params.len()
        )));

        // Produce the payload before inviting the transfer so the READY
        // pair sits right next to the data.
        let outcome = handler.handle_request(kind, params).await;

        self.phase.advance(SessionPhase::ReadyTx)?;
        self.ready_handshake(id).await?;

        self.phase.advance(SessionPhase::Sending)?;
        match outcome {
            Ok(payload) => {
                proto::send_message(&mut self.gate, id, MessageType::Response, &payload).await?;
            }
            Err(text) => {
                self.gate
                    .emit(LinkEvent::Error(format!("Request handler failed: {text}")));
                proto::send_message(&mut self.gate, id, MessageType::Error, text.as_bytes())
                    .await?;
            }
        }
        self.phase.advance(SessionPhase::Delivered)?;
        Ok(())
    }

    /// The peer opened a READY pair: a note or zap payload is coming.
    async fn serve_inbound_payload(
        &mut self,
        id: SessionId,
        handler: &dyn PayloadHandler,
    ) -> Result<(), LinkError> {
        self.phase.advance(SessionPhase::ReadyTx)?;
        let echo = Packet::control(id, MessageType::Ready, Bytes::new());
        self.gate.transmit(&echo).await?;

        self.phase.advance(SessionPhase::Receiving)?;
        let inbound = [
            MessageType::Note,
            MessageType::ZapKind9734Request,
            MessageType::NwcPaymentRequest,
            MessageType::ZapSuccessConfirm,
        ];
        let (ty, payload) = proto::recv_message(&mut self.gate, id, &inbound).await?;
        self.phase.advance(SessionPhase::Delivered)?;

        match ty {
            MessageType::Note => {
                if let Err(text) = handler.handle_note(payload).await {
                    // The sender is already satisfied by DONE_ACK; the
                    // failure stays a local event.
                    self.gate
                        .emit(LinkEvent::Error(format!("Note handler failed: {text}")));
                }
            }
            MessageType::ZapSuccessConfirm => {
                if let Err(text) = handler.handle_zap_confirm(payload).await {
                    self.gate
                        .emit(LinkEvent::Error(format!("Zap confirm handler failed: {text}")));
                }
            }
            MessageType::ZapKind9734Request => {
                let reply = handler.handle_zap_request(payload).await;
                self.reply_data(id, reply).await?;
            }
            MessageType::NwcPaymentRequest => {
                let reply = handler.handle_payment(payload).await;
                self.reply_data(id, reply).await?;
            }
            other => {
                return Err(LinkError::ProtocolViolation(format!(
                    "unexpected inbound payload type {other}"
                )))
            }
        }
        Ok(())
    }

    /// Answer a zap sub-exchange with a RESPONSE or ERROR data message.
    async fn reply_data(
        &mut self,
        id: SessionId,
        reply: Result<Bytes, String>,
    ) -> Result<(), LinkError> {
        self.phase.advance(SessionPhase::Sending)?;
        match reply {
            Ok(payload) => {
                proto::send_message(&mut self.gate, id, MessageType::Response, &payload).await?
            }
            Err(text) => {
                self.gate
                    .emit(LinkEvent::Error(format!("Handler failed: {text}")));
                proto::send_message(&mut self.gate, id, MessageType::Error, text.as_bytes())
                    .await?
            }
        }
        self.phase.advance(SessionPhase::Delivered)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_roundtrip() {
        let body = encode_request(RequestKind::Following, b"2");
        assert_eq!(body, b"1|2");
        let (kind, params) = decode_request(&body).unwrap();
        assert_eq!(kind, RequestKind::Following);
        assert_eq!(&params[..], b"2");
    }

    #[test]
    fn request_body_with_binary_params() {
        let body = encode_request(RequestKind::SearchHashtag, &[0xFF, b'|', 0x00]);
        let (kind, params) = decode_request(&body).unwrap();
        assert_eq!(kind, RequestKind::SearchHashtag);
        assert_eq!(&params[..], &[0xFF, b'|', 0x00]);
    }

    #[test]
    fn malformed_request_bodies_are_violations() {
        assert!(decode_request(b"").is_err());
        assert!(decode_request(b"noseparator").is_err());
        assert!(decode_request(b"99|x").is_err());
    }

    #[test]
    fn zap_kinds_expect_replies() {
        assert!(PayloadKind::ZapKind9734Request.expects_reply());
        assert!(PayloadKind::NwcPaymentRequest.expects_reply());
        assert!(!PayloadKind::Note.expects_reply());
        assert!(!PayloadKind::ZapSuccessConfirm.expects_reply());
    }
}
