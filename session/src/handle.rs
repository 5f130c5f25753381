//! The stable interface the application drives the link through.
//!
//! `open_session` performs the connect exchange, then parks the session on
//! its own task; a [`SessionHandle`] feeds it commands over a channel and
//! carries the cancellation token. Exactly one task ever touches the TNC.

use std::sync::Arc;

use bytes::Bytes;
use hamstr_tnc::TncLink;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::event::EventBus;
use crate::radio::RadioGate;
use crate::session::{PayloadHandler, PayloadKind, RequestKind, Session};

pub(crate) enum Command {
    Request {
        kind: RequestKind,
        params: Bytes,
        resp: oneshot::Sender<Result<Bytes, LinkError>>,
    },
    Send {
        kind: PayloadKind,
        payload: Bytes,
        resp: oneshot::Sender<Result<Option<Bytes>, LinkError>>,
    },
    Close {
        resp: oneshot::Sender<Result<(), LinkError>>,
    },
}

/// Handle to a live session task.
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub(crate) fn new(commands: mpsc::Sender<Command>, cancel: CancellationToken) -> Self {
        Self { commands, cancel }
    }

    /// Request a payload from the remote station and wait for the full
    /// response.
    pub async fn request_payload(
        &self,
        kind: RequestKind,
        params: impl Into<Bytes>,
    ) -> Result<Bytes, LinkError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Request {
                kind,
                params: params.into(),
                resp: tx,
            })
            .await
            .map_err(|_| LinkError::LinkClosed)?;
        rx.await.map_err(|_| LinkError::LinkClosed)?
    }

    /// Push a payload to the remote station. Zap negotiation kinds return
    /// the peer's data reply.
    pub async fn send_payload(
        &self,
        kind: PayloadKind,
        payload: impl Into<Bytes>,
    ) -> Result<Option<Bytes>, LinkError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Send {
                kind,
                payload: payload.into(),
                resp: tx,
            })
            .await
            .map_err(|_| LinkError::LinkClosed)?;
        rx.await.map_err(|_| LinkError::LinkClosed)?
    }

    /// Run the disconnect exchange. Idempotent: once the session task is
    /// gone, further calls succeed without any traffic.
    pub async fn close_session(&self) -> Result<(), LinkError> {
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Close { resp: tx })
            .await
            .is_err()
        {
            return Ok(());
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => Ok(()),
        }
    }

    /// Cooperative abort. Any pending wait wakes with `Cancelled` and the
    /// session performs one best-effort DISCONNECT inside the shutdown
    /// budget.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Open a session to the configured remote station over a KISS TNC.
pub async fn open_session(
    tnc: TncLink,
    cfg: Arc<LinkConfig>,
    bus: Arc<EventBus>,
) -> Result<SessionHandle, LinkError> {
    let cancel = CancellationToken::new();
    let gate = RadioGate::new(tnc, cfg, bus, cancel.clone());
    let mut session = Session::new(gate);
    session.connect().await?;

    let (tx, rx) = mpsc::channel(4);
    tokio::spawn(run_session(session, rx));
    Ok(SessionHandle::new(tx, cancel))
}

async fn run_session(mut session: Session, mut commands: mpsc::Receiver<Command>) {
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
                session.shutdown_transport().await;
                return;
            }
        }
        if session.is_cancelled() || session.phase().is_terminal() {
            break;
        }
    }
    // Cancelled, failed, or the handle was dropped: best-effort goodbye.
    if !session.phase().is_terminal() {
        debug!("session task tearing down without explicit close");
        let _ = session.disconnect().await;
    }
    session.shutdown_transport().await;
}

/// Responder endpoint: serves inbound sessions back to back over one TNC.
pub struct Responder {
    gate: Option<RadioGate>,
    cancel: CancellationToken,
}

impl Responder {
    pub fn new(tnc: TncLink, cfg: Arc<LinkConfig>, bus: Arc<EventBus>) -> Self {
        let cancel = CancellationToken::new();
        let gate = RadioGate::new(tnc, cfg, bus, cancel.clone());
        Self {
            gate: Some(gate),
            cancel,
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for a CONNECT, run the whole exchange against `handler`, and
    /// return once the peer disconnects. The TNC stays open for the next
    /// session.
    pub async fn serve_one(&mut self, handler: &dyn PayloadHandler) -> Result<(), LinkError> {
        let gate = self
            .gate
            .take()
            .ok_or_else(|| LinkError::ProtocolViolation("responder gate lost".into()))?;
        let mut session = Session::new(gate);
        let result = session.serve_one(handler).await;
        self.gate = Some(session.into_gate());
        result
    }
}
