//! Shared harness: a virtual radio channel between two KISS TNC sockets,
//! with per-direction fault injection at packet granularity.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use hamstr_session::session::PayloadHandler;
use hamstr_session::{EventBus, LinkConfig, LinkEvent, RequestKind};
use hamstr_wire::{kiss_wrap, KissDecoder, Packet, UiFrame};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;

/// What to do with one forwarded packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Forward,
    Drop,
    Duplicate,
}

pub type FaultFn = Box<dyn FnMut(&Packet) -> Action + Send>;

/// A fault plan that forwards everything.
pub fn clean() -> FaultFn {
    Box::new(|_| Action::Forward)
}

/// Start the virtual radio. The first station to connect talks through the
/// `first_to_second` plan; the second through `second_to_first`. Returns
/// the address both stations dial as their "TNC".
pub async fn virtual_radio(first_to_second: FaultFn, second_to_first: FaultFn) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (first, _) = listener.accept().await.unwrap();
        let (second, _) = listener.accept().await.unwrap();
        first.set_nodelay(true).unwrap();
        second.set_nodelay(true).unwrap();
        let (first_rx, first_tx) = first.into_split();
        let (second_rx, second_tx) = second.into_split();
        let a = tokio::spawn(pump(first_rx, second_tx, first_to_second));
        let b = tokio::spawn(pump(second_rx, first_tx, second_to_first));
        let _ = a.await;
        let _ = b.await;
    });
    addr
}

async fn pump(mut rx: OwnedReadHalf, mut tx: OwnedWriteHalf, mut fault: FaultFn) {
    let mut decoder = KissDecoder::new();
    let mut acc = BytesMut::new();
    let mut chunk = [0u8; 2048];
    loop {
        let n = match rx.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        acc.extend_from_slice(&chunk[..n]);
        loop {
            match decoder.decode(&mut acc) {
                Ok(Some(frame)) => {
                    let action = UiFrame::decode(&frame)
                        .ok()
                        .and_then(|ui| Packet::decode(&ui.payload).ok())
                        .map(|pkt| fault(&pkt))
                        .unwrap_or(Action::Forward);
                    let copies = match action {
                        Action::Drop => 0,
                        Action::Forward => 1,
                        Action::Duplicate => 2,
                    };
                    let wire = kiss_wrap(&frame);
                    for _ in 0..copies {
                        if tx.write_all(&wire).await.is_err() {
                            return;
                        }
                    }
                }
                Ok(None) => break,
                Err(_) => continue,
            }
        }
    }
}

/// Timers shrunk to test scale; addressing filled in per station.
pub fn test_config(local: &str, remote: &str) -> LinkConfig {
    let ms = Duration::from_millis;
    let mut cfg = LinkConfig::default();
    cfg.local_callsign = local.parse().unwrap();
    cfg.remote_callsign = remote.parse().unwrap();

    cfg.ack_timeout = ms(400);
    cfg.connect_ack_timeout = ms(1000);
    cfg.no_ack_timeout = ms(800);
    cfg.no_packet_timeout = ms(1500);
    cfg.ready_timeout = ms(1500);
    cfg.missing_packets_timeout = ms(600);
    cfg.connection_attempt_timeout = Duration::from_secs(2);
    cfg.connection_timeout = Duration::from_secs(20);
    cfg.disconnect_timeout = ms(500);
    cfg.shutdown_timeout = Duration::from_secs(2);
    cfg.keep_alive_final_interval = Duration::from_secs(20);

    cfg.send_retries = 3;
    cfg.disconnect_retry = 1;

    cfg.ptt_tx_delay = ms(5);
    cfg.ptt_rx_delay = ms(2);
    cfg.ptt_tail = ms(2);
    cfg.ack_spacing = ms(2);
    cfg.packet_send_delay = ms(2);
    cfg.packet_resend_delay = ms(50);
    cfg.connection_stabilization_delay = ms(2);
    cfg
}

/// Observer that keeps every rendered event line.
#[derive(Clone)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn attach(bus: &EventBus) -> Self {
        let log = EventLog(Arc::new(Mutex::new(Vec::new())));
        let sink = Arc::clone(&log.0);
        bus.subscribe(Arc::new(move |event: &LinkEvent| {
            sink.lock().unwrap().push(event.render());
        }));
        log
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.0.lock().unwrap().iter().any(|line| line.contains(needle))
    }

    pub fn lines(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Canned responder for the round-trip scenarios.
pub struct FixtureHandler {
    pub response: Vec<u8>,
    pub invoice: Vec<u8>,
    pub payment_result: Vec<u8>,
    pub notes: Mutex<Vec<Bytes>>,
    pub confirms: Mutex<usize>,
}

impl FixtureHandler {
    pub fn with_response(response: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            response,
            invoice: b"lnbc1invoice".to_vec(),
            payment_result: b"{\"result\":\"paid\"}".to_vec(),
            notes: Mutex::new(Vec::new()),
            confirms: Mutex::new(0),
        })
    }
}

#[async_trait]
impl PayloadHandler for FixtureHandler {
    async fn handle_request(&self, _kind: RequestKind, _params: Bytes) -> Result<Bytes, String> {
        Ok(Bytes::from(self.response.clone()))
    }

    async fn handle_note(&self, note: Bytes) -> Result<(), String> {
        self.notes.lock().unwrap().push(note);
        Ok(())
    }

    async fn handle_zap_request(&self, _request: Bytes) -> Result<Bytes, String> {
        Ok(Bytes::from(self.invoice.clone()))
    }

    async fn handle_payment(&self, _request: Bytes) -> Result<Bytes, String> {
        Ok(Bytes::from(self.payment_result.clone()))
    }

    async fn handle_zap_confirm(&self, _confirm: Bytes) -> Result<(), String> {
        *self.confirms.lock().unwrap() += 1;
        Ok(())
    }
}
