//! Session-id isolation and radio-gate discipline, exercised against a
//! scripted raw peer instead of a full responder.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use common::{clean, test_config, virtual_radio, EventLog};
use hamstr_session::radio::RadioGate;
use hamstr_session::{open_session, EventBus, RequestKind};
use hamstr_tnc::{KissTcp, TncLink};
use hamstr_wire::{
    ack_body, kiss_wrap, Callsign, KissDecoder, MessageType, Packet, SessionId, UiFrame,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// A hand-driven peer speaking raw KISS on the virtual radio.
struct RawPeer {
    stream: TcpStream,
    decoder: KissDecoder,
    acc: BytesMut,
    me: Callsign,
    them: Callsign,
}

impl RawPeer {
    async fn dial(addr: std::net::SocketAddr, me: &str, them: &str) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            decoder: KissDecoder::new(),
            acc: BytesMut::new(),
            me: me.parse().unwrap(),
            them: them.parse().unwrap(),
        }
    }

    async fn send(&mut self, pkt: Packet) {
        let frame = UiFrame::new(self.me.clone(), self.them.clone(), pkt.encode(200).unwrap());
        self.stream
            .write_all(&kiss_wrap(&frame.encode()))
            .await
            .unwrap();
    }

    /// Next packet addressed to us, skipping everything else.
    async fn recv(&mut self) -> Packet {
        loop {
            if let Ok(Some(raw)) = self.decoder.decode(&mut self.acc) {
                if let Ok(ui) = UiFrame::decode(&raw) {
                    if ui.dest == self.me {
                        if let Ok(pkt) = Packet::decode(&ui.payload) {
                            return pkt;
                        }
                    }
                }
                continue;
            }
            let mut chunk = [0u8; 1024];
            let n = self.stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "radio channel closed under the raw peer");
            self.acc.extend_from_slice(&chunk[..n]);
        }
    }

    async fn recv_of_type(&mut self, ty: MessageType) -> Packet {
        loop {
            let pkt = self.recv().await;
            if pkt.ty == ty {
                return pkt;
            }
        }
    }
}

#[tokio::test]
async fn foreign_session_packets_are_discarded_without_state_damage() {
    let addr = virtual_radio(clean(), clean()).await;

    // Peer grabs the first slot, then scripts the whole exchange.
    let mut peer = RawPeer::dial(addr, "CALL2-2", "CALL1-1").await;
    let script = tokio::spawn(async move {
        let connect = peer.recv_of_type(MessageType::Connect).await;
        let sid = connect.session;
        peer.send(Packet::control(sid, MessageType::ConnectAck, Bytes::new()))
            .await;

        let _request = peer.recv_of_type(MessageType::DataRequest).await;
        peer.send(Packet::control(sid, MessageType::Ready, Bytes::new()))
            .await;
        let _ready_echo = peer.recv_of_type(MessageType::Ready).await;

        // A packet from a stale session first; it must vanish silently.
        let foreign: SessionId = "deadbeef".parse().unwrap();
        peer.send(Packet::new(
            foreign,
            MessageType::Response,
            1,
            1,
            Bytes::from_static(b"WRONG SESSION"),
        ))
        .await;

        peer.send(Packet::new(
            sid,
            MessageType::Response,
            1,
            1,
            Bytes::from_static(b"right payload"),
        ))
        .await;
        let ack = peer.recv_of_type(MessageType::Ack).await;
        assert_eq!(&ack.body[..], &ack_body(1)[..]);

        peer.send(Packet::control(sid, MessageType::Done, Bytes::new()))
            .await;
        let _done_ack = peer.recv_of_type(MessageType::DoneAck).await;

        let _disconnect = peer.recv_of_type(MessageType::Disconnect).await;
        peer.send(Packet::control(sid, MessageType::DisconnectAck, Bytes::new()))
            .await;
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    let bus = EventBus::new();
    let log = EventLog::attach(&bus);
    let tnc = TncLink::tcp(
        KissTcp::connect("127.0.0.1", addr.port(), Duration::from_secs(2))
            .await
            .unwrap(),
    );
    let handle = open_session(tnc, Arc::new(test_config("CALL1-1", "CALL2-2")), bus)
        .await
        .unwrap();

    let delivered = handle
        .request_payload(RequestKind::Following, Bytes::from_static(b"1"))
        .await
        .unwrap();
    assert_eq!(&delivered[..], b"right payload");

    handle.close_session().await.unwrap();
    script.await.unwrap();

    assert!(log.contains("foreign session id deadbeef"));
}

#[tokio::test]
async fn gate_enforces_ptt_and_spacing() {
    let addr = virtual_radio(clean(), clean()).await;

    // A silent listener occupies the far side.
    let _listener = TcpStream::connect(addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut cfg = test_config("CALL1-1", "CALL2-2");
    cfg.packet_send_delay = Duration::from_millis(80);
    let spacing = cfg.packet_send_delay;
    let tnc = TncLink::tcp(
        KissTcp::connect("127.0.0.1", addr.port(), Duration::from_secs(2))
            .await
            .unwrap(),
    );
    let mut gate = RadioGate::new(tnc, Arc::new(cfg), EventBus::new(), CancellationToken::new());

    let sid = SessionId::generate();
    let pkt = Packet::control(sid, MessageType::Ready, Bytes::new());

    gate.transmit(&pkt).await.unwrap();
    // PTT never stays keyed once the gate releases the channel.
    assert!(!gate.ptt_keyed());

    let start = std::time::Instant::now();
    gate.transmit(&pkt).await.unwrap();
    assert!(
        start.elapsed() >= spacing,
        "second transmission ignored the inter-packet gap"
    );
    assert!(!gate.ptt_keyed());
}
