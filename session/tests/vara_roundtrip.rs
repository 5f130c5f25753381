//! VARA-mode round trips against a scripted modem: the same logical
//! request as the packet path, with every layer below the session replaced
//! by the modem's reliable stream.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::{test_config, EventLog, FixtureHandler};
use hamstr_session::{open_vara_session, serve_vara_session, EventBus, RequestKind};
use hamstr_tnc::VaraModem;
use hamstr_wire::MessageType;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

const DONE_MARKER: u8 = 0x04;
const DONE_ACK_MARKER: u8 = 0x06;

async fn read_block(stream: &mut (impl AsyncReadExt + Unpin)) -> (u8, Vec<u8>) {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).await.unwrap();
    let len = u32::from_be_bytes(len) as usize;
    let mut content = vec![0u8; len];
    stream.read_exact(&mut content).await.unwrap();
    (content[0], content[1..].to_vec())
}

async fn write_block(stream: &mut (impl AsyncWriteExt + Unpin), ty: u8, body: &[u8]) {
    let mut block = (body.len() as u32 + 1).to_be_bytes().to_vec();
    block.push(ty);
    block.extend_from_slice(body);
    stream.write_all(&block).await.unwrap();
}

#[tokio::test]
async fn vara_request_roundtrip_without_packet_layers() {
    let cmd_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let data_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let cmd_port = cmd_listener.local_addr().unwrap().port();
    let data_port = data_listener.local_addr().unwrap().port();

    // Scripted modem firmware plus remote peer behind it.
    let firmware = tokio::spawn(async move {
        let (cmd, _) = cmd_listener.accept().await.unwrap();
        let (cmd_rx, mut cmd_tx) = cmd.into_split();
        let mut lines = BufReader::new(cmd_rx);

        let mut line = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            lines.read_exact(&mut byte).await.unwrap();
            if byte[0] != b'\r' {
                line.push(byte[0]);
                continue;
            }
            let text = String::from_utf8(std::mem::take(&mut line)).unwrap();
            cmd_tx.write_all(b"OK\r").await.unwrap();
            if text.starts_with("CONNECT ") {
                cmd_tx
                    .write_all(b"PTT ON\rCONNECTED CALL1-1 CALL2-2 2300\rPTT OFF\r")
                    .await
                    .unwrap();
                break;
            }
        }

        let (mut data, _) = data_listener.accept().await.unwrap();

        // Request block in, response block out.
        let (ty, body) = read_block(&mut data).await;
        assert_eq!(ty, MessageType::DataRequest as u8);
        assert_eq!(&body, b"1|1");
        write_block(&mut data, MessageType::Response as u8, &vec![b'v'; 57]).await;

        // DONE marker / DONE_ACK marker, then the modem-level teardown.
        let mut marker = [0u8; 1];
        data.read_exact(&mut marker).await.unwrap();
        assert_eq!(marker[0], DONE_MARKER);
        data.write_all(&[DONE_ACK_MARKER]).await.unwrap();

        let mut line = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            lines.read_exact(&mut byte).await.unwrap();
            if byte[0] != b'\r' {
                line.push(byte[0]);
                continue;
            }
            let text = String::from_utf8(std::mem::take(&mut line)).unwrap();
            if text == "DISCONNECT" {
                cmd_tx.write_all(b"DISCONNECTED\r").await.unwrap();
                break;
            }
            cmd_tx.write_all(b"OK\r").await.unwrap();
        }
    });

    let cfg = Arc::new(test_config("CALL1-1", "CALL2-2"));
    let modem = VaraModem::connect(
        "127.0.0.1",
        cmd_port,
        data_port,
        &cfg.local_callsign,
        2300,
        false,
    )
    .await
    .unwrap();

    let bus = EventBus::new();
    let log = EventLog::attach(&bus);
    let handle = open_vara_session(modem, Arc::clone(&cfg), bus).await.unwrap();

    let payload = handle
        .request_payload(RequestKind::Following, Bytes::from_static(b"1"))
        .await
        .unwrap();
    assert_eq!(&payload[..], &vec![b'v'; 57][..]);

    handle.close_session().await.unwrap();
    firmware.await.unwrap();

    // Coarse phase reporting only: no packet-layer events in this mode.
    for line in log.lines() {
        assert!(!line.starts_with("[CONTROL]"), "unexpected packet event: {line}");
        assert!(!line.starts_with("[PACKET]"), "unexpected packet event: {line}");
    }
    assert!(log.contains("[SESSION] CONNECTED to CALL2-2"));
    assert!(log.contains("[PROGRESS] 100.00% complete"));
    assert!(log.contains("[SESSION] Client disconnect complete"));
}

#[tokio::test]
async fn vara_responder_accepts_a_note() {
    let cmd_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let data_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let cmd_port = cmd_listener.local_addr().unwrap().port();
    let data_port = data_listener.local_addr().unwrap().port();

    let firmware = tokio::spawn(async move {
        let (cmd, _) = cmd_listener.accept().await.unwrap();
        let (cmd_rx, mut cmd_tx) = cmd.into_split();
        let mut lines = BufReader::new(cmd_rx);

        // MYCALL, BW, LISTEN ON.
        let mut commands_seen = 0;
        let mut line = Vec::new();
        while commands_seen < 3 {
            let mut byte = [0u8; 1];
            lines.read_exact(&mut byte).await.unwrap();
            if byte[0] != b'\r' {
                line.push(byte[0]);
                continue;
            }
            line.clear();
            commands_seen += 1;
            cmd_tx.write_all(b"OK\r").await.unwrap();
        }

        // An initiator shows up.
        tokio::time::sleep(Duration::from_millis(30)).await;
        cmd_tx
            .write_all(b"CONNECTED CALL1-1 CALL2-2 2300\r")
            .await
            .unwrap();
        let (mut data, _) = data_listener.accept().await.unwrap();

        write_block(&mut data, MessageType::Note as u8, b"{\"content\":\"hi\"}").await;
        data.write_all(&[DONE_MARKER]).await.unwrap();

        let mut marker = [0u8; 1];
        data.read_exact(&mut marker).await.unwrap();
        assert_eq!(marker[0], DONE_ACK_MARKER);

        let mut line = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            if lines.read_exact(&mut byte).await.is_err() {
                break;
            }
            if byte[0] != b'\r' {
                line.push(byte[0]);
                continue;
            }
            let text = String::from_utf8(std::mem::take(&mut line)).unwrap();
            if text == "DISCONNECT" {
                let _ = cmd_tx.write_all(b"DISCONNECTED\r").await;
                break;
            }
            let _ = cmd_tx.write_all(b"OK\r").await;
        }
    });

    let cfg = Arc::new(test_config("CALL2-2", "CALL1-1"));
    let modem = VaraModem::connect(
        "127.0.0.1",
        cmd_port,
        data_port,
        &cfg.local_callsign,
        2300,
        true,
    )
    .await
    .unwrap();

    let handler = FixtureHandler::with_response(Vec::new());
    let bus = EventBus::new();
    serve_vara_session(modem, cfg, bus, &*handler).await.unwrap();
    firmware.await.unwrap();

    let notes = handler.notes.lock().unwrap();
    assert_eq!(notes.len(), 1);
    assert_eq!(&notes[0][..], b"{\"content\":\"hi\"}");
}
