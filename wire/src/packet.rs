//! The HAMSTR packet format carried inside AX.25 UI payloads.
//!
//! ```text
//! +------------+------+--------+----------+------+-----------+
//! | session_id | type | seq    | total    | body | crc16     |
//! +------------+------+--------+----------+------+-----------+
//!   8B ASCII     1B     2B BE    2B BE      var    2B BE
//! ```
//!
//! The body CRC is validated independently of the AX.25 FCS so corruption
//! introduced between TNC and host is still caught. Control messages carry
//! short ASCII bodies (`ACK|7`, `PKT_MISSING|1,3,4`); data messages carry
//! opaque bytes.

use std::fmt;
use std::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};

use crate::crc::crc16_x25;
use crate::error::WireError;

/// Fixed length of a session id on the wire.
pub const SESSION_ID_LEN: usize = 8;

/// Header plus trailing CRC: 8 + 1 + 2 + 2 + 2.
pub const PACKET_OVERHEAD: usize = SESSION_ID_LEN + 1 + 2 + 2 + 2;

/// Short opaque token identifying one exchange between two callsigns.
///
/// Assigned by the initiator at CONNECT and echoed in every packet of the
/// session. Eight lowercase ASCII hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId([u8; SESSION_ID_LEN]);

impl SessionId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        let mut id = [0u8; SESSION_ID_LEN];
        let hex = format!("{:08x}", rand::random::<u32>());
        id.copy_from_slice(hex.as_bytes());
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_ID_LEN] {
        &self.0
    }

    fn from_wire(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() != SESSION_ID_LEN
            || !bytes.iter().all(|b| b.is_ascii_hexdigit())
        {
            return Err(WireError::BadSessionId);
        }
        let mut id = [0u8; SESSION_ID_LEN];
        id.copy_from_slice(bytes);
        Ok(Self(id))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Always ASCII by construction.
        f.write_str(std::str::from_utf8(&self.0).unwrap_or("????????"))
    }
}

impl FromStr for SessionId {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, WireError> {
        Self::from_wire(s.as_bytes())
    }
}

/// Message types of the HAMSTR link protocol.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Connect = 0x01,
    ConnectAck = 0x02,
    Ready = 0x03,
    DataRequest = 0x04,
    Note = 0x05,
    Response = 0x06,
    Ack = 0x07,
    Done = 0x08,
    DoneAck = 0x09,
    Disconnect = 0x0A,
    DisconnectAck = 0x0B,
    PktMissing = 0x0C,
    Retry = 0x0D,
    ZapKind9734Request = 0x0E,
    NwcPaymentRequest = 0x0F,
    ZapSuccessConfirm = 0x10,
    Error = 0x11,
}

impl MessageType {
    /// Control messages are single-packet by definition; everything else
    /// carries an application body that may span packets.
    pub fn is_control(self) -> bool {
        !matches!(
            self,
            MessageType::DataRequest
                | MessageType::Note
                | MessageType::Response
                | MessageType::ZapKind9734Request
                | MessageType::NwcPaymentRequest
                | MessageType::ZapSuccessConfirm
                | MessageType::Error
        )
    }
}

impl TryFrom<u8> for MessageType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        Ok(match value {
            0x01 => MessageType::Connect,
            0x02 => MessageType::ConnectAck,
            0x03 => MessageType::Ready,
            0x04 => MessageType::DataRequest,
            0x05 => MessageType::Note,
            0x06 => MessageType::Response,
            0x07 => MessageType::Ack,
            0x08 => MessageType::Done,
            0x09 => MessageType::DoneAck,
            0x0A => MessageType::Disconnect,
            0x0B => MessageType::DisconnectAck,
            0x0C => MessageType::PktMissing,
            0x0D => MessageType::Retry,
            0x0E => MessageType::ZapKind9734Request,
            0x0F => MessageType::NwcPaymentRequest,
            0x10 => MessageType::ZapSuccessConfirm,
            0x11 => MessageType::Error,
            other => return Err(WireError::UnknownType(other)),
        })
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Connect => "CONNECT",
            MessageType::ConnectAck => "CONNECT_ACK",
            MessageType::Ready => "READY",
            MessageType::DataRequest => "DATA_REQUEST",
            MessageType::Note => "NOTE",
            MessageType::Response => "RESPONSE",
            MessageType::Ack => "ACK",
            MessageType::Done => "DONE",
            MessageType::DoneAck => "DONE_ACK",
            MessageType::Disconnect => "DISCONNECT",
            MessageType::DisconnectAck => "DISCONNECT_ACK",
            MessageType::PktMissing => "PKT_MISSING",
            MessageType::Retry => "RETRY",
            MessageType::ZapKind9734Request => "ZAP_KIND9734_REQUEST",
            MessageType::NwcPaymentRequest => "NWC_PAYMENT_REQUEST",
            MessageType::ZapSuccessConfirm => "ZAP_SUCCESS_CONFIRM",
            MessageType::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// One HAMSTR packet. `seq` is 1-based; `total` is fixed at the first
/// transmission of the message and is 1 for control messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub session: SessionId,
    pub ty: MessageType,
    pub seq: u16,
    pub total: u16,
    pub body: Bytes,
}

impl Packet {
    pub fn new(session: SessionId, ty: MessageType, seq: u16, total: u16, body: Bytes) -> Self {
        Self {
            session,
            ty,
            seq,
            total,
            body,
        }
    }

    /// A control packet: single packet, seq = total = 1.
    pub fn control(session: SessionId, ty: MessageType, body: Bytes) -> Self {
        Self::new(session, ty, 1, 1, body)
    }

    /// Encoded size of this packet on the wire.
    pub fn encoded_len(&self) -> usize {
        PACKET_OVERHEAD + self.body.len()
    }

    /// Encode, rejecting packets over `max_size` bytes.
    pub fn encode(&self, max_size: usize) -> Result<Bytes, WireError> {
        let len = self.encoded_len();
        if len > max_size {
            return Err(WireError::Oversize(len, max_size));
        }
        let mut buf = BytesMut::with_capacity(len);
        buf.put_slice(self.session.as_bytes());
        buf.put_u8(self.ty as u8);
        buf.put_u16(self.seq);
        buf.put_u16(self.total);
        buf.put_slice(&self.body);
        buf.put_u16(crc16_x25(&self.body));
        Ok(buf.freeze())
    }

    /// Decode and validate the body CRC.
    pub fn decode(raw: &[u8]) -> Result<Self, WireError> {
        if raw.len() < PACKET_OVERHEAD {
            return Err(WireError::Truncated(raw.len()));
        }
        let session = SessionId::from_wire(&raw[..SESSION_ID_LEN])?;
        let ty = MessageType::try_from(raw[SESSION_ID_LEN])?;
        let seq = u16::from_be_bytes([raw[9], raw[10]]);
        let total = u16::from_be_bytes([raw[11], raw[12]]);

        let body = &raw[13..raw.len() - 2];
        let crc = u16::from_be_bytes([raw[raw.len() - 2], raw[raw.len() - 1]]);
        if crc16_x25(body) != crc {
            return Err(WireError::BadCrc);
        }

        Ok(Self {
            session,
            ty,
            seq,
            total,
            body: Bytes::copy_from_slice(body),
        })
    }
}

/// Body of an `ACK` control packet.
pub fn ack_body(seq: u16) -> Bytes {
    Bytes::from(format!("ACK|{seq}"))
}

/// Parse the sequence number out of an `ACK` body.
pub fn parse_ack(body: &[u8]) -> Option<u16> {
    let text = std::str::from_utf8(body).ok()?;
    let (tag, seq) = text.split_once('|')?;
    if tag != "ACK" {
        return None;
    }
    seq.trim().parse().ok()
}

/// Body of a `PKT_MISSING` control packet: sorted, comma-separated.
pub fn missing_body(missing: &[u16]) -> Bytes {
    let mut sorted = missing.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    let list: Vec<String> = sorted.iter().map(|s| s.to_string()).collect();
    Bytes::from(format!("PKT_MISSING|{}", list.join(",")))
}

/// Parse the sequence list out of a `PKT_MISSING` body.
pub fn parse_missing(body: &[u8]) -> Option<Vec<u16>> {
    let text = std::str::from_utf8(body).ok()?;
    let (tag, list) = text.split_once('|')?;
    if tag != "PKT_MISSING" || list.trim().is_empty() {
        return None;
    }
    list.split(',')
        .map(|s| s.trim().parse().ok())
        .collect::<Option<Vec<u16>>>()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid() -> SessionId {
        "00c0ffee".parse().unwrap()
    }

    #[test]
    fn session_id_generation_is_hex() {
        let id = SessionId::generate();
        assert!(id.as_bytes().iter().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(id.to_string().len(), SESSION_ID_LEN);
    }

    #[test]
    fn session_id_rejects_garbage() {
        assert!("short".parse::<SessionId>().is_err());
        assert!("zzzzzzzz".parse::<SessionId>().is_err());
        assert!("0123456789".parse::<SessionId>().is_err());
    }

    #[test]
    fn packet_roundtrip() {
        let pkt = Packet::new(sid(), MessageType::Response, 2, 3, Bytes::from_static(b"abc"));
        let raw = pkt.encode(200).unwrap();
        assert_eq!(raw.len(), PACKET_OVERHEAD + 3);
        let decoded = Packet::decode(&raw).unwrap();
        assert_eq!(decoded, pkt);
    }

    #[test]
    fn every_type_roundtrips() {
        for code in 0x01..=0x11u8 {
            let ty = MessageType::try_from(code).unwrap();
            assert_eq!(ty as u8, code);
        }
        assert!(MessageType::try_from(0x00).is_err());
        assert!(MessageType::try_from(0x12).is_err());
    }

    #[test]
    fn body_crc_guards_corruption() {
        let pkt = Packet::new(sid(), MessageType::Note, 1, 1, Bytes::from_static(b"body"));
        let mut raw = pkt.encode(200).unwrap().to_vec();
        raw[14] ^= 0x01; // flip one body bit
        assert!(matches!(Packet::decode(&raw), Err(WireError::BadCrc)));
    }

    #[test]
    fn oversize_rejected() {
        let pkt = Packet::new(sid(), MessageType::Response, 1, 1, Bytes::from(vec![0u8; 190]));
        assert!(matches!(
            pkt.encode(200),
            Err(WireError::Oversize(205, 200))
        ));
    }

    #[test]
    fn control_bodies() {
        assert_eq!(&ack_body(7)[..], b"ACK|7");
        assert_eq!(parse_ack(b"ACK|42"), Some(42));
        assert_eq!(parse_ack(b"ACK|"), None);
        assert_eq!(parse_ack(b"NAK|1"), None);

        assert_eq!(&missing_body(&[3, 1, 4, 1])[..], b"PKT_MISSING|1,3,4");
        assert_eq!(parse_missing(b"PKT_MISSING|1,3,4"), Some(vec![1, 3, 4]));
        assert_eq!(parse_missing(b"PKT_MISSING|"), None);
    }

    #[test]
    fn control_constructor_is_single_packet() {
        let pkt = Packet::control(sid(), MessageType::Done, Bytes::new());
        assert_eq!((pkt.seq, pkt.total), (1, 1));
        assert!(pkt.ty.is_control());
        assert!(!MessageType::Response.is_control());
    }
}
