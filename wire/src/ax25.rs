//! AX.25 unnumbered-information frames.
//!
//! Only connectionless UI frames are supported: a destination and source
//! address, control 0x03, PID 0xF0 (no layer 3) and a payload, closed by
//! the CRC-16/X.25 frame check sequence. Callsigns are encoded left
//! justified, space padded and shifted left one bit, with the end-of-address
//! bit set on the source SSID byte.

use std::fmt;
use std::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};

use crate::crc::crc16_x25;
use crate::error::WireError;

/// Control byte for a UI frame.
pub const CONTROL_UI: u8 = 0x03;
/// PID byte: no layer-3 protocol.
pub const PID_NONE: u8 = 0xF0;
/// Two addresses, control, PID.
pub const HEADER_SIZE: usize = 16;
/// Shortest frame the decoder will look at.
pub const MIN_FRAME_SIZE: usize = 17;

/// An amateur-radio callsign with SSID.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Callsign {
    call: String,
    ssid: u8,
}

impl Callsign {
    /// Build a callsign, validating 1..=6 uppercase alphanumerics and
    /// SSID 0..=15. Lowercase input is folded to uppercase.
    pub fn new(call: &str, ssid: u8) -> Result<Self, WireError> {
        let call = call.trim().to_ascii_uppercase();
        if call.is_empty()
            || call.len() > 6
            || !call.bytes().all(|b| b.is_ascii_alphanumeric())
        {
            return Err(WireError::BadCallsign(call));
        }
        if ssid > 15 {
            return Err(WireError::BadCallsign(format!("{call}-{ssid}")));
        }
        Ok(Self { call, ssid })
    }

    pub fn call(&self) -> &str {
        &self.call
    }

    pub fn ssid(&self) -> u8 {
        self.ssid
    }

    /// Encode as a 7-byte AX.25 address field.
    fn encode(&self, buf: &mut BytesMut, end_of_address: bool) {
        let mut field = [b' '; 6];
        field[..self.call.len()].copy_from_slice(self.call.as_bytes());
        for byte in field {
            buf.put_u8(byte << 1);
        }
        let mut ssid_byte = 0x60 | (self.ssid << 1);
        if end_of_address {
            ssid_byte |= 0x01;
        }
        buf.put_u8(ssid_byte);
    }

    /// Decode a 7-byte AX.25 address field.
    fn decode(field: &[u8]) -> Result<Self, WireError> {
        let call: String = field[..6]
            .iter()
            .map(|&b| (b >> 1) as char)
            .collect::<String>()
            .trim_end()
            .to_string();
        let ssid = (field[6] >> 1) & 0x0F;
        Self::new(&call, ssid)
    }
}

impl fmt::Display for Callsign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ssid == 0 {
            write!(f, "{}", self.call)
        } else {
            write!(f, "{}-{}", self.call, self.ssid)
        }
    }
}

impl FromStr for Callsign {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, WireError> {
        match s.split_once('-') {
            Some((call, ssid)) => {
                let ssid: u8 = ssid
                    .trim()
                    .parse()
                    .map_err(|_| WireError::BadCallsign(s.to_string()))?;
                Self::new(call, ssid)
            }
            None => Self::new(s, 0),
        }
    }
}

/// One AX.25 UI frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UiFrame {
    pub dest: Callsign,
    pub src: Callsign,
    pub payload: Bytes,
}

impl UiFrame {
    pub fn new(src: Callsign, dest: Callsign, payload: Bytes) -> Self {
        Self { dest, src, payload }
    }

    /// Encode to raw frame bytes including the trailing FCS.
    ///
    /// The FCS is transmitted low byte first, as AX.25 sends it on the air.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len() + 2);
        self.dest.encode(&mut buf, false);
        self.src.encode(&mut buf, true);
        buf.put_u8(CONTROL_UI);
        buf.put_u8(PID_NONE);
        buf.put_slice(&self.payload);

        let fcs = crc16_x25(&buf);
        buf.put_u8((fcs & 0xFF) as u8);
        buf.put_u8((fcs >> 8) as u8);
        buf.freeze()
    }

    /// Decode raw frame bytes, validating the FCS.
    pub fn decode(raw: &[u8]) -> Result<Self, WireError> {
        if raw.len() < MIN_FRAME_SIZE {
            return Err(WireError::Truncated(raw.len()));
        }

        let (body, fcs_bytes) = raw.split_at(raw.len() - 2);
        if body.len() < HEADER_SIZE {
            return Err(WireError::Truncated(raw.len()));
        }
        let fcs = u16::from(fcs_bytes[0]) | (u16::from(fcs_bytes[1]) << 8);
        if crc16_x25(body) != fcs {
            return Err(WireError::BadFcs);
        }

        let dest = Callsign::decode(&body[0..7])?;
        let src = Callsign::decode(&body[7..14])?;
        // Control and PID are not interpreted beyond their position; a
        // digipeated or connected-mode frame fails the callsign/FCS checks
        // upstream or is ignored by the session layer.
        let payload = Bytes::copy_from_slice(&body[HEADER_SIZE..]);

        Ok(Self { dest, src, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(s: &str) -> Callsign {
        s.parse().unwrap()
    }

    #[test]
    fn callsign_parse_and_display() {
        let c = call("CALL1-1");
        assert_eq!(c.call(), "CALL1");
        assert_eq!(c.ssid(), 1);
        assert_eq!(c.to_string(), "CALL1-1");

        assert_eq!(call("N0CALL").to_string(), "N0CALL");
        assert_eq!(call("kk7ahk-7").to_string(), "KK7AHK-7");
    }

    #[test]
    fn callsign_rejects_bad_input() {
        assert!(Callsign::new("", 0).is_err());
        assert!(Callsign::new("TOOLONG", 0).is_err());
        assert!(Callsign::new("CA LL", 0).is_err());
        assert!(Callsign::new("CALL", 16).is_err());
        assert!("CALL-XX".parse::<Callsign>().is_err());
    }

    #[test]
    fn frame_roundtrip() {
        let frame = UiFrame::new(
            call("CALL1-1"),
            call("CALL2-2"),
            Bytes::from_static(b"payload bytes"),
        );
        let raw = frame.encode();
        let decoded = UiFrame::decode(&raw).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn address_encoding_is_bit_shifted() {
        let frame = UiFrame::new(call("AB1-1"), call("CD2"), Bytes::new());
        let raw = frame.encode();
        // Destination first: 'C' << 1, 'D' << 1, '2' << 1, spaces.
        assert_eq!(raw[0], b'C' << 1);
        assert_eq!(raw[1], b'D' << 1);
        assert_eq!(raw[2], b'2' << 1);
        assert_eq!(raw[3], b' ' << 1);
        // Source SSID byte carries the end-of-address bit.
        assert_eq!(raw[13] & 0x01, 0x01);
        assert_eq!(raw[6] & 0x01, 0x00);
        assert_eq!((raw[13] >> 1) & 0x0F, 1);
    }

    #[test]
    fn control_and_pid_in_place() {
        let raw = UiFrame::new(call("A"), call("B"), Bytes::from_static(b"x")).encode();
        assert_eq!(raw[14], CONTROL_UI);
        assert_eq!(raw[15], PID_NONE);
    }

    #[test]
    fn corrupt_frame_fails_fcs() {
        let mut raw = UiFrame::new(call("CALL1-1"), call("CALL2-2"), Bytes::from_static(b"data"))
            .encode()
            .to_vec();
        raw[18] ^= 0x10;
        assert!(matches!(UiFrame::decode(&raw), Err(WireError::BadFcs)));
    }

    #[test]
    fn short_frame_is_truncated() {
        assert!(matches!(
            UiFrame::decode(&[0u8; 10]),
            Err(WireError::Truncated(10))
        ));
    }
}
