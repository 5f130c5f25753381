//! Wire formats for the HAMSTR packet-radio link.
//!
//! Three nested layers, innermost first:
//!
//! - [`packet`]: the HAMSTR packet header (session id, type, seq/total,
//!   body, body CRC) carried as the payload of a UI frame
//! - [`ax25`]: AX.25 unnumbered-information frames with callsign
//!   addressing and the CRC-16/X.25 frame check sequence
//! - [`kiss`]: FEND/FESC byte-stuffed framing between host and TNC
//!
//! The VARA transport bypasses [`packet`] and [`ax25`] entirely; it only
//! shares the [`ax25::Callsign`] addressing type.

#![warn(clippy::all)]

pub mod ax25;
pub mod crc;
pub mod error;
pub mod kiss;
pub mod packet;

pub use ax25::{Callsign, UiFrame};
pub use crc::crc16_x25;
pub use error::WireError;
pub use kiss::{kiss_wrap, KissCodec, KissDecoder};
pub use packet::{
    ack_body, missing_body, parse_ack, parse_missing, MessageType, Packet, SessionId,
    PACKET_OVERHEAD, SESSION_ID_LEN,
};
