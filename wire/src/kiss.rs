//! KISS framing over a TNC byte stream.
//!
//! KISS delimits frames with FEND and escapes in-frame FEND/FESC bytes.
//! The decoder is a resumable state machine: garbage between frames and
//! empty FEND pairs are dropped silently, and an invalid escape aborts
//! only the frame it occurred in.

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::WireError;

/// Frame delimiter.
pub const FEND: u8 = 0xC0;
/// Escape introducer.
pub const FESC: u8 = 0xDB;
/// Escaped FEND.
pub const TFEND: u8 = 0xDC;
/// Escaped FESC.
pub const TFESC: u8 = 0xDD;

/// KISS command byte for a data frame on port 0.
pub const CMD_DATA: u8 = 0x00;

/// Wrap a raw AX.25 frame in a KISS data frame.
pub fn kiss_wrap(ax25: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(ax25.len() + 4);
    out.put_u8(FEND);
    out.put_u8(CMD_DATA);
    for &byte in ax25 {
        match byte {
            FEND => {
                out.put_u8(FESC);
                out.put_u8(TFEND);
            }
            FESC => {
                out.put_u8(FESC);
                out.put_u8(TFESC);
            }
            other => out.put_u8(other),
        }
    }
    out.put_u8(FEND);
    out.freeze()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    /// Scanning for an opening FEND.
    Hunt,
    /// Accumulating frame bytes.
    Frame,
    /// Saw FESC, next byte must be TFEND or TFESC.
    Escape,
}

/// Resumable KISS frame decoder.
///
/// Feed bytes in any chunking; complete frames come out as the raw AX.25
/// payload with the KISS command byte stripped. Frames with a non-data
/// command byte are discarded.
#[derive(Debug)]
pub struct KissDecoder {
    state: DecodeState,
    frame: BytesMut,
}

impl KissDecoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Hunt,
            frame: BytesMut::new(),
        }
    }

    /// Consume bytes from `buf`, returning the next complete frame if one
    /// terminated inside it.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, WireError> {
        while !buf.is_empty() {
            let byte = buf[0];
            let _ = buf.split_to(1);

            match self.state {
                DecodeState::Hunt => {
                    if byte == FEND {
                        self.state = DecodeState::Frame;
                        self.frame.clear();
                    }
                }
                DecodeState::Frame => match byte {
                    FEND => {
                        if self.frame.is_empty() {
                            // Back-to-back FENDs or an empty frame; keep hunting.
                            continue;
                        }
                        let raw = self.frame.split().freeze();
                        self.state = DecodeState::Frame;
                        self.frame.clear();
                        if let Some(ax25) = strip_command(raw) {
                            return Ok(Some(ax25));
                        }
                    }
                    FESC => self.state = DecodeState::Escape,
                    other => self.frame.put_u8(other),
                },
                DecodeState::Escape => match byte {
                    TFEND => {
                        self.frame.put_u8(FEND);
                        self.state = DecodeState::Frame;
                    }
                    TFESC => {
                        self.frame.put_u8(FESC);
                        self.state = DecodeState::Frame;
                    }
                    _ => {
                        self.frame.clear();
                        self.state = DecodeState::Hunt;
                        return Err(WireError::InvalidEscape);
                    }
                },
            }
        }
        Ok(None)
    }
}

impl Default for KissDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Strip the KISS command byte; `None` for non-data frames.
fn strip_command(mut raw: Bytes) -> Option<Bytes> {
    if raw.is_empty() {
        return None;
    }
    let cmd = raw[0];
    // Low nibble selects the command, high nibble the TNC port.
    if cmd & 0x0F != CMD_DATA {
        return None;
    }
    let _ = raw.split_to(1);
    if raw.is_empty() {
        None
    } else {
        Some(raw)
    }
}

/// Tokio codec adapter so TCP backends can run `Framed` over KISS.
#[derive(Debug, Default)]
pub struct KissCodec {
    decoder: KissDecoder,
}

impl KissCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for KissCodec {
    type Item = Bytes;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, WireError> {
        self.decoder.decode(src)
    }
}

impl Encoder<Bytes> for KissCodec {
    type Error = WireError;

    fn encode(&mut self, ax25: Bytes, dst: &mut BytesMut) -> Result<(), WireError> {
        dst.extend_from_slice(&kiss_wrap(&ax25));
        Ok(())
    }
}
