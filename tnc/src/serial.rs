//! KISS over a serial port to the TNC.
//!
//! The `serialport` crate is blocking, so a dedicated reader thread feeds
//! decoded frames into a bounded channel; the session loop never touches
//! the port directly on the receive path. Writes go through
//! `spawn_blocking` against a cloned port handle.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use hamstr_wire::{kiss_wrap, KissDecoder, WireError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::TncError;

/// Inbound frames buffered between the reader thread and the session loop.
const FRAME_QUEUE_DEPTH: usize = 32;

/// A TNC reached over a serial line, speaking KISS.
pub struct KissSerial {
    writer: Arc<Mutex<Box<dyn serialport::SerialPort>>>,
    frames: mpsc::Receiver<Bytes>,
}

impl KissSerial {
    /// Open `path` at `baud`, 8N1, and start the reader thread.
    pub fn open(path: &str, baud: u32) -> Result<Self, TncError> {
        let port = serialport::new(path, baud)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|e| TncError::Modem(format!("open {path}: {e}")))?;
        let reader = port
            .try_clone()
            .map_err(|e| TncError::Modem(format!("clone {path}: {e}")))?;
        debug!("opened serial TNC on {path} at {baud} baud");

        let (tx, rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
        std::thread::Builder::new()
            .name("kiss-serial-rx".into())
            .spawn(move || reader_loop(reader, tx))
            .map_err(TncError::Io)?;

        Ok(Self {
            writer: Arc::new(Mutex::new(port)),
            frames: rx,
        })
    }

    /// Push one raw AX.25 frame out the serial line.
    pub async fn send_raw(&mut self, ax25: Bytes) -> Result<(), TncError> {
        let writer = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || {
            let kiss = kiss_wrap(&ax25);
            let mut port = writer
                .lock()
                .map_err(|_| TncError::WriteRefused("serial writer poisoned".into()))?;
            port.write_all(&kiss)?;
            port.flush()?;
            Ok::<(), TncError>(())
        })
        .await
        .map_err(|e| TncError::WriteRefused(e.to_string()))?
    }

    /// Next decoded frame from the reader thread, or `Timeout`.
    pub async fn recv_raw(&mut self, timeout: Duration) -> Result<Bytes, TncError> {
        match tokio::time::timeout(timeout, self.frames.recv()).await {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => Err(TncError::TransportClosed),
            Err(_) => Err(TncError::Timeout),
        }
    }
}

fn reader_loop(mut port: Box<dyn serialport::SerialPort>, tx: mpsc::Sender<Bytes>) {
    let mut decoder = KissDecoder::new();
    let mut chunk = [0u8; 512];
    loop {
        match port.read(&mut chunk) {
            Ok(0) => continue,
            Ok(n) => {
                let mut buf = BytesMut::from(&chunk[..n]);
                loop {
                    match decoder.decode(&mut buf) {
                        Ok(Some(frame)) => {
                            if tx.blocking_send(frame).is_err() {
                                return; // session side went away
                            }
                        }
                        Ok(None) => break,
                        Err(WireError::InvalidEscape) => {
                            warn!("serial KISS stream: invalid escape, frame dropped");
                        }
                        Err(e) => {
                            warn!("serial KISS stream error: {e}");
                            break;
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) => {
                warn!("serial read failed, stopping reader: {e}");
                return;
            }
        }
    }
}
