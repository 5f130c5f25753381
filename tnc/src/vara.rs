//! VARA modem backend.
//!
//! VARA exposes two TCP sockets: a command channel speaking CR-terminated
//! ASCII (`MYCALL`, `CONNECT`, state events) and a data channel carrying
//! the reliable byte stream once a link is up. The modem owns PTT and the
//! ARQ machinery, so this backend does no framing beyond shuttling bytes;
//! the session-layer adapter adds its own block structure.
//!
//! The event vocabulary varies between firmware versions, so anything this
//! module does not recognize is logged and ignored rather than treated as
//! a failure.

use std::time::Duration;

use bytes::Bytes;
use hamstr_wire::Callsign;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::error::TncError;

/// Time allowed for the modem to answer a setup command.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Granularity of the data-read loop; between slices the command channel
/// is polled for disconnect events.
const READ_SLICE: Duration = Duration::from_millis(250);

/// Events published on the VARA command channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VaraEvent {
    /// Link established; carries the raw `CONNECTED ...` detail text.
    Connected(String),
    Disconnected,
    /// Modem transmit buffer level.
    Buffer(u32),
    PttOn,
    PttOff,
    CommandOk,
    CommandRejected,
    /// Anything this code does not recognize.
    Other(String),
}

fn parse_event(line: &str) -> VaraEvent {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix("CONNECTED") {
        VaraEvent::Connected(rest.trim().to_string())
    } else if line.starts_with("DISCONNECTED") {
        VaraEvent::Disconnected
    } else if let Some(rest) = line.strip_prefix("BUFFER") {
        VaraEvent::Buffer(rest.trim().parse().unwrap_or(0))
    } else if line == "PTT ON" {
        VaraEvent::PttOn
    } else if line == "PTT OFF" {
        VaraEvent::PttOff
    } else if line == "OK" {
        VaraEvent::CommandOk
    } else if line == "WRONG" {
        VaraEvent::CommandRejected
    } else {
        VaraEvent::Other(line.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Idle,
    Connected,
}

/// Connection to a local VARA modem.
pub struct VaraModem {
    control_rx: OwnedReadHalf,
    control_tx: OwnedWriteHalf,
    /// Partial command-channel line carried across poll slices.
    pending_line: Vec<u8>,
    data: Option<TcpStream>,
    host: String,
    data_port: u16,
    state: LinkState,
}

impl VaraModem {
    /// Connect to the modem's command port and run the setup sequence:
    /// callsign, bandwidth, and (for a responder) `LISTEN ON`.
    pub async fn connect(
        host: &str,
        command_port: u16,
        data_port: u16,
        mycall: &Callsign,
        bandwidth: u32,
        listen: bool,
    ) -> Result<Self, TncError> {
        let control = TcpStream::connect((host, command_port)).await?;
        let (rx, tx) = control.into_split();
        let mut modem = Self {
            control_rx: rx,
            control_tx: tx,
            pending_line: Vec::new(),
            data: None,
            host: host.to_string(),
            data_port,
            state: LinkState::Idle,
        };

        modem.command(&format!("MYCALL {mycall}")).await?;
        modem.command(&format!("BW{bandwidth}")).await?;
        if listen {
            modem.command("LISTEN ON").await?;
            info!("VARA listening as {mycall}");
        } else {
            info!("VARA ready as {mycall}");
        }
        Ok(modem)
    }

    /// Send one command and wait for OK/WRONG, absorbing unrelated events.
    async fn command(&mut self, cmd: &str) -> Result<(), TncError> {
        debug!("vara command: {cmd}");
        self.control_tx
            .write_all(format!("{cmd}\r").as_bytes())
            .await?;
        let deadline = tokio::time::Instant::now() + COMMAND_TIMEOUT;
        loop {
            match self.next_event(deadline).await? {
                VaraEvent::CommandOk => return Ok(()),
                VaraEvent::CommandRejected => {
                    return Err(TncError::Modem(format!("modem rejected '{cmd}'")))
                }
                other => self.absorb(other),
            }
        }
    }

    /// Read one CR-terminated event line, respecting `deadline`. Partial
    /// lines survive a timeout and resume on the next call.
    async fn next_event(
        &mut self,
        deadline: tokio::time::Instant,
    ) -> Result<VaraEvent, TncError> {
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or(TncError::Timeout)?;
            let mut byte = [0u8; 1];
            let n = tokio::time::timeout(remaining, self.control_rx.read(&mut byte))
                .await
                .map_err(|_| TncError::Timeout)??;
            if n == 0 {
                return Err(TncError::TransportClosed);
            }
            match byte[0] {
                b'\r' | b'\n' => {
                    if self.pending_line.is_empty() {
                        continue;
                    }
                    let text = String::from_utf8_lossy(&self.pending_line).into_owned();
                    self.pending_line.clear();
                    return Ok(parse_event(&text));
                }
                other => self.pending_line.push(other),
            }
        }
    }

    /// Track link state from events that arrive while waiting for something
    /// else.
    fn absorb(&mut self, event: VaraEvent) {
        match event {
            VaraEvent::Connected(detail) => {
                info!("VARA connected: {detail}");
                self.state = LinkState::Connected;
            }
            VaraEvent::Disconnected => {
                info!("VARA disconnected");
                self.state = LinkState::Idle;
            }
            VaraEvent::Buffer(n) => debug!("vara buffer: {n}"),
            VaraEvent::PttOn | VaraEvent::PttOff => {}
            VaraEvent::Other(text) => debug!("unrecognized vara event: {text}"),
            VaraEvent::CommandOk | VaraEvent::CommandRejected => {}
        }
    }

    /// Drain any command-channel events that are already waiting.
    async fn poll_control(&mut self) -> Result<(), TncError> {
        loop {
            let soon = tokio::time::Instant::now() + Duration::from_millis(10);
            match self.next_event(soon).await {
                Ok(event) => {
                    self.absorb(event);
                    if self.state == LinkState::Idle {
                        return Err(TncError::TransportClosed);
                    }
                }
                Err(TncError::Timeout) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Initiate a link to `remote` and wait for `CONNECTED`.
    pub async fn connect_remote(
        &mut self,
        mycall: &Callsign,
        remote: &Callsign,
        timeout: Duration,
    ) -> Result<(), TncError> {
        self.command(&format!("CONNECT {mycall} {remote}")).await?;
        self.await_link(timeout).await
    }

    /// Responder side: wait for an inbound link.
    pub async fn await_link(&mut self, timeout: Duration) -> Result<(), TncError> {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.state != LinkState::Connected {
            let event = self.next_event(deadline).await?;
            self.absorb(event);
        }
        self.open_data_channel().await
    }

    async fn open_data_channel(&mut self) -> Result<(), TncError> {
        if self.data.is_none() {
            let stream = TcpStream::connect((self.host.as_str(), self.data_port)).await?;
            stream.set_nodelay(true)?;
            self.data = Some(stream);
            debug!("vara data channel open on port {}", self.data_port);
        }
        Ok(())
    }

    /// Write one block of bytes into the VARA stream.
    pub async fn send_block(&mut self, block: &[u8]) -> Result<(), TncError> {
        if self.state != LinkState::Connected {
            return Err(TncError::WriteRefused("VARA link not connected".into()));
        }
        let data = self.data.as_mut().ok_or(TncError::TransportClosed)?;
        data.write_all(block).await?;
        data.flush().await?;
        Ok(())
    }

    /// Read the next chunk of stream bytes, watching the command channel
    /// for a disconnect between read slices.
    pub async fn recv_block(&mut self, timeout: Duration) -> Result<Bytes, TncError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or(TncError::Timeout)?;
            let slice = remaining.min(READ_SLICE);

            let data = self.data.as_mut().ok_or(TncError::TransportClosed)?;
            let mut chunk = vec![0u8; 4096];
            match tokio::time::timeout(slice, data.read(&mut chunk)).await {
                Ok(Ok(0)) => return Err(TncError::TransportClosed),
                Ok(Ok(n)) => {
                    chunk.truncate(n);
                    return Ok(Bytes::from(chunk));
                }
                Ok(Err(e)) => return Err(TncError::Io(e)),
                Err(_) => {
                    // Slice elapsed with no stream bytes; look for events.
                    self.poll_control().await?;
                }
            }
        }
    }

    /// Tear the link down. Best effort: a dead modem is already disconnected.
    pub async fn disconnect_remote(&mut self) -> Result<(), TncError> {
        if self.state == LinkState::Connected {
            let _ = self.control_tx.write_all(b"DISCONNECT\r").await;
            let deadline = tokio::time::Instant::now() + COMMAND_TIMEOUT;
            while self.state == LinkState::Connected {
                match self.next_event(deadline).await {
                    Ok(event) => self.absorb(event),
                    Err(_) => break,
                }
            }
        }
        if let Some(mut data) = self.data.take() {
            let _ = data.shutdown().await;
        }
        self.state = LinkState::Idle;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }
}
