//! KISS over a TCP connection to the TNC.

use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use hamstr_wire::{KissCodec, WireError};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::debug;

use crate::error::TncError;

/// A TNC reached over TCP, speaking KISS.
pub struct KissTcp {
    framed: Framed<TcpStream, KissCodec>,
}

impl KissTcp {
    /// Connect to the TNC at `host:port` within `attempt_timeout`.
    pub async fn connect(host: &str, port: u16, attempt_timeout: Duration) -> Result<Self, TncError> {
        let stream = tokio::time::timeout(attempt_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| TncError::Timeout)??;
        stream.set_nodelay(true)?;
        debug!("connected to TNC at {host}:{port}");
        Ok(Self {
            framed: Framed::new(stream, KissCodec::new()),
        })
    }

    /// Push one raw AX.25 frame through the link. Returns once the KISS
    /// bytes have been flushed to the socket.
    pub async fn send_raw(&mut self, ax25: Bytes) -> Result<(), TncError> {
        self.framed.send(ax25).await.map_err(map_wire)
    }

    /// Next KISS-decoded frame, or `Timeout`.
    pub async fn recv_raw(&mut self, timeout: Duration) -> Result<Bytes, TncError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let frame = tokio::time::timeout_at(deadline, self.framed.next())
                .await
                .map_err(|_| TncError::Timeout)?;
            match frame {
                Some(Ok(raw)) => return Ok(raw),
                // A bad escape only poisons one frame; keep reading.
                Some(Err(WireError::InvalidEscape)) => {
                    debug!("dropping KISS frame with invalid escape");
                }
                Some(Err(e)) => return Err(map_wire(e)),
                None => return Err(TncError::TransportClosed),
            }
        }
    }

    pub async fn close(&mut self) {
        let _ = self.framed.close().await;
    }
}

fn map_wire(e: WireError) -> TncError {
    match e {
        WireError::Io(io) => TncError::Io(io),
        other => TncError::BadFrame(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hamstr_wire::kiss_wrap;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn send_produces_kiss_on_the_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 64];
            let n = sock.read(&mut buf).await.unwrap();
            buf.truncate(n);
            buf
        });

        let mut tnc = KissTcp::connect("127.0.0.1", addr.port(), Duration::from_secs(1))
            .await
            .unwrap();
        tnc.send_raw(Bytes::from_static(b"ax25 bytes")).await.unwrap();

        let seen = server.await.unwrap();
        assert_eq!(seen, kiss_wrap(b"ax25 bytes").to_vec());
    }

    #[tokio::test]
    async fn recv_times_out_without_traffic() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move { listener.accept().await });

        let mut tnc = KissTcp::connect("127.0.0.1", addr.port(), Duration::from_secs(1))
            .await
            .unwrap();
        let err = tnc.recv_raw(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, TncError::Timeout));
    }
}
