//! Frozen link configuration.
//!
//! Built once at startup and passed by reference through constructors;
//! nothing in the core mutates it afterwards.

use std::time::Duration;

use hamstr_tnc::{KissSerial, KissTcp, TncError, TncLink};
use hamstr_wire::{Callsign, PACKET_OVERHEAD};

/// Which channel the TNC hangs off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    Tcp,
    Serial,
}

/// How to reach the TNC.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub connection_type: ConnectionType,
    pub tcp_host: String,
    pub tcp_port: u16,
    pub serial_port: String,
    pub serial_speed: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connection_type: ConnectionType::Tcp,
            tcp_host: "127.0.0.1".to_string(),
            tcp_port: 8001,
            serial_port: "/dev/ttyUSB0".to_string(),
            serial_speed: 57600,
        }
    }
}

impl TransportConfig {
    /// Open the configured TNC channel.
    pub async fn open(&self, attempt_timeout: Duration) -> Result<TncLink, TncError> {
        match self.connection_type {
            ConnectionType::Tcp => {
                let tnc = KissTcp::connect(&self.tcp_host, self.tcp_port, attempt_timeout).await?;
                Ok(TncLink::tcp(tnc))
            }
            ConnectionType::Serial => {
                let tnc = KissSerial::open(&self.serial_port, self.serial_speed)?;
                Ok(TncLink::serial(tnc))
            }
        }
    }
}

/// VARA modem endpoints.
#[derive(Debug, Clone)]
pub struct VaraConfig {
    pub host: String,
    pub command_port: u16,
    pub data_port: u16,
    pub bandwidth: u32,
}

impl Default for VaraConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            command_port: 8300,
            data_port: 8301,
            bandwidth: 2300,
        }
    }
}

/// Every knob the link core recognizes. Timer names follow the
/// configuration file one for one.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub local_callsign: Callsign,
    pub remote_callsign: Callsign,
    pub transport: TransportConfig,
    pub vara: VaraConfig,

    /// On-air size cap for one packet, header and body included.
    pub max_packet_size: usize,
    /// Informational; the TNC owns the modem. Drives time estimates.
    pub baud_rate: u32,

    // Timers
    pub ack_timeout: Duration,
    pub connect_ack_timeout: Duration,
    pub no_ack_timeout: Duration,
    pub no_packet_timeout: Duration,
    pub ready_timeout: Duration,
    pub missing_packets_timeout: Duration,
    pub connection_attempt_timeout: Duration,
    pub connection_timeout: Duration,
    pub disconnect_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub keep_alive_interval: Duration,
    pub keep_alive_retry_interval: Duration,
    pub keep_alive_final_interval: Duration,

    // Retries
    pub send_retries: u32,
    pub disconnect_retry: u32,

    // PTT
    pub ptt_tx_delay: Duration,
    pub ptt_rx_delay: Duration,
    pub ptt_tail: Duration,
    pub ack_spacing: Duration,

    // Pacing
    pub packet_send_delay: Duration,
    pub packet_resend_delay: Duration,
    pub connection_stabilization_delay: Duration,
    /// Fraction of a transfer that must be present before the receiver
    /// chases missing packets after going quiet.
    pub missing_packets_threshold: f64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            local_callsign: Callsign::new("N0CALL", 0).expect("static callsign"),
            remote_callsign: Callsign::new("N0CALL", 1).expect("static callsign"),
            transport: TransportConfig::default(),
            vara: VaraConfig::default(),

            max_packet_size: 200,
            baud_rate: 1200,

            ack_timeout: Duration::from_secs(30),
            connect_ack_timeout: Duration::from_secs(60),
            no_ack_timeout: Duration::from_secs(60),
            no_packet_timeout: Duration::from_secs(60),
            ready_timeout: Duration::from_secs(60),
            missing_packets_timeout: Duration::from_secs(60),
            connection_attempt_timeout: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(300),
            disconnect_timeout: Duration::from_secs(15),
            shutdown_timeout: Duration::from_secs(10),
            keep_alive_interval: Duration::from_secs(60),
            keep_alive_retry_interval: Duration::from_secs(30),
            keep_alive_final_interval: Duration::from_secs(600),

            send_retries: 3,
            disconnect_retry: 2,

            ptt_tx_delay: Duration::from_millis(300),
            ptt_rx_delay: Duration::from_millis(200),
            ptt_tail: Duration::from_millis(100),
            ack_spacing: Duration::from_millis(500),

            packet_send_delay: Duration::from_millis(500),
            packet_resend_delay: Duration::from_secs(2),
            connection_stabilization_delay: Duration::from_millis(500),
            missing_packets_threshold: 0.8,
        }
    }
}

impl LinkConfig {
    /// Largest message body one packet can carry.
    pub fn max_body(&self) -> usize {
        self.max_packet_size.saturating_sub(PACKET_OVERHEAD).max(1)
    }

    /// Seconds one on-air frame of `wire_len` bytes takes at the configured
    /// baud rate (start and stop bits included), plus the inter-packet gap.
    pub fn estimate_tx_secs(&self, wire_len: usize) -> f64 {
        let bits = (wire_len * 10) as f64;
        bits / self.baud_rate as f64 + self.packet_send_delay.as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_coherent() {
        let cfg = LinkConfig::default();
        assert_eq!(cfg.max_packet_size, 200);
        assert_eq!(cfg.max_body(), 200 - PACKET_OVERHEAD);
        assert_eq!(cfg.send_retries, 3);
    }

    #[test]
    fn tx_estimate_scales_with_baud() {
        let mut cfg = LinkConfig::default();
        cfg.packet_send_delay = Duration::ZERO;
        cfg.baud_rate = 1200;
        // 120 bytes -> 1200 bits -> one second at 1200 baud.
        assert!((cfg.estimate_tx_secs(120) - 1.0).abs() < 1e-9);
        cfg.baud_rate = 300;
        assert!((cfg.estimate_tx_secs(120) - 4.0).abs() < 1e-9);
    }
}
