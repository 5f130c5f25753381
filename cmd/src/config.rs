//! Configuration file handling for the link node.
//!
//! Reads the YAML settings file into the frozen [`LinkConfig`], with
//! defaults for everything and `HAMSTR_*` environment overrides applied
//! last. Timers are plain seconds in the file (fractions allowed).

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use hamstr_session::{ConnectionType, LinkConfig};
use serde::Deserialize;
use tracing::{info, warn};

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RootConfig {
    radio: Option<RadioSection>,
    transport: Option<TransportSection>,
    vara: Option<VaraSection>,
    link: Option<LinkSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RadioSection {
    local_callsign: Option<String>,
    remote_callsign: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TransportSection {
    connection_type: Option<String>,
    tcp_host: Option<String>,
    tcp_port: Option<u16>,
    serial_port: Option<String>,
    serial_speed: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct VaraSection {
    host: Option<String>,
    command_port: Option<u16>,
    data_port: Option<u16>,
    bandwidth: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct LinkSection {
    max_packet_size: Option<usize>,
    baud_rate: Option<u32>,

    ack_timeout: Option<f64>,
    connect_ack_timeout: Option<f64>,
    no_ack_timeout: Option<f64>,
    no_packet_timeout: Option<f64>,
    ready_timeout: Option<f64>,
    missing_packets_timeout: Option<f64>,
    connection_attempt_timeout: Option<f64>,
    connection_timeout: Option<f64>,
    disconnect_timeout: Option<f64>,
    shutdown_timeout: Option<f64>,
    keep_alive_interval: Option<f64>,
    keep_alive_retry_interval: Option<f64>,
    keep_alive_final_interval: Option<f64>,

    send_retries: Option<u32>,
    disconnect_retry: Option<u32>,

    ptt_tx_delay: Option<f64>,
    ptt_rx_delay: Option<f64>,
    ptt_tail: Option<f64>,
    ack_spacing: Option<f64>,

    packet_send_delay: Option<f64>,
    packet_resend_delay: Option<f64>,
    connection_stabilization_delay: Option<f64>,
    missing_packets_threshold: Option<f64>,
}

fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}

/// Load configuration: defaults, then file, then environment.
pub fn load<P: AsRef<Path>>(path: P) -> Result<LinkConfig> {
    let mut cfg = LinkConfig::default();

    match std::fs::read_to_string(&path) {
        Ok(content) => {
            let root: RootConfig = serde_yaml::from_str(&content)
                .with_context(|| format!("parsing {:?}", path.as_ref()))?;
            apply_file(&mut cfg, root)?;
            info!("Loaded configuration from {:?}", path.as_ref());
        }
        Err(_) => {
            warn!("Config file {:?} not found, using defaults", path.as_ref());
        }
    }

    apply_env(&mut cfg)?;
    info!(
        "Link configuration: {} -> {}, max_packet_size={}, baud={}",
        cfg.local_callsign, cfg.remote_callsign, cfg.max_packet_size, cfg.baud_rate
    );
    Ok(cfg)
}

fn apply_file(cfg: &mut LinkConfig, root: RootConfig) -> Result<()> {
    if let Some(radio) = root.radio {
        if let Some(call) = radio.local_callsign {
            cfg.local_callsign = call.parse().context("radio.local_callsign")?;
        }
        if let Some(call) = radio.remote_callsign {
            cfg.remote_callsign = call.parse().context("radio.remote_callsign")?;
        }
    }

    if let Some(transport) = root.transport {
        if let Some(kind) = transport.connection_type {
            cfg.transport.connection_type = parse_connection_type(&kind)?;
        }
        if let Some(host) = transport.tcp_host {
            cfg.transport.tcp_host = host;
        }
        if let Some(port) = transport.tcp_port {
            cfg.transport.tcp_port = port;
        }
        if let Some(port) = transport.serial_port {
            cfg.transport.serial_port = port;
        }
        if let Some(speed) = transport.serial_speed {
            cfg.transport.serial_speed = speed;
        }
    }

    if let Some(vara) = root.vara {
        if let Some(host) = vara.host {
            cfg.vara.host = host;
        }
        if let Some(port) = vara.command_port {
            cfg.vara.command_port = port;
        }
        if let Some(port) = vara.data_port {
            cfg.vara.data_port = port;
        }
        if let Some(bw) = vara.bandwidth {
            cfg.vara.bandwidth = bw;
        }
    }

    if let Some(link) = root.link {
        if let Some(size) = link.max_packet_size {
            cfg.max_packet_size = size;
        }
        if let Some(baud) = link.baud_rate {
            cfg.baud_rate = baud;
        }

        if let Some(v) = link.ack_timeout {
            cfg.ack_timeout = secs(v);
        }
        if let Some(v) = link.connect_ack_timeout {
            cfg.connect_ack_timeout = secs(v);
        }
        if let Some(v) = link.no_ack_timeout {
            cfg.no_ack_timeout = secs(v);
        }
        if let Some(v) = link.no_packet_timeout {
            cfg.no_packet_timeout = secs(v);
        }
        if let Some(v) = link.ready_timeout {
            cfg.ready_timeout = secs(v);
        }
        if let Some(v) = link.missing_packets_timeout {
            cfg.missing_packets_timeout = secs(v);
        }
        if let Some(v) = link.connection_attempt_timeout {
            cfg.connection_attempt_timeout = secs(v);
        }
        if let Some(v) = link.connection_timeout {
            cfg.connection_timeout = secs(v);
        }
        if let Some(v) = link.disconnect_timeout {
            cfg.disconnect_timeout = secs(v);
        }
        if let Some(v) = link.shutdown_timeout {
            cfg.shutdown_timeout = secs(v);
        }
        if let Some(v) = link.keep_alive_interval {
            cfg.keep_alive_interval = secs(v);
        }
        if let Some(v) = link.keep_alive_retry_interval {
            cfg.keep_alive_retry_interval = secs(v);
        }
        if let Some(v) = link.keep_alive_final_interval {
            cfg.keep_alive_final_interval = secs(v);
        }

        if let Some(v) = link.send_retries {
            cfg.send_retries = v;
        }
        if let Some(v) = link.disconnect_retry {
            cfg.disconnect_retry = v;
        }

        if let Some(v) = link.ptt_tx_delay {
            cfg.ptt_tx_delay = secs(v);
        }
        if let Some(v) = link.ptt_rx_delay {
            cfg.ptt_rx_delay = secs(v);
        }
        if let Some(v) = link.ptt_tail {
            cfg.ptt_tail = secs(v);
        }
        if let Some(v) = link.ack_spacing {
            cfg.ack_spacing = secs(v);
        }

        if let Some(v) = link.packet_send_delay {
            cfg.packet_send_delay = secs(v);
        }
        if let Some(v) = link.packet_resend_delay {
            cfg.packet_resend_delay = secs(v);
        }
        if let Some(v) = link.connection_stabilization_delay {
            cfg.connection_stabilization_delay = secs(v);
        }
        if let Some(v) = link.missing_packets_threshold {
            cfg.missing_packets_threshold = v.clamp(0.0, 1.0);
        }
    }

    Ok(())
}

fn parse_connection_type(kind: &str) -> Result<ConnectionType> {
    match kind.to_ascii_lowercase().as_str() {
        "tcp" => Ok(ConnectionType::Tcp),
        "serial" => Ok(ConnectionType::Serial),
        other => anyhow::bail!("unknown connection_type '{other}' (use tcp or serial)"),
    }
}

fn apply_env(cfg: &mut LinkConfig) -> Result<()> {
    if let Ok(call) = std::env::var("HAMSTR_LOCAL_CALLSIGN") {
        cfg.local_callsign = call.parse().context("HAMSTR_LOCAL_CALLSIGN")?;
        info!("Local callsign overridden by environment: {}", cfg.local_callsign);
    }
    if let Ok(call) = std::env::var("HAMSTR_REMOTE_CALLSIGN") {
        cfg.remote_callsign = call.parse().context("HAMSTR_REMOTE_CALLSIGN")?;
        info!("Remote callsign overridden by environment: {}", cfg.remote_callsign);
    }
    if let Ok(host) = std::env::var("HAMSTR_TCP_HOST") {
        cfg.transport.tcp_host = host;
    }
    if let Ok(port) = std::env::var("HAMSTR_TCP_PORT") {
        cfg.transport.tcp_port = port.parse().context("HAMSTR_TCP_PORT")?;
    }
    if let Ok(kind) = std::env::var("HAMSTR_CONNECTION_TYPE") {
        cfg.transport.connection_type = parse_connection_type(&kind)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = load("/definitely/not/here.yaml").unwrap();
        assert_eq!(cfg.max_packet_size, 200);
        assert_eq!(cfg.send_retries, 3);
    }

    #[test]
    fn file_values_override_defaults() {
        let yaml = r#"
radio:
  local_callsign: CALL1-1
  remote_callsign: CALL2-2

transport:
  connection_type: serial
  serial_port: /dev/ttyAMA0
  serial_speed: 9600

link:
  max_packet_size: 128
  baud_rate: 300
  ack_timeout: 45.5
  send_retries: 5
  missing_packets_threshold: 0.6
"#;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let cfg = load(file.path()).unwrap();
        assert_eq!(cfg.local_callsign.to_string(), "CALL1-1");
        assert_eq!(cfg.remote_callsign.to_string(), "CALL2-2");
        assert_eq!(cfg.transport.connection_type, ConnectionType::Serial);
        assert_eq!(cfg.transport.serial_port, "/dev/ttyAMA0");
        assert_eq!(cfg.transport.serial_speed, 9600);
        assert_eq!(cfg.max_packet_size, 128);
        assert_eq!(cfg.baud_rate, 300);
        assert_eq!(cfg.ack_timeout, Duration::from_secs_f64(45.5));
        assert_eq!(cfg.send_retries, 5);
        assert!((cfg.missing_packets_threshold - 0.6).abs() < 1e-9);
    }

    #[test]
    fn bad_callsign_is_rejected() {
        let yaml = "radio:\n  local_callsign: TOOLONGCALL\n";
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        assert!(load(file.path()).is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let yaml = "link:\n  ack_timeout_typo: 3\n";
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        assert!(load(file.path()).is_err());
    }
}
