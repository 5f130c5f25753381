//! The reliable segmentation protocol: stop-and-wait sender, reassembling
//! receiver, missing-packet recovery.
//!
//! One logical message becomes `total` packets of identical type and
//! session, numbered from 1. The sender waits for `ACK|seq` after every
//! packet; after retry exhaustion on a sequence it defers it and moves on
//! so poor conditions still make progress, relying on the DONE /
//! PKT_MISSING exchange to repair the holes afterwards. The receiver
//! stores packets in whatever order they arrive, re-ACKs duplicates, and
//! answers DONE with either DONE_ACK or the sorted set of gaps.

use std::collections::{BTreeMap, BTreeSet};

use bytes::{Bytes, BytesMut};
use hamstr_wire::{
    ack_body, missing_body, parse_ack, parse_missing, MessageType, Packet, SessionId,
};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{LinkError, Phase};
use crate::event::LinkEvent;
use crate::radio::RadioGate;

/// DONE / PKT_MISSING recovery rounds before giving up on a transfer.
pub const MISSING_CYCLES: u32 = 3;

/// Split a payload into per-packet bodies of at most `max_body` bytes.
/// An empty payload still produces one (empty) packet so every message has
/// a wire presence.
pub fn split_message(payload: &[u8], max_body: usize) -> Vec<Bytes> {
    if payload.is_empty() {
        return vec![Bytes::new()];
    }
    payload
        .chunks(max_body)
        .map(Bytes::copy_from_slice)
        .collect()
}

/// What the sender heard back after DONE.
enum DoneVerdict {
    Acked,
    Missing(Vec<u16>),
}

/// Send one logical message with full stop-and-wait reliability.
pub async fn send_message(
    gate: &mut RadioGate,
    session: SessionId,
    ty: MessageType,
    payload: &[u8],
) -> Result<(), LinkError> {
    let chunks = split_message(payload, gate.cfg().max_body());
    if chunks.len() > u16::MAX as usize {
        return Err(LinkError::ProtocolViolation(format!(
            "message needs {} packets, above the sequence space",
            chunks.len()
        )));
    }
    let total = chunks.len() as u16;
    let mut acked = BTreeSet::new();

    for (index, chunk) in chunks.iter().enumerate() {
        let seq = index as u16 + 1;
        let pkt = Packet::new(session, ty, seq, total, chunk.clone());
        if send_one(gate, &pkt).await? {
            acked.insert(seq);
            gate.emit(LinkEvent::Progress {
                pct: acked.len() as f64 / total as f64 * 100.0,
            });
        } else {
            gate.emit(LinkEvent::Warning(format!(
                "No ACK for packet {seq}/{total} after retries, deferring"
            )));
        }
    }

    settle_done(gate, session, ty, &chunks, total).await
}

/// Transmit every packet of a message without waiting for ACKs.
///
/// Used for DATA_REQUEST, where the responder's READY doubles as the
/// acknowledgment and the whole request is retried if READY never comes.
pub async fn send_unacked(
    gate: &mut RadioGate,
    session: SessionId,
    ty: MessageType,
    payload: &[u8],
) -> Result<(), LinkError> {
    let chunks = split_message(payload, gate.cfg().max_body());
    if chunks.len() > u16::MAX as usize {
        return Err(LinkError::ProtocolViolation(format!(
            "request needs {} packets, above the sequence space",
            chunks.len()
        )));
    }
    let total = chunks.len() as u16;
    for (index, chunk) in chunks.iter().enumerate() {
        let pkt = Packet::new(session, ty, index as u16 + 1, total, chunk.clone());
        gate.transmit(&pkt).await?;
    }
    Ok(())
}

/// One packet, one ACK, bounded retries. `Ok(false)` means deferred.
async fn send_one(gate: &mut RadioGate, pkt: &Packet) -> Result<bool, LinkError> {
    // The opening packet of a transfer historically needs the most grace:
    // the peer may still be settling out of its own transmission.
    let ack_wait = if pkt.seq == 1 {
        gate.cfg().ack_timeout * 2
    } else {
        gate.cfg().ack_timeout
    };

    for attempt in 0..gate.cfg().send_retries {
        gate.transmit(pkt).await?;
        if await_ack(gate, pkt, ack_wait).await? {
            return Ok(true);
        }
        debug!(
            "no ACK for seq {} (attempt {}/{})",
            pkt.seq,
            attempt + 1,
            gate.cfg().send_retries
        );
        gate.pause(gate.cfg().packet_resend_delay).await?;
    }
    Ok(false)
}

/// Wait for `ACK|seq` on one packet. Late ACKs for earlier sequences are
/// accepted idempotently and do not count against the budget.
async fn await_ack(gate: &mut RadioGate, pkt: &Packet, wait: std::time::Duration) -> Result<bool, LinkError> {
    let deadline = Instant::now() + wait;
    let mut retry_honored = false;
    loop {
        let remaining = match deadline.checked_duration_since(Instant::now()) {
            Some(d) if !d.is_zero() => d,
            _ => return Ok(false),
        };
        let inbound = match gate.recv(remaining, Phase::Ack).await {
            Ok(inbound) => inbound,
            Err(LinkError::Timeout(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        match inbound.ty {
            MessageType::Ack => match parse_ack(&inbound.body) {
                Some(seq) if seq == pkt.seq => return Ok(true),
                Some(seq) if seq < pkt.seq => {
                    debug!("late ACK for seq {seq} accepted");
                }
                Some(seq) => debug!("ACK for future seq {seq} ignored"),
                None => debug!("unparseable ACK body ignored"),
            },
            MessageType::Retry => {
                // The peer heard garbage; give it one fresh copy per wait.
                if !retry_honored {
                    retry_honored = true;
                    gate.transmit(pkt).await?;
                }
            }
            MessageType::Disconnect => {
                let ack = Packet::control(pkt.session, MessageType::DisconnectAck, Bytes::new());
                let _ = gate.transmit_final(&ack).await;
                return Err(LinkError::LinkClosed);
            }
            other => debug!("ignoring {other} while waiting for ACK {}", pkt.seq),
        }
    }
}

/// DONE, then serve PKT_MISSING rounds until DONE_ACK or the budget ends.
async fn settle_done(
    gate: &mut RadioGate,
    session: SessionId,
    ty: MessageType,
    chunks: &[Bytes],
    total: u16,
) -> Result<(), LinkError> {
    let mut cycles = 0u32;
    loop {
        let verdict = post_done(gate, session).await?;
        match verdict {
            Some(DoneVerdict::Acked) => return Ok(()),
            Some(DoneVerdict::Missing(list)) => {
                if cycles >= MISSING_CYCLES {
                    return Err(LinkError::IncompleteTransmission { missing: list });
                }
                cycles += 1;
                for &seq in &list {
                    let Some(chunk) = (seq as usize)
                        .checked_sub(1)
                        .and_then(|index| chunks.get(index))
                    else {
                        warn!("peer requested unknown seq {seq}");
                        continue;
                    };
                    let pkt = Packet::new(session, ty, seq, total, chunk.clone());
                    if !send_one(gate, &pkt).await? {
                        gate.emit(LinkEvent::Warning(format!(
                            "Retransmit of packet {seq} went unacknowledged"
                        )));
                    }
                }
            }
            None => return Err(LinkError::Timeout(Phase::Done)),
        }
    }
}

/// Send DONE (with retransmits) and collect the receiver's verdict.
async fn post_done(
    gate: &mut RadioGate,
    session: SessionId,
) -> Result<Option<DoneVerdict>, LinkError> {
    for _ in 0..gate.cfg().send_retries {
        let done = Packet::control(session, MessageType::Done, Bytes::new());
        gate.transmit(&done).await?;

        let deadline = Instant::now() + gate.cfg().no_ack_timeout;
        loop {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(d) if !d.is_zero() => d,
                _ => break, // retransmit DONE
            };
            let inbound = match gate.recv(remaining, Phase::Done).await {
                Ok(inbound) => inbound,
                Err(LinkError::Timeout(_)) => break,
                Err(e) => return Err(e),
            };
            match inbound.ty {
                MessageType::DoneAck => return Ok(Some(DoneVerdict::Acked)),
                MessageType::PktMissing => match parse_missing(&inbound.body) {
                    Some(list) => return Ok(Some(DoneVerdict::Missing(list))),
                    None => debug!("unparseable PKT_MISSING body ignored"),
                },
                MessageType::Ack => debug!("late ACK after DONE accepted"),
                MessageType::Disconnect => {
                    let ack =
                        Packet::control(session, MessageType::DisconnectAck, Bytes::new());
                    let _ = gate.transmit_final(&ack).await;
                    return Err(LinkError::LinkClosed);
                }
                other => debug!("ignoring {other} while waiting after DONE"),
            }
        }
    }
    Ok(None)
}

/// Receiver state for one inbound logical message.
struct Reassembly {
    parts: BTreeMap<u16, Bytes>,
    total: Option<u16>,
    ty: Option<MessageType>,
}

impl Reassembly {
    fn new() -> Self {
        Self {
            parts: BTreeMap::new(),
            total: None,
            ty: None,
        }
    }

    fn missing(&self) -> Vec<u16> {
        let Some(total) = self.total else {
            return Vec::new();
        };
        (1..=total).filter(|seq| !self.parts.contains_key(seq)).collect()
    }

    fn assemble(&self) -> Bytes {
        let mut out = BytesMut::new();
        for part in self.parts.values() {
            out.extend_from_slice(part);
        }
        out.freeze()
    }

    fn ratio(&self) -> f64 {
        match self.total {
            Some(total) if total > 0 => self.parts.len() as f64 / total as f64,
            _ => 0.0,
        }
    }
}

/// Receive one logical message whose type is in `expected`.
///
/// ERROR messages are always accepted alongside the expected types and are
/// surfaced as [`LinkError::Remote`] after full reassembly. Returns the
/// message type actually received with the payload.
pub async fn recv_message(
    gate: &mut RadioGate,
    session: SessionId,
    expected: &[MessageType],
) -> Result<(MessageType, Bytes), LinkError> {
    let cfg_threshold = gate.cfg().missing_packets_threshold;
    let overall_deadline = Instant::now() + gate.cfg().connection_timeout;
    let mut assembly = Reassembly::new();
    let mut reissues = 0u32;
    // After a PKT_MISSING goes out, waits shorten to the reissue cadence.
    let mut chasing = false;

    loop {
        let quiet_limit = if chasing {
            gate.cfg().missing_packets_timeout
        } else {
            gate.cfg().no_packet_timeout
        };
        let remaining_overall = overall_deadline
            .checked_duration_since(Instant::now())
            .ok_or(LinkError::Timeout(Phase::Data))?;
        let wait = quiet_limit.min(remaining_overall);

        let inbound = match gate.recv(wait, Phase::Data).await {
            Ok(inbound) => inbound,
            Err(LinkError::Timeout(_)) => {
                // Quiet channel. Chase the gaps if enough already arrived.
                if assembly.total.is_some() && (chasing || assembly.ratio() >= cfg_threshold) {
                    let gaps = assembly.missing();
                    if gaps.is_empty() {
                        // Everything stored but DONE got lost; prompt it.
                        continue;
                    }
                    if reissues >= MISSING_CYCLES {
                        return Err(LinkError::ReceiveIncomplete { missing: gaps });
                    }
                    reissues += 1;
                    chasing = true;
                    let req = Packet::control(session, MessageType::PktMissing, missing_body(&gaps));
                    gate.transmit(&req).await?;
                    continue;
                }
                return Err(LinkError::Timeout(Phase::Data));
            }
            Err(e) => return Err(e),
        };

        match inbound.ty {
            ty if expected.contains(&ty) || ty == MessageType::Error => {
                match assembly.total {
                    None => {
                        assembly.total = Some(inbound.total);
                        assembly.ty = Some(ty);
                    }
                    Some(total) if total != inbound.total || assembly.ty != Some(ty) => {
                        // Stale packet from an earlier exchange; never stored.
                        debug!("mismatched total/type for seq {}, ignored", inbound.seq);
                        continue;
                    }
                    Some(_) => {}
                }

                let duplicate = assembly.parts.contains_key(&inbound.seq);
                if !duplicate {
                    assembly.parts.insert(inbound.seq, inbound.body.clone());
                    gate.emit(LinkEvent::PacketReceived {
                        ty,
                        seq: inbound.seq,
                        total: inbound.total,
                    });
                }
                // ACK either way so the sender keeps moving.
                let ack = Packet::control(session, MessageType::Ack, ack_body(inbound.seq));
                gate.transmit(&ack).await?;
                if !duplicate {
                    gate.emit(LinkEvent::Progress {
                        pct: assembly.ratio() * 100.0,
                    });
                }
            }

            MessageType::Done => {
                if assembly.total.is_none() {
                    // DONE with nothing stored: the whole transfer was lost
                    // and the gaps cannot be enumerated. Let the sender
                    // retransmit DONE until a timeout resolves it.
                    warn!("DONE received before any data packet");
                    continue;
                }
                let gaps = assembly.missing();
                if gaps.is_empty() {
                    let ack = Packet::control(session, MessageType::DoneAck, Bytes::new());
                    gate.transmit(&ack).await?;
                    let ty = assembly.ty.unwrap_or(MessageType::Response);
                    let payload = assembly.assemble();
                    if ty == MessageType::Error {
                        return Err(LinkError::Remote(
                            String::from_utf8_lossy(&payload).into_owned(),
                        ));
                    }
                    return Ok((ty, payload));
                }
                if reissues >= MISSING_CYCLES {
                    return Err(LinkError::ReceiveIncomplete { missing: gaps });
                }
                reissues += 1;
                chasing = true;
                let req = Packet::control(session, MessageType::PktMissing, missing_body(&gaps));
                gate.transmit(&req).await?;
            }

            // A late ACK is honored silently; the next PKT_MISSING
            // supersedes any prior accounting.
            MessageType::Ack => {}
            MessageType::Ready => debug!("stale READY ignored mid-transfer"),
            MessageType::Retry => {}

            MessageType::Disconnect => {
                let ack = Packet::control(session, MessageType::DisconnectAck, Bytes::new());
                let _ = gate.transmit_final(&ack).await;
                return Err(LinkError::LinkClosed);
            }

            other => debug!("ignoring {other} mid-transfer"),
        }
    }
}

/// Gather the remaining packets of an unacked message whose first packet
/// already arrived (the DATA_REQUEST path).
pub async fn gather_unacked(
    gate: &mut RadioGate,
    first: Packet,
) -> Result<Bytes, LinkError> {
    let total = first.total;
    let ty = first.ty;
    let mut assembly = Reassembly::new();
    assembly.total = Some(total);
    assembly.ty = Some(ty);
    assembly.parts.insert(first.seq, first.body);

    while assembly.parts.len() < total as usize {
        let inbound = gate.recv(gate.cfg().no_packet_timeout, Phase::Data).await?;
        if inbound.ty == ty && inbound.total == total {
            assembly.parts.insert(inbound.seq, inbound.body);
        } else {
            debug!("ignoring {} while gathering {ty}", inbound.ty);
        }
    }
    Ok(assembly.assemble())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_respects_max_body() {
        let payload = vec![7u8; 450];
        let chunks = split_message(&payload, 185);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 185);
        assert_eq!(chunks[2].len(), 80);
        let rejoined: Vec<u8> = chunks.iter().flat_map(|c| c.to_vec()).collect();
        assert_eq!(rejoined, payload);
    }

    #[test]
    fn split_of_empty_payload_is_one_packet() {
        let chunks = split_message(b"", 185);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_empty());
    }

    #[test]
    fn reassembly_is_order_independent() {
        let mut forward = Reassembly::new();
        let mut backward = Reassembly::new();
        forward.total = Some(4);
        backward.total = Some(4);
        let parts: Vec<Bytes> = (0..4u8).map(|i| Bytes::from(vec![i; 3])).collect();

        for seq in 1..=4u16 {
            forward.parts.insert(seq, parts[seq as usize - 1].clone());
        }
        for seq in (1..=4u16).rev() {
            backward.parts.insert(seq, parts[seq as usize - 1].clone());
        }
        assert_eq!(forward.assemble(), backward.assemble());
        assert!(forward.missing().is_empty());
    }

    #[test]
    fn missing_set_is_the_complement() {
        let mut assembly = Reassembly::new();
        assembly.total = Some(5);
        assembly.parts.insert(1, Bytes::new());
        assembly.parts.insert(4, Bytes::new());
        assert_eq!(assembly.missing(), vec![2, 3, 5]);
        assert!((assembly.ratio() - 0.4).abs() < 1e-9);
    }
}
