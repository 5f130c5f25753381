//! Typed log-event stream consumed by observers.
//!
//! Downstream UIs parse newline-free ASCII lines of the form
//! `[CATEGORY] <text>`. Internally events are a typed enum; the textual
//! form is rendered only at the observer boundary so the substructures the
//! UI translator greps for stay bit-stable in one place.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use hamstr_wire::{Callsign, MessageType};
use tracing::debug;

/// Category tag of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCategory {
    System,
    Client,
    Session,
    Packet,
    Control,
    Progress,
    Warning,
    Error,
}

impl std::fmt::Display for EventCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            EventCategory::System => "SYSTEM",
            EventCategory::Client => "CLIENT",
            EventCategory::Session => "SESSION",
            EventCategory::Packet => "PACKET",
            EventCategory::Control => "CONTROL",
            EventCategory::Progress => "PROGRESS",
            EventCategory::Warning => "WARNING",
            EventCategory::Error => "ERROR",
        };
        f.write_str(tag)
    }
}

/// One observable event on the link.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A packet left the radio gate.
    PacketSent {
        ty: MessageType,
        seq: u16,
        total: u16,
        est_secs: f64,
    },
    /// A control packet arrived.
    ControlReceived { ty: MessageType, content: String },
    /// A data packet arrived and was stored.
    PacketReceived { ty: MessageType, seq: u16, total: u16 },
    /// Session established with the remote station.
    SessionConnected { remote: Callsign },
    /// The disconnect exchange finished.
    DisconnectComplete,
    /// Transfer progress, percent of packets accounted for.
    Progress { pct: f64 },
    /// Free-form notices.
    System(String),
    Client(String),
    Session(String),
    Warning(String),
    Error(String),
}

impl LinkEvent {
    pub fn category(&self) -> EventCategory {
        match self {
            LinkEvent::PacketSent { .. } | LinkEvent::ControlReceived { .. } => {
                EventCategory::Control
            }
            LinkEvent::PacketReceived { .. } => EventCategory::Packet,
            LinkEvent::SessionConnected { .. }
            | LinkEvent::DisconnectComplete
            | LinkEvent::Session(_) => EventCategory::Session,
            LinkEvent::Progress { .. } => EventCategory::Progress,
            LinkEvent::System(_) => EventCategory::System,
            LinkEvent::Client(_) => EventCategory::Client,
            LinkEvent::Warning(_) => EventCategory::Warning,
            LinkEvent::Error(_) => EventCategory::Error,
        }
    }

    /// The ASCII line handed to observers.
    pub fn render(&self) -> String {
        let text = match self {
            LinkEvent::PacketSent {
                ty,
                seq,
                total,
                est_secs,
            } => format!(
                "Sending packet: Type={ty}, Seq={seq}/{total}, Estimated transmission time: {est_secs:.2} seconds"
            ),
            LinkEvent::ControlReceived { ty, content } => {
                format!("Received control: Type={ty}, Content={content}")
            }
            LinkEvent::PacketReceived { ty, seq, total } => {
                format!("Received packet: Type={ty}, Seq={seq}/{total}")
            }
            LinkEvent::SessionConnected { remote } => format!("CONNECTED to {remote}"),
            LinkEvent::DisconnectComplete => "Client disconnect complete".to_string(),
            LinkEvent::Progress { pct } => format!("{pct:.2}% complete"),
            LinkEvent::System(text)
            | LinkEvent::Client(text)
            | LinkEvent::Session(text)
            | LinkEvent::Warning(text)
            | LinkEvent::Error(text) => text.clone(),
        };
        format!("[{}] {}", self.category(), text)
    }
}

/// Observer callback registered with the bus.
pub trait LinkObserver: Send + Sync {
    fn on_event(&self, event: &LinkEvent);
}

impl<F: Fn(&LinkEvent) + Send + Sync> LinkObserver for F {
    fn on_event(&self, event: &LinkEvent) {
        self(event)
    }
}

/// Token returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Fan-out of link events to registered observers.
///
/// The observer list is the one piece of shared state touched from outside
/// the session loop, so it sits behind its own mutex.
#[derive(Default)]
pub struct EventBus {
    observers: Mutex<HashMap<u64, Arc<dyn LinkObserver>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(&self, observer: Arc<dyn LinkObserver>) -> ObserverId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.observers
            .lock()
            .expect("observer list poisoned")
            .insert(id, observer);
        ObserverId(id)
    }

    pub fn unsubscribe(&self, id: ObserverId) {
        self.observers
            .lock()
            .expect("observer list poisoned")
            .remove(&id.0);
    }

    pub fn emit(&self, event: LinkEvent) {
        debug!("{}", event.render());
        let observers: Vec<_> = self
            .observers
            .lock()
            .expect("observer list poisoned")
            .values()
            .cloned()
            .collect();
        for observer in observers {
            observer.on_event(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn rendered_lines_match_the_ui_contract() {
        let sent = LinkEvent::PacketSent {
            ty: MessageType::Response,
            seq: 2,
            total: 5,
            est_secs: 1.666,
        };
        assert_eq!(
            sent.render(),
            "[CONTROL] Sending packet: Type=RESPONSE, Seq=2/5, Estimated transmission time: 1.67 seconds"
        );

        let ack = LinkEvent::ControlReceived {
            ty: MessageType::Ack,
            content: "ACK|3".into(),
        };
        assert_eq!(ack.render(), "[CONTROL] Received control: Type=ACK, Content=ACK|3");

        let missing = LinkEvent::ControlReceived {
            ty: MessageType::PktMissing,
            content: "PKT_MISSING|1,3,4".into(),
        };
        assert_eq!(
            missing.render(),
            "[CONTROL] Received control: Type=PKT_MISSING, Content=PKT_MISSING|1,3,4"
        );

        let connected = LinkEvent::SessionConnected {
            remote: "CALL2-2".parse().unwrap(),
        };
        assert_eq!(connected.render(), "[SESSION] CONNECTED to CALL2-2");

        assert_eq!(
            LinkEvent::DisconnectComplete.render(),
            "[SESSION] Client disconnect complete"
        );
        assert_eq!(
            LinkEvent::Progress { pct: 100.0 }.render(),
            "[PROGRESS] 100.00% complete"
        );
    }

    #[test]
    fn lines_stay_newline_free_ascii() {
        let event = LinkEvent::Warning("odd state".into());
        let line = event.render();
        assert!(line.is_ascii());
        assert!(!line.contains('\n'));
    }

    #[test]
    fn subscribe_and_unsubscribe() {
        let bus = EventBus::new();
        let seen = Arc::new(StdMutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let id = bus.subscribe(Arc::new(move |event: &LinkEvent| {
            sink.lock().unwrap().push(event.render());
        }));

        bus.emit(LinkEvent::System("one".into()));
        bus.unsubscribe(id);
        bus.emit(LinkEvent::System("two".into()));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &["[SYSTEM] one".to_string()]);
    }
}
