//! The HAMSTR link core: reliable transport and session layer between an
//! application and a packet-radio TNC or VARA modem.
//!
//! The stack, top down:
//!
//! - [`handle`]: the stable application interface (`open_session`,
//!   `request_payload`, `send_payload`, `close_session`) plus the
//!   responder endpoint
//! - [`session`]: role-aware session state machine (connect, transfer,
//!   disconnect) and the [`session::PayloadHandler`] seam
//! - [`proto`]: the stop-and-wait segmentation protocol with
//!   missing-packet recovery
//! - [`radio`]: the single-owner scheduler enforcing PTT timing and
//!   inter-packet spacing
//! - [`vara`]: the same session surface over a VARA modem's reliable
//!   stream, with the packet layers collapsed to block framing
//!
//! Everything below runs on one task per session; observers subscribe to
//! the [`event::EventBus`] for the `[CATEGORY]`-tagged line stream.

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod event;
pub mod handle;
pub mod proto;
pub mod radio;
pub mod session;
pub mod state;
pub mod vara;

pub use config::{ConnectionType, LinkConfig, TransportConfig, VaraConfig};
pub use error::{LinkError, Phase};
pub use event::{EventBus, EventCategory, LinkEvent, LinkObserver, ObserverId};
pub use handle::{open_session, Responder, SessionHandle};
pub use session::{PayloadHandler, PayloadKind, RequestKind, Session};
pub use state::SessionPhase;
pub use vara::{open_vara_session, serve_vara_session, VaraSession};
