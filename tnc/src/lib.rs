//! TNC backends for the HAMSTR link core.
//!
//! One uniform frame interface ([`TncLink`]) over the two KISS transports
//! (TCP socket or serial line), plus the [`VaraModem`] backend whose
//! reliable stream bypasses the packet layer entirely. Nothing above this
//! crate sees backend-specific types.

#![warn(clippy::all)]

pub mod backend;
pub mod error;
pub mod serial;
pub mod tcp;
pub mod vara;

pub use backend::TncLink;
pub use error::TncError;
pub use serial::KissSerial;
pub use tcp::KissTcp;
pub use vara::{VaraEvent, VaraModem};
