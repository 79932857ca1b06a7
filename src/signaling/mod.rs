//! Signaling Module - Nachrichtenformat und Transport
//!
//! - [`SignalingEnvelope`]: Wire-Format (OFFER, ANSWER, CANDIDATE, ...)
//! - [`SignalingTransport`]: Sende-Seite, die der Call Manager benutzt
//! - [`WebSocketTransport`]: Relay-Verbindung mit Registrierung und Heartbeat
//!

mod messages;
mod transport;

pub use messages::*;
pub use transport::{SignalingTransport, TransportError, WebSocketTransport};
