//! Call Engine Module - Session State Machine und Media
//!
//! Dieses Modul verwaltet:
//! - den Lifecycle genau eines Anrufs ([`CallManager`])
//! - den Session Timer für die Gesprächsdauer
//! - die UI Projection
//! - den Media Engine Contract und dessen WebRTC-Implementierung

mod manager;
mod media;
mod projection;
mod session;
mod timer;
mod webrtc_engine;

#[cfg(test)]
mod testing;

pub use manager::{CallEvent, CallManager, CallSettings};
pub use media::{
    ConnectionState, LocalTrack, LocalTracks, MediaEngine, MediaError, MediaEvent,
    MediaEventSender, MediaSession, RemoteTrack, SdpType, SessionDescription, TrackKind,
};
pub use projection::{format_elapsed, CallProjection};
pub use session::{CallError, CallFlags, CallRole, CallSession, CallState, EndReason};
pub use timer::{SessionTimer, TICK_INTERVAL};
pub use webrtc_engine::{WebRtcLocalTrack, WebRtcMediaEngine, WebRtcMediaSession};
