//! Media Engine Contract
//!
//! Die eigentliche Medien-Übertragung (Capture, Codecs, ICE, DTLS) ist nicht
//! Teil des Call-Managers. Er spricht die Engine nur über diese Traits an:
//! - [`MediaEngine`] öffnet pro Anruf eine [`MediaSession`]
//! - [`MediaSession`] erzeugt Offer/Answer und nimmt Descriptions/Candidates an
//! - Callbacks (ICE Candidate, Remote Track, Verbindungsstatus) kommen als
//!   [`MediaEvent`] über den Sender zurück, der beim Öffnen übergeben wird

use crate::signaling::{IceCandidate, MediaConstraints, SessionId};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// Lokale Tracks konnten nicht geholt werden (Permission, Gerät belegt)
    #[error("Failed to acquire local tracks: {0}")]
    Acquisition(String),

    /// Offer/Answer/Candidate konnte nicht angewendet werden
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Media engine error: {0}")]
    Engine(String),
}

impl MediaError {
    /// Ursache ohne Präfix
    pub fn message(&self) -> &str {
        match self {
            MediaError::Acquisition(m) | MediaError::Negotiation(m) | MediaError::Engine(m) => m,
        }
    }
}

// ============================================================================
// SESSION DESCRIPTION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
    Offer,
    Answer,
}

/// SDP-Blob mit Typ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

// ============================================================================
// TRACKS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Ein lokal erzeugter Track (Mikrofon, Kamera)
pub trait LocalTrack: Send + Sync {
    fn kind(&self) -> TrackKind;

    /// Aktiviert/deaktiviert den Track ohne ihn freizugeben (Mute, Video aus)
    fn set_enabled(&self, enabled: bool);

    /// Gibt das zugrundeliegende Gerät frei
    fn stop(&self);
}

/// Alle lokalen Tracks eines Anrufs
///
/// Gehört exklusiv der Session. `release` konsumiert die Tracks, daher kann
/// ein Satz Tracks nur einmal freigegeben werden.
pub struct LocalTracks {
    tracks: Vec<Arc<dyn LocalTrack>>,
}

impl LocalTracks {
    pub fn new(tracks: Vec<Arc<dyn LocalTrack>>) -> Self {
        Self { tracks }
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn has(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind() == kind)
    }

    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        for track in self.tracks.iter().filter(|t| t.kind() == kind) {
            track.set_enabled(enabled);
        }
    }

    /// Stoppt alle Tracks
    pub fn release(self) {
        for track in &self.tracks {
            track.stop();
        }
        tracing::debug!("Released {} local track(s)", self.tracks.len());
    }
}

impl std::fmt::Debug for LocalTracks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.tracks.iter().map(|t| t.kind()))
            .finish()
    }
}

/// Beschreibung eines Remote Tracks
///
/// Der Track selbst gehört der Media Engine; die Session merkt sich nur,
/// was angekommen ist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
}

// ============================================================================
// MEDIA EVENTS
// ============================================================================

/// Verbindungsstatus der Media-Verbindung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Callbacks der Media Engine
#[derive(Debug, Clone)]
pub enum MediaEvent {
    /// Lokal gesammelter ICE Candidate, der zum Peer muss
    IceCandidate(IceCandidate),
    RemoteTrack(RemoteTrack),
    ConnectionState(ConnectionState),
}

pub type MediaEventSender = mpsc::UnboundedSender<MediaEvent>;

// ============================================================================
// ENGINE TRAITS
// ============================================================================

/// Fabrik für Media-Sessions
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Öffnet eine neue Media-Verbindung für `session_id`
    async fn open(
        &self,
        session_id: &SessionId,
        events: MediaEventSender,
    ) -> Result<Arc<dyn MediaSession>, MediaError>;
}

/// Eine Media-Verbindung (eine Peer Connection pro Anruf)
#[async_trait]
pub trait MediaSession: Send + Sync {
    async fn acquire_local_tracks(
        &self,
        constraints: MediaConstraints,
    ) -> Result<LocalTracks, MediaError>;

    async fn create_offer(&self) -> Result<SessionDescription, MediaError>;

    async fn create_answer(&self) -> Result<SessionDescription, MediaError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), MediaError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError>;

    /// Gibt alle Ressourcen der Verbindung frei. Wird genau einmal pro Session aufgerufen.
    async fn close(&self);
}
