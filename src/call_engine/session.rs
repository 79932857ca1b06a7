//! Call Session - Datenmodell eines Anrufversuchs
//!
//! Enthält den Lifecycle-Graphen ([`CallState::can_transition_to`]) und die
//! Ressourcen, die einer Session gehören. Alle Seiteneffekte (Signaling,
//! Media Engine) passieren im [`CallManager`](super::CallManager); hier wird
//! nur garantiert, dass Ressourcen vor einem Terminal-State freigegeben sind.

use super::media::{LocalTracks, MediaSession, RemoteTrack, SessionDescription, TrackKind};
use super::timer::SessionTimer;
use crate::signaling::{IceCandidate, MediaConstraints, SessionId, TransportError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("{operation} is not allowed in state {state}")]
    InvalidState {
        operation: &'static str,
        state: CallState,
    },

    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),

    #[error("Failed to acquire local media: {0}")]
    Acquisition(String),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Signaling delivery failed: {0}")]
    TransportDelivery(#[from] TransportError),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Media connection lost")]
    ConnectionLost,
}

// ============================================================================
// CALL STATE
// ============================================================================

/// Lifecycle-Status einer Session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Idle,
    /// Ausgehender Anruf, Offer ist unterwegs
    Dialing,
    /// Eingehender Anruf wartet auf accept/reject
    Ringing,
    /// Angenommen, Answer wird erzeugt bzw. Verbindung baut sich auf
    Negotiating,
    Active,
    Ending,
    Ended,
    Failed,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Ended | CallState::Failed)
    }

    /// Erlaubte Übergänge; ENDED und FAILED werden nie verlassen
    pub fn can_transition_to(&self, next: CallState) -> bool {
        use CallState::*;

        match (self, next) {
            (Idle, Dialing) | (Idle, Ringing) => true,
            (Ringing, Negotiating) => true,
            (Dialing, Active) | (Negotiating, Active) => true,
            (Dialing | Ringing | Negotiating | Active, Ending | Ended | Failed) => true,
            (Ending, Ended) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Dialing => "dialing",
            CallState::Ringing => "ringing",
            CallState::Negotiating => "negotiating",
            CallState::Active => "active",
            CallState::Ending => "ending",
            CallState::Ended => "ended",
            CallState::Failed => "failed",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallRole {
    Caller,
    Callee,
}

/// Warum eine Session beendet wurde
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    LocalHangup,
    RemoteHangup,
    /// Lokal abgelehnt
    Rejected,
    RemoteRejected,
    /// Peer ist in einem anderen Anruf
    Busy,
    /// Anrufer hat vor dem Annehmen aufgegeben
    Cancelled,
    /// Nicht angenommen (Ring-Timeout)
    Missed,
}

/// Unabhängig schaltbare Flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallFlags {
    pub muted: bool,
    pub speaker_on: bool,
    pub video_enabled: bool,
}

impl Default for CallFlags {
    fn default() -> Self {
        Self {
            muted: false,
            speaker_on: true,
            video_enabled: true,
        }
    }
}

// ============================================================================
// CANDIDATE QUEUE
// ============================================================================

/// Obergrenze für noch nicht angewendete Remote Candidates
pub(crate) const MAX_PENDING_CANDIDATES: usize = 256;

/// Remote ICE Candidates in Ankunftsreihenfolge
///
/// Bis die Remote Description gesetzt ist, bleiben Candidates im Channel.
/// Danach übernimmt genau ein Drain-Task den Receiver und wendet sie der
/// Reihe nach an. Ist der Channel voll, wird der neue Candidate verworfen.
pub(crate) struct CandidateQueue {
    tx: Option<mpsc::Sender<IceCandidate>>,
    rx: Option<mpsc::Receiver<IceCandidate>>,
    drain: Option<JoinHandle<()>>,
}

impl CandidateQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(MAX_PENDING_CANDIDATES);
        Self {
            tx: Some(tx),
            rx: Some(rx),
            drain: None,
        }
    }

    pub(crate) fn push(&self, candidate: IceCandidate) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        match tx.try_send(candidate) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    "Candidate queue full ({} pending), dropping candidate",
                    MAX_PENDING_CANDIDATES
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Receiver für den Drain-Task; nur beim ersten Aufruf `Some`
    pub(crate) fn take_receiver(&mut self) -> Option<mpsc::Receiver<IceCandidate>> {
        self.rx.take()
    }

    pub(crate) fn set_drain(&mut self, handle: JoinHandle<()>) {
        self.drain = Some(handle);
    }

    pub(crate) fn is_draining(&self) -> bool {
        self.rx.is_none()
    }

    fn close(&mut self) {
        self.tx = None;
        self.rx = None;
        if let Some(handle) = self.drain.take() {
            handle.abort();
        }
    }
}

// ============================================================================
// CALL SESSION
// ============================================================================

/// Ein Anrufversuch
pub struct CallSession {
    id: SessionId,
    role: CallRole,
    state: CallState,
    remote_participant_id: String,
    constraints: MediaConstraints,
    local_tracks: Option<LocalTracks>,
    remote_tracks: Vec<RemoteTrack>,
    started_at: Option<DateTime<Utc>>,
    elapsed_seconds: u64,
    flags: CallFlags,
    last_error: Option<CallError>,
    end_reason: Option<EndReason>,
    remote_accepted: bool,

    pub(crate) pending_offer: Option<SessionDescription>,
    pub(crate) media: Option<Arc<dyn MediaSession>>,
    pub(crate) renegotiated: bool,
    /// Der Peer kennt die Session (Offer gesendet bzw. empfangen)
    pub(crate) signaled: bool,
    pub(crate) candidates: CandidateQueue,
    timer: Option<SessionTimer>,
    deadline: Option<JoinHandle<()>>,
}

impl CallSession {
    /// Neue ausgehende Session (noch IDLE)
    pub fn outgoing(
        id: SessionId,
        remote_participant_id: String,
        constraints: MediaConstraints,
    ) -> Self {
        Self::new(id, CallRole::Caller, remote_participant_id, constraints)
    }

    /// Neue eingehende Session aus einem OFFER (noch IDLE)
    pub fn incoming(
        id: SessionId,
        remote_participant_id: String,
        constraints: MediaConstraints,
        offer: SessionDescription,
    ) -> Self {
        let mut session = Self::new(id, CallRole::Callee, remote_participant_id, constraints);
        session.pending_offer = Some(offer);
        session.signaled = true;
        session
    }

    fn new(
        id: SessionId,
        role: CallRole,
        remote_participant_id: String,
        constraints: MediaConstraints,
    ) -> Self {
        Self {
            id,
            role,
            state: CallState::Idle,
            remote_participant_id,
            constraints,
            local_tracks: None,
            remote_tracks: Vec::new(),
            started_at: None,
            elapsed_seconds: 0,
            flags: CallFlags {
                video_enabled: constraints.video,
                ..CallFlags::default()
            },
            last_error: None,
            end_reason: None,
            remote_accepted: false,
            pending_offer: None,
            media: None,
            renegotiated: false,
            signaled: false,
            candidates: CandidateQueue::new(),
            timer: None,
            deadline: None,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn role(&self) -> CallRole {
        self.role
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn remote_participant_id(&self) -> &str {
        &self.remote_participant_id
    }

    pub fn constraints(&self) -> MediaConstraints {
        self.constraints
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn elapsed_seconds(&self) -> u64 {
        self.elapsed_seconds
    }

    pub fn flags(&self) -> CallFlags {
        self.flags
    }

    pub fn last_error(&self) -> Option<&CallError> {
        self.last_error.as_ref()
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        self.end_reason
    }

    pub fn remote_accepted(&self) -> bool {
        self.remote_accepted
    }

    pub fn remote_tracks(&self) -> &[RemoteTrack] {
        &self.remote_tracks
    }

    pub fn has_local_tracks(&self) -> bool {
        self.local_tracks.is_some()
    }

    /// Prüft, ob ein Ergebnis einer asynchronen Operation noch zu dieser Session passt
    pub fn is_current(&self, id: &SessionId) -> bool {
        &self.id == id && !self.state.is_terminal()
    }

    // ------------------------------------------------------------------------
    // Mutationen (nur über den CallManager)
    // ------------------------------------------------------------------------

    /// Nicht-terminaler Übergang
    pub(crate) fn transition(&mut self, next: CallState) -> Result<(), CallError> {
        if next.is_terminal() || !self.state.can_transition_to(next) {
            return Err(CallError::InvalidState {
                operation: next.as_str(),
                state: self.state,
            });
        }
        tracing::info!("Session {}: {} -> {}", self.id, self.state, next);
        self.state = next;
        if next == CallState::Active {
            self.started_at = Some(Utc::now());
            self.elapsed_seconds = 0;
        }
        Ok(())
    }

    /// Übergang in ENDED/FAILED
    ///
    /// Gibt lokale Tracks frei, stoppt Timer und Deadline und schließt die
    /// Candidate-Queue, bevor der State gesetzt wird. Die Media-Session wird
    /// zurückgegeben, damit der Aufrufer `close()` genau einmal ausführt.
    pub(crate) fn finish(
        &mut self,
        terminal: CallState,
        reason: Option<EndReason>,
        error: Option<CallError>,
    ) -> Option<Arc<dyn MediaSession>> {
        debug_assert!(terminal.is_terminal());
        if !self.state.can_transition_to(terminal) {
            tracing::warn!(
                "Session {}: ignoring {} -> {}",
                self.id,
                self.state,
                terminal
            );
            return None;
        }

        if let Some(tracks) = self.local_tracks.take() {
            tracks.release();
        }
        self.timer = None;
        if let Some(deadline) = self.deadline.take() {
            deadline.abort();
        }
        self.candidates.close();
        self.pending_offer = None;

        tracing::info!("Session {}: {} -> {}", self.id, self.state, terminal);
        self.state = terminal;
        self.end_reason = reason;
        if error.is_some() {
            self.last_error = error;
        }

        self.media.take()
    }

    /// Übernimmt frisch geholte Tracks; bei veralteter Session werden sie sofort freigegeben
    pub(crate) fn attach_local_tracks(&mut self, tracks: LocalTracks) {
        if self.state.is_terminal() {
            tracks.release();
            return;
        }
        tracks.set_enabled(TrackKind::Audio, !self.flags.muted);
        tracks.set_enabled(TrackKind::Video, self.flags.video_enabled);
        if let Some(previous) = self.local_tracks.replace(tracks) {
            previous.release();
        }
    }

    pub(crate) fn add_remote_track(&mut self, track: RemoteTrack) {
        if !self.remote_tracks.iter().any(|t| t.id == track.id) {
            self.remote_tracks.push(track);
        }
    }

    pub(crate) fn mark_remote_accepted(&mut self) {
        self.remote_accepted = true;
    }

    pub(crate) fn set_timer(&mut self, timer: SessionTimer) {
        self.timer = Some(timer);
    }

    pub(crate) fn tick(&mut self) {
        self.elapsed_seconds += 1;
    }

    pub(crate) fn set_deadline(&mut self, handle: JoinHandle<()>) {
        if let Some(previous) = self.deadline.replace(handle) {
            previous.abort();
        }
    }

    pub(crate) fn clear_deadline(&mut self) {
        if let Some(deadline) = self.deadline.take() {
            deadline.abort();
        }
    }

    /// Schaltet ein Flag um, sofern passende lokale Tracks existieren
    pub(crate) fn toggle(&mut self, flag: Toggle) -> Option<bool> {
        let tracks = self.local_tracks.as_ref()?;
        let value = match flag {
            Toggle::Mute => {
                self.flags.muted = !self.flags.muted;
                tracks.set_enabled(TrackKind::Audio, !self.flags.muted);
                self.flags.muted
            }
            Toggle::Speaker => {
                self.flags.speaker_on = !self.flags.speaker_on;
                self.flags.speaker_on
            }
            Toggle::Video => {
                // Audio-only: kein Track, dessen Zustand das Flag beschreiben könnte
                if !tracks.has(TrackKind::Video) {
                    return None;
                }
                self.flags.video_enabled = !self.flags.video_enabled;
                tracks.set_enabled(TrackKind::Video, self.flags.video_enabled);
                self.flags.video_enabled
            }
        };
        Some(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Toggle {
    Mute,
    Speaker,
    Video,
}

impl fmt::Debug for CallSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallSession")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("remote_participant_id", &self.remote_participant_id)
            .field("local_tracks", &self.local_tracks)
            .field("elapsed_seconds", &self.elapsed_seconds)
            .field("flags", &self.flags)
            .field("last_error", &self.last_error)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::testing::{local_tracks, FakeTrack};

    fn candidate(n: usize) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 2122260223 10.0.0.2 50000 typ host"),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        }
    }

    fn outgoing() -> CallSession {
        CallSession::outgoing(
            SessionId::from("S1"),
            "peer-1".to_string(),
            MediaConstraints::audio_video(),
        )
    }

    #[test]
    fn test_lifecycle_graph() {
        use CallState::*;

        assert!(Idle.can_transition_to(Dialing));
        assert!(Idle.can_transition_to(Ringing));
        assert!(Ringing.can_transition_to(Negotiating));
        assert!(Dialing.can_transition_to(Active));
        assert!(Negotiating.can_transition_to(Active));
        assert!(Active.can_transition_to(Ending));
        assert!(Ending.can_transition_to(Ended));

        // Kein Überspringen von NEGOTIATING beim Callee
        assert!(!Ringing.can_transition_to(Active));
        assert!(!Idle.can_transition_to(Active));
        assert!(!Active.can_transition_to(Dialing));

        // Terminals sind endgültig
        for next in [Idle, Dialing, Ringing, Negotiating, Active, Ending, Ended, Failed] {
            assert!(!Ended.can_transition_to(next));
            assert!(!Failed.can_transition_to(next));
        }
    }

    #[test]
    fn test_default_flags_follow_constraints() {
        let session = outgoing();
        assert_eq!(session.flags(), CallFlags::default());

        let audio_only = CallSession::outgoing(
            SessionId::from("S2"),
            "peer-1".to_string(),
            MediaConstraints::audio_only(),
        );
        assert!(!audio_only.flags().video_enabled);
    }

    #[test]
    fn test_transition_sets_started_at_on_active() {
        let mut session = outgoing();
        session.transition(CallState::Dialing).unwrap();
        assert!(session.started_at().is_none());

        session.transition(CallState::Active).unwrap();
        assert!(session.started_at().is_some());
        assert_eq!(session.elapsed_seconds(), 0);
    }

    #[test]
    fn test_transition_rejects_terminal_and_invalid_targets() {
        let mut session = outgoing();
        assert!(session.transition(CallState::Ended).is_err());
        assert!(session.transition(CallState::Negotiating).is_err());
        assert_eq!(session.state(), CallState::Idle);
    }

    #[test]
    fn test_finish_releases_tracks_once() {
        let mut session = outgoing();
        session.transition(CallState::Dialing).unwrap();

        let audio = FakeTrack::new(TrackKind::Audio);
        let video = FakeTrack::new(TrackKind::Video);
        session.attach_local_tracks(local_tracks(&[&audio, &video]));
        assert!(session.has_local_tracks());

        session.finish(CallState::Ended, Some(EndReason::LocalHangup), None);
        assert_eq!(session.state(), CallState::Ended);
        assert_eq!(audio.stop_count(), 1);
        assert_eq!(video.stop_count(), 1);

        // Zweites finish ist ein No-Op
        session.finish(CallState::Failed, None, Some(CallError::ConnectionLost));
        assert_eq!(session.state(), CallState::Ended);
        assert_eq!(audio.stop_count(), 1);
        assert!(session.last_error().is_none());
    }

    #[test]
    fn test_tracks_arriving_after_end_are_released() {
        let mut session = outgoing();
        session.transition(CallState::Dialing).unwrap();
        session.finish(CallState::Ended, Some(EndReason::LocalHangup), None);

        let audio = FakeTrack::new(TrackKind::Audio);
        session.attach_local_tracks(local_tracks(&[&audio]));
        assert!(!session.has_local_tracks());
        assert_eq!(audio.stop_count(), 1);
    }

    #[test]
    fn test_toggle_requires_tracks() {
        let mut session = outgoing();
        assert_eq!(session.toggle(Toggle::Mute), None);

        let audio = FakeTrack::new(TrackKind::Audio);
        session.attach_local_tracks(local_tracks(&[&audio]));

        assert_eq!(session.toggle(Toggle::Mute), Some(true));
        assert!(!audio.is_enabled());
        assert_eq!(session.toggle(Toggle::Mute), Some(false));
        assert!(audio.is_enabled());
        assert_eq!(session.toggle(Toggle::Speaker), Some(false));
    }

    #[test]
    fn test_video_toggle_needs_video_track() {
        let mut session = CallSession::outgoing(
            SessionId::from("S2"),
            "peer-1".to_string(),
            MediaConstraints::audio_only(),
        );
        let audio = FakeTrack::new(TrackKind::Audio);
        session.attach_local_tracks(local_tracks(&[&audio]));

        assert_eq!(session.toggle(Toggle::Video), None);
        assert!(!session.flags().video_enabled);
        assert_eq!(session.toggle(Toggle::Mute), Some(true));
    }

    #[test]
    fn test_candidate_queue_is_bounded() {
        let mut session = outgoing();
        session.transition(CallState::Dialing).unwrap();
        for n in 0..MAX_PENDING_CANDIDATES {
            assert!(session.candidates.push(candidate(n)));
        }
        assert!(!session.candidates.push(candidate(MAX_PENDING_CANDIDATES)));

        // Nach dem Drain ist wieder Platz
        let mut rx = session.candidates.take_receiver().unwrap();
        assert_eq!(rx.try_recv().unwrap(), candidate(0));
        assert!(session.candidates.push(candidate(MAX_PENDING_CANDIDATES)));

        session.finish(CallState::Ended, Some(EndReason::LocalHangup), None);
        assert!(!session.candidates.push(candidate(0)));
    }

    #[test]
    fn test_finish_keeps_elapsed_seconds() {
        let mut session = outgoing();
        session.transition(CallState::Dialing).unwrap();
        session.transition(CallState::Active).unwrap();
        session.tick();
        session.tick();
        session.finish(CallState::Ended, Some(EndReason::RemoteHangup), None);
        assert_eq!(session.elapsed_seconds(), 2);
        assert_eq!(session.end_reason(), Some(EndReason::RemoteHangup));
    }
}
