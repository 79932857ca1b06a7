//! UI Projection
//!
//! Reines Read-Model einer Session für die Oberfläche. Wird nach jeder
//! Mutation neu berechnet und über einen `watch`-Channel verteilt.

use super::session::{CallRole, CallSession, CallState, EndReason};
use crate::signaling::SessionId;
use serde::Serialize;

/// Snapshot für die UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallProjection {
    pub session_id: Option<SessionId>,
    pub state: CallState,
    pub role: Option<CallRole>,
    pub status: String,
    pub elapsed_formatted: String,
    pub muted: bool,
    pub speaker_on: bool,
    pub video_enabled: bool,
    pub remote_participant_id: Option<String>,
    pub end_reason: Option<EndReason>,
    pub last_error: Option<String>,
    pub remote_track_count: usize,
}

impl CallProjection {
    /// Projektion ohne Session
    pub fn idle() -> Self {
        Self {
            session_id: None,
            state: CallState::Idle,
            role: None,
            status: status_text(CallState::Idle, None, false).to_string(),
            elapsed_formatted: format_elapsed(0),
            muted: false,
            speaker_on: true,
            video_enabled: true,
            remote_participant_id: None,
            end_reason: None,
            last_error: None,
            remote_track_count: 0,
        }
    }

    pub fn from_session(session: &CallSession) -> Self {
        let flags = session.flags();
        Self {
            session_id: Some(session.id().clone()),
            state: session.state(),
            role: Some(session.role()),
            status: status_text(
                session.state(),
                session.end_reason(),
                session.remote_accepted(),
            )
            .to_string(),
            elapsed_formatted: format_elapsed(session.elapsed_seconds()),
            muted: flags.muted,
            speaker_on: flags.speaker_on,
            video_enabled: flags.video_enabled,
            remote_participant_id: Some(session.remote_participant_id().to_string()),
            end_reason: session.end_reason(),
            last_error: session.last_error().map(|e| e.to_string()),
            remote_track_count: session.remote_tracks().len(),
        }
    }
}

impl Default for CallProjection {
    fn default() -> Self {
        Self::idle()
    }
}

/// Status-Text; FAILED und ENDED müssen unterscheidbar bleiben
fn status_text(state: CallState, reason: Option<EndReason>, remote_accepted: bool) -> &'static str {
    match state {
        CallState::Idle => "idle",
        CallState::Dialing if remote_accepted => "connecting",
        CallState::Dialing => "calling",
        CallState::Ringing => "incoming call",
        CallState::Negotiating => "connecting",
        CallState::Active => "in call",
        CallState::Ending => "ending call",
        CallState::Ended => match reason {
            Some(EndReason::RemoteHangup) => "remote ended",
            Some(EndReason::RemoteRejected) => "call declined",
            Some(EndReason::Busy) => "line busy",
            Some(EndReason::Missed) => "missed call",
            _ => "call ended",
        },
        CallState::Failed => "connection failed",
    }
}

/// Formatiert Sekunden als `mm:ss`; Minuten laufen über 59 hinaus weiter
pub fn format_elapsed(seconds: u64) -> String {
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

// ============================================================================
// TESTS
// ============================================================================
