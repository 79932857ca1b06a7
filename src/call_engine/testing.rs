//! Test-Doubles für Media Engine und Signaling Transport

use super::media::{
    LocalTrack, LocalTracks, MediaEngine, MediaError, MediaEvent, MediaEventSender, MediaSession,
    SdpType, SessionDescription, TrackKind,
};
use crate::signaling::{
    EnvelopeType, IceCandidate, MediaConstraints, SessionId, SignalingEnvelope,
    SignalingTransport, TransportError,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

// ============================================================================
// TRACKS
// ============================================================================

#[derive(Debug)]
pub struct FakeTrack {
    kind: TrackKind,
    enabled: AtomicBool,
    stops: AtomicUsize,
}

impl FakeTrack {
    pub fn new(kind: TrackKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            enabled: AtomicBool::new(true),
            stops: AtomicUsize::new(0),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl LocalTrack for FakeTrack {
    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn local_tracks(tracks: &[&Arc<FakeTrack>]) -> LocalTracks {
    LocalTracks::new(
        tracks
            .iter()
            .map(|t| Arc::clone(*t) as Arc<dyn LocalTrack>)
            .collect(),
    )
}

// ============================================================================
// MEDIA ENGINE
// ============================================================================

#[derive(Default)]
struct Script {
    acquire_error: Option<String>,
    acquire_gate: Option<Arc<Semaphore>>,
    answer_failures: usize,
    offer_error: Option<String>,
}

/// Skriptbare Media Engine
#[derive(Clone, Default)]
pub struct FakeMediaEngine {
    script: Arc<Mutex<Script>>,
    sessions: Arc<Mutex<Vec<Arc<FakeMediaSession>>>>,
}

impl FakeMediaEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Alle folgenden Akquisitionen schlagen fehl
    pub fn fail_acquisition(&self, reason: &str) {
        self.script.lock().acquire_error = Some(reason.to_string());
    }

    /// Akquisitionen blockieren bis [`release_acquisition`](Self::release_acquisition)
    pub fn hold_acquisition(&self) {
        self.script.lock().acquire_gate = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_acquisition(&self) {
        if let Some(gate) = self.script.lock().acquire_gate.as_ref() {
            gate.add_permits(1);
        }
    }

    /// Die nächsten `count` Remote-Answers werden abgelehnt
    pub fn fail_remote_answers(&self, count: usize) {
        self.script.lock().answer_failures = count;
    }

    pub fn fail_offers(&self, reason: &str) {
        self.script.lock().offer_error = Some(reason.to_string());
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn last_session(&self) -> Arc<FakeMediaSession> {
        let sessions = self.sessions.lock();
        Arc::clone(sessions.last().expect("no media session opened"))
    }
}

#[async_trait]
impl MediaEngine for FakeMediaEngine {
    async fn open(
        &self,
        session_id: &SessionId,
        events: MediaEventSender,
    ) -> Result<Arc<dyn MediaSession>, MediaError> {
        let session = Arc::new(FakeMediaSession {
            session_id: session_id.clone(),
            script: Arc::clone(&self.script),
            events: Mutex::new(Some(events)),
            tracks: Mutex::new(Vec::new()),
            local: Mutex::new(Vec::new()),
            remote: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
            offers: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        });
        self.sessions.lock().push(Arc::clone(&session));
        Ok(session)
    }
}

pub struct FakeMediaSession {
    pub session_id: SessionId,
    script: Arc<Mutex<Script>>,
    events: Mutex<Option<MediaEventSender>>,
    tracks: Mutex<Vec<Arc<FakeTrack>>>,
    local: Mutex<Vec<SessionDescription>>,
    remote: Mutex<Vec<SessionDescription>>,
    candidates: Mutex<Vec<IceCandidate>>,
    offers: AtomicUsize,
    closes: AtomicUsize,
}

impl FakeMediaSession {
    /// Simuliert einen Callback der Engine
    pub fn emit(&self, event: MediaEvent) {
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    pub fn tracks(&self) -> Vec<Arc<FakeTrack>> {
        self.tracks.lock().clone()
    }

    pub fn local_descriptions(&self) -> Vec<SessionDescription> {
        self.local.lock().clone()
    }

    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.remote.lock().clone()
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaSession for FakeMediaSession {
    async fn acquire_local_tracks(
        &self,
        constraints: MediaConstraints,
    ) -> Result<LocalTracks, MediaError> {
        let (gate, error) = {
            let script = self.script.lock();
            (script.acquire_gate.clone(), script.acquire_error.clone())
        };
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if let Some(reason) = error {
            return Err(MediaError::Acquisition(reason));
        }

        let mut created = Vec::new();
        if constraints.audio {
            created.push(FakeTrack::new(TrackKind::Audio));
        }
        if constraints.video {
            created.push(FakeTrack::new(TrackKind::Video));
        }
        self.tracks.lock().extend(created.iter().cloned());

        Ok(LocalTracks::new(
            created
                .into_iter()
                .map(|t| t as Arc<dyn LocalTrack>)
                .collect(),
        ))
    }

    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        if let Some(reason) = self.script.lock().offer_error.clone() {
            return Err(MediaError::Negotiation(reason));
        }
        let n = self.offers.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SessionDescription::offer(format!("fake-offer-{n}")))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        if !self
            .remote
            .lock()
            .iter()
            .any(|d| d.sdp_type == SdpType::Offer)
        {
            return Err(MediaError::Negotiation("no remote offer".to_string()));
        }
        Ok(SessionDescription::answer("fake-answer"))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        self.local.lock().push(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        if desc.sdp_type == SdpType::Answer {
            let mut script = self.script.lock();
            if script.answer_failures > 0 {
                script.answer_failures -= 1;
                return Err(MediaError::Negotiation("malformed answer".to_string()));
            }
        }
        self.remote.lock().push(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        if self.remote.lock().is_empty() {
            return Err(MediaError::Negotiation(
                "candidate before remote description".to_string(),
            ));
        }
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.events.lock().take();
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

/// Transport, der gesendete Envelopes nur aufzeichnet
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<SignalingEnvelope>>,
    offline: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SignalingEnvelope> {
        self.sent.lock().clone()
    }

    pub fn sent_kinds(&self) -> Vec<EnvelopeType> {
        self.sent.lock().iter().map(|e| e.kind()).collect()
    }

    pub fn count(&self, kind: EnvelopeType) -> usize {
        self.sent.lock().iter().filter(|e| e.kind() == kind).count()
    }

    pub fn last(&self, kind: EnvelopeType) -> Option<SignalingEnvelope> {
        self.sent
            .lock()
            .iter()
            .rev()
            .find(|e| e.kind() == kind)
            .cloned()
    }
}

impl SignalingTransport for RecordingTransport {
    fn send(&self, envelope: &SignalingEnvelope) -> Result<(), TransportError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.sent.lock().push(envelope.clone());
        Ok(())
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// Wartet bis `condition` wahr ist (max. 2 Sekunden)
pub async fn eventually<F: Fn() -> bool>(condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

/// Lässt alle bereiten Tasks laufen
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}
