//! Call Manager - State Machine für genau einen Anruf
//!
//! Vermittelt zwischen UI-Intents, dem Signaling Transport und der Media
//! Engine. Alle Intents sind non-blocking: der State wird synchron unter dem
//! Lock gesetzt, die Arbeit mit der Media Engine läuft in gespawnten Tasks.
//!
//! Jeder Task prüft nach einem `.await`, ob seine Session noch aktuell ist
//! ([`CallSession::is_current`]). Ein `hang_up()` bricht laufende Operationen
//! nicht ab; deren Ergebnisse werden beim Eintreffen verworfen.

use super::media::{
    ConnectionState, LocalTracks, MediaEngine, MediaError, MediaEvent, MediaSession,
    SessionDescription,
};
use super::projection::CallProjection;
use super::session::{CallError, CallFlags, CallRole, CallSession, CallState, EndReason, Toggle};
use super::timer::SessionTimer;
use crate::signaling::{
    AnswerPayload, DecodeError, EnvelopeBody, IceCandidate, MediaConstraints, OfferPayload,
    PeerPayload, SessionId, SignalingEnvelope, SignalingTransport,
};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

// ============================================================================
// EVENTS & SETTINGS
// ============================================================================

/// Diskrete Events für die UI (zusätzlich zur Projection)
#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChanged {
        session_id: SessionId,
        state: CallState,
    },
    IncomingCall {
        session_id: SessionId,
        from: String,
        media: MediaConstraints,
    },
    RemoteEnded {
        session_id: SessionId,
    },
    Failed {
        session_id: SessionId,
        error: CallError,
    },
}

/// Laufzeit-Parameter des Managers
#[derive(Debug, Clone)]
pub struct CallSettings {
    /// Wie lange DIALING/NEGOTIATING auf ACTIVE warten darf
    pub answer_timeout: Duration,
    /// Wie lange ein eingehender Anruf klingelt
    pub ring_timeout: Duration,
    /// Medien für `start_call`
    pub constraints: MediaConstraints,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            answer_timeout: Duration::from_secs(30),
            ring_timeout: Duration::from_secs(45),
            constraints: MediaConstraints::audio_video(),
        }
    }
}

/// Wie ein eingehendes OFFER behandelt wird
enum OfferRoute {
    NewSession,
    Busy,
    UpdateRinging,
    Renegotiate,
    Ignore,
}

// ============================================================================
// CALL MANAGER
// ============================================================================

/// State Machine für Anrufe; billig klonbar
#[derive(Clone)]
pub struct CallManager {
    shared: Arc<Shared>,
}

struct Shared {
    local_id: String,
    transport: Arc<dyn SignalingTransport>,
    engine: Arc<dyn MediaEngine>,
    settings: CallSettings,
    session: Mutex<Option<CallSession>>,
    projection_tx: watch::Sender<CallProjection>,
    event_tx: broadcast::Sender<CallEvent>,
}

/// Letzter Handle weg: laufende Session wird wie bei `hang_up()` beendet
impl Drop for Shared {
    fn drop(&mut self) {
        let Some(session) = self.session.get_mut().as_mut() else {
            return;
        };
        if session.state().is_terminal() {
            return;
        }

        let id = session.id().clone();
        tracing::info!("Call manager dropped, hanging up {}", id);
        if session.signaled {
            let body = EnvelopeBody::Hangup(PeerPayload::new(&self.local_id));
            let envelope = SignalingEnvelope::new(id.clone(), body)
                .routed(self.local_id.as_str(), session.remote_participant_id());
            if let Err(e) = self.transport.send(&envelope) {
                tracing::warn!("Session {}: HANGUP not delivered: {}", id, e);
            }
        }

        if let Some(media) = session.finish(CallState::Ended, Some(EndReason::LocalHangup), None) {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move {
                        media.close().await;
                    });
                }
                Err(_) => tracing::warn!("Session {}: no runtime left to close media", id),
            }
        }
    }
}

impl CallManager {
    /// Erstellt einen neuen CallManager
    pub fn new(
        local_participant_id: impl Into<String>,
        transport: Arc<dyn SignalingTransport>,
        engine: Arc<dyn MediaEngine>,
        settings: CallSettings,
    ) -> Self {
        let (projection_tx, _) = watch::channel(CallProjection::idle());
        let (event_tx, _) = broadcast::channel(100);

        Self {
            shared: Arc::new(Shared {
                local_id: local_participant_id.into(),
                transport,
                engine,
                settings,
                session: Mutex::new(None),
                projection_tx,
                event_tx,
            }),
        }
    }

    pub fn local_participant_id(&self) -> &str {
        &self.shared.local_id
    }

    /// Abonniert die UI Projection; Droppen des Receivers beendet das Abo
    pub fn subscribe(&self) -> watch::Receiver<CallProjection> {
        self.shared.projection_tx.subscribe()
    }

    /// Gibt einen Event-Receiver zurück
    pub fn events(&self) -> broadcast::Receiver<CallEvent> {
        self.shared.event_tx.subscribe()
    }

    /// Aktueller Snapshot
    pub fn projection(&self) -> CallProjection {
        self.shared.projection_tx.borrow().clone()
    }

    pub fn state(&self) -> CallState {
        self.shared
            .session
            .lock()
            .as_ref()
            .map(|s| s.state())
            .unwrap_or(CallState::Idle)
    }

    pub fn current_session_id(&self) -> Option<SessionId> {
        self.shared.session.lock().as_ref().map(|s| s.id().clone())
    }

    // ========================================================================
    // INTENTS
    // ========================================================================

    /// Startet einen ausgehenden Anruf mit den Standard-Medien
    pub fn start_call(&self, remote_participant_id: impl Into<String>) -> Result<SessionId, CallError> {
        self.start_call_with(remote_participant_id, self.shared.settings.constraints)
    }

    /// Startet einen ausgehenden Anruf
    ///
    /// Gibt sofort die neue Session-ID zurück; Akquisition und Offer laufen im
    /// Hintergrund weiter.
    pub fn start_call_with(
        &self,
        remote_participant_id: impl Into<String>,
        constraints: MediaConstraints,
    ) -> Result<SessionId, CallError> {
        let remote = remote_participant_id.into();

        let id = {
            let mut slot = self.shared.session.lock();
            if let Some(current) = slot.as_ref() {
                if !current.state().is_terminal() {
                    return Err(self.invalid_state("start_call", current.state()));
                }
            }

            let session = slot.insert(CallSession::outgoing(
                SessionId::generate(),
                remote.clone(),
                constraints,
            ));
            self.enter(session, CallState::Dialing);
            self.arm_deadline(session, self.shared.settings.answer_timeout);
            session.id().clone()
        };

        tracing::info!("Starting call {} to {}", id, remote);
        tokio::spawn(self.clone().run_outgoing(id.clone(), constraints));
        Ok(id)
    }

    /// Nimmt einen klingelnden Anruf an
    pub fn accept(&self, session_id: &SessionId) -> Result<(), CallError> {
        let (offer, constraints) = {
            let mut slot = self.shared.session.lock();
            if slot.is_none() {
                return Err(self.invalid_state("accept", CallState::Idle));
            }
            let session = session_mut(&mut slot, session_id)?;
            if session.state() != CallState::Ringing {
                return Err(self.invalid_state("accept", session.state()));
            }
            let offer = session
                .pending_offer
                .take()
                .ok_or_else(|| self.invalid_state("accept", session.state()))?;

            self.enter(session, CallState::Negotiating);
            self.send(session, EnvelopeBody::Accept(PeerPayload::new(&self.shared.local_id)));
            self.arm_deadline(session, self.shared.settings.answer_timeout);
            (offer, session.constraints())
        };

        tracing::info!("Accepting call {}", session_id);
        tokio::spawn(
            self.clone()
                .run_incoming(session_id.clone(), offer, constraints),
        );
        Ok(())
    }

    /// Lehnt einen klingelnden Anruf ab
    pub fn reject(&self, session_id: &SessionId) -> Result<(), CallError> {
        let mut slot = self.shared.session.lock();
        if slot.is_none() {
            return Err(self.invalid_state("reject", CallState::Idle));
        }
        let session = session_mut(&mut slot, session_id)?;
        if session.state() != CallState::Ringing {
            return Err(self.invalid_state("reject", session.state()));
        }

        tracing::info!("Rejecting call {}", session_id);
        self.send(session, EnvelopeBody::Reject(PeerPayload::new(&self.shared.local_id)));
        self.finish(session, CallState::Ended, Some(EndReason::Rejected), None);
        Ok(())
    }

    /// Beendet den Anruf; nach ENDED/FAILED ein No-Op
    pub fn hang_up(&self, session_id: &SessionId) -> Result<(), CallError> {
        let mut slot = self.shared.session.lock();
        let Some(session) = slot.as_mut().filter(|s| s.id() == session_id) else {
            tracing::debug!("hang_up for unknown session {}, ignoring", session_id);
            return Ok(());
        };
        if session.state().is_terminal() {
            tracing::debug!("hang_up for finished session {}, ignoring", session_id);
            return Ok(());
        }

        tracing::info!("Hanging up {}", session_id);
        self.enter(session, CallState::Ending);
        self.send(session, EnvelopeBody::Hangup(PeerPayload::new(&self.shared.local_id)));
        self.finish(session, CallState::Ended, Some(EndReason::LocalHangup), None);
        Ok(())
    }

    /// Schaltet Mute um und gibt den neuen Wert zurück
    pub fn toggle_mute(&self) -> bool {
        self.toggle(Toggle::Mute)
    }

    pub fn toggle_speaker(&self) -> bool {
        self.toggle(Toggle::Speaker)
    }

    pub fn toggle_video(&self) -> bool {
        self.toggle(Toggle::Video)
    }

    fn toggle(&self, flag: Toggle) -> bool {
        let mut slot = self.shared.session.lock();
        let Some(session) = slot.as_mut().filter(|s| !s.state().is_terminal()) else {
            tracing::warn!("{:?} toggle ignored: no call in progress", flag);
            return flag_value(CallFlags::default(), flag);
        };

        match session.toggle(flag) {
            Some(value) => {
                tracing::debug!("Session {}: {:?} -> {}", session.id(), flag, value);
                self.publish(session);
                value
            }
            None => {
                tracing::warn!(
                    "{:?} toggle ignored: session {} has no matching local track",
                    flag,
                    session.id()
                );
                flag_value(session.flags(), flag)
            }
        }
    }

    // ========================================================================
    // INBOUND SIGNALING
    // ========================================================================

    /// Startet einen Task, der rohe Nachrichten aus dem Transport verarbeitet
    ///
    /// Der Task hält den Manager nicht am Leben; er endet, sobald der letzte
    /// Handle gedroppt ist.
    pub fn attach_inbound(&self, mut inbound: mpsc::Receiver<String>) -> JoinHandle<()> {
        let shared = self.downgrade();
        tokio::spawn(async move {
            while let Some(raw) = inbound.recv().await {
                let Some(manager) = Self::upgrade(&shared) else {
                    tracing::debug!("Call manager dropped, stopping inbound processing");
                    return;
                };
                manager.on_message(&raw);
            }
            tracing::info!("Inbound signaling stream closed");
        })
    }

    /// Parst eine rohe Nachricht; Fremdes und Kaputtes wird geloggt und verworfen
    pub fn on_message(&self, raw: &str) {
        match SignalingEnvelope::decode(raw) {
            Ok(envelope) => self.on_inbound_envelope(envelope),
            Err(DecodeError::UnknownType(kind)) => {
                tracing::debug!("Ignoring signaling message of type {}", kind);
            }
            Err(e) => tracing::warn!("Dropping signaling message: {}", e),
        }
    }

    /// Einziger Einstiegspunkt für Signaling-Input
    pub fn on_inbound_envelope(&self, envelope: SignalingEnvelope) {
        if let Some(to) = envelope.to.as_deref() {
            if to != self.shared.local_id {
                tracing::debug!("Dropping {} addressed to {}", envelope.kind(), to);
                return;
            }
        }

        tracing::debug!(
            "Inbound {} for session {}",
            envelope.kind(),
            envelope.session_id
        );

        let SignalingEnvelope {
            session_id,
            from,
            body,
            ..
        } = envelope;

        match body {
            EnvelopeBody::Offer(offer) => self.handle_offer(session_id, from, offer),
            EnvelopeBody::Answer(answer) => self.handle_answer(session_id, answer),
            EnvelopeBody::Candidate(candidate) => self.handle_candidate(session_id, candidate),
            EnvelopeBody::Hangup(_) => self.handle_remote_end(session_id, EndReason::RemoteHangup),
            EnvelopeBody::Cancel(_) => self.handle_remote_end(session_id, EndReason::Cancelled),
            EnvelopeBody::Reject(payload) => self.handle_reject(session_id, payload),
            EnvelopeBody::Accept(_) => self.handle_accept(session_id),
        }
    }

    fn handle_offer(&self, id: SessionId, from: Option<String>, offer: OfferPayload) {
        let OfferPayload { sdp, media } = offer;
        let desc = SessionDescription::offer(sdp);

        let renegotiation = {
            let mut slot = self.shared.session.lock();

            let route = match slot.as_ref() {
                None => OfferRoute::NewSession,
                Some(s) if s.state().is_terminal() && s.id() == &id => OfferRoute::Ignore,
                Some(s) if s.state().is_terminal() => OfferRoute::NewSession,
                Some(s) if s.id() != &id => OfferRoute::Busy,
                Some(s) => match s.state() {
                    CallState::Ringing => OfferRoute::UpdateRinging,
                    CallState::Negotiating | CallState::Active if s.role() == CallRole::Callee => {
                        OfferRoute::Renegotiate
                    }
                    _ => OfferRoute::Ignore,
                },
            };

            match route {
                OfferRoute::NewSession => {
                    let Some(from) = from else {
                        tracing::warn!("Dropping offer {} without sender", id);
                        return;
                    };
                    tracing::info!("Incoming call {} from {}", id, from);
                    let session =
                        slot.insert(CallSession::incoming(id.clone(), from.clone(), media, desc));
                    self.enter(session, CallState::Ringing);
                    self.arm_deadline(session, self.shared.settings.ring_timeout);
                    let _ = self.shared.event_tx.send(CallEvent::IncomingCall {
                        session_id: id,
                        from,
                        media,
                    });
                    return;
                }
                OfferRoute::Busy => {
                    tracing::warn!("Busy, rejecting offer {}", id);
                    if let Some(from) = from {
                        self.send_to(
                            &id,
                            &from,
                            EnvelopeBody::Reject(PeerPayload::with_reason(
                                &self.shared.local_id,
                                "busy",
                            )),
                        );
                    }
                    return;
                }
                OfferRoute::UpdateRinging => {
                    if let Some(session) = slot.as_mut() {
                        session.pending_offer = Some(desc);
                    }
                    return;
                }
                OfferRoute::Ignore => {
                    tracing::debug!("Ignoring offer for session {}", id);
                    return;
                }
                OfferRoute::Renegotiate => slot
                    .as_ref()
                    .filter(|s| s.candidates.is_draining())
                    .and_then(|s| s.media.clone()),
            }
        };

        match renegotiation {
            Some(media) => {
                tracing::info!("Session {}: remote renegotiation", id);
                tokio::spawn(self.clone().apply_reoffer(id, media, desc));
            }
            None => tracing::warn!("Session {}: re-offer before negotiation finished, dropping", id),
        }
    }

    fn handle_answer(&self, id: SessionId, answer: AnswerPayload) {
        let media = {
            let slot = self.shared.session.lock();
            let Some(session) = slot.as_ref().filter(|s| s.is_current(&id)) else {
                tracing::debug!("Dropping answer for unknown or finished session {}", id);
                return;
            };
            if session.role() != CallRole::Caller || session.state() != CallState::Dialing {
                tracing::warn!(
                    "Dropping answer for session {} in state {}",
                    id,
                    session.state()
                );
                return;
            }
            match session.media.clone() {
                Some(media) => media,
                None => {
                    tracing::warn!("Dropping answer for session {}: no offer sent yet", id);
                    return;
                }
            }
        };

        tokio::spawn(
            self.clone()
                .apply_answer(id, media, SessionDescription::answer(answer.sdp)),
        );
    }

    fn handle_candidate(&self, id: SessionId, candidate: IceCandidate) {
        let slot = self.shared.session.lock();
        match slot.as_ref().filter(|s| s.is_current(&id)) {
            Some(session) => {
                if !session.candidates.push(candidate) {
                    tracing::warn!("Session {}: remote candidate dropped", id);
                }
            }
            None => tracing::debug!("Dropping candidate for unknown or finished session {}", id),
        }
    }

    fn handle_remote_end(&self, id: SessionId, reason: EndReason) {
        let mut slot = self.shared.session.lock();
        let Some(session) = current_mut(&mut slot, &id) else {
            tracing::debug!("Ignoring {:?} for unknown or finished session {}", reason, id);
            return;
        };

        tracing::info!("Session {} ended by remote ({:?})", id, reason);
        self.finish(session, CallState::Ended, Some(reason), None);
        let _ = self
            .shared
            .event_tx
            .send(CallEvent::RemoteEnded { session_id: id });
    }

    fn handle_reject(&self, id: SessionId, payload: PeerPayload) {
        let mut slot = self.shared.session.lock();
        let Some(session) = current_mut(&mut slot, &id) else {
            tracing::debug!("Ignoring reject for unknown or finished session {}", id);
            return;
        };
        if session.state() != CallState::Dialing {
            tracing::warn!("Ignoring reject for session {} in state {}", id, session.state());
            return;
        }

        tracing::info!(
            "Call {} rejected by {} (reason: {:?})",
            id,
            payload.sender,
            payload.reason
        );
        let reason = match payload.reason.as_deref() {
            Some("busy") => EndReason::Busy,
            _ => EndReason::RemoteRejected,
        };
        self.finish(session, CallState::Ended, Some(reason), None);
    }

    fn handle_accept(&self, id: SessionId) {
        let mut slot = self.shared.session.lock();
        match current_mut(&mut slot, &id) {
            Some(session) if session.state() == CallState::Dialing => {
                tracing::info!("Call {} accepted by remote", id);
                session.mark_remote_accepted();
                self.publish(session);
            }
            _ => tracing::debug!("Ignoring accept for session {}", id),
        }
    }

    // ========================================================================
    // ASYNC FLOWS
    // ========================================================================

    /// Anrufer: Media öffnen → Tracks holen → Offer senden
    async fn run_outgoing(self, id: SessionId, constraints: MediaConstraints) {
        let Some(media) = self.open_media(&id).await else {
            return;
        };

        let tracks = match media.acquire_local_tracks(constraints).await {
            Ok(tracks) => tracks,
            Err(e) => {
                self.fail(&id, CallError::Acquisition(e.message().to_string()));
                return;
            }
        };
        if !self.attach_tracks(&id, tracks) {
            return;
        }

        match make_offer(media.as_ref()).await {
            Ok(offer) => self.send_offer(&id, offer),
            Err(e) => self.fail(&id, CallError::Negotiation(e.message().to_string())),
        }
    }

    /// Angerufener: Media öffnen → Offer anwenden → Tracks holen → Answer senden
    async fn run_incoming(self, id: SessionId, offer: SessionDescription, constraints: MediaConstraints) {
        let Some(media) = self.open_media(&id).await else {
            return;
        };

        if let Err(e) = media.set_remote_description(offer).await {
            self.fail(&id, CallError::Negotiation(e.message().to_string()));
            return;
        }
        if !self.on_remote_description(&id) {
            return;
        }

        let tracks = match media.acquire_local_tracks(constraints).await {
            Ok(tracks) => tracks,
            Err(e) => {
                self.fail(&id, CallError::Acquisition(e.message().to_string()));
                return;
            }
        };
        if !self.attach_tracks(&id, tracks) {
            return;
        }

        match make_answer(media.as_ref()).await {
            Ok(answer) => self.send_answer(&id, answer),
            Err(e) => self.fail(&id, CallError::Negotiation(e.message().to_string())),
        }
    }

    async fn apply_answer(self, id: SessionId, media: Arc<dyn MediaSession>, answer: SessionDescription) {
        match media.set_remote_description(answer).await {
            Ok(()) => self.on_answer_applied(&id),
            Err(e) => {
                tracing::warn!("Session {}: failed to apply answer: {}", id, e);
                self.renegotiate(&id, media.as_ref(), e).await;
            }
        }
    }

    /// Genau ein neuer Versuch mit frischem Offer, danach FAILED
    async fn renegotiate(&self, id: &SessionId, media: &dyn MediaSession, cause: MediaError) {
        let retry = self.with_current(id, |session| {
            if session.state() != CallState::Dialing {
                return None;
            }
            if session.renegotiated {
                return Some(false);
            }
            session.renegotiated = true;
            Some(true)
        });

        match retry.flatten() {
            None => {}
            Some(false) => self.fail(id, CallError::Negotiation(cause.message().to_string())),
            Some(true) => {
                tracing::info!("Session {}: renegotiating with a fresh offer", id);
                match make_offer(media).await {
                    Ok(offer) => self.send_offer(id, offer),
                    Err(e) => self.fail(id, CallError::Negotiation(e.message().to_string())),
                }
            }
        }
    }

    async fn apply_reoffer(self, id: SessionId, media: Arc<dyn MediaSession>, offer: SessionDescription) {
        if let Err(e) = media.set_remote_description(offer).await {
            self.fail(&id, CallError::Negotiation(e.message().to_string()));
            return;
        }
        match make_answer(media.as_ref()).await {
            Ok(answer) => self.send_answer(&id, answer),
            Err(e) => self.fail(&id, CallError::Negotiation(e.message().to_string())),
        }
    }

    /// Öffnet die Media-Verbindung und hängt sie an die Session
    async fn open_media(&self, id: &SessionId) -> Option<Arc<dyn MediaSession>> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let media = match self.shared.engine.open(id, events_tx).await {
            Ok(media) => media,
            Err(e) => {
                self.fail(id, CallError::Acquisition(e.message().to_string()));
                return None;
            }
        };

        if self.attach_media(id, &media) {
            tokio::spawn(Self::pump_media_events(self.downgrade(), id.clone(), events_rx));
            Some(media)
        } else {
            tracing::debug!("Session {} finished while opening media, closing it", id);
            media.close().await;
            None
        }
    }

    /// Verarbeitet Callbacks der Media Engine
    async fn pump_media_events(
        shared: Weak<Shared>,
        id: SessionId,
        mut events: mpsc::UnboundedReceiver<MediaEvent>,
    ) {
        while let Some(event) = events.recv().await {
            let Some(manager) = Self::upgrade(&shared) else {
                break;
            };
            if !manager.on_media_event(&id, event) {
                break;
            }
        }
    }

    // ========================================================================
    // COMPLETION HANDLERS (synchron, mit Stale-Guard)
    // ========================================================================

    fn attach_media(&self, id: &SessionId, media: &Arc<dyn MediaSession>) -> bool {
        self.with_current(id, |session| {
            session.media = Some(Arc::clone(media));
        })
        .is_some()
    }

    /// Übernimmt Tracks; gehört die Session nicht mehr dazu, werden sie freigegeben
    fn attach_tracks(&self, id: &SessionId, tracks: LocalTracks) -> bool {
        let mut slot = self.shared.session.lock();
        match slot.as_mut().filter(|s| s.id() == id) {
            Some(session) => {
                session.attach_local_tracks(tracks);
                let current = !session.state().is_terminal();
                if current {
                    self.publish(session);
                } else {
                    tracing::debug!("Session {} already {}, released late tracks", id, session.state());
                }
                current
            }
            None => {
                tracing::debug!("Session {} is gone, releasing late tracks", id);
                tracks.release();
                false
            }
        }
    }

    fn on_remote_description(&self, id: &SessionId) -> bool {
        self.with_current(id, |session| self.start_candidate_drain(session))
            .is_some()
    }

    fn on_answer_applied(&self, id: &SessionId) {
        let mut slot = self.shared.session.lock();
        let Some(session) = current_mut(&mut slot, id) else {
            tracing::debug!("Session {} finished before answer was applied", id);
            return;
        };
        if session.state() != CallState::Dialing {
            return;
        }

        self.enter(session, CallState::Active);
        session.clear_deadline();
        self.start_timer(session);
        self.start_candidate_drain(session);
    }

    fn send_offer(&self, id: &SessionId, offer: SessionDescription) {
        let sent = self.with_current(id, |session| {
            if session.state() != CallState::Dialing {
                return false;
            }
            let media = session.constraints();
            self.send(
                session,
                EnvelopeBody::Offer(OfferPayload {
                    sdp: offer.sdp,
                    media,
                }),
            );
            session.signaled = true;
            true
        });
        if sent != Some(true) {
            tracing::debug!("Session {} moved on, offer not sent", id);
        }
    }

    fn send_answer(&self, id: &SessionId, answer: SessionDescription) {
        let sent = self.with_current(id, |session| {
            if !matches!(session.state(), CallState::Negotiating | CallState::Active) {
                return false;
            }
            self.send(session, EnvelopeBody::Answer(AnswerPayload { sdp: answer.sdp }));
            true
        });
        if sent != Some(true) {
            tracing::debug!("Session {} moved on, answer not sent", id);
        }
    }

    fn on_media_event(&self, id: &SessionId, event: MediaEvent) -> bool {
        let mut slot = self.shared.session.lock();
        let Some(session) = current_mut(&mut slot, id) else {
            return false;
        };

        match event {
            MediaEvent::IceCandidate(candidate) => {
                self.send(session, EnvelopeBody::Candidate(candidate));
            }
            MediaEvent::RemoteTrack(track) => {
                tracing::info!("Session {}: remote {:?} track {}", id, track.kind, track.id);
                session.add_remote_track(track);
                self.publish(session);
            }
            MediaEvent::ConnectionState(state) => {
                tracing::info!("Session {}: media connection {:?}", id, state);
                match state {
                    ConnectionState::Connected if session.state() == CallState::Negotiating => {
                        self.enter(session, CallState::Active);
                        session.clear_deadline();
                        self.start_timer(session);
                    }
                    ConnectionState::Failed => {
                        self.finish_with_error(session, CallError::ConnectionLost);
                        return false;
                    }
                    ConnectionState::Disconnected => {
                        tracing::warn!("Session {}: media disconnected, waiting for recovery", id);
                    }
                    _ => {}
                }
            }
        }
        true
    }

    fn on_tick(&self, id: &SessionId) -> bool {
        let mut slot = self.shared.session.lock();
        match current_mut(&mut slot, id) {
            Some(session) if session.state() == CallState::Active => {
                session.tick();
                self.publish(session);
                true
            }
            _ => false,
        }
    }

    fn on_deadline(&self, id: &SessionId) {
        let mut slot = self.shared.session.lock();
        let Some(session) = current_mut(&mut slot, id) else {
            return;
        };

        match session.state() {
            CallState::Ringing => {
                tracing::info!("Call {} was not answered", id);
                self.send(
                    session,
                    EnvelopeBody::Reject(PeerPayload::with_reason(
                        &self.shared.local_id,
                        "no_answer",
                    )),
                );
                self.finish(session, CallState::Ended, Some(EndReason::Missed), None);
            }
            CallState::Dialing => {
                self.finish_with_error(session, CallError::Timeout("answer"));
            }
            CallState::Negotiating => {
                self.finish_with_error(session, CallError::Timeout("connection"));
            }
            _ => {}
        }
    }

    /// Session scheitert (Akquisition, Negotiation)
    fn fail(&self, id: &SessionId, error: CallError) {
        let mut slot = self.shared.session.lock();
        match current_mut(&mut slot, id) {
            Some(session) => self.finish_with_error(session, error),
            None => tracing::debug!("Ignoring error for finished session {}: {}", id, error),
        }
    }

    // ========================================================================
    // PRIVATE HELPERS
    // ========================================================================

    fn with_current<R>(&self, id: &SessionId, f: impl FnOnce(&mut CallSession) -> R) -> Option<R> {
        let mut slot = self.shared.session.lock();
        current_mut(&mut slot, id).map(f)
    }

    /// Nicht-terminaler Übergang mit Benachrichtigung
    fn enter(&self, session: &mut CallSession, next: CallState) {
        match session.transition(next) {
            Ok(()) => {
                self.publish(session);
                let _ = self.shared.event_tx.send(CallEvent::StateChanged {
                    session_id: session.id().clone(),
                    state: next,
                });
            }
            Err(e) => tracing::error!("Session {}: {}", session.id(), e),
        }
    }

    /// Übergang in ENDED/FAILED; schließt die Media-Verbindung genau einmal
    fn finish(
        &self,
        session: &mut CallSession,
        terminal: CallState,
        reason: Option<EndReason>,
        error: Option<CallError>,
    ) {
        let before = session.state();
        if let Some(media) = session.finish(terminal, reason, error) {
            tokio::spawn(async move {
                media.close().await;
            });
        }

        if session.state() != before {
            self.publish(session);
            let _ = self.shared.event_tx.send(CallEvent::StateChanged {
                session_id: session.id().clone(),
                state: session.state(),
            });
        }
    }

    fn finish_with_error(&self, session: &mut CallSession, error: CallError) {
        tracing::error!("Session {} failed: {}", session.id(), error);
        if session.signaled {
            self.send(session, EnvelopeBody::Hangup(PeerPayload::new(&self.shared.local_id)));
        }
        self.finish(session, CallState::Failed, None, Some(error.clone()));
        let _ = self.shared.event_tx.send(CallEvent::Failed {
            session_id: session.id().clone(),
            error,
        });
    }

    fn start_timer(&self, session: &mut CallSession) {
        let shared = self.downgrade();
        let id = session.id().clone();
        session.set_timer(SessionTimer::start(move || {
            Self::upgrade(&shared).is_some_and(|manager| manager.on_tick(&id))
        }));
    }

    /// Startet den Task, der gepufferte und künftige Remote Candidates anwendet
    fn start_candidate_drain(&self, session: &mut CallSession) {
        let Some(media) = session.media.clone() else {
            return;
        };
        let Some(mut candidates) = session.candidates.take_receiver() else {
            return;
        };

        let id = session.id().clone();
        let handle = tokio::spawn(async move {
            while let Some(candidate) = candidates.recv().await {
                if let Err(e) = media.add_ice_candidate(candidate).await {
                    tracing::warn!("Session {}: failed to add ICE candidate: {}", id, e);
                }
            }
        });
        session.candidates.set_drain(handle);
    }

    fn arm_deadline(&self, session: &mut CallSession, after: Duration) {
        let shared = self.downgrade();
        let id = session.id().clone();
        session.set_deadline(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(manager) = Self::upgrade(&shared) {
                manager.on_deadline(&id);
            }
        }));
    }

    /// Für langlebige Tasks, die den Manager nicht am Leben halten dürfen
    fn downgrade(&self) -> Weak<Shared> {
        Arc::downgrade(&self.shared)
    }

    fn upgrade(shared: &Weak<Shared>) -> Option<Self> {
        shared.upgrade().map(|shared| Self { shared })
    }

    fn publish(&self, session: &CallSession) {
        self.shared
            .projection_tx
            .send_replace(CallProjection::from_session(session));
    }

    /// Sendet an den Peer der Session; Zustellfehler werden nur geloggt
    fn send(&self, session: &CallSession, body: EnvelopeBody) {
        self.send_to(session.id(), session.remote_participant_id(), body);
    }

    fn send_to(&self, id: &SessionId, to: &str, body: EnvelopeBody) {
        let envelope =
            SignalingEnvelope::new(id.clone(), body).routed(self.shared.local_id.as_str(), to);
        let kind = envelope.kind();
        match self.shared.transport.send(&envelope) {
            Ok(()) => tracing::debug!("Sent {} for session {}", kind, id),
            Err(e) => {
                let error = CallError::from(e);
                tracing::warn!("Session {}: {} not delivered: {}", id, kind, error);
            }
        }
    }

    fn invalid_state(&self, operation: &'static str, state: CallState) -> CallError {
        let error = CallError::InvalidState { operation, state };
        tracing::error!("Rejected intent: {}", error);
        error
    }
}

impl std::fmt::Debug for CallManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallManager")
            .field("local_id", &self.shared.local_id)
            .field("session", &*self.shared.session.lock())
            .finish()
    }
}

// ============================================================================
// FREE HELPERS
// ============================================================================

fn session_mut<'a>(
    slot: &'a mut Option<CallSession>,
    id: &SessionId,
) -> Result<&'a mut CallSession, CallError> {
    slot.as_mut()
        .filter(|s| s.id() == id)
        .ok_or_else(|| CallError::UnknownSession(id.clone()))
}

fn current_mut<'a>(slot: &'a mut Option<CallSession>, id: &SessionId) -> Option<&'a mut CallSession> {
    slot.as_mut().filter(|s| s.is_current(id))
}

fn flag_value(flags: CallFlags, flag: Toggle) -> bool {
    match flag {
        Toggle::Mute => flags.muted,
        Toggle::Speaker => flags.speaker_on,
        Toggle::Video => flags.video_enabled,
    }
}

async fn make_offer(media: &dyn MediaSession) -> Result<SessionDescription, MediaError> {
    let offer = media.create_offer().await?;
    media.set_local_description(offer.clone()).await?;
    Ok(offer)
}

async fn make_answer(media: &dyn MediaSession) -> Result<SessionDescription, MediaError> {
    let answer = media.create_answer().await?;
    media.set_local_description(answer.clone()).await?;
    Ok(answer)
}

// ============================================================================
// TESTS
// ============================================================================
