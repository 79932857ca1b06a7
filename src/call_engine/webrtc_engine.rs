//! WebRTC Media Engine
//!
//! Implementiert [`MediaEngine`] über `webrtc` (eine `RTCPeerConnection` pro
//! Anruf). Capture und Encoding passieren außerhalb: die Anwendung abonniert
//! neue lokale Tracks über [`WebRtcMediaEngine::local_tracks`] und schreibt
//! kodierte Frames mit [`WebRtcLocalTrack::write_sample`].

use super::media::{
    ConnectionState, LocalTrack, LocalTracks, MediaEngine, MediaError, MediaEvent,
    MediaEventSender, MediaSession, RemoteTrack, SdpType, SessionDescription, TrackKind,
};
use crate::config::IceServerConfig;
use crate::signaling::{IceCandidate, MediaConstraints, SessionId};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine as RtcMediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

const STREAM_ID: &str = "call-session";

// ============================================================================
// LOCAL TRACK
// ============================================================================

/// Lokaler Track, in den die Anwendung kodierte Frames schreibt
pub struct WebRtcLocalTrack {
    session_id: SessionId,
    kind: TrackKind,
    track: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl WebRtcLocalTrack {
    fn new(session_id: SessionId, kind: TrackKind) -> Self {
        let codec = match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        };
        let id = match kind {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        };

        Self {
            session_id,
            kind,
            track: Arc::new(TrackLocalStaticSample::new(
                codec,
                id.to_string(),
                STREAM_ID.to_string(),
            )),
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Schreibt einen kodierten Frame
    ///
    /// Während Mute bzw. Video aus und nach `stop()` werden Frames verworfen.
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<(), MediaError> {
        if self.is_stopped() || !self.is_enabled() {
            return Ok(());
        }

        self.track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
            .map_err(|e| MediaError::Engine(e.to_string()))
    }
}

impl LocalTrack for WebRtcLocalTrack {
    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            tracing::debug!("Session {}: stopped local {:?} track", self.session_id, self.kind);
        }
    }
}

impl std::fmt::Debug for WebRtcLocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcLocalTrack")
            .field("session_id", &self.session_id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct WebRtcMediaEngine {
    ice_servers: Vec<RTCIceServer>,
    track_tx: broadcast::Sender<Arc<WebRtcLocalTrack>>,
}

impl WebRtcMediaEngine {
    pub fn new(ice_servers: &[IceServerConfig]) -> Self {
        let (track_tx, _) = broadcast::channel(16);

        Self {
            ice_servers: ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone(),
                    credential: s.credential.clone(),
                    ..Default::default()
                })
                .collect(),
            track_tx,
        }
    }

    /// Neu angelegte lokale Tracks, damit die Anwendung Frames einspeisen kann
    pub fn local_tracks(&self) -> broadcast::Receiver<Arc<WebRtcLocalTrack>> {
        self.track_tx.subscribe()
    }

    /// Erstellt eine neue Peer Connection
    async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, MediaError> {
        let mut media_engine = RtcMediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| MediaError::Engine(e.to_string()))?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| MediaError::Engine(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = api
            .new_peer_connection(config)
            .await
            .map_err(|e| MediaError::Engine(e.to_string()))?;

        Ok(Arc::new(pc))
    }
}

#[async_trait]
impl MediaEngine for WebRtcMediaEngine {
    async fn open(
        &self,
        session_id: &SessionId,
        events: MediaEventSender,
    ) -> Result<Arc<dyn MediaSession>, MediaError> {
        let pc = self.create_peer_connection().await?;
        register_handlers(&pc, session_id, events);

        tracing::debug!("Session {}: peer connection created", session_id);
        Ok(Arc::new(WebRtcMediaSession {
            session_id: session_id.clone(),
            pc,
            track_tx: self.track_tx.clone(),
        }))
    }
}

/// Leitet Callbacks der Peer Connection als [`MediaEvent`] weiter
fn register_handlers(pc: &RTCPeerConnection, session_id: &SessionId, events: MediaEventSender) {
    let id = session_id.clone();
    let tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        tracing::info!("Session {}: peer connection state {:?}", id, s);
        let state = match s {
            RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => {
                ConnectionState::New
            }
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
        };
        let _ = tx.send(MediaEvent::ConnectionState(state));
        Box::pin(async {})
    }));

    let id = session_id.clone();
    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        if let Some(c) = candidate {
            match c.to_json() {
                Ok(init) => {
                    let _ = tx.send(MediaEvent::IceCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_m_line_index: init.sdp_mline_index,
                    }));
                }
                Err(e) => tracing::warn!("Session {}: unusable local candidate: {}", id, e),
            }
        }
        Box::pin(async {})
    }));

    let tx = events;
    pc.on_track(Box::new(move |track, _, _| {
        let kind = match track.kind() {
            RTPCodecType::Video => TrackKind::Video,
            _ => TrackKind::Audio,
        };
        let _ = tx.send(MediaEvent::RemoteTrack(RemoteTrack {
            id: track.id(),
            kind,
        }));
        Box::pin(async {})
    }));
}

// ============================================================================
// SESSION
// ============================================================================

pub struct WebRtcMediaSession {
    session_id: SessionId,
    pc: Arc<RTCPeerConnection>,
    track_tx: broadcast::Sender<Arc<WebRtcLocalTrack>>,
}

impl WebRtcMediaSession {
    async fn add_local_track(&self, kind: TrackKind) -> Result<Arc<WebRtcLocalTrack>, MediaError> {
        let track = Arc::new(WebRtcLocalTrack::new(self.session_id.clone(), kind));
        self.pc
            .add_track(Arc::clone(&track.track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| MediaError::Acquisition(e.to_string()))?;
        Ok(track)
    }
}

#[async_trait]
impl MediaSession for WebRtcMediaSession {
    async fn acquire_local_tracks(
        &self,
        constraints: MediaConstraints,
    ) -> Result<LocalTracks, MediaError> {
        let mut kinds = Vec::new();
        if constraints.audio {
            kinds.push(TrackKind::Audio);
        }
        if constraints.video {
            kinds.push(TrackKind::Video);
        }

        let mut created: Vec<Arc<WebRtcLocalTrack>> = Vec::new();
        for kind in kinds {
            match self.add_local_track(kind).await {
                Ok(track) => created.push(track),
                Err(e) => {
                    for track in &created {
                        track.stop();
                    }
                    return Err(e);
                }
            }
        }

        for track in &created {
            let _ = self.track_tx.send(Arc::clone(track));
        }

        Ok(LocalTracks::new(
            created
                .into_iter()
                .map(|t| t as Arc<dyn LocalTrack>)
                .collect(),
        ))
    }

    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| MediaError::Negotiation(e.to_string()))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| MediaError::Negotiation(e.to_string()))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(|e| MediaError::Negotiation(e.to_string()))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(|e| MediaError::Negotiation(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_m_line_index,
                ..Default::default()
            })
            .await
            .map_err(|e| MediaError::Negotiation(e.to_string()))
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::warn!("Session {}: failed to close peer connection: {}", self.session_id, e);
        }
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, MediaError> {
    let parsed = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    parsed.map_err(|e| MediaError::Negotiation(format!("invalid SDP: {e}")))
}

// ============================================================================
// TESTS
// ============================================================================
