//! Call Session - Signaling State Machine für 1:1 WebRTC-Anrufe
//!
//! Koordiniert einen Anruf zwischen zwei Teilnehmern:
//! - [`CallManager`]: Lifecycle (DIALING, RINGING, NEGOTIATING, ACTIVE, ...)
//! - [`signaling`]: Envelope-Format und WebSocket-Transport zum Relay
//! - [`call_engine`]: Media Engine Contract und WebRTC-Implementierung
//! - [`CallProjection`]: Read-Model für die Oberfläche
//!
//! [`CallClient`] verdrahtet alles mit einer [`CallConfig`].

pub mod call_engine;
pub mod config;
pub mod signaling;

pub use call_engine::{
    CallError, CallEvent, CallManager, CallProjection, CallRole, CallSettings, CallState,
    EndReason, MediaEngine, WebRtcLocalTrack, WebRtcMediaEngine,
};
pub use config::{CallConfig, ConfigError, IceServerConfig};
pub use signaling::{SessionId, SignalingEnvelope, SignalingTransport, TransportError, WebSocketTransport};

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

// ============================================================================
// LOGGING
// ============================================================================

/// Installiert den globalen `tracing`-Subscriber
///
/// Ohne `RUST_LOG` gilt `call_session=debug,webrtc=warn`. Ein zweiter Aufruf
/// ist wirkungslos.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("call_session=debug,webrtc=warn"));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

// ============================================================================
// CLIENT
// ============================================================================

#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Verbundener Call-Client: Relay-Verbindung, WebRTC Engine und Manager
pub struct CallClient {
    manager: CallManager,
    transport: Arc<WebSocketTransport>,
    engine: Arc<WebRtcMediaEngine>,
    inbound: JoinHandle<()>,
}

impl CallClient {
    /// Verbindet mit dem Relay und startet Inbound-Verarbeitung und Heartbeat
    pub async fn connect(config: &CallConfig) -> Result<Self, ClientError> {
        config.validate()?;

        tracing::info!("Connecting as participant {}...", config.participant_id);

        let mut transport =
            WebSocketTransport::new(config.signaling_url.clone(), config.participant_id.clone());
        let inbound_rx = transport.connect().await?;
        let transport = Arc::new(transport);

        // Relay hat einen Idle-Timeout
        Arc::clone(&transport).start_heartbeat(config.heartbeat_interval());

        let engine = Arc::new(WebRtcMediaEngine::new(&config.ice_servers));
        let manager = CallManager::new(
            config.participant_id.clone(),
            Arc::clone(&transport) as Arc<dyn SignalingTransport>,
            Arc::clone(&engine) as Arc<dyn MediaEngine>,
            config.call_settings(),
        );
        let inbound = manager.attach_inbound(inbound_rx);

        Ok(Self {
            manager,
            transport,
            engine,
            inbound,
        })
    }

    pub fn manager(&self) -> &CallManager {
        &self.manager
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallProjection> {
        self.manager.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<CallEvent> {
        self.manager.events()
    }

    /// Neue lokale Tracks, in die die Anwendung kodierte Frames schreibt
    pub fn local_tracks(&self) -> broadcast::Receiver<Arc<WebRtcLocalTrack>> {
        self.engine.local_tracks()
    }

    /// Legt auf (falls nötig) und stoppt die Inbound-Verarbeitung
    pub fn shutdown(self) {
        if let Some(id) = self.manager.current_session_id() {
            let _ = self.manager.hang_up(&id);
        }
        tracing::info!("Call client shut down");
    }
}

/// Ohne `shutdown()` beendet der Drop des letzten Manager-Handles die Session
impl Drop for CallClient {
    fn drop(&mut self) {
        self.inbound.abort();
    }
}

impl std::fmt::Debug for CallClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallClient")
            .field("transport", &self.transport)
            .field("manager", &self.manager)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_twice_is_harmless() {
        init_logging();
        init_logging();
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_config() {
        let config = CallConfig {
            answer_timeout_secs: 0,
            ..CallConfig::default()
        };
        let result = CallClient::connect(&config).await;
        assert!(matches!(result, Err(ClientError::Config(_))));
    }

    #[tokio::test]
    async fn test_connect_reports_unreachable_relay() {
        let config = CallConfig {
            signaling_url: "ftp://relay.invalid".to_string(),
            ..CallConfig::default()
        };
        let result = CallClient::connect(&config).await;
        assert!(matches!(result, Err(ClientError::Transport(_))));
    }
}
