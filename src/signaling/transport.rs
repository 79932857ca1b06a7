//! Signaling Transport
//!
//! Der Call-Manager schreibt Envelopes nur über den [`SignalingTransport`]-Trait.
//! [`WebSocketTransport`] ist die Produktiv-Implementierung:
//! - WebSocket-Verbindung zum Relay
//! - Anmeldung mit der lokalen Participant-ID
//! - Heartbeat gegen Idle-Timeouts
//! - Rohe Text-Frames werden unverändert an den Aufrufer weitergereicht

use super::messages::{HeartbeatFrame, RegisterFrame, SignalingEnvelope};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Kapazität der Sende- und Empfangs-Queues
const CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling relay")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),
}

// ============================================================================
// TRANSPORT CONTRACT
// ============================================================================

/// Ausgehende Seite des Signaling-Kanals
///
/// `send` darf nicht blockieren. Der Kanal ist geteilt, andere Komponenten
/// dürfen parallel eigene Nachrichten darüber schicken.
pub trait SignalingTransport: Send + Sync {
    fn send(&self, envelope: &SignalingEnvelope) -> Result<(), TransportError>;
}

impl<T: SignalingTransport + ?Sized> SignalingTransport for Arc<T> {
    fn send(&self, envelope: &SignalingEnvelope) -> Result<(), TransportError> {
        (**self).send(envelope)
    }
}

// ============================================================================
// WEBSOCKET TRANSPORT
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ConnectionState {
    is_connected: bool,
}

/// WebSocket-Verbindung zum Signaling-Relay
pub struct WebSocketTransport {
    server_url: String,
    participant_id: String,
    state: Arc<RwLock<ConnectionState>>,
    tx: Option<mpsc::Sender<String>>,
}

impl WebSocketTransport {
    /// Erstellt einen noch nicht verbundenen Transport
    pub fn new(server_url: String, participant_id: String) -> Self {
        Self {
            server_url,
            participant_id,
            state: Arc::new(RwLock::new(ConnectionState::default())),
            tx: None,
        }
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    /// Verbindet mit dem Relay und meldet den Teilnehmer an
    ///
    /// Gibt den Empfänger für eingehende Text-Frames zurück. Der Empfänger
    /// endet, sobald die Verbindung geschlossen wird.
    pub async fn connect(&mut self) -> Result<mpsc::Receiver<String>, TransportError> {
        let ws_url = websocket_url(&self.server_url)?;

        tracing::info!("Connecting to signaling relay: {}", ws_url);

        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
        self.tx = Some(tx);
        self.state.write().is_connected = true;

        // Read-Task
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        if inbound_tx.send(text).await.is_err() {
                            tracing::debug!("Inbound receiver dropped, stopping read task");
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by relay");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            state.write().is_connected = false;
            tracing::info!("Disconnected from signaling relay");
        });

        // Write-Task
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    state.write().is_connected = false;
                    break;
                }
            }
        });

        self.send_frame(&RegisterFrame::new(self.participant_id.clone()))?;
        tracing::info!("Registered as participant {}", self.participant_id);

        Ok(inbound_rx)
    }

    /// Startet einen Heartbeat-Task, der endet sobald die Verbindung weg ist
    pub fn start_heartbeat(self: Arc<Self>, every: Duration) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            // Der erste Tick kommt sofort
            interval.tick().await;
            loop {
                interval.tick().await;
                if !self.is_connected() {
                    tracing::info!("Heartbeat: transport disconnected, stopping heartbeat task");
                    break;
                }
                let frame = HeartbeatFrame::new(self.participant_id.clone());
                if let Err(e) = self.send_frame(&frame) {
                    tracing::warn!("Failed to send heartbeat: {}", e);
                }
            }
        });
    }

    /// Serialisiert und queued einen Frame (non-blocking)
    fn send_frame<T: serde::Serialize>(&self, frame: &T) -> Result<(), TransportError> {
        let msg = serde_json::to_string(frame)
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        self.send_text(msg)
    }

    fn send_text(&self, msg: String) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let tx = self.tx.as_ref().ok_or(TransportError::NotConnected)?;

        // try_send ist non-blocking
        tx.try_send(msg)
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}

impl SignalingTransport for WebSocketTransport {
    fn send(&self, envelope: &SignalingEnvelope) -> Result<(), TransportError> {
        let msg = envelope
            .encode()
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        self.send_text(msg)
    }
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("server_url", &self.server_url)
            .field("participant_id", &self.participant_id)
            .field("state", &*self.state.read())
            .finish()
    }
}

/// Baut die WebSocket-URL (`http(s)` → `ws(s)`, Pfad `/ws` falls leer)
fn websocket_url(server_url: &str) -> Result<url::Url, TransportError> {
    let mut url = url::Url::parse(server_url)
        .map_err(|e| TransportError::ConnectionFailed(format!("{server_url}: {e}")))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(TransportError::ConnectionFailed(format!(
                "unsupported scheme: {other}"
            )))
        }
    };
    if url.scheme() != scheme && url.set_scheme(scheme).is_err() {
        return Err(TransportError::ConnectionFailed(format!(
            "cannot use scheme {scheme} for {server_url}"
        )));
    }
    if url.path() == "/" || url.path().is_empty() {
        url.set_path("/ws");
    }
    Ok(url)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::{EnvelopeBody, PeerPayload, SessionId};

    #[test]
    fn test_websocket_url_from_http() {
        let url = websocket_url("https://relay.example.com").unwrap();
        assert_eq!(url.as_str(), "wss://relay.example.com/ws");

        let url = websocket_url("http://localhost:8787").unwrap();
        assert_eq!(url.as_str(), "ws://localhost:8787/ws");

        let url = websocket_url("ws://localhost:8787/signal").unwrap();
        assert_eq!(url.as_str(), "ws://localhost:8787/signal");
    }

    #[test]
    fn test_websocket_url_rejects_other_schemes() {
        assert!(matches!(
            websocket_url("ftp://relay.example.com"),
            Err(TransportError::ConnectionFailed(_))
        ));
        assert!(matches!(
            websocket_url("not a url"),
            Err(TransportError::ConnectionFailed(_))
        ));
    }

    #[test]
    fn test_send_before_connect_fails() {
        let transport =
            WebSocketTransport::new("ws://localhost:8787".to_string(), "alice".to_string());
        let envelope = SignalingEnvelope::new(
            SessionId::from("S1"),
            EnvelopeBody::Hangup(PeerPayload::new("alice")),
        );

        assert!(!transport.is_connected());
        assert_eq!(transport.send(&envelope), Err(TransportError::NotConnected));
    }

    #[tokio::test]
    async fn test_connect_with_invalid_url_fails() {
        let mut transport = WebSocketTransport::new("not a url".to_string(), "alice".to_string());
        let result = transport.connect().await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
    }
}
