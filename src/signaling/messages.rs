//! Message Types für das Signaling-Protokoll
//!
//! Jede Nachricht auf dem Signaling-Kanal ist ein JSON-Envelope der Form
//! `{"type": "...", "sessionId": "...", "from": "...", "to": "...", "payload": {...}}`.
//! Der Kanal wird mit anderen Nachrichtentypen geteilt, daher wird beim
//! Dekodieren zwischen kaputtem JSON und fremden `type`-Werten unterschieden.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Malformed JSON: {0}")]
    MalformedJson(String),

    #[error("Envelope has no type field")]
    MissingType,

    #[error("Unknown envelope type: {0}")]
    UnknownType(String),

    #[error("{0} envelope has no sessionId")]
    MissingSessionId(EnvelopeType),

    #[error("Invalid {kind} payload: {reason}")]
    InvalidPayload { kind: EnvelopeType, reason: String },
}

// ============================================================================
// SESSION ID
// ============================================================================

/// Opaker Identifier eines Anrufversuchs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Erzeugt eine neue, zufällige Session-ID (UUID v4)
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// PAYLOAD TYPES
// ============================================================================

/// Welche lokalen Tracks für einen Anruf angefordert werden
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    pub fn audio_video() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self::audio_video()
    }
}

/// ICE Candidate im Format von `RTCIceCandidateInit`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_m_line_index: Option<u16>,
}

/// SDP Offer mit den Medien, die der Anrufer erwartet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferPayload {
    pub sdp: String,
    #[serde(default)]
    pub media: MediaConstraints,
}

/// SDP Answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerPayload {
    pub sdp: String,
}

/// Payload für HANGUP, REJECT, ACCEPT und CANCEL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerPayload {
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PeerPayload {
    pub fn new(sender: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            reason: None,
        }
    }

    pub fn with_reason(sender: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            reason: Some(reason.into()),
        }
    }
}

// ============================================================================
// ENVELOPE
// ============================================================================

/// Alle bekannten Envelope-Typen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeType {
    Offer,
    Answer,
    Candidate,
    Hangup,
    Reject,
    Accept,
    Cancel,
}

impl EnvelopeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeType::Offer => "OFFER",
            EnvelopeType::Answer => "ANSWER",
            EnvelopeType::Candidate => "CANDIDATE",
            EnvelopeType::Hangup => "HANGUP",
            EnvelopeType::Reject => "REJECT",
            EnvelopeType::Accept => "ACCEPT",
            EnvelopeType::Cancel => "CANCEL",
        }
    }
}

impl fmt::Display for EnvelopeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnvelopeType {
    type Err = DecodeError;

    /// Groß-/Kleinschreibung egal
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "OFFER" => Ok(EnvelopeType::Offer),
            "ANSWER" => Ok(EnvelopeType::Answer),
            "CANDIDATE" => Ok(EnvelopeType::Candidate),
            "HANGUP" => Ok(EnvelopeType::Hangup),
            "REJECT" => Ok(EnvelopeType::Reject),
            "ACCEPT" => Ok(EnvelopeType::Accept),
            "CANCEL" => Ok(EnvelopeType::Cancel),
            _ => Err(DecodeError::UnknownType(s.to_string())),
        }
    }
}

/// Typabhängiger Inhalt eines Envelopes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeBody {
    Offer(OfferPayload),
    Answer(AnswerPayload),
    Candidate(IceCandidate),
    Hangup(PeerPayload),
    Reject(PeerPayload),
    Accept(PeerPayload),
    Cancel(PeerPayload),
}

impl EnvelopeBody {
    pub fn kind(&self) -> EnvelopeType {
        match self {
            EnvelopeBody::Offer(_) => EnvelopeType::Offer,
            EnvelopeBody::Answer(_) => EnvelopeType::Answer,
            EnvelopeBody::Candidate(_) => EnvelopeType::Candidate,
            EnvelopeBody::Hangup(_) => EnvelopeType::Hangup,
            EnvelopeBody::Reject(_) => EnvelopeType::Reject,
            EnvelopeBody::Accept(_) => EnvelopeType::Accept,
            EnvelopeBody::Cancel(_) => EnvelopeType::Cancel,
        }
    }
}

/// Die Übertragungseinheit auf dem Signaling-Kanal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingEnvelope {
    pub session_id: SessionId,
    pub from: Option<String>,
    pub to: Option<String>,
    pub body: EnvelopeBody,
}

/// JSON-Form des Envelopes; `payload` und `sessionId` werden erst nach dem
/// `type` interpretiert, Relay-Frames haben keine Session.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    to: Option<String>,
    #[serde(default)]
    payload: serde_json::Value,
}

impl SignalingEnvelope {
    pub fn new(session_id: SessionId, body: EnvelopeBody) -> Self {
        Self {
            session_id,
            from: None,
            to: None,
            body,
        }
    }

    /// Setzt Absender und Empfänger für das Routing im Relay
    pub fn routed(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self.to = Some(to.into());
        self
    }

    pub fn kind(&self) -> EnvelopeType {
        self.body.kind()
    }

    /// Serialisiert den Envelope als JSON-String
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let payload = match &self.body {
            EnvelopeBody::Offer(p) => serde_json::to_value(p)?,
            EnvelopeBody::Answer(p) => serde_json::to_value(p)?,
            EnvelopeBody::Candidate(p) => serde_json::to_value(p)?,
            EnvelopeBody::Hangup(p)
            | EnvelopeBody::Reject(p)
            | EnvelopeBody::Accept(p)
            | EnvelopeBody::Cancel(p) => serde_json::to_value(p)?,
        };

        serde_json::to_string(&WireEnvelope {
            kind: Some(self.kind().as_str().to_string()),
            session_id: Some(self.session_id.clone()),
            from: self.from.clone(),
            to: self.to.clone(),
            payload,
        })
    }

    /// Parst einen rohen JSON-String in einen Envelope
    pub fn decode(raw: &str) -> Result<Self, DecodeError> {
        let wire: WireEnvelope =
            serde_json::from_str(raw).map_err(|e| DecodeError::MalformedJson(e.to_string()))?;

        let kind: EnvelopeType = wire.kind.as_deref().ok_or(DecodeError::MissingType)?.parse()?;
        let session_id = wire
            .session_id
            .ok_or(DecodeError::MissingSessionId(kind))?;

        let body = match kind {
            EnvelopeType::Offer => EnvelopeBody::Offer(payload_as(kind, wire.payload)?),
            EnvelopeType::Answer => EnvelopeBody::Answer(payload_as(kind, wire.payload)?),
            EnvelopeType::Candidate => EnvelopeBody::Candidate(payload_as(kind, wire.payload)?),
            EnvelopeType::Hangup => EnvelopeBody::Hangup(payload_as(kind, wire.payload)?),
            EnvelopeType::Reject => EnvelopeBody::Reject(payload_as(kind, wire.payload)?),
            EnvelopeType::Accept => EnvelopeBody::Accept(payload_as(kind, wire.payload)?),
            EnvelopeType::Cancel => EnvelopeBody::Cancel(payload_as(kind, wire.payload)?),
        };

        Ok(Self {
            session_id,
            from: wire.from,
            to: wire.to,
            body,
        })
    }
}

fn payload_as<T: serde::de::DeserializeOwned>(
    kind: EnvelopeType,
    payload: serde_json::Value,
) -> Result<T, DecodeError> {
    serde_json::from_value(payload).map_err(|e| DecodeError::InvalidPayload {
        kind,
        reason: e.to_string(),
    })
}

// ============================================================================
// CLIENT → RELAY CONTROL FRAMES
// ============================================================================

/// Meldet den lokalen Teilnehmer beim Relay an
#[derive(Debug, Clone, Serialize)]
pub struct RegisterFrame {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "participantId")]
    pub participant_id: String,
}

impl RegisterFrame {
    pub fn new(participant_id: String) -> Self {
        Self {
            msg_type: "register",
            participant_id,
        }
    }
}

/// Heartbeat, damit das Relay die Verbindung nicht wegen Idle-Timeout schließt
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatFrame {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "participantId")]
    pub participant_id: String,
}

impl HeartbeatFrame {
    pub fn new(participant_id: String) -> Self {
        Self {
            msg_type: "heartbeat",
            participant_id,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
