//! Konfiguration
//!
//! Wird aus Umgebungsvariablen oder JSON geladen; jedes Feld hat einen Default.

use crate::call_engine::CallSettings;
use crate::signaling::MediaConstraints;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

// ============================================================================
// CONFIG
// ============================================================================

/// STUN/TURN Server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

impl IceServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: String::new(),
            credential: String::new(),
        }
    }
}

/// Standard STUN Server (Google, kostenlos)
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
        ],
        username: String::new(),
        credential: String::new(),
    }]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// WebSocket URL des Signaling-Relays
    pub signaling_url: String,
    /// Lokale Identität beim Relay
    pub participant_id: String,
    pub ice_servers: Vec<IceServerConfig>,
    pub answer_timeout_secs: u64,
    pub ring_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    /// Ob `start_call` Video anfordert
    pub video: bool,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://localhost:8787".to_string(),
            participant_id: uuid::Uuid::new_v4().to_string(),
            ice_servers: default_ice_servers(),
            answer_timeout_secs: 30,
            ring_timeout_secs: 45,
            heartbeat_interval_secs: 25,
            video: true,
        }
    }
}

impl CallConfig {
    /// Lädt die Konfiguration aus der Umgebung
    ///
    /// `SIGNALING_URL`, `CALL_PARTICIPANT_ID`, `CALL_ICE_SERVERS` (kommagetrennt),
    /// `CALL_ANSWER_TIMEOUT_SECS`, `CALL_RING_TIMEOUT_SECS`,
    /// `CALL_HEARTBEAT_INTERVAL_SECS`, `CALL_VIDEO`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("SIGNALING_URL") {
            config.signaling_url = url;
        }
        if let Some(id) = lookup("CALL_PARTICIPANT_ID") {
            config.participant_id = id;
        }
        if let Some(servers) = lookup("CALL_ICE_SERVERS") {
            config.ice_servers = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(IceServerConfig::stun)
                .collect();
        }
        if let Some(value) = lookup("CALL_ANSWER_TIMEOUT_SECS") {
            config.answer_timeout_secs = parse_secs("CALL_ANSWER_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = lookup("CALL_RING_TIMEOUT_SECS") {
            config.ring_timeout_secs = parse_secs("CALL_RING_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = lookup("CALL_HEARTBEAT_INTERVAL_SECS") {
            config.heartbeat_interval_secs = parse_secs("CALL_HEARTBEAT_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = lookup("CALL_VIDEO") {
            config.video = match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                other => {
                    return Err(ConfigError::InvalidValue {
                        key: "CALL_VIDEO",
                        reason: format!("expected a boolean, got {other:?}"),
                    })
                }
            };
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.signaling_url.trim().is_empty() {
            return Err(invalid("signaling_url", "must not be empty"));
        }
        if self.participant_id.trim().is_empty() {
            return Err(invalid("participant_id", "must not be empty"));
        }
        if self.ice_servers.iter().any(|s| s.urls.is_empty()) {
            return Err(invalid("ice_servers", "every server needs at least one url"));
        }
        if self.answer_timeout_secs == 0 {
            return Err(invalid("answer_timeout_secs", "must be greater than zero"));
        }
        if self.ring_timeout_secs == 0 {
            return Err(invalid("ring_timeout_secs", "must be greater than zero"));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(invalid("heartbeat_interval_secs", "must be greater than zero"));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Parameter für den [`CallManager`](crate::call_engine::CallManager)
    pub fn call_settings(&self) -> CallSettings {
        CallSettings {
            answer_timeout: Duration::from_secs(self.answer_timeout_secs),
            ring_timeout: Duration::from_secs(self.ring_timeout_secs),
            constraints: if self.video {
                MediaConstraints::audio_video()
            } else {
                MediaConstraints::audio_only()
            },
        }
    }
}

fn parse_secs(key: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|e: std::num::ParseIntError| ConfigError::InvalidValue {
        key,
        reason: e.to_string(),
    })
}

fn invalid(key: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key,
        reason: reason.to_string(),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = CallConfig::default();
        assert_eq!(config.signaling_url, "ws://localhost:8787");
        assert_eq!(config.answer_timeout_secs, 30);
        assert_eq!(config.ring_timeout_secs, 45);
        assert!(config.video);
        assert!(!config.participant_id.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = CallConfig::from_lookup(lookup(&[
            ("SIGNALING_URL", "wss://relay.example.com"),
            ("CALL_PARTICIPANT_ID", "alice"),
            ("CALL_ICE_SERVERS", "stun:a.example.com:3478, stun:b.example.com:3478"),
            ("CALL_RING_TIMEOUT_SECS", "10"),
            ("CALL_VIDEO", "false"),
        ]))
        .unwrap();

        assert_eq!(config.signaling_url, "wss://relay.example.com");
        assert_eq!(config.participant_id, "alice");
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.ice_servers[1].urls, vec!["stun:b.example.com:3478"]);
        assert_eq!(config.ring_timeout_secs, 10);
        assert_eq!(config.call_settings().constraints, MediaConstraints::audio_only());
    }

    #[test]
    fn test_from_lookup_rejects_bad_numbers() {
        let result = CallConfig::from_lookup(lookup(&[("CALL_ANSWER_TIMEOUT_SECS", "soon")]));
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue {
                key: "CALL_ANSWER_TIMEOUT_SECS",
                ..
            })
        ));
    }

    #[test]
    fn test_zero_timeout_is_invalid() {
        let result = CallConfig::from_lookup(lookup(&[("CALL_RING_TIMEOUT_SECS", "0")]));
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue {
                key: "ring_timeout_secs",
                ..
            })
        ));
    }

    #[test]
    fn test_from_json_str_fills_defaults() {
        let config = CallConfig::from_json_str(
            r#"{"signaling_url": "ws://10.0.0.1:9000", "participant_id": "bob"}"#,
        )
        .unwrap();
        assert_eq!(config.participant_id, "bob");
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(25));
        assert_eq!(config.ice_servers, default_ice_servers());
    }

    #[test]
    fn test_from_json_str_rejects_empty_url() {
        let result = CallConfig::from_json_str(r#"{"signaling_url": ""}"#);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }
}
