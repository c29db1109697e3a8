//! # Device Configuration
//!
//! Tuned timing constants, loaded once at startup from TOML. Every field
//! has a default, so an empty file (or no file) yields the shipped tuning.
//!
//! ```toml
//! [transport]
//! max_retries = 5
//!
//! [handshake]
//! timeout_ms = 20000
//! final_ack_retry_ms = 3000
//!
//! [duel]
//! pushed_grace_ms = 900
//! received_grace_ms = 750
//! ```

use std::path::Path;

use quickdraw_transport::{TransportConfig, DEFAULT_PEER_CAPACITY, MAX_FRAGMENT_PAYLOAD};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Handshake timing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Watchdog spanning the whole handshake.
    pub timeout_ms: u64,
    /// Settle time before routing by role.
    pub settle_ms: u64,
    /// Delay before the bounty's first send.
    pub send_delay_ms: u64,
    /// Wait for the hunter's ready before resending the final ack.
    pub final_ack_retry_ms: u64,
    /// Final-ack resends, capped at three.
    pub final_ack_max_retries: u8,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 20_000,
            settle_ms: 500,
            send_delay_ms: 100,
            final_ack_retry_ms: 3000,
            final_ack_max_retries: 3,
        }
    }
}

/// Countdown and race timing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DuelConfig {
    /// Length of each of the THREE, TWO and ONE stages.
    pub countdown_stage_ms: u64,
    /// Race length with neither a press nor a result.
    pub duel_timeout_ms: u64,
    /// Wait for the opponent's result after pressing first.
    pub pushed_grace_ms: u64,
    /// Wait for the local press after the opponent's result arrived first.
    pub received_grace_ms: u64,
    /// Added to the draw time for every press during the countdown.
    pub masher_penalty_ms: u32,
    /// Haptic pulse per countdown stage.
    pub haptic_pulse_ms: u64,
    /// Haptic intensity.
    pub haptic_intensity: u8,
}

impl Default for DuelConfig {
    fn default() -> Self {
        Self {
            countdown_stage_ms: 2000,
            duel_timeout_ms: 4000,
            pushed_grace_ms: 900,
            received_grace_ms: 750,
            masher_penalty_ms: 75,
            haptic_pulse_ms: 75,
            haptic_intensity: 255,
        }
    }
}

/// Match history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Matches kept before finalize starts failing.
    pub max_matches: u8,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { max_matches: u8::MAX }
    }
}

/// Top-level session timing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long "connection lost" shows before idle.
    pub connection_lost_ms: u64,
    /// How long the win/lose screen shows before idle.
    pub outcome_display_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connection_lost_ms: 3000,
            outcome_display_ms: 5000,
        }
    }
}

/// Complete device configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuickdrawConfig {
    /// Radio transport.
    pub transport: TransportConfig,
    /// Handshake sequence.
    pub handshake: HandshakeConfig,
    /// Duel sequence.
    pub duel: DuelConfig,
    /// Match history.
    pub storage: StorageConfig,
    /// Session.
    pub session: SessionConfig,
}

impl QuickdrawConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML and
    /// [`ConfigError::Invalid`] for out-of-range values.
    pub fn from_toml_str(source: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(source).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, otherwise as
    /// [`Self::from_toml_str`].
    pub fn from_toml_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&source)
    }

    /// Renders the configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if serialization fails.
    pub fn to_toml_string(&self) -> ConfigResult<String> {
        toml::to_string(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Checks ranges that the types alone do not enforce.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad field.
    pub fn validate(&self) -> ConfigResult<()> {
        let t = &self.transport;
        if t.max_fragment_payload == 0 || t.max_fragment_payload > MAX_FRAGMENT_PAYLOAD {
            return Err(ConfigError::Invalid(format!(
                "transport.max_fragment_payload must be 1..={MAX_FRAGMENT_PAYLOAD}, got {}",
                t.max_fragment_payload
            )));
        }
        // The radio's own registry holds DEFAULT_PEER_CAPACITY entries.
        if t.peer_capacity == 0 || t.peer_capacity > DEFAULT_PEER_CAPACITY {
            return Err(ConfigError::Invalid(format!(
                "transport.peer_capacity must be 1..={DEFAULT_PEER_CAPACITY}, got {}",
                t.peer_capacity
            )));
        }
        if t.send_queue_frames == 0 {
            return Err(ConfigError::Invalid("transport.send_queue_frames must be at least 1".into()));
        }
        if self.handshake.timeout_ms == 0 {
            return Err(ConfigError::Invalid("handshake.timeout_ms must be non-zero".into()));
        }
        if self.duel.countdown_stage_ms == 0 || self.duel.duel_timeout_ms == 0 {
            return Err(ConfigError::Invalid("duel stage and timeout lengths must be non-zero".into()));
        }
        if self.storage.max_matches == 0 {
            return Err(ConfigError::Invalid("storage.max_matches must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_shipped_tuning() {
        let config = QuickdrawConfig::default();
        assert_eq!(config.transport.max_retries, 5);
        assert_eq!(config.transport.peer_capacity, 20);
        assert_eq!(config.handshake.timeout_ms, 20_000);
        assert_eq!(config.handshake.final_ack_retry_ms, 3000);
        assert_eq!(config.duel.pushed_grace_ms, 900);
        assert_eq!(config.duel.received_grace_ms, 750);
        assert_eq!(config.storage.max_matches, 255);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(QuickdrawConfig::from_toml_str("").unwrap(), QuickdrawConfig::default());
    }

    #[test]
    fn test_partial_override() {
        let config = QuickdrawConfig::from_toml_str(
            "[duel]\nreceived_grace_ms = 600\n\n[transport]\nmax_retries = 2\n",
        )
        .unwrap();
        assert_eq!(config.duel.received_grace_ms, 600);
        assert_eq!(config.duel.pushed_grace_ms, 900);
        assert_eq!(config.transport.max_retries, 2);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = QuickdrawConfig::from_toml_str("[transport]\nmax_fragment_payload = 400\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = QuickdrawConfig::from_toml_str("[storage]\nmax_matches = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = QuickdrawConfig::from_toml_str("[transport]\npeer_capacity = 21\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref msg) if msg.contains("peer_capacity")));
        assert!(QuickdrawConfig::from_toml_str("[transport]\npeer_capacity = 20\n").is_ok());
    }

    #[test]
    fn test_malformed_toml() {
        let err = QuickdrawConfig::from_toml_str("[duel\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_toml_round_trip() {
        let config = QuickdrawConfig::default();
        let text = config.to_toml_string().unwrap();
        assert_eq!(QuickdrawConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_missing_file() {
        let err = QuickdrawConfig::from_toml_file("/nonexistent/quickdraw.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
