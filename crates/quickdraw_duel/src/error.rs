//! # Duel Error Types
//!
//! Everything here is recoverable. The worst user-visible effect of any of
//! these is a "connection lost" screen and a return to idle.

use quickdraw_transport::TransportError;
use thiserror::Error;

/// Errors from encoding, decoding or sending duel commands.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Payload is not exactly one packed duel packet.
    #[error("bad packet length: expected {expected}, got {actual}")]
    PacketLength {
        /// Size of a packed packet.
        expected: usize,
        /// Size that arrived.
        actual: usize,
    },

    /// Command code outside the command set.
    #[error("unknown command code: {0}")]
    UnknownCommand(i32),

    /// The transport refused the send.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors from the key-value store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// No room for another key.
    #[error("storage full: capacity {capacity} entries")]
    Full {
        /// Entries the store can hold.
        capacity: usize,
    },
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors from match bookkeeping.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MatchError {
    /// Operation needs an active match and there is none.
    #[error("no active match")]
    NoActiveMatch,

    /// Match history is at capacity; the match stays active.
    #[error("match storage full: {stored} of {capacity} slots used")]
    StorageFull {
        /// Matches already stored.
        stored: usize,
        /// Maximum matches.
        capacity: usize,
    },

    /// A stored record could not be decoded.
    #[error("corrupt match record under key {0}")]
    CorruptRecord(String),
}

/// Result type for match operations.
pub type MatchResult<T> = Result<T, MatchError>;

/// Errors from loading configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("could not read config: {0}")]
    Io(String),

    /// The config file is not valid TOML for this schema.
    #[error("could not parse config: {0}")]
    Parse(String),

    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;
