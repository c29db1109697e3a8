//! # Quickdraw Duel
//!
//! Two handheld devices race to press a button first. Neither has a clock
//! the other can trust, so each measures its own draw time from its own
//! BATTLE moment and the two exchange results over a lossy radio link.
//!
//! ## Architecture
//!
//! - **Protocol**: 59 byte duel command packet (match record + command code)
//!   and a single listener slot, on top of [`quickdraw_transport`]
//! - **Match manager**: one active match, draw-time bookkeeping and a
//!   bounded history in a key-value [`Storage`]
//! - **Sequences**: handshake and duel state machines driven by a generic
//!   table-driven [`Runner`]
//! - **Session**: [`Quickdraw`] strings the sequences together and handles
//!   timeouts, verdicts and history writes
//!
//! ## Tick
//!
//! ```text
//! loop {
//!     protocol.poll(now)       // radio events -> transport -> listener
//!     sequence.on_loop()       // timers, presses, inbound commands
//!     first matching transition commits (dismount -> switch -> mount)
//! }
//! ```
//!
//! Everything is single-threaded apart from the radio and button sinks,
//! which only push into channels.

pub mod clock;
pub mod config;
pub mod context;
pub mod duel;
pub mod error;
pub mod fsm;
pub mod handshake;
pub mod match_manager;
pub mod match_record;
pub mod protocol;
pub mod quickdraw;
pub mod storage;

// Re-exports for convenience
pub use clock::{Clock, ManualClock, MonotonicClock, Timer};
pub use config::{DuelConfig, HandshakeConfig, QuickdrawConfig, SessionConfig, StorageConfig};
pub use context::{Button, ButtonPress, ButtonSink, DeviceContext, Feedback, NoFeedback};
pub use duel::{CountdownStage, DuelSequence, DuelState};
pub use error::{
    ConfigError, ConfigResult, MatchError, MatchResult, ProtocolError, ProtocolResult, StorageError,
    StorageResult,
};
pub use fsm::{Runner, Sequence, Transition};
pub use handshake::{HandshakeSequence, HandshakeState};
pub use match_manager::{ActiveDuelState, MatchManager};
pub use match_record::{Match, MatchRecord, Role};
pub use protocol::{CommandCode, DuelCommand, DuelPacket, DuelProtocol, Listener, ProtocolStats};
pub use quickdraw::{Phase, Quickdraw, SessionStats};
pub use storage::{MemoryStorage, Storage};
