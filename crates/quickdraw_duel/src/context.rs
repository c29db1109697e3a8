//! # Device Context
//!
//! Everything a state sequence touches, constructed once per device and
//! passed by `&mut` into every lifecycle call. There are no globals: two
//! devices in one test are just two contexts.

use crossbeam_channel::{Receiver, Sender};
use quickdraw_transport::{MacAddress, Radio, RadioEvent};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::warn;

use crate::clock::Clock;
use crate::config::QuickdrawConfig;
use crate::duel::CountdownStage;
use crate::match_manager::MatchManager;
use crate::match_record::{Match, Role};
use crate::protocol::{CommandCode, DuelProtocol};
use crate::storage::Storage;

/// Physical buttons.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Button {
    /// Hunter's draw button.
    Primary,
    /// Bounty's draw button.
    Secondary,
}

impl Button {
    /// Button a role draws with.
    #[must_use]
    pub const fn for_role(role: Role) -> Self {
        match role {
            Role::Hunter => Self::Primary,
            Role::Bounty => Self::Secondary,
        }
    }
}

/// A timestamped press.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ButtonPress {
    /// Which button.
    pub button: Button,
    /// Clock reading when it went down.
    pub at_ms: u64,
}

/// Interrupt-side handle for reporting button presses.
#[derive(Clone, Debug)]
pub struct ButtonSink {
    tx: Sender<ButtonPress>,
}

impl ButtonSink {
    /// Reports a press. Returns false if the device is gone.
    pub fn press(&self, button: Button, at_ms: u64) -> bool {
        self.tx.send(ButtonPress { button, at_ms }).is_ok()
    }
}

/// Display, LED and haptic output. Every hook defaults to doing nothing.
pub trait Feedback {
    /// A countdown stage started.
    fn countdown_stage(&mut self, _stage: CountdownStage) {}

    /// Buzz the motor.
    fn haptic_pulse(&mut self, _duration_ms: u64, _intensity: u8) {}

    /// The duel was decided.
    fn outcome(&mut self, _won: bool) {}

    /// The link was lost.
    fn connection_lost(&mut self) {}
}

/// Feedback that ignores everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoFeedback;

impl Feedback for NoFeedback {}

/// Per-device state shared by every sequence.
pub struct DeviceContext<R: Radio, S: Storage> {
    player_id: String,
    role: Role,
    opponent: MacAddress,
    clock: Box<dyn Clock>,
    /// Duel command codec and transport.
    pub protocol: DuelProtocol<R>,
    /// Active match and history.
    pub matches: MatchManager<S>,
    buttons: Receiver<ButtonPress>,
    feedback: Box<dyn Feedback>,
    rng: ChaCha8Rng,
    config: QuickdrawConfig,
}

impl<R: Radio, S: Storage> DeviceContext<R, S> {
    /// Builds a context. Returns it with the sink its button driver feeds.
    ///
    /// `seed` feeds the match-id generator; give each device its own.
    pub fn new(
        player_id: &str,
        radio: R,
        events: Receiver<RadioEvent>,
        storage: S,
        clock: Box<dyn Clock>,
        config: QuickdrawConfig,
        seed: u64,
    ) -> (Self, ButtonSink) {
        let (tx, buttons) = crossbeam_channel::unbounded();
        let protocol = DuelProtocol::new(radio, events, config.transport.clone());
        let matches = MatchManager::new(storage, config.storage.max_matches, config.duel.masher_penalty_ms);
        let ctx = Self {
            player_id: player_id.chars().take(crate::match_record::PLAYER_ID_LEN).collect(),
            role: Role::Hunter,
            opponent: MacAddress::UNSPECIFIED,
            clock,
            protocol,
            matches,
            buttons,
            feedback: Box::new(NoFeedback),
            rng: ChaCha8Rng::seed_from_u64(seed),
            config,
        };
        (ctx, ButtonSink { tx })
    }

    /// Replaces the feedback sink.
    pub fn set_feedback(&mut self, feedback: Box<dyn Feedback>) {
        self.feedback = feedback;
    }

    /// Feedback sink.
    pub fn feedback(&mut self) -> &mut dyn Feedback {
        self.feedback.as_mut()
    }

    /// Local player's identifier.
    #[must_use]
    pub fn player_id(&self) -> &str {
        &self.player_id
    }

    /// Local role in the current duel.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// Sets the local role for the next duel.
    pub fn set_role(&mut self, role: Role) {
        self.role = role;
        self.matches.set_role(role);
    }

    /// Opponent's radio address, unspecified until known.
    #[must_use]
    pub const fn opponent(&self) -> MacAddress {
        self.opponent
    }

    /// Records the opponent's radio address.
    pub fn set_opponent(&mut self, addr: MacAddress) {
        self.opponent = addr;
    }

    /// Current clock reading.
    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Configuration.
    #[must_use]
    pub const fn config(&self) -> &QuickdrawConfig {
        &self.config
    }

    /// Fresh match id.
    pub fn generate_match_id(&mut self) -> String {
        Match::generate_id(&mut self.rng)
    }

    /// Sends `code` carrying the active match to the opponent. Returns
    /// false, after logging why, if there is no match or the send failed.
    pub fn send_command(&mut self, code: CommandCode) -> bool {
        let Some(active) = self.matches.active_match() else {
            warn!("cannot send {:?}: no active match", code);
            return false;
        };
        match self.protocol.broadcast(self.opponent, code, active) {
            Ok(()) => true,
            Err(err) => {
                warn!("send {:?} failed: {}", code, err);
                false
            }
        }
    }

    /// Takes every press reported since the last call.
    pub fn take_presses(&mut self) -> Vec<ButtonPress> {
        self.buttons.try_iter().collect()
    }
}
