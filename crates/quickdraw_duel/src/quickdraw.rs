//! # Quickdraw Session
//!
//! Top-level device loop. Owns the [`DeviceContext`] and runs at most one
//! sequence at a time.
//!
//! ```text
//!          begin_duel
//! Idle ---------------> Handshake --(connected)--> Duel --(won/lost)--> Outcome
//!  ^                        |                        |                     |
//!  |                    (timed out)              (timed out)               |
//!  |                        v                        v                     |
//!  +------------------ ConnectionLost <--------------+                     |
//!  +-----------------------------------------------------------------------+
//! ```
//!
//! A timed out handshake or race abandons the match. A decided match is
//! written to history; if history is full it stays active and the write is
//! retried every tick spent in `Idle`.

use quickdraw_transport::{MacAddress, Radio};
use tracing::{error, info, warn};

use crate::clock::Timer;
use crate::context::DeviceContext;
use crate::duel::{DuelSequence, DuelState};
use crate::error::MatchError;
use crate::fsm::Runner;
use crate::handshake::{HandshakeSequence, HandshakeState};
use crate::match_record::Role;
use crate::storage::Storage;

/// Session phases.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for a duel to be started.
    Idle,
    /// Handshake sequence running.
    Handshake,
    /// Duel sequence running.
    Duel,
    /// Showing the verdict.
    Outcome,
    /// Showing the connection-lost screen.
    ConnectionLost,
}

/// Session counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Handshakes that reached the duel.
    pub handshakes_completed: u64,
    /// Duels won.
    pub duels_won: u64,
    /// Duels lost.
    pub duels_lost: u64,
    /// Handshakes or races abandoned on timeout.
    pub connections_lost: u64,
    /// Finalize attempts refused because history was full.
    pub finalize_deferred: u64,
}

/// One device's duel session.
pub struct Quickdraw<R: Radio, S: Storage> {
    ctx: DeviceContext<R, S>,
    phase: Phase,
    handshake: Option<Runner<HandshakeSequence>>,
    duel: Option<Runner<DuelSequence>>,
    phase_timer: Timer,
    pending_finalize: bool,
    last_outcome: Option<bool>,
    stats: SessionStats,
}

impl<R: Radio + 'static, S: Storage + 'static> Quickdraw<R, S> {
    /// Wraps a device context. Starts idle.
    #[must_use]
    pub fn new(ctx: DeviceContext<R, S>) -> Self {
        Self {
            ctx,
            phase: Phase::Idle,
            handshake: None,
            duel: None,
            phase_timer: Timer::default(),
            pending_finalize: false,
            last_outcome: None,
            stats: SessionStats::default(),
        }
    }

    /// Starts a handshake as `role` against `opponent`. An unspecified
    /// address finds the opponent by broadcast.
    ///
    /// Returns false unless idle with no match left over.
    pub fn begin_duel(&mut self, role: Role, opponent: MacAddress) -> bool {
        if self.phase != Phase::Idle {
            warn!("begin_duel ignored in {:?}", self.phase);
            return false;
        }
        if self.ctx.matches.has_active_match() {
            warn!("begin_duel refused: previous match not yet stored");
            return false;
        }

        info!("starting duel as {:?} against {}", role, opponent);
        self.ctx.set_role(role);
        self.ctx.set_opponent(opponent);
        self.ctx.protocol.clear_command_log();
        self.ctx.take_presses();
        self.last_outcome = None;

        let sequence = HandshakeSequence::new(role, self.ctx.config().handshake.clone());
        self.handshake = Some(Runner::start(sequence, &mut self.ctx));
        self.phase = Phase::Handshake;
        true
    }

    /// Runs one application tick.
    pub fn tick(&mut self) {
        let now = self.ctx.now_ms();
        self.ctx.protocol.poll(now);

        match self.phase {
            Phase::Idle => {
                // Presses while idle do not carry into the next countdown.
                self.ctx.take_presses();
                if self.pending_finalize {
                    self.finalize();
                }
            }
            Phase::Handshake => self.tick_handshake(),
            Phase::Duel => self.tick_duel(),
            Phase::Outcome | Phase::ConnectionLost => {
                if self.phase_timer.expired(now) {
                    self.phase_timer.invalidate();
                    self.enter_idle();
                }
            }
        }
    }

    fn tick_handshake(&mut self) {
        let Some(runner) = self.handshake.as_mut() else {
            self.enter_idle();
            return;
        };
        runner.tick(&mut self.ctx);
        let state = runner.machine().state();
        match state {
            HandshakeState::ConnectionSuccessful => {
                self.handshake = None;
                self.stats.handshakes_completed += 1;
                let sequence = DuelSequence::new(self.ctx.config().duel.clone());
                self.duel = Some(Runner::start(sequence, &mut self.ctx));
                self.phase = Phase::Duel;
            }
            HandshakeState::TimedOut => {
                self.handshake = None;
                self.lose_connection();
            }
            _ => {}
        }
    }

    fn tick_duel(&mut self) {
        let Some(runner) = self.duel.as_mut() else {
            self.enter_idle();
            return;
        };
        runner.tick(&mut self.ctx);
        let state = runner.machine().state();
        if !state.is_terminal() {
            return;
        }
        self.duel = None;

        match state {
            DuelState::Won | DuelState::Lost => {
                let won = state == DuelState::Won;
                if won {
                    self.stats.duels_won += 1;
                } else {
                    self.stats.duels_lost += 1;
                }
                self.last_outcome = Some(won);
                self.ctx.feedback().outcome(won);
                self.finalize();

                let now = self.ctx.now_ms();
                self.phase_timer.start(now, self.ctx.config().session.outcome_display_ms);
                self.phase = Phase::Outcome;
            }
            _ => self.lose_connection(),
        }
    }

    fn finalize(&mut self) {
        match self.ctx.matches.finalize_match() {
            Ok(slot) => {
                self.pending_finalize = false;
                info!("match stored in slot {}", slot);
            }
            Err(MatchError::StorageFull { stored, capacity }) => {
                if !self.pending_finalize {
                    warn!("history full ({}/{}), will retry when idle", stored, capacity);
                }
                self.pending_finalize = true;
                self.stats.finalize_deferred += 1;
            }
            Err(err) => {
                error!("dropping match: {}", err);
                self.pending_finalize = false;
                self.ctx.matches.clear_current_match();
            }
        }
    }

    fn lose_connection(&mut self) {
        warn!("connection lost, abandoning match");
        self.stats.connections_lost += 1;
        self.ctx.matches.clear_current_match();
        self.ctx.feedback().connection_lost();

        let now = self.ctx.now_ms();
        self.phase_timer.start(now, self.ctx.config().session.connection_lost_ms);
        self.phase = Phase::ConnectionLost;
    }

    fn enter_idle(&mut self) {
        info!("session idle");
        self.phase = Phase::Idle;
        if self.pending_finalize {
            self.finalize();
        }
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Handshake state while one is running.
    #[must_use]
    pub fn handshake_state(&self) -> Option<HandshakeState> {
        self.handshake.as_ref().map(|runner| runner.machine().state())
    }

    /// Duel state while one is running.
    #[must_use]
    pub fn duel_state(&self) -> Option<DuelState> {
        self.duel.as_ref().map(|runner| runner.machine().state())
    }

    /// Verdict of the most recent duel.
    #[must_use]
    pub const fn last_outcome(&self) -> Option<bool> {
        self.last_outcome
    }

    /// True while a decided match is waiting for room in history.
    #[must_use]
    pub const fn has_pending_finalize(&self) -> bool {
        self.pending_finalize
    }

    /// Session counters.
    #[must_use]
    pub const fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// The device context.
    #[must_use]
    pub const fn context(&self) -> &DeviceContext<R, S> {
        &self.ctx
    }

    /// The device context, mutably.
    pub fn context_mut(&mut self) -> &mut DeviceContext<R, S> {
        &mut self.ctx
    }
}

#[cfg(test)]
mod tests {
    use quickdraw_transport::{LinkConditions, SimulatedAir, SimulatedRadio};

    use super::*;
    use crate::clock::ManualClock;
    use crate::config::QuickdrawConfig;
    use crate::storage::MemoryStorage;

    const HUNTER: MacAddress = MacAddress([0x40, 0, 0, 0, 0, 1]);

    fn session(config: QuickdrawConfig) -> (ManualClock, Quickdraw<SimulatedRadio, MemoryStorage>) {
        let clock = ManualClock::new(0);
        let air = SimulatedAir::new(5, LinkConditions::PERFECT);
        let (radio, events) = air.attach(HUNTER);
        let (ctx, _buttons) = DeviceContext::new(
            "h001",
            radio,
            events,
            MemoryStorage::default(),
            Box::new(clock.clone()),
            config,
            1,
        );
        (clock, Quickdraw::new(ctx))
    }

    #[test]
    fn test_begin_duel_only_from_idle() {
        let (_clock, mut qd) = session(QuickdrawConfig::default());
        assert!(qd.begin_duel(Role::Hunter, MacAddress::UNSPECIFIED));
        assert_eq!(qd.phase(), Phase::Handshake);
        assert_eq!(qd.handshake_state(), Some(HandshakeState::Initiate));
        assert!(!qd.begin_duel(Role::Hunter, MacAddress::UNSPECIFIED));
    }

    #[test]
    fn test_lonely_handshake_times_out_then_idles() {
        let mut config = QuickdrawConfig::default();
        config.handshake.timeout_ms = 1000;
        config.session.connection_lost_ms = 200;
        let (clock, mut qd) = session(config);
        qd.begin_duel(Role::Hunter, MacAddress::UNSPECIFIED);

        for _ in 0..11 {
            clock.advance(100);
            qd.tick();
        }
        assert_eq!(qd.phase(), Phase::ConnectionLost);
        assert_eq!(qd.stats().connections_lost, 1);
        assert!(!qd.context().matches.has_active_match());
        assert!(!qd.context().protocol.has_listener());

        clock.advance(200);
        qd.tick();
        assert_eq!(qd.phase(), Phase::ConnectionLost);
        clock.advance(1);
        qd.tick();
        assert_eq!(qd.phase(), Phase::Idle);
        assert!(qd.begin_duel(Role::Hunter, MacAddress::UNSPECIFIED));
    }

    #[test]
    fn test_leftover_match_blocks_new_duel() {
        let (_clock, mut qd) = session(QuickdrawConfig::default());
        qd.context_mut().matches.create_match("m", "h001", "b002");
        assert!(!qd.begin_duel(Role::Hunter, MacAddress::UNSPECIFIED));
        assert_eq!(qd.phase(), Phase::Idle);
    }
}
