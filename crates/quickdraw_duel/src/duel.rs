//! # Duel Sequence
//!
//! Countdown, race, result exchange and verdict.
//!
//! ```text
//! Countdown --> Duel --+--(result in)--> DuelReceivedResult --+
//!                      |                                      +--> DuelResult --> Won | Lost
//!                      +--(pressed)----> DuelPushed ----------+
//!                      |
//!                      +--(neither, 4 s)--> TimedOut
//! ```
//!
//! ## Grace periods
//!
//! Each side only knows its own press for sure. After pressing, a device
//! waits `pushed_grace_ms` for the opponent's result and then assumes they
//! never pressed. After receiving the opponent's result first, it waits
//! `received_grace_ms` for a local press and otherwise records a pity time
//! (time since the race started) and tells the opponent it never pressed.
//!
//! ## Late final acks
//!
//! The hunter leaves the handshake as soon as it has sent HUNTER_READY. If
//! that packet is lost the bounty keeps resending its final ack, so the
//! hunter's countdown keeps answering each one with another HUNTER_READY.
//!
//! A command the transport refuses is retried on every tick until it goes
//! out.

use quickdraw_transport::Radio;
use tracing::{debug, info};

use crate::clock::Timer;
use crate::config::DuelConfig;
use crate::context::{Button, DeviceContext};
use crate::fsm::{Sequence, Transition};
use crate::match_record::Role;
use crate::protocol::{CommandCode, Listener};
use crate::storage::Storage;

/// Countdown stages, in display order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CountdownStage {
    /// First stage.
    Three,
    /// Second stage.
    Two,
    /// Third stage.
    One,
    /// Draw!
    Battle,
}

impl CountdownStage {
    /// Stage that follows this one, `None` after `Battle`.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Three => Some(Self::Two),
            Self::Two => Some(Self::One),
            Self::One => Some(Self::Battle),
            Self::Battle => None,
        }
    }
}

/// Duel states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DuelState {
    /// THREE, TWO, ONE, BATTLE.
    Countdown,
    /// Race is on.
    Duel,
    /// Pressed first, waiting for the opponent's result.
    DuelPushed,
    /// Opponent's result came first, waiting for the local press.
    DuelReceivedResult,
    /// Both sides resolved.
    DuelResult,
    /// Local player won.
    Won,
    /// Local player lost.
    Lost,
    /// Nobody pressed and nothing arrived.
    TimedOut,
}

impl DuelState {
    /// True for states the sequence never leaves.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Won | Self::Lost | Self::TimedOut)
    }
}

/// Duel state sequence.
pub struct DuelSequence {
    state: DuelState,
    config: DuelConfig,
    timer: Timer,
    listener: Option<Listener>,
    stage: CountdownStage,
    countdown_done: bool,
    pressed: bool,
    received: bool,
    results_in: bool,
    pity_sent: bool,
    timed_out: bool,
    won: Option<bool>,
    unsent: Option<CommandCode>,
}

impl DuelSequence {
    /// Creates a sequence starting at the countdown.
    #[must_use]
    pub fn new(config: DuelConfig) -> Self {
        Self {
            state: DuelState::Countdown,
            config,
            timer: Timer::default(),
            listener: None,
            stage: CountdownStage::Three,
            countdown_done: false,
            pressed: false,
            received: false,
            results_in: false,
            pity_sent: false,
            timed_out: false,
            won: None,
            unsent: None,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> DuelState {
        self.state
    }

    /// Countdown stage last shown.
    #[must_use]
    pub const fn stage(&self) -> CountdownStage {
        self.stage
    }

    /// Verdict, once decided.
    #[must_use]
    pub const fn won(&self) -> Option<bool> {
        self.won
    }

    fn countdown_finished(&self) -> bool {
        self.countdown_done
    }

    fn result_received(&self) -> bool {
        self.received
    }

    fn button_pressed(&self) -> bool {
        self.pressed
    }

    fn race_timed_out(&self) -> bool {
        self.timed_out
    }

    fn resolved(&self) -> bool {
        self.results_in || self.pity_sent
    }

    fn verdict_won(&self) -> bool {
        self.won == Some(true)
    }

    fn verdict_lost(&self) -> bool {
        self.won == Some(false)
    }

    fn show_stage<R: Radio, S: Storage>(&mut self, ctx: &mut DeviceContext<R, S>, stage: CountdownStage) {
        self.stage = stage;
        debug!("countdown {:?}", stage);
        ctx.feedback().countdown_stage(stage);
        ctx.feedback()
            .haptic_pulse(self.config.haptic_pulse_ms, self.config.haptic_intensity);
    }

    /// Pulls the duel flags out of the match manager so predicates can see them.
    fn sync_flags<R: Radio, S: Storage>(&mut self, ctx: &DeviceContext<R, S>) {
        let duel = ctx.matches.duel_state();
        self.pressed = duel.has_pressed_button;
        self.received = duel.has_received_draw_result;
        self.results_in = ctx.matches.match_results_are_in();
    }

    fn drain_results<R: Radio, S: Storage>(&self, ctx: &mut DeviceContext<R, S>) {
        let Some(listener) = &self.listener else {
            return;
        };
        for command in listener.drain() {
            if !ctx.matches.listen_for_match_results(&command) {
                debug!("duel ignoring {:?}", command.code);
            }
        }
    }

    /// Command still owed to the opponent after a refused send.
    #[must_use]
    pub const fn unsent(&self) -> Option<CommandCode> {
        self.unsent
    }

    fn send_or_hold<R: Radio, S: Storage>(&mut self, ctx: &mut DeviceContext<R, S>, code: CommandCode) {
        if ctx.send_command(code) {
            self.unsent = None;
        } else {
            self.unsent = Some(code);
        }
    }

    fn retry_unsent<R: Radio, S: Storage>(&mut self, ctx: &mut DeviceContext<R, S>) {
        if let Some(code) = self.unsent {
            if ctx.send_command(code) {
                debug!("{:?} went out on retry", code);
                self.unsent = None;
            }
        }
    }

    /// Records the first press of the drawing button and reports it.
    fn handle_presses<R: Radio, S: Storage>(&mut self, ctx: &mut DeviceContext<R, S>) {
        let required = Button::for_role(ctx.role());
        for press in ctx.take_presses() {
            if press.button != required {
                continue;
            }
            if ctx.matches.record_button_press(press.at_ms).is_some() {
                self.send_or_hold(ctx, CommandCode::DrawResult);
            }
        }
    }

    /// Hunter side: every final ack for the active match that still
    /// arrives gets another HUNTER_READY.
    fn answer_final_acks<R: Radio, S: Storage>(&mut self, ctx: &mut DeviceContext<R, S>) {
        let Some(listener) = &self.listener else {
            return;
        };
        let commands = listener.drain();
        for command in commands {
            let ours = ctx
                .matches
                .active_match()
                .is_some_and(|m| m.match_id() == command.match_record.match_id());
            if ctx.role() == Role::Hunter && command.code == CommandCode::BountyFinalAck && ours {
                debug!("final ack repeated by {}, answering again", command.sender);
                self.send_or_hold(ctx, CommandCode::HunterReady);
            } else {
                debug!("countdown ignoring {:?}", command.code);
            }
        }
    }

    fn countdown_loop<R: Radio, S: Storage>(&mut self, ctx: &mut DeviceContext<R, S>, now: u64) {
        self.answer_final_acks(ctx);

        let required = Button::for_role(ctx.role());
        for press in ctx.take_presses() {
            if press.button == required {
                ctx.matches.register_early_press();
            }
        }

        if !self.timer.expired(now) {
            return;
        }
        match self.stage.next() {
            Some(CountdownStage::Battle) => {
                self.timer.invalidate();
                self.show_stage(ctx, CountdownStage::Battle);
                self.countdown_done = true;
            }
            Some(stage) => {
                self.timer.start(now, self.config.countdown_stage_ms);
                self.show_stage(ctx, stage);
            }
            None => self.countdown_done = true,
        }
    }

    fn received_result_loop<R: Radio, S: Storage>(&mut self, ctx: &mut DeviceContext<R, S>, now: u64) {
        self.handle_presses(ctx);
        if ctx.matches.duel_state().has_pressed_button {
            self.timer.invalidate();
            return;
        }
        if self.timer.expired(now) {
            self.timer.invalidate();
            let pity = ctx.matches.elapsed_since_start(now);
            info!("no press within grace, recording pity time {} ms", pity);
            ctx.matches.set_own_draw_time(pity);
            ctx.matches.set_never_pressed();
            self.send_or_hold(ctx, CommandCode::NeverPressed);
            self.pity_sent = true;
        }
    }

    fn release_listener<R: Radio, S: Storage>(&mut self, ctx: &mut DeviceContext<R, S>) {
        if let Some(listener) = self.listener.take() {
            ctx.protocol.remove_listener(listener.token());
        }
    }
}

impl<R: Radio + 'static, S: Storage + 'static> Sequence<DeviceContext<R, S>> for DuelSequence {
    type State = DuelState;

    const NAME: &'static str = "duel";

    const TRANSITIONS: &'static [Transition<DuelState, Self>] = &[
        Transition { from: DuelState::Countdown, when: Self::countdown_finished, to: DuelState::Duel },
        Transition { from: DuelState::Duel, when: Self::result_received, to: DuelState::DuelReceivedResult },
        Transition { from: DuelState::Duel, when: Self::button_pressed, to: DuelState::DuelPushed },
        Transition { from: DuelState::Duel, when: Self::race_timed_out, to: DuelState::TimedOut },
        Transition { from: DuelState::DuelPushed, when: Self::resolved, to: DuelState::DuelResult },
        Transition { from: DuelState::DuelReceivedResult, when: Self::resolved, to: DuelState::DuelResult },
        Transition { from: DuelState::DuelResult, when: Self::verdict_won, to: DuelState::Won },
        Transition { from: DuelState::DuelResult, when: Self::verdict_lost, to: DuelState::Lost },
    ];

    fn state(&self) -> DuelState {
        self.state
    }

    fn set_state(&mut self, state: DuelState) {
        self.state = state;
    }

    fn on_mounted(&mut self, ctx: &mut DeviceContext<R, S>) {
        let now = ctx.now_ms();
        match self.state {
            DuelState::Countdown => {
                self.countdown_done = false;
                self.listener = Some(ctx.protocol.install_listener());
                self.timer.start(now, self.config.countdown_stage_ms);
                self.show_stage(ctx, CountdownStage::Three);
            }
            DuelState::Duel => {
                ctx.matches.start_duel(now);
                self.listener = Some(ctx.protocol.install_listener());
                self.timer.start(now, self.config.duel_timeout_ms);
            }
            DuelState::DuelPushed => {
                self.listener = Some(ctx.protocol.install_listener());
                self.timer.start(now, self.config.pushed_grace_ms);
                self.sync_flags(ctx);
            }
            DuelState::DuelReceivedResult => {
                self.timer.start(now, self.config.received_grace_ms);
                self.sync_flags(ctx);
            }
            DuelState::DuelResult => {
                let won = ctx.matches.did_win();
                info!("duel decided: {}", if won { "won" } else { "lost" });
                self.won = Some(won);
            }
            DuelState::Won | DuelState::Lost | DuelState::TimedOut => {}
        }
    }

    fn on_loop(&mut self, ctx: &mut DeviceContext<R, S>) {
        let now = ctx.now_ms();
        if !self.state.is_terminal() {
            self.retry_unsent(ctx);
        }
        match self.state {
            DuelState::Countdown => self.countdown_loop(ctx, now),
            DuelState::Duel => {
                self.drain_results(ctx);
                self.handle_presses(ctx);
                self.sync_flags(ctx);
                if !self.pressed && !self.received && self.timer.expired(now) {
                    info!("nobody drew within {} ms", self.config.duel_timeout_ms);
                    self.timed_out = true;
                }
            }
            DuelState::DuelPushed => {
                self.drain_results(ctx);
                if !ctx.matches.duel_state().has_received_draw_result && self.timer.expired(now) {
                    self.timer.invalidate();
                    info!("no result from opponent, assuming they never pressed");
                    ctx.matches.set_never_pressed();
                }
                self.sync_flags(ctx);
            }
            DuelState::DuelReceivedResult => {
                self.received_result_loop(ctx, now);
                self.sync_flags(ctx);
            }
            DuelState::DuelResult | DuelState::Won | DuelState::Lost | DuelState::TimedOut => {}
        }
    }

    fn on_dismounted(&mut self, ctx: &mut DeviceContext<R, S>) {
        self.release_listener(ctx);
        self.timer.invalidate();
    }
}
