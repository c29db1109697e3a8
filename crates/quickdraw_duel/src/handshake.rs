//! # Handshake Sequence
//!
//! Establishes the link and the shared match before a duel.
//!
//! ## States
//!
//! ```text
//!                       +--(bounty)--> BountySendConnectionConfirmed --+
//! Initiate --(settle)---+                                              +--> ConnectionSuccessful
//!                       +--(hunter)--> HunterSendId -------------------+
//!
//! any state --(watchdog expired)--> TimedOut
//! ```
//!
//! ## Exchange
//!
//! ```text
//! BOUNTY                                HUNTER
//!   |--- CONNECTION_CONFIRMED --------->|  hunter creates the match
//!   |<-- HUNTER_RECEIVE_MATCH ----------|
//!   |--- BOUNTY_FINAL_ACK ------------->|
//!   |<-- HUNTER_READY ------------------|
//! ```
//!
//! ## Escalation
//!
//! One watchdog spans the whole sequence. Underneath it, the bounty resends
//! its final ack every `final_ack_retry_ms` while waiting for HUNTER_READY,
//! at most three times. Running out of resends does not fail the handshake;
//! it just leaves the watchdog to decide.
//!
//! A send the transport refuses is not a resend. The bounty tries the final
//! ack again after `send_delay_ms`; the hunter repeats its reply on the
//! next tick and only counts as connected once HUNTER_READY went out.

use quickdraw_transport::Radio;
use tracing::{debug, info, warn};

use crate::clock::Timer;
use crate::config::HandshakeConfig;
use crate::context::DeviceContext;
use crate::fsm::{Sequence, Transition};
use crate::match_record::Role;
use crate::protocol::{CommandCode, DuelCommand, Listener};
use crate::storage::Storage;

/// Hard ceiling on final-ack resends, whatever the config says.
pub const FINAL_ACK_RETRY_CEILING: u8 = 3;

/// Handshake states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    /// Arms the watchdog and waits for the radio to settle.
    Initiate,
    /// Bounty path.
    BountySendConnectionConfirmed,
    /// Hunter path.
    HunterSendId,
    /// Both sides have the match; hand off to the duel.
    ConnectionSuccessful,
    /// Watchdog fired; give up.
    TimedOut,
}

impl HandshakeState {
    /// True for states the sequence never leaves.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::ConnectionSuccessful | Self::TimedOut)
    }
}

/// Handshake state sequence.
pub struct HandshakeSequence {
    state: HandshakeState,
    role: Role,
    config: HandshakeConfig,
    watchdog: Timer,
    settle: Timer,
    step: Timer,
    listener: Option<Listener>,
    settled: bool,
    timed_out: bool,
    connected: bool,
    connection_confirmed_sent: bool,
    waiting_for_hunter_ready: bool,
    final_ack_unsent: bool,
    final_ack_retries: u8,
    unsent_reply: Option<CommandCode>,
}

impl HandshakeSequence {
    /// Creates a sequence for `role`, starting in `Initiate`.
    #[must_use]
    pub fn new(role: Role, config: HandshakeConfig) -> Self {
        Self {
            state: HandshakeState::Initiate,
            role,
            config,
            watchdog: Timer::default(),
            settle: Timer::default(),
            step: Timer::default(),
            listener: None,
            settled: false,
            timed_out: false,
            connected: false,
            connection_confirmed_sent: false,
            waiting_for_hunter_ready: false,
            final_ack_unsent: false,
            final_ack_retries: 0,
            unsent_reply: None,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> HandshakeState {
        self.state
    }

    /// Final-ack resends so far.
    #[must_use]
    pub const fn final_ack_retries(&self) -> u8 {
        self.final_ack_retries
    }

    /// True while the bounty is waiting for HUNTER_READY.
    #[must_use]
    pub const fn is_waiting_for_hunter_ready(&self) -> bool {
        self.waiting_for_hunter_ready
    }

    fn max_final_ack_retries(&self) -> u8 {
        self.config.final_ack_max_retries.min(FINAL_ACK_RETRY_CEILING)
    }

    fn route_bounty(&self) -> bool {
        self.settled && self.role == Role::Bounty
    }

    fn route_hunter(&self) -> bool {
        self.settled && self.role == Role::Hunter
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn is_timed_out(&self) -> bool {
        self.timed_out
    }

    fn drain_listener(&self) -> Vec<DuelCommand> {
        self.listener.as_ref().map(Listener::drain).unwrap_or_default()
    }

    fn bounty_loop<R: Radio, S: Storage>(&mut self, ctx: &mut DeviceContext<R, S>, now: u64) {
        if !self.connection_confirmed_sent && self.step.expired(now) {
            self.step.invalidate();
            self.connection_confirmed_sent = ctx.send_command(CommandCode::ConnectionConfirmed);
            if !self.connection_confirmed_sent {
                // Try again after another send delay.
                self.step.start(now, self.config.send_delay_ms);
            }
        }

        for command in self.drain_listener() {
            match command.code {
                CommandCode::HunterReceiveMatch => {
                    if !ctx.matches.adopt_hunter_id(&command.match_record) {
                        warn!("HUNTER_RECEIVE_MATCH for unknown match {}", command.match_record.match_id());
                        continue;
                    }
                    info!("hunter {} joined, sending final ack", command.match_record.hunter_id());
                    ctx.set_opponent(command.sender);
                    self.waiting_for_hunter_ready = true;
                    self.final_ack_retries = 0;
                    self.send_final_ack(ctx, now);
                }
                CommandCode::HunterReady if self.waiting_for_hunter_ready => {
                    info!("hunter ready");
                    self.waiting_for_hunter_ready = false;
                    self.step.invalidate();
                    self.connected = true;
                }
                other => debug!("bounty handshake ignoring {:?}", other),
            }
        }

        if self.waiting_for_hunter_ready && self.step.expired(now) {
            if self.final_ack_unsent {
                self.send_final_ack(ctx, now);
            } else if self.final_ack_retries < self.max_final_ack_retries() {
                self.final_ack_retries += 1;
                warn!("no HUNTER_READY, resending final ack ({})", self.final_ack_retries);
                self.send_final_ack(ctx, now);
            } else {
                warn!("final ack retries exhausted, waiting on watchdog");
                self.step.invalidate();
            }
        }
    }

    /// Sends the final ack and arms the next wait: the resend interval if
    /// it went out, the send delay if the transport refused it.
    fn send_final_ack<R: Radio, S: Storage>(&mut self, ctx: &mut DeviceContext<R, S>, now: u64) {
        if ctx.send_command(CommandCode::BountyFinalAck) {
            self.final_ack_unsent = false;
            self.step.start(now, self.config.final_ack_retry_ms);
        } else {
            self.final_ack_unsent = true;
            self.step.start(now, self.config.send_delay_ms);
        }
    }

    fn hunter_reply<R: Radio, S: Storage>(&mut self, ctx: &mut DeviceContext<R, S>, code: CommandCode) {
        if !ctx.send_command(code) {
            self.unsent_reply = Some(code);
            return;
        }
        self.unsent_reply = None;
        if code == CommandCode::HunterReady {
            self.connected = true;
        }
    }

    fn hunter_loop<R: Radio, S: Storage>(&mut self, ctx: &mut DeviceContext<R, S>) {
        if let Some(code) = self.unsent_reply {
            debug!("retrying {:?}", code);
            self.hunter_reply(ctx, code);
        }

        for command in self.drain_listener() {
            match command.code {
                CommandCode::ConnectionConfirmed => {
                    ctx.set_opponent(command.sender);
                    let offered = &command.match_record;
                    let known = ctx
                        .matches
                        .active_match()
                        .is_some_and(|m| m.match_id() == offered.match_id());
                    if !known {
                        let own_id = ctx.player_id().to_owned();
                        if ctx
                            .matches
                            .create_match(offered.match_id(), &own_id, offered.bounty_id())
                            .is_none()
                        {
                            continue;
                        }
                    }
                    info!("bounty {} confirmed match {}", offered.bounty_id(), offered.match_id());
                    self.hunter_reply(ctx, CommandCode::HunterReceiveMatch);
                }
                CommandCode::BountyFinalAck if ctx.matches.has_active_match() => {
                    self.hunter_reply(ctx, CommandCode::HunterReady);
                }
                other => debug!("hunter handshake ignoring {:?}", other),
            }
        }
    }

    fn release_listener<R: Radio, S: Storage>(&mut self, ctx: &mut DeviceContext<R, S>) {
        if let Some(listener) = self.listener.take() {
            ctx.protocol.remove_listener(listener.token());
        }
    }
}

impl<R: Radio + 'static, S: Storage + 'static> Sequence<DeviceContext<R, S>> for HandshakeSequence {
    type State = HandshakeState;

    const NAME: &'static str = "handshake";

    const TRANSITIONS: &'static [Transition<HandshakeState, Self>] = &[
        Transition { from: HandshakeState::Initiate, when: Self::is_timed_out, to: HandshakeState::TimedOut },
        Transition { from: HandshakeState::Initiate, when: Self::route_bounty, to: HandshakeState::BountySendConnectionConfirmed },
        Transition { from: HandshakeState::Initiate, when: Self::route_hunter, to: HandshakeState::HunterSendId },
        Transition { from: HandshakeState::BountySendConnectionConfirmed, when: Self::is_connected, to: HandshakeState::ConnectionSuccessful },
        Transition { from: HandshakeState::BountySendConnectionConfirmed, when: Self::is_timed_out, to: HandshakeState::TimedOut },
        Transition { from: HandshakeState::HunterSendId, when: Self::is_connected, to: HandshakeState::ConnectionSuccessful },
        Transition { from: HandshakeState::HunterSendId, when: Self::is_timed_out, to: HandshakeState::TimedOut },
    ];

    fn state(&self) -> HandshakeState {
        self.state
    }

    fn set_state(&mut self, state: HandshakeState) {
        self.state = state;
    }

    fn on_mounted(&mut self, ctx: &mut DeviceContext<R, S>) {
        let now = ctx.now_ms();
        match self.state {
            HandshakeState::Initiate => {
                self.watchdog.start(now, self.config.timeout_ms);
                self.settle.start(now, self.config.settle_ms);
            }
            HandshakeState::BountySendConnectionConfirmed => {
                self.listener = Some(ctx.protocol.install_listener());
                if !ctx.matches.has_active_match() {
                    let match_id = ctx.generate_match_id();
                    let own_id = ctx.player_id().to_owned();
                    ctx.matches.create_match(&match_id, "", &own_id);
                }
                self.connection_confirmed_sent = false;
                self.step.start(now, self.config.send_delay_ms);
            }
            HandshakeState::HunterSendId => {
                self.listener = Some(ctx.protocol.install_listener());
            }
            HandshakeState::ConnectionSuccessful | HandshakeState::TimedOut => {
                self.release_listener(ctx);
                self.watchdog.invalidate();
                self.settle.invalidate();
                self.step.invalidate();
                self.waiting_for_hunter_ready = false;
            }
        }
    }

    fn on_loop(&mut self, ctx: &mut DeviceContext<R, S>) {
        let now = ctx.now_ms();
        if self.state.is_terminal() {
            return;
        }
        if self.watchdog.expired(now) {
            if !self.timed_out {
                warn!("handshake watchdog expired in {:?}", self.state);
            }
            self.timed_out = true;
        }

        match self.state {
            HandshakeState::Initiate => self.settled = self.settle.expired(now),
            HandshakeState::BountySendConnectionConfirmed => self.bounty_loop(ctx, now),
            HandshakeState::HunterSendId => self.hunter_loop(ctx),
            HandshakeState::ConnectionSuccessful | HandshakeState::TimedOut => {}
        }
    }

    fn on_dismounted(&mut self, ctx: &mut DeviceContext<R, S>) {
        self.release_listener(ctx);
        self.settle.invalidate();
        self.step.invalidate();
    }
}
