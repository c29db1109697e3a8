//! # Sequence Runner
//!
//! A sequence is a tagged union of states plus a fixed transition table:
//!
//! ```text
//! (from, predicate, to)
//! (from, predicate, to)
//! ...
//! ```
//!
//! Each tick the current state's loop runs first, then the table is scanned
//! in order and the first row whose `from` matches and whose predicate holds
//! wins. At most one transition commits per tick: dismount the old state,
//! switch, mount the new one.
//!
//! Predicates take only the sequence itself. Anything they depend on (timer
//! expiry, received commands) is folded into sequence fields by the loop.

use std::fmt;

use tracing::info;

/// One row of a transition table.
pub struct Transition<S, M> {
    /// State the row applies to.
    pub from: S,
    /// Guard, polled once per tick.
    pub when: fn(&M) -> bool,
    /// State to enter when the guard holds.
    pub to: S,
}

/// Lifecycle of a state sequence running against a context `C`.
pub trait Sequence<C>: Sized + 'static {
    /// State tag.
    type State: Copy + Eq + fmt::Debug + 'static;

    /// Sequence name for logs.
    const NAME: &'static str;

    /// Transition table, in priority order.
    const TRANSITIONS: &'static [Transition<Self::State, Self>];

    /// Current state.
    fn state(&self) -> Self::State;

    /// Switches the tag. Only the runner calls this.
    fn set_state(&mut self, state: Self::State);

    /// Entered a state.
    fn on_mounted(&mut self, ctx: &mut C);

    /// Once per tick while in a state.
    fn on_loop(&mut self, ctx: &mut C);

    /// Leaving a state.
    fn on_dismounted(&mut self, ctx: &mut C);
}

/// Drives a [`Sequence`].
pub struct Runner<M> {
    machine: M,
    ticks: u64,
    stopped: bool,
}

impl<M> Runner<M> {
    /// Mounts the sequence's initial state and returns the runner.
    pub fn start<C>(mut machine: M, ctx: &mut C) -> Self
    where
        M: Sequence<C>,
    {
        info!("{}: start in {:?}", M::NAME, machine.state());
        machine.on_mounted(ctx);
        Self {
            machine,
            ticks: 0,
            stopped: false,
        }
    }

    /// Runs one tick. Returns the new state if a transition committed.
    pub fn tick<C>(&mut self, ctx: &mut C) -> Option<M::State>
    where
        M: Sequence<C>,
    {
        if self.stopped {
            return None;
        }
        self.ticks += 1;
        self.machine.on_loop(ctx);

        let current = self.machine.state();
        let next = M::TRANSITIONS
            .iter()
            .find(|row| row.from == current && (row.when)(&self.machine))
            .map(|row| row.to)?;

        self.machine.on_dismounted(ctx);
        self.machine.set_state(next);
        info!("{}: {:?} -> {:?} at tick {}", M::NAME, current, next, self.ticks);
        self.machine.on_mounted(ctx);
        Some(next)
    }

    /// Dismounts the current state. Further ticks do nothing.
    pub fn stop<C>(&mut self, ctx: &mut C)
    where
        M: Sequence<C>,
    {
        if !self.stopped {
            self.machine.on_dismounted(ctx);
            self.stopped = true;
        }
    }

    /// The sequence.
    pub const fn machine(&self) -> &M {
        &self.machine
    }

    /// Ticks run so far.
    pub const fn ticks(&self) -> u64 {
        self.ticks
    }
}
