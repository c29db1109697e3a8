//! # Match Manager
//!
//! Owns the device's single [`ActiveDuelState`] and the persisted match
//! history.
//!
//! ## Invariants
//!
//! - At most one active match. `create_match` and `receive_match` return
//!   `None` while one is held.
//! - A draw time of 0 means "not recorded" and is never stored as a
//!   measurement.
//! - Results are only "in" once the local player has pressed.
//!
//! ## Storage Layout
//!
//! ```text
//! "count"    -> u8, number of stored matches
//! "match_0"  -> 55 byte match record
//! "match_1"  -> ...
//! ```

use tracing::{debug, info, warn};

use crate::error::{MatchError, MatchResult};
use crate::match_record::{Match, Role};
use crate::protocol::{CommandCode, DuelCommand};
use crate::storage::Storage;

/// Storage key holding the number of stored matches.
pub const COUNT_KEY: &str = "count";

/// Storage key for the `index`th stored match.
#[must_use]
pub fn match_key(index: usize) -> String {
    format!("match_{index}")
}

/// Per-device race bookkeeping.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ActiveDuelState {
    /// Opponent's draw result has arrived.
    pub has_received_draw_result: bool,
    /// Local player pressed during the race.
    pub has_pressed_button: bool,
    /// Waited out the grace period without an opponent result.
    pub grace_period_expired_no_result: bool,
    /// Local time the race started.
    pub duel_local_start_ms: u64,
    /// Presses during the countdown.
    pub button_masher_count: u32,
    active: Option<Match>,
}

/// Single-active-match arbitration, results and history.
pub struct MatchManager<S: Storage> {
    role: Role,
    duel: ActiveDuelState,
    storage: S,
    max_matches: u8,
    masher_penalty_ms: u32,
}

impl<S: Storage> MatchManager<S> {
    /// Creates a manager over `storage`.
    #[must_use]
    pub fn new(storage: S, max_matches: u8, masher_penalty_ms: u32) -> Self {
        Self {
            role: Role::Hunter,
            duel: ActiveDuelState::default(),
            storage,
            max_matches,
            masher_penalty_ms,
        }
    }

    /// Role the local player has in the current duel.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// Sets the local role. Draw-time helpers use it to tell own from opponent.
    pub fn set_role(&mut self, role: Role) {
        self.role = role;
    }

    /// Race bookkeeping.
    #[must_use]
    pub const fn duel_state(&self) -> &ActiveDuelState {
        &self.duel
    }

    /// The active match.
    #[must_use]
    pub fn active_match(&self) -> Option<&Match> {
        self.duel.active.as_ref()
    }

    /// True while a match is held.
    #[must_use]
    pub const fn has_active_match(&self) -> bool {
        self.duel.active.is_some()
    }

    /// Starts a new match. Returns `None` if one is already active.
    pub fn create_match(&mut self, match_id: &str, hunter_id: &str, bounty_id: &str) -> Option<&Match> {
        if self.duel.active.is_some() {
            warn!("create_match({}) refused: a match is already active", match_id);
            return None;
        }
        info!("created match {} (hunter {}, bounty {})", match_id, hunter_id, bounty_id);
        self.duel.active = Some(Match::new(match_id, hunter_id, bounty_id));
        self.duel.active.as_ref()
    }

    /// Adopts a match built by the other device. Returns `None` if one is
    /// already active.
    pub fn receive_match(&mut self, incoming: Match) -> Option<&Match> {
        if self.duel.active.is_some() {
            warn!("receive_match({}) refused: a match is already active", incoming.match_id());
            return None;
        }
        info!("received match {}", incoming.match_id());
        self.duel.active = Some(incoming);
        self.duel.active.as_ref()
    }

    /// Fills in the hunter's id on the bounty's placeholder match. Ignored
    /// unless `incoming` carries the active match id.
    pub fn adopt_hunter_id(&mut self, incoming: &Match) -> bool {
        match self.duel.active.as_mut() {
            Some(active) if active.match_id() == incoming.match_id() => {
                active.set_hunter_id(incoming.hunter_id());
                true
            }
            _ => false,
        }
    }

    /// Records the hunter's draw time. False without an active match.
    pub fn set_hunter_draw_time(&mut self, ms: u32) -> bool {
        self.set_draw_time(Role::Hunter, ms)
    }

    /// Records the bounty's draw time. False without an active match.
    pub fn set_bounty_draw_time(&mut self, ms: u32) -> bool {
        self.set_draw_time(Role::Bounty, ms)
    }

    /// Records the local draw time. False without an active match.
    pub fn set_own_draw_time(&mut self, ms: u32) -> bool {
        self.set_draw_time(self.role, ms)
    }

    /// Records the opponent's draw time. False without an active match.
    pub fn set_opponent_draw_time(&mut self, ms: u32) -> bool {
        self.set_draw_time(self.role.opponent(), ms)
    }

    fn set_draw_time(&mut self, role: Role, ms: u32) -> bool {
        match self.duel.active.as_mut() {
            Some(active) => {
                active.set_draw_time_ms(role, ms);
                true
            }
            None => false,
        }
    }

    /// Marks the local start of the race.
    pub fn start_duel(&mut self, now_ms: u64) {
        self.duel.duel_local_start_ms = now_ms;
    }

    /// Counts a press during the countdown.
    pub fn register_early_press(&mut self) {
        self.duel.button_masher_count += 1;
        debug!("button mashing: {} early presses", self.duel.button_masher_count);
    }

    /// Milliseconds since the race started locally, clamped to `u32`.
    #[must_use]
    pub fn elapsed_since_start(&self, now_ms: u64) -> u32 {
        let elapsed = now_ms.saturating_sub(self.duel.duel_local_start_ms);
        u32::try_from(elapsed).unwrap_or(u32::MAX)
    }

    /// Records the local press at `pressed_at_ms`, with the masher penalty
    /// applied. Returns the draw time, or `None` if already pressed or no
    /// match is active.
    pub fn record_button_press(&mut self, pressed_at_ms: u64) -> Option<u32> {
        if self.duel.has_pressed_button || self.duel.active.is_none() {
            return None;
        }
        let penalty = self.duel.button_masher_count.saturating_mul(self.masher_penalty_ms);
        let draw_time = self.elapsed_since_start(pressed_at_ms).saturating_add(penalty).max(1);

        self.set_own_draw_time(draw_time);
        self.duel.has_pressed_button = true;
        info!("drew in {} ms ({} ms masher penalty)", draw_time, penalty);
        Some(draw_time)
    }

    /// Applies an inbound command to the race. Only draw results and
    /// never-pressed notices for the active match count; returns true if
    /// this one did.
    pub fn listen_for_match_results(&mut self, command: &DuelCommand) -> bool {
        if !matches!(command.code, CommandCode::DrawResult | CommandCode::NeverPressed) {
            return false;
        }
        let opponent = self.role.opponent();
        let Some(active) = self.duel.active.as_mut() else {
            return false;
        };
        if active.match_id() != command.match_record.match_id() {
            warn!(
                "ignoring {:?} for match {}, active is {}",
                command.code,
                command.match_record.match_id(),
                active.match_id()
            );
            return false;
        }

        let time = command.match_record.draw_time_ms(opponent);
        active.set_draw_time_ms(opponent, time);
        self.duel.has_received_draw_result = true;
        info!("opponent result {:?}: {} ms", command.code, time);
        true
    }

    /// Records that the grace period ran out without an opponent result.
    pub fn set_never_pressed(&mut self) {
        self.duel.grace_period_expired_no_result = true;
    }

    /// True once the local player has pressed and the opponent's side is
    /// resolved, either by a result or by the grace period running out.
    #[must_use]
    pub const fn match_results_are_in(&self) -> bool {
        self.duel.has_pressed_button
            && (self.duel.has_received_draw_result || self.duel.grace_period_expired_no_result)
    }

    /// Did the local player win? False with no active match. A missing
    /// opponent time is a win if the local time is recorded; ties lose.
    #[must_use]
    pub fn did_win(&self) -> bool {
        let Some(active) = self.duel.active.as_ref() else {
            return false;
        };
        let own = active.draw_time_ms(self.role);
        let opponent = active.draw_time_ms(self.role.opponent());

        match (own, opponent) {
            (0, _) => false,
            (_, 0) => true,
            (own, opponent) => own < opponent,
        }
    }

    /// Number of matches in storage.
    #[must_use]
    pub fn stored_match_count(&self) -> usize {
        usize::from(self.storage.read_u8(COUNT_KEY, 0))
    }

    /// Persists the active match and clears the duel state. Returns the
    /// storage slot used.
    ///
    /// # Errors
    ///
    /// - [`MatchError::NoActiveMatch`] without a match.
    /// - [`MatchError::StorageFull`] if the history is at capacity or the
    ///   store refuses the write; the match stays active.
    pub fn finalize_match(&mut self) -> MatchResult<usize> {
        let Some(active) = self.duel.active.as_ref() else {
            return Err(MatchError::NoActiveMatch);
        };

        let stored = self.stored_match_count();
        let full = MatchError::StorageFull {
            stored,
            capacity: usize::from(self.max_matches),
        };
        if stored >= usize::from(self.max_matches) {
            warn!("cannot finalize match {}: history full", active.match_id());
            return Err(full);
        }

        let key = match_key(stored);
        if let Err(err) = self.storage.write(&key, &active.to_bytes()) {
            warn!("cannot finalize match {}: {}", active.match_id(), err);
            return Err(full);
        }
        // stored < max_matches <= 255, so the new count fits.
        #[allow(clippy::cast_possible_truncation)]
        let count = (stored + 1) as u8;
        if let Err(err) = self.storage.write(COUNT_KEY, &[count]) {
            self.storage.remove(&key);
            warn!("cannot finalize match {}: {}", active.match_id(), err);
            return Err(full);
        }

        info!(
            "finalized match {} into slot {} (hunter {} ms, bounty {} ms)",
            active.match_id(),
            stored,
            active.hunter_draw_time_ms(),
            active.bounty_draw_time_ms()
        );
        self.clear_current_match();
        Ok(stored)
    }

    /// Drops the active match and resets the race bookkeeping.
    pub fn clear_current_match(&mut self) {
        self.duel = ActiveDuelState::default();
    }

    /// Reads back every stored match.
    ///
    /// # Errors
    ///
    /// Returns [`MatchError::CorruptRecord`] for a missing or malformed slot.
    pub fn stored_matches(&self) -> MatchResult<Vec<Match>> {
        (0..self.stored_match_count())
            .map(|index| {
                let key = match_key(index);
                self.storage
                    .read(&key)
                    .and_then(|bytes| Match::from_bytes(&bytes))
                    .ok_or(MatchError::CorruptRecord(key))
            })
            .collect()
    }

    /// Deletes the stored history.
    pub fn clear_storage(&mut self) {
        for index in 0..self.stored_match_count() {
            self.storage.remove(&match_key(index));
        }
        self.storage.remove(COUNT_KEY);
        info!("cleared match history");
    }

    /// The underlying store.
    #[must_use]
    pub const fn storage(&self) -> &S {
        &self.storage
    }
}

#[cfg(test)]
mod tests {
    use quickdraw_transport::MacAddress;

    use super::*;
    use crate::storage::MemoryStorage;

    const ID: &str = "0b9e2a44-1c3d-4e5f-8a6b-7c8d9e0f1a2b";

    fn manager(role: Role) -> MatchManager<MemoryStorage> {
        let mut m = MatchManager::new(MemoryStorage::default(), 255, 75);
        m.set_role(role);
        m
    }

    fn result(code: CommandCode, hunter_ms: u32, bounty_ms: u32) -> DuelCommand {
        let mut record = Match::new(ID, "h001", "b002");
        if hunter_ms > 0 {
            record.set_draw_time_ms(Role::Hunter, hunter_ms);
        }
        if bounty_ms > 0 {
            record.set_draw_time_ms(Role::Bounty, bounty_ms);
        }
        DuelCommand {
            sender: MacAddress::new([1, 2, 3, 4, 5, 6]),
            code,
            match_record: record,
        }
    }

    #[test]
    fn test_single_active_match() {
        let mut m = manager(Role::Hunter);
        assert!(m.create_match(ID, "h001", "b002").is_some());
        assert!(m.create_match("other", "h001", "b002").is_none());
        assert!(m.receive_match(Match::new("other", "x", "y")).is_none());
        assert_eq!(m.active_match().unwrap().match_id(), ID);

        m.clear_current_match();
        assert!(!m.has_active_match());
        assert!(m.receive_match(Match::new("other", "x", "y")).is_some());
    }

    #[test]
    fn test_draw_times_need_active_match() {
        let mut m = manager(Role::Hunter);
        assert!(!m.set_hunter_draw_time(100));
        assert!(!m.set_bounty_draw_time(100));
        m.create_match(ID, "h001", "b002");
        assert!(m.set_own_draw_time(100));
        assert!(m.set_opponent_draw_time(0));
        let active = m.active_match().unwrap();
        assert_eq!(active.hunter_draw_time_ms(), 100);
        assert_eq!(active.bounty_draw_time_ms(), 1);
    }

    #[test]
    fn test_did_win_smaller_time() {
        let mut m = manager(Role::Hunter);
        m.create_match(ID, "h001", "b002");
        m.set_hunter_draw_time(120);
        m.set_bounty_draw_time(150);
        assert!(m.did_win());

        m.set_role(Role::Bounty);
        assert!(!m.did_win());
    }

    #[test]
    fn test_did_win_by_default_against_sentinel() {
        let mut m = manager(Role::Hunter);
        m.create_match(ID, "h001", "b002");
        m.set_hunter_draw_time(120);
        assert!(m.did_win());

        let mut b = manager(Role::Bounty);
        b.create_match(ID, "h001", "b002");
        b.set_bounty_draw_time(300);
        assert!(b.did_win());
    }

    #[test]
    fn test_did_win_edge_cases() {
        let mut m = manager(Role::Hunter);
        assert!(!m.did_win());

        m.create_match(ID, "h001", "b002");
        m.set_bounty_draw_time(200);
        assert!(!m.did_win());

        m.set_hunter_draw_time(200);
        assert!(!m.did_win());
    }

    #[test]
    fn test_results_need_local_press() {
        let mut m = manager(Role::Hunter);
        m.create_match(ID, "h001", "b002");
        m.listen_for_match_results(&result(CommandCode::DrawResult, 0, 180));
        m.set_never_pressed();
        assert!(!m.match_results_are_in());

        m.record_button_press(0);
        assert!(m.match_results_are_in());
    }

    #[test]
    fn test_results_in_after_grace_without_result() {
        let mut m = manager(Role::Bounty);
        m.create_match(ID, "h001", "b002");
        m.record_button_press(200);
        assert!(!m.match_results_are_in());
        m.set_never_pressed();
        assert!(m.match_results_are_in());
    }

    #[test]
    fn test_button_press_with_masher_penalty() {
        let mut m = manager(Role::Hunter);
        m.create_match(ID, "h001", "b002");
        m.register_early_press();
        m.register_early_press();
        m.start_duel(1000);

        assert_eq!(m.record_button_press(1200), Some(350));
        assert_eq!(m.record_button_press(1300), None);
        assert_eq!(m.active_match().unwrap().hunter_draw_time_ms(), 350);
        assert!(m.duel_state().has_pressed_button);
    }

    #[test]
    fn test_instant_press_is_not_sentinel() {
        let mut m = manager(Role::Hunter);
        m.create_match(ID, "h001", "b002");
        m.start_duel(500);
        assert_eq!(m.record_button_press(500), Some(1));
    }

    #[test]
    fn test_listen_ignores_other_commands() {
        let mut m = manager(Role::Hunter);
        m.create_match(ID, "h001", "b002");
        assert!(!m.listen_for_match_results(&result(CommandCode::HunterReady, 0, 90)));
        assert!(!m.duel_state().has_received_draw_result);

        assert!(m.listen_for_match_results(&result(CommandCode::NeverPressed, 0, 810)));
        assert_eq!(m.active_match().unwrap().bounty_draw_time_ms(), 810);
        assert!(m.duel_state().has_received_draw_result);
    }

    #[test]
    fn test_listen_ignores_foreign_match() {
        let mut m = manager(Role::Hunter);
        m.create_match("another-match", "h001", "b002");
        assert!(!m.listen_for_match_results(&result(CommandCode::DrawResult, 0, 90)));
    }

    #[test]
    fn test_finalize_persists_and_clears() {
        let mut m = manager(Role::Hunter);
        m.create_match(ID, "h001", "b002");
        m.set_hunter_draw_time(200);
        m.set_bounty_draw_time(300);
        m.record_button_press(0);

        assert_eq!(m.finalize_match(), Ok(0));
        assert!(!m.has_active_match());
        assert_eq!(*m.duel_state(), ActiveDuelState::default());
        assert_eq!(m.stored_match_count(), 1);

        let stored = m.stored_matches().unwrap();
        assert_eq!(stored[0].match_id(), ID);
        assert_eq!(stored[0].hunter_draw_time_ms(), 200);
        assert_eq!(stored[0].bounty_draw_time_ms(), 300);
    }

    #[test]
    fn test_finalize_without_match() {
        let mut m = manager(Role::Hunter);
        assert_eq!(m.finalize_match(), Err(MatchError::NoActiveMatch));
    }

    #[test]
    fn test_finalize_full_history_keeps_match() {
        let mut m = MatchManager::new(MemoryStorage::default(), 2, 75);
        for n in 0..2 {
            m.create_match(&format!("match-{n}"), "h001", "b002");
            m.finalize_match().unwrap();
        }
        m.create_match("match-2", "h001", "b002");
        assert_eq!(
            m.finalize_match(),
            Err(MatchError::StorageFull { stored: 2, capacity: 2 })
        );
        assert!(m.has_active_match());

        m.clear_storage();
        assert_eq!(m.stored_match_count(), 0);
        assert_eq!(m.finalize_match(), Ok(0));
    }

    #[test]
    fn test_finalize_store_refusal_keeps_match() {
        // Room for "match_0" but not "count".
        let mut m = MatchManager::new(MemoryStorage::with_capacity(1), 255, 75);
        m.create_match(ID, "h001", "b002");
        assert!(matches!(m.finalize_match(), Err(MatchError::StorageFull { .. })));
        assert!(m.has_active_match());
        assert!(m.storage().is_empty());
    }

    #[test]
    fn test_adopt_hunter_id() {
        let mut m = manager(Role::Bounty);
        m.create_match(ID, "", "b002");
        assert!(m.adopt_hunter_id(&Match::new(ID, "h001", "b002")));
        assert_eq!(m.active_match().unwrap().hunter_id(), "h001");
        assert!(!m.adopt_hunter_id(&Match::new("nope", "h009", "b002")));
    }
}
