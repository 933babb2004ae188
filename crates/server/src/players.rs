// Player directory: which players are currently recording, plus the
// per-player stat and personal-best writes made at finalization.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chronicle_common::types::{normalize_name, ChallengeMode, ChallengeType, SplitType};
use tracing::warn;
use uuid::Uuid;

use crate::store::{ChallengeStore, PlayerStatsDelta};

/// Tracks which player names are currently recording in a challenge and
/// routes stat/personal-best writes to the store.
pub struct PlayerDirectory {
    store: Arc<dyn ChallengeStore>,
    /// Normalized player name -> challenge currently being recorded.
    active: Mutex<HashMap<String, Uuid>>,
}

impl PlayerDirectory {
    pub fn new(store: Arc<dyn ChallengeStore>) -> Self {
        Self { store, active: Mutex::new(HashMap::new()) }
    }

    fn active(&self) -> MutexGuard<'_, HashMap<String, Uuid>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Mark a player as recording in a challenge. A player already
    /// recording elsewhere keeps their existing entry untouched.
    pub fn begin_recording(&self, player: &str, challenge_id: Uuid) {
        self.active().entry(normalize_name(player)).or_insert(challenge_id);
    }

    /// Release a player from the currently-recording index, but only if
    /// they are recorded against the given challenge.
    pub fn end_recording(&self, player: &str, challenge_id: Uuid) {
        let mut active = self.active();
        if active.get(&normalize_name(player)) == Some(&challenge_id) {
            active.remove(&normalize_name(player));
        }
    }

    /// Challenge this player is currently recording in, if any.
    pub fn active_challenge(&self, player: &str) -> Option<Uuid> {
        self.active().get(&normalize_name(player)).copied()
    }

    /// Apply finalization stat deltas for one player. Write failures are
    /// logged, not retried.
    pub fn record_stats(&self, player: &str, delta: PlayerStatsDelta) {
        if let Err(error) = self.store.record_player_stats(&normalize_name(player), delta) {
            warn!(player, error = %error, "failed to record player stats");
        }
    }

    /// Record a personal best. Write failures are logged, not retried.
    pub fn record_personal_best(
        &self,
        player: &str,
        challenge: ChallengeType,
        mode: Option<ChallengeMode>,
        split: SplitType,
        ticks: u32,
    ) {
        if let Err(error) =
            self.store.record_personal_best(&normalize_name(player), challenge, mode, split, ticks)
        {
            warn!(player, error = %error, "failed to record personal best");
        }
    }
}
