// Persistence contract for challenge records.
//
// The durable backend is an external collaborator; the engine sequences
// writes per challenge and treats a failed write as logged, not retried.
// `MemoryStore` backs tests and local runs.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use chronicle_common::event::ChallengeEvent;
use chronicle_common::types::{
    ChallengeMode, ChallengeStatus, ChallengeType, SplitType, Stage,
};
use uuid::Uuid;

/// A recorded timing split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordedSplit {
    pub split: SplitType,
    pub ticks: u32,
    pub accurate: bool,
}

/// The durable shape of one challenge attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ChallengeRecord {
    pub id: Uuid,
    pub challenge: ChallengeType,
    pub mode: Option<ChallengeMode>,
    /// Display-ordered party.
    pub party: Vec<String>,
    pub status: ChallengeStatus,
    pub stage: Stage,
    pub challenge_ticks: u32,
    pub overall_ticks: Option<u32>,
    pub splits: Vec<RecordedSplit>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Per-challenge stat deltas applied to a player at finalization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlayerStatsDelta {
    pub completions: u32,
    pub resets: u32,
    pub wipes: u32,
    pub deaths: u32,
}

/// Durable challenge store contract.
///
/// Operations are not assumed transactional across each other; callers
/// sequence them per challenge.
pub trait ChallengeStore: Send + Sync {
    fn create_challenge(&self, record: ChallengeRecord) -> Result<()>;
    fn update_challenge(
        &self,
        id: Uuid,
        mutator: &mut dyn FnMut(&mut ChallengeRecord),
    ) -> Result<()>;
    fn delete_challenge(&self, id: Uuid) -> Result<()>;
    fn append_stage_events(
        &self,
        id: Uuid,
        stage: Stage,
        events: &[ChallengeEvent],
    ) -> Result<()>;
    /// Record a personal best; keeps the lower of the existing and new
    /// tick counts.
    fn record_personal_best(
        &self,
        player: &str,
        challenge: ChallengeType,
        mode: Option<ChallengeMode>,
        split: SplitType,
        ticks: u32,
    ) -> Result<()>;
    fn record_player_stats(&self, player: &str, delta: PlayerStatsDelta) -> Result<()>;
}

type PersonalBestKey = (String, ChallengeType, Option<ChallengeMode>, SplitType);

#[derive(Default)]
struct MemoryStoreState {
    challenges: HashMap<Uuid, ChallengeRecord>,
    events: HashMap<(Uuid, Stage), Vec<ChallengeEvent>>,
    personal_bests: HashMap<PersonalBestKey, u32>,
    player_stats: HashMap<String, PlayerStatsDelta>,
}

/// In-memory store.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreState>,
}

impl MemoryStore {
    fn state(&self) -> std::sync::MutexGuard<'_, MemoryStoreState> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn challenge(&self, id: Uuid) -> Option<ChallengeRecord> {
        self.state().challenges.get(&id).cloned()
    }

    pub fn stage_events(&self, id: Uuid, stage: Stage) -> Vec<ChallengeEvent> {
        self.state().events.get(&(id, stage)).cloned().unwrap_or_default()
    }

    pub fn personal_best(
        &self,
        player: &str,
        challenge: ChallengeType,
        mode: Option<ChallengeMode>,
        split: SplitType,
    ) -> Option<u32> {
        self.state().personal_bests.get(&(player.to_string(), challenge, mode, split)).copied()
    }

    pub fn player_stats(&self, player: &str) -> PlayerStatsDelta {
        self.state().player_stats.get(player).copied().unwrap_or_default()
    }

    pub fn challenge_count(&self) -> usize {
        self.state().challenges.len()
    }
}

impl ChallengeStore for MemoryStore {
    fn create_challenge(&self, record: ChallengeRecord) -> Result<()> {
        let mut state = self.state();
        if state.challenges.contains_key(&record.id) {
            return Err(anyhow!("challenge {} already exists", record.id));
        }
        state.challenges.insert(record.id, record);
        Ok(())
    }

    fn update_challenge(
        &self,
        id: Uuid,
        mutator: &mut dyn FnMut(&mut ChallengeRecord),
    ) -> Result<()> {
        let mut state = self.state();
        let record =
            state.challenges.get_mut(&id).ok_or_else(|| anyhow!("challenge {id} not found"))?;
        mutator(record);
        Ok(())
    }

    fn delete_challenge(&self, id: Uuid) -> Result<()> {
        let mut state = self.state();
        state.challenges.remove(&id);
        state.events.retain(|(challenge_id, _), _| *challenge_id != id);
        Ok(())
    }

    fn append_stage_events(
        &self,
        id: Uuid,
        stage: Stage,
        events: &[ChallengeEvent],
    ) -> Result<()> {
        let mut state = self.state();
        state.events.entry((id, stage)).or_default().extend_from_slice(events);
        Ok(())
    }

    fn record_personal_best(
        &self,
        player: &str,
        challenge: ChallengeType,
        mode: Option<ChallengeMode>,
        split: SplitType,
        ticks: u32,
    ) -> Result<()> {
        let mut state = self.state();
        let entry = state
            .personal_bests
            .entry((player.to_string(), challenge, mode, split))
            .or_insert(ticks);
        if ticks < *entry {
            *entry = ticks;
        }
        Ok(())
    }

    fn record_player_stats(&self, player: &str, delta: PlayerStatsDelta) -> Result<()> {
        let mut state = self.state();
        let stats = state.player_stats.entry(player.to_string()).or_default();
        stats.completions += delta.completions;
        stats.resets += delta.resets;
        stats.wipes += delta.wipes;
        stats.deaths += delta.deaths;
        Ok(())
    }
}
