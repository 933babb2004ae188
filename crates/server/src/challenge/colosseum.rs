// Colosseum: twelve-wave solo gauntlet tracking.

use std::collections::HashMap;

use chronicle_common::event::{ChallengeEvent, EventKind, Handicap};
use chronicle_common::types::{Stage, StageStatus};

use crate::store::{ChallengeRecord, RecordedSplit};

#[derive(Debug, Clone, Copy, Default)]
struct WaveRecord {
    ticks: u32,
    accurate: bool,
    completed: bool,
    handicap: Option<Handicap>,
}

/// Per-wave state for a colosseum run.
#[derive(Default)]
pub struct ColosseumTracker {
    waves: HashMap<Stage, WaveRecord>,
    current_wave: Option<Stage>,
    /// Handicap -> level. Re-choosing a held handicap levels it up.
    handicap_levels: HashMap<Handicap, u32>,
}

impl ColosseumTracker {
    pub fn on_initialize(&mut self, record: &mut ChallengeRecord) {
        // The gauntlet is solo and has no difficulty tiers.
        record.mode = None;
    }

    pub fn on_stage_entered(&mut self, stage: Stage) {
        self.current_wave = Some(stage);
        self.waves.insert(stage, WaveRecord::default());
    }

    pub fn process_event(&mut self, event: &ChallengeEvent) -> bool {
        match &event.kind {
            EventKind::HandicapChoice { handicap } => {
                let level = self.handicap_levels.entry(*handicap).or_insert(0);
                *level += 1;
                if let Some(wave) =
                    self.current_wave.and_then(|stage| self.waves.get_mut(&stage))
                {
                    wave.handicap = Some(*handicap);
                }
                // Tracked in wave state; the raw selection event is not
                // persisted.
                false
            }
            EventKind::NpcSpawn { .. }
            | EventKind::NpcDeath { .. }
            | EventKind::PlayerDeath { .. }
            | EventKind::PlayerUpdate { .. } => true,
            // Phase transitions are theatre-only; consume silently.
            EventKind::StagePhase { .. } => false,
            EventKind::StageUpdate(_) | EventKind::ChallengeUpdate { .. } => false,
        }
    }

    pub fn on_stage_finished(&mut self, stage: Stage, ticks: u32, accurate: bool, status: StageStatus) {
        let wave = self.waves.entry(stage).or_default();
        wave.ticks = ticks;
        wave.accurate = accurate;
        wave.completed = status == StageStatus::Completed;
        self.current_wave = None;
    }

    pub fn fully_completed(&self) -> bool {
        self.waves.get(&Stage::ColosseumWave12).is_some_and(|wave| wave.completed)
    }

    pub fn extra_splits(&self) -> Vec<RecordedSplit> {
        Vec::new()
    }

    pub fn handicap_level(&self, handicap: Handicap) -> u32 {
        self.handicap_levels.get(&handicap).copied().unwrap_or(0)
    }
}
