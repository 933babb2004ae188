// Theatre of Blood: six-room raid tracking.

use std::collections::HashMap;

use chronicle_common::event::{ChallengeEvent, EventKind, StagePhase};
use chronicle_common::types::{SplitType, Stage, StageStatus};

use crate::store::{ChallengeRecord, RecordedSplit};

#[derive(Debug, Clone, Copy, Default)]
struct RoomRecord {
    ticks: u32,
    accurate: bool,
    completed: bool,
    deaths: u32,
    npcs_spawned: u32,
    npcs_killed: u32,
}

/// Per-room state for a theatre raid.
#[derive(Default)]
pub struct TheatreTracker {
    rooms: HashMap<Stage, RoomRecord>,
    current_room: Option<Stage>,
    /// Tick each observed phase transition first occurred on, within the
    /// phase's room.
    phase_ticks: HashMap<StagePhase, u32>,
    sub_splits: Vec<RecordedSplit>,
}

impl TheatreTracker {
    pub fn on_initialize(&mut self, _record: &mut ChallengeRecord) {}

    pub fn on_stage_entered(&mut self, stage: Stage) {
        self.current_room = Some(stage);
        self.rooms.insert(stage, RoomRecord::default());
        // A re-entered room starts its phases over.
        self.phase_ticks.retain(|phase, _| phase.stage() != stage);
    }

    pub fn process_event(&mut self, event: &ChallengeEvent) -> bool {
        let room = self.current_room.and_then(|stage| self.rooms.get_mut(&stage));
        match &event.kind {
            EventKind::NpcSpawn { .. } => {
                if let Some(room) = room {
                    room.npcs_spawned += 1;
                }
                true
            }
            EventKind::NpcDeath { .. } => {
                if let Some(room) = room {
                    room.npcs_killed += 1;
                }
                true
            }
            EventKind::PlayerDeath { .. } => {
                if let Some(room) = room {
                    room.deaths += 1;
                }
                true
            }
            EventKind::PlayerUpdate { .. } => true,
            EventKind::StagePhase { phase } => {
                self.phase_ticks.entry(*phase).or_insert(event.tick);
                true
            }
            // Wave handicaps do not exist in the theatre; consume silently.
            EventKind::HandicapChoice { .. } => false,
            EventKind::StageUpdate(_) | EventKind::ChallengeUpdate { .. } => false,
        }
    }

    pub fn on_stage_finished(&mut self, stage: Stage, ticks: u32, accurate: bool, status: StageStatus) {
        let room = self.rooms.entry(stage).or_default();
        room.ticks = ticks;
        room.accurate = accurate;
        room.completed = status == StageStatus::Completed;
        self.current_room = None;

        if status == StageStatus::Completed {
            self.derive_sub_splits(stage, ticks, accurate);
        }
    }

    /// Turn the room's observed phase transitions into sub-splits, now
    /// that its total duration is known.
    fn derive_sub_splits(&mut self, stage: Stage, ticks: u32, accurate: bool) {
        let phase = |p: StagePhase| self.phase_ticks.get(&p).copied();
        let mut derived: Vec<(SplitType, u32)> = Vec::new();

        match stage {
            Stage::TheatreMaiden => {
                for (spawn, split) in [
                    (StagePhase::MaidenSeventies, SplitType::MaidenSeventies),
                    (StagePhase::MaidenFifties, SplitType::MaidenFifties),
                    (StagePhase::MaidenThirties, SplitType::MaidenThirties),
                ] {
                    if let Some(tick) = phase(spawn) {
                        derived.push((split, tick));
                    }
                }
            }
            Stage::TheatreNylocas => {
                if let Some(spawn) = phase(StagePhase::NyloBossSpawn) {
                    derived.push((SplitType::NyloBossSpawn, spawn));
                    derived.push((SplitType::NyloBoss, ticks.saturating_sub(spawn)));
                }
            }
            Stage::TheatreSotetseg => {
                if let Some(maze_two) = phase(StagePhase::SotetsegMazeTwo) {
                    derived.push((SplitType::SotetsegPhaseThree, ticks.saturating_sub(maze_two)));
                }
            }
            Stage::TheatreXarpus => {
                if let Some(screech) = phase(StagePhase::XarpusScreech) {
                    derived.push((SplitType::XarpusScreech, screech));
                    derived.push((SplitType::XarpusPhaseThree, ticks.saturating_sub(screech)));
                }
            }
            Stage::TheatreVerzik => {
                if let Some(reds) = phase(StagePhase::VerzikReds) {
                    derived.push((SplitType::VerzikReds, reds));
                }
                if let Some(p2_end) = phase(StagePhase::VerzikPhaseTwoEnd) {
                    derived.push((SplitType::VerzikPhaseThree, ticks.saturating_sub(p2_end)));
                }
            }
            _ => {}
        }

        self.sub_splits.extend(
            derived
                .into_iter()
                .map(|(split, split_ticks)| RecordedSplit { split, ticks: split_ticks, accurate }),
        );
    }

    /// The raid counts as fully completed only when the final room was
    /// cleared, not merely reported complete.
    pub fn fully_completed(&self) -> bool {
        self.rooms.get(&Stage::TheatreVerzik).is_some_and(|room| room.completed)
    }

    pub fn extra_splits(&self) -> Vec<RecordedSplit> {
        self.sub_splits.clone()
    }

    #[cfg(test)]
    fn room(&self, stage: Stage) -> Option<RoomRecord> {
        self.rooms.get(&stage).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn npc_spawn(stage: Stage, tick: u32) -> ChallengeEvent {
        ChallengeEvent { tick, stage, kind: EventKind::NpcSpawn { npc_id: 1, room_id: 7 } }
    }

    #[test]
    fn room_counters_track_current_room_only() {
        let mut tracker = TheatreTracker::default();
        tracker.on_stage_entered(Stage::TheatreMaiden);
        assert!(tracker.process_event(&npc_spawn(Stage::TheatreMaiden, 3)));
        assert!(tracker.process_event(&ChallengeEvent {
            tick: 10,
            stage: Stage::TheatreMaiden,
            kind: EventKind::PlayerDeath { username: "Alice".to_string() },
        }));
        tracker.on_stage_finished(Stage::TheatreMaiden, 180, true, StageStatus::Completed);

        let room = tracker.room(Stage::TheatreMaiden).expect("room should be tracked");
        assert_eq!(room.npcs_spawned, 1);
        assert_eq!(room.deaths, 1);
        assert!(room.completed);
        assert_eq!(room.ticks, 180);
    }

    #[test]
    fn fully_completed_requires_final_room_clear() {
        let mut tracker = TheatreTracker::default();
        assert!(!tracker.fully_completed());

        tracker.on_stage_entered(Stage::TheatreVerzik);
        tracker.on_stage_finished(Stage::TheatreVerzik, 900, true, StageStatus::Wiped);
        assert!(!tracker.fully_completed());

        tracker.on_stage_entered(Stage::TheatreVerzik);
        tracker.on_stage_finished(Stage::TheatreVerzik, 900, true, StageStatus::Completed);
        assert!(tracker.fully_completed());
    }

    fn phase_event(stage: Stage, tick: u32, phase: StagePhase) -> ChallengeEvent {
        ChallengeEvent { tick, stage, kind: EventKind::StagePhase { phase } }
    }

    #[test]
    fn maiden_crab_spawns_become_sub_splits() {
        let mut tracker = TheatreTracker::default();
        tracker.on_stage_entered(Stage::TheatreMaiden);
        tracker.process_event(&phase_event(Stage::TheatreMaiden, 60, StagePhase::MaidenSeventies));
        tracker.process_event(&phase_event(Stage::TheatreMaiden, 110, StagePhase::MaidenFifties));
        tracker.on_stage_finished(Stage::TheatreMaiden, 180, true, StageStatus::Completed);

        assert_eq!(
            tracker.extra_splits(),
            vec![
                RecordedSplit { split: SplitType::MaidenSeventies, ticks: 60, accurate: true },
                RecordedSplit { split: SplitType::MaidenFifties, ticks: 110, accurate: true },
            ]
        );
    }

    #[test]
    fn nylo_boss_split_is_measured_from_its_spawn() {
        let mut tracker = TheatreTracker::default();
        tracker.on_stage_entered(Stage::TheatreNylocas);
        tracker.process_event(&phase_event(Stage::TheatreNylocas, 400, StagePhase::NyloBossSpawn));
        tracker.on_stage_finished(Stage::TheatreNylocas, 520, true, StageStatus::Completed);

        assert_eq!(
            tracker.extra_splits(),
            vec![
                RecordedSplit { split: SplitType::NyloBossSpawn, ticks: 400, accurate: true },
                RecordedSplit { split: SplitType::NyloBoss, ticks: 120, accurate: true },
            ]
        );
    }

    #[test]
    fn wiped_room_yields_no_sub_splits() {
        let mut tracker = TheatreTracker::default();
        tracker.on_stage_entered(Stage::TheatreXarpus);
        tracker.process_event(&phase_event(Stage::TheatreXarpus, 200, StagePhase::XarpusScreech));
        tracker.on_stage_finished(Stage::TheatreXarpus, 250, true, StageStatus::Wiped);
        assert!(tracker.extra_splits().is_empty());

        // Re-entering the room discards the earlier phase observation.
        tracker.on_stage_entered(Stage::TheatreXarpus);
        tracker.on_stage_finished(Stage::TheatreXarpus, 300, true, StageStatus::Completed);
        assert!(tracker.extra_splits().is_empty());
    }

    #[test]
    fn inaccurate_room_flags_its_sub_splits() {
        let mut tracker = TheatreTracker::default();
        tracker.on_stage_entered(Stage::TheatreVerzik);
        tracker.process_event(&phase_event(Stage::TheatreVerzik, 300, StagePhase::VerzikReds));
        tracker
            .process_event(&phase_event(Stage::TheatreVerzik, 700, StagePhase::VerzikPhaseTwoEnd));
        tracker.on_stage_finished(Stage::TheatreVerzik, 900, false, StageStatus::Completed);

        assert_eq!(
            tracker.extra_splits(),
            vec![
                RecordedSplit { split: SplitType::VerzikReds, ticks: 300, accurate: false },
                RecordedSplit { split: SplitType::VerzikPhaseThree, ticks: 200, accurate: false },
            ]
        );
    }

    #[test]
    fn handicap_events_are_consumed() {
        let mut tracker = TheatreTracker::default();
        tracker.on_stage_entered(Stage::TheatreMaiden);
        let persisted = tracker.process_event(&ChallengeEvent {
            tick: 0,
            stage: Stage::TheatreMaiden,
            kind: EventKind::HandicapChoice {
                handicap: chronicle_common::event::Handicap::Bees,
            },
        });
        assert!(!persisted);
    }
}
