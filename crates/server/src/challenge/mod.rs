// Challenge state machine.
//
// A Challenge tracks one encounter attempt for a fixed party from the
// first start-or-join until finalization. The base owns party identity,
// mode, the stage pointer, and tick counters; encounter-specific split
// tracking lives in the `Variant` payload.

pub mod aggregator;
pub mod colosseum;
pub mod directory;
pub mod theatre;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chronicle_common::event::{ChallengeEvent, EventKind, StageUpdate};
use chronicle_common::types::{
    normalize_name, party_fingerprint, ChallengeMode, ChallengeStatus, ChallengeType, SplitType,
    Stage, StageStatus,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ChallengeError;
use crate::players::PlayerDirectory;
use crate::store::{ChallengeRecord, ChallengeStore, PlayerStatsDelta, RecordedSplit};

use colosseum::ColosseumTracker;
use theatre::TheatreTracker;

/// Challenge lifecycle. `Ending` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeState {
    Starting,
    InProgress,
    Ending,
}

/// Snapshot of a challenge's identity, used by liveness probes.
#[derive(Debug, Clone, PartialEq)]
pub struct ChallengeInfo {
    pub id: Uuid,
    pub challenge: ChallengeType,
    pub mode: Option<ChallengeMode>,
    pub stage: Stage,
    pub party: Vec<String>,
}

pub struct Challenge {
    id: Uuid,
    challenge_type: ChallengeType,
    mode: Option<ChallengeMode>,
    party: Vec<String>,
    party_key: String,
    state: ChallengeState,
    status: ChallengeStatus,
    stage: Stage,
    stage_status: Option<StageStatus>,
    total_ticks: u32,
    /// Highest tick seen in the current stage.
    stage_tick: u32,
    stage_accurate: bool,
    all_stages_accurate: bool,
    /// Persistable events buffered for the current stage.
    stage_events: Vec<ChallengeEvent>,
    stage_deaths: Vec<String>,
    deaths_by_member: HashMap<String, u32>,
    completed_members: HashSet<String>,
    reported_challenge_ticks: Option<u32>,
    reported_overall_ticks: Option<u32>,
    times_confirmed: bool,
    variant: Variant,
    store: Arc<dyn ChallengeStore>,
    players: Arc<PlayerDirectory>,
    created_at: DateTime<Utc>,
}

impl Challenge {
    pub fn new(
        store: Arc<dyn ChallengeStore>,
        players: Arc<PlayerDirectory>,
        id: Uuid,
        challenge_type: ChallengeType,
        mode: Option<ChallengeMode>,
        party: Vec<String>,
        stage: Stage,
        now: DateTime<Utc>,
    ) -> Result<Self, ChallengeError> {
        validate_mode(challenge_type, mode)?;

        let mut variant = Variant::new(challenge_type);
        let mut record = ChallengeRecord {
            id,
            challenge: challenge_type,
            mode,
            party: party.clone(),
            status: ChallengeStatus::InProgress,
            stage,
            challenge_ticks: 0,
            overall_ticks: None,
            splits: Vec::new(),
            created_at: now,
            finished_at: None,
        };
        variant.on_initialize(&mut record);
        store.create_challenge(record)?;

        let party_key = party_fingerprint(challenge_type, &party);
        info!(challenge_id = %id, challenge = challenge_type.tag(), party_key, "challenge created");

        Ok(Self {
            id,
            challenge_type,
            mode,
            party,
            party_key,
            state: ChallengeState::Starting,
            status: ChallengeStatus::InProgress,
            stage,
            stage_status: None,
            total_ticks: 0,
            stage_tick: 0,
            stage_accurate: true,
            all_stages_accurate: true,
            stage_events: Vec::new(),
            stage_deaths: Vec::new(),
            deaths_by_member: HashMap::new(),
            completed_members: HashSet::new(),
            reported_challenge_ticks: None,
            reported_overall_ticks: None,
            times_confirmed: false,
            variant,
            store,
            players,
            created_at: now,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn challenge_type(&self) -> ChallengeType {
        self.challenge_type
    }

    pub fn mode(&self) -> Option<ChallengeMode> {
        self.mode
    }

    pub fn party(&self) -> &[String] {
        &self.party
    }

    pub fn party_key(&self) -> &str {
        &self.party_key
    }

    pub fn state(&self) -> ChallengeState {
        self.state
    }

    pub fn status(&self) -> ChallengeStatus {
        self.status
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn info(&self) -> ChallengeInfo {
        ChallengeInfo {
            id: self.id,
            challenge: self.challenge_type,
            mode: self.mode,
            stage: self.stage,
            party: self.party.clone(),
        }
    }

    /// True while a stage is underway, i.e. between `Entered`/`Started`
    /// and the stage-end event.
    pub fn has_active_stage(&self) -> bool {
        matches!(self.stage_status, Some(StageStatus::Entered | StageStatus::Started))
    }

    pub fn times_confirmed(&self) -> bool {
        self.times_confirmed
    }

    pub fn reported_times(&self) -> (Option<u32>, Option<u32>) {
        (self.reported_challenge_ticks, self.reported_overall_ticks)
    }

    pub fn member_completed(&self, player: &str) -> bool {
        self.completed_members.contains(&normalize_name(player))
    }

    pub fn mark_member_completed(&mut self, player: &str) {
        self.completed_members.insert(normalize_name(player));
    }

    /// Record the client-reported challenge/overall durations.
    pub fn set_reported_times(&mut self, challenge_ticks: u32, overall_ticks: u32, confirmed: bool) {
        self.reported_challenge_ticks = Some(challenge_ticks);
        self.reported_overall_ticks = Some(overall_ticks);
        if confirmed {
            self.times_confirmed = true;
        }
    }

    /// Flag the current stage's timing as lossy. Called on every primary
    /// switch that happens while a stage is active.
    pub fn mark_stage_inaccurate(&mut self) {
        if self.has_active_stage() {
            self.stage_accurate = false;
            self.all_stages_accurate = false;
            debug!(challenge_id = %self.id, stage = ?self.stage, "stage timing flagged inaccurate");
        }
    }

    /// Update the challenge mode, e.g. from late mode detection mid-stream.
    pub fn update_mode(&mut self, mode: ChallengeMode) -> Result<(), ChallengeError> {
        validate_mode(self.challenge_type, Some(mode))?;
        if self.mode == Some(mode) {
            return Ok(());
        }
        self.mode = Some(mode);
        if let Err(error) = self.store.update_challenge(self.id, &mut |record| {
            record.mode = Some(mode);
        }) {
            warn!(challenge_id = %self.id, error = %error, "failed to persist mode update");
        }
        Ok(())
    }

    /// Apply one authoritative (primary-sourced) event.
    pub fn process_event(&mut self, event: &ChallengeEvent) -> Result<(), ChallengeError> {
        match &event.kind {
            EventKind::StageUpdate(update) => {
                return self.update_stage(event.stage, event.tick, update)
            }
            EventKind::ChallengeUpdate { mode } => {
                if let Some(mode) = mode {
                    return self.update_mode(*mode);
                }
                return Ok(());
            }
            _ => {}
        }

        // Events are stage-relative; a tick behind the high-water mark is
        // stale (late delivery or a client that lost its place).
        if event.tick < self.stage_tick {
            debug!(
                challenge_id = %self.id,
                tick = event.tick,
                stage_tick = self.stage_tick,
                "dropping stale event"
            );
            return Ok(());
        }
        self.stage_tick = event.tick;

        if let EventKind::PlayerDeath { username } = &event.kind {
            self.stage_deaths.push(username.clone());
        }

        if self.variant.process_event(event) {
            self.stage_events.push(event.clone());
        }
        Ok(())
    }

    fn update_stage(
        &mut self,
        stage: Stage,
        tick: u32,
        update: &StageUpdate,
    ) -> Result<(), ChallengeError> {
        match update.status {
            StageStatus::Entered => {
                self.enter_stage(stage);
            }
            StageStatus::Started => {
                if self.stage != stage || self.stage_status.is_none() {
                    self.enter_stage(stage);
                }
                self.stage_status = Some(StageStatus::Started);
                if !update.accurate {
                    self.stage_accurate = false;
                    self.all_stages_accurate = false;
                }
                if self.state == ChallengeState::Starting {
                    self.state = ChallengeState::InProgress;
                }
            }
            StageStatus::Completed | StageStatus::Wiped => {
                self.finish_stage(stage, tick, update);
            }
        }
        Ok(())
    }

    fn enter_stage(&mut self, stage: Stage) {
        if self.stage == stage
            && matches!(self.stage_status, Some(StageStatus::Entered | StageStatus::Started))
        {
            return;
        }
        self.stage = stage;
        self.stage_status = Some(StageStatus::Entered);
        self.reset_for_new_stage();
        self.variant.on_stage_entered(stage);
    }

    fn reset_for_new_stage(&mut self) {
        self.stage_tick = 0;
        self.stage_accurate = true;
        self.stage_events.clear();
        self.stage_deaths.clear();
    }

    fn finish_stage(&mut self, stage: Stage, tick: u32, update: &StageUpdate) {
        if self.stage != stage {
            warn!(
                challenge_id = %self.id,
                recorded = ?self.stage,
                reported = ?stage,
                "stage-end event for a stage the challenge is not in; ignoring"
            );
            return;
        }

        // The stage-end event's own tick is the stage's duration; gameplay
        // events may stop well before it.
        if tick > self.stage_tick {
            self.stage_tick = tick;
        }

        let accurate = update.accurate && self.stage_accurate;
        if !accurate {
            self.all_stages_accurate = false;
        }

        // Tick correction: when the recorded counter ran short of the
        // game's own measurement, shift the buffered per-tick data and
        // adopt the measured duration, preserving relative order.
        if !accurate {
            if let Some(reported) = update.recorded_ticks {
                if reported > self.stage_tick {
                    let offset = reported - self.stage_tick;
                    for event in &mut self.stage_events {
                        event.tick += offset;
                    }
                    self.stage_tick = reported;
                    debug!(
                        challenge_id = %self.id,
                        stage = ?stage,
                        offset,
                        "applied stage tick correction"
                    );
                }
            }
        }

        let stage_ticks = self.stage_tick;
        self.total_ticks += stage_ticks;
        let split = RecordedSplit {
            split: SplitType::Stage { stage },
            ticks: stage_ticks,
            accurate,
        };

        for death in self.stage_deaths.drain(..) {
            *self.deaths_by_member.entry(normalize_name(&death)).or_default() += 1;
        }

        self.variant.on_stage_finished(stage, stage_ticks, accurate, update.status);

        if accurate && update.status == StageStatus::Completed {
            for member in &self.party {
                self.players.record_personal_best(
                    member,
                    self.challenge_type,
                    self.mode,
                    SplitType::Stage { stage },
                    stage_ticks,
                );
            }
        }

        if !self.stage_events.is_empty() {
            if let Err(error) = self.store.append_stage_events(self.id, stage, &self.stage_events)
            {
                warn!(challenge_id = %self.id, error = %error, "failed to persist stage events");
            }
            self.stage_events.clear();
        }

        self.stage_status = Some(update.status);
        match update.status {
            StageStatus::Wiped => self.status = ChallengeStatus::Wiped,
            StageStatus::Completed => {
                if stage == self.challenge_type.final_stage() {
                    self.status = ChallengeStatus::Completed;
                } else if let Some(next) = stage.next() {
                    self.stage = next;
                }
            }
            _ => {}
        }

        let total_ticks = self.total_ticks;
        let current_stage = self.stage;
        let status = self.status;
        if let Err(error) = self.store.update_challenge(self.id, &mut |record| {
            record.challenge_ticks = total_ticks;
            record.stage = current_stage;
            record.status = status;
            record.splits.push(split);
        }) {
            warn!(challenge_id = %self.id, error = %error, "failed to persist stage finish");
        }
    }

    /// Finalize the challenge. Returns `false` when the challenge never
    /// confirmed a start, in which case its record is deleted instead.
    pub fn finish(
        &mut self,
        status_override: Option<ChallengeStatus>,
        now: DateTime<Utc>,
    ) -> bool {
        if self.state == ChallengeState::Ending {
            return true;
        }
        if self.state == ChallengeState::Starting {
            info!(challenge_id = %self.id, "challenge ended before starting; deleting record");
            self.state = ChallengeState::Ending;
            if let Err(error) = self.store.delete_challenge(self.id) {
                warn!(challenge_id = %self.id, error = %error, "failed to delete unstarted challenge");
            }
            return false;
        }
        self.state = ChallengeState::Ending;

        if let Some(status) = status_override {
            self.status = status;
        } else if self.status == ChallengeStatus::InProgress {
            // A challenge that stops mid-attempt without a stage-end verdict
            // degrades to a reset rather than being silently dropped.
            self.status = ChallengeStatus::Reset;
        }

        let fully_completed =
            self.status == ChallengeStatus::Completed && self.variant.fully_completed();
        let accurate = fully_completed && self.all_stages_accurate;

        let overall_split = if self.times_confirmed {
            self.reported_overall_ticks.map(|overall| {
                if accurate {
                    for member in &self.party {
                        self.players.record_personal_best(
                            member,
                            self.challenge_type,
                            self.mode,
                            SplitType::Overall,
                            overall,
                        );
                    }
                }
                RecordedSplit { split: SplitType::Overall, ticks: overall, accurate }
            })
        } else {
            None
        };

        for member in &self.party {
            let mut delta = PlayerStatsDelta::default();
            match self.status {
                ChallengeStatus::Completed => delta.completions = 1,
                ChallengeStatus::Wiped => delta.wipes = 1,
                ChallengeStatus::Reset | ChallengeStatus::Abandoned => delta.resets = 1,
                ChallengeStatus::InProgress => {}
            }
            delta.deaths = self.deaths_by_member.get(&normalize_name(member)).copied().unwrap_or(0);
            self.players.record_stats(member, delta);
        }

        let extra_splits = self.variant.extra_splits();

        let status = self.status;
        let total_ticks = self.total_ticks;
        let reported_challenge = self.reported_challenge_ticks;
        let reported_overall = self.reported_overall_ticks;
        let times_confirmed = self.times_confirmed;
        if let Err(error) = self.store.update_challenge(self.id, &mut |record| {
            record.status = status;
            record.finished_at = Some(now);
            record.challenge_ticks = match (times_confirmed, reported_challenge) {
                (true, Some(ticks)) if ticks > 0 => ticks,
                _ => total_ticks,
            };
            record.overall_ticks = reported_overall.filter(|_| times_confirmed);
            record.splits.extend(overall_split);
            record.splits.extend(extra_splits.iter().copied());
        }) {
            warn!(challenge_id = %self.id, error = %error, "failed to persist challenge finish");
        }

        info!(
            challenge_id = %self.id,
            status = ?self.status,
            accurate,
            ticks = self.total_ticks,
            "challenge finalized"
        );
        true
    }

    /// Purge the challenge as if it never happened.
    pub fn terminate(&mut self) {
        self.state = ChallengeState::Ending;
        if let Err(error) = self.store.delete_challenge(self.id) {
            warn!(challenge_id = %self.id, error = %error, "failed to purge terminated challenge");
        }
        info!(challenge_id = %self.id, "challenge terminated and purged");
    }
}

fn validate_mode(
    challenge_type: ChallengeType,
    mode: Option<ChallengeMode>,
) -> Result<(), ChallengeError> {
    // Entry-mode theatre raids are practice runs and are never recorded.
    if challenge_type == ChallengeType::Theatre && mode == Some(ChallengeMode::Entry) {
        return Err(ChallengeError::UnsupportedMode);
    }
    Ok(())
}

/// Closed set of encounter variants. Each carries its own split-tracking
/// payload; dispatch is a plain match.
pub(crate) enum Variant {
    Theatre(TheatreTracker),
    Colosseum(ColosseumTracker),
}

impl Variant {
    fn new(challenge_type: ChallengeType) -> Self {
        match challenge_type {
            ChallengeType::Theatre => Self::Theatre(TheatreTracker::default()),
            ChallengeType::Colosseum => Self::Colosseum(ColosseumTracker::default()),
        }
    }

    fn on_initialize(&mut self, record: &mut ChallengeRecord) {
        match self {
            Self::Theatre(tracker) => tracker.on_initialize(record),
            Self::Colosseum(tracker) => tracker.on_initialize(record),
        }
    }

    fn on_stage_entered(&mut self, stage: Stage) {
        match self {
            Self::Theatre(tracker) => tracker.on_stage_entered(stage),
            Self::Colosseum(tracker) => tracker.on_stage_entered(stage),
        }
    }

    /// Observe an event; returns whether the raw event should be durably
    /// recorded.
    fn process_event(&mut self, event: &ChallengeEvent) -> bool {
        match self {
            Self::Theatre(tracker) => tracker.process_event(event),
            Self::Colosseum(tracker) => tracker.process_event(event),
        }
    }

    fn on_stage_finished(&mut self, stage: Stage, ticks: u32, accurate: bool, status: StageStatus) {
        match self {
            Self::Theatre(tracker) => tracker.on_stage_finished(stage, ticks, accurate, status),
            Self::Colosseum(tracker) => tracker.on_stage_finished(stage, ticks, accurate, status),
        }
    }

    fn fully_completed(&self) -> bool {
        match self {
            Self::Theatre(tracker) => tracker.fully_completed(),
            Self::Colosseum(tracker) => tracker.fully_completed(),
        }
    }

    fn extra_splits(&self) -> Vec<RecordedSplit> {
        match self {
            Self::Theatre(tracker) => tracker.extra_splits(),
            Self::Colosseum(tracker) => tracker.extra_splits(),
        }
    }
}
