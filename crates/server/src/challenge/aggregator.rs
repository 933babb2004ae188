// Stream aggregator: coordinates every session streaming telemetry for
// one challenge.
//
// Only the primary session's events reach the challenge; the election
// rule is insertion order over sessions that are active and have not
// reported completion. All time-dependent decisions take an explicit
// `now` so tests drive virtual time; wall-clock reads happen only in the
// watchdog task that calls `tick`.

use chrono::{DateTime, Duration, Utc};
use chronicle_common::event::{ChallengeEvent, EventKind};
use chronicle_common::protocol::ws::ServerMessage;
use chronicle_common::types::{RecordingType, Stage, StageStatus};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::Challenge;
use crate::error::{ChallengeError, ErrorCode};
use crate::players::PlayerDirectory;
use crate::session::SessionId;

/// How long a challenge may sit with no eligible session before it is
/// finalized as abandoned.
pub const RECONNECTION_TIMEOUT_MINUTES: i64 = 5;
/// How long without any event before attached sessions are probed to
/// confirm their recorded state.
pub const MAX_INACTIVITY_MINUTES: i64 = 15;
/// Watchdog period.
pub const WATCHDOG_PERIOD_SECONDS: u64 = 60;
/// Grace before a completed session is detached, so sibling completion
/// reports can land first.
pub const CLIENT_REMOVAL_GRACE_MS: u64 = 1500;

struct AttachedSession {
    id: SessionId,
    recording_type: RecordingType,
    player_name: String,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    active: bool,
    primary: bool,
    finished: bool,
    /// The stage this session believes it is in, from its own stream.
    active_stage: Option<Stage>,
    /// Non-primary events, buffered for future multi-source
    /// reconciliation. Never merged into the authoritative record.
    buffered: Vec<ChallengeEvent>,
}

impl AttachedSession {
    fn eligible(&self) -> bool {
        self.active && !self.finished
    }
}

/// Result of a completion report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionOutcome {
    /// False when this session had already reported (idempotent repeat).
    pub recorded: bool,
    /// True when every attached session has reported completion.
    pub complete: bool,
    /// True when finalization is deferred because a stage was still
    /// active at completion; the reconnection deadline was started
    /// instead.
    pub deferred: bool,
}

/// Result of one watchdog pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogVerdict {
    /// Number of sessions sent a state-confirmation probe.
    pub probed: usize,
    /// True when the reconnection deadline elapsed with no eligible
    /// session; the caller finalizes the challenge as abandoned.
    pub finalize_abandoned: bool,
}

pub struct StreamAggregator {
    challenge: Challenge,
    sessions: Vec<AttachedSession>,
    last_event_at: DateTime<Utc>,
    reconnection_deadline_since: Option<DateTime<Utc>>,
    had_primary: bool,
}

impl StreamAggregator {
    pub fn new(challenge: Challenge, now: DateTime<Utc>) -> Self {
        Self {
            challenge,
            sessions: Vec::new(),
            last_event_at: now,
            reconnection_deadline_since: None,
            had_primary: false,
        }
    }

    pub fn challenge(&self) -> &Challenge {
        &self.challenge
    }

    pub fn challenge_mut(&mut self) -> &mut Challenge {
        &mut self.challenge
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn contains_session(&self, id: SessionId) -> bool {
        self.sessions.iter().any(|session| session.id == id)
    }

    pub fn primary_session(&self) -> Option<SessionId> {
        self.sessions.iter().find(|session| session.primary).map(|session| session.id)
    }

    pub fn reconnection_deadline_since(&self) -> Option<DateTime<Utc>> {
        self.reconnection_deadline_since
    }

    /// True when every attached session has reported completion.
    pub fn is_complete(&self) -> bool {
        !self.sessions.is_empty() && self.sessions.iter().all(|session| session.finished)
    }

    /// Attach a session. The first eligible session becomes primary.
    pub fn add_session(
        &mut self,
        id: SessionId,
        recording_type: RecordingType,
        player_name: String,
        outbound: mpsc::UnboundedSender<ServerMessage>,
        now: DateTime<Utc>,
    ) -> Result<(), ChallengeError> {
        if self.contains_session(id) {
            return Err(ChallengeError::AlreadyAttached {
                session_id: id.0,
                challenge_id: self.challenge.id(),
            });
        }
        self.sessions.push(AttachedSession {
            id,
            recording_type,
            player_name,
            outbound,
            active: true,
            primary: false,
            finished: false,
            active_stage: None,
            buffered: Vec::new(),
        });
        info!(
            challenge_id = %self.challenge.id(),
            session_id = %id,
            recording_type = ?recording_type,
            "session attached"
        );
        self.elect_primary(now);
        Ok(())
    }

    /// Detach a session, re-electing or starting the reconnection
    /// deadline as needed.
    pub fn remove_session(&mut self, id: SessionId, now: DateTime<Utc>) -> bool {
        let before = self.sessions.len();
        self.sessions.retain(|session| session.id != id);
        let removed = self.sessions.len() != before;
        if removed {
            info!(challenge_id = %self.challenge.id(), session_id = %id, "session detached");
            self.elect_primary(now);
        }
        removed
    }

    pub fn set_session_active(&mut self, id: SessionId, now: DateTime<Utc>) {
        if let Some(session) = self.sessions.iter_mut().find(|session| session.id == id) {
            session.active = true;
            self.elect_primary(now);
        }
    }

    pub fn set_session_inactive(&mut self, id: SessionId, now: DateTime<Utc>) {
        if let Some(session) = self.sessions.iter_mut().find(|session| session.id == id) {
            session.active = false;
            self.elect_primary(now);
        }
    }

    /// Election: the current primary keeps its role while eligible;
    /// otherwise the first remaining eligible session in insertion order
    /// takes over. Switching while a stage is active marks the stage
    /// timing inaccurate.
    fn elect_primary(&mut self, now: DateTime<Utc>) {
        let old = self.primary_session();
        if let Some(current) =
            self.sessions.iter().find(|session| session.primary)
        {
            if current.eligible() {
                self.reconnection_deadline_since = None;
                return;
            }
        }

        for session in &mut self.sessions {
            session.primary = false;
        }
        let new = match self.sessions.iter_mut().find(|session| session.eligible()) {
            Some(session) => {
                session.primary = true;
                Some(session.id)
            }
            None => None,
        };

        match new {
            Some(new_id) => {
                self.reconnection_deadline_since = None;
                if old != Some(new_id) {
                    debug!(
                        challenge_id = %self.challenge.id(),
                        old = ?old.map(|id| id.0),
                        new = new_id.0,
                        "primary session changed"
                    );
                    // A mid-stage handover is necessarily lossy; flag the
                    // stage rather than drop the attempt.
                    if self.had_primary {
                        self.challenge.mark_stage_inaccurate();
                    }
                }
                self.had_primary = true;
            }
            None => {
                if self.reconnection_deadline_since.is_none() {
                    self.reconnection_deadline_since = Some(now);
                    info!(
                        challenge_id = %self.challenge.id(),
                        "no eligible session; reconnection deadline started"
                    );
                }
            }
        }
    }

    /// Apply one telemetry event from a session. Primary events reach the
    /// challenge; others are buffered.
    pub fn process(
        &mut self,
        id: SessionId,
        event: &ChallengeEvent,
        now: DateTime<Utc>,
    ) -> Result<(), ChallengeError> {
        let index = self
            .sessions
            .iter()
            .position(|session| session.id == id)
            .ok_or(ChallengeError::NotAttached(id.0))?;
        self.last_event_at = now;

        if let EventKind::StageUpdate(update) = &event.kind {
            self.sessions[index].active_stage = match update.status {
                StageStatus::Entered | StageStatus::Started => Some(event.stage),
                StageStatus::Completed | StageStatus::Wiped => None,
            };
        }

        if self.sessions[index].primary {
            self.challenge.process_event(event)
        } else {
            self.sessions[index].buffered.push(event.clone());
            Ok(())
        }
    }

    /// Record a session's completion report. Idempotent per session.
    pub fn mark_completion(
        &mut self,
        id: SessionId,
        challenge_ticks: u32,
        overall_ticks: u32,
        players: &PlayerDirectory,
        now: DateTime<Utc>,
    ) -> Result<CompletionOutcome, ChallengeError> {
        let index = self
            .sessions
            .iter()
            .position(|session| session.id == id)
            .ok_or(ChallengeError::NotAttached(id.0))?;

        if self.sessions[index].finished {
            return Ok(CompletionOutcome {
                recorded: false,
                complete: self.is_complete(),
                deferred: false,
            });
        }

        let was_primary = self.sessions[index].primary;
        self.sessions[index].finished = true;
        self.sessions[index].active_stage = None;

        if self.sessions[index].recording_type == RecordingType::Participant {
            let player = self.sessions[index].player_name.clone();
            self.challenge.mark_member_completed(&player);
            players.end_recording(&player, self.challenge.id());
        }

        // Reported-times precedence: zero ticks carry no timing
        // information; a primary report confirms; a non-primary report
        // only fills in while nothing is confirmed.
        let has_times = challenge_ticks > 0 || overall_ticks > 0;
        if has_times && (was_primary || !self.challenge.times_confirmed()) {
            self.challenge.set_reported_times(challenge_ticks, overall_ticks, was_primary);
        }

        if was_primary {
            self.elect_primary(now);
        }

        let complete = self.is_complete();
        let mut deferred = false;
        if complete && self.challenge.has_active_stage() {
            // The authoritative stage-end signal has not arrived yet;
            // wait under the reconnection deadline instead of finalizing.
            if self.reconnection_deadline_since.is_none() {
                self.reconnection_deadline_since = Some(now);
            }
            deferred = true;
        }

        info!(
            challenge_id = %self.challenge.id(),
            session_id = %id,
            complete,
            deferred,
            "completion recorded"
        );
        Ok(CompletionOutcome { recorded: true, complete, deferred })
    }

    /// One watchdog pass.
    pub fn tick(&mut self, now: DateTime<Utc>) -> WatchdogVerdict {
        let mut probed = 0;
        if now - self.last_event_at > Duration::minutes(MAX_INACTIVITY_MINUTES) {
            let info = self.challenge.info();
            for session in
                self.sessions.iter().filter(|session| session.active && !session.finished)
            {
                let _ = session.outbound.send(ServerMessage::StateConfirmationRequest {
                    username: session.player_name.clone(),
                    challenge_id: info.id,
                    challenge: info.challenge,
                    mode: info.mode,
                    stage: info.stage,
                    party: info.party.clone(),
                });
                probed += 1;
            }
        }

        let eligible = self.sessions.iter().any(|session| session.eligible());
        let mut finalize_abandoned = false;
        if eligible {
            if self.primary_session().is_some() {
                self.reconnection_deadline_since = None;
            }
        } else {
            match self.reconnection_deadline_since {
                Some(since)
                    if now - since >= Duration::minutes(RECONNECTION_TIMEOUT_MINUTES) =>
                {
                    finalize_abandoned = true;
                }
                None => self.reconnection_deadline_since = Some(now),
                _ => {}
            }
        }

        WatchdogVerdict { probed, finalize_abandoned }
    }

    /// Notify every attached session that recording has ended and detach
    /// them all. Used by forced termination.
    pub fn notify_ended_and_detach_all(&mut self) -> Vec<SessionId> {
        let ids = self.sessions.iter().map(|session| session.id).collect();
        for session in &self.sessions {
            let _ = session.outbound.send(ErrorCode::RecordingEnded.to_message());
        }
        self.sessions.clear();
        ids
    }

    /// Detach every session without notification. Used by the normal
    /// finalize path.
    pub fn detach_all(&mut self) -> Vec<SessionId> {
        let ids = self.sessions.iter().map(|session| session.id).collect();
        self.sessions.clear();
        ids
    }

    #[cfg(test)]
    fn buffered_count(&self, id: SessionId) -> usize {
        self.sessions
            .iter()
            .find(|session| session.id == id)
            .map(|session| session.buffered.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::challenge::Challenge;
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use chronicle_common::event::StageUpdate;
    use chronicle_common::types::{ChallengeMode, ChallengeType};
    use uuid::Uuid;

    fn ts(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(seconds, 0).single().expect("timestamp should be valid")
    }

    struct Harness {
        store: Arc<MemoryStore>,
        players: Arc<PlayerDirectory>,
        aggregator: StreamAggregator,
    }

    fn harness(party: &[&str]) -> Harness {
        let store = Arc::new(MemoryStore::default());
        let players = Arc::new(PlayerDirectory::new(store.clone()));
        let challenge = Challenge::new(
            store.clone(),
            players.clone(),
            Uuid::new_v4(),
            ChallengeType::Theatre,
            Some(ChallengeMode::Regular),
            party.iter().map(|name| name.to_string()).collect(),
            chronicle_common::types::Stage::TheatreMaiden,
            ts(1_700_000_000),
        )
        .expect("challenge should be created");
        let aggregator = StreamAggregator::new(challenge, ts(1_700_000_000));
        Harness { store, players, aggregator }
    }

    fn attach(
        aggregator: &mut StreamAggregator,
        id: u64,
        player: &str,
        at: DateTime<Utc>,
    ) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        aggregator
            .add_session(SessionId(id), RecordingType::Participant, player.to_string(), tx, at)
            .expect("attach should succeed");
        rx
    }

    fn stage_event(stage: chronicle_common::types::Stage, status: StageStatus) -> ChallengeEvent {
        ChallengeEvent {
            tick: 0,
            stage,
            kind: EventKind::StageUpdate(StageUpdate {
                status,
                accurate: true,
                recorded_ticks: None,
            }),
        }
    }

    #[test]
    fn first_session_becomes_primary() {
        let mut h = harness(&["Alice", "Bob"]);
        let _rx_a = attach(&mut h.aggregator, 1, "Alice", ts(0));
        let _rx_b = attach(&mut h.aggregator, 2, "Bob", ts(1));
        assert_eq!(h.aggregator.primary_session(), Some(SessionId(1)));
        assert!(h.aggregator.reconnection_deadline_since().is_none());
    }

    #[test]
    fn at_most_one_primary_at_any_instant() {
        let mut h = harness(&["Alice", "Bob", "Carol"]);
        let _rx = [
            attach(&mut h.aggregator, 1, "Alice", ts(0)),
            attach(&mut h.aggregator, 2, "Bob", ts(1)),
            attach(&mut h.aggregator, 3, "Carol", ts(2)),
        ];
        let primaries =
            h.aggregator.sessions.iter().filter(|session| session.primary).count();
        assert_eq!(primaries, 1);

        h.aggregator.remove_session(SessionId(1), ts(3));
        let primaries =
            h.aggregator.sessions.iter().filter(|session| session.primary).count();
        assert_eq!(primaries, 1);
    }

    #[test]
    fn insertion_order_is_the_tie_break() {
        let mut h = harness(&["Alice", "Bob", "Carol"]);
        let _rx = [
            attach(&mut h.aggregator, 1, "Alice", ts(0)),
            attach(&mut h.aggregator, 2, "Bob", ts(1)),
            attach(&mut h.aggregator, 3, "Carol", ts(2)),
        ];
        h.aggregator.remove_session(SessionId(1), ts(3));
        assert_eq!(h.aggregator.primary_session(), Some(SessionId(2)));
        h.aggregator.set_session_inactive(SessionId(2), ts(4));
        assert_eq!(h.aggregator.primary_session(), Some(SessionId(3)));
    }

    #[test]
    fn mid_stage_failover_marks_stage_inaccurate() {
        let mut h = harness(&["Alice", "Bob", "Carol"]);
        let _rx = [
            attach(&mut h.aggregator, 1, "Alice", ts(0)),
            attach(&mut h.aggregator, 2, "Bob", ts(1)),
            attach(&mut h.aggregator, 3, "Carol", ts(2)),
        ];
        h.aggregator
            .process(
                SessionId(1),
                &stage_event(chronicle_common::types::Stage::TheatreMaiden, StageStatus::Started),
                ts(3),
            )
            .expect("stage start should apply");

        // Session 1 disconnects mid-stage; session 2 takes over and the
        // stage is flagged.
        h.aggregator.remove_session(SessionId(1), ts(4));
        assert_eq!(h.aggregator.primary_session(), Some(SessionId(2)));

        h.aggregator
            .process(
                SessionId(2),
                &ChallengeEvent {
                    tick: 100,
                    stage: chronicle_common::types::Stage::TheatreMaiden,
                    kind: EventKind::StageUpdate(StageUpdate {
                        status: StageStatus::Completed,
                        accurate: true,
                        recorded_ticks: Some(100),
                    }),
                },
                ts(5),
            )
            .expect("stage end should apply");
        let record = h.store.challenge(h.aggregator.challenge().id()).expect("record exists");
        assert!(!record.splits[0].accurate);
    }

    #[test]
    fn first_election_does_not_mark_inaccurate() {
        let mut h = harness(&["Alice"]);
        let _rx = attach(&mut h.aggregator, 1, "Alice", ts(0));
        h.aggregator
            .process(
                SessionId(1),
                &ChallengeEvent {
                    tick: 100,
                    stage: chronicle_common::types::Stage::TheatreMaiden,
                    kind: EventKind::StageUpdate(StageUpdate {
                        status: StageStatus::Started,
                        accurate: true,
                        recorded_ticks: None,
                    }),
                },
                ts(1),
            )
            .expect("stage start should apply");
        h.aggregator
            .process(
                SessionId(1),
                &ChallengeEvent {
                    tick: 180,
                    stage: chronicle_common::types::Stage::TheatreMaiden,
                    kind: EventKind::StageUpdate(StageUpdate {
                        status: StageStatus::Completed,
                        accurate: true,
                        recorded_ticks: Some(180),
                    }),
                },
                ts(2),
            )
            .expect("stage end should apply");
        let record = h.store.challenge(h.aggregator.challenge().id()).expect("record exists");
        assert!(record.splits[0].accurate);
    }

    #[test]
    fn non_primary_events_are_buffered_not_applied() {
        let mut h = harness(&["Alice", "Bob"]);
        let _rx_a = attach(&mut h.aggregator, 1, "Alice", ts(0));
        let _rx_b = attach(&mut h.aggregator, 2, "Bob", ts(1));

        h.aggregator
            .process(
                SessionId(2),
                &ChallengeEvent {
                    tick: 5,
                    stage: chronicle_common::types::Stage::TheatreMaiden,
                    kind: EventKind::PlayerUpdate { username: "Bob".to_string() },
                },
                ts(2),
            )
            .expect("non-primary event accepted");
        assert_eq!(h.aggregator.buffered_count(SessionId(2)), 1);
        assert!(h
            .store
            .stage_events(
                h.aggregator.challenge().id(),
                chronicle_common::types::Stage::TheatreMaiden
            )
            .is_empty());
    }

    #[test]
    fn completion_is_idempotent_per_session() {
        let mut h = harness(&["Alice", "Bob"]);
        let _rx_a = attach(&mut h.aggregator, 1, "Alice", ts(0));
        let _rx_b = attach(&mut h.aggregator, 2, "Bob", ts(1));

        let first = h
            .aggregator
            .mark_completion(SessionId(1), 500, 520, &h.players, ts(2))
            .expect("completion should record");
        assert!(first.recorded);
        assert!(!first.complete);

        let repeat = h
            .aggregator
            .mark_completion(SessionId(1), 450, 470, &h.players, ts(3))
            .expect("repeat should be a no-op");
        assert!(!repeat.recorded);
        assert_eq!(h.aggregator.challenge().reported_times(), (Some(500), Some(520)));
    }

    #[test]
    fn first_confirmed_report_wins_over_later_zeros() {
        // Spec scenario: A primary reports (500, 520); B disconnects,
        // reconnects, completes with (0, 0). Times stay (500, 520).
        let mut h = harness(&["Alice", "Bob"]);
        let _rx_a = attach(&mut h.aggregator, 1, "Alice", ts(0));
        let _rx_b = attach(&mut h.aggregator, 2, "Bob", ts(1));

        let outcome = h
            .aggregator
            .mark_completion(SessionId(1), 500, 520, &h.players, ts(10))
            .expect("completion should record");
        assert!(!outcome.complete);

        // B disconnects before completing: not complete, deadline starts
        // once no eligible session remains.
        h.aggregator.remove_session(SessionId(2), ts(20));
        assert!(!h.aggregator.is_complete() || h.aggregator.session_count() == 1);
        assert!(h.aggregator.reconnection_deadline_since().is_some());

        // B reconnects within the threshold and completes with no times.
        let (tx, _rx) = mpsc::unbounded_channel();
        h.aggregator
            .add_session(SessionId(3), RecordingType::Participant, "Bob".to_string(), tx, ts(30))
            .expect("rejoin should attach");
        assert!(h.aggregator.reconnection_deadline_since().is_none());

        let outcome = h
            .aggregator
            .mark_completion(SessionId(3), 0, 0, &h.players, ts(40))
            .expect("completion should record");
        assert!(outcome.complete);
        assert_eq!(h.aggregator.challenge().reported_times(), (Some(500), Some(520)));
        assert!(h.aggregator.challenge().times_confirmed());
    }

    #[test]
    fn unconfirmed_times_yield_to_primary_report() {
        let mut h = harness(&["Alice", "Bob"]);
        let _rx_a = attach(&mut h.aggregator, 1, "Alice", ts(0));
        let _rx_b = attach(&mut h.aggregator, 2, "Bob", ts(1));

        // Non-primary reports first: times recorded but unconfirmed.
        h.aggregator
            .mark_completion(SessionId(2), 480, 510, &h.players, ts(2))
            .expect("completion should record");
        assert_eq!(h.aggregator.challenge().reported_times(), (Some(480), Some(510)));
        assert!(!h.aggregator.challenge().times_confirmed());

        // The primary's own report overwrites and confirms.
        h.aggregator
            .mark_completion(SessionId(1), 500, 520, &h.players, ts(3))
            .expect("completion should record");
        assert_eq!(h.aggregator.challenge().reported_times(), (Some(500), Some(520)));
        assert!(h.aggregator.challenge().times_confirmed());
    }

    #[test]
    fn completion_with_active_stage_defers_finalization() {
        let mut h = harness(&["Alice"]);
        let _rx = attach(&mut h.aggregator, 1, "Alice", ts(0));
        h.aggregator
            .process(
                SessionId(1),
                &stage_event(chronicle_common::types::Stage::TheatreMaiden, StageStatus::Started),
                ts(1),
            )
            .expect("stage start should apply");

        let outcome = h
            .aggregator
            .mark_completion(SessionId(1), 500, 520, &h.players, ts(2))
            .expect("completion should record");
        assert!(outcome.complete);
        assert!(outcome.deferred);
        assert!(h.aggregator.reconnection_deadline_since().is_some());
    }

    #[test]
    fn participant_completion_marks_member_and_releases_player() {
        let mut h = harness(&["Alice", "Bob"]);
        let _rx_a = attach(&mut h.aggregator, 1, "Alice", ts(0));
        let challenge_id = h.aggregator.challenge().id();
        h.players.begin_recording("Alice", challenge_id);

        h.aggregator
            .mark_completion(SessionId(1), 0, 0, &h.players, ts(1))
            .expect("completion should record");
        assert!(h.aggregator.challenge().member_completed("alice"));
        assert_eq!(h.players.active_challenge("Alice"), None);
    }

    #[test]
    fn watchdog_probes_after_inactivity() {
        // `last_event_at` starts at the harness creation time.
        let start = 1_700_000_000;
        let mut h = harness(&["Alice", "Bob"]);
        let mut rx_a = attach(&mut h.aggregator, 1, "Alice", ts(start));
        let _rx_b = attach(&mut h.aggregator, 2, "Bob", ts(start));

        // Within the inactivity window: nothing.
        let verdict = h.aggregator.tick(ts(start + 10 * 60));
        assert_eq!(verdict.probed, 0);

        let verdict = h.aggregator.tick(ts(start + 16 * 60));
        assert_eq!(verdict.probed, 2);
        let probe = rx_a.try_recv().expect("probe should be queued");
        assert!(matches!(probe, ServerMessage::StateConfirmationRequest { .. }));
    }

    #[test]
    fn watchdog_finalizes_after_reconnection_timeout() {
        let mut h = harness(&["Alice"]);
        let _rx = attach(&mut h.aggregator, 1, "Alice", ts(0));
        h.aggregator.remove_session(SessionId(1), ts(60));
        assert_eq!(h.aggregator.reconnection_deadline_since(), Some(ts(60)));

        // Deadline not yet elapsed.
        let verdict = h.aggregator.tick(ts(60 + 4 * 60));
        assert!(!verdict.finalize_abandoned);

        let verdict = h.aggregator.tick(ts(60 + 5 * 60));
        assert!(verdict.finalize_abandoned);
    }

    #[test]
    fn eligible_session_clears_the_deadline() {
        let mut h = harness(&["Alice"]);
        let _rx = attach(&mut h.aggregator, 1, "Alice", ts(0));
        h.aggregator.remove_session(SessionId(1), ts(60));
        assert!(h.aggregator.reconnection_deadline_since().is_some());

        let _rx = attach(&mut h.aggregator, 2, "Alice", ts(120));
        let verdict = h.aggregator.tick(ts(180));
        assert!(!verdict.finalize_abandoned);
        assert!(h.aggregator.reconnection_deadline_since().is_none());
    }

    #[test]
    fn forced_termination_notifies_every_session() {
        let mut h = harness(&["Alice", "Bob"]);
        let mut rx_a = attach(&mut h.aggregator, 1, "Alice", ts(0));
        let mut rx_b = attach(&mut h.aggregator, 2, "Bob", ts(1));

        let detached = h.aggregator.notify_ended_and_detach_all();
        assert_eq!(detached, vec![SessionId(1), SessionId(2)]);
        assert_eq!(h.aggregator.session_count(), 0);

        for rx in [&mut rx_a, &mut rx_b] {
            let message = rx.try_recv().expect("termination notice should be queued");
            let ServerMessage::Error { code, .. } = message else {
                panic!("expected error message");
            };
            assert_eq!(code, "CHALLENGE_RECORDING_ENDED");
        }
    }

    #[test]
    fn spectator_completion_does_not_mark_members() {
        let mut h = harness(&["Alice"]);
        let (tx, _rx) = mpsc::unbounded_channel();
        h.aggregator
            .add_session(
                SessionId(9),
                RecordingType::Spectator,
                "Watcher".to_string(),
                tx,
                ts(0),
            )
            .expect("attach should succeed");
        h.aggregator
            .mark_completion(SessionId(9), 0, 0, &h.players, ts(1))
            .expect("completion should record");
        assert!(!h.aggregator.challenge().member_completed("watcher"));
    }
}
