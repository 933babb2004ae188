// Challenge directory: join-or-create resolution and challenge lifetime.
//
// The directory owns both indices (challenge id and party fingerprint)
// behind a single async mutex, so racing start requests for the same
// fresh party are resolved strictly sequentially and only one challenge
// is ever created. Each tracked challenge gets a watchdog task that runs
// the aggregator's liveness checks once per minute; the task holds a
// Weak reference so it never keeps the directory alive.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use chronicle_common::event::ChallengeEvent;
use chronicle_common::protocol::ws::ServerMessage;
use chronicle_common::types::{
    party_fingerprint, ChallengeMode, ChallengeStatus, ChallengeType, RecordingType, Stage,
};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::aggregator::{StreamAggregator, CLIENT_REMOVAL_GRACE_MS, WATCHDOG_PERIOD_SECONDS};
use super::{Challenge, ChallengeInfo, ChallengeState};
use crate::error::ChallengeError;
use crate::players::PlayerDirectory;
use crate::session::{SessionId, SessionRegistry};
use crate::store::ChallengeStore;

/// Session liveness as reported by its connection and game state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Active,
    Inactive,
    Disconnected,
}

/// Parameters of a start-or-join request.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub session_id: SessionId,
    pub recording_type: RecordingType,
    pub player_name: String,
    pub challenge: ChallengeType,
    pub mode: Option<ChallengeMode>,
    pub party: Vec<String>,
    pub stage: Stage,
}

struct DirectoryState {
    by_id: HashMap<Uuid, Arc<Mutex<StreamAggregator>>>,
    /// Party fingerprint -> most recent challenge for that party.
    by_party: HashMap<String, Uuid>,
    watchdogs: HashMap<Uuid, JoinHandle<()>>,
}

pub struct ChallengeDirectory {
    registry: Arc<SessionRegistry>,
    store: Arc<dyn ChallengeStore>,
    players: Arc<PlayerDirectory>,
    accepting: AtomicBool,
    state: Mutex<DirectoryState>,
    /// Handle to ourselves for spawned tasks; weak so a task never keeps
    /// the directory alive.
    weak_self: Weak<ChallengeDirectory>,
}

impl ChallengeDirectory {
    pub fn new(
        registry: Arc<SessionRegistry>,
        store: Arc<dyn ChallengeStore>,
        players: Arc<PlayerDirectory>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            registry,
            store,
            players,
            accepting: AtomicBool::new(true),
            state: Mutex::new(DirectoryState {
                by_id: HashMap::new(),
                by_party: HashMap::new(),
                watchdogs: HashMap::new(),
            }),
            weak_self: weak.clone(),
        })
    }

    /// Whether new challenges are admitted. Toggled by the shutdown
    /// manager; existing challenges keep streaming either way.
    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub async fn active_count(&self) -> usize {
        self.state.lock().await.by_id.len()
    }

    pub async fn challenge_info(&self, id: Uuid) -> Option<ChallengeInfo> {
        let handle = self.state.lock().await.by_id.get(&id).cloned()?;
        let aggregator = handle.lock().await;
        Some(aggregator.challenge().info())
    }

    /// Resolve a start request to a challenge, joining the party's most
    /// recent one when the request is a plausible continuation of it and
    /// creating a fresh one otherwise.
    pub async fn start_or_join(
        &self,
        request: StartRequest,
        outbound: mpsc::UnboundedSender<ServerMessage>,
        now: DateTime<Utc>,
    ) -> Result<Uuid, ChallengeError> {
        if !self.is_accepting() {
            return Err(ChallengeError::ShutdownPending);
        }
        validate_party_size(request.challenge, request.party.len())?;

        let key = party_fingerprint(request.challenge, &request.party);
        let mut state = self.state.lock().await;

        if let Some(&existing_id) = state.by_party.get(&key) {
            if let Some(handle) = state.by_id.get(&existing_id).cloned() {
                let mut aggregator = handle.lock().await;
                if self.can_join(&aggregator, &request) {
                    if let Some(mode) = request.mode {
                        aggregator.challenge_mut().update_mode(mode)?;
                    }
                    self.registry.attach(request.session_id, existing_id).await?;
                    if aggregator.contains_session(request.session_id) {
                        aggregator.set_session_active(request.session_id, now);
                    } else {
                        aggregator.add_session(
                            request.session_id,
                            request.recording_type,
                            request.player_name.clone(),
                            outbound,
                            now,
                        )?;
                    }
                    if request.recording_type == RecordingType::Participant {
                        self.players.begin_recording(&request.player_name, existing_id);
                    }
                    debug!(challenge_id = %existing_id, session_id = %request.session_id, "joined existing challenge");
                    return Ok(existing_id);
                }
                info!(
                    challenge_id = %existing_id,
                    session_id = %request.session_id,
                    "existing challenge is a stale or finished attempt; starting fresh"
                );
            }
        }

        let id = Uuid::new_v4();
        self.registry.attach(request.session_id, id).await?;
        let challenge = match Challenge::new(
            self.store.clone(),
            self.players.clone(),
            id,
            request.challenge,
            request.mode,
            request.party.clone(),
            request.stage,
            now,
        ) {
            Ok(challenge) => challenge,
            Err(error) => {
                self.registry.detach(request.session_id).await;
                return Err(error);
            }
        };

        let mut aggregator = StreamAggregator::new(challenge, now);
        if let Err(error) = aggregator.add_session(
            request.session_id,
            request.recording_type,
            request.player_name.clone(),
            outbound,
            now,
        ) {
            self.registry.detach(request.session_id).await;
            aggregator.challenge_mut().terminate();
            return Err(error);
        }
        if request.recording_type == RecordingType::Participant {
            self.players.begin_recording(&request.player_name, id);
        }

        state.by_id.insert(id, Arc::new(Mutex::new(aggregator)));
        state.by_party.insert(key, id);
        state.watchdogs.insert(id, self.spawn_watchdog(id));
        Ok(id)
    }

    /// A request continues the existing challenge unless the challenge is
    /// already ending, the requester already completed it (a fresh attempt
    /// by the same party), or the reported stage is strictly earlier than
    /// the tracked one (a restart while a stale session is still live).
    fn can_join(&self, aggregator: &StreamAggregator, request: &StartRequest) -> bool {
        let challenge = aggregator.challenge();
        if challenge.state() == ChallengeState::Ending {
            return false;
        }
        if request.recording_type == RecordingType::Participant
            && challenge.member_completed(&request.player_name)
        {
            return false;
        }
        request.stage >= challenge.stage()
    }

    /// Re-attach a session to a challenge it previously streamed for,
    /// e.g. after a confirmed liveness probe.
    pub async fn rejoin(
        &self,
        session_id: SessionId,
        challenge_id: Uuid,
        recording_type: RecordingType,
        player_name: String,
        outbound: mpsc::UnboundedSender<ServerMessage>,
        now: DateTime<Utc>,
    ) -> Result<(), ChallengeError> {
        let handle = self
            .state
            .lock()
            .await
            .by_id
            .get(&challenge_id)
            .cloned()
            .ok_or(ChallengeError::NotFound(challenge_id))?;
        self.registry.attach(session_id, challenge_id).await?;
        let mut aggregator = handle.lock().await;
        if aggregator.contains_session(session_id) {
            aggregator.set_session_active(session_id, now);
        } else {
            aggregator.add_session(session_id, recording_type, player_name.clone(), outbound, now)?;
        }
        if recording_type == RecordingType::Participant {
            self.players.begin_recording(&player_name, challenge_id);
        }
        Ok(())
    }

    /// Apply a batch of telemetry from a session, in tick order. Detecting
    /// an unsupported mode mid-stream terminates the whole challenge.
    pub async fn process_events(
        &self,
        session_id: SessionId,
        mut events: Vec<ChallengeEvent>,
        now: DateTime<Utc>,
    ) -> Result<(), ChallengeError> {
        let challenge_id = self
            .registry
            .active_challenge(session_id)
            .await
            .ok_or(ChallengeError::NotAttached(session_id.0))?;
        let handle = self
            .state
            .lock()
            .await
            .by_id
            .get(&challenge_id)
            .cloned()
            .ok_or(ChallengeError::NotFound(challenge_id))?;

        events.sort_by_key(|event| event.tick);
        let mut aggregator = handle.lock().await;
        for event in &events {
            if let Err(error) = aggregator.process(session_id, event, now) {
                if matches!(error, ChallengeError::UnsupportedMode) {
                    drop(aggregator);
                    self.terminate_challenge(challenge_id).await;
                }
                return Err(error);
            }
        }
        Ok(())
    }

    /// Record a session's completion report and finalize the challenge
    /// once every attached session has reported.
    pub async fn mark_completion(
        &self,
        session_id: SessionId,
        challenge_ticks: u32,
        overall_ticks: u32,
        now: DateTime<Utc>,
    ) -> Result<(), ChallengeError> {
        let challenge_id = self
            .registry
            .active_challenge(session_id)
            .await
            .ok_or(ChallengeError::NotAttached(session_id.0))?;
        let handle = self
            .state
            .lock()
            .await
            .by_id
            .get(&challenge_id)
            .cloned()
            .ok_or(ChallengeError::NotFound(challenge_id))?;

        let outcome = {
            let mut aggregator = handle.lock().await;
            aggregator.mark_completion(session_id, challenge_ticks, overall_ticks, &self.players, now)?
        };

        if outcome.recorded {
            // Detach after a short grace so sibling completion reports can
            // land while this session is still counted.
            let directory = self.weak_self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(CLIENT_REMOVAL_GRACE_MS))
                    .await;
                if let Some(directory) = directory.upgrade() {
                    directory.detach_session(session_id, challenge_id, Utc::now()).await;
                }
            });
        }
        if outcome.complete && !outcome.deferred {
            self.end_challenge(challenge_id, None, now).await;
        }
        Ok(())
    }

    /// Detach one session from a challenge, both in the aggregator and in
    /// the registry.
    pub async fn detach_session(&self, session_id: SessionId, challenge_id: Uuid, now: DateTime<Utc>) {
        let handle = self.state.lock().await.by_id.get(&challenge_id).cloned();
        if let Some(handle) = handle {
            handle.lock().await.remove_session(session_id, now);
        }
        if self.registry.active_challenge(session_id).await == Some(challenge_id) {
            self.registry.detach(session_id).await;
        }
    }

    /// Propagate a session's liveness change to the challenge it streams
    /// for, if any.
    pub async fn update_client_status(&self, session_id: SessionId, status: ClientStatus, now: DateTime<Utc>) {
        let Some(challenge_id) = self.registry.active_challenge(session_id).await else {
            return;
        };
        let handle = self.state.lock().await.by_id.get(&challenge_id).cloned();
        let Some(handle) = handle else {
            self.registry.detach(session_id).await;
            return;
        };
        let mut aggregator = handle.lock().await;
        match status {
            ClientStatus::Active => aggregator.set_session_active(session_id, now),
            ClientStatus::Inactive => aggregator.set_session_inactive(session_id, now),
            ClientStatus::Disconnected => {
                aggregator.remove_session(session_id, now);
                drop(aggregator);
                self.registry.detach(session_id).await;
            }
        }
    }

    /// Finalize a challenge and drop it from every index.
    pub async fn end_challenge(
        &self,
        challenge_id: Uuid,
        status_override: Option<ChallengeStatus>,
        now: DateTime<Utc>,
    ) -> bool {
        let Some((handle, watchdog)) = self.forget_challenge(challenge_id).await else {
            return false;
        };
        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }

        let mut aggregator = handle.lock().await;
        let detached = aggregator.detach_all();
        for member in aggregator.challenge().party().to_vec() {
            self.players.end_recording(&member, challenge_id);
        }
        let finished = aggregator.challenge_mut().finish(status_override, now);
        drop(aggregator);

        for session in detached {
            if self.registry.active_challenge(session).await == Some(challenge_id) {
                self.registry.detach(session).await;
            }
        }
        finished
    }

    /// Forcefully end a challenge, notifying every attached session and
    /// purging the underlying record. Bypasses the normal finalize path.
    pub async fn terminate_challenge(&self, challenge_id: Uuid) {
        let Some((handle, watchdog)) = self.forget_challenge(challenge_id).await else {
            return;
        };
        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }

        let mut aggregator = handle.lock().await;
        let detached = aggregator.notify_ended_and_detach_all();
        for member in aggregator.challenge().party().to_vec() {
            self.players.end_recording(&member, challenge_id);
        }
        aggregator.challenge_mut().terminate();
        drop(aggregator);

        for session in detached {
            if self.registry.active_challenge(session).await == Some(challenge_id) {
                self.registry.detach(session).await;
            }
        }
    }

    async fn forget_challenge(
        &self,
        challenge_id: Uuid,
    ) -> Option<(Arc<Mutex<StreamAggregator>>, Option<JoinHandle<()>>)> {
        let mut state = self.state.lock().await;
        let handle = state.by_id.remove(&challenge_id)?;
        state.by_party.retain(|_, mapped| *mapped != challenge_id);
        let watchdog = state.watchdogs.remove(&challenge_id);
        Some((handle, watchdog))
    }

    /// One watchdog pass for a challenge. Returns false when the challenge
    /// is gone or was just finalized, telling the task to stop.
    pub async fn watchdog_tick(&self, challenge_id: Uuid, now: DateTime<Utc>) -> bool {
        let Some(handle) = self.state.lock().await.by_id.get(&challenge_id).cloned() else {
            return false;
        };
        let (verdict, status) = {
            let mut aggregator = handle.lock().await;
            (aggregator.tick(now), aggregator.challenge().status())
        };
        if verdict.probed > 0 {
            debug!(challenge_id = %challenge_id, probed = verdict.probed, "sent liveness probes");
        }
        if verdict.finalize_abandoned {
            // Abandoned mid-attempt degrades to a reset-class terminal
            // status rather than being dropped.
            let status_override = if status == ChallengeStatus::InProgress {
                Some(ChallengeStatus::Abandoned)
            } else {
                None
            };
            warn!(challenge_id = %challenge_id, "reconnection deadline elapsed; finalizing");
            self.end_challenge(challenge_id, status_override, now).await;
            return false;
        }
        true
    }

    fn spawn_watchdog(&self, challenge_id: Uuid) -> JoinHandle<()> {
        let directory = self.weak_self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(
                WATCHDOG_PERIOD_SECONDS,
            ));
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(directory) = directory.upgrade() else {
                    return;
                };
                if !directory.watchdog_tick(challenge_id, Utc::now()).await {
                    return;
                }
            }
        })
    }
}

fn validate_party_size(challenge: ChallengeType, size: usize) -> Result<(), ChallengeError> {
    let supported = match challenge {
        ChallengeType::Theatre => (1..=5).contains(&size),
        ChallengeType::Colosseum => size == 1,
    };
    if supported {
        Ok(())
    } else {
        Err(ChallengeError::UnsupportedPartySize(size))
    }
}
