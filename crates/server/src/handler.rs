// Per-message protocol logic, between the socket loop and the challenge
// engine.
//
// Client mistakes are cheap here: malformed or out-of-order messages are
// logged and dropped, and only the errors the protocol defines are sent
// back. The socket loop owns framing and heartbeats; this type owns
// meaning.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use chronicle_common::protocol::ws::{ClientMessage, GameState, ServerMessage};
use chronicle_common::types::RecordingType;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::challenge::directory::{ChallengeDirectory, ClientStatus, StartRequest};
use crate::error::{ChallengeError, ErrorCode};
use crate::players::PlayerDirectory;
use crate::session::{username_matches, SessionId, SessionRegistry};

pub struct MessageHandler {
    registry: Arc<SessionRegistry>,
    directory: Arc<ChallengeDirectory>,
    players: Arc<PlayerDirectory>,
}

impl MessageHandler {
    pub fn new(
        registry: Arc<SessionRegistry>,
        directory: Arc<ChallengeDirectory>,
        players: Arc<PlayerDirectory>,
    ) -> Self {
        Self { registry, directory, players }
    }

    pub async fn handle(&self, session_id: SessionId, message: ClientMessage, now: DateTime<Utc>) {
        match message {
            ClientMessage::Pong => self.registry.record_pong(session_id, now).await,
            ClientMessage::GameState { state } => self.handle_game_state(session_id, state, now).await,
            ClientMessage::StartChallenge { challenge, mode, party, stage, recording_type } => {
                self.handle_start(session_id, challenge, mode, party, stage, recording_type, now)
                    .await
            }
            ClientMessage::EndChallenge { challenge_ticks, overall_ticks } => {
                if let Err(error) =
                    self.directory.mark_completion(session_id, challenge_ticks, overall_ticks, now).await
                {
                    // Duplicate or unattached completion reports are part of
                    // normal reconnection churn.
                    debug!(session_id = %session_id, error = %error, "ignoring completion report");
                }
            }
            ClientMessage::EventStream { events } => {
                if let Err(error) = self.directory.process_events(session_id, events, now).await {
                    match error {
                        ChallengeError::UnsupportedMode => {
                            warn!(session_id = %session_id, "unsupported mode detected mid-stream");
                        }
                        other => {
                            debug!(session_id = %session_id, error = %other, "ignoring event batch");
                        }
                    }
                }
            }
            ClientMessage::StateConfirmation { challenge_id, valid, recording_type } => {
                self.handle_state_confirmation(session_id, challenge_id, valid, recording_type, now)
                    .await;
            }
        }
    }

    async fn handle_game_state(&self, session_id: SessionId, state: GameState, now: DateTime<Utc>) {
        match state {
            GameState::LoggedIn { username } => {
                let Some(user) = self.registry.user(session_id).await else {
                    return;
                };
                if !username_matches(&user, &username) {
                    warn!(
                        session_id = %session_id,
                        expected = user.player_name,
                        reported = username,
                        "in-game name does not match authenticated player"
                    );
                    self.registry
                        .send(session_id, ErrorCode::UsernameMismatch.to_message())
                        .await;
                    return;
                }
                self.registry.set_player_name(session_id, Some(username.clone())).await;
                self.directory.update_client_status(session_id, ClientStatus::Active, now).await;

                // The player may have an unfinished recording from a dropped
                // connection; ask the client to confirm it before resuming.
                if self.registry.active_challenge(session_id).await.is_none() {
                    if let Some(challenge_id) = self.players.active_challenge(&username) {
                        if let Some(info) = self.directory.challenge_info(challenge_id).await {
                            self.registry
                                .send(
                                    session_id,
                                    ServerMessage::StateConfirmationRequest {
                                        username,
                                        challenge_id: info.id,
                                        challenge: info.challenge,
                                        mode: info.mode,
                                        stage: info.stage,
                                        party: info.party,
                                    },
                                )
                                .await;
                        }
                    }
                }
            }
            GameState::LoggedOut => {
                self.registry.set_player_name(session_id, None).await;
                self.directory.update_client_status(session_id, ClientStatus::Inactive, now).await;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_start(
        &self,
        session_id: SessionId,
        challenge: chronicle_common::types::ChallengeType,
        mode: Option<chronicle_common::types::ChallengeMode>,
        party: Vec<String>,
        stage: chronicle_common::types::Stage,
        recording_type: RecordingType,
        now: DateTime<Utc>,
    ) {
        let Some(player_name) = self.registry.recording_name(session_id).await else {
            return;
        };
        let Some(outbound) = self.registry.sender(session_id).await else {
            return;
        };
        let request = StartRequest {
            session_id,
            recording_type,
            player_name,
            challenge,
            mode,
            party,
            stage,
        };
        match self.directory.start_or_join(request, outbound, now).await {
            Ok(challenge_id) => {
                self.registry
                    .send(session_id, ServerMessage::ActiveChallenge { challenge_id: Some(challenge_id) })
                    .await;
            }
            Err(error) => {
                debug!(session_id = %session_id, error = %error, "start challenge rejected");
                self.registry.send(session_id, error.error_code().to_message()).await;
                self.registry
                    .send(session_id, ServerMessage::ActiveChallenge { challenge_id: None })
                    .await;
            }
        }
    }

    async fn handle_state_confirmation(
        &self,
        session_id: SessionId,
        challenge_id: Uuid,
        valid: bool,
        recording_type: RecordingType,
        now: DateTime<Utc>,
    ) {
        if valid {
            let Some(player_name) = self.registry.recording_name(session_id).await else {
                return;
            };
            let Some(outbound) = self.registry.sender(session_id).await else {
                return;
            };
            if let Err(error) = self
                .directory
                .rejoin(session_id, challenge_id, recording_type, player_name, outbound, now)
                .await
            {
                debug!(session_id = %session_id, error = %error, "rejoin failed");
                self.registry.send(session_id, ErrorCode::RecordingEnded.to_message()).await;
            }
            return;
        }

        // The client disowned the recorded state; close out its side of the
        // challenge and tell it to drop any local recording.
        if self.registry.active_challenge(session_id).await == Some(challenge_id) {
            if let Err(error) = self.directory.mark_completion(session_id, 0, 0, now).await {
                debug!(session_id = %session_id, error = %error, "could not close disowned challenge");
            }
        }
        if let Some(player_name) = self.registry.recording_name(session_id).await {
            self.players.end_recording(&player_name, challenge_id);
        }
        self.registry.send(session_id, ErrorCode::RecordingEnded.to_message()).await;
    }

    /// Socket close path: detach from any challenge and drop the session.
    pub async fn handle_disconnect(&self, session_id: SessionId, now: DateTime<Utc>) {
        self.directory.update_client_status(session_id, ClientStatus::Disconnected, now).await;
        self.registry.remove(session_id).await;
    }
}
