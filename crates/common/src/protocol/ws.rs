// WebSocket message types for the chronicle-events.v1 protocol.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::ChallengeEvent;
use crate::types::{ChallengeMode, ChallengeType, RecordingType, Stage};

/// Client -> Server messages in the chronicle-events.v1 protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Reply to a server heartbeat ping.
    Pong,

    /// The client's in-game login state changed.
    GameState { state: GameState },

    /// Start a new challenge or join the party's existing one.
    StartChallenge {
        challenge: ChallengeType,
        #[serde(skip_serializing_if = "Option::is_none")]
        mode: Option<ChallengeMode>,
        party: Vec<String>,
        stage: Stage,
        recording_type: RecordingType,
    },

    /// The client observed the end of its challenge. Tick values of zero
    /// mean the client could not measure the corresponding duration.
    EndChallenge { challenge_ticks: u32, overall_ticks: u32 },

    /// A batch of telemetry events. Not guaranteed to be tick-ordered on
    /// the wire; the server sorts before processing.
    EventStream { events: Vec<ChallengeEvent> },

    /// Reply to a challenge-state-confirmation request.
    StateConfirmation { challenge_id: Uuid, valid: bool, recording_type: RecordingType },
}

/// In-game login state reported by a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GameState {
    LoggedIn { username: String },
    LoggedOut,
}

/// Server -> Client messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once after authentication; assigns the connection identity.
    ConnectionAck { session_id: u64, username: String },

    /// Heartbeat; clients answer with `pong`.
    Ping,

    /// Result of a start-challenge request. A missing id signals rejection.
    ActiveChallenge {
        #[serde(skip_serializing_if = "Option::is_none")]
        challenge_id: Option<Uuid>,
    },

    /// Liveness probe: asks the client to confirm the state the server has
    /// recorded for it.
    StateConfirmationRequest {
        username: String,
        challenge_id: Uuid,
        challenge: ChallengeType,
        #[serde(skip_serializing_if = "Option::is_none")]
        mode: Option<ChallengeMode>,
        stage: Stage,
        party: Vec<String>,
    },

    /// Typed error. `retryable` hints whether the client may retry the
    /// triggering action.
    Error { code: String, message: String, retryable: bool },

    /// Server-wide status broadcast (maintenance/shutdown).
    ServerStatus {
        status: ServerStatusKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        shutdown_at: Option<DateTime<Utc>>,
    },
}

/// Broadcast server states, in escalation order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatusKind {
    Running,
    ShutdownPending,
    ShutdownCanceled,
    ShutdownImminent,
    Offline,
}
