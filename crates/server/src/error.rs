// Error registry for the event server.
//
// `ErrorCode` covers everything surfaced to clients over the socket;
// `ChallengeError` covers failures inside the challenge engine, most of
// which are handled locally (logged and dropped) per the protocol's
// tolerance for malformed or stale client input.

use chronicle_common::protocol::ws::ServerMessage;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Unauthenticated,
    InvalidMessage,
    UsernameMismatch,
    RecordingEnded,
    UnsupportedMode,
    UnsupportedPartySize,
    ShutdownPending,
    InternalError,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::InvalidMessage => "INVALID_MESSAGE",
            Self::UsernameMismatch => "USERNAME_MISMATCH",
            Self::RecordingEnded => "CHALLENGE_RECORDING_ENDED",
            Self::UnsupportedMode => "UNSUPPORTED_MODE",
            Self::UnsupportedPartySize => "UNSUPPORTED_PARTY_SIZE",
            Self::ShutdownPending => "SHUTDOWN_PENDING",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    pub const fn retryable(self) -> bool {
        matches!(self, Self::ShutdownPending | Self::InternalError)
    }

    pub const fn default_message(self) -> &'static str {
        match self {
            Self::Unauthenticated => "invalid or missing API token",
            Self::InvalidMessage => "invalid websocket frame payload",
            Self::UsernameMismatch => {
                "reported in-game name does not match the authenticated player"
            }
            Self::RecordingEnded => "recording for this challenge has ended",
            Self::UnsupportedMode => "this challenge mode is not recorded",
            Self::UnsupportedPartySize => "party size is not supported for this challenge",
            Self::ShutdownPending => "server is shutting down; new challenges are not accepted",
            Self::InternalError => "internal server error",
        }
    }

    /// Build the protocol error message for this code.
    pub fn to_message(self) -> ServerMessage {
        ServerMessage::Error {
            code: self.as_str().to_string(),
            message: self.default_message().to_string(),
            retryable: self.retryable(),
        }
    }
}

/// Failures inside the challenge engine.
#[derive(Debug, thiserror::Error)]
pub enum ChallengeError {
    #[error("challenge {0} not found")]
    NotFound(Uuid),

    #[error("session {session_id} is already attached to challenge {challenge_id}")]
    AlreadyAttached { session_id: u64, challenge_id: Uuid },

    #[error("session {0} is not attached to a challenge")]
    NotAttached(u64),

    #[error("session {0} is not connected")]
    UnknownSession(u64),

    #[error("unsupported mode for this challenge")]
    UnsupportedMode,

    #[error("unsupported party size {0}")]
    UnsupportedPartySize(usize),

    #[error("server shutdown pending; not accepting new challenges")]
    ShutdownPending,

    #[error("persistence failure: {0}")]
    Store(#[from] anyhow::Error),
}

impl ChallengeError {
    /// Client-facing code for errors that are surfaced rather than just
    /// logged.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::UnsupportedMode => ErrorCode::UnsupportedMode,
            Self::UnsupportedPartySize(_) => ErrorCode::UnsupportedPartySize,
            Self::ShutdownPending => ErrorCode::ShutdownPending,
            Self::AlreadyAttached { .. } | Self::NotAttached(_) | Self::UnknownSession(_) => {
                ErrorCode::InvalidMessage
            }
            Self::NotFound(_) | Self::Store(_) => ErrorCode::InternalError,
        }
    }
}
