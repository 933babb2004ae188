// Live session bookkeeping.
//
// A Session is one authenticated socket. The registry is the only
// component that mutates the live-session index; everything else reaches
// sessions through `send`/`broadcast` or the challenge directory.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use chronicle_common::protocol::ws::ServerMessage;
use chronicle_common::types::normalize_name;
use tokio::sync::{mpsc, RwLock};
use tracing::warn;
use uuid::Uuid;

use crate::error::ChallengeError;

/// Opaque session identifier. Strictly increasing, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity established from a valid API token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: Uuid,
    pub username: String,
    /// The in-game player name linked to this account.
    pub player_name: String,
}

/// Credential verification seam. The production implementation holds a
/// static token registry from config; tests supply their own.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> Option<AuthenticatedUser>;
}

/// Token registry parsed from `token=username:player_name` entries.
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, AuthenticatedUser>,
}

impl StaticTokenAuthenticator {
    pub fn from_spec(spec: &str) -> Self {
        let mut tokens = HashMap::new();
        for entry in spec.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
            let Some((token, identity)) = entry.split_once('=') else {
                warn!(entry, "skipping malformed api token entry");
                continue;
            };
            let Some((username, player_name)) = identity.split_once(':') else {
                warn!(entry, "skipping malformed api token entry");
                continue;
            };
            tokens.insert(
                token.to_string(),
                AuthenticatedUser {
                    user_id: Uuid::new_v4(),
                    username: username.to_string(),
                    player_name: player_name.to_string(),
                },
            );
        }
        Self { tokens }
    }
}

impl Authenticator for StaticTokenAuthenticator {
    fn authenticate(&self, token: &str) -> Option<AuthenticatedUser> {
        self.tokens.get(token).cloned()
    }
}

#[derive(Debug)]
struct SessionRecord {
    user: AuthenticatedUser,
    /// In-game name currently logged in on this client. Set/cleared by
    /// game-state telemetry, not by the connection itself.
    player_name: Option<String>,
    active_challenge: Option<Uuid>,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    last_heartbeat: DateTime<Utc>,
}

/// Registry of live sessions, indexed by id.
#[derive(Default)]
pub struct SessionRegistry {
    next_id: AtomicU64,
    sessions: RwLock<HashMap<SessionId, SessionRecord>>,
}

impl SessionRegistry {
    /// Register a freshly authenticated connection and allocate its id.
    pub async fn register(
        &self,
        user: AuthenticatedUser,
        outbound: mpsc::UnboundedSender<ServerMessage>,
        now: DateTime<Utc>,
    ) -> SessionId {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let record = SessionRecord {
            user,
            player_name: None,
            active_challenge: None,
            outbound,
            last_heartbeat: now,
        };
        self.sessions.write().await.insert(id, record);
        id
    }

    /// Remove a session on close. Ids are never reassigned, so a removed
    /// session is permanently inert.
    pub async fn remove(&self, id: SessionId) -> bool {
        self.sessions.write().await.remove(&id).is_some()
    }

    pub async fn send(&self, id: SessionId, message: ServerMessage) -> bool {
        let sessions = self.sessions.read().await;
        match sessions.get(&id) {
            Some(record) => record.outbound.send(message).is_ok(),
            None => false,
        }
    }

    /// Send a message to every live session. Used for server-wide status
    /// broadcasts.
    pub async fn broadcast(&self, message: ServerMessage) {
        let senders: Vec<mpsc::UnboundedSender<ServerMessage>> =
            self.sessions.read().await.values().map(|record| record.outbound.clone()).collect();
        for sender in senders {
            let _ = sender.send(message.clone());
        }
    }

    pub async fn sender(&self, id: SessionId) -> Option<mpsc::UnboundedSender<ServerMessage>> {
        self.sessions.read().await.get(&id).map(|record| record.outbound.clone())
    }

    pub async fn user(&self, id: SessionId) -> Option<AuthenticatedUser> {
        self.sessions.read().await.get(&id).map(|record| record.user.clone())
    }

    pub async fn set_player_name(&self, id: SessionId, name: Option<String>) {
        if let Some(record) = self.sessions.write().await.get_mut(&id) {
            record.player_name = name;
        }
    }

    /// The in-game name this session records as, falling back to the
    /// account's linked player when no login has been reported.
    pub async fn recording_name(&self, id: SessionId) -> Option<String> {
        self.sessions
            .read()
            .await
            .get(&id)
            .map(|record| record.player_name.clone().unwrap_or_else(|| record.user.player_name.clone()))
    }

    pub async fn record_pong(&self, id: SessionId, now: DateTime<Utc>) {
        if let Some(record) = self.sessions.write().await.get_mut(&id) {
            record.last_heartbeat = now;
        }
    }

    pub async fn last_heartbeat(&self, id: SessionId) -> Option<DateTime<Utc>> {
        self.sessions.read().await.get(&id).map(|record| record.last_heartbeat)
    }

    /// Attach a session to a challenge. A session streams for at most one
    /// challenge at a time; attaching while attached is rejected.
    pub async fn attach(&self, id: SessionId, challenge_id: Uuid) -> Result<(), ChallengeError> {
        let mut sessions = self.sessions.write().await;
        let record = sessions.get_mut(&id).ok_or(ChallengeError::UnknownSession(id.0))?;
        if let Some(existing) = record.active_challenge {
            if existing != challenge_id {
                return Err(ChallengeError::AlreadyAttached {
                    session_id: id.0,
                    challenge_id: existing,
                });
            }
            return Ok(());
        }
        record.active_challenge = Some(challenge_id);
        Ok(())
    }

    /// Detach a session from its challenge, returning the challenge id it
    /// was attached to.
    pub async fn detach(&self, id: SessionId) -> Option<Uuid> {
        self.sessions.write().await.get_mut(&id).and_then(|record| record.active_challenge.take())
    }

    pub async fn active_challenge(&self, id: SessionId) -> Option<Uuid> {
        self.sessions.read().await.get(&id).and_then(|record| record.active_challenge)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// True when the reported in-game name belongs to the authenticated
/// account's linked player.
pub fn username_matches(user: &AuthenticatedUser, reported: &str) -> bool {
    normalize_name(&user.player_name) == normalize_name(reported)
}
