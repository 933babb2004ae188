// Staged graceful shutdown.
//
// A pending shutdown stops the directory from admitting new challenges
// and announces itself to every live session; in-flight challenges keep
// streaming until the deadline. Cancellation reverses both. When the
// deadline arrives the manager broadcasts a final notice and releases
// the serve loop through a Notify.

use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use chronicle_common::protocol::ws::{ServerMessage, ServerStatusKind};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::info;

use crate::challenge::directory::ChallengeDirectory;
use crate::session::SessionRegistry;

struct ShutdownState {
    status: ServerStatusKind,
    shutdown_at: Option<DateTime<Utc>>,
    countdown: Option<JoinHandle<()>>,
}

pub struct ServerStatusManager {
    registry: Arc<SessionRegistry>,
    directory: Arc<ChallengeDirectory>,
    state: Mutex<ShutdownState>,
    shutdown: Notify,
    /// Handle to ourselves for the countdown task; weak so the task never
    /// keeps the manager alive.
    weak_self: Weak<ServerStatusManager>,
}

impl ServerStatusManager {
    pub fn new(registry: Arc<SessionRegistry>, directory: Arc<ChallengeDirectory>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            registry,
            directory,
            state: Mutex::new(ShutdownState {
                status: ServerStatusKind::Running,
                shutdown_at: None,
                countdown: None,
            }),
            shutdown: Notify::new(),
            weak_self: weak.clone(),
        })
    }

    /// Current status, as reported to freshly connected sessions.
    pub async fn status(&self) -> (ServerStatusKind, Option<DateTime<Utc>>) {
        let state = self.state.lock().await;
        (state.status, state.shutdown_at)
    }

    /// Schedule a shutdown at `at`. A pending shutdown is only moved when
    /// `force` is set. Returns whether the schedule was applied.
    pub async fn schedule_shutdown(&self, at: DateTime<Utc>, force: bool) -> bool {
        let mut state = self.state.lock().await;
        if state.status == ServerStatusKind::ShutdownPending && !force {
            return false;
        }
        if let Some(countdown) = state.countdown.take() {
            countdown.abort();
        }
        state.status = ServerStatusKind::ShutdownPending;
        state.shutdown_at = Some(at);
        self.directory.set_accepting(false);
        info!(shutdown_at = %at, force, "shutdown scheduled");

        self.registry
            .broadcast(ServerMessage::ServerStatus {
                status: ServerStatusKind::ShutdownPending,
                shutdown_at: Some(at),
            })
            .await;

        let manager = self.weak_self.clone();
        state.countdown = Some(tokio::spawn(async move {
            let delay = (at - Utc::now()).to_std().unwrap_or_default();
            tokio::time::sleep(delay).await;
            if let Some(manager) = manager.upgrade() {
                manager.enter_imminent().await;
            }
        }));
        true
    }

    async fn enter_imminent(&self) {
        {
            let mut state = self.state.lock().await;
            if state.status != ServerStatusKind::ShutdownPending {
                return;
            }
            state.status = ServerStatusKind::ShutdownImminent;
            state.countdown = None;
        }
        info!("shutdown deadline reached");
        self.registry
            .broadcast(ServerMessage::ServerStatus {
                status: ServerStatusKind::ShutdownImminent,
                shutdown_at: None,
            })
            .await;
        self.shutdown.notify_waiters();
    }

    /// Cancel a pending shutdown and resume admitting challenges. Returns
    /// whether there was one to cancel.
    pub async fn cancel_shutdown(&self) -> bool {
        {
            let mut state = self.state.lock().await;
            if state.status != ServerStatusKind::ShutdownPending {
                return false;
            }
            if let Some(countdown) = state.countdown.take() {
                countdown.abort();
            }
            state.status = ServerStatusKind::Running;
            state.shutdown_at = None;
        }
        self.directory.set_accepting(true);
        info!("shutdown canceled");
        self.registry
            .broadcast(ServerMessage::ServerStatus {
                status: ServerStatusKind::ShutdownCanceled,
                shutdown_at: None,
            })
            .await;
        true
    }

    /// Resolves when the shutdown deadline has been reached.
    pub async fn wait_for_shutdown(&self) {
        self.shutdown.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::players::PlayerDirectory;
    use crate::store::MemoryStore;
    use chrono::Duration;
    use tokio::sync::mpsc;

    fn harness() -> (Arc<SessionRegistry>, Arc<ServerStatusManager>, Arc<ChallengeDirectory>) {
        let registry = Arc::new(SessionRegistry::default());
        let store = Arc::new(MemoryStore::default());
        let players = Arc::new(PlayerDirectory::new(store.clone()));
        let directory = ChallengeDirectory::new(registry.clone(), store, players);
        let manager = ServerStatusManager::new(registry.clone(), directory.clone());
        (registry, manager, directory)
    }

    async fn connect(registry: &SessionRegistry) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        let user = crate::session::AuthenticatedUser {
            user_id: uuid::Uuid::new_v4(),
            username: "alice".to_string(),
            player_name: "Alice".to_string(),
        };
        registry.register(user, tx, Utc::now()).await;
        rx
    }

    #[tokio::test(start_paused = true)]
    async fn pending_shutdown_is_announced_and_blocks_admission() {
        let (registry, manager, directory) = harness();
        let mut rx = connect(&registry).await;

        let at = Utc::now() + Duration::minutes(5);
        assert!(manager.schedule_shutdown(at, false).await);
        assert!(!directory.is_accepting());

        let message = rx.recv().await.expect("status broadcast should arrive");
        let ServerMessage::ServerStatus { status, shutdown_at } = message else {
            panic!("expected a server status broadcast");
        };
        assert_eq!(status, ServerStatusKind::ShutdownPending);
        assert_eq!(shutdown_at, Some(at));

        // A second non-forced schedule does not move the deadline.
        assert!(!manager.schedule_shutdown(at + Duration::minutes(10), false).await);
        // A forced one does.
        assert!(manager.schedule_shutdown(at + Duration::minutes(10), true).await);
    }

    #[tokio::test(start_paused = true)]
    async fn countdown_reaches_imminent_and_releases_waiters() {
        let (registry, manager, _directory) = harness();
        let mut rx = connect(&registry).await;

        manager.schedule_shutdown(Utc::now() + Duration::seconds(30), false).await;
        let _ = rx.recv().await;

        manager.wait_for_shutdown().await;
        let (status, _) = manager.status().await;
        assert_eq!(status, ServerStatusKind::ShutdownImminent);
        let message = rx.recv().await.expect("imminent broadcast should arrive");
        assert!(matches!(
            message,
            ServerMessage::ServerStatus { status: ServerStatusKind::ShutdownImminent, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_resumes_admission() {
        let (registry, manager, directory) = harness();
        let mut rx = connect(&registry).await;

        manager.schedule_shutdown(Utc::now() + Duration::minutes(5), false).await;
        let _ = rx.recv().await;
        assert!(manager.cancel_shutdown().await);
        assert!(directory.is_accepting());

        let message = rx.recv().await.expect("cancellation broadcast should arrive");
        assert!(matches!(
            message,
            ServerMessage::ServerStatus { status: ServerStatusKind::ShutdownCanceled, .. }
        ));

        // Nothing pending, nothing to cancel.
        assert!(!manager.cancel_shutdown().await);
    }
}
