// WebSocket transport for the chronicle-events.v1 protocol.
//
// Authentication happens on the upgrade request: a missing or unknown
// API token is rejected with 401 before any session exists. After the
// upgrade the socket task owns framing and heartbeats and forwards every
// decoded message to the MessageHandler.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use chronicle_common::protocol::ws::{ClientMessage, ServerMessage, ServerStatusKind};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::ErrorCode;
use crate::handler::MessageHandler;
use crate::session::{AuthenticatedUser, Authenticator, SessionRegistry};
use crate::shutdown::ServerStatusManager;

/// Protocol-level heartbeat period. Pongs refresh the session's
/// last-heartbeat clock; a silent client is handled by the challenge
/// watchdog, not by the socket loop.
pub const HEARTBEAT_INTERVAL_SECONDS: u64 = 30;

#[derive(Clone)]
pub struct WsRouterState {
    pub authenticator: Arc<dyn Authenticator>,
    pub registry: Arc<SessionRegistry>,
    pub handler: Arc<MessageHandler>,
    pub status: Arc<ServerStatusManager>,
}

pub fn router(state: WsRouterState) -> Router {
    Router::new().route("/ws", get(ws_upgrade)).with_state(state)
}

// The upgrade is extracted as a Result so authentication is checked
// first: a bad token gets 401 even when the request is not a websocket
// upgrade at all.
async fn ws_upgrade(
    State(state): State<WsRouterState>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let user = bearer_token(&headers)
        .and_then(|token| state.authenticator.authenticate(token));
    let Some(user) = user else {
        warn!("websocket upgrade rejected: invalid or missing api token");
        return (StatusCode::UNAUTHORIZED, Json(ErrorCode::Unauthenticated.to_message()))
            .into_response();
    };

    match ws {
        Ok(ws) => ws.on_upgrade(move |socket| handle_socket(state, user, socket)),
        Err(rejection) => rejection.into_response(),
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

async fn handle_socket(state: WsRouterState, user: AuthenticatedUser, mut socket: WebSocket) {
    let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<ServerMessage>();
    let session_id = state.registry.register(user.clone(), outbound_sender, Utc::now()).await;
    info!(session_id = %session_id, username = user.username, "session connected");

    let ack = ServerMessage::ConnectionAck { session_id: session_id.0, username: user.username };
    if send_message(&mut socket, &ack).await.is_err() {
        state.registry.remove(session_id).await;
        return;
    }

    // A client connecting into a pending shutdown learns about it up
    // front instead of waiting for the next broadcast.
    let (status, shutdown_at) = state.status.status().await;
    if status != ServerStatusKind::Running {
        let notice = ServerMessage::ServerStatus { status, shutdown_at };
        if send_message(&mut socket, &notice).await.is_err() {
            state.registry.remove(session_id).await;
            return;
        }
    }

    let mut heartbeat_interval =
        tokio::time::interval(std::time::Duration::from_secs(HEARTBEAT_INTERVAL_SECONDS));
    heartbeat_interval.reset(); // skip immediate first tick

    loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if send_message(&mut socket, &ServerMessage::Ping).await.is_err() {
                    break;
                }
            }
            maybe_outbound = outbound_receiver.recv() => {
                match maybe_outbound {
                    Some(outbound_message) => {
                        if send_message(&mut socket, &outbound_message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Text(raw_message)) => {
                        let inbound = match serde_json::from_str::<ClientMessage>(&raw_message) {
                            Ok(inbound) => inbound,
                            Err(error) => {
                                debug!(
                                    session_id = %session_id,
                                    error = %error,
                                    "undecodable frame"
                                );
                                if send_message(&mut socket, &ErrorCode::InvalidMessage.to_message())
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                                continue;
                            }
                        };
                        state.handler.handle(session_id, inbound, Utc::now()).await;
                    }
                    Ok(Message::Ping(payload)) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(error) => {
                        debug!(session_id = %session_id, error = %error, "socket error");
                        break;
                    }
                }
            }
        }
    }

    info!(session_id = %session_id, "session disconnected");
    state.handler.handle_disconnect(session_id, Utc::now()).await;
}

async fn send_message(socket: &mut WebSocket, message: &ServerMessage) -> Result<(), axum::Error> {
    let encoded = serde_json::to_string(message)
        .map_err(axum::Error::new)?;
    socket.send(Message::Text(encoded.into())).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::directory::ChallengeDirectory;
    use crate::players::PlayerDirectory;
    use crate::session::StaticTokenAuthenticator;
    use crate::store::MemoryStore;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_router() -> Router {
        let registry = Arc::new(SessionRegistry::default());
        let store = Arc::new(MemoryStore::default());
        let players = Arc::new(PlayerDirectory::new(store.clone()));
        let directory = ChallengeDirectory::new(registry.clone(), store, players.clone());
        let status = ServerStatusManager::new(registry.clone(), directory.clone());
        let handler = Arc::new(MessageHandler::new(registry.clone(), directory, players));
        router(WsRouterState {
            authenticator: Arc::new(StaticTokenAuthenticator::from_spec("tok-1=alice:Alice")),
            registry,
            handler,
            status,
        })
    }

    fn upgrade_request(auth: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .uri("/ws")
            .header("host", "localhost")
            .header("connection", "upgrade")
            .header("upgrade", "websocket")
            .header("sec-websocket-version", "13")
            .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==");
        if let Some(token) = auth {
            builder = builder.header("authorization", token);
        }
        builder.body(Body::empty()).expect("request should build")
    }

    #[tokio::test]
    async fn upgrade_without_a_token_is_unauthorized() {
        let response = test_router()
            .oneshot(upgrade_request(None))
            .await
            .expect("request should complete");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // The rejection body is the typed protocol error.
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should be readable");
        let error: serde_json::Value =
            serde_json::from_slice(&body).expect("body should be json");
        assert_eq!(error["type"], "error");
        assert_eq!(error["code"], "UNAUTHENTICATED");
    }

    #[tokio::test]
    async fn upgrade_with_an_unknown_token_is_unauthorized() {
        let response = test_router()
            .oneshot(upgrade_request(Some("Bearer nope")))
            .await
            .expect("request should complete");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn authenticated_non_upgrade_request_requires_upgrade() {
        // A valid token on a plain GET is authenticated but cannot be
        // upgraded; the split from the 401 path is what matters here.
        let request = Request::builder()
            .uri("/ws")
            .header("authorization", "Bearer tok-1")
            .body(Body::empty())
            .expect("request should build");
        let response =
            test_router().oneshot(request).await.expect("request should complete");
        assert_eq!(response.status(), StatusCode::UPGRADE_REQUIRED);
    }

    #[tokio::test]
    async fn bad_token_beats_bad_upgrade() {
        // Without a token, even a non-upgradable request is rejected as
        // unauthorized, not as a missing upgrade.
        let request = Request::builder()
            .uri("/ws")
            .body(Body::empty())
            .expect("request should build");
        let response =
            test_router().oneshot(request).await.expect("request should complete");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn bearer_parsing_requires_the_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer tok-1".parse().expect("header value"));
        assert_eq!(bearer_token(&headers), Some("tok-1"));

        headers.insert(header::AUTHORIZATION, "tok-1".parse().expect("header value"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, "Bearer ".parse().expect("header value"));
        assert_eq!(bearer_token(&headers), None);
    }
}
