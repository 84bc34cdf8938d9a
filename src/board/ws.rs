use axum::{
    body::Bytes,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use uuid::Uuid;

use super::api::{ApiError, SharedState};
use super::auth::{Actor, Authorizer};
use crate::errors::BoardError;
use super::models::*;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── WebSocket message types ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WsMessage {
    BoardCreated {
        board: Board,
    },
    BoardRenamed {
        project_type: String,
        old_name: String,
        board: Board,
    },
    BoardsReordered {
        project_type: String,
        boards: Vec<Board>,
    },
    BoardDeleted {
        project_type: String,
        name: String,
        deleted_tickets: usize,
    },
    BoardColorChanged {
        mapping: BoardColorMapping,
    },
    TicketCreated {
        ticket: Ticket,
    },
    TicketUpdated {
        ticket: Ticket,
    },
    TicketMoved {
        ticket_id: Uuid,
        from_board: String,
        to_board: String,
    },
    TicketDeleted {
        ticket_id: Uuid,
    },
    FieldConfigChanged {
        project_type: String,
    },
}

#[derive(Deserialize)]
pub struct WsAuth {
    pub token: Option<String>,
}

// ── WebSocket handler ────────────────────────────────────────────────

/// Browsers cannot set headers on a WebSocket handshake, so the token comes
/// from the `token` query parameter.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    Query(auth): Query<WsAuth>,
) -> Response {
    let actor = match authenticate_query(&state.auth, &auth) {
        Ok(actor) => actor,
        Err(e) => return ApiError::from(e).into_response(),
    };
    tracing::debug!(actor = %actor.name, "websocket client connected");
    let rx = state.ws_tx.subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, rx))
}

fn authenticate_query(authorizer: &Authorizer, auth: &WsAuth) -> Result<Actor, BoardError> {
    match auth.token.as_deref() {
        Some(token) => authorizer.authenticate_token(token),
        None => Err(BoardError::Unauthorized),
    }
}

async fn handle_socket(socket: WebSocket, rx: broadcast::Receiver<String>) {
    let (sender, receiver) = socket.split();
    run_socket_loop(sender, receiver, rx).await;
}

/// Forward broadcasts to the client and keep the connection alive with
/// ping/pong. If no Pong arrives within [`PONG_TIMEOUT`] after a Ping, the
/// connection is dropped.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<String>,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    tracing::debug!("websocket client timed out");
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                match result {
                    Ok(msg) => {
                        if sender.send(Message::Text(msg.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "websocket client lagging; messages dropped");
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

// ── Broadcast helper ─────────────────────────────────────────────────

/// Serialize and broadcast a WsMessage to all connected WebSocket clients.
/// Having no connected clients is not an error.
pub fn broadcast_message(tx: &broadcast::Sender<String>, msg: &WsMessage) {
    match serde_json::to_string(msg) {
        Ok(json) => {
            let _ = tx.send(json);
        }
        Err(e) => {
            tracing::warn!("Failed to serialize WsMessage: {}", e);
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthSection, UserConfig};
    use chrono::Utc;

    fn board(name: &str) -> Board {
        Board {
            project_type: "registro".into(),
            name: name.into(),
            position: 0,
            color: BoardColor::Blue,
            reserved: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_board_created_serialization() {
        let msg = WsMessage::BoardCreated { board: board("Triagem") };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "BoardCreated");
        assert_eq!(json["data"]["board"]["name"], "Triagem");
        assert_eq!(json["data"]["board"]["color"], "blue");
    }

    #[test]
    fn test_ticket_moved_serialization() {
        let id = Uuid::new_v4();
        let msg = WsMessage::TicketMoved {
            ticket_id: id,
            from_board: "Triagem".into(),
            to_board: DONE_BOARD.into(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "TicketMoved");
        assert_eq!(json["data"]["ticket_id"], id.to_string());
        assert_eq!(json["data"]["to_board"], "Concluídas");
    }

    #[test]
    fn test_roundtrip_deserialization() {
        let msg = WsMessage::BoardDeleted {
            project_type: "registro".into(),
            name: "Triagem".into(),
            deleted_tickets: 3,
        };
        let json = serde_json::to_string(&msg).unwrap();
        match serde_json::from_str::<WsMessage>(&json).unwrap() {
            WsMessage::BoardDeleted { deleted_tickets, .. } => assert_eq!(deleted_tickets, 3),
            other => panic!("Expected BoardDeleted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_broadcast_channel_delivers_to_subscribers() {
        let (tx, mut rx) = broadcast::channel::<String>(16);
        broadcast_message(
            &tx,
            &WsMessage::FieldConfigChanged {
                project_type: "registro".into(),
            },
        );
        let received = rx.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&received).unwrap();
        assert_eq!(parsed["type"], "FieldConfigChanged");
        assert_eq!(parsed["data"]["project_type"], "registro");
    }

    #[tokio::test]
    async fn test_broadcast_no_receivers_does_not_panic() {
        let (tx, _) = broadcast::channel::<String>(16);
        broadcast_message(&tx, &WsMessage::TicketDeleted { ticket_id: Uuid::nil() });
    }

    #[test]
    fn test_query_token_is_required() {
        let authorizer = Authorizer::new(&AuthSection {
            users: vec![
                UserConfig {
                    name: "ana".into(),
                    role: "viewer".into(),
                    token: "t-ana".into(),
                },
                UserConfig {
                    name: "ops".into(),
                    role: "admin".into(),
                    token: String::new(),
                },
            ],
            roles: Default::default(),
        });
        let query = |token: Option<&str>| WsAuth {
            token: token.map(str::to_string),
        };
        assert!(matches!(authenticate_query(&authorizer, &query(None)), Err(BoardError::Unauthorized)));
        assert!(matches!(authenticate_query(&authorizer, &query(Some(""))), Err(BoardError::Unauthorized)));
        assert_eq!(authenticate_query(&authorizer, &query(Some("t-ana"))).unwrap().name, "ana");
    }

    #[test]
    fn test_keepalive_constants() {
        assert!(PONG_TIMEOUT > PING_INTERVAL);
    }
}
