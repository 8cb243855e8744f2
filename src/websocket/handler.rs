//! WebSocket Handler
//!
//! Authenticates the handshake, upgrades the connection and dispatches
//! client frames to the messaging hub.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header::AUTHORIZATION, HeaderMap},
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::messages::{ClientMessage, ServerEvent};
use crate::api::{ApiError, AppState};
use crate::auth::{bearer_token, Claims, TokenAuthority};
use crate::hub::{Caller, MessagingHub};

/// Query parameters accepted on `/ws`
///
/// Browsers cannot set headers on a WebSocket handshake, so the credential
/// may travel as `?access_token=...` instead.
#[derive(Debug, Default, Deserialize)]
pub struct HandshakeParams {
    pub access_token: Option<String>,
}

/// WebSocket upgrade handler
///
/// The bearer credential is verified before upgrading; an invalid or missing
/// credential is answered with 401 and no socket is opened.
pub async fn websocket_handler(
    Query(params): Query<HandshakeParams>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let claims = authenticate(&state.tokens, &params, &headers)?;
    let hub = Arc::clone(&state.hub);
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, hub, claims)))
}

/// Verify the handshake credential, preferring the query parameter
pub fn authenticate(
    tokens: &TokenAuthority,
    params: &HandshakeParams,
    headers: &HeaderMap,
) -> Result<Claims, ApiError> {
    let token = params
        .access_token
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .or_else(|| {
            headers
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(bearer_token)
        })
        .ok_or_else(|| ApiError::Unauthorized("Missing bearer credential".to_string()))?;

    Ok(tokens.verify(token)?)
}

/// Handle an established WebSocket connection
async fn handle_socket(socket: WebSocket, hub: Arc<MessagingHub>, claims: Claims) {
    let (mut sender, mut receiver) = socket.split();

    // Create channel for sending events to this connection
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();

    let registry = Arc::clone(hub.registry());
    let connection_id = match registry.register(tx) {
        Ok(id) => id,
        Err(e) => {
            tracing::error!(error = %e, user = %claims.sub, "Failed to register WebSocket connection");
            if let Ok(text) = serde_json::to_string(&ServerEvent::error(e.to_string())) {
                let _ = sender.send(Message::Text(text)).await;
            }
            return;
        }
    };

    let connected = ServerEvent::Connected {
        connection_id: connection_id.clone(),
    };
    let delivered = match serde_json::to_string(&connected) {
        Ok(text) => sender.send(Message::Text(text)).await.is_ok(),
        Err(_) => false,
    };
    if !delivered {
        tracing::error!(connection_id = %connection_id, "Failed to send connected message");
        registry.unregister(&connection_id);
        return;
    }

    let caller = Caller::new(connection_id.clone(), claims);
    let conn_id_for_send = connection_id.clone();

    // Task to forward events from channel to WebSocket
    let mut send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(text) => {
                    if sender.send(Message::Text(text)).await.is_err() {
                        tracing::debug!(
                            connection_id = %conn_id_for_send,
                            "WebSocket send failed, closing connection"
                        );
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialize event");
                }
            }
        }
    });

    let hub_for_recv = Arc::clone(&hub);

    // Frames are handled one at a time, so a connection's requests take
    // effect in the order it sent them.
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(msg) => {
                    if !handle_ws_message(&hub_for_recv, &caller, msg).await {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(
                        connection_id = %caller.connection_id,
                        error = %e,
                        "WebSocket receive error"
                    );
                    break;
                }
            }
        }
    });

    // Wait for either task to complete; aborting the reader also drops any
    // hub operation still in flight for this connection.
    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
        }
        _ = &mut recv_task => {
            send_task.abort();
        }
    }

    // Cleanup: release the connection and every room subscription it held
    registry.unregister(&connection_id);
}

/// Handle a received WebSocket message
///
/// Returns false if the connection should be closed.
async fn handle_ws_message(hub: &MessagingHub, caller: &Caller, message: Message) -> bool {
    match message {
        Message::Text(text) => {
            match serde_json::from_str::<ClientMessage>(&text) {
                Ok(client_msg) => {
                    handle_client_message(hub, caller, client_msg).await;
                }
                Err(e) => {
                    tracing::debug!(
                        connection_id = %caller.connection_id,
                        error = %e,
                        "Invalid client message"
                    );
                    // Send error but keep connection open
                    let event = ServerEvent::error(format!("Invalid message format: {}", e));
                    let _ = hub.registry().send_to_connection(&caller.connection_id, event);
                }
            }
            true
        }
        Message::Binary(_) => {
            let event = ServerEvent::error("Binary messages not supported");
            let _ = hub.registry().send_to_connection(&caller.connection_id, event);
            true
        }
        // Axum answers pings itself
        Message::Ping(_) | Message::Pong(_) => true,
        Message::Close(_) => {
            tracing::debug!(connection_id = %caller.connection_id, "Client requested close");
            false
        }
    }
}

/// Dispatch a parsed client message
///
/// Hub failures have already been logged and reported by the hub itself.
async fn handle_client_message(hub: &MessagingHub, caller: &Caller, message: ClientMessage) {
    match message {
        ClientMessage::JoinRoom { room } => {
            let _ = hub.join_room(caller, &room).await;
        }
        ClientMessage::LeaveRoom { room } => {
            let _ = hub.leave_room(caller, &room).await;
        }
        ClientMessage::SendMessage { room, content } => {
            let _ = hub.send_message(caller, &room, &content).await;
        }
        ClientMessage::GetHistory { room } => {
            let _ = hub.get_history(caller, &room).await;
        }
        ClientMessage::Ping => {
            let _ = hub
                .registry()
                .send_to_connection(&caller.connection_id, ServerEvent::Pong);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenSettings;
    use crate::storage::User;
    use axum::http::HeaderValue;

    fn tokens() -> TokenAuthority {
        TokenAuthority::new(TokenSettings {
            secret: "handshake-secret".to_string(),
            issuer: "roomchat".to_string(),
            audience: "roomchat-clients".to_string(),
            ttl: chrono::Duration::minutes(5),
        })
        .unwrap()
    }

    fn token_for(tokens: &TokenAuthority) -> String {
        tokens
            .issue(&User {
                id: 4,
                username: "dana".to_string(),
            })
            .unwrap()
    }

    #[test]
    fn test_authenticate_from_query() {
        let tokens = tokens();
        let params = HandshakeParams {
            access_token: Some(token_for(&tokens)),
        };
        let claims = authenticate(&tokens, &params, &HeaderMap::new()).unwrap();
        assert_eq!(claims.sub, "dana");
        assert_eq!(claims.uid.as_deref(), Some("4"));
    }

    #[test]
    fn test_authenticate_from_header() {
        let tokens = tokens();
        let mut headers = HeaderMap::new();
        let value = format!("Bearer {}", token_for(&tokens));
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&value).unwrap());

        let claims = authenticate(&tokens, &HandshakeParams::default(), &headers).unwrap();
        assert_eq!(claims.sub, "dana");
    }

    #[test]
    fn test_authenticate_rejects_missing_and_invalid() {
        let tokens = tokens();
        assert!(matches!(
            authenticate(&tokens, &HandshakeParams::default(), &HeaderMap::new()),
            Err(ApiError::Unauthorized(_))
        ));

        let params = HandshakeParams {
            access_token: Some("not.a.jwt".to_string()),
        };
        assert!(matches!(
            authenticate(&tokens, &params, &HeaderMap::new()),
            Err(ApiError::Unauthorized(_))
        ));
    }
}
