use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap},
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use shared::{
    error::{ApiError, ErrorCode},
    protocol::{ClientEvent, ServerEvent},
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::app_state::AppState;

/// Policy violation, sent when the handshake credential is rejected.
const CLOSE_UNAUTHORIZED: u16 = 1008;

#[derive(Debug, Default, Deserialize)]
pub(crate) struct WsQuery {
    pub(crate) token: Option<String>,
}

/// Browsers cannot set headers on a socket upgrade, so `?token=` is accepted
/// when no `Authorization` header is present.
pub(crate) fn handshake_credential(headers: &HeaderMap, query: &WsQuery) -> String {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| query.token.clone())
        .unwrap_or_default()
}

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let credential = handshake_credential(&headers, &query);
    ws.on_upgrade(move |socket| ws_connection(state, socket, credential))
}

async fn ws_connection(state: Arc<AppState>, mut socket: WebSocket, credential: String) {
    let (outbox, mut events) = mpsc::channel::<ServerEvent>(state.outbox_capacity);
    let session = match state.realtime.on_connect(&credential, outbox).await {
        Ok(session) => session,
        Err(error) => {
            info!(error = %error, "websocket handshake rejected");
            let frame = ServerEvent::Error(ApiError::from(error));
            if let Ok(text) = serde_json::to_string(&frame) {
                let _ = socket.send(Message::Text(text)).await;
            }
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_UNAUTHORIZED,
                    reason: "unauthorized".into(),
                })))
                .await;
            return;
        }
    };
    let connection_id = session.connection_id;

    let (mut sender, mut receiver) = socket.split();
    let send_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(error) => {
                    warn!(error = %error, event = event.name(), "failed to encode server event");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = receiver.next().await {
        match message {
            Message::Text(text) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(event) => state.realtime.on_client_event(connection_id, event).await,
                Err(error) => {
                    debug!(%connection_id, error = %error, "undecodable client frame");
                    state.realtime.registry.send_to(
                        connection_id,
                        ServerEvent::Error(ApiError::new(
                            ErrorCode::Validation,
                            format!("malformed event: {error}"),
                        )),
                    );
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.realtime.on_disconnect(connection_id).await;
    send_task.abort();
}
