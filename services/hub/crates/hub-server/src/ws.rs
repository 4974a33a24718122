//! Agent socket edge: `GET /agent/ws?device_id=..&owner_id=..`.
//!
//! The edge only moves text between the socket and the device actor. It
//! never interprets frames and never exposes the socket to anything else.

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use fleet_protocol::{limits, validate_device_id};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::hub::{AgentConnection, Hub, Outbound, close_codes};
use crate::router::{ApiError, AppState};

#[derive(Debug, Deserialize)]
pub struct AgentQuery {
    pub device_id: String,
    #[serde(default)]
    pub owner_id: Option<String>,
}

pub async fn agent_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<AgentQuery>,
) -> Response {
    if let Err(reason) = validate_device_id(&query.device_id) {
        warn!(security = true, reason, "refused agent socket with invalid device id");
        return ApiError::BadRequest(reason.to_string()).into_response();
    }
    let hub = state.hub.clone();
    ws.max_message_size(limits::MAX_FRAME_BYTES)
        .max_frame_size(limits::MAX_FRAME_BYTES)
        .on_upgrade(move |socket| serve_agent(socket, hub, query))
}

async fn serve_agent(socket: WebSocket, hub: Hub, query: AgentQuery) {
    let AgentQuery {
        device_id,
        owner_id,
    } = query;
    let (mut sink, mut stream) = socket.split();

    let AgentConnection { id, mut outbound } = match hub.open_connection(&device_id, owner_id) {
        Ok(conn) => conn,
        Err(err) => {
            info!(device_id, error = %err, "refusing agent socket");
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: close_codes::RESTART,
                    reason: Utf8Bytes::from_static("hub unavailable"),
                })))
                .await;
            return;
        }
    };
    info!(device_id, conn = id, "agent socket opened");

    let mut writer = tokio::spawn(async move {
        while let Some(out) = outbound.recv().await {
            match out {
                Outbound::Text(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: truncate_reason(&reason).into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    let reason = loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Err(err) = hub.inbound(&device_id, id, text.as_str().to_owned()) {
                        debug!(device_id, conn = id, error = %err, "inbound frame not delivered");
                        break "hub unavailable";
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    debug!(device_id, conn = id, "dropping binary frame");
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => break "closed by agent",
                Some(Err(err)) => {
                    debug!(device_id, conn = id, error = %err, "socket read failed");
                    break "transport error";
                }
            },
            _ = &mut writer => break "closed by hub",
        }
    };

    hub.close_connection(&device_id, id, reason);
    writer.abort();
    info!(device_id, conn = id, reason, "agent socket closed");
}

/// Close reasons must fit a control frame (123 bytes).
fn truncate_reason(reason: &str) -> String {
    let mut end = reason.len().min(123);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}
