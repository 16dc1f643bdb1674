//! WebSocket Handler
//!
//! Handles WebSocket upgrade requests and hands the socket to a
//! [`ConnectionPump`].

use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, HeaderMap},
    response::Response,
};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;

use super::pump::{ConnectionPump, PumpMode};
use crate::api::dto::HandshakeQuery;
use crate::api::{ApiResult, AppState};
use crate::channel::Channel;
use crate::connection::ConnectionContext;
use crate::envelope::DEFAULT_CONTENT_TYPE;
use crate::error::AdapterError;

/// GET /channels/:id/messages[/*subtopic]
///
/// Authorizes the token for the channel before upgrading. Every frame the
/// client sends is then published to that channel.
pub async fn channel_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HandshakeQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let id = params.get("id").map(String::as_str).unwrap_or_default();
    let subtopic = params.get("subtopic").map(|s| s.trim_start_matches('/'));
    let channel = Channel::new(id, subtopic)?;

    let token = extract_token(&headers, query.authorization.as_deref()).unwrap_or_default();
    state
        .authority
        .check_access(&token, channel.id())
        .await
        .map_err(AdapterError::from)?;

    let content_type = query
        .content_type
        .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
    state.codec.validate(&[], &content_type)?;

    let mode = PumpMode::Channel {
        channel,
        token,
        content_type,
    };
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, mode)))
}

/// GET /ws
///
/// Command endpoint: JSON frames carry subscribe, unsubscribe and publish
/// requests. A handshake token, if any, is the default for every frame.
pub async fn command_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<HandshakeQuery>,
    headers: HeaderMap,
) -> Response {
    let mode = PumpMode::Command {
        default_token: extract_token(&headers, query.authorization.as_deref()),
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, mode))
}

/// Handle an established WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, mode: PumpMode) {
    let ctx = ConnectionContext::new(&state.shutdown, state.config.outbound_queue_capacity);
    let pump = ConnectionPump::new(
        ctx,
        Arc::clone(&state.service),
        Arc::clone(&state.registry),
        mode,
        state.config.pump,
    );

    let (sender, receiver) = socket.split();
    pump.run(sender, receiver).await;
}

/// Token from the `Authorization` header, else the `authorization` query parameter
fn extract_token(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    let header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.strip_prefix("Bearer ").unwrap_or(v).trim())
        .filter(|v| !v.is_empty());

    header.or(query).map(str::to_string)
}
