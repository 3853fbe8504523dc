// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! WebSocket bridge — translates client connections to orchestrator calls
//! and pumps session events back as JSON frames.
//!
//! # Security
//!
//! Authentication happens before the WebSocket upgrade: the bearer token in
//! the handshake's `Authorization` header is verified in constant time, and
//! an invalid or missing token rejects the handshake with 401.  By the time
//! `handle_socket` runs, the connection carries a resolved [`UserContext`].
//!
//! # Disconnects
//!
//! A dropped socket only cancels the subscription — in-flight generation
//! continues and its events stay in the session's replay buffer, so a client
//! reconnecting with `resume {last_event_id}` picks up where it left off.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use base64::Engine;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use aria_core::{Event, OrchestratorError, Subscription, UserContext};

use crate::error::NodeError;
use crate::frames::{ClientFrame, ServerFrame};
use crate::server::NodeState;

/// HTTP handler for GET /ws.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<NodeState>>,
    headers: HeaderMap,
) -> Response {
    let Some(user) = bearer_token(&headers).and_then(|t| state.auth.authenticate(t)) else {
        let err = NodeError::Auth("missing or invalid bearer token".into());
        info!(error = %err, "rejecting WebSocket handshake");
        return StatusCode::UNAUTHORIZED.into_response();
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, user))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// One wake-up of the connection loop: either a socket message or a session
/// event.  Resolved inside `select!`, handled outside it so the handler can
/// freely mutate the subscription.
enum Wake {
    Socket(Option<Result<WsMessage, axum::Error>>),
    Event(Result<Event, broadcast::error::RecvError>),
}

async fn handle_socket(mut socket: WebSocket, state: Arc<NodeState>, user: UserContext) {
    info!(user = %user.user_id, "WebSocket client connected");
    let mut live: Option<broadcast::Receiver<Event>> = None;

    loop {
        let wake = match live.as_mut() {
            Some(rx) => tokio::select! {
                msg = socket.recv() => Wake::Socket(msg),
                ev = rx.recv() => Wake::Event(ev),
            },
            None => Wake::Socket(socket.recv().await),
        };

        match wake {
            Wake::Socket(Some(Ok(WsMessage::Text(text)))) => {
                match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(frame) => {
                        if let Some(sub) = handle_frame(&state, &user, frame, &mut socket).await {
                            live = Some(sub);
                        }
                    }
                    Err(e) => {
                        warn!(user = %user.user_id, "invalid frame JSON: {e}");
                        let frame = ServerFrame::error(
                            "invalid frame",
                            serde_json::json!({ "kind": "validation_error" }),
                        );
                        send_frame(&mut socket, &frame).await;
                    }
                }
            }
            Wake::Socket(Some(Ok(WsMessage::Ping(data)))) => {
                if socket.send(WsMessage::Pong(data)).await.is_err() {
                    break;
                }
            }
            Wake::Socket(Some(Ok(WsMessage::Close(_))) | None) => break,
            Wake::Socket(Some(Ok(_))) => {} // binary frames ignored
            Wake::Socket(Some(Err(e))) => {
                debug!(user = %user.user_id, "WebSocket recv error: {e}");
                break;
            }
            Wake::Event(Ok(event)) => {
                send_frame(&mut socket, &ServerFrame::from_event(&event)).await;
            }
            Wake::Event(Err(broadcast::error::RecvError::Lagged(n))) => {
                warn!(user = %user.user_id, "subscriber lagged by {n} events");
                let frame = ServerFrame::warning(format!(
                    "subscriber lagged; {n} events dropped — resume with last_event_id to replay"
                ));
                send_frame(&mut socket, &frame).await;
            }
            Wake::Event(Err(broadcast::error::RecvError::Closed)) => {
                // Session ended; drop the subscription but keep the
                // connection for further commands.
                live = None;
            }
        }
    }

    info!(user = %user.user_id, "WebSocket client disconnected");
}

/// Execute one client frame.  Returns a new subscription when the frame
/// attaches the connection to a session stream.
async fn handle_frame(
    state: &Arc<NodeState>,
    user: &UserContext,
    frame: ClientFrame,
    socket: &mut WebSocket,
) -> Option<broadcast::Receiver<Event>> {
    match frame {
        ClientFrame::CreateSession {
            agent_kind,
            mode,
            privacy,
            family_id,
        } => {
            match state
                .orchestrator
                .create_session(user, agent_kind, mode, privacy, family_id)
                .await
            {
                Ok(session) => {
                    send_frame(
                        socket,
                        &ServerFrame::session_created(session.session_id, session.agent_kind),
                    )
                    .await;
                    let sub = state
                        .orchestrator
                        .subscribe(user, session.session_id, None)
                        .await
                        .ok()?;
                    Some(flush_backlog(sub, socket).await)
                }
                Err(e) => {
                    send_error(socket, &e).await;
                    None
                }
            }
        }

        ClientFrame::Message {
            session_id,
            content,
        } => match state
            .orchestrator
            .process_message(user, session_id, &content)
            .await
        {
            Ok(sub) => Some(flush_backlog(sub, socket).await),
            Err(e) => {
                send_error(socket, &e).await;
                None
            }
        },

        ClientFrame::Voice { session_id, audio } => {
            let bytes = match base64::engine::general_purpose::STANDARD.decode(&audio) {
                Ok(b) => b,
                Err(_) => {
                    let e = OrchestratorError::Validation("audio is not valid base64".into());
                    send_error(socket, &e).await;
                    return None;
                }
            };
            match state
                .orchestrator
                .process_voice(user, session_id, &bytes)
                .await
            {
                Ok(sub) => Some(flush_backlog(sub, socket).await),
                Err(e) => {
                    send_error(socket, &e).await;
                    None
                }
            }
        }

        ClientFrame::Resume {
            session_id,
            last_event_id,
        } => match state
            .orchestrator
            .subscribe(user, session_id, Some(last_event_id))
            .await
        {
            Ok(sub) => Some(flush_backlog(sub, socket).await),
            Err(e) => {
                send_error(socket, &e).await;
                None
            }
        },

        ClientFrame::EndSession { session_id } => {
            if let Err(e) = state.orchestrator.end_session(user, session_id).await {
                send_error(socket, &e).await;
            }
            None
        }
    }
}

/// Send the replayed backlog, then hand back the live receiver.
async fn flush_backlog(sub: Subscription, socket: &mut WebSocket) -> broadcast::Receiver<Event> {
    for event in &sub.backlog {
        send_frame(socket, &ServerFrame::from_event(event)).await;
    }
    sub.rx
}

async fn send_error(socket: &mut WebSocket, e: &OrchestratorError) {
    let frame = ServerFrame::error(
        e.user_message(),
        serde_json::json!({
            "kind": e.kind(),
            "severity": e.severity(),
            "recovery_hint": e.recovery_hint(),
        }),
    );
    send_frame(socket, &frame).await;
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) {
    if let Ok(json) = serde_json::to_string(frame) {
        let _ = socket.send(WsMessage::Text(json)).await;
    }
}
