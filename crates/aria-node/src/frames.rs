// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Wire protocol between WebSocket clients and the node.
//!
//! JSON over text frames.  Inbound frames are tagged commands; outbound
//! frames mirror the orchestrator's event stream plus a few node-level
//! acknowledgements and errors.
//!
//! # Typical session flow
//!
//! ```text
//! Client                                Node / Orchestrator
//!    │                                        │
//!    │── create_session {agent_kind} ────────►│  session_created + session_start
//!    │── message {session_id, content} ──────►│  thinking, token × N …
//!    │◄─ token {text} ─────────────────────────│
//!    │◄─ tool_call / tool_result ──────────────│  (if the agent used a tool)
//!    │◄─ response {text} ──────────────────────│  terminal event of the turn
//!    │                                        │
//!    │  (disconnect)                          │  generation continues, buffered
//!    │── resume {session_id, last_event_id} ─►│  replay of missed events
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use aria_agents::AgentKind;
use aria_config::PrivacyMode;
use aria_core::{Event, SessionMode};

/// Commands sent by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Create (and implicitly subscribe to) a new session.
    CreateSession {
        agent_kind: Option<AgentKind>,
        mode: SessionMode,
        #[serde(default)]
        privacy: PrivacyMode,
        family_id: Option<String>,
    },

    /// Submit a text message to an active session.
    Message { session_id: Uuid, content: String },

    /// Submit one base64-encoded audio frame to a voice session.
    Voice { session_id: Uuid, audio: String },

    /// Re-attach to a session's stream, replaying events past
    /// `last_event_id` (or a `gap` marker when they were evicted).
    Resume {
        session_id: Uuid,
        last_event_id: u64,
    },

    /// End a session gracefully.
    EndSession { session_id: Uuid },
}

/// One outbound frame.  Orchestrator events map 1:1; node-level frames
/// (`session_created`, `error`) use the same envelope with `event_id = 0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_kind: Option<AgentKind>,
    pub timestamp: DateTime<Utc>,
    pub event_id: u64,
}

impl ServerFrame {
    pub fn from_event(ev: &Event) -> Self {
        let kind = serde_json::to_value(ev.kind)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".into());
        Self {
            kind,
            data: ev.payload.clone(),
            session_id: Some(ev.session_id),
            agent_kind: Some(ev.agent_kind),
            timestamp: ev.timestamp,
            event_id: ev.event_id,
        }
    }

    pub fn session_created(session_id: Uuid, agent_kind: AgentKind) -> Self {
        Self {
            kind: "session_created".into(),
            data: serde_json::json!({ "session_id": session_id }),
            session_id: Some(session_id),
            agent_kind: Some(agent_kind),
            timestamp: Utc::now(),
            event_id: 0,
        }
    }

    pub fn error(message: impl Into<String>, detail: serde_json::Value) -> Self {
        Self {
            kind: "error".into(),
            data: serde_json::json!({
                "user_message": message.into(),
                "detail": detail,
            }),
            session_id: None,
            agent_kind: None,
            timestamp: Utc::now(),
            event_id: 0,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            kind: "warning".into(),
            data: serde_json::json!({ "message": message.into() }),
            session_id: None,
            agent_kind: None,
            timestamp: Utc::now(),
            event_id: 0,
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use aria_core::EventKind;

    use super::*;

    #[test]
    fn message_frame_json_round_trip() {
        let frame = ClientFrame::Message {
            session_id: Uuid::new_v4(),
            content: "hello world".into(),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"message\""));
        let back: ClientFrame = serde_json::from_str(&json).unwrap();
        match back {
            ClientFrame::Message { content, .. } => assert_eq!(content, "hello world"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn resume_frame_parses_from_client_json() {
        let sid = Uuid::new_v4();
        let json = format!(r#"{{"type":"resume","session_id":"{sid}","last_event_id":150}}"#);
        let frame: ClientFrame = serde_json::from_str(&json).unwrap();
        match frame {
            ClientFrame::Resume {
                session_id,
                last_event_id,
            } => {
                assert_eq!(session_id, sid);
                assert_eq!(last_event_id, 150);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn create_session_defaults_privacy_to_private() {
        let json = r#"{"type":"create_session","agent_kind":"personal","mode":"chat","family_id":null}"#;
        let frame: ClientFrame = serde_json::from_str(json).unwrap();
        match frame {
            ClientFrame::CreateSession { privacy, .. } => {
                assert_eq!(privacy, PrivacyMode::Private);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn server_frame_mirrors_event_fields() {
        let ev = Event {
            event_id: 42,
            session_id: Uuid::new_v4(),
            agent_kind: AgentKind::Commerce,
            kind: EventKind::ToolResult,
            payload: serde_json::json!({ "output": "3 results" }),
            timestamp: Utc::now(),
        };
        let frame = ServerFrame::from_event(&ev);
        assert_eq!(frame.kind, "tool_result");
        assert_eq!(frame.event_id, 42);
        assert_eq!(frame.data["output"], "3 results");
        assert_eq!(frame.agent_kind, Some(AgentKind::Commerce));
    }

    #[test]
    fn error_frame_serializes_with_type_error() {
        let frame = ServerFrame::error("nope", serde_json::json!({ "kind": "rate_limited" }));
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"error\""));
        assert!(json.contains("rate_limited"));
    }
}
