// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use aria_agents::AgentKind;

/// Typed events fanned out to session subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A streamed text fragment.
    Token,
    /// The assembled assistant response; terminates a successful stream.
    Response,
    /// The agent is invoking a tool.
    ToolCall,
    /// A tool invocation finished (or was denied).
    ToolResult,
    /// Synthesized speech for a voice session.
    Tts,
    /// Transcription of inbound voice audio.
    Stt,
    SessionStart,
    SessionEnd,
    AgentSwitch,
    Thinking,
    Typing,
    Waiting,
    /// Terminates a failed stream; payload carries kind, severity,
    /// user_message, and recovery_hint.
    Error,
    Warning,
    /// Replay marker: events between the requested id and the oldest
    /// retained one were evicted from the buffer.
    Gap,
}

/// One event on a session stream.  Value type — safely shareable across
/// subscribers, never mutated after emit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Per-session monotone sequence number, starting at 1.
    pub event_id: u64,
    pub session_id: Uuid,
    pub agent_kind: AgentKind,
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
