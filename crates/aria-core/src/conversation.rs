// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use aria_config::RetentionPolicy;
use aria_resilience::CircuitBreaker;
use aria_store::{keys, Store, StoreError};

/// Author of one conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub name: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultRecord {
    pub name: String,
    pub output: String,
    pub is_error: bool,
}

/// One turn in a conversation.  Append-only while the session lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRecord>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_results: Option<Vec<ToolResultRecord>>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: None,
            tool_results: None,
            created_at: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: None,
            tool_results: None,
            created_at: Utc::now(),
        }
    }

    pub fn assistant_tool_call(call: ToolCallRecord) -> Self {
        Self {
            role: Role::Assistant,
            content: String::new(),
            tool_calls: Some(vec![call]),
            tool_results: None,
            created_at: Utc::now(),
        }
    }

    pub fn tool_result(result: ToolResultRecord) -> Self {
        Self {
            role: Role::Tool,
            content: result.output.clone(),
            tool_calls: None,
            tool_results: Some(vec![result]),
            created_at: Utc::now(),
        }
    }
}

/// How many messages the store retains per conversation.  Older turns are
/// truncated by the capped list; the in-context window is narrower still.
const STORE_CAP: usize = 500;

/// Store-backed conversation log.
///
/// Messages are kept newest-first in a capped list; [`recent`] returns the
/// bounded in-context window in chronological order.  Only this window is
/// replayed into prompts — older turns persist until retention runs.
///
/// [`recent`]: ConversationLog::recent
pub struct ConversationLog {
    store: Arc<dyn Store>,
    window: usize,
    /// `memory_read` / `memory_write` breakers; history I/O fails fast while
    /// the store is misbehaving instead of stalling every turn.
    read_breaker: Option<Arc<CircuitBreaker>>,
    write_breaker: Option<Arc<CircuitBreaker>>,
}

impl ConversationLog {
    pub fn new(store: Arc<dyn Store>, window: usize) -> Self {
        Self {
            store,
            window: window.max(1),
            read_breaker: None,
            write_breaker: None,
        }
    }

    pub fn with_breakers(mut self, read: Arc<CircuitBreaker>, write: Arc<CircuitBreaker>) -> Self {
        self.read_breaker = Some(read);
        self.write_breaker = Some(write);
        self
    }

    fn admit(breaker: &Option<Arc<CircuitBreaker>>) -> Result<(), StoreError> {
        if let Some(b) = breaker {
            b.acquire().map_err(|e| StoreError::Backend(e.to_string()))?;
        }
        Ok(())
    }

    fn report(breaker: &Option<Arc<CircuitBreaker>>, ok: bool) {
        if let Some(b) = breaker {
            if ok {
                b.record_success();
            } else {
                b.record_failure();
            }
        }
    }

    pub async fn append(&self, conversation_id: &str, msg: &Message) -> Result<(), StoreError> {
        Self::admit(&self.write_breaker)?;
        let json = serde_json::to_string(msg)
            .map_err(|e| StoreError::Backend(format!("serializing message: {e}")))?;
        let result = self
            .store
            .list_push_capped(&keys::conversation(conversation_id), &json, STORE_CAP, None)
            .await;
        Self::report(&self.write_breaker, result.is_ok());
        result
    }

    /// The most recent `window` messages, oldest first.
    pub async fn recent(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
        Self::admit(&self.read_breaker)?;
        let fetched = self
            .store
            .list_range(
                &keys::conversation(conversation_id),
                0,
                self.window as isize - 1,
            )
            .await;
        Self::report(&self.read_breaker, fetched.is_ok());
        let raw = fetched?;
        let mut messages: Vec<Message> = raw
            .iter()
            .filter_map(|s| match serde_json::from_str(s) {
                Ok(m) => Some(m),
                Err(e) => {
                    warn!(conversation_id, error = %e, "dropping unparseable message");
                    None
                }
            })
            .collect();
        messages.reverse();
        Ok(messages)
    }

    /// Apply the retention policy at session end / expiry.
    pub async fn apply_retention(
        &self,
        conversation_id: &str,
        policy: RetentionPolicy,
    ) -> Result<(), StoreError> {
        let key = keys::conversation(conversation_id);
        match policy {
            RetentionPolicy::UntilSessionEnd => self.store.delete(&key).await,
            RetentionPolicy::Days(days) => {
                self.store
                    .expire(&key, Duration::from_secs(u64::from(days) * 86_400))
                    .await
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
