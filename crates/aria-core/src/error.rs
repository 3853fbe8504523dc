// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use thiserror::Error;

use aria_agents::AgentKind;
use aria_model::ModelError;
use aria_resilience::ResilienceError;
use aria_store::StoreError;
use aria_tools::DispatchError;

/// The orchestrator error taxonomy.  Recoverable-vs-not is a property of the
/// variant (see [`is_recoverable`]), never of a dynamic hierarchy; the same
/// goes for severity and the sanitized user-facing strings.
///
/// [`is_recoverable`]: OrchestratorError::is_recoverable
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("permission denied: missing {0}")]
    PermissionDenied(String),

    #[error("{0} quota exceeded")]
    QuotaExceeded(&'static str),

    #[error("rate limited")]
    RateLimited,

    #[error("session not found")]
    SessionNotFound,

    #[error("session expired")]
    SessionExpired,

    #[error("too many active sessions")]
    TooManySessions,

    #[error("no model available")]
    ModelUnavailable,

    #[error("model call timed out")]
    ModelTimeout,

    #[error("circuit breaker '{0}' is open")]
    CircuitOpen(String),

    #[error("bulkhead '{0}' is at capacity")]
    BulkheadFull(String),

    #[error("tool '{tool}' is not allowed for agent {agent}")]
    ToolNotAllowedForAgent { tool: String, agent: AgentKind },

    #[error("invalid tool parameters: {0}")]
    InvalidToolParameters(String),

    #[error("unsafe tool parameters: {0}")]
    UnsafeParameters(String),

    #[error("tool result unknown")]
    ToolResultUnknown,

    #[error("recovery exhausted")]
    RecoveryExhausted,

    #[error("operation timed out")]
    Timeout,

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl OrchestratorError {
    /// Stable machine-readable tag, used in `error` event payloads and audit
    /// records.
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::Validation(_) => "validation_error",
            OrchestratorError::PermissionDenied(_) => "permission_denied",
            OrchestratorError::QuotaExceeded(_) => "quota_exceeded",
            OrchestratorError::RateLimited => "rate_limited",
            OrchestratorError::SessionNotFound => "session_not_found",
            OrchestratorError::SessionExpired => "session_expired",
            OrchestratorError::TooManySessions => "too_many_sessions",
            OrchestratorError::ModelUnavailable => "model_unavailable",
            OrchestratorError::ModelTimeout => "model_timeout",
            OrchestratorError::CircuitOpen(_) => "circuit_open",
            OrchestratorError::BulkheadFull(_) => "bulkhead_full",
            OrchestratorError::ToolNotAllowedForAgent { .. } => "tool_not_allowed_for_agent",
            OrchestratorError::InvalidToolParameters(_) => "invalid_tool_parameters",
            OrchestratorError::UnsafeParameters(_) => "unsafe_parameters",
            OrchestratorError::ToolResultUnknown => "tool_result_unknown",
            OrchestratorError::RecoveryExhausted => "recovery_exhausted",
            OrchestratorError::Timeout => "timeout",
            OrchestratorError::Internal(_) => "internal",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            OrchestratorError::Validation(_)
            | OrchestratorError::SessionNotFound
            | OrchestratorError::InvalidToolParameters(_) => Severity::Low,

            OrchestratorError::QuotaExceeded(_)
            | OrchestratorError::RateLimited
            | OrchestratorError::TooManySessions
            | OrchestratorError::CircuitOpen(_)
            | OrchestratorError::BulkheadFull(_)
            | OrchestratorError::ToolResultUnknown
            | OrchestratorError::Timeout => Severity::Medium,

            OrchestratorError::SessionExpired
            | OrchestratorError::ModelUnavailable
            | OrchestratorError::ModelTimeout
            | OrchestratorError::Internal(_) => Severity::High,

            OrchestratorError::PermissionDenied(_)
            | OrchestratorError::UnsafeParameters(_)
            | OrchestratorError::ToolNotAllowedForAgent { .. }
            | OrchestratorError::RecoveryExhausted => Severity::Critical,
        }
    }

    /// Recoverable errors are handed to the recovery coordinator before they
    /// surface.  Permission, validation, quota, and policy denials are final
    /// and never retried.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::ModelUnavailable
                | OrchestratorError::ModelTimeout
                | OrchestratorError::CircuitOpen(_)
                | OrchestratorError::Timeout
                | OrchestratorError::Internal(_)
        )
    }

    /// Sanitized message shown to the user.  Never includes internals.
    pub fn user_message(&self) -> String {
        match self {
            OrchestratorError::Validation(msg) => format!("Your request was invalid: {msg}"),
            OrchestratorError::PermissionDenied(_) => {
                "You don't have permission for that action.".into()
            }
            OrchestratorError::QuotaExceeded(window) => {
                format!("You've reached your {window} request limit.")
            }
            OrchestratorError::RateLimited => "You're sending requests too quickly.".into(),
            OrchestratorError::SessionNotFound => "That conversation could not be found.".into(),
            OrchestratorError::SessionExpired => "That conversation has expired.".into(),
            OrchestratorError::TooManySessions => {
                "You have too many open conversations.".into()
            }
            OrchestratorError::ModelUnavailable
            | OrchestratorError::ModelTimeout
            | OrchestratorError::CircuitOpen(_)
            | OrchestratorError::RecoveryExhausted => {
                "The assistant is temporarily unavailable.".into()
            }
            OrchestratorError::BulkheadFull(_) => {
                "The assistant is busy right now.".into()
            }
            OrchestratorError::ToolNotAllowedForAgent { .. }
            | OrchestratorError::InvalidToolParameters(_)
            | OrchestratorError::UnsafeParameters(_) => {
                "That action could not be performed.".into()
            }
            OrchestratorError::ToolResultUnknown => {
                "An action may not have completed; please verify before retrying.".into()
            }
            OrchestratorError::Timeout => "The request took too long.".into(),
            OrchestratorError::Internal(_) => "Something went wrong on our side.".into(),
        }
    }

    /// Concrete next step suggested alongside the user message.
    pub fn recovery_hint(&self) -> &'static str {
        match self {
            OrchestratorError::Validation(_)
            | OrchestratorError::InvalidToolParameters(_)
            | OrchestratorError::UnsafeParameters(_) => "adjust the request and try again",
            OrchestratorError::PermissionDenied(_)
            | OrchestratorError::ToolNotAllowedForAgent { .. } => "contact an administrator",
            OrchestratorError::QuotaExceeded(_) => "retry after the window resets",
            OrchestratorError::RateLimited => "slow down and retry shortly",
            OrchestratorError::SessionNotFound | OrchestratorError::SessionExpired => {
                "start a new conversation"
            }
            OrchestratorError::TooManySessions => "end an open conversation first",
            OrchestratorError::ModelUnavailable
            | OrchestratorError::ModelTimeout
            | OrchestratorError::CircuitOpen(_)
            | OrchestratorError::BulkheadFull(_)
            | OrchestratorError::Timeout
            | OrchestratorError::Internal(_)
            | OrchestratorError::RecoveryExhausted => "retry in a few minutes",
            OrchestratorError::ToolResultUnknown => "check the action's effect before retrying",
        }
    }
}

impl From<ResilienceError> for OrchestratorError {
    fn from(e: ResilienceError) -> Self {
        match e {
            ResilienceError::CircuitOpen(name) => OrchestratorError::CircuitOpen(name),
            ResilienceError::BulkheadFull(name) => OrchestratorError::BulkheadFull(name),
            ResilienceError::Timeout(_) => OrchestratorError::Timeout,
        }
    }
}

impl From<StoreError> for OrchestratorError {
    fn from(e: StoreError) -> Self {
        OrchestratorError::Internal(e.to_string())
    }
}

impl From<ModelError> for OrchestratorError {
    fn from(e: ModelError) -> Self {
        match e {
            ModelError::Unavailable => OrchestratorError::ModelUnavailable,
            ModelError::Timeout => OrchestratorError::ModelTimeout,
            ModelError::ContentTooLarge => {
                OrchestratorError::Validation("request content is too large".into())
            }
            ModelError::Resilience(r) => r.into(),
            // Status/transport/protocol details are diagnostic only; after the
            // fallback chain they all read as "nothing could serve this".
            ModelError::Status(_) | ModelError::Transport(_) | ModelError::Protocol(_) => {
                OrchestratorError::ModelUnavailable
            }
        }
    }
}

impl From<DispatchError> for OrchestratorError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::UnknownTool(name) => {
                OrchestratorError::InvalidToolParameters(format!("unknown tool '{name}'"))
            }
            DispatchError::InvalidParameters(msg) => OrchestratorError::InvalidToolParameters(msg),
            DispatchError::NotAllowedForAgent { tool, agent } => {
                OrchestratorError::ToolNotAllowedForAgent { tool, agent }
            }
            DispatchError::AdminRequired(_) => {
                OrchestratorError::PermissionDenied("ai:admin".into())
            }
            DispatchError::Unsafe(msg) => OrchestratorError::UnsafeParameters(msg),
            DispatchError::ResultUnknown(_) => OrchestratorError::ToolResultUnknown,
            DispatchError::Resilience(r) => r.into(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
