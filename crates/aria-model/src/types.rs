// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use aria_resilience::ResilienceError;

/// Sampling options forwarded to the backend.  Part of the response-cache key,
/// so two requests differing only in options never share a cached completion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerateOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
    #[serde(default)]
    pub options: GenerateOptions,
}

/// One element of a backend token stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A text fragment.
    TokenDelta(String),
    /// The model asks for a tool invocation; the orchestrator dispatches it
    /// and re-enters generation with the result injected.
    ToolCallRequest {
        name: String,
        parameters: serde_json::Value,
    },
    /// End-of-stream marker.  A stream that ends without this is treated as a
    /// mid-stream disconnect (a failure for circuit-breaker purposes).
    Done,
}

pub type TokenStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, ModelError>> + Send>>;

#[derive(Debug, Clone, Error)]
pub enum ModelError {
    #[error("no inference client is ready and no fallback resolved")]
    Unavailable,

    #[error("model call exceeded its deadline")]
    Timeout,

    #[error("prompt exceeds the backend's content limit")]
    ContentTooLarge,

    #[error("backend returned status {0}")]
    Status(u16),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed stream chunk: {0}")]
    Protocol(String),

    #[error(transparent)]
    Resilience(#[from] ResilienceError),
}

impl ModelError {
    /// Whether the retry policy may re-attempt after this failure.
    /// Backend overload (503/429), transport drops, and deadline misses are
    /// transient; everything else fails the attempt sequence outright.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ModelError::Status(503) | ModelError::Status(429) | ModelError::Transport(_) | ModelError::Timeout
        )
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overload_statuses_are_transient() {
        assert!(ModelError::Status(503).is_transient());
        assert!(ModelError::Status(429).is_transient());
        assert!(ModelError::Transport("reset".into()).is_transient());
        assert!(ModelError::Timeout.is_transient());
    }

    #[test]
    fn hard_failures_are_not_transient() {
        assert!(!ModelError::Status(400).is_transient());
        assert!(!ModelError::ContentTooLarge.is_transient());
        assert!(!ModelError::Unavailable.is_transient());
    }

    #[test]
    fn options_serialization_omits_unset_fields() {
        let opts = GenerateOptions::default();
        assert_eq!(serde_json::to_string(&opts).unwrap(), "{}");
        let opts = GenerateOptions {
            max_tokens: Some(64),
            temperature: None,
        };
        assert_eq!(serde_json::to_string(&opts).unwrap(), r#"{"max_tokens":64}"#);
    }
}
