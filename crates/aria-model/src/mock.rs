// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::backend::InferenceBackend;
use crate::types::{GenerateRequest, ModelError, StreamEvent, TokenStream};

/// Deterministic mock backend for tests.  Echoes the prompt back as a single
/// token burst without any network access.
pub struct MockBackend {
    name: String,
    model: String,
}

impl MockBackend {
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl InferenceBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, req: GenerateRequest) -> Result<TokenStream, ModelError> {
        let events: Vec<Result<StreamEvent, ModelError>> = vec![
            Ok(StreamEvent::TokenDelta(format!("MOCK: {}", req.prompt))),
            Ok(StreamEvent::Done),
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

/// One pre-scripted call outcome.
#[derive(Debug, Clone)]
pub enum ScriptedCall {
    /// `generate` itself fails (connect error, non-2xx status, …).
    Fail(ModelError),
    /// `generate` succeeds and the stream yields these events in order.
    Events(Vec<Result<StreamEvent, ModelError>>),
}

/// A pre-scripted backend.  Each `generate` call pops the next script from
/// the front of the queue, letting tests specify exact event sequences —
/// including tool calls and injected failures — without network access.
pub struct ScriptedBackend {
    name: String,
    model: String,
    scripts: Arc<Mutex<Vec<ScriptedCall>>>,
    /// Prompts seen by this backend, for request inspection in tests.
    pub prompts: Arc<Mutex<Vec<String>>>,
}

impl ScriptedBackend {
    pub fn new(name: impl Into<String>, scripts: Vec<ScriptedCall>) -> Self {
        Self {
            name: name.into(),
            model: "scripted-model".into(),
            scripts: Arc::new(Mutex::new(scripts)),
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Convenience: backend whose every call streams `text` then `Done`.
    /// When the script queue is exhausted the last behaviour repeats.
    pub fn always_text(name: impl Into<String>, text: impl Into<String>) -> Self {
        let t = text.into();
        Self::new(
            name,
            vec![ScriptedCall::Events(vec![
                Ok(StreamEvent::TokenDelta(t)),
                Ok(StreamEvent::Done),
            ])],
        )
    }

    /// Convenience: fail the first `n` calls with `err`, then stream `text`.
    pub fn fail_times(
        name: impl Into<String>,
        n: usize,
        err: ModelError,
        text: impl Into<String>,
    ) -> Self {
        let mut scripts: Vec<ScriptedCall> =
            (0..n).map(|_| ScriptedCall::Fail(err.clone())).collect();
        scripts.push(ScriptedCall::Events(vec![
            Ok(StreamEvent::TokenDelta(text.into())),
            Ok(StreamEvent::Done),
        ]));
        Self::new(name, scripts)
    }

    /// Convenience: first call requests a tool, second call streams `text`.
    pub fn tool_then_text(
        name: impl Into<String>,
        tool_name: impl Into<String>,
        parameters: serde_json::Value,
        text: impl Into<String>,
    ) -> Self {
        Self::new(
            name,
            vec![
                ScriptedCall::Events(vec![
                    Ok(StreamEvent::ToolCallRequest {
                        name: tool_name.into(),
                        parameters,
                    }),
                    Ok(StreamEvent::Done),
                ]),
                ScriptedCall::Events(vec![
                    Ok(StreamEvent::TokenDelta(text.into())),
                    Ok(StreamEvent::Done),
                ]),
            ],
        )
    }

    /// Number of `generate` calls received so far.
    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl InferenceBackend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, req: GenerateRequest) -> Result<TokenStream, ModelError> {
        self.prompts.lock().unwrap().push(req.prompt);
        let call = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.len() > 1 {
                scripts.remove(0)
            } else {
                // Repeat the final script so long-running tests keep working.
                scripts
                    .first()
                    .cloned()
                    .unwrap_or(ScriptedCall::Fail(ModelError::Unavailable))
            }
        };
        match call {
            ScriptedCall::Fail(e) => Err(e),
            ScriptedCall::Events(events) => Ok(Box::pin(stream::iter(events))),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
