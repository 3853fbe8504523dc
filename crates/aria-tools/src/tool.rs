// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

/// A single tool invocation requested by an agent.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub name: String,
    /// Parsed JSON arguments
    pub parameters: Value,
}

/// The result of executing a tool.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub content: String,
    /// If true, the tool execution failed non-fatally (returned error message).
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            content: msg.into(),
            is_error: true,
        }
    }
}

/// Contract every dispatchable tool implements.  The tool bodies themselves
/// are external collaborators — this crate owns only their dispatch envelope.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for parameters.  The dispatcher validates every call
    /// against this before anything else runs.
    fn parameters_schema(&self) -> Value;
    /// Dangerous tools (admin/system scope) require `ai:admin` and are
    /// audited at critical level.
    fn dangerous(&self) -> bool {
        false
    }
    /// Per-tool deadline override; `None` uses the configured default.
    fn timeout(&self) -> Option<Duration> {
        None
    }
    /// Execute the tool.  Errors should be wrapped in [`ToolOutput::err`].
    async fn execute(&self, call: &ToolCall) -> ToolOutput;
}

type FnToolHandler =
    Box<dyn Fn(Value) -> Pin<Box<dyn Future<Output = ToolOutput> + Send>> + Send + Sync>;

/// Closure-backed [`Tool`] — the adapter for the external named-call tool
/// backend (`invoke(tool_name, parameters)`), and a convenient test double.
pub struct FnTool {
    name: String,
    description: String,
    schema: Value,
    dangerous: bool,
    timeout: Option<Duration>,
    handler: FnToolHandler,
}

impl FnTool {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ToolOutput> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
            dangerous: false,
            timeout: None,
            handler: Box::new(move |v| Box::pin(handler(v))),
        }
    }

    pub fn dangerous(mut self) -> Self {
        self.dangerous = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.schema.clone()
    }

    fn dangerous(&self) -> bool {
        self.dangerous
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        (self.handler)(call.parameters.clone()).await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
