// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use crate::Tool;

/// Central registry holding all dispatchable tools.
/// Immutable after construction; shared by handle.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{FnTool, ToolOutput};

    fn echo_tool(name: &str) -> FnTool {
        FnTool::new(name, "echoes its input", json!({"type": "object"}), |args| async move {
            ToolOutput::ok(format!("echo:{args}"))
        })
    }

    #[test]
    fn register_and_get() {
        let mut reg = ToolRegistry::new();
        reg.register(echo_tool("echo"));
        assert!(reg.get("echo").is_some());
    }

    #[test]
    fn get_unknown_returns_none() {
        let reg = ToolRegistry::new();
        assert!(reg.get("nope").is_none());
    }

    #[test]
    fn names_are_sorted() {
        let mut reg = ToolRegistry::new();
        reg.register(echo_tool("b"));
        reg.register(echo_tool("a"));
        assert_eq!(reg.names(), vec!["a", "b"]);
    }

    #[test]
    fn registering_same_name_twice_overwrites() {
        let mut reg = ToolRegistry::new();
        reg.register(echo_tool("t"));
        reg.register(echo_tool("t"));
        assert_eq!(reg.names().len(), 1);
    }
}
