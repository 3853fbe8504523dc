// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Static agent table and request routing.
//!
//! Agents are configuration, not behaviour: one [`AgentProfile`] per kind
//! holds the capability set, tool allowlist, required permission tag, prompt
//! preamble, and routing data.  Behaviour differences live in the
//! orchestrator, keyed off this data.

mod registry;
mod router;

pub use registry::{AgentProfile, AgentRegistry};
pub use router::Router;

use serde::{Deserialize, Serialize};

/// Permission tags referenced by profiles and the gate.
pub mod permissions {
    pub const BASIC_CHAT: &str = "ai:basic_chat";
    pub const VOICE: &str = "ai:voice";
    pub const FAMILY_MANAGEMENT: &str = "ai:family_management";
    pub const WORKSPACE: &str = "ai:workspace";
    pub const COMMERCE: &str = "ai:commerce";
    pub const ADMIN: &str = "ai:admin";
}

/// The six specialized agent roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Family,
    Personal,
    Workspace,
    Commerce,
    Security,
    Voice,
}

impl AgentKind {
    pub const ALL: [AgentKind; 6] = [
        AgentKind::Family,
        AgentKind::Personal,
        AgentKind::Workspace,
        AgentKind::Commerce,
        AgentKind::Security,
        AgentKind::Voice,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Family => "family",
            AgentKind::Personal => "personal",
            AgentKind::Workspace => "workspace",
            AgentKind::Commerce => "commerce",
            AgentKind::Security => "security",
            AgentKind::Voice => "voice",
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AgentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "family" => Ok(AgentKind::Family),
            "personal" => Ok(AgentKind::Personal),
            "workspace" => Ok(AgentKind::Workspace),
            "commerce" => Ok(AgentKind::Commerce),
            "security" => Ok(AgentKind::Security),
            "voice" => Ok(AgentKind::Voice),
            other => Err(format!("unknown agent kind '{other}'")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
