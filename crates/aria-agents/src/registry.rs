// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use crate::{permissions, AgentKind};

/// Static description of one agent kind.  One instance per kind,
/// process-wide; referenced, never owned, by sessions.
#[derive(Debug, Clone)]
pub struct AgentProfile {
    pub kind: AgentKind,
    /// Capability tags surfaced to clients (`session_start` payload).
    pub capabilities: &'static [&'static str],
    /// Prompt preamble prepended to every conversation for this agent.
    pub default_prompt: &'static str,
    /// Tools this agent may dispatch.  The dispatcher intersects every
    /// invocation with this list.
    pub tool_allowlist: &'static [&'static str],
    /// Permission tag the gate requires for any operation on this agent.
    pub required_permission: &'static str,
    /// Deterministic tie-break when the classifier scores several kinds
    /// equally — lower wins.
    pub priority: u8,
    /// Keywords the router scores a first message against.
    pub keywords: &'static [&'static str],
}

/// Process-wide table of agent profiles.
pub struct AgentRegistry {
    profiles: HashMap<AgentKind, AgentProfile>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        let profiles = [
            AgentProfile {
                kind: AgentKind::Personal,
                capabilities: &["profile", "security_settings", "personal_assets"],
                default_prompt: "You are a personal assistant. Help the user manage their \
                                 profile, security settings, and personal items. Be concise.",
                tool_allowlist: &[
                    "profile_lookup",
                    "security_settings",
                    "asset_query",
                    "reminder_create",
                ],
                required_permission: permissions::BASIC_CHAT,
                priority: 1,
                keywords: &["profile", "password", "reminder", "my account", "settings"],
            },
            AgentProfile {
                kind: AgentKind::Family,
                capabilities: &["family_lifecycle", "member_invitations", "token_requests"],
                default_prompt: "You are a family coordination assistant. Help with family \
                                 membership, invitations, and shared token requests.",
                tool_allowlist: &[
                    "family_lookup",
                    "member_invite",
                    "member_remove",
                    "token_request",
                ],
                required_permission: permissions::FAMILY_MANAGEMENT,
                priority: 2,
                keywords: &["family", "invite", "member", "household", "kids"],
            },
            AgentProfile {
                kind: AgentKind::Workspace,
                capabilities: &["teams", "projects", "budgets"],
                default_prompt: "You are a workspace assistant. Coordinate teams, projects, \
                                 and budget planning for the user's workspace.",
                tool_allowlist: &[
                    "team_lookup",
                    "project_create",
                    "project_status",
                    "budget_report",
                ],
                required_permission: permissions::WORKSPACE,
                priority: 3,
                keywords: &["team", "project", "budget", "deadline", "workspace", "sprint"],
            },
            AgentProfile {
                kind: AgentKind::Commerce,
                capabilities: &["catalog", "budget_advice", "purchase_assistance"],
                default_prompt: "You are a commerce assistant. Help the user browse the \
                                 catalog, compare options, and plan purchases within budget.",
                tool_allowlist: &["catalog_search", "price_compare", "order_status"],
                required_permission: permissions::COMMERCE,
                priority: 4,
                keywords: &["buy", "purchase", "price", "order", "catalog", "shop"],
            },
            AgentProfile {
                kind: AgentKind::Security,
                capabilities: &["monitoring", "audit", "administration"],
                default_prompt: "You are a security operations assistant. Surface audit \
                                 findings and monitoring alerts; never reveal raw credentials.",
                tool_allowlist: &[
                    "audit_query",
                    "monitor_status",
                    "user_suspend",
                    "system_config",
                ],
                required_permission: permissions::ADMIN,
                priority: 5,
                keywords: &["audit", "alert", "suspicious", "breach", "monitor"],
            },
            AgentProfile {
                kind: AgentKind::Voice,
                capabilities: &["voice_capture", "agent_routing"],
                default_prompt: "You route transcribed voice input to the right assistant.",
                tool_allowlist: &[],
                required_permission: permissions::VOICE,
                priority: 6,
                keywords: &[],
            },
        ]
        .into_iter()
        .map(|p| (p.kind, p))
        .collect();
        Self { profiles }
    }

    pub fn get(&self, kind: AgentKind) -> &AgentProfile {
        // The table is total over AgentKind by construction.
        &self.profiles[&kind]
    }

    pub fn required_permission(&self, kind: AgentKind) -> &'static str {
        self.get(kind).required_permission
    }

    pub fn profiles(&self) -> impl Iterator<Item = &AgentProfile> {
        self.profiles.values()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_total_over_all_kinds() {
        let reg = AgentRegistry::new();
        for kind in AgentKind::ALL {
            assert_eq!(reg.get(kind).kind, kind);
        }
    }

    #[test]
    fn permissions_match_agent_roles() {
        let reg = AgentRegistry::new();
        assert_eq!(reg.required_permission(AgentKind::Personal), "ai:basic_chat");
        assert_eq!(
            reg.required_permission(AgentKind::Family),
            "ai:family_management"
        );
        assert_eq!(reg.required_permission(AgentKind::Workspace), "ai:workspace");
        assert_eq!(reg.required_permission(AgentKind::Commerce), "ai:commerce");
        assert_eq!(reg.required_permission(AgentKind::Security), "ai:admin");
        assert_eq!(reg.required_permission(AgentKind::Voice), "ai:voice");
    }

    #[test]
    fn priorities_are_unique() {
        let reg = AgentRegistry::new();
        let mut priorities: Vec<u8> = reg.profiles().map(|p| p.priority).collect();
        priorities.sort_unstable();
        priorities.dedup();
        assert_eq!(priorities.len(), AgentKind::ALL.len());
    }

    #[test]
    fn voice_agent_has_no_tools() {
        let reg = AgentRegistry::new();
        assert!(reg.get(AgentKind::Voice).tool_allowlist.is_empty());
    }
}
