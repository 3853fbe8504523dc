// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Opaque group memberships carried by the auth layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Memberships {
    #[serde(default)]
    pub families: HashSet<String>,
    #[serde(default)]
    pub workspaces: HashSet<String>,
}

/// Stable identity carrier produced by the external auth layer.
///
/// Immutable within a request; for a streaming session it lives as long as
/// the subscription.  The orchestrator never mutates it and never resolves
/// identity itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserContext {
    pub user_id: String,
    #[serde(default)]
    pub roles: HashSet<String>,
    #[serde(default)]
    pub permissions: HashSet<String>,
    #[serde(default)]
    pub memberships: Memberships,
}

impl UserContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            roles: HashSet::new(),
            permissions: HashSet::new(),
            memberships: Memberships::default(),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.insert(permission.into());
        self
    }

    pub fn with_family(mut self, family_id: impl Into<String>) -> Self {
        self.memberships.families.insert(family_id.into());
        self
    }

    /// Direct permission check only; role expansion happens in the gate.
    pub fn has_permission(&self, tag: &str) -> bool {
        self.permissions.contains(tag)
    }

    pub fn is_family_member(&self, family_id: &str) -> bool {
        self.memberships.families.contains(family_id)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
