// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use aria_agents::{permissions, AgentKind, AgentRegistry};
use aria_config::{AuthConfig, PrivacyMode, QuotaConfig, RateLimitConfig};
use aria_store::{keys, Store};

use crate::audit::{AuditKind, AuditLog, AuditRecord};
use crate::context::UserContext;
use crate::error::OrchestratorError;

/// Orchestrator entry points, as the gate sees them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Chat,
    Voice,
    CreateSession,
    EndSession,
    ToolInvoke,
    AgentSwitch,
    Subscribe,
}

impl Operation {
    /// Ending a session or attaching a subscriber never burns quota.
    fn consumes_quota(&self) -> bool {
        matches!(
            self,
            Operation::Chat | Operation::Voice | Operation::CreateSession | Operation::ToolInvoke
        )
    }
}

/// One admission request.
pub struct GateRequest<'a> {
    pub user: &'a UserContext,
    pub operation: Operation,
    pub agent_kind: AgentKind,
    pub session_id: Option<Uuid>,
    pub tool_name: Option<&'a str>,
    pub privacy: PrivacyMode,
    /// Family referenced by a family-shared session.
    pub family_id: Option<&'a str>,
}

/// Guards every orchestrator entry: permission → rate limit → quota →
/// privacy mode, in that order.  Counters are read first and incremented
/// only once the whole request is admitted; the read-modify-write runs under
/// a per-user lock so concurrent requests from one user serialize.
///
/// Denials are audited and never retried.
pub struct PermissionGate {
    store: Arc<dyn Store>,
    quota: QuotaConfig,
    ratelimit: RateLimitConfig,
    role_permissions: HashMap<String, HashSet<String>>,
    agents: Arc<AgentRegistry>,
    audit: Arc<AuditLog>,
    user_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PermissionGate {
    pub fn new(
        store: Arc<dyn Store>,
        auth: &AuthConfig,
        quota: QuotaConfig,
        ratelimit: RateLimitConfig,
        agents: Arc<AgentRegistry>,
        audit: Arc<AuditLog>,
    ) -> Self {
        let role_permissions = auth
            .role_permissions
            .iter()
            .map(|(role, perms)| (role.clone(), perms.iter().cloned().collect()))
            .collect();
        Self {
            store,
            quota,
            ratelimit,
            role_permissions,
            agents,
            audit,
            user_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Direct permissions plus every permission mapped from the user's roles.
    pub fn effective_permissions(&self, user: &UserContext) -> HashSet<String> {
        let mut perms = user.permissions.clone();
        for role in &user.roles {
            if let Some(mapped) = self.role_permissions.get(role) {
                perms.extend(mapped.iter().cloned());
            }
        }
        perms
    }

    pub fn has_permission(&self, user: &UserContext, tag: &str) -> bool {
        self.effective_permissions(user).contains(tag)
    }

    /// Whether the user may invoke dangerous tools.
    pub fn is_admin(&self, user: &UserContext) -> bool {
        self.has_permission(user, permissions::ADMIN)
    }

    fn required_permission(&self, op: Operation, agent: AgentKind) -> Option<&'static str> {
        match op {
            // Ending one's own session needs no permission tag; ownership is
            // checked by the session manager.
            Operation::EndSession => None,
            Operation::Voice => Some(permissions::VOICE),
            _ => Some(self.agents.required_permission(agent)),
        }
    }

    async fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.user_locks.lock().await;
        Arc::clone(locks.entry(user_id.to_string()).or_default())
    }

    pub async fn check_and_admit(&self, req: &GateRequest<'_>) -> Result<(), OrchestratorError> {
        // 1. Permission.
        if let Some(required) = self.required_permission(req.operation, req.agent_kind) {
            if !self.has_permission(req.user, required) {
                self.deny(
                    req,
                    AuditKind::PermissionDenied,
                    serde_json::json!({ "required": required }),
                )
                .await;
                return Err(OrchestratorError::PermissionDenied(required.to_string()));
            }
        }

        // 4 runs before the counters so a privacy violation never burns quota.
        if req.privacy == PrivacyMode::FamilyShared {
            let member = req
                .family_id
                .is_some_and(|fam| req.user.is_family_member(fam));
            if !member {
                self.deny(
                    req,
                    AuditKind::PermissionDenied,
                    serde_json::json!({ "privacy_mode": "family_shared" }),
                )
                .await;
                return Err(OrchestratorError::PermissionDenied(
                    "family membership".to_string(),
                ));
            }
        }

        if !req.operation.consumes_quota() {
            return Ok(());
        }

        // 2 + 3. Rate limit and quotas: read, compare, then increment — all
        // under the per-user lock so parallel requests cannot double-spend.
        let lock = self.user_lock(&req.user.user_id).await;
        let _guard = lock.lock().await;

        let now = Utc::now().timestamp();
        let minute_window = now / 60;
        let rate_key = keys::ratelimit(&req.user.user_id, minute_window);
        let hourly_key = keys::quota_hourly(&req.user.user_id);
        let daily_key = keys::quota_daily(&req.user.user_id);

        let rate_count = self.store.get_counter(&rate_key).await?;
        if rate_count >= self.ratelimit.per_minute as i64 {
            self.deny(req, AuditKind::RateLimited, serde_json::json!({ "window": "minute" }))
                .await;
            return Err(OrchestratorError::RateLimited);
        }

        let hourly = self.store.get_counter(&hourly_key).await?;
        if hourly >= self.quota.requests_per_hour as i64 {
            self.deny(req, AuditKind::QuotaExceeded, serde_json::json!({ "window": "hourly" }))
                .await;
            return Err(OrchestratorError::QuotaExceeded("hourly"));
        }
        let daily = self.store.get_counter(&daily_key).await?;
        if daily >= self.quota.requests_per_day as i64 {
            self.deny(req, AuditKind::QuotaExceeded, serde_json::json!({ "window": "daily" }))
                .await;
            return Err(OrchestratorError::QuotaExceeded("daily"));
        }

        // Admitted: spend the counters.  Expiries anchor to the window end at
        // counter creation time.
        let to_hour_end = Duration::from_secs((3600 - now.rem_euclid(3600)) as u64);
        let to_day_end = Duration::from_secs((86_400 - now.rem_euclid(86_400)) as u64);
        self.store
            .incr_with_expiry(&rate_key, Duration::from_secs(60))
            .await?;
        self.store.incr_with_expiry(&hourly_key, to_hour_end).await?;
        self.store.incr_with_expiry(&daily_key, to_day_end).await?;

        debug!(
            user = %req.user.user_id,
            op = ?req.operation,
            hourly = hourly + 1,
            daily = daily + 1,
            "request admitted"
        );
        Ok(())
    }

    async fn deny(&self, req: &GateRequest<'_>, kind: AuditKind, detail: serde_json::Value) {
        let severity = match kind {
            AuditKind::PermissionDenied => crate::error::Severity::Critical,
            _ => crate::error::Severity::Medium,
        };
        let mut rec = AuditRecord::new(kind, req.user.user_id.clone(), severity)
            .with_agent(req.agent_kind)
            .with_detail(detail);
        if let Some(sid) = req.session_id {
            rec = rec.with_session(sid);
        }
        self.audit.record(rec).await;
    }

    /// Current quota counters for a user (inspection and tests).
    pub async fn quota_counters(&self, user_id: &str) -> Result<(i64, i64), OrchestratorError> {
        let hourly = self.store.get_counter(&keys::quota_hourly(user_id)).await?;
        let daily = self.store.get_counter(&keys::quota_daily(user_id)).await?;
        Ok((hourly, daily))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
