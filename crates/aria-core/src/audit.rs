// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use uuid::Uuid;

use aria_agents::AgentKind;
use aria_store::{keys, Store};
use aria_tools::{InvocationOutcome, InvocationRecord};

use crate::error::Severity;

const AUDIT_TTL: Duration = Duration::from_secs(30 * 86_400);
const AUDIT_DAY_CAP: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    ToolInvocation,
    PermissionDenied,
    QuotaExceeded,
    RateLimited,
    Error,
}

/// One append-only audit entry.  Never mutated after recording.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub kind: AuditKind,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_kind: Option<AgentKind>,
    pub severity: Severity,
    pub detail: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(kind: AuditKind, user_id: impl Into<String>, severity: Severity) -> Self {
        Self {
            kind,
            user_id: user_id.into(),
            session_id: None,
            agent_kind: None,
            severity,
            detail: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn with_session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_agent(mut self, agent_kind: AgentKind) -> Self {
        self.agent_kind = Some(agent_kind);
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

/// Append-only audit log, one capped list per day, 30-day retention.
///
/// Recording is best-effort: a store failure is logged and swallowed so the
/// audit path can never take down the request it describes.
pub struct AuditLog {
    store: Arc<dyn Store>,
}

impl AuditLog {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    fn day_key(at: DateTime<Utc>) -> String {
        keys::audit(&at.format("%Y-%m-%d").to_string())
    }

    pub async fn record(&self, rec: AuditRecord) {
        if rec.severity == Severity::Critical {
            error!(
                kind = ?rec.kind,
                user = %rec.user_id,
                detail = %rec.detail,
                "critical audit event"
            );
        }
        let json = match serde_json::to_string(&rec) {
            Ok(j) => j,
            Err(e) => {
                warn!(error = %e, "failed to serialize audit record");
                return;
            }
        };
        let key = Self::day_key(rec.timestamp);
        if let Err(e) = self
            .store
            .list_push_capped(&key, &json, AUDIT_DAY_CAP, Some(AUDIT_TTL))
            .await
        {
            warn!(error = %e, "failed to persist audit record");
        }
    }

    /// Record a tool invocation's terminal outcome.
    pub async fn record_tool(&self, user_id: &str, session_id: Uuid, rec: &InvocationRecord) {
        let severity = if rec.critical {
            Severity::Critical
        } else if rec.outcome == InvocationOutcome::Ok {
            Severity::Low
        } else {
            Severity::Medium
        };
        let detail = serde_json::to_value(rec).unwrap_or_default();
        self.record(
            AuditRecord::new(AuditKind::ToolInvocation, user_id, severity)
                .with_session(session_id)
                .with_agent(rec.agent_kind)
                .with_detail(detail),
        )
        .await;
    }

    /// Today's records, newest first (inspection and tests).
    pub async fn recent_today(&self, limit: usize) -> Vec<AuditRecord> {
        let key = Self::day_key(Utc::now());
        match self.store.list_range(&key, 0, limit as isize - 1).await {
            Ok(raw) => raw
                .iter()
                .filter_map(|s| serde_json::from_str(s).ok())
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use aria_store::MemoryStore;

    use super::*;

    fn log() -> AuditLog {
        AuditLog::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn records_are_readable_back() {
        let log = log();
        log.record(
            AuditRecord::new(AuditKind::PermissionDenied, "u1", Severity::Critical)
                .with_detail(serde_json::json!({"required": "ai:admin"})),
        )
        .await;
        let recent = log.recent_today(10).await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].kind, AuditKind::PermissionDenied);
        assert_eq!(recent[0].detail["required"], "ai:admin");
    }

    #[tokio::test]
    async fn newest_record_comes_first() {
        let log = log();
        log.record(AuditRecord::new(AuditKind::RateLimited, "u1", Severity::Medium))
            .await;
        log.record(AuditRecord::new(AuditKind::QuotaExceeded, "u1", Severity::Medium))
            .await;
        let recent = log.recent_today(10).await;
        assert_eq!(recent[0].kind, AuditKind::QuotaExceeded);
        assert_eq!(recent[1].kind, AuditKind::RateLimited);
    }

    #[tokio::test]
    async fn tool_records_carry_their_outcome() {
        let log = log();
        let rec = InvocationRecord {
            tool_name: "catalog_search".into(),
            agent_kind: AgentKind::Commerce,
            user_id: "u1".into(),
            session_id: "s1".into(),
            started_at: Utc::now(),
            completed_at: Utc::now(),
            outcome: InvocationOutcome::Denied,
            duration_ms: 2,
            critical: true,
        };
        log.record_tool("u1", Uuid::new_v4(), &rec).await;
        let recent = log.recent_today(10).await;
        assert_eq!(recent[0].kind, AuditKind::ToolInvocation);
        assert_eq!(recent[0].severity, Severity::Critical);
        assert_eq!(recent[0].detail["outcome"], "denied");
    }
}
