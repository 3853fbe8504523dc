// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use aria_agents::AgentKind;
use aria_config::{PrivacyMode, RetentionConfig, SessionConfig};
use aria_resilience::{Bulkhead, CircuitBreaker};
use aria_store::{keys, Store};

use crate::context::UserContext;
use crate::conversation::ConversationLog;
use crate::error::OrchestratorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Paused,
    Expired,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Chat,
    Voice,
}

/// A bounded-lifetime conversational context tying a user to an agent.
///
/// Mutated only through [`SessionManager`] operations; every other component
/// refers to it by id.
#[derive(Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: Uuid,
    pub user_id: String,
    pub agent_kind: AgentKind,
    pub mode: SessionMode,
    pub privacy_mode: PrivacyMode,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub conversation_id: String,
    /// Family referenced by a family-shared session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_id: Option<String>,
    /// Random per-session secret, verified on transport reconnects.
    /// Never logged; the manual `Debug` impl redacts it.
    pub security_token: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("user_id", &self.user_id)
            .field("agent_kind", &self.agent_kind)
            .field("mode", &self.mode)
            .field("privacy_mode", &self.privacy_mode)
            .field("status", &self.status)
            .field("created_at", &self.created_at)
            .field("last_activity_at", &self.last_activity_at)
            .field("expires_at", &self.expires_at)
            .field("conversation_id", &self.conversation_id)
            .field("security_token", &"<redacted>")
            .finish()
    }
}

impl Session {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
            || matches!(self.status, SessionStatus::Expired | SessionStatus::Terminated)
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.status == SessionStatus::Active && !self.is_expired_at(now)
    }
}

fn new_security_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Owns session and conversation lifecycles against the store.
///
/// Failure semantics follow the write path: persistence failures during
/// `create` are fatal to the request, failures during `touch` only log a
/// warning, and failures during `end` are retried in the background.
pub struct SessionManager {
    store: Arc<dyn Store>,
    cfg: SessionConfig,
    retention: RetentionConfig,
    conversations: Arc<ConversationLog>,
    bulkhead: Arc<Bulkhead>,
    breaker: Arc<CircuitBreaker>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn Store>,
        cfg: SessionConfig,
        retention: RetentionConfig,
        conversations: Arc<ConversationLog>,
        bulkhead: Arc<Bulkhead>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            store,
            cfg,
            retention,
            conversations,
            bulkhead,
            breaker,
        }
    }

    fn idle_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cfg.idle_ttl_s as i64)
    }

    fn max_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cfg.max_ttl_s as i64)
    }

    async fn persist(&self, session: &Session) -> Result<(), OrchestratorError> {
        let json = serde_json::to_string(session)
            .map_err(|e| OrchestratorError::Internal(format!("serializing session: {e}")))?;
        let ttl = (session.expires_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::from_secs(1));
        self.store
            .set(&keys::session(&session.session_id.to_string()), &json, Some(ttl))
            .await?;
        Ok(())
    }

    async fn load(&self, session_id: Uuid) -> Result<Session, OrchestratorError> {
        let raw = self
            .store
            .get(&keys::session(&session_id.to_string()))
            .await?
            .ok_or(OrchestratorError::SessionNotFound)?;
        serde_json::from_str(&raw)
            .map_err(|e| OrchestratorError::Internal(format!("corrupt session record: {e}")))
    }

    /// Count the user's live sessions, pruning dead ids from the index.
    async fn active_count(&self, user_id: &str) -> Result<u32, OrchestratorError> {
        let index_key = keys::session_index(user_id);
        let ids = self.store.set_members(&index_key).await?;
        let now = Utc::now();
        let mut count = 0u32;
        for id in ids {
            let live = match id.parse::<Uuid>() {
                Ok(sid) => match self.load(sid).await {
                    Ok(s) => s.is_active_at(now) || s.status == SessionStatus::Paused,
                    Err(_) => false,
                },
                Err(_) => false,
            };
            if live {
                count += 1;
            } else {
                self.store.set_remove(&index_key, &id).await?;
            }
        }
        Ok(count)
    }

    /// Create a session for `user` on `agent_kind`.
    ///
    /// Rejects with `TooManySessions` above the per-user cap.  Persistence
    /// failure here is fatal to the request.
    pub async fn create(
        &self,
        user: &UserContext,
        agent_kind: AgentKind,
        mode: SessionMode,
        privacy_mode: PrivacyMode,
        family_id: Option<String>,
    ) -> Result<Session, OrchestratorError> {
        let _permit = self.bulkhead.acquire().await?;

        if self.active_count(&user.user_id).await? >= self.cfg.max_concurrent_per_user {
            return Err(OrchestratorError::TooManySessions);
        }

        self.breaker.acquire()?;

        let now = Utc::now();
        let session = Session {
            session_id: Uuid::new_v4(),
            user_id: user.user_id.clone(),
            agent_kind,
            mode,
            privacy_mode,
            status: SessionStatus::Active,
            created_at: now,
            last_activity_at: now,
            expires_at: now + self.idle_ttl(),
            conversation_id: Uuid::new_v4().to_string(),
            family_id,
            security_token: new_security_token(),
            metadata: serde_json::Value::Null,
        };

        let persisted = async {
            self.persist(&session).await?;
            self.store
                .set_add(&keys::session_index(&user.user_id), &session.session_id.to_string())
                .await?;
            Ok::<(), OrchestratorError>(())
        }
        .await;
        match persisted {
            Ok(()) => {
                self.breaker.record_success();
                info!(session_id = %session.session_id, user = %user.user_id, agent = %agent_kind, "session created");
                Ok(session)
            }
            Err(e) => {
                self.breaker.record_failure();
                Err(e)
            }
        }
    }

    /// Validate ownership and expiry, un-pause if needed, and refresh
    /// `last_activity_at`.
    pub async fn resume(
        &self,
        session_id: Uuid,
        user: &UserContext,
    ) -> Result<Session, OrchestratorError> {
        let mut session = self.load(session_id).await?;
        if session.user_id != user.user_id {
            // Ownership mismatches read as not-found so session ids can't be
            // probed across users.
            return Err(OrchestratorError::SessionNotFound);
        }
        if session.is_expired_at(Utc::now()) {
            return Err(OrchestratorError::SessionExpired);
        }
        if session.status == SessionStatus::Paused {
            session.status = SessionStatus::Active;
        }
        session.last_activity_at = Utc::now();
        if let Err(e) = self.persist(&session).await {
            warn!(%session_id, error = %e, "persisting resumed session failed");
        }
        Ok(session)
    }

    /// Load + ownership check without mutating anything.  Used by subscribe.
    pub async fn peek(
        &self,
        session_id: Uuid,
        user: &UserContext,
    ) -> Result<Session, OrchestratorError> {
        let session = self.load(session_id).await?;
        if session.user_id != user.user_id {
            return Err(OrchestratorError::SessionNotFound);
        }
        Ok(session)
    }

    /// Resolve the session for an inbound message: owner, not expired, and
    /// status `active` (paused sessions do not accept messages).
    pub async fn resolve_for_message(
        &self,
        session_id: Uuid,
        user: &UserContext,
    ) -> Result<Session, OrchestratorError> {
        let session = self.peek(session_id, user).await?;
        if session.is_expired_at(Utc::now()) {
            return Err(OrchestratorError::SessionExpired);
        }
        if session.status != SessionStatus::Active {
            return Err(OrchestratorError::Validation(
                "session is paused; resume it first".into(),
            ));
        }
        Ok(session)
    }

    /// Refresh activity and extend the soft expiry, capped by the hard TTL.
    /// Failures log a warning and never interrupt an in-flight message.
    pub async fn touch(&self, session_id: Uuid) {
        let mut session = match self.load(session_id).await {
            Ok(s) => s,
            Err(e) => {
                warn!(%session_id, error = %e, "touch: session load failed");
                return;
            }
        };
        let now = Utc::now();
        session.last_activity_at = now;
        let hard_cap = session.created_at + self.max_ttl();
        session.expires_at = std::cmp::min(now + self.idle_ttl(), hard_cap);
        if let Err(e) = self.persist(&session).await {
            warn!(%session_id, error = %e, "touch: persisting session failed");
        }
    }

    /// Switch an in-session agent.  The caller re-checks permissions and
    /// emits the `agent_switch` event.
    pub async fn switch_agent(
        &self,
        session_id: Uuid,
        user: &UserContext,
        agent_kind: AgentKind,
    ) -> Result<Session, OrchestratorError> {
        let mut session = self.peek(session_id, user).await?;
        if session.is_expired_at(Utc::now()) {
            return Err(OrchestratorError::SessionExpired);
        }
        session.agent_kind = agent_kind;
        session.last_activity_at = Utc::now();
        self.persist(&session).await?;
        Ok(session)
    }

    /// Explicit pause.  Paused sessions keep their expiry clock running.
    pub async fn pause(
        &self,
        session_id: Uuid,
        user: &UserContext,
    ) -> Result<Session, OrchestratorError> {
        let mut session = self.peek(session_id, user).await?;
        if session.is_expired_at(Utc::now()) {
            return Err(OrchestratorError::SessionExpired);
        }
        session.status = SessionStatus::Paused;
        self.persist(&session).await?;
        Ok(session)
    }

    /// Terminate a session and archive its conversation per the privacy
    /// mode's retention policy.  A failed terminal write is retried in the
    /// background rather than failing the caller.
    pub async fn end(
        &self,
        session_id: Uuid,
        user: &UserContext,
        reason: &str,
    ) -> Result<Session, OrchestratorError> {
        let mut session = self.peek(session_id, user).await?;
        session.status = SessionStatus::Terminated;
        info!(%session_id, user = %user.user_id, reason, "session terminated");

        if let Err(e) = self.persist(&session).await {
            warn!(%session_id, error = %e, "terminal write failed; retrying in background");
            self.retry_terminal_write(session.clone());
        }
        self.store
            .set_remove(&keys::session_index(&user.user_id), &session_id.to_string())
            .await?;

        let policy = self.retention.policy_for(session.privacy_mode);
        if let Err(e) = self
            .conversations
            .apply_retention(&session.conversation_id, policy)
            .await
        {
            warn!(%session_id, error = %e, "conversation archival failed");
        }
        Ok(session)
    }

    fn retry_terminal_write(&self, session: Session) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            let key = keys::session(&session.session_id.to_string());
            let json = match serde_json::to_string(&session) {
                Ok(j) => j,
                Err(_) => return,
            };
            for attempt in 1..=3u32 {
                tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                match store.set(&key, &json, Some(Duration::from_secs(60))).await {
                    Ok(()) => {
                        debug!(session_id = %session.session_id, attempt, "terminal write succeeded");
                        return;
                    }
                    Err(e) => {
                        warn!(session_id = %session.session_id, attempt, error = %e, "terminal write retry failed");
                    }
                }
            }
        });
    }

    /// Sweep expired sessions.  Returns the sessions terminated by this run
    /// so the caller can emit their `session_end` events.
    pub async fn garbage_collect(&self) -> Result<Vec<Session>, OrchestratorError> {
        let now = Utc::now();
        let mut terminated = Vec::new();
        let keys_found = self.store.scan_prefix(keys::SESSION_PREFIX).await?;
        for key in keys_found {
            // The per-user index lives under the same prefix; skip it.
            let Some(id_part) = key.strip_prefix(keys::SESSION_PREFIX) else {
                continue;
            };
            let Ok(session_id) = id_part.parse::<Uuid>() else {
                continue;
            };
            let Ok(mut session) = self.load(session_id).await else {
                continue;
            };
            if now < session.expires_at
                || matches!(session.status, SessionStatus::Terminated | SessionStatus::Expired)
            {
                continue;
            }
            session.status = SessionStatus::Expired;
            self.store
                .set_remove(&keys::session_index(&session.user_id), &id_part.to_string())
                .await?;
            let policy = self.retention.policy_for(session.privacy_mode);
            if let Err(e) = self
                .conversations
                .apply_retention(&session.conversation_id, policy)
                .await
            {
                warn!(%session_id, error = %e, "conversation archival failed during sweep");
            }
            self.store.delete(&key).await?;
            info!(%session_id, user = %session.user_id, "expired session collected");
            terminated.push(session);
        }
        Ok(terminated)
    }

    /// Test/inspection helper: current live-session count for a user.
    pub async fn active_sessions(&self, user_id: &str) -> Result<u32, OrchestratorError> {
        self.active_count(user_id).await
    }

    /// Overwrite a session record verbatim (tests manipulate expiry this way).
    #[doc(hidden)]
    pub async fn overwrite_for_test(&self, session: &Session) -> Result<(), OrchestratorError> {
        self.persist(session).await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
