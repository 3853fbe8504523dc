// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use aria_resilience::with_timeout;

use crate::context::UserContext;
use crate::error::OrchestratorError;
use crate::session::{Session, SessionManager};

const MAX_ATTEMPTS: u32 = 3;
const ATTEMPT_DEADLINE: Duration = Duration::from_secs(10);

/// What a successful recovery tells the orchestrator to do next.
#[derive(Debug)]
pub enum RecoveryAction {
    /// Session state was re-read and validated; retry the failed step once.
    SessionRestored(Session),
    /// Serve this text instead of a model completion.
    DegradedResponse(String),
    /// Stream/transport loss: tell the client to reconnect and replay from
    /// the event buffer.
    ReconnectAdvised,
}

/// Runs the ordered recovery strategies when a recoverable error surfaces:
/// session restore → model degraded response → communication recovery.
/// Every attempt carries its own deadline; when the attempt budget is spent
/// the error hardens into `RecoveryExhausted` and the session is terminated
/// by the caller.
pub struct RecoveryCoordinator {
    sessions: Arc<SessionManager>,
    degraded_message: String,
}

impl RecoveryCoordinator {
    pub fn new(sessions: Arc<SessionManager>, degraded_message: String) -> Self {
        Self {
            sessions,
            degraded_message,
        }
    }

    pub async fn recover(
        &self,
        session_id: Uuid,
        user: &UserContext,
        error: &OrchestratorError,
    ) -> Result<RecoveryAction, OrchestratorError> {
        let mut attempts = 0u32;

        // 1. Session recovery: re-read and validate persisted state.  Only
        //    meaningful when the failure could have left in-memory state
        //    stale; harmless otherwise.
        attempts += 1;
        match with_timeout(ATTEMPT_DEADLINE, self.sessions.resume(session_id, user)).await {
            Ok(Ok(session)) => {
                if matches!(
                    error,
                    OrchestratorError::Internal(_) | OrchestratorError::Timeout
                ) {
                    info!(%session_id, "session recovery succeeded");
                    return Ok(RecoveryAction::SessionRestored(session));
                }
                // Session is healthy; the failure lies elsewhere — fall
                // through to the model strategy.
            }
            Ok(Err(e)) => {
                warn!(%session_id, error = %e, "session recovery failed");
            }
            Err(_) => {
                warn!(%session_id, "session recovery timed out");
            }
        }

        // 2. Model fallback: the engine has already walked its chain and
        //    cache by the time an error reaches us, so the remaining move is
        //    the canned degraded response.
        if attempts < MAX_ATTEMPTS
            && matches!(
                error,
                OrchestratorError::ModelUnavailable
                    | OrchestratorError::ModelTimeout
                    | OrchestratorError::CircuitOpen(_)
            )
            && !self.degraded_message.is_empty()
        {
            info!(%session_id, "serving degraded response after model failure");
            return Ok(RecoveryAction::DegradedResponse(self.degraded_message.clone()));
        }
        attempts += 1;

        // 3. Communication recovery: buffered events cover the gap once the
        //    client reconnects.
        if attempts <= MAX_ATTEMPTS
            && matches!(error, OrchestratorError::Timeout | OrchestratorError::Internal(_))
        {
            info!(%session_id, "advising client reconnect");
            return Ok(RecoveryAction::ReconnectAdvised);
        }

        warn!(%session_id, original = %error, "recovery exhausted");
        Err(OrchestratorError::RecoveryExhausted)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
