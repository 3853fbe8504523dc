// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

use aria_agents::{AgentKind, AgentRegistry};
use aria_resilience::{with_timeout, Bulkhead, CircuitBreaker, ResilienceError};

use crate::{scan_unsafe, validate_parameters, ToolCall, ToolOutput, ToolRegistry};

/// Identity of the user a dispatch runs on behalf of.
#[derive(Debug, Clone, Copy)]
pub struct Caller<'a> {
    pub user_id: &'a str,
    pub session_id: &'a str,
    /// Whether the caller holds `ai:admin` (resolved by the gate).
    pub admin: bool,
}

#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("invalid tool parameters: {0}")]
    InvalidParameters(String),

    #[error("tool '{tool}' is not allowed for agent {agent}")]
    NotAllowedForAgent { tool: String, agent: AgentKind },

    #[error("tool '{0}' is dangerous and requires ai:admin")]
    AdminRequired(String),

    #[error("unsafe tool parameters: {0}")]
    Unsafe(String),

    #[error("tool '{0}' timed out; result unknown")]
    ResultUnknown(String),

    #[error(transparent)]
    Resilience(#[from] ResilienceError),
}

/// Terminal outcome of one invocation, as recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationOutcome {
    Ok,
    Denied,
    Error,
    Timeout,
}

/// Append-only audit entry for one invocation.  Never mutated after emit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRecord {
    pub tool_name: String,
    pub agent_kind: AgentKind,
    pub user_id: String,
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub outcome: InvocationOutcome,
    pub duration_ms: u64,
    /// Dangerous-tool invocations are flagged so the audit log records them
    /// at critical level.
    pub critical: bool,
}

/// Result of one dispatch: the tool output (or the policy error that stopped
/// it) plus exactly one audit record with a terminal outcome.
pub struct DispatchOutcome {
    pub result: Result<ToolOutput, DispatchError>,
    pub record: InvocationRecord,
}

/// The dispatch envelope around every tool call:
/// signature validation → agent allowlist → dangerous-tool policy →
/// injection scan → bulkhead + per-tool timeout → audit record.
///
/// Invocation is at-most-once: a call that times out is never re-sent; its
/// result is reported unknown.
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    agents: Arc<AgentRegistry>,
    bulkhead: Arc<Bulkhead>,
    breaker: Arc<CircuitBreaker>,
    default_timeout: Duration,
    max_parameter_bytes: usize,
}

impl ToolDispatcher {
    pub fn new(
        registry: Arc<ToolRegistry>,
        agents: Arc<AgentRegistry>,
        bulkhead: Arc<Bulkhead>,
        breaker: Arc<CircuitBreaker>,
        default_timeout: Duration,
        max_parameter_bytes: usize,
    ) -> Self {
        Self {
            registry,
            agents,
            bulkhead,
            breaker,
            default_timeout,
            max_parameter_bytes,
        }
    }

    pub async fn dispatch(
        &self,
        call: &ToolCall,
        agent: AgentKind,
        caller: Caller<'_>,
    ) -> DispatchOutcome {
        let started_at = Utc::now();
        let started = tokio::time::Instant::now();
        let mut critical = false;

        let finish = |outcome: InvocationOutcome,
                      critical: bool,
                      result: Result<ToolOutput, DispatchError>| {
            let completed_at = Utc::now();
            let record = InvocationRecord {
                tool_name: call.name.clone(),
                agent_kind: agent,
                user_id: caller.user_id.to_string(),
                session_id: caller.session_id.to_string(),
                started_at,
                completed_at,
                outcome,
                duration_ms: started.elapsed().as_millis() as u64,
                critical,
            };
            if critical {
                error!(
                    tool = %call.name,
                    agent = %agent,
                    user = %caller.user_id,
                    ?outcome,
                    "dangerous tool invocation"
                );
            }
            DispatchOutcome { result, record }
        };

        // 1. Signature lookup + parameter validation.
        let Some(tool) = self.registry.get(&call.name) else {
            return finish(
                InvocationOutcome::Denied,
                critical,
                Err(DispatchError::UnknownTool(call.name.clone())),
            );
        };
        critical = tool.dangerous();

        if let Err(msg) = validate_parameters(&tool.parameters_schema(), &call.parameters) {
            return finish(
                InvocationOutcome::Denied,
                critical,
                Err(DispatchError::InvalidParameters(msg)),
            );
        }

        // 2. Agent allowlist intersection.
        let profile = self.agents.get(agent);
        if !profile.tool_allowlist.contains(&call.name.as_str()) {
            return finish(
                InvocationOutcome::Denied,
                critical,
                Err(DispatchError::NotAllowedForAgent {
                    tool: call.name.clone(),
                    agent,
                }),
            );
        }

        // 3. Dangerous tools require explicit admin permission.
        if tool.dangerous() && !caller.admin {
            return finish(
                InvocationOutcome::Denied,
                critical,
                Err(DispatchError::AdminRequired(call.name.clone())),
            );
        }

        // 4. Injection scan and payload size cap.
        let serialized_len = call.parameters.to_string().len();
        if serialized_len > self.max_parameter_bytes {
            return finish(
                InvocationOutcome::Denied,
                critical,
                Err(DispatchError::Unsafe(format!(
                    "parameter payload of {serialized_len} bytes exceeds the cap"
                ))),
            );
        }
        if let Some(finding) = scan_unsafe(&call.parameters) {
            warn!(tool = %call.name, user = %caller.user_id, %finding, "unsafe parameters rejected");
            return finish(
                InvocationOutcome::Denied,
                critical,
                Err(DispatchError::Unsafe(finding)),
            );
        }

        // 5. Execution under bulkhead, breaker, and per-tool deadline.
        let permit = match self.bulkhead.acquire().await {
            Ok(p) => p,
            Err(e) => {
                return finish(InvocationOutcome::Error, critical, Err(e.into()));
            }
        };
        if let Err(e) = self.breaker.acquire() {
            return finish(InvocationOutcome::Error, critical, Err(e.into()));
        }
        let deadline = tool.timeout().unwrap_or(self.default_timeout);
        let executed = with_timeout(deadline, tool.execute(call)).await;
        drop(permit);

        // 6. Terminal outcome + audit.
        match executed {
            Ok(output) => {
                self.breaker.record_success();
                let outcome = if output.is_error {
                    InvocationOutcome::Error
                } else {
                    InvocationOutcome::Ok
                };
                finish(outcome, critical, Ok(output))
            }
            Err(_) => {
                // The call may still be running downstream; its effects are
                // unknown and it is never re-sent.
                self.breaker.record_failure();
                warn!(tool = %call.name, ?deadline, "tool timed out; result unknown");
                finish(
                    InvocationOutcome::Timeout,
                    critical,
                    Err(DispatchError::ResultUnknown(call.name.clone())),
                )
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::FnTool;

    fn weather_schema() -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {"city": {"type": "string", "maxLength": 64}},
            "required": ["city"]
        })
    }

    fn dispatcher_with(tools: Vec<FnTool>) -> ToolDispatcher {
        let mut registry = ToolRegistry::new();
        for t in tools {
            registry.register(t);
        }
        ToolDispatcher::new(
            Arc::new(registry),
            Arc::new(AgentRegistry::new()),
            Arc::new(Bulkhead::new("tool_execution", 50, Duration::from_millis(50))),
            Arc::new(CircuitBreaker::new("tool_execution", 5, Duration::from_secs(60))),
            Duration::from_secs(30),
            16_384,
        )
    }

    fn caller(admin: bool) -> Caller<'static> {
        Caller {
            user_id: "u1",
            session_id: "s1",
            admin,
        }
    }

    /// `catalog_search` sits on the Commerce agent's allowlist.
    fn catalog_tool() -> FnTool {
        FnTool::new("catalog_search", "search the catalog", weather_schema(), |_| async {
            ToolOutput::ok("results")
        })
    }

    #[tokio::test]
    async fn allowed_tool_executes_with_ok_outcome() {
        let d = dispatcher_with(vec![catalog_tool()]);
        let call = ToolCall {
            name: "catalog_search".into(),
            parameters: json!({"city": "x"}),
        };
        let out = d.dispatch(&call, AgentKind::Commerce, caller(false)).await;
        assert!(out.result.is_ok());
        assert_eq!(out.record.outcome, InvocationOutcome::Ok);
        assert_eq!(out.record.user_id, "u1");
    }

    #[tokio::test]
    async fn unknown_tool_is_denied() {
        let d = dispatcher_with(vec![]);
        let call = ToolCall {
            name: "ghost".into(),
            parameters: json!({}),
        };
        let out = d.dispatch(&call, AgentKind::Personal, caller(false)).await;
        assert!(matches!(out.result, Err(DispatchError::UnknownTool(_))));
        assert_eq!(out.record.outcome, InvocationOutcome::Denied);
    }

    #[tokio::test]
    async fn malformed_parameters_are_denied() {
        let d = dispatcher_with(vec![catalog_tool()]);
        let call = ToolCall {
            name: "catalog_search".into(),
            parameters: json!({"city": 42}),
        };
        let out = d.dispatch(&call, AgentKind::Commerce, caller(false)).await;
        assert!(matches!(out.result, Err(DispatchError::InvalidParameters(_))));
        assert_eq!(out.record.outcome, InvocationOutcome::Denied);
    }

    #[tokio::test]
    async fn tool_outside_agent_allowlist_is_denied() {
        let d = dispatcher_with(vec![catalog_tool()]);
        let call = ToolCall {
            name: "catalog_search".into(),
            parameters: json!({"city": "x"}),
        };
        // Personal's allowlist has no catalog_search.
        let out = d.dispatch(&call, AgentKind::Personal, caller(false)).await;
        assert!(matches!(
            out.result,
            Err(DispatchError::NotAllowedForAgent { .. })
        ));
        assert_eq!(out.record.outcome, InvocationOutcome::Denied);
    }

    #[tokio::test]
    async fn dangerous_tool_requires_admin_and_flags_critical() {
        // `user_suspend` sits on the Security agent's allowlist.
        let tool = FnTool::new("user_suspend", "suspend a user", weather_schema(), |_| async {
            ToolOutput::ok("suspended")
        })
        .dangerous();
        let d = dispatcher_with(vec![tool]);
        let call = ToolCall {
            name: "user_suspend".into(),
            parameters: json!({"city": "x"}),
        };

        let denied = d.dispatch(&call, AgentKind::Security, caller(false)).await;
        assert!(matches!(denied.result, Err(DispatchError::AdminRequired(_))));
        assert_eq!(denied.record.outcome, InvocationOutcome::Denied);
        assert!(denied.record.critical);

        let allowed = d.dispatch(&call, AgentKind::Security, caller(true)).await;
        assert!(allowed.result.is_ok());
        assert!(allowed.record.critical);
    }

    #[tokio::test]
    async fn injection_signatures_are_denied() {
        let d = dispatcher_with(vec![catalog_tool()]);
        let call = ToolCall {
            name: "catalog_search".into(),
            parameters: json!({"city": "../../etc/passwd"}),
        };
        let out = d.dispatch(&call, AgentKind::Commerce, caller(false)).await;
        assert!(matches!(out.result, Err(DispatchError::Unsafe(_))));
        assert_eq!(out.record.outcome, InvocationOutcome::Denied);
    }

    #[tokio::test]
    async fn timeout_reports_result_unknown() {
        let tool = FnTool::new("catalog_search", "slow tool", weather_schema(), |_| async {
            tokio::time::sleep(Duration::from_secs(600)).await;
            ToolOutput::ok("never")
        })
        .with_timeout(Duration::from_millis(20));
        let d = dispatcher_with(vec![tool]);
        let call = ToolCall {
            name: "catalog_search".into(),
            parameters: json!({"city": "x"}),
        };
        let out = d.dispatch(&call, AgentKind::Commerce, caller(false)).await;
        assert!(matches!(out.result, Err(DispatchError::ResultUnknown(_))));
        assert_eq!(out.record.outcome, InvocationOutcome::Timeout);
    }

    #[tokio::test]
    async fn tool_level_error_keeps_output_with_error_outcome() {
        let tool = FnTool::new("catalog_search", "fails", weather_schema(), |_| async {
            ToolOutput::err("backend rejected the query")
        });
        let d = dispatcher_with(vec![tool]);
        let call = ToolCall {
            name: "catalog_search".into(),
            parameters: json!({"city": "x"}),
        };
        let out = d.dispatch(&call, AgentKind::Commerce, caller(false)).await;
        let output = out.result.unwrap();
        assert!(output.is_error);
        assert_eq!(out.record.outcome, InvocationOutcome::Error);
    }

    #[tokio::test]
    async fn every_dispatch_produces_exactly_one_terminal_record() {
        let d = dispatcher_with(vec![catalog_tool()]);
        for (params, agent) in [
            (json!({"city": "x"}), AgentKind::Commerce),
            (json!({"city": 1}), AgentKind::Commerce),
            (json!({"city": "x"}), AgentKind::Personal),
        ] {
            let call = ToolCall {
                name: "catalog_search".into(),
                parameters: params,
            };
            let out = d.dispatch(&call, agent, caller(false)).await;
            assert!(matches!(
                out.record.outcome,
                InvocationOutcome::Ok
                    | InvocationOutcome::Denied
                    | InvocationOutcome::Error
                    | InvocationOutcome::Timeout
            ));
        }
    }
}
