// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use aria_agents::{AgentKind, AgentRegistry, Router};
use aria_config::{Config, PrivacyMode};
use aria_model::{EngineMetrics, GenerateOptions, ModelEngine, StreamEvent};
use aria_resilience::{
    breakers, bulkheads, with_timeout, BreakerRegistry, Bulkhead, BulkheadRegistry, CircuitBreaker,
    RetryPolicy,
};
use aria_store::Store;
use aria_tools::{Caller, ToolCall, ToolDispatcher, ToolRegistry};

use crate::audit::{AuditKind, AuditLog, AuditRecord};
use crate::bus::{EventBus, Subscription};
use crate::context::UserContext;
use crate::conversation::{ConversationLog, Message, ToolCallRecord, ToolResultRecord};
use crate::error::OrchestratorError;
use crate::events::EventKind;
use crate::gate::{GateRequest, Operation, PermissionGate};
use crate::recovery::{RecoveryAction, RecoveryCoordinator};
use crate::session::{Session, SessionManager, SessionMode};
use crate::voice::SpeechService;

/// Messages the orchestrator keeps in the prompt window.
const CONVERSATION_WINDOW: usize = 50;

/// Tool-call rounds per message before the loop is cut off.
const MAX_TOOL_ROUNDS: u32 = 8;

const SPEECH_DEADLINE: Duration = Duration::from_secs(15);

/// Deadline on the whole generation composition (model rounds + tool calls).
/// Exceeding it cancels the run and goes through recovery.
const RUN_DEADLINE: Duration = Duration::from_secs(300);

enum RunEnd {
    Completed(String),
    Cancelled(String),
}

/// The orchestration façade.
///
/// Every public entry runs the same spine: gate → session resolve → router →
/// model generate → tool dispatch loop → event emission → conversation
/// append.  Components are constructed once at startup and shared by handle;
/// everything cross-component goes by session id, never by pointer.
pub struct Orchestrator {
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    sessions: Arc<SessionManager>,
    gate: Arc<PermissionGate>,
    engine: Arc<ModelEngine>,
    agents: Arc<AgentRegistry>,
    router: Router,
    dispatcher: Arc<ToolDispatcher>,
    conversations: Arc<ConversationLog>,
    audit: Arc<AuditLog>,
    recovery: Arc<RecoveryCoordinator>,
    speech: Arc<dyn SpeechService>,
    voice_bulkhead: Arc<Bulkhead>,
    stt_breaker: Arc<CircuitBreaker>,
    tts_breaker: Arc<CircuitBreaker>,
    breakers: BreakerRegistry,
    /// In-flight generation per session: cancel sender + join handle, so an
    /// explicit end can stop the run at the next token boundary and wait for
    /// it before emitting `session_end`.
    active_runs: Mutex<HashMap<Uuid, (oneshot::Sender<()>, JoinHandle<()>)>>,
}

impl Orchestrator {
    /// Production wiring: builds the engine from configuration.
    pub fn new(
        cfg: &Config,
        store: Arc<dyn Store>,
        tools: ToolRegistry,
        speech: Arc<dyn SpeechService>,
    ) -> Arc<Self> {
        let breakers_reg = BreakerRegistry::new(&cfg.breaker);
        let bulkheads_reg = BulkheadRegistry::new(&cfg.bulkhead);
        let engine = ModelEngine::from_config(
            &cfg.model,
            &cfg.cache,
            breakers_reg.get(breakers::MODEL_INFERENCE),
            bulkheads_reg.get(bulkheads::MODEL_INFERENCE),
            RetryPolicy::from(&cfg.retry),
        );
        Self::assemble(cfg, store, tools, speech, engine, breakers_reg, bulkheads_reg)
    }

    /// Wiring with an injected engine (tests swap in scripted backends; the
    /// injected engine carries its own breaker/bulkhead instances).
    pub fn with_engine(
        cfg: &Config,
        store: Arc<dyn Store>,
        tools: ToolRegistry,
        speech: Arc<dyn SpeechService>,
        engine: ModelEngine,
    ) -> Arc<Self> {
        let breakers_reg = BreakerRegistry::new(&cfg.breaker);
        let bulkheads_reg = BulkheadRegistry::new(&cfg.bulkhead);
        Self::assemble(cfg, store, tools, speech, engine, breakers_reg, bulkheads_reg)
    }

    fn assemble(
        cfg: &Config,
        store: Arc<dyn Store>,
        tools: ToolRegistry,
        speech: Arc<dyn SpeechService>,
        engine: ModelEngine,
        breakers_reg: BreakerRegistry,
        bulkheads_reg: BulkheadRegistry,
    ) -> Arc<Self> {
        let agents = Arc::new(AgentRegistry::new());
        let audit = Arc::new(AuditLog::new(Arc::clone(&store)));
        let conversations = Arc::new(
            ConversationLog::new(Arc::clone(&store), CONVERSATION_WINDOW).with_breakers(
                breakers_reg.get(breakers::MEMORY_READ),
                breakers_reg.get(breakers::MEMORY_WRITE),
            ),
        );
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&store),
            cfg.session.clone(),
            cfg.retention.clone(),
            Arc::clone(&conversations),
            bulkheads_reg.get(bulkheads::SESSION_MANAGEMENT),
            breakers_reg.get(breakers::SESSION_CREATION),
        ));
        let gate = Arc::new(PermissionGate::new(
            Arc::clone(&store),
            &cfg.auth,
            cfg.quota.clone(),
            cfg.ratelimit.clone(),
            Arc::clone(&agents),
            Arc::clone(&audit),
        ));
        let dispatcher = Arc::new(ToolDispatcher::new(
            Arc::new(tools),
            Arc::clone(&agents),
            bulkheads_reg.get(bulkheads::TOOL_EXECUTION),
            breakers_reg.get(breakers::TOOL_EXECUTION),
            Duration::from_secs(cfg.tool.default_timeout_s),
            cfg.tool.max_parameter_bytes,
        ));
        let recovery = Arc::new(RecoveryCoordinator::new(
            Arc::clone(&sessions),
            cfg.model.degraded_message.clone(),
        ));
        Arc::new(Self {
            store,
            bus: Arc::new(EventBus::new(
                cfg.event.buffer_per_session,
                cfg.event.subscriber_capacity,
            )),
            sessions,
            gate,
            engine: Arc::new(engine),
            agents,
            router: Router::new(),
            dispatcher,
            conversations,
            audit,
            recovery,
            speech,
            voice_bulkhead: bulkheads_reg.get(bulkheads::VOICE_PROCESSING),
            stt_breaker: breakers_reg.get(breakers::VOICE_STT),
            tts_breaker: breakers_reg.get(breakers::VOICE_TTS),
            breakers: breakers_reg,
            active_runs: Mutex::new(HashMap::new()),
        })
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn gate(&self) -> &Arc<PermissionGate> {
        &self.gate
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn engine_metrics(&self) -> EngineMetrics {
        self.engine.metrics()
    }

    /// Prime the model pools.  Called once on boot.
    pub async fn warmup(&self) {
        self.engine.warmup().await;
    }

    // ── Public operations ─────────────────────────────────────────────────────

    pub async fn create_session(
        &self,
        user: &UserContext,
        agent_kind: Option<AgentKind>,
        mode: SessionMode,
        privacy: PrivacyMode,
        family_id: Option<String>,
    ) -> Result<Session, OrchestratorError> {
        let kind = agent_kind.unwrap_or(AgentKind::Personal);
        self.gate
            .check_and_admit(&GateRequest {
                user,
                operation: Operation::CreateSession,
                agent_kind: kind,
                session_id: None,
                tool_name: None,
                privacy,
                family_id: family_id.as_deref(),
            })
            .await?;

        let session = self
            .sessions
            .create(user, kind, mode, privacy, family_id)
            .await?;
        let profile = self.agents.get(kind);
        self.bus.emit(
            session.session_id,
            kind,
            EventKind::SessionStart,
            json!({
                "agent_kind": kind,
                "mode": mode,
                "capabilities": profile.capabilities,
            }),
        );
        Ok(session)
    }

    pub async fn end_session(
        &self,
        user: &UserContext,
        session_id: Uuid,
    ) -> Result<(), OrchestratorError> {
        self.gate
            .check_and_admit(&GateRequest {
                user,
                operation: Operation::EndSession,
                agent_kind: AgentKind::Personal,
                session_id: Some(session_id),
                tool_name: None,
                privacy: PrivacyMode::Private,
                family_id: None,
            })
            .await?;

        // Cancel the in-flight generation at its next token boundary and wait
        // for the run to finish so `session_end` is the stream's last event.
        let run = self.active_runs.lock().await.remove(&session_id);
        if let Some((cancel_tx, handle)) = run {
            let _ = cancel_tx.send(());
            let _ = with_timeout(Duration::from_secs(5), handle).await;
        }

        let session = self.sessions.end(session_id, user, "client request").await?;
        self.bus.emit(
            session_id,
            session.agent_kind,
            EventKind::SessionEnd,
            json!({ "reason": "client request" }),
        );
        self.bus.close(session_id);
        Ok(())
    }

    /// Attach a subscriber to a session's event stream, replaying buffered
    /// events past `last_event_id` (or the whole retained window).
    pub async fn subscribe(
        &self,
        user: &UserContext,
        session_id: Uuid,
        last_event_id: Option<u64>,
    ) -> Result<Subscription, OrchestratorError> {
        let session = self.sessions.peek(session_id, user).await?;
        self.gate
            .check_and_admit(&GateRequest {
                user,
                operation: Operation::Subscribe,
                agent_kind: session.agent_kind,
                session_id: Some(session_id),
                tool_name: None,
                privacy: session.privacy_mode,
                family_id: session.family_id.as_deref(),
            })
            .await?;
        Ok(self.bus.subscribe(session_id, last_event_id))
    }

    /// Process one inbound text message.  Returns a subscription whose stream
    /// carries the generation's events; it always terminates with exactly one
    /// `response` or `error` event.
    pub async fn process_message(
        self: &Arc<Self>,
        user: &UserContext,
        session_id: Uuid,
        content: &str,
    ) -> Result<Subscription, OrchestratorError> {
        if content.trim().is_empty() {
            return Err(OrchestratorError::Validation("empty message".into()));
        }
        self.reject_if_busy(session_id).await?;

        let session = self.sessions.resolve_for_message(session_id, user).await?;
        if let Err(e) = self
            .gate
            .check_and_admit(&GateRequest {
                user,
                operation: Operation::Chat,
                agent_kind: session.agent_kind,
                session_id: Some(session_id),
                tool_name: None,
                privacy: session.privacy_mode,
                family_id: session.family_id.as_deref(),
            })
            .await
        {
            // Subscribers see the denial on the stream as well.
            self.emit_error(&session, &e).await;
            return Err(e);
        }

        self.sessions.touch(session_id).await;
        self.conversations
            .append(&session.conversation_id, &Message::user(content))
            .await?;

        let subscription = self.bus.subscribe(session_id, None);
        self.spawn_generation(session, user.clone(), false).await;
        Ok(subscription)
    }

    /// Process one inbound voice frame: STT → routing → the text pipeline →
    /// TTS on the produced response.
    pub async fn process_voice(
        self: &Arc<Self>,
        user: &UserContext,
        session_id: Uuid,
        audio: &[u8],
    ) -> Result<Subscription, OrchestratorError> {
        self.reject_if_busy(session_id).await?;
        let session = self.sessions.resolve_for_message(session_id, user).await?;
        if let Err(e) = self
            .gate
            .check_and_admit(&GateRequest {
                user,
                operation: Operation::Voice,
                agent_kind: AgentKind::Voice,
                session_id: Some(session_id),
                tool_name: None,
                privacy: session.privacy_mode,
                family_id: session.family_id.as_deref(),
            })
            .await
        {
            self.emit_error(&session, &e).await;
            return Err(e);
        }

        // STT under the voice bulkhead and its own breaker.
        let transcript = {
            let _permit = self.voice_bulkhead.acquire().await?;
            self.stt_breaker.acquire()?;
            match with_timeout(SPEECH_DEADLINE, self.speech.transcribe(audio)).await {
                Ok(Ok(text)) => {
                    self.stt_breaker.record_success();
                    text
                }
                Ok(Err(e)) => {
                    self.stt_breaker.record_failure();
                    let err = OrchestratorError::Internal(format!("stt failed: {e}"));
                    self.emit_error(&session, &err).await;
                    return Err(err);
                }
                Err(_) => {
                    self.stt_breaker.record_failure();
                    let err = OrchestratorError::Timeout;
                    self.emit_error(&session, &err).await;
                    return Err(err);
                }
            }
        };
        self.bus.emit(
            session_id,
            AgentKind::Voice,
            EventKind::Stt,
            json!({ "transcript": transcript }),
        );

        // Route the transcript and re-check the destination's permission.
        let dest = self.router.voice_destination(&self.agents, &transcript);
        let required = self.agents.required_permission(dest);
        if !self.gate.has_permission(user, required) {
            let err = OrchestratorError::PermissionDenied(required.to_string());
            self.audit
                .record(
                    AuditRecord::new(
                        AuditKind::PermissionDenied,
                        user.user_id.clone(),
                        err.severity(),
                    )
                    .with_session(session_id)
                    .with_agent(dest),
                )
                .await;
            self.emit_error(&session, &err).await;
            return Err(err);
        }

        let session = if session.agent_kind != dest {
            let switched = self.sessions.switch_agent(session_id, user, dest).await?;
            self.bus.emit(
                session_id,
                dest,
                EventKind::AgentSwitch,
                json!({ "from": session.agent_kind, "to": dest }),
            );
            switched
        } else {
            session
        };

        self.sessions.touch(session_id).await;
        self.conversations
            .append(&session.conversation_id, &Message::user(&transcript))
            .await?;

        let subscription = self.bus.subscribe(session_id, None);
        self.spawn_generation(session, user.clone(), true).await;
        Ok(subscription)
    }

    /// Switch an existing session to another agent, re-checking permission.
    pub async fn switch_agent(
        &self,
        user: &UserContext,
        session_id: Uuid,
        to: AgentKind,
    ) -> Result<Session, OrchestratorError> {
        let session = self.sessions.peek(session_id, user).await?;
        self.gate
            .check_and_admit(&GateRequest {
                user,
                operation: Operation::AgentSwitch,
                agent_kind: to,
                session_id: Some(session_id),
                tool_name: None,
                privacy: session.privacy_mode,
                family_id: session.family_id.as_deref(),
            })
            .await?;
        let switched = self.sessions.switch_agent(session_id, user, to).await?;
        self.bus.emit(
            session_id,
            to,
            EventKind::AgentSwitch,
            json!({ "from": session.agent_kind, "to": to }),
        );
        Ok(switched)
    }

    /// Mirror breaker states into the store for cross-instance visibility.
    /// Best-effort; the in-process atomics stay authoritative so an open
    /// breaker never needs store I/O to reject a call.
    pub async fn mirror_breaker_state(&self) {
        for (name, state, failures) in self.breakers.snapshot() {
            let value = json!({
                "state": state.as_str(),
                "consecutive_failures": failures,
            });
            if let Err(e) = self
                .store
                .set(&aria_store::keys::breaker(&name), &value.to_string(), None)
                .await
            {
                warn!(breaker = %name, error = %e, "mirroring breaker state failed");
            }
        }
    }

    /// Sweep expired sessions, emitting their terminal events.
    pub async fn garbage_collect(&self) -> Result<usize, OrchestratorError> {
        let collected = self.sessions.garbage_collect().await?;
        for session in &collected {
            self.bus.emit(
                session.session_id,
                session.agent_kind,
                EventKind::SessionEnd,
                json!({ "reason": "expired" }),
            );
            self.bus.close(session.session_id);
        }
        Ok(collected.len())
    }

    // ── Generation pipeline ───────────────────────────────────────────────────

    /// A session processes one message at a time (the agent is not
    /// re-entrant).  Finished runs clean up after themselves; a stale entry
    /// is pruned here.
    async fn reject_if_busy(&self, session_id: Uuid) -> Result<(), OrchestratorError> {
        let mut runs = self.active_runs.lock().await;
        let busy = runs
            .get(&session_id)
            .is_some_and(|(_, handle)| !handle.is_finished());
        if busy {
            return Err(OrchestratorError::Validation(
                "session is already processing a message".into(),
            ));
        }
        runs.remove(&session_id);
        Ok(())
    }

    async fn spawn_generation(self: &Arc<Self>, session: Session, user: UserContext, voice: bool) {
        let session_id = session.session_id;
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            this.run_generation(session, user, voice, cancel_rx).await;
        });
        self.active_runs
            .lock()
            .await
            .insert(session_id, (cancel_tx, handle));
    }

    async fn run_generation(
        self: Arc<Self>,
        session: Session,
        user: UserContext,
        voice: bool,
        mut cancel: oneshot::Receiver<()>,
    ) {
        let session_id = session.session_id;
        let agent_kind = session.agent_kind;
        self.bus
            .emit(session_id, agent_kind, EventKind::Thinking, json!({}));

        let mut restored_once = false;
        let mut end = self.timed_generation(&session, &user, &mut cancel).await;

        loop {
            // Retire the run bookkeeping before the terminal event goes out,
            // so a client reacting to `response` can immediately send the
            // next message.  The retry branch re-enters the loop instead.
            if !matches!(&end, Err(e) if e.is_recoverable()) {
                self.active_runs.lock().await.remove(&session_id);
            }
            match end {
                Ok(RunEnd::Completed(text)) => {
                    self.finish_response(&session, &text, false, voice).await;
                    break;
                }
                Ok(RunEnd::Cancelled(partial)) => {
                    info!(%session_id, "generation cancelled at token boundary");
                    self.bus.emit(
                        session_id,
                        agent_kind,
                        EventKind::Response,
                        json!({ "text": partial, "cancelled": true }),
                    );
                    if !partial.is_empty() {
                        let _ = self
                            .conversations
                            .append(&session.conversation_id, &Message::assistant(&partial))
                            .await;
                    }
                    break;
                }
                Err(e) if e.is_recoverable() => {
                    warn!(%session_id, error = %e, "recoverable failure; invoking recovery");
                    match self.recovery.recover(session_id, &user, &e).await {
                        Ok(RecoveryAction::SessionRestored(_)) if !restored_once => {
                            restored_once = true;
                            end = self.timed_generation(&session, &user, &mut cancel).await;
                            continue;
                        }
                        Ok(RecoveryAction::SessionRestored(_)) => {
                            self.emit_error(&session, &e).await;
                            break;
                        }
                        Ok(RecoveryAction::DegradedResponse(text)) => {
                            self.finish_response(&session, &text, true, voice).await;
                            break;
                        }
                        Ok(RecoveryAction::ReconnectAdvised) => {
                            self.bus.emit(
                                session_id,
                                agent_kind,
                                EventKind::Warning,
                                json!({ "action": "reconnect" }),
                            );
                            self.emit_error(&session, &e).await;
                            break;
                        }
                        Err(exhausted) => {
                            error!(%session_id, "recovery exhausted; terminating session");
                            self.emit_error(&session, &exhausted).await;
                            let _ = self
                                .sessions
                                .end(session_id, &user, "recovery exhausted")
                                .await;
                            self.bus.emit(
                                session_id,
                                agent_kind,
                                EventKind::SessionEnd,
                                json!({ "reason": "recovery exhausted" }),
                            );
                            self.bus.close(session_id);
                            break;
                        }
                    }
                }
                Err(e) => {
                    self.emit_error(&session, &e).await;
                    break;
                }
            }
        }

        self.active_runs.lock().await.remove(&session_id);
    }

    /// Terminal success path: emit `response`, append the assistant message,
    /// and synthesize speech for voice sessions.
    async fn finish_response(&self, session: &Session, text: &str, degraded: bool, voice: bool) {
        let mut payload = json!({ "text": text });
        if degraded {
            payload["degraded"] = json!(true);
        }
        self.bus
            .emit(session.session_id, session.agent_kind, EventKind::Response, payload);
        let _ = self
            .conversations
            .append(&session.conversation_id, &Message::assistant(text))
            .await;

        if voice && !text.is_empty() {
            if self.tts_breaker.acquire().is_ok() {
                match with_timeout(SPEECH_DEADLINE, self.speech.synthesize(text)).await {
                    Ok(Ok(audio)) => {
                        self.tts_breaker.record_success();
                        use base64::Engine;
                        let encoded = base64::engine::general_purpose::STANDARD.encode(audio);
                        self.bus.emit(
                            session.session_id,
                            session.agent_kind,
                            EventKind::Tts,
                            json!({ "audio": encoded }),
                        );
                    }
                    Ok(Err(e)) => {
                        self.tts_breaker.record_failure();
                        warn!(session_id = %session.session_id, error = %e, "tts failed");
                    }
                    Err(_) => {
                        self.tts_breaker.record_failure();
                        warn!(session_id = %session.session_id, "tts timed out");
                    }
                }
            } else {
                warn!(session_id = %session.session_id, "tts skipped; breaker open");
            }
        }
    }

    /// The generation loop under the whole-composition deadline.
    async fn timed_generation(
        &self,
        session: &Session,
        user: &UserContext,
        cancel: &mut oneshot::Receiver<()>,
    ) -> Result<RunEnd, OrchestratorError> {
        match with_timeout(RUN_DEADLINE, self.generation_loop(session, user, cancel)).await {
            Ok(end) => end,
            Err(_) => Err(OrchestratorError::Timeout),
        }
    }

    /// Drive the model ↔ tool loop for one inbound message.
    ///
    /// Token events preceding a tool call are flushed before the call is
    /// dispatched, and the `tool_result` event precedes the tokens that
    /// depend on it (they arrive in the next round's stream).
    async fn generation_loop(
        &self,
        session: &Session,
        user: &UserContext,
        cancel: &mut oneshot::Receiver<()>,
    ) -> Result<RunEnd, OrchestratorError> {
        let session_id = session.session_id;
        let agent_kind = session.agent_kind;
        let mut rounds = 0u32;

        loop {
            let prompt = self.build_prompt(session).await?;
            let options = GenerateOptions::default();

            let started = tokio::select! {
                biased;
                _ = &mut *cancel => return Ok(RunEnd::Cancelled(String::new())),
                r = self.engine.generate(None, &prompt, &options) => r,
            };
            let mut stream = started.map_err(OrchestratorError::from)?;
            // The model is producing; clients render this as an activity
            // indicator until the first token lands.
            self.bus
                .emit(session_id, agent_kind, EventKind::Typing, json!({}));

            let mut text = String::new();
            let mut pending: Vec<(String, serde_json::Value)> = Vec::new();
            loop {
                let item = tokio::select! {
                    biased;
                    _ = &mut *cancel => return Ok(RunEnd::Cancelled(text)),
                    item = futures::StreamExt::next(&mut stream) => item,
                };
                match item {
                    Some(Ok(StreamEvent::TokenDelta(t))) => {
                        self.bus
                            .emit(session_id, agent_kind, EventKind::Token, json!({ "text": t }));
                        text.push_str(&t);
                    }
                    Some(Ok(StreamEvent::ToolCallRequest { name, parameters })) => {
                        pending.push((name, parameters));
                    }
                    Some(Ok(StreamEvent::Done)) | None => break,
                    Some(Err(e)) => return Err(e.into()),
                }
            }

            if pending.is_empty() {
                return Ok(RunEnd::Completed(text));
            }

            rounds += 1;
            if rounds > MAX_TOOL_ROUNDS {
                warn!(%session_id, rounds, "tool-call budget exhausted");
                return Ok(RunEnd::Completed(text));
            }

            // Generation is blocked until the requested tools report back.
            self.bus.emit(
                session_id,
                agent_kind,
                EventKind::Waiting,
                json!({ "on": "tool_results", "pending": pending.len() }),
            );
            for (name, parameters) in pending {
                self.execute_tool(session, user, name, parameters).await?;
            }
            // Re-enter generation with the tool results appended to the
            // conversation; the next round's prompt carries them.
        }
    }

    /// One tool invocation: events, dispatch envelope, audit, conversation.
    /// Policy denials are reported back to the agent as error results rather
    /// than failing the stream.
    async fn execute_tool(
        &self,
        session: &Session,
        user: &UserContext,
        name: String,
        parameters: serde_json::Value,
    ) -> Result<(), OrchestratorError> {
        let session_id = session.session_id;
        let agent_kind = session.agent_kind;

        self.bus.emit(
            session_id,
            agent_kind,
            EventKind::ToolCall,
            json!({ "tool": name, "parameters": parameters }),
        );
        let _ = self
            .conversations
            .append(
                &session.conversation_id,
                &Message::assistant_tool_call(ToolCallRecord {
                    name: name.clone(),
                    parameters: parameters.clone(),
                }),
            )
            .await;

        let session_id_str = session_id.to_string();
        let caller = Caller {
            user_id: &user.user_id,
            session_id: &session_id_str,
            admin: self.gate.is_admin(user),
        };
        let call = ToolCall {
            name: name.clone(),
            parameters,
        };
        let outcome = self.dispatcher.dispatch(&call, agent_kind, caller).await;
        self.audit
            .record_tool(&user.user_id, session_id, &outcome.record)
            .await;

        let (output, is_error) = match outcome.result {
            Ok(out) => (out.content, out.is_error),
            Err(e) => {
                let mapped: OrchestratorError = e.into();
                // The agent sees the sanitized denial and can adjust course.
                (mapped.user_message(), true)
            }
        };

        self.bus.emit(
            session_id,
            agent_kind,
            EventKind::ToolResult,
            json!({ "tool": name, "output": output, "is_error": is_error }),
        );
        let _ = self
            .conversations
            .append(
                &session.conversation_id,
                &Message::tool_result(ToolResultRecord {
                    name,
                    output,
                    is_error,
                }),
            )
            .await;
        Ok(())
    }

    async fn build_prompt(&self, session: &Session) -> Result<String, OrchestratorError> {
        let profile = self.agents.get(session.agent_kind);
        let recent = self.conversations.recent(&session.conversation_id).await?;

        let mut prompt = String::with_capacity(1024);
        prompt.push_str(profile.default_prompt);
        prompt.push_str("\n\n");
        for msg in &recent {
            match msg.role {
                crate::conversation::Role::User => {
                    prompt.push_str("user: ");
                    prompt.push_str(&msg.content);
                }
                crate::conversation::Role::Assistant => {
                    if let Some(calls) = &msg.tool_calls {
                        for call in calls {
                            prompt.push_str(&format!(
                                "assistant: [invoking {} with {}]",
                                call.name, call.parameters
                            ));
                        }
                    } else {
                        prompt.push_str("assistant: ");
                        prompt.push_str(&msg.content);
                    }
                }
                crate::conversation::Role::Tool => {
                    if let Some(results) = &msg.tool_results {
                        for result in results {
                            prompt.push_str(&format!("tool {}: {}", result.name, result.output));
                        }
                    }
                }
            }
            prompt.push('\n');
        }
        prompt.push_str("assistant:");
        Ok(prompt)
    }

    /// Emit the terminal `error` event (sanitized) and its audit record.
    async fn emit_error(&self, session: &Session, e: &OrchestratorError) {
        self.bus.emit(
            session.session_id,
            session.agent_kind,
            EventKind::Error,
            json!({
                "kind": e.kind(),
                "severity": e.severity(),
                "user_message": e.user_message(),
                "recovery_hint": e.recovery_hint(),
            }),
        );
        self.audit
            .record(
                AuditRecord::new(AuditKind::Error, session.user_id.clone(), e.severity())
                    .with_session(session.session_id)
                    .with_agent(session.agent_kind)
                    .with_detail(json!({ "kind": e.kind() })),
            )
            .await;
    }

    /// Router access for request classification (node layer).
    pub fn route_explicit(&self, explicit: Option<AgentKind>, first_message: &str) -> AgentKind {
        self.router.route(&self.agents, explicit, first_message)
    }

    /// Store handle (node layer health checks).
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }
}
