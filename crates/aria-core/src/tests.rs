// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Cross-component scenarios driven through the orchestrator façade with an
//! in-memory store and scripted inference backends — no network anywhere.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use aria_agents::AgentKind;
use aria_config::{Config, PrivacyMode};
use aria_model::{
    BackendPool, InferenceBackend, ModelEngine, ResponseCache, ScriptedBackend, ScriptedCall,
};
use aria_resilience::{Bulkhead, CircuitBreaker, RetryPolicy};
use aria_store::{MemoryStore, Store};
use aria_tools::{FnTool, ToolOutput, ToolRegistry};

use crate::{
    Event, EventKind, NullSpeech, Orchestrator, OrchestratorError, Session, SessionMode,
    Subscription, UserContext,
};

// ── Harness ──────────────────────────────────────────────────────────────────

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        multiplier: 1.0,
        jitter: 0.0,
    }
}

fn engine_of(backends: Vec<Arc<ScriptedBackend>>) -> ModelEngine {
    let pools: Vec<BackendPool> = backends
        .iter()
        .map(|b| {
            let b = Arc::clone(b);
            BackendPool::new(b.name().to_string(), 1, move || {
                Arc::clone(&b) as Arc<dyn InferenceBackend>
            })
        })
        .collect();
    let engine = ModelEngine::new(
        pools,
        HashMap::new(),
        "default".into(),
        ResponseCache::new(64, Duration::from_secs(3600)),
        Arc::new(CircuitBreaker::new("model_inference", 5, Duration::from_secs(60))),
        Arc::new(Bulkhead::new("model_inference", 20, Duration::from_millis(100))),
        fast_retry(),
        true,
        String::new(),
        "ping".into(),
    );
    engine.mark_all_ready();
    engine
}

fn orchestrator(
    cfg: Config,
    backends: Vec<Arc<ScriptedBackend>>,
    tools: ToolRegistry,
) -> Arc<Orchestrator> {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    Orchestrator::with_engine(&cfg, store, tools, Arc::new(NullSpeech), engine_of(backends))
}

fn chat_user() -> UserContext {
    UserContext::new("u1").with_permission("ai:basic_chat")
}

/// Drain a subscription until the stream's terminal event (`response` or
/// `error`), starting from the replayed backlog.
async fn collect_until_terminal(mut sub: Subscription) -> Vec<Event> {
    let mut events = sub.backlog.clone();
    if events
        .iter()
        .any(|e| matches!(e.kind, EventKind::Response | EventKind::Error))
    {
        return events;
    }
    loop {
        let ev = tokio::time::timeout(Duration::from_secs(2), sub.rx.recv())
            .await
            .expect("timed out waiting for a terminal event")
            .expect("stream closed before a terminal event");
        let kind = ev.kind;
        events.push(ev);
        if matches!(kind, EventKind::Response | EventKind::Error) {
            return events;
        }
    }
}

async fn create_chat_session(orch: &Arc<Orchestrator>, user: &UserContext) -> Session {
    orch.create_session(user, Some(AgentKind::Personal), SessionMode::Chat, PrivacyMode::Private, None)
        .await
        .expect("session creation failed")
}

// ── Scenario: happy path, text chat ──────────────────────────────────────────

#[tokio::test]
async fn happy_path_streams_tokens_and_one_response() {
    let backend = Arc::new(ScriptedBackend::always_text("primary", "Hello! How can I help?"));
    let orch = orchestrator(Config::default(), vec![backend], ToolRegistry::new());
    let user = chat_user();

    let session = create_chat_session(&orch, &user).await;
    let (hourly_before, _) = orch.gate().quota_counters("u1").await.unwrap();

    let sub = orch
        .process_message(&user, session.session_id, "Hello")
        .await
        .unwrap();
    let events = collect_until_terminal(sub).await;

    assert!(events.iter().any(|e| e.kind == EventKind::Token));
    let responses: Vec<&Event> = events.iter().filter(|e| e.kind == EventKind::Response).collect();
    assert_eq!(responses.len(), 1, "exactly one terminal response event");
    assert_eq!(responses[0].payload["text"], "Hello! How can I help?");
    assert!(!events.iter().any(|e| e.kind == EventKind::Error));

    // The activity indicator precedes the first token.
    let typing_pos = events.iter().position(|e| e.kind == EventKind::Typing).unwrap();
    let token_pos = events.iter().position(|e| e.kind == EventKind::Token).unwrap();
    assert!(typing_pos < token_pos);

    // The message admitted through the gate spent exactly one quota unit.
    let (hourly_after, daily_after) = orch.gate().quota_counters("u1").await.unwrap();
    assert_eq!(hourly_after, hourly_before + 1);
    assert_eq!(daily_after, hourly_after);
}

#[tokio::test]
async fn events_carry_monotone_ids_in_emission_order() {
    let backend = Arc::new(ScriptedBackend::always_text("primary", "ok"));
    let orch = orchestrator(Config::default(), vec![backend], ToolRegistry::new());
    let user = chat_user();
    let session = create_chat_session(&orch, &user).await;

    let sub = orch
        .process_message(&user, session.session_id, "hi")
        .await
        .unwrap();
    let events = collect_until_terminal(sub).await;
    let ids: Vec<u64> = events.iter().map(|e| e.event_id).collect();
    let mut sorted = ids.clone();
    sorted.sort_unstable();
    assert_eq!(ids, sorted, "per-session delivery order matches emission order");
}

// ── Scenario: quota exhaustion ───────────────────────────────────────────────

#[tokio::test]
async fn quota_ceiling_denies_with_a_single_error_event() {
    let mut cfg = Config::default();
    cfg.quota.requests_per_hour = 2; // one create + one message
    let backend = Arc::new(ScriptedBackend::always_text("primary", "ok"));
    let orch = orchestrator(cfg, vec![backend], ToolRegistry::new());
    let user = chat_user();
    let session = create_chat_session(&orch, &user).await;

    let sub = orch
        .process_message(&user, session.session_id, "first")
        .await
        .unwrap();
    let _ = collect_until_terminal(sub).await;
    let (hourly, _) = orch.gate().quota_counters("u1").await.unwrap();
    assert_eq!(hourly, 2);

    // Watch the stream while the denied request is made, resuming past the
    // events already emitted so only the denial shows up.
    let already_seen = orch.bus().last_event_id(session.session_id);
    let watcher = orch
        .subscribe(&user, session.session_id, Some(already_seen))
        .await
        .unwrap();
    let err = orch
        .process_message(&user, session.session_id, "second")
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::QuotaExceeded("hourly")));

    let events = collect_until_terminal(watcher).await;
    let errors: Vec<&Event> = events.iter().filter(|e| e.kind == EventKind::Error).collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].payload["kind"], "quota_exceeded");
    assert_eq!(errors[0].payload["severity"], "medium");
    assert!(errors[0].payload["recovery_hint"]
        .as_str()
        .unwrap()
        .contains("window"));

    // The denied request did not advance the counter.
    let (hourly, _) = orch.gate().quota_counters("u1").await.unwrap();
    assert_eq!(hourly, 2);
}

// ── Scenario: model fallback ─────────────────────────────────────────────────

#[tokio::test]
async fn failing_primary_falls_back_without_observable_failure() {
    let primary = Arc::new(ScriptedBackend::new(
        "primary",
        vec![ScriptedCall::Fail(aria_model::ModelError::Status(500))],
    ));
    let secondary = Arc::new(ScriptedBackend::always_text("secondary", "served by fallback"));
    let orch = orchestrator(Config::default(), vec![primary, secondary], ToolRegistry::new());
    let user = chat_user();
    let session = create_chat_session(&orch, &user).await;

    let sub = orch
        .process_message(&user, session.session_id, "hi")
        .await
        .unwrap();
    let events = collect_until_terminal(sub).await;

    let response = events.iter().find(|e| e.kind == EventKind::Response).unwrap();
    assert_eq!(response.payload["text"], "served by fallback");
    assert!(!events.iter().any(|e| e.kind == EventKind::Error));
    assert!(orch.engine_metrics().fallback_used >= 1);
}

// ── Scenario: session expiry ─────────────────────────────────────────────────

#[tokio::test]
async fn message_after_expiry_is_rejected() {
    let backend = Arc::new(ScriptedBackend::always_text("primary", "ok"));
    let orch = orchestrator(Config::default(), vec![backend], ToolRegistry::new());
    let user = chat_user();
    let mut session = create_chat_session(&orch, &user).await;

    let sub = orch
        .process_message(&user, session.session_id, "while active")
        .await
        .unwrap();
    let _ = collect_until_terminal(sub).await;

    session.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
    orch.sessions().overwrite_for_test(&session).await.unwrap();

    let err = orch
        .process_message(&user, session.session_id, "too late")
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::SessionExpired));
}

// ── Scenario: dangerous tool denial ──────────────────────────────────────────

#[tokio::test]
async fn dangerous_tool_on_personal_agent_is_denied_and_audited() {
    let backend = Arc::new(ScriptedBackend::tool_then_text(
        "primary",
        "user_suspend",
        json!({}),
        "I can't do that.",
    ));
    let mut tools = ToolRegistry::new();
    tools.register(
        FnTool::new("user_suspend", "suspend a user account", json!({"type": "object"}), |_| async {
            ToolOutput::ok("suspended")
        })
        .dangerous(),
    );
    let orch = orchestrator(Config::default(), vec![backend], tools);
    let user = chat_user();
    let session = create_chat_session(&orch, &user).await;

    let sub = orch
        .process_message(&user, session.session_id, "suspend user bob")
        .await
        .unwrap();
    let events = collect_until_terminal(sub).await;

    let result = events.iter().find(|e| e.kind == EventKind::ToolResult).unwrap();
    assert_eq!(result.payload["is_error"], true);

    // The denial is audited with a terminal outcome at critical level, and
    // the stream still closes with a normal response.
    let audit = orch.audit().recent_today(20).await;
    let tool_entries: Vec<_> = audit
        .iter()
        .filter(|r| r.kind == crate::AuditKind::ToolInvocation)
        .collect();
    assert_eq!(tool_entries.len(), 1);
    assert_eq!(tool_entries[0].detail["outcome"], "denied");
    assert_eq!(tool_entries[0].severity, crate::Severity::Critical);
    assert!(events.iter().any(|e| e.kind == EventKind::Response));
}

// ── Tool round-trip ──────────────────────────────────────────────────────────

#[tokio::test]
async fn allowed_tool_result_is_injected_before_final_response() {
    let backend = Arc::new(ScriptedBackend::tool_then_text(
        "primary",
        "catalog_search",
        json!({"city": "Malmö"}),
        "Found 3 results.",
    ));
    let mut tools = ToolRegistry::new();
    tools.register(FnTool::new(
        "catalog_search",
        "search the catalog",
        json!({"type": "object", "properties": {"city": {"type": "string"}}}),
        |_| async { ToolOutput::ok("3 results") },
    ));
    let orch = orchestrator(Config::default(), vec![backend.clone()], tools);
    let user = UserContext::new("u1").with_permission("ai:commerce");
    let session = orch
        .create_session(&user, Some(AgentKind::Commerce), SessionMode::Chat, PrivacyMode::Private, None)
        .await
        .unwrap();

    let sub = orch
        .process_message(&user, session.session_id, "find blenders")
        .await
        .unwrap();
    let events = collect_until_terminal(sub).await;

    let waiting_pos = events.iter().position(|e| e.kind == EventKind::Waiting).unwrap();
    let call_pos = events.iter().position(|e| e.kind == EventKind::ToolCall).unwrap();
    let result_pos = events.iter().position(|e| e.kind == EventKind::ToolResult).unwrap();
    let response_pos = events.iter().position(|e| e.kind == EventKind::Response).unwrap();
    assert!(waiting_pos < call_pos && call_pos < result_pos && result_pos < response_pos);
    assert_eq!(events[waiting_pos].payload["pending"], 1);

    let result = &events[result_pos];
    assert_eq!(result.payload["is_error"], false);
    assert_eq!(result.payload["output"], "3 results");

    // The second model round saw the tool result in its prompt.
    let prompts = backend.prompts.lock().unwrap();
    assert!(prompts[1].contains("3 results"));
}

// ── Scenario: reconnect replay ───────────────────────────────────────────────

#[tokio::test]
async fn resubscribing_from_zero_replays_the_full_stream_in_order() {
    let backend = Arc::new(ScriptedBackend::always_text("primary", "replayed"));
    let orch = orchestrator(Config::default(), vec![backend], ToolRegistry::new());
    let user = chat_user();
    let session = create_chat_session(&orch, &user).await;

    let sub = orch
        .process_message(&user, session.session_id, "hi")
        .await
        .unwrap();
    let live = collect_until_terminal(sub).await;

    let replay = orch
        .subscribe(&user, session.session_id, Some(0))
        .await
        .unwrap();
    let replay_ids: Vec<u64> = replay.backlog.iter().map(|e| e.event_id).collect();
    assert_eq!(
        replay_ids,
        (1..=*replay_ids.last().unwrap()).collect::<Vec<u64>>()
    );
    assert!(replay.backlog.len() >= live.len());
}

#[tokio::test]
async fn subscriber_resumes_from_where_it_left_off() {
    let backend = Arc::new(ScriptedBackend::always_text("primary", "resumable"));
    let orch = orchestrator(Config::default(), vec![backend], ToolRegistry::new());
    let user = chat_user();
    let session = create_chat_session(&orch, &user).await;

    let sub = orch
        .process_message(&user, session.session_id, "hi")
        .await
        .unwrap();
    let events = collect_until_terminal(sub).await;
    let midpoint = events[events.len() / 2].event_id;

    let resumed = orch
        .subscribe(&user, session.session_id, Some(midpoint))
        .await
        .unwrap();
    assert!(resumed.backlog.iter().all(|e| e.event_id > midpoint));
    assert!(resumed.backlog.iter().any(|e| e.kind == EventKind::Response));
}

// ── Scenario: voice round trip ───────────────────────────────────────────────

#[tokio::test]
async fn voice_frame_is_transcribed_processed_and_synthesized() {
    let backend = Arc::new(ScriptedBackend::always_text("primary", "It is sunny."));
    let orch = orchestrator(Config::default(), vec![backend], ToolRegistry::new());
    let user = UserContext::new("u1")
        .with_permission("ai:voice")
        .with_permission("ai:basic_chat");
    let session = orch
        .create_session(&user, Some(AgentKind::Personal), SessionMode::Voice, PrivacyMode::Private, None)
        .await
        .unwrap();

    let sub = orch
        .process_voice(&user, session.session_id, b"what's the weather")
        .await
        .unwrap();

    // TTS arrives after the response; wait for it explicitly.
    let mut sub = sub;
    let mut events = sub.backlog.clone();
    loop {
        let ev = tokio::time::timeout(Duration::from_secs(2), sub.rx.recv())
            .await
            .expect("timed out waiting for tts")
            .unwrap();
        let kind = ev.kind;
        events.push(ev);
        if kind == EventKind::Tts {
            break;
        }
    }

    let stt = events.iter().find(|e| e.kind == EventKind::Stt).unwrap();
    assert_eq!(stt.payload["transcript"], "what's the weather");
    let response = events.iter().find(|e| e.kind == EventKind::Response).unwrap();
    assert_eq!(response.payload["text"], "It is sunny.");
    assert!(events.iter().any(|e| e.kind == EventKind::Tts));
}

#[tokio::test]
async fn voice_without_permission_is_denied() {
    let backend = Arc::new(ScriptedBackend::always_text("primary", "x"));
    let orch = orchestrator(Config::default(), vec![backend], ToolRegistry::new());
    let user = chat_user(); // no ai:voice
    let session = create_chat_session(&orch, &user).await;

    let err = orch
        .process_voice(&user, session.session_id, b"hello")
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::PermissionDenied(tag) if tag == "ai:voice"));
}

// ── Session lifecycle through the façade ─────────────────────────────────────

#[tokio::test]
async fn end_session_emits_terminal_event_and_frees_the_slot() {
    let backend = Arc::new(ScriptedBackend::always_text("primary", "ok"));
    let orch = orchestrator(Config::default(), vec![backend], ToolRegistry::new());
    let user = chat_user();
    let session = create_chat_session(&orch, &user).await;

    let mut watcher = orch.subscribe(&user, session.session_id, None).await.unwrap();
    orch.end_session(&user, session.session_id).await.unwrap();

    // The last event on the stream is session_end, then the channel closes.
    let mut saw_end = false;
    loop {
        match tokio::time::timeout(Duration::from_secs(2), watcher.rx.recv()).await {
            Ok(Ok(ev)) => saw_end = ev.kind == EventKind::SessionEnd,
            Ok(Err(_)) | Err(_) => break,
        }
    }
    assert!(saw_end);
    assert_eq!(orch.sessions().active_sessions("u1").await.unwrap(), 0);
}

#[tokio::test]
async fn subscribing_to_another_users_session_is_not_found() {
    let backend = Arc::new(ScriptedBackend::always_text("primary", "ok"));
    let orch = orchestrator(Config::default(), vec![backend], ToolRegistry::new());
    let owner = chat_user();
    let session = create_chat_session(&orch, &owner).await;

    let outsider = UserContext::new("u2").with_permission("ai:basic_chat");
    let err = orch
        .subscribe(&outsider, session.session_id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::SessionNotFound));
}

#[tokio::test]
async fn agent_switch_requires_the_destination_permission() {
    let backend = Arc::new(ScriptedBackend::always_text("primary", "ok"));
    let orch = orchestrator(Config::default(), vec![backend], ToolRegistry::new());
    let user = chat_user();
    let session = create_chat_session(&orch, &user).await;

    let err = orch
        .switch_agent(&user, session.session_id, AgentKind::Security)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::PermissionDenied(tag) if tag == "ai:admin"));

    let admin = UserContext::new("u1").with_role("admin");
    let switched = orch
        .switch_agent(&admin, session.session_id, AgentKind::Security)
        .await
        .unwrap();
    assert_eq!(switched.agent_kind, AgentKind::Security);
}

#[tokio::test]
async fn garbage_collect_closes_expired_sessions_with_session_end() {
    let backend = Arc::new(ScriptedBackend::always_text("primary", "ok"));
    let orch = orchestrator(Config::default(), vec![backend], ToolRegistry::new());
    let user = chat_user();
    let mut session = create_chat_session(&orch, &user).await;

    session.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
    orch.sessions().overwrite_for_test(&session).await.unwrap();

    let collected = orch.garbage_collect().await.unwrap();
    assert_eq!(collected, 1);
    assert_eq!(orch.sessions().active_sessions("u1").await.unwrap(), 0);
}
