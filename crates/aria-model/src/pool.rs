// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tracing::{info, warn};

use crate::backend::InferenceBackend;
use crate::types::{GenerateOptions, GenerateRequest, StreamEvent};

/// Health state of one pooled client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    Cold,
    Warming,
    Ready,
    Degraded,
    Down,
}

const STATE_COLD: u8 = 0;
const STATE_WARMING: u8 = 1;
const STATE_READY: u8 = 2;
const STATE_DEGRADED: u8 = 3;
const STATE_DOWN: u8 = 4;

/// Consecutive failures at which a client is degraded / taken down.
const DEGRADE_AFTER: u32 = 3;
const DOWN_AFTER: u32 = 6;

/// EWMA smoothing factor for latency tracking.
const EWMA_ALPHA: f64 = 0.2;

/// One pooled connection to a backend, with health and load tracking.
pub struct PooledClient {
    backend: Arc<dyn InferenceBackend>,
    state: AtomicU8,
    inflight: AtomicU32,
    failure_count: AtomicU32,
    consecutive_failures: AtomicU32,
    latency_ewma_us: AtomicU64,
}

/// RAII inflight counter; dropped when the call's stream finishes or is
/// abandoned.
pub struct InflightGuard {
    client: Arc<PooledClient>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.client.inflight.fetch_sub(1, Ordering::AcqRel);
    }
}

impl PooledClient {
    pub fn new(backend: Arc<dyn InferenceBackend>) -> Self {
        Self {
            backend,
            state: AtomicU8::new(STATE_COLD),
            inflight: AtomicU32::new(0),
            failure_count: AtomicU32::new(0),
            consecutive_failures: AtomicU32::new(0),
            latency_ewma_us: AtomicU64::new(0),
        }
    }

    pub fn backend(&self) -> &Arc<dyn InferenceBackend> {
        &self.backend
    }

    pub fn state(&self) -> ClientState {
        match self.state.load(Ordering::Acquire) {
            STATE_WARMING => ClientState::Warming,
            STATE_READY => ClientState::Ready,
            STATE_DEGRADED => ClientState::Degraded,
            STATE_DOWN => ClientState::Down,
            _ => ClientState::Cold,
        }
    }

    pub fn set_state(&self, state: ClientState) {
        let v = match state {
            ClientState::Cold => STATE_COLD,
            ClientState::Warming => STATE_WARMING,
            ClientState::Ready => STATE_READY,
            ClientState::Degraded => STATE_DEGRADED,
            ClientState::Down => STATE_DOWN,
        };
        self.state.store(v, Ordering::Release);
    }

    pub fn inflight(&self) -> u32 {
        self.inflight.load(Ordering::Acquire)
    }

    pub fn begin_call(self: &Arc<Self>) -> InflightGuard {
        self.inflight.fetch_add(1, Ordering::AcqRel);
        InflightGuard {
            client: Arc::clone(self),
        }
    }

    pub fn record_success(&self, latency: Duration) {
        self.consecutive_failures.store(0, Ordering::Release);
        let sample = latency.as_micros() as u64;
        let old = self.latency_ewma_us.load(Ordering::Acquire);
        let next = if old == 0 {
            sample
        } else {
            ((old as f64) * (1.0 - EWMA_ALPHA) + (sample as f64) * EWMA_ALPHA) as u64
        };
        self.latency_ewma_us.store(next, Ordering::Release);
        // A degraded client that succeeds again is restored; down clients
        // stay down until re-warmed.
        if self.state() == ClientState::Degraded {
            self.set_state(ClientState::Ready);
        }
    }

    pub fn record_failure(&self) {
        self.failure_count.fetch_add(1, Ordering::AcqRel);
        let streak = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if streak >= DOWN_AFTER {
            self.set_state(ClientState::Down);
        } else if streak >= DEGRADE_AFTER && self.state() == ClientState::Ready {
            self.set_state(ClientState::Degraded);
        }
    }

    pub fn latency_ewma(&self) -> Duration {
        Duration::from_micros(self.latency_ewma_us.load(Ordering::Acquire))
    }

    pub fn metrics(&self) -> ClientMetrics {
        ClientMetrics {
            backend: self.backend.name().to_string(),
            model: self.backend.model_name().to_string(),
            state: self.state(),
            inflight: self.inflight(),
            failure_count: self.failure_count.load(Ordering::Acquire),
            latency_ewma_ms: self.latency_ewma().as_secs_f64() * 1000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientMetrics {
    pub backend: String,
    pub model: String,
    pub state: ClientState,
    pub inflight: u32,
    pub failure_count: u32,
    pub latency_ewma_ms: f64,
}

/// Fixed-size pool of clients for one backend endpoint.
pub struct BackendPool {
    name: String,
    clients: Vec<Arc<PooledClient>>,
}

impl BackendPool {
    /// Build a pool of `size` clients produced by `make`.  Each client gets
    /// its own backend instance so connection state is not shared.
    pub fn new(name: impl Into<String>, size: usize, make: impl Fn() -> Arc<dyn InferenceBackend>) -> Self {
        let clients = (0..size.max(1))
            .map(|_| Arc::new(PooledClient::new(make())))
            .collect();
        Self {
            name: name.into(),
            clients,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Least-loaded `ready` client, or `None` when nothing is ready.
    pub fn select(&self) -> Option<Arc<PooledClient>> {
        self.clients
            .iter()
            .filter(|c| c.state() == ClientState::Ready)
            .min_by_key(|c| c.inflight())
            .cloned()
    }

    /// Dispatch a short priming call on every client and mark each `ready`
    /// on success or `down` on failure.
    pub async fn warmup(&self, prompt: &str, deadline: Duration) {
        for client in &self.clients {
            client.set_state(ClientState::Warming);
            let req = GenerateRequest {
                prompt: prompt.to_string(),
                options: GenerateOptions {
                    max_tokens: Some(1),
                    temperature: None,
                },
            };
            let outcome = tokio::time::timeout(deadline, async {
                let mut stream = client.backend().generate(req).await?;
                while let Some(ev) = stream.next().await {
                    if matches!(ev?, StreamEvent::Done) {
                        break;
                    }
                }
                Ok::<_, crate::types::ModelError>(())
            })
            .await;
            match outcome {
                Ok(Ok(())) => {
                    client.set_state(ClientState::Ready);
                    info!(pool = %self.name, "client warmed up");
                }
                Ok(Err(e)) => {
                    client.set_state(ClientState::Down);
                    warn!(pool = %self.name, error = %e, "client warmup failed");
                }
                Err(_) => {
                    client.set_state(ClientState::Down);
                    warn!(pool = %self.name, "client warmup timed out");
                }
            }
        }
    }

    /// Mark every client ready without a priming call (tests, mock backends).
    pub fn mark_all_ready(&self) {
        for client in &self.clients {
            client.set_state(ClientState::Ready);
        }
    }

    pub fn metrics(&self) -> Vec<ClientMetrics> {
        self.clients.iter().map(|c| c.metrics()).collect()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBackend;

    fn pool(size: usize) -> BackendPool {
        BackendPool::new("test", size, || Arc::new(MockBackend::new("test", "m")))
    }

    #[test]
    fn new_clients_start_cold_and_are_not_selectable() {
        let p = pool(3);
        assert!(p.select().is_none());
    }

    #[test]
    fn mark_all_ready_enables_selection() {
        let p = pool(3);
        p.mark_all_ready();
        assert!(p.select().is_some());
    }

    #[test]
    fn select_prefers_least_loaded() {
        let p = pool(2);
        p.mark_all_ready();
        let busy = p.select().unwrap();
        let _guard = busy.begin_call();
        let chosen = p.select().unwrap();
        assert_eq!(chosen.inflight(), 0);
    }

    #[test]
    fn inflight_guard_decrements_on_drop() {
        let p = pool(1);
        p.mark_all_ready();
        let c = p.select().unwrap();
        {
            let _g = c.begin_call();
            assert_eq!(c.inflight(), 1);
        }
        assert_eq!(c.inflight(), 0);
    }

    #[test]
    fn repeated_failures_degrade_then_down() {
        let p = pool(1);
        p.mark_all_ready();
        let c = p.select().unwrap();
        for _ in 0..DEGRADE_AFTER {
            c.record_failure();
        }
        assert_eq!(c.state(), ClientState::Degraded);
        for _ in 0..(DOWN_AFTER - DEGRADE_AFTER) {
            c.record_failure();
        }
        assert_eq!(c.state(), ClientState::Down);
        assert!(p.select().is_none());
    }

    #[test]
    fn success_restores_degraded_client() {
        let p = pool(1);
        p.mark_all_ready();
        let c = p.clients[0].clone();
        for _ in 0..DEGRADE_AFTER {
            c.record_failure();
        }
        assert_eq!(c.state(), ClientState::Degraded);
        c.record_success(Duration::from_millis(5));
        assert_eq!(c.state(), ClientState::Ready);
    }

    #[test]
    fn latency_ewma_tracks_samples() {
        let p = pool(1);
        let c = p.clients[0].clone();
        c.record_success(Duration::from_millis(100));
        assert_eq!(c.latency_ewma(), Duration::from_millis(100));
        c.record_success(Duration::from_millis(200));
        let ewma = c.latency_ewma().as_millis();
        assert!(ewma > 100 && ewma < 200, "ewma {ewma} should sit between samples");
    }

    #[tokio::test]
    async fn warmup_marks_mock_clients_ready() {
        let p = pool(2);
        p.warmup("ping", Duration::from_secs(1)).await;
        for m in p.metrics() {
            assert_eq!(m.state, ClientState::Ready);
        }
    }
}
