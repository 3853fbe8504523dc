// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{stream, StreamExt};
use serde::Serialize;
use tracing::{info, warn};

use aria_config::{CacheConfig, ModelConfig};
use aria_resilience::{Bulkhead, BulkheadPermit, CircuitBreaker, RetryPolicy};

use crate::backend::{HttpBackend, InferenceBackend};
use crate::cache::ResponseCache;
use crate::pool::{BackendPool, ClientMetrics, InflightGuard, PooledClient};
use crate::types::{GenerateOptions, GenerateRequest, ModelError, StreamEvent, TokenStream};

const WARMUP_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Default)]
struct Counters {
    success: AtomicU64,
    failure: AtomicU64,
    fallback_used: AtomicU64,
    degraded_served: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineMetrics {
    pub success: u64,
    pub failure: u64,
    pub fallback_used: u64,
    pub degraded_served: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub clients: Vec<ClientMetrics>,
}

/// The inference engine: pooled backends, a response cache, and an ordered
/// fallback chain, wrapped in the `model_inference` breaker and bulkhead.
///
/// Call sequence for one `generate`:
/// cache lookup → bulkhead admission → chain walk (each backend wrapped in
/// the retry policy) → stale cache / canned degraded message.  The breaker
/// guards the chain's primary; while it is open the primary is skipped
/// entirely and the call goes straight to the fallback tail.
pub struct ModelEngine {
    pools: HashMap<String, BackendPool>,
    backend_order: Vec<String>,
    chains: HashMap<String, Vec<String>>,
    default_chain: String,
    cache: Arc<ResponseCache>,
    breaker: Arc<CircuitBreaker>,
    bulkhead: Arc<Bulkhead>,
    retry: RetryPolicy,
    allow_stale_on_outage: bool,
    degraded_message: String,
    warmup_prompt: String,
    counters: Arc<Counters>,
}

impl ModelEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pools: Vec<BackendPool>,
        chains: HashMap<String, Vec<String>>,
        default_chain: String,
        cache: ResponseCache,
        breaker: Arc<CircuitBreaker>,
        bulkhead: Arc<Bulkhead>,
        retry: RetryPolicy,
        allow_stale_on_outage: bool,
        degraded_message: String,
        warmup_prompt: String,
    ) -> Self {
        let backend_order: Vec<String> = pools.iter().map(|p| p.name().to_string()).collect();
        let pools = pools
            .into_iter()
            .map(|p| (p.name().to_string(), p))
            .collect();
        Self {
            pools,
            backend_order,
            chains,
            default_chain,
            cache: Arc::new(cache),
            breaker,
            bulkhead,
            retry,
            allow_stale_on_outage,
            degraded_message,
            warmup_prompt,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Production wiring: one pool of HTTP clients per configured backend.
    pub fn from_config(
        model: &ModelConfig,
        cache_cfg: &CacheConfig,
        breaker: Arc<CircuitBreaker>,
        bulkhead: Arc<Bulkhead>,
        retry: RetryPolicy,
    ) -> Self {
        let request_timeout = Duration::from_secs(model.request_timeout_s);
        let pools: Vec<BackendPool> = model
            .backends
            .iter()
            .map(|b| {
                BackendPool::new(&b.name, b.pool_size, || {
                    Arc::new(HttpBackend::new(b, request_timeout)) as Arc<dyn InferenceBackend>
                })
            })
            .collect();
        Self::new(
            pools,
            model.chains.clone(),
            model.default_chain.clone(),
            ResponseCache::new(cache_cfg.max_entries, Duration::from_secs(cache_cfg.response_ttl_s)),
            breaker,
            bulkhead,
            retry,
            model.allow_stale_on_outage,
            model.degraded_message.clone(),
            model.warmup_prompt.clone(),
        )
    }

    /// Prime every pooled client.  Called once on boot.
    pub async fn warmup(&self) {
        for name in &self.backend_order {
            if let Some(pool) = self.pools.get(name) {
                pool.warmup(&self.warmup_prompt, WARMUP_DEADLINE).await;
            }
        }
    }

    /// Skip the priming call and mark every client ready (tests).
    pub fn mark_all_ready(&self) {
        for pool in self.pools.values() {
            pool.mark_all_ready();
        }
    }

    fn chain_for(&self, name: &str) -> Vec<String> {
        self.chains
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.backend_order.clone())
    }

    /// Stream a completion for `prompt`.
    ///
    /// `model` selects the fallback chain; `None` uses the default chain.
    /// Returns a token stream ending in `Done`, or an error when neither the
    /// chain nor the outage fallbacks could produce anything.
    pub async fn generate(
        &self,
        model: Option<&str>,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<TokenStream, ModelError> {
        let chain_name = model.unwrap_or(&self.default_chain).to_string();
        let key = ResponseCache::key(&chain_name, prompt, options);

        // A fresh cache hit replays the realized completion as one burst.
        if let Some(text) = self.cache.get(&key) {
            return Ok(burst_stream(text));
        }

        let permit = self.bulkhead.acquire().await?;

        let chain = self.chain_for(&chain_name);
        // While the breaker is open the primary is skipped outright — the
        // open state must cause zero I/O toward the failing downstream.
        let primary_admitted = self.breaker.acquire().is_ok();
        let mut used_fallback = false;

        for (i, name) in chain.iter().enumerate() {
            let is_primary = i == 0;
            if is_primary && !primary_admitted {
                used_fallback = true;
                continue;
            }
            let Some(pool) = self.pools.get(name) else {
                warn!(backend = %name, "chain references unknown backend");
                continue;
            };
            let attempt = self
                .retry
                .run(|| self.start_stream(pool, prompt, options), ModelError::is_transient)
                .await;
            match attempt {
                Ok((client, inner)) => {
                    if is_primary {
                        self.breaker.record_success();
                    } else {
                        used_fallback = true;
                    }
                    if used_fallback {
                        self.counters.fallback_used.fetch_add(1, Ordering::Relaxed);
                        info!(backend = %name, "fallback backend served the request");
                    }
                    return Ok(self.drive(inner, client, permit, key));
                }
                Err(e) => {
                    if is_primary {
                        self.breaker.record_failure();
                    }
                    warn!(backend = %name, error = %e, "backend failed; consulting next in chain");
                }
            }
        }

        // Chain exhausted: stale cache (when allowed), then the canned
        // degraded message, then give up.
        drop(permit);
        if self.allow_stale_on_outage {
            if let Some(text) = self.cache.get_stale(&key) {
                self.counters.fallback_used.fetch_add(1, Ordering::Relaxed);
                warn!("serving stale cached completion during backend outage");
                return Ok(burst_stream(text));
            }
        }
        if !self.degraded_message.is_empty() {
            self.counters.degraded_served.fetch_add(1, Ordering::Relaxed);
            warn!("serving canned degraded message; fallback chain exhausted");
            return Ok(burst_stream(self.degraded_message.clone()));
        }
        self.counters.failure.fetch_add(1, Ordering::Relaxed);
        Err(ModelError::Unavailable)
    }

    /// One attempt: select the least-loaded ready client and open a stream.
    /// `Unavailable` (no ready client) is not transient, so the retry policy
    /// moves on to the next chain entry immediately.
    async fn start_stream(
        &self,
        pool: &BackendPool,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<(Arc<PooledClient>, TokenStream), ModelError> {
        let client = pool.select().ok_or(ModelError::Unavailable)?;
        let req = GenerateRequest {
            prompt: prompt.to_string(),
            options: options.clone(),
        };
        match client.backend().generate(req).await {
            Ok(stream) => Ok((client, stream)),
            Err(e) => {
                client.record_failure();
                Err(e)
            }
        }
    }

    /// Wrap a live backend stream with accounting: latency and health on the
    /// client, success/failure counters, cache population on completion.  The
    /// bulkhead permit and inflight guard live inside the returned stream, so
    /// the slot is held for exactly the lifetime of the response.
    fn drive(
        &self,
        inner: TokenStream,
        client: Arc<PooledClient>,
        permit: BulkheadPermit,
        cache_key: String,
    ) -> TokenStream {
        struct Drive {
            inner: TokenStream,
            acc: String,
            cacheable: bool,
            finished: bool,
            client: Arc<PooledClient>,
            _inflight: InflightGuard,
            _permit: BulkheadPermit,
            started: tokio::time::Instant,
            cache: Arc<ResponseCache>,
            counters: Arc<Counters>,
            key: String,
        }

        let st = Drive {
            _inflight: client.begin_call(),
            inner,
            acc: String::new(),
            cacheable: true,
            finished: false,
            client,
            _permit: permit,
            started: tokio::time::Instant::now(),
            cache: Arc::clone(&self.cache),
            counters: Arc::clone(&self.counters),
            key: cache_key,
        };

        Box::pin(stream::unfold(st, |mut st| async move {
            if st.finished {
                return None;
            }
            match st.inner.next().await {
                Some(Ok(ev)) => {
                    match &ev {
                        StreamEvent::TokenDelta(t) => st.acc.push_str(t),
                        // Completions that requested tools are not replayable
                        // verbatim, so they never enter the cache.
                        StreamEvent::ToolCallRequest { .. } => st.cacheable = false,
                        StreamEvent::Done => {
                            st.finished = true;
                            st.client.record_success(st.started.elapsed());
                            st.counters.success.fetch_add(1, Ordering::Relaxed);
                            if st.cacheable && !st.acc.is_empty() {
                                st.cache.put(st.key.clone(), st.acc.clone());
                            }
                        }
                    }
                    Some((Ok(ev), st))
                }
                Some(Err(e)) => {
                    st.finished = true;
                    st.client.record_failure();
                    st.counters.failure.fetch_add(1, Ordering::Relaxed);
                    Some((Err(e), st))
                }
                // Stream ended without a Done marker: mid-stream disconnect.
                None => {
                    st.finished = true;
                    st.client.record_failure();
                    st.counters.failure.fetch_add(1, Ordering::Relaxed);
                    Some((
                        Err(ModelError::Transport("stream ended before completion".into())),
                        st,
                    ))
                }
            }
        }))
    }

    pub fn metrics(&self) -> EngineMetrics {
        let (cache_hits, cache_misses) = self.cache.stats();
        let clients = self
            .backend_order
            .iter()
            .filter_map(|n| self.pools.get(n))
            .flat_map(|p| p.metrics())
            .collect();
        EngineMetrics {
            success: self.counters.success.load(Ordering::Relaxed),
            failure: self.counters.failure.load(Ordering::Relaxed),
            fallback_used: self.counters.fallback_used.load(Ordering::Relaxed),
            degraded_served: self.counters.degraded_served.load(Ordering::Relaxed),
            cache_hits,
            cache_misses,
            cache_hit_rate: self.cache.hit_rate(),
            clients,
        }
    }
}

/// A pre-realized completion replayed as a single virtual token burst.
fn burst_stream(text: String) -> TokenStream {
    Box::pin(stream::iter(vec![
        Ok(StreamEvent::TokenDelta(text)),
        Ok(StreamEvent::Done),
    ]))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{ScriptedBackend, ScriptedCall};

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    fn engine_with(backends: Vec<Arc<ScriptedBackend>>) -> ModelEngine {
        engine_with_opts(backends, true, "degraded".into())
    }

    fn engine_with_opts(
        backends: Vec<Arc<ScriptedBackend>>,
        allow_stale: bool,
        degraded: String,
    ) -> ModelEngine {
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
            Arc::new(Bulkhead::new("model_inference", 20, Duration::from_millis(50))),
            fast_retry(),
            allow_stale,
            degraded,
            "ping".into(),
        );
        engine.mark_all_ready();
        engine
    }

    async fn collect_text(mut stream: TokenStream) -> String {
        let mut text = String::new();
        while let Some(ev) = stream.next().await {
            match ev.unwrap() {
                StreamEvent::TokenDelta(t) => text.push_str(&t),
                StreamEvent::Done => break,
                StreamEvent::ToolCallRequest { .. } => {}
            }
        }
        text
    }

    #[tokio::test]
    async fn happy_path_streams_primary_response() {
        let primary = Arc::new(ScriptedBackend::always_text("primary", "hello"));
        let engine = engine_with(vec![primary]);
        let stream = engine.generate(None, "hi", &GenerateOptions::default()).await.unwrap();
        assert_eq!(collect_text(stream).await, "hello");
        assert_eq!(engine.metrics().success, 1);
    }

    #[tokio::test]
    async fn second_identical_request_is_served_from_cache() {
        let primary = Arc::new(ScriptedBackend::always_text("primary", "cached reply"));
        let engine = engine_with(vec![Arc::clone(&primary)]);
        let opts = GenerateOptions::default();
        let first = collect_text(engine.generate(None, "q", &opts).await.unwrap()).await;
        let second = collect_text(engine.generate(None, "q", &opts).await.unwrap()).await;
        assert_eq!(first, second);
        assert_eq!(primary.calls(), 1, "cache hit must not reach the backend");
        assert_eq!(engine.metrics().cache_hits, 1);
    }

    #[tokio::test]
    async fn transient_failure_is_retried_then_succeeds() {
        let primary = Arc::new(ScriptedBackend::fail_times(
            "primary",
            2,
            ModelError::Status(503),
            "after retry",
        ));
        let engine = engine_with(vec![Arc::clone(&primary)]);
        let stream = engine.generate(None, "q", &GenerateOptions::default()).await.unwrap();
        assert_eq!(collect_text(stream).await, "after retry");
        assert_eq!(primary.calls(), 3);
    }

    #[tokio::test]
    async fn exhausted_primary_falls_back_to_secondary() {
        let primary = Arc::new(ScriptedBackend::new(
            "primary",
            vec![ScriptedCall::Fail(ModelError::Status(500))],
        ));
        let secondary = Arc::new(ScriptedBackend::always_text("secondary", "from secondary"));
        let engine = engine_with(vec![primary, secondary]);
        let stream = engine.generate(None, "q", &GenerateOptions::default()).await.unwrap();
        assert_eq!(collect_text(stream).await, "from secondary");
        assert_eq!(engine.metrics().fallback_used, 1);
    }

    #[tokio::test]
    async fn open_breaker_skips_primary_without_touching_it() {
        let primary = Arc::new(ScriptedBackend::always_text("primary", "never seen"));
        let secondary = Arc::new(ScriptedBackend::always_text("secondary", "fallback ok"));
        let engine = engine_with(vec![Arc::clone(&primary), secondary]);
        // Open the breaker by reporting five consecutive failures.
        for _ in 0..5 {
            engine.breaker.record_failure();
        }
        let stream = engine.generate(None, "q", &GenerateOptions::default()).await.unwrap();
        assert_eq!(collect_text(stream).await, "fallback ok");
        assert_eq!(primary.calls(), 0, "open breaker must cause zero I/O to the primary");
        assert_eq!(engine.metrics().fallback_used, 1);
    }

    #[tokio::test]
    async fn chain_exhaustion_serves_degraded_message() {
        let primary = Arc::new(ScriptedBackend::new(
            "primary",
            vec![ScriptedCall::Fail(ModelError::Status(500))],
        ));
        let engine = engine_with(vec![primary]);
        let stream = engine.generate(None, "q", &GenerateOptions::default()).await.unwrap();
        assert_eq!(collect_text(stream).await, "degraded");
        assert_eq!(engine.metrics().degraded_served, 1);
    }

    #[tokio::test]
    async fn chain_exhaustion_without_degraded_message_is_unavailable() {
        let primary = Arc::new(ScriptedBackend::new(
            "primary",
            vec![ScriptedCall::Fail(ModelError::Status(500))],
        ));
        let engine = engine_with_opts(vec![primary], false, String::new());
        let res = engine.generate(None, "q", &GenerateOptions::default()).await;
        assert!(matches!(res, Err(ModelError::Unavailable)));
    }

    #[tokio::test]
    async fn stale_cache_serves_during_outage() {
        let primary = Arc::new(ScriptedBackend::new(
            "primary",
            vec![
                ScriptedCall::Events(vec![
                    Ok(StreamEvent::TokenDelta("original".into())),
                    Ok(StreamEvent::Done),
                ]),
                ScriptedCall::Fail(ModelError::Status(500)),
            ],
        ));
        let engine = engine_with_opts(vec![primary], true, String::new());
        let opts = GenerateOptions::default();
        let _ = collect_text(engine.generate(None, "q", &opts).await.unwrap()).await;

        // Make the cached entry stale by draining its TTL, then break the
        // backend: the stale entry is the last-resort answer.
        let key = ResponseCache::key("default", "q", &opts);
        assert_eq!(engine.cache.get_stale(&key).as_deref(), Some("original"));
        tokio::time::pause();
        tokio::time::advance(Duration::from_secs(3601)).await;
        let out = collect_text(engine.generate(None, "q", &opts).await.unwrap()).await;
        assert_eq!(out, "original");
        assert!(engine.metrics().fallback_used >= 1);
    }

    #[tokio::test]
    async fn bulkhead_at_capacity_rejects() {
        let primary = Arc::new(ScriptedBackend::always_text("primary", "x"));
        let pools = vec![{
            let b = Arc::clone(&primary);
            BackendPool::new("primary", 1, move || Arc::clone(&b) as Arc<dyn InferenceBackend>)
        }];
        let bulkhead = Arc::new(Bulkhead::new("model_inference", 1, Duration::from_millis(10)));
        let engine = ModelEngine::new(
            pools,
            HashMap::new(),
            "default".into(),
            ResponseCache::new(64, Duration::from_secs(3600)),
            Arc::new(CircuitBreaker::new("model_inference", 5, Duration::from_secs(60))),
            Arc::clone(&bulkhead),
            fast_retry(),
            false,
            String::new(),
            "ping".into(),
        );
        engine.mark_all_ready();

        // Hold the only slot, then ask the engine for a completion.
        let _held = bulkhead.try_acquire().unwrap();
        let res = engine.generate(None, "q", &GenerateOptions::default()).await;
        assert!(matches!(
            res,
            Err(ModelError::Resilience(aria_resilience::ResilienceError::BulkheadFull(_)))
        ));
    }

    #[tokio::test]
    async fn mid_stream_disconnect_surfaces_transport_error() {
        let primary = Arc::new(ScriptedBackend::new(
            "primary",
            vec![ScriptedCall::Events(vec![Ok(StreamEvent::TokenDelta("par".into()))])],
        ));
        let engine = engine_with_opts(vec![primary], false, String::new());
        let mut stream = engine.generate(None, "q", &GenerateOptions::default()).await.unwrap();
        assert!(matches!(
            stream.next().await.unwrap().unwrap(),
            StreamEvent::TokenDelta(_)
        ));
        assert!(matches!(
            stream.next().await.unwrap(),
            Err(ModelError::Transport(_))
        ));
        assert!(stream.next().await.is_none());
        assert_eq!(engine.metrics().failure, 1);
    }

    #[tokio::test]
    async fn tool_call_responses_are_not_cached() {
        let primary = Arc::new(ScriptedBackend::tool_then_text(
            "primary",
            "lookup",
            serde_json::json!({}),
            "final",
        ));
        let engine = engine_with(vec![Arc::clone(&primary)]);
        let opts = GenerateOptions::default();
        let _ = collect_text(engine.generate(None, "q", &opts).await.unwrap()).await;
        // Second call must reach the backend again (no cache entry was made).
        let _ = collect_text(engine.generate(None, "q", &opts).await.unwrap()).await;
        assert_eq!(primary.calls(), 2);
    }
}
