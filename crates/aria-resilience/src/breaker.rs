// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use aria_config::BreakerConfig;

use crate::ResilienceError;

/// Observable state of a [`CircuitBreaker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls pass through; consecutive failures are counted.
    Closed,
    /// Calls fail fast until the cooldown elapses.
    Open,
    /// One probe call is in flight; its outcome decides the next state.
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Per-downstream failure isolation.
///
/// Transitions: `closed → open` after `threshold` consecutive failures;
/// `open → half_open` after `cooldown`, admitting exactly one probe;
/// probe success closes the breaker, probe failure reopens it.
///
/// Counters and state are atomics — `acquire` performs no I/O and never
/// blocks, so an open breaker rejects calls without touching the downstream.
pub struct CircuitBreaker {
    name: String,
    threshold: u32,
    cooldown: Duration,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    /// Milliseconds since `epoch` at which the breaker last opened.
    opened_at_ms: AtomicU64,
    /// Guards the single half-open probe slot.
    probe_in_flight: AtomicBool,
    epoch: Instant,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, threshold: u32, cooldown: Duration) -> Self {
        Self {
            name: name.into(),
            threshold: threshold.max(1),
            cooldown,
            state: AtomicU8::new(STATE_CLOSED),
            consecutive_failures: AtomicU32::new(0),
            opened_at_ms: AtomicU64::new(0),
            probe_in_flight: AtomicBool::new(false),
            epoch: Instant::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BreakerState {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => BreakerState::Open,
            STATE_HALF_OPEN => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Admission check.  Call before dispatching to the protected downstream;
    /// report the outcome with [`record_success`]/[`record_failure`].
    ///
    /// In `open` state the call is rejected until the cooldown elapses; the
    /// first caller after cooldown claims the half-open probe slot and is
    /// admitted, everyone else keeps getting `CircuitOpen` until the probe
    /// resolves.
    ///
    /// [`record_success`]: CircuitBreaker::record_success
    /// [`record_failure`]: CircuitBreaker::record_failure
    pub fn acquire(&self) -> Result<(), ResilienceError> {
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => Ok(()),
            STATE_HALF_OPEN => Err(ResilienceError::CircuitOpen(self.name.clone())),
            _ => {
                let opened = self.opened_at_ms.load(Ordering::Acquire);
                if self.now_ms().saturating_sub(opened) < self.cooldown.as_millis() as u64 {
                    return Err(ResilienceError::CircuitOpen(self.name.clone()));
                }
                // Cooldown elapsed: claim the single probe slot.
                if self
                    .probe_in_flight
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.state.store(STATE_HALF_OPEN, Ordering::Release);
                    info!(breaker = %self.name, "half-open probe admitted");
                    Ok(())
                } else {
                    Err(ResilienceError::CircuitOpen(self.name.clone()))
                }
            }
        }
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        let prev = self.state.swap(STATE_CLOSED, Ordering::AcqRel);
        self.probe_in_flight.store(false, Ordering::Release);
        if prev != STATE_CLOSED {
            info!(breaker = %self.name, "circuit closed");
        }
    }

    pub fn record_failure(&self) {
        let state = self.state.load(Ordering::Acquire);
        if state == STATE_HALF_OPEN {
            // Probe failed: reopen with a fresh cooldown window.
            self.opened_at_ms.store(self.now_ms(), Ordering::Release);
            self.state.store(STATE_OPEN, Ordering::Release);
            self.probe_in_flight.store(false, Ordering::Release);
            warn!(breaker = %self.name, "probe failed; circuit reopened");
            return;
        }
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= self.threshold && state == STATE_CLOSED {
            self.opened_at_ms.store(self.now_ms(), Ordering::Release);
            self.state.store(STATE_OPEN, Ordering::Release);
            warn!(breaker = %self.name, failures, "circuit opened");
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }
}

/// Named breakers constructed once at startup and shared by handle.
pub struct BreakerRegistry {
    breakers: HashMap<&'static str, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(cfg: &BreakerConfig) -> Self {
        let cooldown = Duration::from_secs(cfg.cooldown_s);
        let breakers = crate::breakers::ALL
            .iter()
            .map(|name| {
                (
                    *name,
                    Arc::new(CircuitBreaker::new(*name, cfg.threshold, cooldown)),
                )
            })
            .collect();
        Self { breakers }
    }

    /// Panics on an unknown name: breaker names are a closed compile-time set
    /// and a miss is a wiring bug, not a runtime condition.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        Arc::clone(
            self.breakers
                .get(name)
                .unwrap_or_else(|| panic!("unknown breaker '{name}'")),
        )
    }

    pub fn snapshot(&self) -> Vec<(String, BreakerState, u32)> {
        let mut out: Vec<_> = self
            .breakers
            .values()
            .map(|b| (b.name().to_string(), b.state(), b.consecutive_failures()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
