// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::warn;

use aria_config::BulkheadConfig;

use crate::ResilienceError;

/// Bounded-concurrency gate for one class of operation.
///
/// Admission is a semaphore permit; the permit is released when the returned
/// [`BulkheadPermit`] drops, so holding it across the whole protected call is
/// both correct and mandatory.
pub struct Bulkhead {
    name: String,
    semaphore: Arc<Semaphore>,
    capacity: usize,
    wait_timeout: Duration,
}

/// RAII admission token.  Dropping it frees the slot.
pub struct BulkheadPermit {
    _permit: OwnedSemaphorePermit,
}

impl Bulkhead {
    pub fn new(name: impl Into<String>, capacity: usize, wait_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            wait_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Non-blocking admission.
    pub fn try_acquire(&self) -> Result<BulkheadPermit, ResilienceError> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => Ok(BulkheadPermit { _permit: permit }),
            Err(_) => Err(ResilienceError::BulkheadFull(self.name.clone())),
        }
    }

    /// Bounded-wait admission: waits up to the configured `wait_timeout` for
    /// a slot, then fails with `BulkheadFull`.
    pub async fn acquire(&self) -> Result<BulkheadPermit, ResilienceError> {
        let sem = Arc::clone(&self.semaphore);
        match tokio::time::timeout(self.wait_timeout, sem.acquire_owned()).await {
            Ok(Ok(permit)) => Ok(BulkheadPermit { _permit: permit }),
            // acquire_owned only errs when the semaphore is closed, which we
            // never do; treat it the same as a full bulkhead.
            Ok(Err(_)) | Err(_) => {
                warn!(bulkhead = %self.name, "admission wait timed out");
                Err(ResilienceError::BulkheadFull(self.name.clone()))
            }
        }
    }
}

/// Named bulkheads constructed once at startup.
pub struct BulkheadRegistry {
    bulkheads: HashMap<&'static str, Arc<Bulkhead>>,
}

impl BulkheadRegistry {
    pub fn new(cfg: &BulkheadConfig) -> Self {
        let wait = Duration::from_secs(cfg.wait_timeout_s);
        let mut bulkheads = HashMap::new();
        bulkheads.insert(
            crate::bulkheads::MODEL_INFERENCE,
            Arc::new(Bulkhead::new(
                crate::bulkheads::MODEL_INFERENCE,
                cfg.model_inference,
                wait,
            )),
        );
        bulkheads.insert(
            crate::bulkheads::SESSION_MANAGEMENT,
            Arc::new(Bulkhead::new(
                crate::bulkheads::SESSION_MANAGEMENT,
                cfg.session_management,
                wait,
            )),
        );
        bulkheads.insert(
            crate::bulkheads::TOOL_EXECUTION,
            Arc::new(Bulkhead::new(
                crate::bulkheads::TOOL_EXECUTION,
                cfg.tool_execution,
                wait,
            )),
        );
        bulkheads.insert(
            crate::bulkheads::VOICE_PROCESSING,
            Arc::new(Bulkhead::new(
                crate::bulkheads::VOICE_PROCESSING,
                cfg.voice_processing,
                wait,
            )),
        );
        Self { bulkheads }
    }

    /// Panics on an unknown name — the set is closed at compile time.
    pub fn get(&self, name: &str) -> Arc<Bulkhead> {
        Arc::clone(
            self.bulkheads
                .get(name)
                .unwrap_or_else(|| panic!("unknown bulkhead '{name}'")),
        )
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
