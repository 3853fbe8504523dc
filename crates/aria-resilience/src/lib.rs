// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Failure-isolation primitives shared by every externally-bound call path:
//! circuit breakers (fail fast on a misbehaving downstream), bulkheads
//! (bounded concurrency per operation class), retry with exponential backoff
//! and jitter, and deadline wrappers.
//!
//! These are plain structs composed imperatively by the callers; there is no
//! middleware stack.  State is process-local and lock-free on the hot path
//! (atomics); no primitive performs I/O of its own.

mod breaker;
mod bulkhead;
mod retry;
mod timeout;

use std::time::Duration;

pub use breaker::{BreakerRegistry, BreakerState, CircuitBreaker};
pub use bulkhead::{Bulkhead, BulkheadPermit, BulkheadRegistry};
pub use retry::RetryPolicy;
pub use timeout::with_timeout;

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ResilienceError {
    #[error("circuit breaker '{0}' is open")]
    CircuitOpen(String),

    #[error("bulkhead '{0}' is at capacity")]
    BulkheadFull(String),

    #[error("operation exceeded its deadline of {0:?}")]
    Timeout(Duration),
}

/// Breaker names wired at startup.  Every externally-bound subsystem guards
/// its calls with one of these.
pub mod breakers {
    pub const MODEL_INFERENCE: &str = "model_inference";
    pub const SESSION_CREATION: &str = "session_creation";
    pub const TOOL_EXECUTION: &str = "tool_execution";
    pub const MEMORY_READ: &str = "memory_read";
    pub const MEMORY_WRITE: &str = "memory_write";
    pub const VOICE_STT: &str = "voice_stt";
    pub const VOICE_TTS: &str = "voice_tts";

    pub const ALL: &[&str] = &[
        MODEL_INFERENCE,
        SESSION_CREATION,
        TOOL_EXECUTION,
        MEMORY_READ,
        MEMORY_WRITE,
        VOICE_STT,
        VOICE_TTS,
    ];
}

/// Bulkhead names wired at startup.
pub mod bulkheads {
    pub const MODEL_INFERENCE: &str = "model_inference";
    pub const SESSION_MANAGEMENT: &str = "session_management";
    pub const TOOL_EXECUTION: &str = "tool_execution";
    pub const VOICE_PROCESSING: &str = "voice_processing";
}
