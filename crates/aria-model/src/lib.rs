// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod backend;
mod cache;
mod engine;
mod mock;
mod pool;
mod types;

pub use backend::{HttpBackend, InferenceBackend};
pub use cache::ResponseCache;
pub use engine::{EngineMetrics, ModelEngine};
pub use mock::{MockBackend, ScriptedBackend, ScriptedCall};
pub use pool::{BackendPool, ClientMetrics, ClientState, PooledClient};
pub use types::{GenerateOptions, GenerateRequest, ModelError, StreamEvent, TokenStream};
