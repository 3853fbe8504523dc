// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod loader;
mod schema;

pub use loader::load;
pub use schema::{
    AuthConfig, BackendConfig, BreakerConfig, BulkheadConfig, CacheConfig, Config, EventConfig,
    ModelConfig, PrivacyMode, QuotaConfig, RateLimitConfig, RetentionConfig, RetentionPolicy,
    RetryConfig, ServerConfig, SessionConfig, StoreConfig, ToolConfig,
};
