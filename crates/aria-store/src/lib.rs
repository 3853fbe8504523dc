// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Cache/persistence contract backing sessions, quotas, rate limits,
//! conversations, and the audit log.
//!
//! The [`Store`] trait is the seam: production uses [`RedisStore`], tests use
//! [`MemoryStore`].  Values are opaque strings (callers serialize with
//! serde_json); keys follow the fixed shapes in [`keys`].

mod memory;
mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Set a value; `ttl = None` means no expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Reset the expiry of an existing key.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Atomic increment.  When the counter is created by this call its expiry
    /// is set to `expire_in`; an existing counter's expiry is left untouched,
    /// which is what anchors windowed counters to their window end.
    async fn incr_with_expiry(&self, key: &str, expire_in: Duration) -> Result<i64, StoreError>;

    /// Current counter value; missing key reads as 0.
    async fn get_counter(&self, key: &str) -> Result<i64, StoreError>;

    /// Atomic compare-and-swap.  `expected = None` means "create only if
    /// absent".  Returns whether the swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    /// Prepend to a list and trim it to at most `cap` entries (newest first).
    async fn list_push_capped(
        &self,
        key: &str,
        value: &str,
        cap: usize,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    /// Inclusive range read with redis index semantics (negatives count from
    /// the end; `0, -1` reads the whole list).
    async fn list_range(&self, key: &str, start: isize, stop: isize)
        -> Result<Vec<String>, StoreError>;

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError>;

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// All keys beginning with `prefix`.  Used by the session sweeper only;
    /// not a hot path.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// Key shapes.  Every cross-component reference goes through these builders
/// so the shapes exist in exactly one place.
pub mod keys {
    pub fn session(session_id: &str) -> String {
        format!("ai:session:{session_id}")
    }

    pub const SESSION_PREFIX: &str = "ai:session:";

    pub fn session_index(user_id: &str) -> String {
        format!("ai:session:index:{user_id}")
    }

    pub fn conversation(conversation_id: &str) -> String {
        format!("ai:conv:{conversation_id}")
    }

    pub fn quota_hourly(user_id: &str) -> String {
        format!("ai:quota:hourly:{user_id}")
    }

    pub fn quota_daily(user_id: &str) -> String {
        format!("ai:quota:daily:{user_id}")
    }

    pub fn ratelimit(user_id: &str, window: i64) -> String {
        format!("ai:ratelimit:{user_id}:{window}")
    }

    pub fn breaker(name: &str) -> String {
        format!("ai:breaker:{name}")
    }

    /// `date` is a `YYYY-MM-DD` day stamp.
    pub fn audit(date: &str) -> String {
        format!("ai:audit:{date}")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::keys;

    #[test]
    fn key_shapes_are_stable() {
        assert_eq!(keys::session("abc"), "ai:session:abc");
        assert_eq!(keys::session_index("u1"), "ai:session:index:u1");
        assert_eq!(keys::conversation("c1"), "ai:conv:c1");
        assert_eq!(keys::quota_hourly("u1"), "ai:quota:hourly:u1");
        assert_eq!(keys::quota_daily("u1"), "ai:quota:daily:u1");
        assert_eq!(keys::ratelimit("u1", 42), "ai:ratelimit:u1:42");
        assert_eq!(keys::breaker("model_inference"), "ai:breaker:model_inference");
        assert_eq!(keys::audit("2026-08-01"), "ai:audit:2026-08-01");
    }

    #[test]
    fn session_keys_share_the_scan_prefix() {
        assert!(keys::session("x").starts_with(keys::SESSION_PREFIX));
        assert!(keys::session_index("u").starts_with(keys::SESSION_PREFIX));
    }
}
