// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use lru::LruCache;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use crate::types::GenerateOptions;

struct CacheEntry {
    text: String,
    stored_at: Instant,
}

/// Bounded cache of fully-realized completions.
///
/// Keyed by a digest over `model ‖ normalized prompt ‖ options`; bounded by
/// entry count (LRU eviction) and per-entry TTL.  Expired entries are not
/// normal hits but remain readable through [`get_stale`] for the outage
/// fallback path.
///
/// [`get_stale`]: ResponseCache::get_stale
pub struct ResponseCache {
    inner: Mutex<LruCache<String, CacheEntry>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResponseCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(max_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(cap)),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cache key for one `(model, prompt, options)` combination.
    pub fn key(model: &str, prompt: &str, options: &GenerateOptions) -> String {
        let mut hasher = Sha256::new();
        hasher.update(model.as_bytes());
        hasher.update([0u8]);
        hasher.update(normalize_prompt(prompt).as_bytes());
        hasher.update([0u8]);
        // GenerateOptions always serializes (plain optional scalars).
        hasher.update(serde_json::to_string(options).unwrap_or_default().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Fresh lookup.  Counts toward the hit rate.
    pub fn get(&self, key: &str) -> Option<String> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let hit = inner
            .get(key)
            .filter(|e| e.stored_at.elapsed() < self.ttl)
            .map(|e| e.text.clone());
        match &hit {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        hit
    }

    /// Lookup ignoring the TTL — last-resort fallback during an outage.
    /// Does not count toward the hit rate.
    pub fn get_stale(&self, key: &str) -> Option<String> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.get(key).map(|e| e.text.clone())
    }

    pub fn put(&self, key: String, text: String) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.put(
            key,
            CacheEntry {
                text,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    pub fn hit_rate(&self) -> f64 {
        let (hits, misses) = self.stats();
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// Collapse whitespace runs so trivially reformatted prompts share an entry.
fn normalize_prompt(prompt: &str) -> String {
    prompt.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
