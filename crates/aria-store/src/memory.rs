// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::{Store, StoreError};

#[derive(Debug, Clone)]
enum Value {
    Scalar(String),
    Counter(i64),
    List(VecDeque<String>),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|t| now >= t)
    }
}

/// In-process [`Store`] for tests.  Expiries use the tokio clock so paused-
/// clock tests (`start_paused`) can advance time deterministically.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn deadline(ttl: Option<Duration>) -> Option<Instant> {
        ttl.map(|d| Instant::now() + d)
    }
}

/// Fetch a live (non-expired) entry, dropping it when stale.
fn live<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
) -> Option<&'a mut Entry> {
    let now = Instant::now();
    if entries.get(key).is_some_and(|e| e.expired(now)) {
        entries.remove(key);
        return None;
    }
    entries.get_mut(key)
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut entries = self.entries.lock().await;
        Ok(live(&mut entries, key).and_then(|e| match &e.value {
            Value::Scalar(s) => Some(s.clone()),
            Value::Counter(n) => Some(n.to_string()),
            _ => None,
        }))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Scalar(value.to_string()),
                expires_at: Self::deadline(ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        if let Some(e) = live(&mut entries, key) {
            e.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn incr_with_expiry(&self, key: &str, expire_in: Duration) -> Result<i64, StoreError> {
        let mut entries = self.entries.lock().await;
        if let Some(e) = live(&mut entries, key) {
            return match &mut e.value {
                Value::Counter(n) => {
                    *n += 1;
                    Ok(*n)
                }
                _ => Err(StoreError::Backend(format!("key '{key}' is not a counter"))),
            };
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Counter(1),
                expires_at: Some(Instant::now() + expire_in),
            },
        );
        Ok(1)
    }

    async fn get_counter(&self, key: &str) -> Result<i64, StoreError> {
        let mut entries = self.entries.lock().await;
        match live(&mut entries, key) {
            Some(e) => match &e.value {
                Value::Counter(n) => Ok(*n),
                Value::Scalar(s) => s
                    .parse()
                    .map_err(|_| StoreError::Backend(format!("key '{key}' is not numeric"))),
                _ => Err(StoreError::Backend(format!("key '{key}' is not a counter"))),
            },
            None => Ok(0),
        }
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock().await;
        let current = live(&mut entries, key).and_then(|e| match &e.value {
            Value::Scalar(s) => Some(s.clone()),
            _ => None,
        });
        let matches = match (expected, &current) {
            (None, None) => true,
            (Some(exp), Some(cur)) => exp == cur,
            _ => false,
        };
        if matches {
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Scalar(new.to_string()),
                    expires_at: Self::deadline(ttl),
                },
            );
        }
        Ok(matches)
    }

    async fn list_push_capped(
        &self,
        key: &str,
        value: &str,
        cap: usize,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        let deadline = Self::deadline(ttl);
        if let Some(e) = live(&mut entries, key) {
            let Value::List(list) = &mut e.value else {
                return Err(StoreError::Backend(format!("key '{key}' is not a list")));
            };
            list.push_front(value.to_string());
            list.truncate(cap);
            if deadline.is_some() {
                e.expires_at = deadline;
            }
            return Ok(());
        }
        let mut list = VecDeque::new();
        list.push_front(value.to_string());
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::List(list),
                expires_at: deadline,
            },
        );
        Ok(())
    }

    async fn list_range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        let mut entries = self.entries.lock().await;
        let Some(e) = live(&mut entries, key) else {
            return Ok(Vec::new());
        };
        let Value::List(list) = &e.value else {
            return Err(StoreError::Backend(format!("key '{key}' is not a list")));
        };
        let len = list.len() as isize;
        let norm = |i: isize| -> isize {
            if i < 0 {
                (len + i).max(0)
            } else {
                i
            }
        };
        let (start, stop) = (norm(start), norm(stop).min(len - 1));
        if len == 0 || start > stop {
            return Ok(Vec::new());
        }
        Ok(list
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        if let Some(e) = live(&mut entries, key) {
            let Value::Set(set) = &mut e.value else {
                return Err(StoreError::Backend(format!("key '{key}' is not a set")));
            };
            set.insert(member.to_string());
            return Ok(());
        }
        let mut set = HashSet::new();
        set.insert(member.to_string());
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Set(set),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        if let Some(e) = live(&mut entries, key) {
            if let Value::Set(set) = &mut e.value {
                set.remove(member);
            }
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut entries = self.entries.lock().await;
        match live(&mut entries, key) {
            Some(e) => match &e.value {
                Value::Set(set) => {
                    let mut members: Vec<String> = set.iter().cloned().collect();
                    members.sort();
                    Ok(members)
                }
                _ => Err(StoreError::Backend(format!("key '{key}' is not a set"))),
            },
            None => Ok(Vec::new()),
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        let mut out: Vec<String> = entries
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && !e.expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        out.sort();
        Ok(out)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_round_trip() {
        let s = MemoryStore::new();
        s.set("k", "v", None).await.unwrap();
        assert_eq!(s.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn get_missing_returns_none() {
        let s = MemoryStore::new();
        assert!(s.get("nope").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_value_reads_as_missing() {
        let s = MemoryStore::new();
        s.set("k", "v", Some(Duration::from_secs(10))).await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(s.get("k").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn counter_increments_and_expires() {
        let s = MemoryStore::new();
        assert_eq!(s.incr_with_expiry("c", Duration::from_secs(60)).await.unwrap(), 1);
        assert_eq!(s.incr_with_expiry("c", Duration::from_secs(60)).await.unwrap(), 2);
        assert_eq!(s.get_counter("c").await.unwrap(), 2);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(s.get_counter("c").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn counter_expiry_is_anchored_to_creation() {
        let s = MemoryStore::new();
        s.incr_with_expiry("c", Duration::from_secs(60)).await.unwrap();
        tokio::time::advance(Duration::from_secs(50)).await;
        // A later increment must NOT push the expiry out.
        s.incr_with_expiry("c", Duration::from_secs(60)).await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(s.get_counter("c").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cas_create_if_absent() {
        let s = MemoryStore::new();
        assert!(s.compare_and_swap("k", None, "a", None).await.unwrap());
        assert!(!s.compare_and_swap("k", None, "b", None).await.unwrap());
        assert_eq!(s.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn cas_swaps_only_on_match() {
        let s = MemoryStore::new();
        s.set("k", "a", None).await.unwrap();
        assert!(!s.compare_and_swap("k", Some("x"), "b", None).await.unwrap());
        assert!(s.compare_and_swap("k", Some("a"), "b", None).await.unwrap());
        assert_eq!(s.get("k").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn list_push_is_newest_first_and_capped() {
        let s = MemoryStore::new();
        for i in 0..5 {
            s.list_push_capped("l", &i.to_string(), 3, None).await.unwrap();
        }
        let items = s.list_range("l", 0, -1).await.unwrap();
        assert_eq!(items, vec!["4", "3", "2"]);
    }

    #[tokio::test]
    async fn list_range_negative_indices() {
        let s = MemoryStore::new();
        for i in 0..4 {
            s.list_push_capped("l", &i.to_string(), 10, None).await.unwrap();
        }
        // List is [3, 2, 1, 0]; last two entries:
        let items = s.list_range("l", -2, -1).await.unwrap();
        assert_eq!(items, vec!["1", "0"]);
    }

    #[tokio::test]
    async fn set_membership_round_trip() {
        let s = MemoryStore::new();
        s.set_add("s", "a").await.unwrap();
        s.set_add("s", "b").await.unwrap();
        s.set_add("s", "a").await.unwrap();
        assert_eq!(s.set_members("s").await.unwrap(), vec!["a", "b"]);
        s.set_remove("s", "a").await.unwrap();
        assert_eq!(s.set_members("s").await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn scan_prefix_filters_keys() {
        let s = MemoryStore::new();
        s.set("ai:session:1", "x", None).await.unwrap();
        s.set("ai:session:2", "y", None).await.unwrap();
        s.set("ai:quota:hourly:u", "z", None).await.unwrap();
        let keys = s.scan_prefix("ai:session:").await.unwrap();
        assert_eq!(keys, vec!["ai:session:1", "ai:session:2"]);
    }
}
