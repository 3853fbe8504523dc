// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::debug;

use crate::{Store, StoreError};

/// Redis-backed [`Store`].
///
/// Uses a multiplexed connection (cheap to clone, pipelined internally).
/// Counter anchoring and compare-and-swap are Lua scripts so they stay atomic
/// without WATCH/MULTI round-trips.
pub struct RedisStore {
    conn: MultiplexedConnection,
    incr_script: redis::Script,
    cas_script: redis::Script,
}

fn backend(e: redis::RedisError) -> StoreError {
    StoreError::Backend(e.to_string())
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(backend)?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(backend)?;
        debug!(url, "connected to redis");
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: MultiplexedConnection) -> Self {
        // INCR, anchoring the expiry only when this call created the counter.
        let incr_script = redis::Script::new(
            r#"
            local v = redis.call('INCR', KEYS[1])
            if v == 1 then
                redis.call('EXPIRE', KEYS[1], ARGV[1])
            end
            return v
            "#,
        );
        // CAS with optional create-only semantics and optional TTL.
        // ARGV: has_expected ('0'/'1'), expected, new, ttl_secs ('0' = none)
        let cas_script = redis::Script::new(
            r#"
            local cur = redis.call('GET', KEYS[1])
            local ok
            if ARGV[1] == '0' then
                ok = not cur
            else
                ok = (cur == ARGV[2])
            end
            if ok then
                if ARGV[4] == '0' then
                    redis.call('SET', KEYS[1], ARGV[3])
                else
                    redis.call('SET', KEYS[1], ARGV[3], 'EX', ARGV[4])
                end
                return 1
            end
            return 0
            "#,
        );
        Self {
            conn,
            incr_script,
            cas_script,
        }
    }

    fn connection(&self) -> MultiplexedConnection {
        self.conn.clone()
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection();
        conn.get(key).await.map_err(backend)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.connection();
        match ttl {
            Some(d) => conn
                .set_ex(key, value, d.as_secs().max(1))
                .await
                .map_err(backend),
            None => conn.set(key, value).await.map_err(backend),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection();
        let _: () = conn.del(key).await.map_err(backend)?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection();
        let _: bool = conn
            .expire(key, ttl.as_secs().max(1) as i64)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn incr_with_expiry(&self, key: &str, expire_in: Duration) -> Result<i64, StoreError> {
        let mut conn = self.connection();
        self.incr_script
            .key(key)
            .arg(expire_in.as_secs().max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(backend)
    }

    async fn get_counter(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.connection();
        let v: Option<i64> = conn.get(key).await.map_err(backend)?;
        Ok(v.unwrap_or(0))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection();
        let result: i64 = self
            .cas_script
            .key(key)
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.unwrap_or(""))
            .arg(new)
            .arg(ttl.map(|d| d.as_secs().max(1)).unwrap_or(0))
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(result == 1)
    }

    async fn list_push_capped(
        &self,
        key: &str,
        value: &str,
        cap: usize,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .lpush(key, value)
            .ignore()
            .ltrim(key, 0, cap.saturating_sub(1) as isize)
            .ignore();
        if let Some(d) = ttl {
            pipe.expire(key, d.as_secs().max(1) as i64).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await.map_err(backend)?;
        Ok(())
    }

    async fn list_range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection();
        conn.lrange(key, start, stop).await.map_err(backend)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.connection();
        let _: () = conn.sadd(key, member).await.map_err(backend)?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.connection();
        let _: () = conn.srem(key, member).await.map_err(backend)?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection();
        let mut members: Vec<String> = conn.smembers(key).await.map_err(backend)?;
        members.sort();
        Ok(members)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection();
        let pattern = format!("{prefix}*");
        let mut keys = Vec::new();
        let mut iter: redis::AsyncIter<'_, String> =
            conn.scan_match(&pattern).await.map_err(backend)?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        keys.sort();
        Ok(keys)
    }
}
