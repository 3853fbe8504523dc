// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so a named function is required for fields that should be
/// enabled unless explicitly disabled.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub ratelimit: RateLimitConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub bulkhead: BulkheadConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub event: EventConfig,
    #[serde(default)]
    pub tool: ToolConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

// ── Server / store ────────────────────────────────────────────────────────────

fn default_bind_addr() -> String {
    "0.0.0.0:8750".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address for the WebSocket endpoint.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Path to the bearer-token digest file.  `None` uses the default
    /// location under the user config directory.
    pub token_file: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            token_file: None,
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL for the session/quota/audit store.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
        }
    }
}

// ── Auth ──────────────────────────────────────────────────────────────────────

fn default_role_permissions() -> HashMap<String, Vec<String>> {
    let mut map = HashMap::new();
    map.insert(
        "admin".into(),
        vec![
            "ai:admin".into(),
            "ai:basic_chat".into(),
            "ai:voice".into(),
            "ai:family_management".into(),
            "ai:workspace".into(),
            "ai:commerce".into(),
        ],
    );
    map.insert(
        "member".into(),
        vec!["ai:basic_chat".into(), "ai:voice".into()],
    );
    map.insert(
        "family_owner".into(),
        vec!["ai:basic_chat".into(), "ai:family_management".into()],
    );
    map
}

/// Role → permission expansion used by the gate.
///
/// A user is granted an operation when the required tag appears in their
/// direct permission set **or** in the union of their roles' mapped sets.
///
/// ```yaml
/// auth:
///   role_permissions:
///     support:
///       - "ai:basic_chat"
///       - "ai:workspace"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_role_permissions")]
    pub role_permissions: HashMap<String, Vec<String>>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            role_permissions: default_role_permissions(),
        }
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

fn default_max_concurrent_per_user() -> u32 {
    5
}
fn default_idle_ttl_s() -> u64 {
    86_400
}
fn default_max_ttl_s() -> u64 {
    259_200
}
fn default_gc_interval_s() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Maximum number of simultaneously active sessions per user.
    #[serde(default = "default_max_concurrent_per_user")]
    pub max_concurrent_per_user: u32,
    /// Soft expiry: sessions idle longer than this are expired.
    #[serde(default = "default_idle_ttl_s")]
    pub idle_ttl_s: u64,
    /// Hard expiry: no session lives longer than this, regardless of activity.
    #[serde(default = "default_max_ttl_s")]
    pub max_ttl_s: u64,
    /// How often the background sweep terminates expired sessions.
    #[serde(default = "default_gc_interval_s")]
    pub gc_interval_s: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_per_user: default_max_concurrent_per_user(),
            idle_ttl_s: default_idle_ttl_s(),
            max_ttl_s: default_max_ttl_s(),
            gc_interval_s: default_gc_interval_s(),
        }
    }
}

// ── Quota / rate limit ────────────────────────────────────────────────────────

fn default_requests_per_hour() -> u64 {
    100
}
fn default_requests_per_day() -> u64 {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    #[serde(default = "default_requests_per_hour")]
    pub requests_per_hour: u64,
    #[serde(default = "default_requests_per_day")]
    pub requests_per_day: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            requests_per_hour: default_requests_per_hour(),
            requests_per_day: default_requests_per_day(),
        }
    }
}

fn default_per_minute() -> u64 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_per_minute")]
    pub per_minute: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_minute: default_per_minute(),
        }
    }
}

// ── Resilience ────────────────────────────────────────────────────────────────

fn default_breaker_threshold() -> u32 {
    5
}
fn default_breaker_cooldown_s() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before a breaker opens.
    #[serde(default = "default_breaker_threshold")]
    pub threshold: u32,
    /// Seconds an open breaker fails fast before allowing a probe call.
    #[serde(default = "default_breaker_cooldown_s")]
    pub cooldown_s: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: default_breaker_threshold(),
            cooldown_s: default_breaker_cooldown_s(),
        }
    }
}

fn default_bh_model_inference() -> usize {
    20
}
fn default_bh_session_management() -> usize {
    10
}
fn default_bh_tool_execution() -> usize {
    50
}
fn default_bh_voice_processing() -> usize {
    5
}
fn default_bh_wait_timeout_s() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkheadConfig {
    #[serde(default = "default_bh_model_inference")]
    pub model_inference: usize,
    #[serde(default = "default_bh_session_management")]
    pub session_management: usize,
    #[serde(default = "default_bh_tool_execution")]
    pub tool_execution: usize,
    #[serde(default = "default_bh_voice_processing")]
    pub voice_processing: usize,
    /// Seconds a caller waits for admission before failing with bulkhead-full.
    #[serde(default = "default_bh_wait_timeout_s")]
    pub wait_timeout_s: u64,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            model_inference: default_bh_model_inference(),
            session_management: default_bh_session_management(),
            tool_execution: default_bh_tool_execution(),
            voice_processing: default_bh_voice_processing(),
            wait_timeout_s: default_bh_wait_timeout_s(),
        }
    }
}

fn default_retry_max_attempts() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    1000
}
fn default_retry_multiplier() -> f64 {
    2.0
}
fn default_retry_jitter() -> f64 {
    0.2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_retry_multiplier")]
    pub multiplier: f64,
    /// Fractional jitter applied to every delay (0.2 = ±20%).
    #[serde(default = "default_retry_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_max_attempts(),
            base_delay_ms: default_retry_base_delay_ms(),
            multiplier: default_retry_multiplier(),
            jitter: default_retry_jitter(),
        }
    }
}

// ── Caching / events / tools ──────────────────────────────────────────────────

fn default_response_ttl_s() -> u64 {
    3600
}
fn default_cache_max_entries() -> usize {
    1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// How long a fully-realized model completion may be replayed from cache.
    #[serde(default = "default_response_ttl_s")]
    pub response_ttl_s: u64,
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            response_ttl_s: default_response_ttl_s(),
            max_entries: default_cache_max_entries(),
        }
    }
}

fn default_buffer_per_session() -> usize {
    256
}
fn default_subscriber_capacity() -> usize {
    128
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    /// Ring-buffer depth retained per session for reconnect replay.
    #[serde(default = "default_buffer_per_session")]
    pub buffer_per_session: usize,
    /// Outbound channel capacity per subscriber; slower subscribers lag.
    #[serde(default = "default_subscriber_capacity")]
    pub subscriber_capacity: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            buffer_per_session: default_buffer_per_session(),
            subscriber_capacity: default_subscriber_capacity(),
        }
    }
}

fn default_tool_timeout_s() -> u64 {
    30
}
fn default_max_parameter_bytes() -> usize {
    16_384
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Per-tool execution deadline unless the tool declares its own.
    #[serde(default = "default_tool_timeout_s")]
    pub default_timeout_s: u64,
    /// Serialized parameter payloads larger than this are rejected.
    #[serde(default = "default_max_parameter_bytes")]
    pub max_parameter_bytes: usize,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            default_timeout_s: default_tool_timeout_s(),
            max_parameter_bytes: default_max_parameter_bytes(),
        }
    }
}

// ── Model engine ──────────────────────────────────────────────────────────────

fn default_pool_size() -> usize {
    3
}

/// One inference backend endpoint.
///
/// ```yaml
/// model:
///   backends:
///     - name: primary
///       endpoint: http://127.0.0.1:9090
///       model: llama-3.1-8b
///     - name: secondary
///       endpoint: http://127.0.0.1:9091
///       model: llama-3.1-8b
///   chains:
///     default: [primary, secondary]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    pub endpoint: String,
    /// Model identifier forwarded in the request body.
    pub model: String,
    /// Number of pooled HTTP clients for this endpoint.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_degraded_message() -> String {
    "I'm temporarily unable to reach the assistant. Please try again in a moment.".into()
}
fn default_warmup_prompt() -> String {
    "ping".into()
}
fn default_request_timeout_s() -> u64 {
    60
}
fn default_chain_name() -> String {
    "default".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    /// Ordered fallback chains: logical model name → backend names, consulted
    /// left to right.  Runtime configuration only; nothing is hardcoded.
    #[serde(default)]
    pub chains: HashMap<String, Vec<String>>,
    /// Chain used when a request names no logical model.
    #[serde(default = "default_chain_name")]
    pub default_chain: String,
    /// Whether an expired cache entry may serve as the last fallback step
    /// when every backend in the chain is unavailable.
    #[serde(default = "default_true")]
    pub allow_stale_on_outage: bool,
    /// Canned response streamed when the whole fallback chain is exhausted.
    /// An empty string disables the canned step.
    #[serde(default = "default_degraded_message")]
    pub degraded_message: String,
    /// Short priming prompt dispatched to each pooled client at startup.
    #[serde(default = "default_warmup_prompt")]
    pub warmup_prompt: String,
    /// Per-call deadline for a backend request.
    #[serde(default = "default_request_timeout_s")]
    pub request_timeout_s: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            backends: Vec::new(),
            chains: HashMap::new(),
            default_chain: default_chain_name(),
            allow_stale_on_outage: true,
            degraded_message: default_degraded_message(),
            warmup_prompt: default_warmup_prompt(),
            request_timeout_s: default_request_timeout_s(),
        }
    }
}

// ── Privacy / retention ───────────────────────────────────────────────────────

/// Per-session conversation visibility and retention semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PrivacyMode {
    Public,
    #[default]
    Private,
    FamilyShared,
    Encrypted,
    Ephemeral,
}

impl std::fmt::Display for PrivacyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PrivacyMode::Public => "public",
            PrivacyMode::Private => "private",
            PrivacyMode::FamilyShared => "family_shared",
            PrivacyMode::Encrypted => "encrypted",
            PrivacyMode::Ephemeral => "ephemeral",
        };
        write!(f, "{s}")
    }
}

/// What happens to a conversation when its session ends or expires.
///
/// YAML forms: `until_session_end`, or `{ days: 90 }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Delete the conversation as soon as the session ends.
    UntilSessionEnd,
    /// Archive for the given number of days, then delete.
    Days(u32),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_retention_public")]
    pub public: RetentionPolicy,
    #[serde(default = "default_retention_private")]
    pub private: RetentionPolicy,
    #[serde(default = "default_retention_family_shared")]
    pub family_shared: RetentionPolicy,
    #[serde(default = "default_retention_encrypted")]
    pub encrypted: RetentionPolicy,
    #[serde(default = "default_retention_ephemeral")]
    pub ephemeral: RetentionPolicy,
}

fn default_retention_public() -> RetentionPolicy {
    RetentionPolicy::Days(365)
}
fn default_retention_private() -> RetentionPolicy {
    RetentionPolicy::Days(90)
}
fn default_retention_family_shared() -> RetentionPolicy {
    RetentionPolicy::Days(90)
}
fn default_retention_encrypted() -> RetentionPolicy {
    RetentionPolicy::Days(30)
}
fn default_retention_ephemeral() -> RetentionPolicy {
    RetentionPolicy::UntilSessionEnd
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            public: default_retention_public(),
            private: default_retention_private(),
            family_shared: default_retention_family_shared(),
            encrypted: default_retention_encrypted(),
            ephemeral: default_retention_ephemeral(),
        }
    }
}

impl RetentionConfig {
    pub fn policy_for(&self, mode: PrivacyMode) -> RetentionPolicy {
        match mode {
            PrivacyMode::Public => self.public,
            PrivacyMode::Private => self.private,
            PrivacyMode::FamilyShared => self.family_shared,
            PrivacyMode::Encrypted => self.encrypted,
            PrivacyMode::Ephemeral => self.ephemeral,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.session.max_concurrent_per_user, 5);
        assert_eq!(cfg.session.idle_ttl_s, 86_400);
        assert_eq!(cfg.session.max_ttl_s, 259_200);
        assert_eq!(cfg.quota.requests_per_hour, 100);
        assert_eq!(cfg.quota.requests_per_day, 1000);
        assert_eq!(cfg.ratelimit.per_minute, 100);
        assert_eq!(cfg.breaker.threshold, 5);
        assert_eq!(cfg.breaker.cooldown_s, 60);
        assert_eq!(cfg.bulkhead.model_inference, 20);
        assert_eq!(cfg.bulkhead.session_management, 10);
        assert_eq!(cfg.bulkhead.tool_execution, 50);
        assert_eq!(cfg.bulkhead.voice_processing, 5);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.cache.response_ttl_s, 3600);
        assert_eq!(cfg.event.buffer_per_session, 256);
        assert_eq!(cfg.tool.default_timeout_s, 30);
    }

    #[test]
    fn partial_yaml_fills_in_defaults() {
        let cfg: Config = serde_yaml::from_str("quota:\n  requests_per_hour: 10\n").unwrap();
        assert_eq!(cfg.quota.requests_per_hour, 10);
        assert_eq!(cfg.quota.requests_per_day, 1000);
        assert_eq!(cfg.session.idle_ttl_s, 86_400);
    }

    #[test]
    fn backend_config_parses_with_default_pool_size() {
        let yaml = "backends:\n  - name: primary\n    endpoint: http://localhost:9090\n    model: m\n";
        let cfg: ModelConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.backends.len(), 1);
        assert_eq!(cfg.backends[0].pool_size, 3);
    }

    #[test]
    fn retention_policy_yaml_forms() {
        let p: RetentionPolicy = serde_yaml::from_str("until_session_end").unwrap();
        assert_eq!(p, RetentionPolicy::UntilSessionEnd);
        let p: RetentionPolicy = serde_yaml::from_str("days: 30").unwrap();
        assert_eq!(p, RetentionPolicy::Days(30));
    }

    #[test]
    fn retention_lookup_per_mode() {
        let r = RetentionConfig::default();
        assert_eq!(
            r.policy_for(PrivacyMode::Ephemeral),
            RetentionPolicy::UntilSessionEnd
        );
        assert_eq!(r.policy_for(PrivacyMode::Private), RetentionPolicy::Days(90));
    }

    #[test]
    fn privacy_mode_serializes_snake_case() {
        let s = serde_json::to_string(&PrivacyMode::FamilyShared).unwrap();
        assert_eq!(s, "\"family_shared\"");
    }

    #[test]
    fn admin_role_maps_to_admin_permission() {
        let auth = AuthConfig::default();
        let perms = auth.role_permissions.get("admin").unwrap();
        assert!(perms.iter().any(|p| p == "ai:admin"));
    }
}
