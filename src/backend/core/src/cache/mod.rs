//! Caching layer for permission decisions.
//!
//! The cache is a read-through accelerator in front of the decision engine:
//!
//! - **Backend abstraction**: pluggable backends (in-memory, Redis)
//! - **Typed keys**: strongly-typed key construction with per-type TTLs
//! - **Invalidation**: key/pattern deletes driven by grant change events
//!
//! Nothing here is load-bearing for correctness. Every cache error must be
//! treated as a miss by callers, and invalidation failure only extends
//! staleness up to the entry TTL.

pub mod backend;
pub mod invalidation;

pub use backend::{
    CacheBackend, CacheEntry, CacheStats, InMemoryBackend, InMemoryConfig, RedisBackend,
    RedisConfig,
};
pub use invalidation::{
    spawn_change_listener, ChangeEvent, InvalidationEngine, InvalidationEvent,
    InvalidationStrategy,
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::error::{AegisError, AegisResult, ErrorCode};
use crate::models::UserId;

// ═══════════════════════════════════════════════════════════════════════════════
// Key Types
// ═══════════════════════════════════════════════════════════════════════════════

/// Cache key categories with their default TTLs.
///
/// Decision entries are deliberately short-lived: invalidation on grant
/// change is best-effort, so the TTL bounds how long a revoked grant can
/// keep answering from cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    /// Full check decisions.
    Decision,

    /// Resolved effective permission sets per (user, role).
    EffectivePermissions,

    /// The active policy set.
    Policy,
}

impl KeyType {
    pub fn default_ttl(&self) -> Duration {
        match self {
            Self::Decision => Duration::from_secs(300),
            Self::EffectivePermissions => Duration::from_secs(300),
            Self::Policy => Duration::from_secs(600),
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Decision => "decision",
            Self::EffectivePermissions => "perms",
            Self::Policy => "policy",
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.prefix())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cache Key
// ═══════════════════════════════════════════════════════════════════════════════

/// A typed cache key.
///
/// Keys render as `<prefix>:<segment>:...`; user-scoped keys always put the
/// user id in the first segment so `decision:<user>:*` style invalidation
/// patterns line up.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    key_type: KeyType,
    segments: Vec<String>,
    ttl: Option<Duration>,
}

impl CacheKey {
    pub fn new(key_type: KeyType) -> Self {
        Self {
            key_type,
            segments: Vec::new(),
            ttl: None,
        }
    }

    pub fn with_segment(mut self, segment: impl Into<String>) -> Self {
        self.segments.push(segment.into());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    /// TTL override, or the key type's default.
    pub fn ttl(&self) -> Duration {
        self.ttl.unwrap_or_else(|| self.key_type.default_ttl())
    }

    /// Render the key string.
    pub fn build(&self) -> String {
        let mut parts = Vec::with_capacity(self.segments.len() + 1);
        parts.push(self.key_type.prefix().to_string());
        parts.extend(self.segments.iter().cloned());
        parts.join(":")
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Convenience constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Key for one check decision: `decision:<user>:<request-hash>`.
    pub fn decision(user_id: &UserId, request_hash: impl Into<String>) -> Self {
        Self::new(KeyType::Decision)
            .with_segment(user_id.as_str())
            .with_segment(request_hash)
    }

    /// Key for a resolved permission set: `perms:<user>:<role>`.
    pub fn effective_permissions(user_id: &UserId, role_id: impl Into<String>) -> Self {
        Self::new(KeyType::EffectivePermissions)
            .with_segment(user_id.as_str())
            .with_segment(role_id)
    }

    /// Key for the active policy set: `policy:active`.
    pub fn active_policies() -> Self {
        Self::new(KeyType::Policy).with_segment("active")
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.build())
    }
}

/// Hash multiple values into a short hex token for use in cache keys.
pub fn hash_composite_key<I, T>(values: I) -> String
where
    I: IntoIterator<Item = T>,
    T: std::hash::Hash,
{
    use std::hash::{DefaultHasher, Hasher};
    let mut hasher = DefaultHasher::new();
    for value in values {
        value.hash(&mut hasher);
    }
    format!("{:016x}", hasher.finish())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cache Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// Facade-level cache settings. Key prefixing for shared stores lives in
/// [`RedisConfig::key_prefix`], not here, so invalidation patterns and data
/// keys always agree.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL used when a key carries no override and no type default applies.
    pub default_ttl: Duration,

    /// Maximum serialized entry size in bytes.
    pub max_entry_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            max_entry_size: 1024 * 1024,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cache facade
// ═══════════════════════════════════════════════════════════════════════════════

/// Unified cache API over a backend: serde encoding, typed keys, and
/// invalidation in one place.
pub struct Cache {
    backend: Arc<dyn CacheBackend>,
    config: CacheConfig,
    invalidation: Arc<InvalidationEngine>,
}

impl Cache {
    pub fn new(backend: Arc<dyn CacheBackend>, config: CacheConfig) -> Self {
        let invalidation = Arc::new(InvalidationEngine::new(backend.clone()));
        Self {
            backend,
            config,
            invalidation,
        }
    }

    /// In-memory cache with the given capacity.
    pub fn in_memory(max_capacity: u64) -> Self {
        let backend = Arc::new(InMemoryBackend::new(InMemoryConfig {
            max_capacity,
            ..Default::default()
        }));
        Self::new(backend, CacheConfig::default())
    }

    /// Redis-backed cache.
    pub async fn redis(url: &str) -> AegisResult<Self> {
        let backend = Arc::new(
            RedisBackend::new(RedisConfig {
                url: url.to_string(),
                ..Default::default()
            })
            .await?,
        );
        Ok(Self::new(backend, CacheConfig::default()))
    }

    /// Get a value.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> AegisResult<Option<T>> {
        let full_key = key.build();
        match self.backend.get(&full_key).await? {
            Some(entry) => {
                let value: T = serde_json::from_slice(&entry.data).map_err(|e| {
                    AegisError::with_internal(
                        ErrorCode::DeserializationError,
                        "Failed to deserialize cached value",
                        e.to_string(),
                    )
                })?;
                debug!(key = %full_key, "Cache hit");
                Ok(Some(value))
            }
            None => {
                debug!(key = %full_key, "Cache miss");
                Ok(None)
            }
        }
    }

    /// Set a value with the key's TTL.
    #[instrument(skip(self, value), fields(key = %key))]
    pub async fn set<T: Serialize>(&self, key: &CacheKey, value: &T) -> AegisResult<()> {
        self.set_with_ttl(key, value, key.ttl()).await
    }

    /// Set a value with an explicit TTL.
    #[instrument(skip(self, value), fields(key = %key, ttl_secs = ttl.as_secs()))]
    pub async fn set_with_ttl<T: Serialize>(
        &self,
        key: &CacheKey,
        value: &T,
        ttl: Duration,
    ) -> AegisResult<()> {
        let data = serde_json::to_vec(value).map_err(|e| {
            AegisError::with_internal(
                ErrorCode::SerializationError,
                "Failed to serialize value for cache",
                e.to_string(),
            )
        })?;

        if data.len() > self.config.max_entry_size {
            return Err(AegisError::new(
                ErrorCode::ValidationError,
                format!(
                    "Cache entry size {} exceeds maximum {}",
                    data.len(),
                    self.config.max_entry_size
                ),
            ));
        }

        self.backend
            .set(&key.build(), CacheEntry::new(data, Some(ttl)))
            .await
    }

    /// Delete a value.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn delete(&self, key: &CacheKey) -> AegisResult<bool> {
        self.backend.delete(&key.build()).await
    }

    /// Check if a key exists.
    pub async fn exists(&self, key: &CacheKey) -> AegisResult<bool> {
        self.backend.exists(&key.build()).await
    }

    /// Drop every entry tied to a user (decisions and permission sets).
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn invalidate_user(&self, user_id: &UserId) -> AegisResult<u64> {
        self.invalidation.invalidate_user(user_id).await
    }

    /// Publish a change event, invalidating what it implies.
    pub async fn publish_change(&self, event: ChangeEvent) -> AegisResult<u64> {
        self.invalidation.publish(event).await
    }

    /// Backend counters.
    pub async fn stats(&self) -> AegisResult<CacheStats> {
        self.backend.stats().await
    }

    /// Clear everything.
    #[instrument(skip(self))]
    pub async fn clear(&self) -> AegisResult<()> {
        info!("Clearing all cache entries");
        self.backend.clear().await
    }

    /// Access the invalidation engine directly.
    pub fn invalidation_engine(&self) -> Arc<InvalidationEngine> {
        self.invalidation.clone()
    }
}

impl Clone for Cache {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            config: self.config.clone(),
            invalidation: self.invalidation.clone(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
