//! Cache backend implementations.
//!
//! Two pluggable backends sit behind [`CacheBackend`]:
//! - **InMemoryBackend**: dashmap-based, capacity-bounded, for single-node
//!   deployments and tests
//! - **RedisBackend**: distributed cache for multi-node deployments
//!
//! The cache is an accelerator only: callers must treat every error as a
//! miss and never let a cache failure change a decision.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::{counter, gauge, histogram};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{AegisError, AegisResult, ErrorCode};
use crate::cache::invalidation::glob_to_regex;

// ═══════════════════════════════════════════════════════════════════════════════
// Cache Entry
// ═══════════════════════════════════════════════════════════════════════════════

/// A cached value with its expiry metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Serialized payload (serde_json bytes).
    pub data: Vec<u8>,

    /// Time-to-live; `None` means no expiry.
    #[serde(with = "duration_serde")]
    pub ttl: Option<Duration>,

    /// When this entry was written.
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(data: Vec<u8>, ttl: Option<Duration>) -> Self {
        Self {
            data,
            ttl,
            created_at: Utc::now(),
        }
    }

    /// Check if the entry has outlived its TTL.
    pub fn is_expired(&self) -> bool {
        match self.ttl {
            Some(ttl) => {
                let elapsed = Utc::now()
                    .signed_duration_since(self.created_at)
                    .to_std()
                    .unwrap_or(Duration::MAX);
                elapsed >= ttl
            }
            None => false,
        }
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => d.as_secs().serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs: Option<u64> = Option::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cache Statistics
// ═══════════════════════════════════════════════════════════════════════════════

/// Counters exposed by a backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
    pub evictions: u64,
    /// Hit rate (0.0 - 1.0).
    pub hit_rate: f64,
    /// Backend-specific details.
    pub backend_stats: HashMap<String, String>,
}

impl CacheStats {
    pub fn calculate_hit_rate(&mut self) {
        let total = self.hits + self.misses;
        self.hit_rate = if total > 0 {
            self.hits as f64 / total as f64
        } else {
            0.0
        };
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cache Backend Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Pluggable cache storage. Patterns use glob syntax (`*` wildcard), the
/// same syntax Redis MATCH understands.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Get a value; expired entries read as `None`.
    async fn get(&self, key: &str) -> AegisResult<Option<CacheEntry>>;

    /// Set a value.
    async fn set(&self, key: &str, entry: CacheEntry) -> AegisResult<()>;

    /// Delete a value. Returns whether a value was present.
    async fn delete(&self, key: &str) -> AegisResult<bool>;

    /// Check if a key exists and is not expired.
    async fn exists(&self, key: &str) -> AegisResult<bool>;

    /// Delete all keys matching a glob pattern. Returns the deleted count.
    async fn delete_by_pattern(&self, pattern: &str) -> AegisResult<u64>;

    /// Clear all entries.
    async fn clear(&self) -> AegisResult<()>;

    /// Get backend counters.
    async fn stats(&self) -> AegisResult<CacheStats>;

    /// Backend name for logging and metrics labels.
    fn name(&self) -> &'static str;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Backend
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for the in-memory backend.
#[derive(Debug, Clone)]
pub struct InMemoryConfig {
    /// Maximum number of entries before eviction kicks in.
    pub max_capacity: u64,

    /// Shard count for concurrent access (power of 2).
    pub shard_count: usize,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            max_capacity: 10_000,
            shard_count: 16,
        }
    }
}

/// Dashmap-backed cache for single-node use.
pub struct InMemoryBackend {
    entries: DashMap<String, CacheEntry>,
    config: InMemoryConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl InMemoryBackend {
    pub fn new(config: InMemoryConfig) -> Self {
        Self {
            entries: DashMap::with_shard_amount(config.shard_count),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Evict when over capacity: expired entries first, then oldest writes.
    fn maybe_evict(&self) {
        if (self.entries.len() as u64) < self.config.max_capacity {
            return;
        }

        let mut expired: Vec<String> = Vec::new();
        for entry in self.entries.iter() {
            if entry.value().is_expired() {
                expired.push(entry.key().clone());
            }
        }
        let mut evicted = 0u64;
        for key in expired {
            if self.entries.remove(&key).is_some() {
                evicted += 1;
            }
        }

        if (self.entries.len() as u64) >= self.config.max_capacity {
            let to_evict = (self.config.max_capacity / 10).max(1) as usize;
            let mut oldest: Vec<(String, DateTime<Utc>)> = self
                .entries
                .iter()
                .map(|e| (e.key().clone(), e.value().created_at))
                .collect();
            oldest.sort_by_key(|(_, created)| *created);
            for (key, _) in oldest.into_iter().take(to_evict) {
                if self.entries.remove(&key).is_some() {
                    evicted += 1;
                }
            }
        }

        if evicted > 0 {
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
            debug!(evicted, "Evicted cache entries");
        }
    }
}

#[async_trait]
impl CacheBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> AegisResult<Option<CacheEntry>> {
        if let Some(entry) = self.entries.get(key) {
            if entry.is_expired() {
                drop(entry);
                self.entries.remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                counter!("aegis_cache_misses_total", "backend" => "in_memory", "reason" => "expired")
                    .increment(1);
                return Ok(None);
            }
            let result = entry.clone();
            self.hits.fetch_add(1, Ordering::Relaxed);
            counter!("aegis_cache_hits_total", "backend" => "in_memory").increment(1);
            Ok(Some(result))
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            counter!("aegis_cache_misses_total", "backend" => "in_memory", "reason" => "not_found")
                .increment(1);
            Ok(None)
        }
    }

    async fn set(&self, key: &str, entry: CacheEntry) -> AegisResult<()> {
        self.maybe_evict();

        let size = entry.data.len();
        self.entries.insert(key.to_string(), entry);

        counter!("aegis_cache_sets_total", "backend" => "in_memory").increment(1);
        histogram!("aegis_cache_entry_size_bytes", "backend" => "in_memory").record(size as f64);
        Ok(())
    }

    async fn delete(&self, key: &str) -> AegisResult<bool> {
        let deleted = self.entries.remove(key).is_some();
        if deleted {
            counter!("aegis_cache_deletes_total", "backend" => "in_memory").increment(1);
        }
        Ok(deleted)
    }

    async fn exists(&self, key: &str) -> AegisResult<bool> {
        Ok(self
            .entries
            .get(key)
            .map(|e| !e.is_expired())
            .unwrap_or(false))
    }

    async fn delete_by_pattern(&self, pattern: &str) -> AegisResult<u64> {
        let regex = glob_to_regex(pattern).map_err(|e| {
            AegisError::new(
                ErrorCode::ValidationError,
                format!("Invalid cache pattern: {}", e),
            )
        })?;

        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| regex.is_match(e.key()))
            .map(|e| e.key().clone())
            .collect();

        let mut deleted = 0;
        for key in keys {
            if self.entries.remove(&key).is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn clear(&self) -> AegisResult<()> {
        self.entries.clear();
        counter!("aegis_cache_clears_total", "backend" => "in_memory").increment(1);
        Ok(())
    }

    async fn stats(&self) -> AegisResult<CacheStats> {
        let entries = self.entries.len() as u64;
        let mut stats = CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries,
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate: 0.0,
            backend_stats: HashMap::new(),
        };
        stats.calculate_hit_rate();
        stats.backend_stats.insert(
            "max_capacity".to_string(),
            self.config.max_capacity.to_string(),
        );

        gauge!("aegis_cache_entries", "backend" => "in_memory").set(entries as f64);
        gauge!("aegis_cache_hit_rate", "backend" => "in_memory").set(stats.hit_rate);
        Ok(stats)
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Redis Backend
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for the Redis backend.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    /// Prefix prepended to every key.
    pub key_prefix: String,
    /// TTL applied when an entry carries none.
    pub default_ttl: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "aegis:".to_string(),
            default_ttl: Duration::from_secs(300),
        }
    }
}

/// Redis-backed cache for multi-node deployments.
pub struct RedisBackend {
    client: redis::Client,
    config: RedisConfig,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl RedisBackend {
    /// Create and ping the Redis backend.
    pub async fn new(config: RedisConfig) -> AegisResult<Self> {
        let client = redis::Client::open(config.url.as_str()).map_err(|e| {
            AegisError::with_internal(
                ErrorCode::CacheConnectionFailed,
                "Failed to create Redis client",
                e.to_string(),
            )
        })?;

        let mut conn = client.get_multiplexed_async_connection().await.map_err(|e| {
            AegisError::with_internal(
                ErrorCode::CacheConnectionFailed,
                "Failed to connect to Redis",
                e.to_string(),
            )
        })?;

        let _: String = redis::cmd("PING").query_async(&mut conn).await.map_err(|e| {
            AegisError::with_internal(
                ErrorCode::CacheConnectionFailed,
                "Redis ping failed",
                e.to_string(),
            )
        })?;

        info!(url = %config.url, "Redis cache backend connected");

        Ok(Self {
            client,
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    async fn get_conn(&self) -> AegisResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                AegisError::with_internal(
                    ErrorCode::CacheConnectionFailed,
                    "Failed to get Redis connection",
                    e.to_string(),
                )
            })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> AegisResult<Option<CacheEntry>> {
        let mut conn = self.get_conn().await?;
        let data: Option<Vec<u8>> = conn
            .get(self.full_key(key))
            .await
            .map_err(AegisError::from)?;

        match data {
            Some(bytes) => {
                let entry: CacheEntry = serde_json::from_slice(&bytes).map_err(AegisError::from)?;
                self.hits.fetch_add(1, Ordering::Relaxed);
                counter!("aegis_cache_hits_total", "backend" => "redis").increment(1);
                Ok(Some(entry))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                counter!("aegis_cache_misses_total", "backend" => "redis", "reason" => "not_found")
                    .increment(1);
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, entry: CacheEntry) -> AegisResult<()> {
        let mut conn = self.get_conn().await?;
        let data = serde_json::to_vec(&entry).map_err(AegisError::from)?;
        let ttl_secs = entry.ttl.unwrap_or(self.config.default_ttl).as_secs();

        conn.set_ex::<_, _, ()>(self.full_key(key), &data, ttl_secs)
            .await
            .map_err(AegisError::from)?;

        counter!("aegis_cache_sets_total", "backend" => "redis").increment(1);
        histogram!("aegis_cache_entry_size_bytes", "backend" => "redis").record(data.len() as f64);
        Ok(())
    }

    async fn delete(&self, key: &str) -> AegisResult<bool> {
        let mut conn = self.get_conn().await?;
        let deleted: i64 = conn
            .del(self.full_key(key))
            .await
            .map_err(AegisError::from)?;

        if deleted > 0 {
            counter!("aegis_cache_deletes_total", "backend" => "redis").increment(1);
        }
        Ok(deleted > 0)
    }

    async fn exists(&self, key: &str) -> AegisResult<bool> {
        let mut conn = self.get_conn().await?;
        conn.exists(self.full_key(key))
            .await
            .map_err(AegisError::from)
    }

    async fn delete_by_pattern(&self, pattern: &str) -> AegisResult<u64> {
        let mut conn = self.get_conn().await?;
        let full_pattern = format!("{}{}", self.config.key_prefix, pattern);
        let mut cursor: u64 = 0;
        let mut total_deleted = 0u64;

        loop {
            let (new_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&full_pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(AegisError::from)?;

            if !keys.is_empty() {
                let deleted: i64 = conn.del(&keys).await.map_err(AegisError::from)?;
                total_deleted += deleted as u64;
            }

            cursor = new_cursor;
            if cursor == 0 {
                break;
            }
        }

        Ok(total_deleted)
    }

    async fn clear(&self) -> AegisResult<()> {
        let deleted = self.delete_by_pattern("*").await?;
        info!(deleted, "Cleared Redis cache entries");
        counter!("aegis_cache_clears_total", "backend" => "redis").increment(1);
        Ok(())
    }

    async fn stats(&self) -> AegisResult<CacheStats> {
        let mut conn = self.get_conn().await?;

        let dbsize: u64 = redis::cmd("DBSIZE")
            .query_async(&mut conn)
            .await
            .map_err(AegisError::from)?;

        let mut stats = CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: dbsize,
            evictions: 0,
            hit_rate: 0.0,
            backend_stats: HashMap::new(),
        };
        stats.calculate_hit_rate();

        gauge!("aegis_cache_entries", "backend" => "redis").set(dbsize as f64);
        gauge!("aegis_cache_hit_rate", "backend" => "redis").set(stats.hit_rate);
        Ok(stats)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(data: &[u8], ttl: Option<Duration>) -> CacheEntry {
        CacheEntry::new(data.to_vec(), ttl)
    }

    #[test]
    fn test_cache_entry_expiration() {
        let mut e = entry(&[1, 2, 3], Some(Duration::from_millis(100)));
        e.created_at = Utc::now() - chrono::Duration::milliseconds(200);
        assert!(e.is_expired());
    }

    #[test]
    fn test_cache_entry_no_ttl_never_expires() {
        let mut e = entry(&[1], None);
        e.created_at = Utc::now() - chrono::Duration::days(365);
        assert!(!e.is_expired());
    }

    #[tokio::test]
    async fn test_in_memory_roundtrip() {
        let backend = InMemoryBackend::new(InMemoryConfig::default());

        backend
            .set("decision:alice:abc", entry(b"payload", Some(Duration::from_secs(60))))
            .await
            .unwrap();

        let got = backend.get("decision:alice:abc").await.unwrap();
        assert_eq!(got.unwrap().data, b"payload");

        assert!(backend.exists("decision:alice:abc").await.unwrap());
        assert!(backend.delete("decision:alice:abc").await.unwrap());
        assert!(!backend.exists("decision:alice:abc").await.unwrap());
    }

    #[tokio::test]
    async fn test_in_memory_expired_reads_as_miss() {
        let backend = InMemoryBackend::new(InMemoryConfig::default());
        let mut e = entry(b"stale", Some(Duration::from_secs(1)));
        e.created_at = Utc::now() - chrono::Duration::seconds(5);
        backend.set("k", e).await.unwrap();

        assert!(backend.get("k").await.unwrap().is_none());
        let stats = backend.stats().await.unwrap();
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_in_memory_delete_by_pattern() {
        let backend = InMemoryBackend::new(InMemoryConfig::default());
        for key in [
            "decision:alice:h1",
            "decision:alice:h2",
            "decision:bob:h1",
        ] {
            backend
                .set(key, entry(b"x", Some(Duration::from_secs(60))))
                .await
                .unwrap();
        }

        let deleted = backend.delete_by_pattern("decision:alice:*").await.unwrap();
        assert_eq!(deleted, 2);
        assert!(!backend.exists("decision:alice:h1").await.unwrap());
        assert!(backend.exists("decision:bob:h1").await.unwrap());
    }

    #[tokio::test]
    async fn test_in_memory_eviction_bounds_capacity() {
        let backend = InMemoryBackend::new(InMemoryConfig {
            max_capacity: 5,
            ..Default::default()
        });

        for i in 0..10 {
            backend
                .set(&format!("key-{}", i), entry(&[i as u8], Some(Duration::from_secs(60))))
                .await
                .unwrap();
        }

        let stats = backend.stats().await.unwrap();
        assert!(stats.entries <= 6);
        assert!(stats.evictions > 0);
    }

    #[tokio::test]
    async fn test_stats_hit_rate() {
        let backend = InMemoryBackend::new(InMemoryConfig::default());
        backend
            .set("k", entry(b"v", Some(Duration::from_secs(60))))
            .await
            .unwrap();
        backend.get("k").await.unwrap();
        backend.get("missing").await.unwrap();

        let stats = backend.stats().await.unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < 0.01);
    }
}
