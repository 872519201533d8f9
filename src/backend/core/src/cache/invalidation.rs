//! Cache invalidation.
//!
//! Cached decisions and effective-permission sets go stale the moment a
//! grant changes. The store publishes [`ChangeEvent`]s on a broadcast
//! channel; the [`InvalidationEngine`] translates them into key or pattern
//! deletes against the backend. Invalidation is best-effort: a failure here
//! means a stale entry lives until its TTL, never a wrong decision being
//! served past expiry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::cache::backend::CacheBackend;
use crate::error::AegisResult;
use crate::models::UserId;

// ═══════════════════════════════════════════════════════════════════════════════
// Change events
// ═══════════════════════════════════════════════════════════════════════════════

/// Domain events that make cached entries stale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeEvent {
    /// A role assignment, role grant, or resource grant affecting this user
    /// was created, updated, or revoked.
    GrantsChanged { user_id: UserId },

    /// A role's grants changed; every user holding the role (directly or by
    /// inheritance) may be affected.
    RoleChanged { role_id: String },

    /// The active policy set changed.
    PoliciesChanged,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Invalidation events
// ═══════════════════════════════════════════════════════════════════════════════

/// Low-level invalidation instructions against the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InvalidationEvent {
    /// Invalidate one key.
    Key { key: String },

    /// Invalidate all keys matching a glob pattern.
    Pattern { pattern: String },

    /// Invalidate everything.
    All,
}

impl InvalidationEvent {
    pub fn key(key: impl Into<String>) -> Self {
        Self::Key { key: key.into() }
    }

    pub fn pattern(pattern: impl Into<String>) -> Self {
        Self::Pattern {
            pattern: pattern.into(),
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Key { .. } => "key",
            Self::Pattern { .. } => "pattern",
            Self::All => "all",
        }
    }
}

/// Convert a glob pattern (`*` any run, `?` any char) to a compiled regex.
pub(crate) fn glob_to_regex(glob: &str) -> Result<regex::Regex, regex::Error> {
    let mut pattern = String::with_capacity(glob.len() * 2);
    pattern.push('^');

    for c in glob.chars() {
        match c {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            '.' | '+' | '(' | ')' | '[' | ']' | '{' | '}' | '^' | '$' | '|' | '\\' => {
                pattern.push('\\');
                pattern.push(c);
            }
            _ => pattern.push(c),
        }
    }

    pattern.push('$');
    regex::Regex::new(&pattern)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Invalidation strategy
// ═══════════════════════════════════════════════════════════════════════════════

/// Trait for invalidation strategies.
#[async_trait]
pub trait InvalidationStrategy: Send + Sync {
    /// Process an invalidation event; returns the number of entries removed.
    async fn invalidate(&self, event: InvalidationEvent) -> AegisResult<u64>;

    fn name(&self) -> &'static str;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Invalidation engine
// ═══════════════════════════════════════════════════════════════════════════════

/// Record of an executed invalidation, kept for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationLogEntry {
    pub event: InvalidationEvent,
    pub count: u64,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Executes invalidation events against a backend and relays domain change
/// events to subscribers.
pub struct InvalidationEngine {
    backend: Arc<dyn CacheBackend>,
    change_sender: broadcast::Sender<ChangeEvent>,
    invalidation_log: DashMap<String, InvalidationLogEntry>,
}

impl InvalidationEngine {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        let (change_sender, _) = broadcast::channel(1024);
        Self {
            backend,
            change_sender,
            invalidation_log: DashMap::new(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Change events
    // ─────────────────────────────────────────────────────────────────────────

    /// Subscribe to domain change events.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.change_sender.subscribe()
    }

    /// Publish a change event and apply the invalidation it implies.
    pub async fn publish(&self, event: ChangeEvent) -> AegisResult<u64> {
        // Nobody listening is fine.
        let _ = self.change_sender.send(event.clone());

        let count = match &event {
            ChangeEvent::GrantsChanged { user_id } => self.invalidate_user(user_id).await?,
            ChangeEvent::RoleChanged { .. } => {
                // Affected users are unknown without the full membership; drop
                // every cached decision and permission set.
                self.invalidate_by_pattern("decision:*").await?
                    + self.invalidate_by_pattern("perms:*").await?
            }
            ChangeEvent::PoliciesChanged => {
                self.invalidate_by_pattern("decision:*").await?
                    + self.invalidate_by_pattern("policy:*").await?
            }
        };

        debug!(event = ?event, invalidated = count, "Processed change event");
        Ok(count)
    }

    /// Drop every cached entry tied to a user.
    pub async fn invalidate_user(&self, user_id: &UserId) -> AegisResult<u64> {
        let decisions = self
            .invalidate_by_pattern(&format!("decision:{}:*", user_id))
            .await?;
        let perms = self
            .invalidate_by_pattern(&format!("perms:{}:*", user_id))
            .await?;
        Ok(decisions + perms)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Direct invalidation
    // ─────────────────────────────────────────────────────────────────────────

    /// Invalidate a single key.
    pub async fn invalidate_key(&self, key: &str) -> AegisResult<bool> {
        let start = std::time::Instant::now();
        let deleted = self.backend.delete(key).await?;

        counter!("aegis_cache_invalidations_total", "strategy" => "key")
            .increment(u64::from(deleted));
        self.log_invalidation(
            InvalidationEvent::key(key),
            u64::from(deleted),
            start.elapsed(),
        );
        Ok(deleted)
    }

    /// Invalidate all keys matching a glob pattern.
    pub async fn invalidate_by_pattern(&self, pattern: &str) -> AegisResult<u64> {
        let start = std::time::Instant::now();
        let count = self.backend.delete_by_pattern(pattern).await?;

        counter!("aegis_cache_invalidations_total", "strategy" => "pattern").increment(count);
        self.log_invalidation(InvalidationEvent::pattern(pattern), count, start.elapsed());
        Ok(count)
    }

    /// Invalidate every entry.
    pub async fn invalidate_all(&self) -> AegisResult<()> {
        let start = std::time::Instant::now();
        self.backend.clear().await?;

        counter!("aegis_cache_invalidations_total", "strategy" => "all").increment(1);
        self.log_invalidation(InvalidationEvent::All, u64::MAX, start.elapsed());
        info!("Invalidated all cache entries");
        Ok(())
    }

    /// Recent invalidations, newest first.
    pub fn recent_invalidations(&self, limit: usize) -> Vec<InvalidationLogEntry> {
        let mut entries: Vec<_> = self
            .invalidation_log
            .iter()
            .map(|e| e.value().clone())
            .collect();
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        entries.truncate(limit);
        entries
    }

    fn log_invalidation(&self, event: InvalidationEvent, count: u64, duration: Duration) {
        let entry = InvalidationLogEntry {
            event,
            count,
            timestamp: Utc::now(),
            duration_ms: duration.as_millis() as u64,
        };

        let key = format!("{}", entry.timestamp.timestamp_nanos_opt().unwrap_or(0));
        self.invalidation_log.insert(key, entry);

        // Bounded diagnostics buffer.
        if self.invalidation_log.len() > 1000 {
            let oldest_key = self
                .invalidation_log
                .iter()
                .min_by_key(|e| e.value().timestamp)
                .map(|e| e.key().clone());
            if let Some(key) = oldest_key {
                self.invalidation_log.remove(&key);
            }
        }
    }
}

#[async_trait]
impl InvalidationStrategy for InvalidationEngine {
    async fn invalidate(&self, event: InvalidationEvent) -> AegisResult<u64> {
        match event {
            InvalidationEvent::Key { key } => {
                Ok(u64::from(self.invalidate_key(&key).await?))
            }
            InvalidationEvent::Pattern { pattern } => self.invalidate_by_pattern(&pattern).await,
            InvalidationEvent::All => {
                self.invalidate_all().await?;
                Ok(u64::MAX)
            }
        }
    }

    fn name(&self) -> &'static str {
        "engine"
    }
}

/// Spawn a listener that applies change events arriving on a receiver.
///
/// Used when a separate component (the store) holds the sending side and
/// the cache should react without polling.
pub fn spawn_change_listener(
    engine: Arc<InvalidationEngine>,
    mut receiver: broadcast::Receiver<ChangeEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    if let Err(e) = engine.publish(event).await {
                        warn!(error = %e, "Change-event invalidation failed");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Change listener lagged; clearing cache");
                    if let Err(e) = engine.invalidate_all().await {
                        warn!(error = %e, "Failed to clear cache after lag");
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
