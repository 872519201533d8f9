//! Audit trail for permission checks.
//!
//! Every call to the decision engine produces exactly one [`CheckLog`],
//! allowed or denied, cache hit or miss. Rows are append-only: sinks must
//! never mutate or retry a recorded row. A sink failure is logged and does
//! not fail the check it describes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::AegisResult;
use crate::models::{Scope, UserId};

// ═══════════════════════════════════════════════════════════════════════════════
// CheckLog
// ═══════════════════════════════════════════════════════════════════════════════

/// Append-only record of a single permission check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckLog {
    pub user_id: UserId,
    pub resource: String,
    pub action: String,
    pub scope: Option<Scope>,
    pub resource_id: Option<String>,
    pub is_allowed: bool,
    /// Present when `is_allowed` is false.
    pub denial_reason: Option<String>,
    /// Wall-clock duration of the check; always >= 0.
    pub check_duration_ms: u64,
    /// Extra facts about how the decision was made (cache hit, policy code).
    pub metadata: BTreeMap<String, Value>,
    pub checked_at: DateTime<Utc>,
}

impl CheckLog {
    pub fn allowed(
        user_id: UserId,
        resource: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            resource: resource.into(),
            action: action.into(),
            scope: None,
            resource_id: None,
            is_allowed: true,
            denial_reason: None,
            check_duration_ms: 0,
            metadata: BTreeMap::new(),
            checked_at: Utc::now(),
        }
    }

    pub fn denied(
        user_id: UserId,
        resource: impl Into<String>,
        action: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            is_allowed: false,
            denial_reason: Some(reason.into()),
            ..Self::allowed(user_id, resource, action)
        }
    }

    pub fn with_scope(mut self, scope: Option<Scope>) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_resource_id(mut self, resource_id: Option<String>) -> Self {
        self.resource_id = resource_id;
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.check_duration_ms = duration_ms;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Sinks
// ═══════════════════════════════════════════════════════════════════════════════

/// Destination for check logs. Implementations must be append-only.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, log: CheckLog) -> AegisResult<()>;

    fn name(&self) -> &'static str;
}

/// Record checks and tolerate sink failure: the engine calls this so a broken
/// audit pipeline degrades to a warning instead of failing the check.
pub async fn record_check(sink: &dyn AuditSink, log: CheckLog) {
    let outcome = if log.is_allowed { "allow" } else { "deny" };
    counter!("aegis_checks_total", "outcome" => outcome).increment(1);
    if let Err(e) = sink.record(log).await {
        warn!(sink = sink.name(), error = %e, "Failed to record check log");
        counter!("aegis_audit_failures_total").increment(1);
    }
}

/// Sink that emits each check as a structured tracing event.
#[derive(Debug, Default, Clone)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, log: CheckLog) -> AegisResult<()> {
        info!(
            target: "aegis::audit",
            user_id = %log.user_id,
            resource = %log.resource,
            action = %log.action,
            resource_id = log.resource_id.as_deref().unwrap_or("-"),
            is_allowed = log.is_allowed,
            denial_reason = log.denial_reason.as_deref().unwrap_or(""),
            duration_ms = log.check_duration_ms,
            "permission check"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "tracing"
    }
}

/// In-memory sink for tests; exposes the recorded rows.
#[derive(Debug, Default, Clone)]
pub struct MemoryAuditSink {
    logs: Arc<Mutex<Vec<CheckLog>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn logs(&self) -> Vec<CheckLog> {
        self.logs.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.logs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.logs.lock().await.is_empty()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, log: CheckLog) -> AegisResult<()> {
        self.logs.lock().await.push(log);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
