//! Permission decision engine.
//!
//! Composes the temporal evaluator, hierarchy resolver, and policy evaluator
//! into a single `check` entry point. The engine fails closed: any store
//! error during evaluation produces a deny with the reason "evaluation
//! error" rather than a propagated failure. Cache errors are treated as
//! misses and never influence the decision.

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, instrument, warn};

use crate::audit::{record_check, AuditSink, CheckLog};
use crate::cache::{hash_composite_key, spawn_change_listener, Cache, CacheKey};
use crate::error::AegisResult;
use crate::hierarchy::resolve_effective_permissions;
use crate::models::{PermissionId, Scope, UserId};
use crate::policy::{evaluate_policies, PolicyVerdict, RequestContext};
use crate::store::PermissionStore;

// ═══════════════════════════════════════════════════════════════════════════════
// Request and decision
// ═══════════════════════════════════════════════════════════════════════════════

/// A single permission check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRequest {
    pub user_id: UserId,
    pub resource: String,
    pub action: String,
    pub scope: Option<Scope>,
    /// Concrete resource instance, when the check targets one.
    pub resource_id: Option<String>,
    /// Ambient facts for policy evaluation.
    pub context: RequestContext,
}

impl CheckRequest {
    pub fn new(
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
            context: RequestContext::now(),
        }
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn with_resource_id(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = context;
        self
    }

    /// Stable hash of the request identity for cache keys. The timestamp is
    /// deliberately excluded so repeated checks hit the same entry (the
    /// decision TTL bounds staleness for time-window policies); every other
    /// context field participates, so a decision computed under one context
    /// is never served to a request made under another.
    fn cache_hash(&self) -> String {
        let scope = self.scope.map(|s| s.to_string()).unwrap_or_default();
        let context = self.context.fingerprint();
        hash_composite_key([
            self.resource.as_str(),
            self.action.as_str(),
            scope.as_str(),
            self.resource_id.as_deref().unwrap_or(""),
            context.as_str(),
        ])
    }
}

/// Outcome of a check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub allowed: bool,
    /// Present when denied.
    pub reason: Option<String>,
    pub duration_ms: u64,
}

impl Decision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            duration_ms: 0,
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            duration_ms: 0,
        }
    }
}

/// Cached form of a decision (duration is per call, not cached).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedDecision {
    allowed: bool,
    reason: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════════════════════════

/// Engine tuning knobs. Fail-closed behavior is not configurable.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Whether decisions are cached at all.
    pub cache_enabled: bool,
    /// TTL for cached decisions.
    pub decision_ttl: std::time::Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            decision_ttl: std::time::Duration::from_secs(300),
        }
    }
}

/// The reason reported whenever evaluation itself fails.
const EVALUATION_ERROR_REASON: &str = "evaluation error";

/// Composes store, cache, and audit into the check entry point.
pub struct DecisionEngine {
    store: Arc<dyn PermissionStore>,
    cache: Cache,
    audit: Arc<dyn AuditSink>,
    config: EngineConfig,
}

impl DecisionEngine {
    /// Build an engine and wire the store's change events into cache
    /// invalidation.
    pub fn new(
        store: Arc<dyn PermissionStore>,
        cache: Cache,
        audit: Arc<dyn AuditSink>,
        config: EngineConfig,
    ) -> Self {
        spawn_change_listener(cache.invalidation_engine(), store.change_events());
        Self {
            store,
            cache,
            audit,
            config,
        }
    }

    /// Check whether the request is allowed.
    ///
    /// Never returns an error and never panics: evaluation failures become
    /// deny decisions. Exactly one audit row is recorded per call.
    #[instrument(skip(self, request), fields(user_id = %request.user_id, resource = %request.resource, action = %request.action))]
    pub async fn check(&self, request: &CheckRequest) -> Decision {
        let start = Instant::now();
        let cache_key = CacheKey::decision(&request.user_id, request.cache_hash())
            .with_ttl(self.config.decision_ttl);

        // Cache probe. Errors read as misses.
        let mut cache_hit = false;
        let mut decision = if self.config.cache_enabled {
            match self.cache.get::<CachedDecision>(&cache_key).await {
                Ok(Some(cached)) => {
                    cache_hit = true;
                    Some(Decision {
                        allowed: cached.allowed,
                        reason: cached.reason,
                        duration_ms: 0,
                    })
                }
                Ok(None) => None,
                Err(e) => {
                    warn!(error = %e, "Cache probe failed; treating as miss");
                    None
                }
            }
        } else {
            None
        };

        if decision.is_none() {
            decision = Some(match self.evaluate(request).await {
                Ok(d) => d,
                Err(e) => {
                    error!(error = %e, "Permission evaluation failed; denying");
                    counter!("aegis_evaluation_errors_total").increment(1);
                    Decision::deny(EVALUATION_ERROR_REASON)
                }
            });
        }

        let mut decision = decision.unwrap_or_else(|| Decision::deny(EVALUATION_ERROR_REASON));
        decision.duration_ms = start.elapsed().as_millis() as u64;

        self.record(request, &decision, cache_hit).await;

        histogram!("aegis_check_duration_ms").record(decision.duration_ms as f64);
        counter!(
            "aegis_decisions_total",
            "outcome" => if decision.allowed { "allow" } else { "deny" },
            "cache" => if cache_hit { "hit" } else { "miss" }
        )
        .increment(1);

        // Fire-and-forget cache populate; a failure only costs the next
        // caller a recomputation.
        if self.config.cache_enabled && !cache_hit {
            let cache = self.cache.clone();
            let cached = CachedDecision {
                allowed: decision.allowed,
                reason: decision.reason.clone(),
            };
            tokio::spawn(async move {
                if let Err(e) = cache.set(&cache_key, &cached).await {
                    debug!(error = %e, "Failed to cache decision");
                }
            });
        }

        decision
    }

    /// Full (uncached) evaluation. Store errors propagate; `check` converts
    /// them into deny decisions.
    async fn evaluate(&self, request: &CheckRequest) -> AegisResult<Decision> {
        let as_of = request.context.timestamp;

        // Resolve the request to a catalog permission.
        let Some(permission) = self
            .store
            .permission_by_parts(&request.resource, &request.action, request.scope)
            .await?
        else {
            return Ok(Decision::deny("permission not granted"));
        };

        let has_grant = match &request.resource_id {
            Some(resource_id) => {
                self.resource_grant_status(request, &permission.id, resource_id, as_of)
                    .await?
            }
            None => GrantStatus::Undetermined,
        };

        let has_grant = match has_grant {
            GrantStatus::Granted => true,
            GrantStatus::Denied(reason) => return Ok(Decision::deny(reason)),
            GrantStatus::Undetermined => {
                self.role_grant_exists(request, &permission.id, as_of).await?
            }
        };

        if !has_grant {
            return Ok(Decision::deny("permission not granted"));
        }

        // Grant established; policies can still deny.
        let policies = self.store.active_policies().await?;
        match evaluate_policies(&policies, &request.context) {
            PolicyVerdict::Deny { reason, .. } => Ok(Decision::deny(reason)),
            PolicyVerdict::Allow { .. } | PolicyVerdict::Neutral => Ok(Decision::allow()),
        }
    }

    /// Resolve resource-specific grants for a concrete instance.
    ///
    /// When any rows exist for (user, permission, resource instance), they
    /// alone govern access to that instance: an expired or revoked row denies
    /// even if a role-level grant would otherwise allow.
    async fn resource_grant_status(
        &self,
        request: &CheckRequest,
        permission_id: &PermissionId,
        resource_id: &str,
        as_of: DateTime<Utc>,
    ) -> AegisResult<GrantStatus> {
        let grants = self
            .store
            .resource_grants(&request.user_id, permission_id, &request.resource, resource_id)
            .await?;

        if grants.is_empty() {
            return Ok(GrantStatus::Undetermined);
        }
        if grants.iter().any(|g| g.is_effective_at(as_of)) {
            Ok(GrantStatus::Granted)
        } else {
            Ok(GrantStatus::Denied(
                "resource-specific grant expired or revoked".to_string(),
            ))
        }
    }

    /// Whether any of the user's active roles carries the permission,
    /// hierarchy included.
    async fn role_grant_exists(
        &self,
        request: &CheckRequest,
        permission_id: &PermissionId,
        as_of: DateTime<Utc>,
    ) -> AegisResult<bool> {
        let assignments = self.store.user_roles(&request.user_id, as_of).await?;
        if assignments.is_empty() {
            return Ok(false);
        }

        let graph = self.store.role_graph().await?;
        let mut effective: HashSet<PermissionId> = HashSet::new();
        for assignment in &assignments {
            // A cycle anywhere in the chain fails the whole check closed.
            let perms = resolve_effective_permissions(&graph, &assignment.role_id, as_of)?;
            effective.extend(perms);
        }

        Ok(effective.contains(permission_id))
    }

    /// Record the mandatory audit row for this check.
    async fn record(&self, request: &CheckRequest, decision: &Decision, cache_hit: bool) {
        let log = if decision.allowed {
            CheckLog::allowed(request.user_id.clone(), &request.resource, &request.action)
        } else {
            CheckLog::denied(
                request.user_id.clone(),
                &request.resource,
                &request.action,
                decision
                    .reason
                    .clone()
                    .unwrap_or_else(|| "denied".to_string()),
            )
        };
        let log = log
            .with_scope(request.scope)
            .with_resource_id(request.resource_id.clone())
            .with_duration_ms(decision.duration_ms)
            .with_metadata("cache_hit", json!(cache_hit));

        record_check(self.audit.as_ref(), log).await;
    }
}

enum GrantStatus {
    Granted,
    Denied(String),
    Undetermined,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
