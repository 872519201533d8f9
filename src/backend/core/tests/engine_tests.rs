//! End-to-end decision scenarios: store, hierarchy, policies, cache, and
//! audit wired together through the real `DecisionEngine`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use serde_json::json;

use aegis_core::audit::MemoryAuditSink;
use aegis_core::cache::Cache;
use aegis_core::engine::{CheckRequest, DecisionEngine, EngineConfig};
use aegis_core::models::{
    Permission, PermissionId, ResourcePermission, Role, RoleId, RolePermission, UserId, UserRole,
};
use aegis_core::policy::{
    HourRange, PermissionPolicy, PolicyEffect, PolicyRules, RequestContext,
};
use aegis_core::store::{InMemoryStore, PermissionStore};

const JAKARTA: Tz = chrono_tz::Asia::Jakarta;

// ============================================================================
// Fixtures
// ============================================================================

/// Store with an "editor" role granting `documents:READ` to user "alice".
async fn editor_store() -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new());
    store.add_role(Role::new("editor", "Editor", 20));
    store.add_permission(Permission::new("documents", "READ", None));
    store
        .grant_role_permission(RolePermission::grant(
            RoleId::new("editor"),
            PermissionId::new("documents:READ"),
        ))
        .await
        .unwrap();
    store
        .assign_role(UserRole::new(UserId::new("alice"), RoleId::new("editor")))
        .await
        .unwrap();
    store
}

fn engine_over(store: Arc<InMemoryStore>) -> (DecisionEngine, Arc<MemoryAuditSink>) {
    let audit = Arc::new(MemoryAuditSink::new());
    let engine = DecisionEngine::new(
        store,
        Cache::in_memory(1000),
        audit.clone(),
        EngineConfig::default(),
    );
    (engine, audit)
}

/// Engine with decision caching off, for scenarios where only the timestamp
/// differs between checks and a cached decision would shadow the window.
fn uncached_engine_over(store: Arc<InMemoryStore>) -> (DecisionEngine, Arc<MemoryAuditSink>) {
    let audit = Arc::new(MemoryAuditSink::new());
    let engine = DecisionEngine::new(
        store,
        Cache::in_memory(1000),
        audit.clone(),
        EngineConfig {
            cache_enabled: false,
            ..Default::default()
        },
    );
    (engine, audit)
}

/// A Wednesday in Jakarta (UTC+7) at the given local hour.
fn jakarta_wednesday(hour: u32) -> RequestContext {
    let local = JAKARTA.with_ymd_and_hms(2026, 9, 2, hour, 15, 0).unwrap();
    RequestContext::at(local.with_timezone(&Utc))
}

/// Business-hours restriction: access only between 09:00 and 17:00 local
/// time. An ALLOW time window denies everything outside it.
fn business_hours_policy() -> PermissionPolicy {
    PermissionPolicy::new(
        "business-hours",
        PolicyRules::TimeBased {
            allowed_days: vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
                Weekday::Sat,
                Weekday::Sun,
            ],
            allowed_hours: HourRange::new(9, 17),
            timezone: JAKARTA,
        },
        PolicyEffect::Allow,
    )
    .with_priority(100)
}

// ============================================================================
// Grant-based decisions
// ============================================================================

#[tokio::test]
async fn editor_can_read_documents() {
    let (engine, _) = engine_over(editor_store().await);

    let decision = engine
        .check(&CheckRequest::new(UserId::new("alice"), "documents", "READ"))
        .await;

    assert!(decision.allowed);
    assert!(decision.reason.is_none());
}

#[tokio::test]
async fn ungranted_action_is_denied() {
    let (engine, _) = engine_over(editor_store().await);

    let decision = engine
        .check(&CheckRequest::new(
            UserId::new("alice"),
            "documents",
            "DELETE",
        ))
        .await;

    assert!(!decision.allowed);
    assert_eq!(decision.reason.as_deref(), Some("permission not granted"));
}

#[tokio::test]
async fn inherited_grant_flows_down_and_deny_overrides() {
    let store = Arc::new(InMemoryStore::new());
    store.add_role(Role::new("director", "Director", 0));
    store.add_role(Role::new("manager", "Manager", 10).with_parent(RoleId::new("director")));
    store.add_role(Role::new("analyst", "Analyst", 20).with_parent(RoleId::new("manager")));
    store.add_permission(Permission::new("reports", "EXPORT", None));
    store.add_permission(Permission::new("reports", "READ", None));

    // Director grants both; manager explicitly denies EXPORT.
    store
        .grant_role_permission(RolePermission::grant(
            RoleId::new("director"),
            PermissionId::new("reports:EXPORT"),
        ))
        .await
        .unwrap();
    store
        .grant_role_permission(RolePermission::grant(
            RoleId::new("director"),
            PermissionId::new("reports:READ"),
        ))
        .await
        .unwrap();
    store
        .grant_role_permission(RolePermission::deny(
            RoleId::new("manager"),
            PermissionId::new("reports:EXPORT"),
        ))
        .await
        .unwrap();

    store
        .assign_role(UserRole::new(UserId::new("dana"), RoleId::new("analyst")))
        .await
        .unwrap();

    let (engine, _) = engine_over(store);

    // READ inherits through two edges.
    let read = engine
        .check(&CheckRequest::new(UserId::new("dana"), "reports", "READ"))
        .await;
    assert!(read.allowed);

    // EXPORT is killed by the deny on the chain below the grant.
    let export = engine
        .check(&CheckRequest::new(UserId::new("dana"), "reports", "EXPORT"))
        .await;
    assert!(!export.allowed);
}

// ============================================================================
// Policy refinement
// ============================================================================

#[tokio::test]
async fn business_hours_restriction_denies_at_night() {
    let store = editor_store().await;
    store.upsert_policy(business_hours_policy()).await.unwrap();
    let (engine, _) = uncached_engine_over(store);

    // 22:00 Jakarta local is outside the window: the single restriction
    // policy denies despite the standing role grant.
    let night = engine
        .check(
            &CheckRequest::new(UserId::new("alice"), "documents", "READ")
                .with_context(jakarta_wednesday(22)),
        )
        .await;
    assert!(!night.allowed);
    assert_eq!(
        night.reason.as_deref(),
        Some("denied by policy 'business-hours'")
    );

    // 10:00 local is inside the window; the grant stands.
    let morning = engine
        .check(
            &CheckRequest::new(UserId::new("alice"), "documents", "READ")
                .with_context(jakarta_wednesday(10)),
        )
        .await;
    assert!(morning.allowed);
}

#[tokio::test]
async fn policy_deny_beats_policy_allow() {
    let store = editor_store().await;
    store.upsert_policy(business_hours_policy()).await.unwrap();
    // A maintenance blackout inside business hours outranks the allow.
    store
        .upsert_policy(
            PermissionPolicy::new(
                "maintenance-window",
                PolicyRules::TimeBased {
                    allowed_days: vec![Weekday::Wed],
                    allowed_hours: HourRange::new(9, 12),
                    timezone: JAKARTA,
                },
                PolicyEffect::Deny,
            )
            .with_priority(200),
        )
        .await
        .unwrap();
    let (engine, _) = engine_over(store);

    let decision = engine
        .check(
            &CheckRequest::new(UserId::new("alice"), "documents", "READ")
                .with_context(jakarta_wednesday(10)),
        )
        .await;
    assert!(!decision.allowed);
    assert_eq!(
        decision.reason.as_deref(),
        Some("denied by policy 'maintenance-window'")
    );
}

#[tokio::test]
async fn deactivated_policy_no_longer_denies() {
    let store = editor_store().await;
    let policy = business_hours_policy();
    let policy_id = policy.id.clone();
    store.upsert_policy(policy).await.unwrap();

    let (engine, _) = engine_over(store.clone());
    let request = CheckRequest::new(UserId::new("alice"), "documents", "READ")
        .with_context(jakarta_wednesday(22));

    assert!(!engine.check(&request).await.allowed);
    // Let the fire-and-forget cache populate land before deactivating.
    tokio::time::sleep(Duration::from_millis(50)).await;

    store.deactivate_policy(&policy_id).await.unwrap();
    // Let the change listener drop the cached deny.
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(engine.check(&request).await.allowed);
}

// ============================================================================
// Resource-specific grants
// ============================================================================

#[tokio::test]
async fn expired_resource_grant_denies_the_instance() {
    let store = editor_store().await;

    // An instance-level grant on doc_123 that has already expired. Rows for
    // an instance govern it exclusively, so the role grant does not save it.
    let mut grant = ResourcePermission::new(
        UserId::new("alice"),
        PermissionId::new("documents:READ"),
        "documents",
        "doc_123",
        "incident review",
    );
    grant.granted_at = Utc::now() - chrono::Duration::days(10);
    grant.valid_until = Some(Utc::now() - chrono::Duration::days(1));
    store.grant_resource_permission(grant).await.unwrap();

    let (engine, _) = engine_over(store);

    let on_instance = engine
        .check(
            &CheckRequest::new(UserId::new("alice"), "documents", "READ")
                .with_resource_id("doc_123"),
        )
        .await;
    assert!(!on_instance.allowed);
    assert_eq!(
        on_instance.reason.as_deref(),
        Some("resource-specific grant expired or revoked")
    );

    // Other instances and the generic check still ride the role grant.
    let other_instance = engine
        .check(
            &CheckRequest::new(UserId::new("alice"), "documents", "READ")
                .with_resource_id("doc_999"),
        )
        .await;
    assert!(other_instance.allowed);

    let generic = engine
        .check(&CheckRequest::new(UserId::new("alice"), "documents", "READ"))
        .await;
    assert!(generic.allowed);
}

#[tokio::test]
async fn resource_grant_allows_without_any_role() {
    let store = Arc::new(InMemoryStore::new());
    store.add_permission(Permission::new("documents", "READ", None));
    store
        .grant_resource_permission(ResourcePermission::new(
            UserId::new("guest"),
            PermissionId::new("documents:READ"),
            "documents",
            "doc_7",
            "external audit",
        ))
        .await
        .unwrap();

    let (engine, _) = engine_over(store);

    let on_instance = engine
        .check(
            &CheckRequest::new(UserId::new("guest"), "documents", "READ")
                .with_resource_id("doc_7"),
        )
        .await;
    assert!(on_instance.allowed);

    // No roles, so the generic check has nothing to stand on.
    let generic = engine
        .check(&CheckRequest::new(UserId::new("guest"), "documents", "READ"))
        .await;
    assert!(!generic.allowed);
}

// ============================================================================
// Cache invalidation
// ============================================================================

#[tokio::test]
async fn revocation_invalidates_cached_decisions() {
    let store = editor_store().await;
    let (engine, _) = engine_over(store.clone());
    let request = CheckRequest::new(UserId::new("alice"), "documents", "READ");

    assert!(engine.check(&request).await.allowed);
    // Let the fire-and-forget cache populate land before revoking.
    tokio::time::sleep(Duration::from_millis(50)).await;

    store
        .revoke_role(&UserId::new("alice"), &RoleId::new("editor"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let after = engine.check(&request).await;
    assert!(!after.allowed);
    assert_eq!(after.reason.as_deref(), Some("permission not granted"));
}

#[tokio::test]
async fn context_change_is_not_served_from_cache() {
    let store = editor_store().await;
    store
        .upsert_policy(PermissionPolicy::new(
            "mfa-lockdown",
            PolicyRules::AttributeBased {
                required: BTreeMap::from([("mfa_verified".to_string(), json!(false))]),
            },
            PolicyEffect::Deny,
        ))
        .await
        .unwrap();
    let (engine, _) = engine_over(store);

    // A verified session is allowed; let the decision land in the cache.
    let verified = CheckRequest::new(UserId::new("alice"), "documents", "READ")
        .with_context(RequestContext::now().with_mfa(true));
    assert!(engine.check(&verified).await.allowed);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The same user without MFA must be re-evaluated, not handed the
    // cached allow.
    let unverified = CheckRequest::new(UserId::new("alice"), "documents", "READ")
        .with_context(RequestContext::now().with_mfa(false));
    let decision = engine.check(&unverified).await;
    assert!(!decision.allowed);
    assert_eq!(
        decision.reason.as_deref(),
        Some("denied by policy 'mfa-lockdown'")
    );
}

// ============================================================================
// Audit trail
// ============================================================================

#[tokio::test]
async fn every_check_writes_exactly_one_log_row() {
    let store = editor_store().await;
    let (engine, audit) = engine_over(store);

    let allowed = CheckRequest::new(UserId::new("alice"), "documents", "READ");
    let denied = CheckRequest::new(UserId::new("alice"), "documents", "DELETE");

    engine.check(&allowed).await;
    engine.check(&allowed).await; // cache hit, still audited
    engine.check(&denied).await;

    let logs = audit.logs().await;
    assert_eq!(logs.len(), 3);
    assert!(logs.iter().all(|l| l.resource == "documents"));
    assert_eq!(logs.iter().filter(|l| l.is_allowed).count(), 2);

    let deny_row = logs.iter().find(|l| !l.is_allowed).unwrap();
    assert_eq!(deny_row.action, "DELETE");
    assert!(deny_row.denial_reason.is_some());
}

#[tokio::test]
async fn denied_instance_check_is_audited_with_resource_id() {
    let store = editor_store().await;
    let mut grant = ResourcePermission::new(
        UserId::new("alice"),
        PermissionId::new("documents:READ"),
        "documents",
        "doc_123",
        "incident review",
    );
    grant.granted_at = Utc::now() - chrono::Duration::days(10);
    grant.valid_until = Some(Utc::now() - chrono::Duration::days(1));
    store.grant_resource_permission(grant).await.unwrap();

    let (engine, audit) = engine_over(store);
    engine
        .check(
            &CheckRequest::new(UserId::new("alice"), "documents", "READ")
                .with_resource_id("doc_123"),
        )
        .await;

    let logs = audit.logs().await;
    assert_eq!(logs.len(), 1);
    assert!(!logs[0].is_allowed);
    assert_eq!(logs[0].resource_id.as_deref(), Some("doc_123"));
}
