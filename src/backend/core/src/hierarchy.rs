//! Role hierarchy resolution.
//!
//! Resolves the effective permission set of a role by walking its ancestor
//! chain over an in-memory snapshot of the role graph. The walk is iterative
//! with a visited set, so a corrupted graph with a cycle is reported as an
//! error instead of hanging.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::error::{AegisError, AegisResult};
use crate::models::{PermissionId, Role, RoleId, RolePermission};

// ═══════════════════════════════════════════════════════════════════════════════
// Role graph snapshot
// ═══════════════════════════════════════════════════════════════════════════════

/// Immutable snapshot of roles and their grants, loaded by the decision
/// engine before resolution. The resolver itself does no I/O.
#[derive(Debug, Clone, Default)]
pub struct RoleGraph {
    roles: HashMap<RoleId, Role>,
    grants: HashMap<RoleId, Vec<RolePermission>>,
}

impl RoleGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_role(&mut self, role: Role) {
        self.roles.insert(role.id.clone(), role);
    }

    pub fn add_grant(&mut self, grant: RolePermission) {
        self.grants
            .entry(grant.role_id.clone())
            .or_default()
            .push(grant);
    }

    pub fn role(&self, id: &RoleId) -> Option<&Role> {
        self.roles.get(id)
    }

    fn grants_of(&self, id: &RoleId) -> &[RolePermission] {
        self.grants.get(id).map(Vec::as_slice).unwrap_or(&[])
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Resolution
// ═══════════════════════════════════════════════════════════════════════════════

/// Resolve the effective permission set of `role_id` at instant `as_of`.
///
/// Walks from the role up through its parents. At each level the role's
/// temporally valid grants are applied with closest-role-first precedence:
/// an explicit deny (`is_granted = false`) at a nearer role removes the
/// permission and pins it denied against anything a more distant ancestor
/// says. The walk stops when a role's `inherit_permissions` is false (the
/// edge to its parent carries nothing), when a parent is inactive, or at a
/// root. A revisited role means the graph has a cycle and resolution fails
/// with `CycleDetected`.
pub fn resolve_effective_permissions(
    graph: &RoleGraph,
    role_id: &RoleId,
    as_of: DateTime<Utc>,
) -> AegisResult<HashSet<PermissionId>> {
    let mut effective: HashSet<PermissionId> = HashSet::new();
    let mut denied: HashSet<PermissionId> = HashSet::new();
    let mut visited: HashSet<RoleId> = HashSet::new();

    let mut current = Some(role_id.clone());
    while let Some(id) = current {
        if !visited.insert(id.clone()) {
            return Err(AegisError::cycle_detected(id.as_str()));
        }

        let Some(role) = graph.role(&id) else {
            return Err(AegisError::not_found("role", id.as_str()));
        };

        // Inactive roles contribute nothing and cut the chain. The starting
        // role itself being inactive yields an empty set rather than an
        // error; the engine filters inactive assignments earlier anyway.
        if !role.is_active {
            break;
        }

        for grant in graph.grants_of(&id) {
            if !grant.is_effective_at(as_of) {
                continue;
            }
            if grant.is_granted {
                if !denied.contains(&grant.permission_id) {
                    effective.insert(grant.permission_id.clone());
                }
            } else {
                // Deny at this level wins over grants from further ancestors,
                // and retracts a same-level grant.
                denied.insert(grant.permission_id.clone());
                effective.remove(&grant.permission_id);
            }
        }

        if !role.inherit_permissions {
            break;
        }
        current = role.parent_id.clone();
    }

    debug!(
        role_id = %role_id,
        permissions = effective.len(),
        levels = visited.len(),
        "Resolved effective permissions"
    );
    Ok(effective)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::temporal::TemporalRange;
    use chrono::Duration;

    fn perm(code: &str) -> PermissionId {
        PermissionId::new(code)
    }

    fn grant(role: &str, permission: &str) -> RolePermission {
        RolePermission::grant(RoleId::new(role), perm(permission))
    }

    fn deny(role: &str, permission: &str) -> RolePermission {
        RolePermission::deny(RoleId::new(role), perm(permission))
    }

    /// admin(0) <- manager(10) <- editor(20)
    fn three_level_graph() -> RoleGraph {
        let mut g = RoleGraph::new();
        let admin = Role::new("admin", "Administrator", 0);
        let manager = Role::new("manager", "Manager", 10).with_parent(admin.id.clone());
        let editor = Role::new("editor", "Editor", 20).with_parent(manager.id.clone());
        g.add_role(admin);
        g.add_role(manager);
        g.add_role(editor);
        g.add_grant(grant("admin", "users:MANAGE"));
        g.add_grant(grant("manager", "documents:APPROVE"));
        g.add_grant(grant("editor", "documents:READ"));
        g.add_grant(grant("editor", "documents:UPDATE"));
        g
    }

    #[test]
    fn test_inherits_through_chain() {
        let g = three_level_graph();
        let perms = resolve_effective_permissions(&g, &RoleId::new("editor"), Utc::now()).unwrap();
        assert!(perms.contains(&perm("documents:READ")));
        assert!(perms.contains(&perm("documents:APPROVE")));
        assert!(perms.contains(&perm("users:MANAGE")));
        assert_eq!(perms.len(), 4);
    }

    #[test]
    fn test_closer_deny_overrides_ancestor_grant() {
        let mut g = three_level_graph();
        g.add_grant(deny("editor", "users:MANAGE"));
        let perms = resolve_effective_permissions(&g, &RoleId::new("editor"), Utc::now()).unwrap();
        assert!(!perms.contains(&perm("users:MANAGE")));
        assert!(perms.contains(&perm("documents:READ")));
    }

    #[test]
    fn test_deny_does_not_leak_upward() {
        // A deny on the child must not strip the permission from the parent's
        // own resolution.
        let mut g = three_level_graph();
        g.add_grant(deny("editor", "documents:APPROVE"));

        let editor = resolve_effective_permissions(&g, &RoleId::new("editor"), Utc::now()).unwrap();
        assert!(!editor.contains(&perm("documents:APPROVE")));

        let manager =
            resolve_effective_permissions(&g, &RoleId::new("manager"), Utc::now()).unwrap();
        assert!(manager.contains(&perm("documents:APPROVE")));
    }

    #[test]
    fn test_inheritance_boundary() {
        let mut g = RoleGraph::new();
        let admin = Role::new("admin", "Administrator", 0);
        let contractor = Role::new("contractor", "Contractor", 30)
            .with_parent(admin.id.clone())
            .without_inheritance();
        g.add_role(admin);
        g.add_role(contractor);
        g.add_grant(grant("admin", "users:MANAGE"));
        g.add_grant(grant("contractor", "documents:READ"));

        let perms =
            resolve_effective_permissions(&g, &RoleId::new("contractor"), Utc::now()).unwrap();
        assert!(perms.contains(&perm("documents:READ")));
        assert!(!perms.contains(&perm("users:MANAGE")));
    }

    #[test]
    fn test_inactive_ancestor_terminates_walk() {
        let mut g = RoleGraph::new();
        let admin = Role::new("admin", "Administrator", 0);
        let manager = Role::new("manager", "Manager", 10)
            .with_parent(admin.id.clone())
            .deactivated();
        let editor = Role::new("editor", "Editor", 20).with_parent(manager.id.clone());
        g.add_role(admin);
        g.add_role(manager);
        g.add_role(editor);
        g.add_grant(grant("admin", "users:MANAGE"));
        g.add_grant(grant("manager", "documents:APPROVE"));
        g.add_grant(grant("editor", "documents:READ"));

        let perms = resolve_effective_permissions(&g, &RoleId::new("editor"), Utc::now()).unwrap();
        assert!(perms.contains(&perm("documents:READ")));
        assert!(!perms.contains(&perm("documents:APPROVE")));
        assert!(!perms.contains(&perm("users:MANAGE")));
    }

    #[test]
    fn test_expired_grant_skipped() {
        let mut g = three_level_graph();
        let expired = TemporalRange::new(
            Utc::now() - Duration::days(10),
            Some(Utc::now() - Duration::days(1)),
        )
        .unwrap();
        g.add_grant(grant("editor", "documents:DELETE").with_validity(expired));

        let perms = resolve_effective_permissions(&g, &RoleId::new("editor"), Utc::now()).unwrap();
        assert!(!perms.contains(&perm("documents:DELETE")));
    }

    #[test]
    fn test_revoked_grant_skipped() {
        let mut g = three_level_graph();
        let mut revoked = grant("editor", "documents:DELETE");
        revoked.is_active = false;
        g.add_grant(revoked);

        let perms = resolve_effective_permissions(&g, &RoleId::new("editor"), Utc::now()).unwrap();
        assert!(!perms.contains(&perm("documents:DELETE")));
        assert!(perms.contains(&perm("documents:READ")));
    }

    #[test]
    fn test_future_grant_visible_at_future_instant() {
        let mut g = three_level_graph();
        let starts_tomorrow =
            TemporalRange::new(Utc::now() + Duration::days(1), None).unwrap();
        g.add_grant(grant("editor", "documents:PUBLISH").with_validity(starts_tomorrow));

        let now = resolve_effective_permissions(&g, &RoleId::new("editor"), Utc::now()).unwrap();
        assert!(!now.contains(&perm("documents:PUBLISH")));

        let later = resolve_effective_permissions(
            &g,
            &RoleId::new("editor"),
            Utc::now() + Duration::days(2),
        )
        .unwrap();
        assert!(later.contains(&perm("documents:PUBLISH")));
    }

    #[test]
    fn test_cycle_detected() {
        let mut g = RoleGraph::new();
        let mut a = Role::new("a", "A", 0);
        let b = Role::new("b", "B", 1).with_parent(a.id.clone());
        a.parent_id = Some(b.id.clone());
        g.add_role(a);
        g.add_role(b);

        let err = resolve_effective_permissions(&g, &RoleId::new("a"), Utc::now()).unwrap_err();
        assert_eq!(err.code, ErrorCode::CycleDetected);
    }

    #[test]
    fn test_self_parent_cycle() {
        let mut g = RoleGraph::new();
        let mut solo = Role::new("solo", "Solo", 0);
        solo.parent_id = Some(solo.id.clone());
        g.add_role(solo);

        let err = resolve_effective_permissions(&g, &RoleId::new("solo"), Utc::now()).unwrap_err();
        assert_eq!(err.code, ErrorCode::CycleDetected);
    }

    #[test]
    fn test_missing_role_is_error() {
        let g = RoleGraph::new();
        let err = resolve_effective_permissions(&g, &RoleId::new("ghost"), Utc::now()).unwrap_err();
        assert_eq!(err.code, ErrorCode::RecordNotFound);
    }

    #[test]
    fn test_inactive_start_role_is_empty() {
        let mut g = RoleGraph::new();
        g.add_role(Role::new("dormant", "Dormant", 5).deactivated());
        g.add_grant(grant("dormant", "documents:READ"));

        let perms =
            resolve_effective_permissions(&g, &RoleId::new("dormant"), Utc::now()).unwrap();
        assert!(perms.is_empty());
    }
}
