//! Persistence port and the in-memory implementation.
//!
//! The decision engine never talks to a database directly; it reads through
//! [`PermissionStore`]. A SQL-backed implementation would translate the
//! declarative [`FilterExpr`](crate::temporal::FilterExpr) queries into WHERE
//! clauses; [`InMemoryStore`] evaluates them in place and doubles as the test
//! double for the whole evaluation stack.
//!
//! All mutations are soft-delete: revocation deactivates or closes windows,
//! rows are never removed. Every mutation that can change a user's effective
//! permissions publishes a [`ChangeEvent`] so the cache can drop stale
//! entries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::cache::ChangeEvent;
use crate::error::{AegisError, AegisResult, ErrorCode};
use crate::hierarchy::RoleGraph;
use crate::models::{
    Permission, PermissionId, PolicyId, ResourcePermission, Role, RoleId, RolePermission, Scope,
    UserId, UserRole,
};
use crate::policy::PermissionPolicy;
use crate::temporal::{overlap_filter, validate_range};

// ═══════════════════════════════════════════════════════════════════════════════
// Port
// ═══════════════════════════════════════════════════════════════════════════════

/// Read and mutation surface the engine and administrative callers use.
#[async_trait]
pub trait PermissionStore: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────────

    /// All role assignments for a user that are active and valid at `as_of`.
    async fn user_roles(&self, user_id: &UserId, as_of: DateTime<Utc>)
        -> AegisResult<Vec<UserRole>>;

    /// Snapshot of all roles and role grants for hierarchy resolution.
    async fn role_graph(&self) -> AegisResult<RoleGraph>;

    /// All resource-specific grant rows (active or not) for a user,
    /// permission, and resource instance.
    async fn resource_grants(
        &self,
        user_id: &UserId,
        permission_id: &PermissionId,
        resource_type: &str,
        resource_id: &str,
    ) -> AegisResult<Vec<ResourcePermission>>;

    /// The currently active policy set.
    async fn active_policies(&self) -> AegisResult<Vec<PermissionPolicy>>;

    /// Look up the permission matching `(resource, action, scope)`.
    async fn permission_by_parts(
        &self,
        resource: &str,
        action: &str,
        scope: Option<Scope>,
    ) -> AegisResult<Option<Permission>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Mutations
    // ─────────────────────────────────────────────────────────────────────────

    /// Assign a role to a user.
    async fn assign_role(&self, assignment: UserRole) -> AegisResult<()>;

    /// Revoke a user's role assignment (soft delete).
    async fn revoke_role(&self, user_id: &UserId, role_id: &RoleId) -> AegisResult<()>;

    /// Grant (or deny) a permission to a role. Rejects grants whose validity
    /// window overlaps an active grant of the same polarity for the same
    /// (role, permission); a deny override may overlap the grant it retracts.
    async fn grant_role_permission(&self, grant: RolePermission) -> AegisResult<()>;

    /// Revoke a role's permission grant (soft delete).
    async fn revoke_role_permission(
        &self,
        role_id: &RoleId,
        permission_id: &PermissionId,
    ) -> AegisResult<()>;

    /// Grant a permission to a user for one resource instance.
    async fn grant_resource_permission(&self, grant: ResourcePermission) -> AegisResult<()>;

    /// Revoke a resource-specific grant (soft delete).
    async fn revoke_resource_permission(
        &self,
        user_id: &UserId,
        permission_id: &PermissionId,
        resource_type: &str,
        resource_id: &str,
    ) -> AegisResult<()>;

    /// Create or replace a policy; its rules are validated first.
    async fn upsert_policy(&self, policy: PermissionPolicy) -> AegisResult<()>;

    /// Deactivate a policy (soft delete).
    async fn deactivate_policy(&self, policy_id: &PolicyId) -> AegisResult<()>;

    /// Subscribe to grant/policy change events.
    fn change_events(&self) -> broadcast::Receiver<ChangeEvent>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-memory implementation
// ═══════════════════════════════════════════════════════════════════════════════

/// Dashmap-backed store for single-node deployments and tests.
pub struct InMemoryStore {
    roles: DashMap<RoleId, Role>,
    permissions: DashMap<PermissionId, Permission>,
    role_permissions: DashMap<RoleId, Vec<RolePermission>>,
    user_roles: DashMap<UserId, Vec<UserRole>>,
    resource_permissions: DashMap<UserId, Vec<ResourcePermission>>,
    policies: DashMap<PolicyId, PermissionPolicy>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(1024);
        Self {
            roles: DashMap::new(),
            permissions: DashMap::new(),
            role_permissions: DashMap::new(),
            user_roles: DashMap::new(),
            resource_permissions: DashMap::new(),
            policies: DashMap::new(),
            changes,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Catalog management
    // ─────────────────────────────────────────────────────────────────────────

    /// Register a role.
    pub fn add_role(&self, role: Role) {
        debug!(role_id = %role.id, "Adding role");
        self.roles.insert(role.id.clone(), role);
    }

    /// Register a permission.
    pub fn add_permission(&self, permission: Permission) {
        self.permissions
            .insert(permission.id.clone(), permission);
    }

    /// Deactivate a role (soft delete). System roles cannot be deactivated.
    pub fn deactivate_role(&self, role_id: &RoleId) -> AegisResult<()> {
        let mut role = self
            .roles
            .get_mut(role_id)
            .ok_or_else(|| AegisError::not_found("role", role_id.as_str()))?;
        if role.is_system {
            return Err(AegisError::validation(format!(
                "Cannot deactivate system role {}",
                role_id
            )));
        }
        role.is_active = false;
        role.updated_at = Utc::now();
        Ok(())
    }

    fn emit(&self, event: ChangeEvent) {
        // No subscribers is fine.
        let _ = self.changes.send(event);
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PermissionStore for InMemoryStore {
    async fn user_roles(
        &self,
        user_id: &UserId,
        as_of: DateTime<Utc>,
    ) -> AegisResult<Vec<UserRole>> {
        Ok(self
            .user_roles
            .get(user_id)
            .map(|rows| {
                rows.iter()
                    .filter(|r| r.is_effective_at(as_of))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn role_graph(&self) -> AegisResult<RoleGraph> {
        let mut graph = RoleGraph::new();
        for role in self.roles.iter() {
            graph.add_role(role.value().clone());
        }
        for grants in self.role_permissions.iter() {
            for grant in grants.value() {
                graph.add_grant(grant.clone());
            }
        }
        Ok(graph)
    }

    async fn resource_grants(
        &self,
        user_id: &UserId,
        permission_id: &PermissionId,
        resource_type: &str,
        resource_id: &str,
    ) -> AegisResult<Vec<ResourcePermission>> {
        Ok(self
            .resource_permissions
            .get(user_id)
            .map(|rows| {
                rows.iter()
                    .filter(|g| {
                        g.permission_id == *permission_id
                            && g.resource_type == resource_type
                            && g.resource_id == resource_id
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn active_policies(&self) -> AegisResult<Vec<PermissionPolicy>> {
        Ok(self
            .policies
            .iter()
            .filter(|p| p.value().is_active)
            .map(|p| p.value().clone())
            .collect())
    }

    async fn permission_by_parts(
        &self,
        resource: &str,
        action: &str,
        scope: Option<Scope>,
    ) -> AegisResult<Option<Permission>> {
        // Prefer an exact scope match, fall back to an unscoped permission.
        let mut unscoped = None;
        for perm in self.permissions.iter() {
            let p = perm.value();
            if p.resource != resource || p.action != action {
                continue;
            }
            if p.scope == scope {
                return Ok(Some(p.clone()));
            }
            if p.scope.is_none() {
                unscoped = Some(p.clone());
            }
        }
        Ok(unscoped)
    }

    async fn assign_role(&self, assignment: UserRole) -> AegisResult<()> {
        if !self.roles.contains_key(&assignment.role_id) {
            return Err(AegisError::not_found("role", assignment.role_id.as_str()));
        }
        validate_range(
            assignment.validity.effective_from,
            assignment.validity.effective_until,
        )?;

        let user_id = assignment.user_id.clone();
        info!(user_id = %user_id, role_id = %assignment.role_id, "Assigning role");
        self.user_roles
            .entry(user_id.clone())
            .or_default()
            .push(assignment);

        self.emit(ChangeEvent::GrantsChanged { user_id });
        Ok(())
    }

    async fn revoke_role(&self, user_id: &UserId, role_id: &RoleId) -> AegisResult<()> {
        let mut rows = self
            .user_roles
            .get_mut(user_id)
            .ok_or_else(|| AegisError::not_found("user role assignment", user_id.as_str()))?;

        let mut revoked = false;
        for row in rows.iter_mut() {
            if row.role_id == *role_id && row.is_active {
                row.is_active = false;
                revoked = true;
            }
        }
        drop(rows);

        if !revoked {
            return Err(AegisError::not_found(
                "active role assignment",
                format!("{}/{}", user_id, role_id),
            ));
        }

        info!(user_id = %user_id, role_id = %role_id, "Revoked role");
        self.emit(ChangeEvent::GrantsChanged {
            user_id: user_id.clone(),
        });
        Ok(())
    }

    async fn grant_role_permission(&self, grant: RolePermission) -> AegisResult<()> {
        if !self.roles.contains_key(&grant.role_id) {
            return Err(AegisError::not_found("role", grant.role_id.as_str()));
        }
        if !self.permissions.contains_key(&grant.permission_id) {
            return Err(AegisError::not_found(
                "permission",
                grant.permission_id.as_str(),
            ));
        }
        validate_range(
            grant.validity.effective_from,
            grant.validity.effective_until,
        )?;

        // Reject a second live grant of the same polarity whose window
        // overlaps. Deny overrides may overlap the grant they retract, and
        // revoked rows no longer conflict.
        let filter = overlap_filter(
            Some(grant.validity.effective_from),
            grant.validity.effective_until,
        );
        if let Some(existing) = self.role_permissions.get(&grant.role_id) {
            let conflict = existing
                .iter()
                .filter(|g| {
                    g.permission_id == grant.permission_id
                        && g.is_active
                        && g.is_granted == grant.is_granted
                })
                .any(|g| filter.matches(&g.validity));
            if conflict {
                return Err(AegisError::new(
                    ErrorCode::OverlappingGrant,
                    format!(
                        "Role {} already has an overlapping grant for {}",
                        grant.role_id, grant.permission_id
                    ),
                ));
            }
        }

        let role_id = grant.role_id.clone();
        info!(role_id = %role_id, permission_id = %grant.permission_id, is_granted = grant.is_granted, "Granting role permission");
        self.role_permissions
            .entry(role_id.clone())
            .or_default()
            .push(grant);

        self.emit(ChangeEvent::RoleChanged {
            role_id: role_id.to_string(),
        });
        Ok(())
    }

    async fn revoke_role_permission(
        &self,
        role_id: &RoleId,
        permission_id: &PermissionId,
    ) -> AegisResult<()> {
        let mut rows = self
            .role_permissions
            .get_mut(role_id)
            .ok_or_else(|| AegisError::not_found("role permission grant", role_id.as_str()))?;

        let mut revoked = false;
        for row in rows.iter_mut() {
            if row.permission_id == *permission_id && row.is_active {
                row.is_active = false;
                revoked = true;
            }
        }
        drop(rows);

        if !revoked {
            return Err(AegisError::not_found(
                "active role permission grant",
                format!("{}/{}", role_id, permission_id),
            ));
        }

        info!(role_id = %role_id, permission_id = %permission_id, "Revoked role permission");
        self.emit(ChangeEvent::RoleChanged {
            role_id: role_id.to_string(),
        });
        Ok(())
    }

    async fn grant_resource_permission(&self, grant: ResourcePermission) -> AegisResult<()> {
        if !self.permissions.contains_key(&grant.permission_id) {
            return Err(AegisError::not_found(
                "permission",
                grant.permission_id.as_str(),
            ));
        }
        if let Some(until) = grant.valid_until {
            validate_range(grant.granted_at, Some(until))?;
        }
        if grant.grant_reason.trim().is_empty() {
            return Err(AegisError::validation(
                "Resource grants require a grant reason",
            ));
        }

        let user_id = grant.user_id.clone();
        info!(
            user_id = %user_id,
            permission_id = %grant.permission_id,
            resource = format!("{}/{}", grant.resource_type, grant.resource_id),
            "Granting resource permission"
        );
        self.resource_permissions
            .entry(user_id.clone())
            .or_default()
            .push(grant);

        self.emit(ChangeEvent::GrantsChanged { user_id });
        Ok(())
    }

    async fn revoke_resource_permission(
        &self,
        user_id: &UserId,
        permission_id: &PermissionId,
        resource_type: &str,
        resource_id: &str,
    ) -> AegisResult<()> {
        let mut rows = self
            .resource_permissions
            .get_mut(user_id)
            .ok_or_else(|| AegisError::not_found("resource grant", user_id.as_str()))?;

        let mut revoked = false;
        for row in rows.iter_mut() {
            if row.permission_id == *permission_id
                && row.resource_type == resource_type
                && row.resource_id == resource_id
                && row.is_active
            {
                row.is_active = false;
                revoked = true;
            }
        }
        drop(rows);

        if !revoked {
            return Err(AegisError::not_found(
                "active resource grant",
                format!("{}/{}/{}", user_id, resource_type, resource_id),
            ));
        }

        info!(user_id = %user_id, resource = format!("{}/{}", resource_type, resource_id), "Revoked resource permission");
        self.emit(ChangeEvent::GrantsChanged {
            user_id: user_id.clone(),
        });
        Ok(())
    }

    async fn upsert_policy(&self, policy: PermissionPolicy) -> AegisResult<()> {
        policy.rules.validate()?;
        info!(policy = %policy.code, kind = policy.rules.kind(), "Upserting policy");
        self.policies.insert(policy.id.clone(), policy);
        self.emit(ChangeEvent::PoliciesChanged);
        Ok(())
    }

    async fn deactivate_policy(&self, policy_id: &PolicyId) -> AegisResult<()> {
        let mut policy = self
            .policies
            .get_mut(policy_id)
            .ok_or_else(|| AegisError::not_found("policy", policy_id.as_str()))?;
        policy.is_active = false;
        drop(policy);

        self.emit(ChangeEvent::PoliciesChanged);
        Ok(())
    }

    fn change_events(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
