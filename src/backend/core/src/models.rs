//! RBAC data models: identifiers, permissions, roles, and grant records.
//!
//! Every grant type here is a temporal record (see [`crate::temporal`]):
//! revocation deactivates or closes the window, it never deletes the row,
//! preserving the audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::temporal::TemporalRange;

// ═══════════════════════════════════════════════════════════════════════════════
// Identifiers
// ═══════════════════════════════════════════════════════════════════════════════

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn random() -> Self {
                Self(Uuid::new_v4().to_string())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id! {
    /// Strongly-typed user identifier (the identity provider's subject id).
    UserId
}

string_id! {
    /// Strongly-typed role identifier.
    RoleId
}

string_id! {
    /// Strongly-typed permission identifier.
    PermissionId
}

string_id! {
    /// Strongly-typed policy identifier.
    PolicyId
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scope
// ═══════════════════════════════════════════════════════════════════════════════

/// Breadth qualifier of a permission: how far the action reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Scope {
    /// The caller's own records only.
    Own,
    /// Records within the caller's department.
    Department,
    /// Records anywhere in the organization.
    Organization,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Own => "OWN",
            Self::Department => "DEPARTMENT",
            Self::Organization => "ORGANIZATION",
        };
        write!(f, "{}", s)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Permission
// ═══════════════════════════════════════════════════════════════════════════════

/// A permission represents an action on a resource type, optionally bounded
/// by a [`Scope`].
///
/// Identity is immutable once the permission is referenced by grants; the
/// `code` is the canonical `resource:action[:scope]` form used in logs and
/// cache keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permission {
    /// Unique permission identifier.
    pub id: PermissionId,
    /// Canonical code, e.g. `documents:READ` or `documents:READ:DEPARTMENT`.
    pub code: String,
    /// The resource type (e.g., "documents", "users").
    pub resource: String,
    /// The action (e.g., "READ", "UPDATE", "DELETE", "MANAGE").
    pub action: String,
    /// Optional breadth qualifier.
    pub scope: Option<Scope>,
}

impl Permission {
    /// Create a permission, deriving the canonical code.
    pub fn new(
        resource: impl Into<String>,
        action: impl Into<String>,
        scope: Option<Scope>,
    ) -> Self {
        let resource = resource.into();
        let action = action.into();
        let code = match scope {
            Some(s) => format!("{}:{}:{}", resource, action, s),
            None => format!("{}:{}", resource, action),
        };
        Self {
            id: PermissionId::new(&code),
            code,
            resource,
            action,
            scope,
        }
    }

    /// Check whether this permission satisfies a request for
    /// `(resource, action, scope)`.
    ///
    /// A permission without a scope covers any requested scope; a scoped
    /// permission only covers requests for that exact scope or requests that
    /// did not name one.
    pub fn satisfies(&self, resource: &str, action: &str, scope: Option<Scope>) -> bool {
        if self.resource != resource || self.action != action {
            return false;
        }
        match (self.scope, scope) {
            (None, _) => true,
            (Some(_), None) => true,
            (Some(own), Some(requested)) => own == requested,
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Role
// ═══════════════════════════════════════════════════════════════════════════════

/// A role groups permission grants and sits in a forest via `parent_id`.
///
/// `inherit_permissions` describes the edge from this role to its parent:
/// when false, the ancestor chain above this role contributes nothing.
/// A role must never be its own ancestor; the hierarchy resolver enforces
/// this with a visited set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    /// Unique role identifier.
    pub id: RoleId,
    /// Stable machine-readable code (e.g., "editor").
    pub code: String,
    /// Human-readable name.
    pub name: String,
    /// Integer rank; lower number denotes higher authority.
    pub hierarchy_level: i32,
    /// Parent role, if any.
    pub parent_id: Option<RoleId>,
    /// Whether permissions inherit across the edge to the parent.
    pub inherit_permissions: bool,
    /// Soft-delete flag.
    pub is_active: bool,
    /// Built-in system role (cannot be deleted).
    pub is_system: bool,
    /// When the role was created.
    pub created_at: DateTime<Utc>,
    /// When the role was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Role {
    /// Create a new active, non-system role with no parent.
    pub fn new(code: impl Into<String>, name: impl Into<String>, hierarchy_level: i32) -> Self {
        let code = code.into();
        let now = Utc::now();
        Self {
            id: RoleId::new(&code),
            code,
            name: name.into(),
            hierarchy_level,
            parent_id: None,
            inherit_permissions: true,
            is_active: true,
            is_system: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Attach this role under a parent.
    pub fn with_parent(mut self, parent_id: RoleId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    /// Stop permission inheritance at the edge to the parent.
    pub fn without_inheritance(mut self) -> Self {
        self.inherit_permissions = false;
        self
    }

    /// Mark this as a system role.
    pub fn system(mut self) -> Self {
        self.is_system = true;
        self
    }

    /// Soft-delete this role.
    pub fn deactivated(mut self) -> Self {
        self.is_active = false;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Grants
// ═══════════════════════════════════════════════════════════════════════════════

/// Grant (or explicit deny) of a permission to a role, temporally bounded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolePermission {
    pub role_id: RoleId,
    pub permission_id: PermissionId,
    /// When false, this is an explicit deny override: the permission is
    /// removed from the effective set even if an ancestor grants it.
    pub is_granted: bool,
    /// Effective window of the grant.
    pub validity: TemporalRange,
    /// Who created the grant.
    pub granted_by: Option<UserId>,
    /// Soft-delete flag; revocation clears this, never deletes the row.
    pub is_active: bool,
}

impl RolePermission {
    pub fn grant(role_id: RoleId, permission_id: PermissionId) -> Self {
        Self {
            role_id,
            permission_id,
            is_granted: true,
            validity: TemporalRange::starting_now(),
            granted_by: None,
            is_active: true,
        }
    }

    pub fn deny(role_id: RoleId, permission_id: PermissionId) -> Self {
        Self {
            is_granted: false,
            ..Self::grant(role_id, permission_id)
        }
    }

    pub fn with_validity(mut self, validity: TemporalRange) -> Self {
        self.validity = validity;
        self
    }

    pub fn granted_by(mut self, user_id: UserId) -> Self {
        self.granted_by = Some(user_id);
        self
    }

    /// Active and temporally valid at the given instant.
    pub fn is_effective_at(&self, as_of: DateTime<Utc>) -> bool {
        self.is_active && self.validity.is_valid_at(as_of)
    }
}

/// Assignment of a role to a user, temporally bounded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRole {
    pub user_id: UserId,
    pub role_id: RoleId,
    /// Effective window of the assignment.
    pub validity: TemporalRange,
    /// Who performed the assignment.
    pub assigned_by: Option<UserId>,
    /// Soft-delete flag; revocation clears this, never deletes the row.
    pub is_active: bool,
}

impl UserRole {
    pub fn new(user_id: UserId, role_id: RoleId) -> Self {
        Self {
            user_id,
            role_id,
            validity: TemporalRange::starting_now(),
            assigned_by: None,
            is_active: true,
        }
    }

    pub fn with_validity(mut self, validity: TemporalRange) -> Self {
        self.validity = validity;
        self
    }

    pub fn assigned_by(mut self, user_id: UserId) -> Self {
        self.assigned_by = Some(user_id);
        self
    }

    /// Active and temporally valid at the given instant.
    pub fn is_effective_at(&self, as_of: DateTime<Utc>) -> bool {
        self.is_active && self.validity.is_valid_at(as_of)
    }
}

/// Direct grant of a permission to a user for one concrete resource instance.
///
/// Resource-specific grants are authoritative for their `(resource_type,
/// resource_id)` pair: once any exist for a permission, they govern access to
/// that instance regardless of role-level grants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcePermission {
    pub user_id: UserId,
    pub permission_id: PermissionId,
    pub resource_type: String,
    pub resource_id: String,
    /// Optional expiry (None = no expiry).
    pub valid_until: Option<DateTime<Utc>>,
    /// Audit note explaining why the grant was made.
    pub grant_reason: String,
    pub granted_at: DateTime<Utc>,
    pub granted_by: Option<UserId>,
    /// Soft-delete flag; revocation clears this.
    pub is_active: bool,
}

impl ResourcePermission {
    pub fn new(
        user_id: UserId,
        permission_id: PermissionId,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        grant_reason: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            permission_id,
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            valid_until: None,
            grant_reason: grant_reason.into(),
            granted_at: Utc::now(),
            granted_by: None,
            is_active: true,
        }
    }

    pub fn valid_until(mut self, until: DateTime<Utc>) -> Self {
        self.valid_until = Some(until);
        self
    }

    pub fn granted_by(mut self, user_id: UserId) -> Self {
        self.granted_by = Some(user_id);
        self
    }

    /// Active and not expired at the given instant.
    pub fn is_effective_at(&self, as_of: DateTime<Utc>) -> bool {
        self.is_active
            && crate::temporal::is_currently_valid(self.granted_at, self.valid_until, as_of)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
