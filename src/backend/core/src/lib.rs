#![allow(clippy::result_large_err)]
//! # Aegis Core
//!
//! Permission evaluation and temporal validity engine for RBAC
//! administration.
//!
//! ## Architecture
//!
//! - **Temporal**: validity windows, overlap detection, and declarative
//!   validity filters
//! - **Models**: roles, permissions, and temporally-bounded grants
//! - **Policy**: typed contextual policy rules (time, location, attribute,
//!   contextual, hierarchical)
//! - **Hierarchy**: effective-permission resolution over the role forest
//!   with deny overrides and cycle detection
//! - **Engine**: the fail-closed decision entry point with caching and a
//!   mandatory audit trail
//! - **Store**: async persistence port with an in-memory implementation
//! - **Cache**: pluggable decision cache with event-driven invalidation
//! - **Audit**: append-only check logs

pub mod audit;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod hierarchy;
pub mod models;
pub mod policy;
pub mod store;
pub mod telemetry;
pub mod temporal;

pub use error::{AegisError, AegisResult, ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::audit::{AuditSink, CheckLog, MemoryAuditSink, TracingAuditSink};
    pub use crate::cache::{
        Cache, CacheBackend, CacheConfig, CacheKey, ChangeEvent, InMemoryBackend, InMemoryConfig,
        InvalidationEngine, InvalidationEvent, KeyType, RedisBackend, RedisConfig,
    };
    pub use crate::config::AegisConfig;
    pub use crate::engine::{CheckRequest, Decision, DecisionEngine, EngineConfig};
    pub use crate::error::{
        AegisError, AegisResult, ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity,
    };
    pub use crate::hierarchy::{resolve_effective_permissions, RoleGraph};
    pub use crate::models::{
        Permission, PermissionId, PolicyId, ResourcePermission, Role, RoleId, RolePermission,
        Scope, UserId, UserRole,
    };
    pub use crate::policy::{
        evaluate_policies, Condition, ConditionOp, ConditionOperator, HourRange, PermissionPolicy,
        PolicyEffect, PolicyRules, PolicyVerdict, RequestContext,
    };
    pub use crate::store::{InMemoryStore, PermissionStore};
    pub use crate::temporal::{
        build_validity_filter, do_periods_overlap, far_future, is_currently_valid, overlap_filter,
        validate_range, FilterExpr, TemporalRange,
    };
}
