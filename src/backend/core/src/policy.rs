//! Policy rule evaluation for contextual authorization decisions.
//!
//! Policies refine a grant-based decision: the engine only consults them
//! after the grant check passed. A matching DENY from any policy overrides
//! every ALLOW; when no policy matches at all the verdict is `Neutral` and
//! the grant-based result stands. Time windows with ALLOW effect are
//! restrictions: a request outside the window is denied, not passed through.

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::{AegisError, AegisResult};
use crate::models::PolicyId;

// ═══════════════════════════════════════════════════════════════════════════════
// Request context
// ═══════════════════════════════════════════════════════════════════════════════

/// Ambient facts about the request under evaluation.
///
/// Everything a policy interpreter may inspect lives here; interpreters never
/// perform I/O.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    /// When the request happened (UTC; policies convert to their own zone).
    pub timestamp: DateTime<Utc>,
    /// Source address of the request, when known.
    pub ip_address: Option<String>,
    /// Coarse location label (e.g., office code), when known.
    pub location: Option<String>,
    /// Device identifier or class, when known.
    pub device: Option<String>,
    /// Whether the session passed multi-factor verification.
    pub mfa_verified: bool,
    /// Free-form actor attributes (department, clearance, ...).
    pub attributes: BTreeMap<String, Value>,
    /// Hierarchy level of the actor (lower = more senior), when known.
    pub actor_level: Option<i32>,
    /// Hierarchy level of the resource owner, when known.
    pub resource_owner_level: Option<i32>,
}

impl RequestContext {
    pub fn now() -> Self {
        Self::at(Utc::now())
    }

    pub fn at(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            ip_address: None,
            location: None,
            device: None,
            mfa_verified: false,
            attributes: BTreeMap::new(),
            actor_level: None,
            resource_owner_level: None,
        }
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    pub fn with_mfa(mut self, verified: bool) -> Self {
        self.mfa_verified = verified;
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn with_levels(mut self, actor: i32, resource_owner: i32) -> Self {
        self.actor_level = Some(actor);
        self.resource_owner_level = Some(resource_owner);
        self
    }

    /// Canonical rendering of every policy-relevant field except the
    /// timestamp. Cached decisions are keyed on this, so a decision computed
    /// under one context is never served to a request made under another.
    pub fn fingerprint(&self) -> String {
        let attributes = serde_json::to_string(&self.attributes).unwrap_or_default();
        format!(
            "ip={};loc={};dev={};mfa={};attrs={};actor={};owner={}",
            self.ip_address.as_deref().unwrap_or(""),
            self.location.as_deref().unwrap_or(""),
            self.device.as_deref().unwrap_or(""),
            self.mfa_verified,
            attributes,
            self.actor_level.map(|l| l.to_string()).unwrap_or_default(),
            self.resource_owner_level
                .map(|l| l.to_string())
                .unwrap_or_default(),
        )
    }

    /// Look up a context field by name, for contextual conditions.
    ///
    /// Built-in fields (`ip_address`, `location`, `device`, `mfa_verified`)
    /// shadow same-named attributes.
    fn field(&self, name: &str) -> Option<Value> {
        match name {
            "ip_address" => self.ip_address.clone().map(Value::String),
            "location" => self.location.clone().map(Value::String),
            "device" => self.device.clone().map(Value::String),
            "mfa_verified" => Some(Value::Bool(self.mfa_verified)),
            other => self.attributes.get(other).cloned(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Policy rules (typed payloads)
// ═══════════════════════════════════════════════════════════════════════════════

/// Inclusive hour window within a day, in the policy's timezone.
///
/// `start` and `end` are hours 0..=23; the window covers `start:00` up to but
/// not including `end:00`. Windows never wrap midnight; split a wrapping
/// window into two policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourRange {
    pub start: u32,
    pub end: u32,
}

impl HourRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    fn contains(&self, hour: u32) -> bool {
        hour >= self.start && hour < self.end
    }
}

/// Comparison operator for contextual conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Contains,
    Exists,
}

/// A single contextual condition over a [`RequestContext`] field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub op: ConditionOp,
    #[serde(default)]
    pub value: Value,
}

impl Condition {
    fn matches(&self, ctx: &RequestContext) -> bool {
        let actual = ctx.field(&self.field);
        match self.op {
            ConditionOp::Exists => actual.is_some(),
            ConditionOp::Eq => actual.as_ref() == Some(&self.value),
            ConditionOp::Ne => actual.as_ref() != Some(&self.value),
            ConditionOp::Gt => compare_numbers(actual.as_ref(), &self.value)
                .map(|ord| ord == std::cmp::Ordering::Greater)
                .unwrap_or(false),
            ConditionOp::Lt => compare_numbers(actual.as_ref(), &self.value)
                .map(|ord| ord == std::cmp::Ordering::Less)
                .unwrap_or(false),
            ConditionOp::Contains => match (actual, &self.value) {
                (Some(Value::String(haystack)), Value::String(needle)) => {
                    haystack.contains(needle.as_str())
                }
                (Some(Value::Array(items)), needle) => items.contains(needle),
                _ => false,
            },
        }
    }
}

fn compare_numbers(actual: Option<&Value>, expected: &Value) -> Option<std::cmp::Ordering> {
    let a = actual?.as_f64()?;
    let b = expected.as_f64()?;
    a.partial_cmp(&b)
}

/// How a contextual policy combines its conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    All,
    Any,
}

/// Typed policy rule payload. One variant per policy type; the payload is
/// validated at write time so the evaluator never meets a malformed rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyRules {
    /// Day-of-week and hour window in a named timezone. With ALLOW effect
    /// the window is a restriction: requests outside it are denied. With
    /// DENY effect the window is a blackout: requests inside it are denied
    /// and requests outside it are unaffected.
    TimeBased {
        allowed_days: Vec<Weekday>,
        allowed_hours: HourRange,
        timezone: Tz,
    },
    /// Allow or deny based on the source IP. Patterns are dotted quads where
    /// any segment may be `*` (e.g., `192.168.1.*`). The deny list wins over
    /// the allow list; a non-empty allow list without a match denies.
    LocationBased {
        #[serde(default)]
        allowed_ips: Vec<String>,
        #[serde(default)]
        denied_ips: Vec<String>,
    },
    /// Require every listed attribute to be present and equal in the context.
    AttributeBased { required: BTreeMap<String, Value> },
    /// Combine arbitrary conditions over context fields.
    Contextual {
        operator: ConditionOperator,
        conditions: Vec<Condition>,
    },
    /// Compare the actor's hierarchy level to the resource owner's
    /// (lower level = more senior).
    Hierarchical {
        /// Require the actor to be strictly senior to the resource owner.
        require_superior: bool,
        /// Maximum allowed `|actor - owner|` level distance.
        max_level_gap: Option<i32>,
    },
}

impl PolicyRules {
    /// Validate the payload. Called by the store on every policy write.
    pub fn validate(&self) -> AegisResult<()> {
        match self {
            Self::TimeBased {
                allowed_days,
                allowed_hours,
                ..
            } => {
                if allowed_days.is_empty() {
                    return Err(AegisError::invalid_policy_rules(
                        "TIME_BASED policy must allow at least one day",
                    ));
                }
                if allowed_hours.start > 23
                    || allowed_hours.end > 24
                    || allowed_hours.start >= allowed_hours.end
                {
                    return Err(AegisError::invalid_policy_rules(format!(
                        "invalid hour range {}..{}",
                        allowed_hours.start, allowed_hours.end
                    )));
                }
            }
            Self::LocationBased {
                allowed_ips,
                denied_ips,
            } => {
                if allowed_ips.is_empty() && denied_ips.is_empty() {
                    return Err(AegisError::invalid_policy_rules(
                        "LOCATION_BASED policy must list at least one IP pattern",
                    ));
                }
                for pattern in allowed_ips.iter().chain(denied_ips) {
                    validate_ip_pattern(pattern)?;
                }
            }
            Self::AttributeBased { required } => {
                if required.is_empty() {
                    return Err(AegisError::invalid_policy_rules(
                        "ATTRIBUTE_BASED policy must require at least one attribute",
                    ));
                }
            }
            Self::Contextual { conditions, .. } => {
                if conditions.is_empty() {
                    return Err(AegisError::invalid_policy_rules(
                        "CONTEXTUAL policy must have at least one condition",
                    ));
                }
                for cond in conditions {
                    if cond.field.is_empty() {
                        return Err(AegisError::invalid_policy_rules(
                            "contextual condition has an empty field name",
                        ));
                    }
                }
            }
            Self::Hierarchical { max_level_gap, .. } => {
                if let Some(gap) = max_level_gap {
                    if *gap < 0 {
                        return Err(AegisError::invalid_policy_rules(
                            "max_level_gap must be non-negative",
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Short tag for logging and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TimeBased { .. } => "TIME_BASED",
            Self::LocationBased { .. } => "LOCATION_BASED",
            Self::AttributeBased { .. } => "ATTRIBUTE_BASED",
            Self::Contextual { .. } => "CONTEXTUAL",
            Self::Hierarchical { .. } => "HIERARCHICAL",
        }
    }
}

fn validate_ip_pattern(pattern: &str) -> AegisResult<()> {
    let segments: Vec<&str> = pattern.split('.').collect();
    if segments.len() != 4 {
        return Err(AegisError::invalid_policy_rules(format!(
            "IP pattern '{}' must have four segments",
            pattern
        )));
    }
    for seg in segments {
        if seg == "*" {
            continue;
        }
        match seg.parse::<u32>() {
            Ok(n) if n <= 255 => {}
            _ => {
                return Err(AegisError::invalid_policy_rules(format!(
                    "IP pattern '{}' has invalid segment '{}'",
                    pattern, seg
                )))
            }
        }
    }
    Ok(())
}

fn ip_matches_pattern(ip: &str, pattern: &str) -> bool {
    let ip_segs: Vec<&str> = ip.split('.').collect();
    let pat_segs: Vec<&str> = pattern.split('.').collect();
    if ip_segs.len() != 4 || pat_segs.len() != 4 {
        return false;
    }
    ip_segs
        .iter()
        .zip(&pat_segs)
        .all(|(i, p)| *p == "*" || i == p)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Policies and verdicts
// ═══════════════════════════════════════════════════════════════════════════════

/// Effect a policy applies when its rules match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyEffect {
    Allow,
    Deny,
}

/// A named, prioritized policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionPolicy {
    pub id: PolicyId,
    /// Stable machine-readable code, unique among policies.
    pub code: String,
    pub rules: PolicyRules,
    pub effect: PolicyEffect,
    /// Higher priority evaluates first.
    pub priority: i32,
    pub is_active: bool,
}

impl PermissionPolicy {
    pub fn new(code: impl Into<String>, rules: PolicyRules, effect: PolicyEffect) -> Self {
        let code = code.into();
        Self {
            id: PolicyId::new(&code),
            code,
            rules,
            effect,
            priority: 0,
            is_active: true,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn deactivated(mut self) -> Self {
        self.is_active = false;
        self
    }
}

/// Outcome of evaluating a policy set against a request context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyVerdict {
    /// At least one policy matched with ALLOW and none denied.
    Allow { policy_code: String },
    /// A policy matched with DENY.
    Deny { policy_code: String, reason: String },
    /// No policy matched; the grant-based result stands.
    Neutral,
}

impl PolicyVerdict {
    pub fn is_deny(&self) -> bool {
        matches!(self, Self::Deny { .. })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Evaluation
// ═══════════════════════════════════════════════════════════════════════════════

/// Evaluate a set of policies against a request context.
///
/// Inactive policies are skipped. Policies run in priority order (descending,
/// ties broken by code for a stable order). The first DENY short-circuits,
/// whether from a matching DENY policy or from a breached time restriction;
/// otherwise any matching ALLOW yields `Allow`; if nothing matched the
/// verdict is `Neutral`.
pub fn evaluate_policies(policies: &[PermissionPolicy], ctx: &RequestContext) -> PolicyVerdict {
    let mut ordered: Vec<&PermissionPolicy> = policies.iter().filter(|p| p.is_active).collect();
    ordered.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.code.cmp(&b.code)));

    let mut allow: Option<&PermissionPolicy> = None;
    for policy in ordered {
        match interpret(policy, ctx) {
            RuleOutcome::NotApplicable => continue,
            RuleOutcome::Violated => {
                debug!(policy = %policy.code, kind = policy.rules.kind(), "Policy restriction violated");
                return PolicyVerdict::Deny {
                    policy_code: policy.code.clone(),
                    reason: format!("denied by policy '{}'", policy.code),
                };
            }
            RuleOutcome::Satisfied => {
                debug!(policy = %policy.code, kind = policy.rules.kind(), effect = ?policy.effect, "Policy matched");
                match policy.effect {
                    PolicyEffect::Deny => {
                        return PolicyVerdict::Deny {
                            policy_code: policy.code.clone(),
                            reason: format!("denied by policy '{}'", policy.code),
                        };
                    }
                    PolicyEffect::Allow => {
                        if allow.is_none() {
                            allow = Some(policy);
                        }
                    }
                }
            }
        }
    }

    match allow {
        Some(p) => PolicyVerdict::Allow {
            policy_code: p.code.clone(),
        },
        None => PolicyVerdict::Neutral,
    }
}

/// Per-policy outcome of interpreting its rules against a context.
enum RuleOutcome {
    /// The predicate holds; the policy's effect applies.
    Satisfied,
    /// A restriction the policy imposes is breached; deny regardless of
    /// effect.
    Violated,
    /// The policy says nothing about this request.
    NotApplicable,
}

fn interpret(policy: &PermissionPolicy, ctx: &RequestContext) -> RuleOutcome {
    let matched = rules_match(&policy.rules, ctx);
    match &policy.rules {
        // An ALLOW time window restricts *when* access is permitted, so
        // falling outside it denies rather than abstains. A DENY window is a
        // blackout and stays silent outside its hours.
        PolicyRules::TimeBased { .. } if !matched && policy.effect == PolicyEffect::Allow => {
            RuleOutcome::Violated
        }
        _ if matched => RuleOutcome::Satisfied,
        _ => RuleOutcome::NotApplicable,
    }
}

/// Whether a policy's rules match the context.
///
/// "Match" means the rule's predicate holds; the policy's effect decides what
/// a match means for the decision.
fn rules_match(rules: &PolicyRules, ctx: &RequestContext) -> bool {
    match rules {
        PolicyRules::TimeBased {
            allowed_days,
            allowed_hours,
            timezone,
        } => {
            let local = ctx.timestamp.with_timezone(timezone);
            allowed_days.contains(&local.weekday()) && allowed_hours.contains(local.hour())
        }
        PolicyRules::LocationBased {
            allowed_ips,
            denied_ips,
        } => {
            // An unknown source address never satisfies a location rule.
            let Some(ip) = ctx.ip_address.as_deref() else {
                return false;
            };
            if denied_ips.iter().any(|p| ip_matches_pattern(ip, p)) {
                return false;
            }
            if allowed_ips.is_empty() {
                return true;
            }
            allowed_ips.iter().any(|p| ip_matches_pattern(ip, p))
        }
        PolicyRules::AttributeBased { required } => required.iter().all(|(key, expected)| {
            if key == "mfa_verified" {
                return Value::Bool(ctx.mfa_verified) == *expected;
            }
            ctx.attributes.get(key) == Some(expected)
        }),
        PolicyRules::Contextual {
            operator,
            conditions,
        } => match operator {
            ConditionOperator::All => conditions.iter().all(|c| c.matches(ctx)),
            ConditionOperator::Any => conditions.iter().any(|c| c.matches(ctx)),
        },
        PolicyRules::Hierarchical {
            require_superior,
            max_level_gap,
        } => {
            let (Some(actor), Some(owner)) = (ctx.actor_level, ctx.resource_owner_level) else {
                return false;
            };
            if *require_superior && actor >= owner {
                return false;
            }
            if let Some(gap) = max_level_gap {
                if (actor - owner).abs() > *gap {
                    return false;
                }
            }
            true
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
