//! Temporal validity evaluation.
//!
//! Every grant in the system (role assignments, role permissions, resource
//! permissions) is a *temporal record*: it carries an `effective_from` instant
//! and an optional `effective_until` instant, and is never hard-deleted.
//! This module answers the two questions the rest of the engine needs:
//!
//! - Is a record valid at a given instant?
//! - Does a candidate interval intersect an existing one?
//!
//! It also builds declarative [`FilterExpr`] trees for the store layer, so
//! validity windows are expressed once and evaluated (or translated) by the
//! backend rather than duplicated as ad-hoc date comparisons.
//!
//! All functions here are pure; no I/O, no clock access unless the caller
//! passes `Utc::now()` explicitly.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AegisError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Sentinel
// ═══════════════════════════════════════════════════════════════════════════════

/// Far-future sentinel standing in for "no expiry".
///
/// A `None` end bound means the record never expires. Timestamps cannot
/// represent infinity, so interval arithmetic substitutes this fixed instant
/// (9999-12-31T23:59:59Z). Any real `effective_until` will compare strictly
/// below it.
pub fn far_future() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59).unwrap()
}

/// Resolve an optional end bound to a comparable instant.
fn effective_end(end: Option<DateTime<Utc>>) -> DateTime<Utc> {
    end.unwrap_or_else(far_future)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Temporal Range
// ═══════════════════════════════════════════════════════════════════════════════

/// An effective-from/until window attached to a grant record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemporalRange {
    /// When the record becomes effective.
    pub effective_from: DateTime<Utc>,

    /// When the record stops being effective (None = no expiry).
    pub effective_until: Option<DateTime<Utc>>,
}

impl TemporalRange {
    /// Create a validated range.
    pub fn new(
        effective_from: DateTime<Utc>,
        effective_until: Option<DateTime<Utc>>,
    ) -> Result<Self> {
        validate_range(effective_from, effective_until)?;
        Ok(Self {
            effective_from,
            effective_until,
        })
    }

    /// An open-ended range starting now.
    pub fn starting_now() -> Self {
        Self {
            effective_from: Utc::now(),
            effective_until: None,
        }
    }

    /// An open-ended range starting at the given instant.
    pub fn from(effective_from: DateTime<Utc>) -> Self {
        Self {
            effective_from,
            effective_until: None,
        }
    }

    /// Whether the range covers the given instant.
    pub fn is_valid_at(&self, as_of: DateTime<Utc>) -> bool {
        is_currently_valid(self.effective_from, self.effective_until, as_of)
    }

    /// Whether the range covers the current instant.
    pub fn is_currently_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    /// Whether this range intersects another.
    pub fn overlaps(&self, other: &TemporalRange) -> bool {
        do_periods_overlap(
            self.effective_from,
            self.effective_until,
            other.effective_from,
            other.effective_until,
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Pure Evaluation
// ═══════════════════════════════════════════════════════════════════════════════

/// Returns true iff `as_of` falls within `[effective_from, effective_until]`.
///
/// The window is inclusive on both ends; a `None` end means the record never
/// expires.
pub fn is_currently_valid(
    effective_from: DateTime<Utc>,
    effective_until: Option<DateTime<Utc>>,
    as_of: DateTime<Utc>,
) -> bool {
    effective_from <= as_of && as_of <= effective_end(effective_until)
}

/// Returns true iff the two intervals intersect.
///
/// Standard interval test: `start1 <= end2 && start2 <= end1`, with `None`
/// ends mapped to [`far_future`]. Symmetric in its two interval arguments.
pub fn do_periods_overlap(
    start1: DateTime<Utc>,
    end1: Option<DateTime<Utc>>,
    start2: DateTime<Utc>,
    end2: Option<DateTime<Utc>>,
) -> bool {
    start1 <= effective_end(end2) && start2 <= effective_end(end1)
}

/// Reject inverted ranges.
///
/// Fails with a `ValidationError` when both bounds are set and
/// `effective_from > effective_until`. Open intervals are always accepted;
/// a null end means "no expiry", never an error.
pub fn validate_range(
    effective_from: DateTime<Utc>,
    effective_until: Option<DateTime<Utc>>,
) -> Result<()> {
    if let Some(until) = effective_until {
        if effective_from > until {
            return Err(AegisError::invalid_temporal_range(
                "effectiveFrom must not be later than effectiveUntil",
            )
            .with_context("effective_from", effective_from.to_rfc3339())
            .with_context("effective_until", until.to_rfc3339()));
        }
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Declarative Filters
// ═══════════════════════════════════════════════════════════════════════════════

/// Temporal fields a filter can reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemporalField {
    EffectiveFrom,
    EffectiveUntil,
}

/// Comparison operators over temporal fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Lte,
    Gte,
    Lt,
    Gt,
}

/// A declarative filter over temporal records.
///
/// The store evaluates this tree in memory via [`FilterExpr::matches`]; a SQL
/// backend would translate the same tree into WHERE clauses. Never rendered
/// as raw query text by this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilterExpr {
    /// Matches every record.
    All,

    /// Compare a temporal field against an instant. A null `effective_until`
    /// compares as [`far_future`].
    Compare {
        field: TemporalField,
        op: CompareOp,
        value: DateTime<Utc>,
    },

    /// Matches records whose `effective_until` is null.
    UntilIsNull,

    /// All sub-expressions must match.
    And(Vec<FilterExpr>),

    /// At least one sub-expression must match.
    Or(Vec<FilterExpr>),
}

impl FilterExpr {
    /// Evaluate this filter against a record's temporal range.
    pub fn matches(&self, range: &TemporalRange) -> bool {
        match self {
            Self::All => true,
            Self::Compare { field, op, value } => {
                let actual = match field {
                    TemporalField::EffectiveFrom => range.effective_from,
                    TemporalField::EffectiveUntil => effective_end(range.effective_until),
                };
                match op {
                    CompareOp::Lte => actual <= *value,
                    CompareOp::Gte => actual >= *value,
                    CompareOp::Lt => actual < *value,
                    CompareOp::Gt => actual > *value,
                }
            }
            Self::UntilIsNull => range.effective_until.is_none(),
            Self::And(exprs) => exprs.iter().all(|e| e.matches(range)),
            Self::Or(exprs) => exprs.iter().any(|e| e.matches(range)),
        }
    }

    fn from_lte(value: DateTime<Utc>) -> Self {
        Self::Compare {
            field: TemporalField::EffectiveFrom,
            op: CompareOp::Lte,
            value,
        }
    }

    fn from_gt(value: DateTime<Utc>) -> Self {
        Self::Compare {
            field: TemporalField::EffectiveFrom,
            op: CompareOp::Gt,
            value,
        }
    }

    fn until_gte(value: DateTime<Utc>) -> Self {
        Self::Compare {
            field: TemporalField::EffectiveUntil,
            op: CompareOp::Gte,
            value,
        }
    }

    fn until_lt(value: DateTime<Utc>) -> Self {
        Self::Compare {
            field: TemporalField::EffectiveUntil,
            op: CompareOp::Lt,
            value,
        }
    }
}

/// Build a validity filter for the given reference instant.
///
/// Four mutually exclusive modes:
/// - `include_future && include_expired`: every record, regardless of dates.
/// - `include_expired` only: records whose window ended before `as_of`.
/// - `include_future` only: records whose window starts after `as_of`.
/// - neither (default): currently active records,
///   `effective_from <= as_of AND (effective_until IS NULL OR effective_until >= as_of)`.
pub fn build_validity_filter(
    as_of: DateTime<Utc>,
    include_future: bool,
    include_expired: bool,
) -> FilterExpr {
    match (include_future, include_expired) {
        (true, true) => FilterExpr::All,
        (false, true) => {
            // Expired only: window closed strictly before as_of. Open-ended
            // records never expire, so a null end is excluded by until_lt
            // (far_future < as_of is always false).
            FilterExpr::until_lt(as_of)
        }
        (true, false) => FilterExpr::from_gt(as_of),
        (false, false) => FilterExpr::And(vec![
            FilterExpr::from_lte(as_of),
            FilterExpr::Or(vec![FilterExpr::UntilIsNull, FilterExpr::until_gte(as_of)]),
        ]),
    }
}

/// Build a filter selecting existing records whose interval intersects the
/// candidate interval.
///
/// Covers all shapes of the candidate:
/// - no bounds: matches everything (an eternal grant conflicts with anything),
/// - start-only: existing record must end at or after the new start,
/// - end-only: existing record must start at or before the new end,
/// - both bounds: standard two-sided intersection, containment in either
///   direction included.
///
/// Unbounded-end existing records compare via the far-future sentinel, so an
/// open-ended record whose start precedes the new end always matches.
pub fn overlap_filter(
    effective_from: Option<DateTime<Utc>>,
    effective_until: Option<DateTime<Utc>>,
) -> FilterExpr {
    match (effective_from, effective_until) {
        (None, None) => FilterExpr::All,
        (Some(from), None) => FilterExpr::until_gte(from),
        (None, Some(until)) => FilterExpr::from_lte(until),
        (Some(from), Some(until)) => {
            FilterExpr::And(vec![FilterExpr::from_lte(until), FilterExpr::until_gte(from)])
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn test_currently_valid_inclusive_bounds() {
        let from = ts("2025-01-01T00:00:00Z");
        let until = Some(ts("2025-06-30T00:00:00Z"));

        assert!(is_currently_valid(from, until, from));
        assert!(is_currently_valid(from, until, until.unwrap()));
        assert!(is_currently_valid(from, until, ts("2025-03-15T12:00:00Z")));
        assert!(!is_currently_valid(from, until, ts("2024-12-31T23:59:59Z")));
        assert!(!is_currently_valid(from, until, ts("2025-07-01T00:00:00Z")));
    }

    #[test]
    fn test_open_ended_never_expires() {
        let from = ts("2025-01-01T00:00:00Z");
        assert!(is_currently_valid(from, None, ts("2099-01-01T00:00:00Z")));
        assert!(!is_currently_valid(from, None, ts("2024-01-01T00:00:00Z")));
    }

    #[test]
    fn test_validity_monotonic_within_window() {
        // If valid at t, valid everywhere in [from, until].
        let from = ts("2025-01-01T00:00:00Z");
        let until = ts("2025-01-10T00:00:00Z");

        let mut t = from;
        while t <= until {
            assert!(is_currently_valid(from, Some(until), t));
            t += Duration::hours(6);
        }
    }

    #[test]
    fn test_overlap_symmetry() {
        let cases = [
            (
                ts("2025-01-01T00:00:00Z"),
                Some(ts("2025-02-01T00:00:00Z")),
                ts("2025-01-15T00:00:00Z"),
                Some(ts("2025-03-01T00:00:00Z")),
            ),
            (
                ts("2025-01-01T00:00:00Z"),
                None,
                ts("2024-06-01T00:00:00Z"),
                Some(ts("2024-12-01T00:00:00Z")),
            ),
            (
                ts("2025-01-01T00:00:00Z"),
                Some(ts("2025-02-01T00:00:00Z")),
                ts("2025-03-01T00:00:00Z"),
                None,
            ),
        ];

        for (s1, e1, s2, e2) in cases {
            assert_eq!(
                do_periods_overlap(s1, e1, s2, e2),
                do_periods_overlap(s2, e2, s1, e1),
            );
        }
    }

    #[test]
    fn test_overlap_disjoint_and_touching() {
        let jan = (ts("2025-01-01T00:00:00Z"), Some(ts("2025-01-31T00:00:00Z")));
        let mar = (ts("2025-03-01T00:00:00Z"), Some(ts("2025-03-31T00:00:00Z")));
        assert!(!do_periods_overlap(jan.0, jan.1, mar.0, mar.1));

        // Shared boundary instant counts as overlap (inclusive windows).
        let feb = (ts("2025-01-31T00:00:00Z"), Some(ts("2025-02-28T00:00:00Z")));
        assert!(do_periods_overlap(jan.0, jan.1, feb.0, feb.1));
    }

    #[test]
    fn test_validate_range_rejects_inverted() {
        let err = validate_range(ts("2025-06-01T00:00:00Z"), Some(ts("2025-01-01T00:00:00Z")))
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidTemporalRange);

        // Open end is always fine.
        validate_range(ts("2025-06-01T00:00:00Z"), None).unwrap();
        // Zero-length window is fine.
        validate_range(ts("2025-06-01T00:00:00Z"), Some(ts("2025-06-01T00:00:00Z"))).unwrap();
    }

    #[test]
    fn test_validity_filter_modes() {
        let as_of = ts("2025-06-15T00:00:00Z");

        let active = TemporalRange {
            effective_from: ts("2025-01-01T00:00:00Z"),
            effective_until: Some(ts("2025-12-31T00:00:00Z")),
        };
        let open_ended = TemporalRange {
            effective_from: ts("2025-01-01T00:00:00Z"),
            effective_until: None,
        };
        let expired = TemporalRange {
            effective_from: ts("2024-01-01T00:00:00Z"),
            effective_until: Some(ts("2024-12-31T00:00:00Z")),
        };
        let future = TemporalRange {
            effective_from: ts("2026-01-01T00:00:00Z"),
            effective_until: None,
        };

        let current = build_validity_filter(as_of, false, false);
        assert!(current.matches(&active));
        assert!(current.matches(&open_ended));
        assert!(!current.matches(&expired));
        assert!(!current.matches(&future));

        let expired_only = build_validity_filter(as_of, false, true);
        assert!(expired_only.matches(&expired));
        assert!(!expired_only.matches(&active));
        assert!(!expired_only.matches(&open_ended));
        assert!(!expired_only.matches(&future));

        let future_only = build_validity_filter(as_of, true, false);
        assert!(future_only.matches(&future));
        assert!(!future_only.matches(&active));
        assert!(!future_only.matches(&expired));

        // Both flags: every record, regardless of dates.
        let all = build_validity_filter(as_of, true, true);
        for r in [&active, &open_ended, &expired, &future] {
            assert!(all.matches(r));
        }
        // Round-trip property: a record starting in 2099 with no end is
        // still returned.
        let far = TemporalRange {
            effective_from: ts("2099-01-01T00:00:00Z"),
            effective_until: None,
        };
        assert!(all.matches(&far));
    }

    #[test]
    fn test_overlap_filter_exhaustive_grid() {
        // Existing record shapes.
        let existing = [
            // both-bounded, Feb..Apr
            TemporalRange {
                effective_from: ts("2025-02-01T00:00:00Z"),
                effective_until: Some(ts("2025-04-01T00:00:00Z")),
            },
            // both-bounded, far past
            TemporalRange {
                effective_from: ts("2020-01-01T00:00:00Z"),
                effective_until: Some(ts("2020-06-01T00:00:00Z")),
            },
            // unbounded end, starts in March
            TemporalRange {
                effective_from: ts("2025-03-01T00:00:00Z"),
                effective_until: None,
            },
            // unbounded end, starts far future
            TemporalRange {
                effective_from: ts("2030-01-01T00:00:00Z"),
                effective_until: None,
            },
        ];

        // Candidate interval shapes, with the expected match vector against
        // the four existing records above.
        let cases: [(Option<&str>, Option<&str>, [bool; 4]); 4] = [
            // no bounds: matches everything
            (None, None, [true, true, true, true]),
            // start-only from Mar 15: anything still open at that point
            (Some("2025-03-15T00:00:00Z"), None, [true, false, true, true]),
            // end-only until Feb 15: anything starting at or before
            (None, Some("2025-02-15T00:00:00Z"), [true, true, false, false]),
            // both bounds Mar..May: containment in either direction included
            (
                Some("2025-03-01T00:00:00Z"),
                Some("2025-05-01T00:00:00Z"),
                [true, false, true, false],
            ),
        ];

        for (from, until, expected) in cases {
            let filter = overlap_filter(from.map(ts), until.map(ts));
            for (record, want) in existing.iter().zip(expected) {
                assert_eq!(
                    filter.matches(record),
                    want,
                    "candidate ({:?}, {:?}) vs existing {:?}",
                    from,
                    until,
                    record,
                );
            }
        }
    }

    #[test]
    fn test_overlap_filter_agrees_with_do_periods_overlap() {
        let instants = [
            ts("2025-01-01T00:00:00Z"),
            ts("2025-03-01T00:00:00Z"),
            ts("2025-06-01T00:00:00Z"),
        ];

        let mut candidates: Vec<(Option<DateTime<Utc>>, Option<DateTime<Utc>>)> = vec![(None, None)];
        for s in instants {
            candidates.push((Some(s), None));
            candidates.push((None, Some(s)));
            for e in instants {
                if s <= e {
                    candidates.push((Some(s), Some(e)));
                }
            }
        }

        let far_past = ts("2000-01-01T00:00:00Z");
        for (from, until) in &candidates {
            let filter = overlap_filter(*from, *until);
            for (efrom, euntil) in &candidates {
                let record = TemporalRange {
                    effective_from: efrom.unwrap_or(far_past),
                    effective_until: *euntil,
                };
                // An unbounded candidate start behaves like "since forever".
                let expected = do_periods_overlap(
                    from.unwrap_or(far_past),
                    *until,
                    record.effective_from,
                    record.effective_until,
                );
                assert_eq!(filter.matches(&record), expected);
            }
        }
    }

    #[test]
    fn test_far_future_sentinel_above_real_dates() {
        assert!(far_future() > ts("2999-12-31T00:00:00Z"));
    }

    #[test]
    fn test_temporal_range_constructor_validates() {
        assert!(TemporalRange::new(
            ts("2025-06-01T00:00:00Z"),
            Some(ts("2025-01-01T00:00:00Z"))
        )
        .is_err());

        let range = TemporalRange::new(ts("2025-01-01T00:00:00Z"), None).unwrap();
        assert!(range.is_valid_at(ts("2025-01-01T00:00:00Z")));
    }
}
