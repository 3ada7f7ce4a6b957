//! Pure functions: Core Web Vitals rating thresholds and report merging.
//!
//! These have no teacher-module counterpart to adapt directly — the teacher
//! has no CWV domain — so they're written as plain, dependency-free
//! functions in the teacher's general style of small pure helpers
//! (`crawl_engine::retry_queue::calculate_retry_backoff` is the closest
//! analogue: a deterministic function over a handful of numeric inputs).

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rating {
    Good,
    NeedsImprovement,
    Poor,
}

/// Largest Contentful Paint, milliseconds. Good ≤2500, NeedsImprovement ≤4000.
pub fn rate_lcp(milliseconds: f64) -> Rating {
    if milliseconds <= 2500.0 {
        Rating::Good
    } else if milliseconds <= 4000.0 {
        Rating::NeedsImprovement
    } else {
        Rating::Poor
    }
}

/// Cumulative Layout Shift, unitless. Good ≤0.1, NeedsImprovement ≤0.25.
pub fn rate_cls(value: f64) -> Rating {
    if value <= 0.1 {
        Rating::Good
    } else if value <= 0.25 {
        Rating::NeedsImprovement
    } else {
        Rating::Poor
    }
}

/// Interaction to Next Paint, milliseconds. Good ≤200, NeedsImprovement ≤500.
pub fn rate_inp(milliseconds: f64) -> Rating {
    if milliseconds <= 200.0 {
        Rating::Good
    } else if milliseconds <= 500.0 {
        Rating::NeedsImprovement
    } else {
        Rating::Poor
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Partial,
    Failed,
}

/// Step 6 of the orchestrator protocol: `success` iff every stage produced a
/// result, `partial` if lighthouse succeeded but field-data and/or synthesis
/// did not, `failed` only when both lighthouse form factors failed (signaled
/// by the caller passing `lighthouse_ok = false`).
pub fn classify_outcome(lighthouse_ok: bool, field_data_ok: bool, synthesis_ok: bool) -> AuditOutcome {
    if !lighthouse_ok {
        return AuditOutcome::Failed;
    }
    if field_data_ok && synthesis_ok {
        AuditOutcome::Success
    } else {
        AuditOutcome::Partial
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lcp_boundary_values_are_respected() {
        assert_eq!(rate_lcp(2500.0), Rating::Good);
        assert_eq!(rate_lcp(2501.0), Rating::NeedsImprovement);
        assert_eq!(rate_lcp(4000.0), Rating::NeedsImprovement);
        assert_eq!(rate_lcp(4001.0), Rating::Poor);
    }

    #[test]
    fn cls_boundary_values_are_respected() {
        assert_eq!(rate_cls(0.1), Rating::Good);
        assert_eq!(rate_cls(0.1001), Rating::NeedsImprovement);
        assert_eq!(rate_cls(0.25), Rating::NeedsImprovement);
        assert_eq!(rate_cls(0.2501), Rating::Poor);
    }

    #[test]
    fn inp_boundary_values_are_respected() {
        assert_eq!(rate_inp(200.0), Rating::Good);
        assert_eq!(rate_inp(201.0), Rating::NeedsImprovement);
        assert_eq!(rate_inp(500.0), Rating::NeedsImprovement);
        assert_eq!(rate_inp(501.0), Rating::Poor);
    }

    #[test]
    fn rating_is_idempotent_across_repeated_calls() {
        for _ in 0..5 {
            assert_eq!(rate_lcp(3000.0), Rating::NeedsImprovement);
        }
    }

    #[test]
    fn outcome_classification_matches_protocol_step_six() {
        assert_eq!(classify_outcome(true, true, true), AuditOutcome::Success);
        assert_eq!(classify_outcome(true, false, true), AuditOutcome::Partial);
        assert_eq!(classify_outcome(true, true, false), AuditOutcome::Partial);
        assert_eq!(classify_outcome(false, true, true), AuditOutcome::Failed);
    }

    proptest::proptest! {
        #[test]
        fn rate_lcp_never_panics_on_arbitrary_finite_input(value in -1.0e9f64..1.0e9f64) {
            let _ = rate_lcp(value);
        }
    }
}
