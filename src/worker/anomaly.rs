use crate::models::{MetricIdentity, SENTINEL_ERROR_VALUE};
use once_cell::sync::Lazy;
use regex::Regex;

/// Slow-moving cumulative metrics where one divergent read from a flaky
/// backend must not visibly corrupt the chart.
static STABILITY_SENSITIVE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(total|cumulative|ytd|balance)").expect("stability pattern"));

const MAX_RELATIVE_SWING: f64 = 0.5;

pub fn is_stability_sensitive(label: &str) -> bool {
    STABILITY_SENSITIVE.is_match(label)
}

/// Returns the value to write: the candidate, or the prior when the candidate
/// swings more than 50% against it. The sentinel is a tombstone, never a
/// usable prior.
pub fn validate(identity: &MetricIdentity, candidate: f64, prior: Option<f64>) -> f64 {
    if !is_stability_sensitive(&identity.label) {
        return candidate;
    }
    let Some(prior) = prior.filter(|p| *p != SENTINEL_ERROR_VALUE && p.abs() > f64::EPSILON) else {
        return candidate;
    };
    if (candidate - prior).abs() > MAX_RELATIVE_SWING * prior.abs() {
        tracing::warn!(
            %identity,
            candidate,
            prior,
            "anomalous swing suppressed, keeping prior value"
        );
        return prior;
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(label: &str) -> MetricIdentity {
        MetricIdentity {
            group: "Key Metrics".to_string(),
            label: label.to_string(),
            id: 1,
        }
    }

    #[test]
    fn sixty_percent_swing_is_rejected_thirty_is_accepted() {
        let id = identity("Total Sales (Monthly)");
        assert_eq!(validate(&id, 1_600.0, Some(1_000.0)), 1_000.0);
        assert_eq!(validate(&id, 1_300.0, Some(1_000.0)), 1_300.0);
    }

    #[test]
    fn non_sensitive_labels_pass_through() {
        let id = identity("Open Orders (/day)");
        assert_eq!(validate(&id, 1_600.0, Some(1_000.0)), 1_600.0);
    }

    #[test]
    fn missing_or_sentinel_prior_accepts_the_candidate() {
        let id = identity("Total Orders");
        assert_eq!(validate(&id, 1_600.0, None), 1_600.0);
        assert_eq!(validate(&id, 1_600.0, Some(SENTINEL_ERROR_VALUE)), 1_600.0);
    }

    #[test]
    fn zero_prior_does_not_lock_the_metric_forever() {
        let id = identity("Total Orders");
        assert_eq!(validate(&id, 500.0, Some(0.0)), 500.0);
    }
}
