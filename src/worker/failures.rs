use crate::models::MetricIdentity;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

const COOLING_THRESHOLD: u32 = 5;
const IDLE_RESET_SECS: i64 = 3_600;
const MIN_RETRY_SPACING_SECS: i64 = 30;

/// Consecutive-failure bookkeeping for one identity. Lives only for the
/// worker's running lifetime; never persisted.
#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub failures: u32,
    pub last_attempt: DateTime<Utc>,
    pub last_error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Healthy,
    Degraded(u32),
    Cooling,
}

/// Advisory retry gate for the scheduler. A metric that keeps failing is
/// cooled for the trailing hour; anything else is simply spaced out to one
/// attempt per 30 seconds. Skipping never removes a metric from traversal.
#[derive(Default)]
pub struct FailureTracker {
    records: Mutex<HashMap<MetricIdentity, FailureRecord>>,
}

impl FailureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_failure(&self, identity: &MetricIdentity, message: &str) {
        self.record_failure_at(identity, message, Utc::now());
    }

    pub fn record_failure_at(&self, identity: &MetricIdentity, message: &str, now: DateTime<Utc>) {
        let Ok(mut records) = self.records.lock() else {
            return;
        };
        let entry = records.entry(identity.clone()).or_insert_with(|| FailureRecord {
            failures: 0,
            last_attempt: now,
            last_error: String::new(),
        });
        entry.failures += 1;
        entry.last_attempt = now;
        entry.last_error = message.to_string();
        tracing::debug!(%identity, failures = entry.failures, error = message, "failure recorded");
    }

    pub fn record_success(&self, identity: &MetricIdentity) {
        if let Ok(mut records) = self.records.lock() {
            records.remove(identity);
        }
    }

    pub fn state(&self, identity: &MetricIdentity, now: DateTime<Utc>) -> RetryState {
        let Ok(records) = self.records.lock() else {
            return RetryState::Healthy;
        };
        match records.get(identity) {
            None => RetryState::Healthy,
            Some(record) => {
                if now - record.last_attempt >= Duration::seconds(IDLE_RESET_SECS) {
                    RetryState::Healthy
                } else if record.failures >= COOLING_THRESHOLD {
                    RetryState::Cooling
                } else {
                    RetryState::Degraded(record.failures)
                }
            }
        }
    }

    pub fn should_skip(&self, identity: &MetricIdentity) -> bool {
        self.should_skip_at(identity, Utc::now())
    }

    pub fn should_skip_at(&self, identity: &MetricIdentity, now: DateTime<Utc>) -> bool {
        match self.state(identity, now) {
            RetryState::Healthy => {
                // An hour of idleness resets the counter entirely.
                if let Ok(mut records) = self.records.lock() {
                    if records
                        .get(identity)
                        .map(|record| now - record.last_attempt >= Duration::seconds(IDLE_RESET_SECS))
                        .unwrap_or(false)
                    {
                        records.remove(identity);
                    }
                }
                false
            }
            RetryState::Cooling => true,
            RetryState::Degraded(_) => {
                let Ok(records) = self.records.lock() else {
                    return false;
                };
                records
                    .get(identity)
                    .map(|record| now - record.last_attempt < Duration::seconds(MIN_RETRY_SPACING_SECS))
                    .unwrap_or(false)
            }
        }
    }

    pub fn snapshot(&self, identity: &MetricIdentity) -> Option<FailureRecord> {
        self.records.lock().ok()?.get(identity).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> MetricIdentity {
        MetricIdentity {
            group: "Inventory".to_string(),
            label: "Inventory Value Industrial".to_string(),
            id: 69,
        }
    }

    #[test]
    fn healthy_metric_is_never_skipped() {
        let tracker = FailureTracker::new();
        assert!(!tracker.should_skip_at(&identity(), Utc::now()));
    }

    #[test]
    fn recent_failure_spaces_retries_to_thirty_seconds() {
        let tracker = FailureTracker::new();
        let t0 = Utc::now();
        tracker.record_failure_at(&identity(), "sandbox", t0);

        assert!(tracker.should_skip_at(&identity(), t0 + Duration::seconds(10)));
        assert!(!tracker.should_skip_at(&identity(), t0 + Duration::seconds(31)));
    }

    #[test]
    fn five_failures_inside_the_hour_cool_the_metric() {
        let tracker = FailureTracker::new();
        let t0 = Utc::now();
        for i in 0..5 {
            tracker.record_failure_at(&identity(), "sandbox", t0 + Duration::seconds(i * 40));
        }

        let after_last = t0 + Duration::seconds(5 * 40 + 60);
        assert_eq!(tracker.state(&identity(), after_last), RetryState::Cooling);
        assert!(tracker.should_skip_at(&identity(), after_last));
    }

    #[test]
    fn an_idle_hour_resets_the_counter() {
        let tracker = FailureTracker::new();
        let t0 = Utc::now();
        for i in 0..5 {
            tracker.record_failure_at(&identity(), "sandbox", t0 + Duration::seconds(i));
        }

        let much_later = t0 + Duration::seconds(IDLE_RESET_SECS + 10);
        assert!(!tracker.should_skip_at(&identity(), much_later));
        assert!(tracker.snapshot(&identity()).is_none());
    }

    #[test]
    fn success_clears_the_record() {
        let tracker = FailureTracker::new();
        let t0 = Utc::now();
        tracker.record_failure_at(&identity(), "transport", t0);
        tracker.record_success(&identity());
        assert!(tracker.snapshot(&identity()).is_none());
        assert!(!tracker.should_skip_at(&identity(), t0 + Duration::seconds(1)));
    }
}
