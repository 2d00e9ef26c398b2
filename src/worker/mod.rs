pub mod anomaly;
pub mod cursor;
pub mod extract;
pub mod failures;
pub mod lock;

use crate::adapters::{QueryBackend, QueryError};
use crate::dataset::DataStore;
use crate::errors::{AppError, AppResult};
use crate::models::{
    ConnectionProbe, ForceExecuteSummary, MetricIdentity, MetricRecord, ServerTarget, WorkerCursor,
    WorkerState, WorkerStatusReport, SENTINEL_ERROR_VALUE,
};
use self::failures::FailureTracker;
use self::lock::WorkerLockRegistry;
use chrono::{DateTime, Timelike, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

/// Placeholder in query templates resolved once per tick, so a query asking
/// for "today" stays stable even when the fetch straddles a boundary.
pub const NOW_PLACEHOLDER: &str = "{{now}}";

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub poll_interval: std::time::Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: std::time::Duration::from_millis(2_000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Busy,
    NoMetrics,
    Skipped,
    Dispatched,
}

enum DispatchResult {
    Single(Option<f64>),
    Aggregated(Vec<(String, f64)>),
    Empty,
    Failed(QueryError),
}

struct Applied {
    wrote: bool,
    success: bool,
}

/// The reconciliation worker: strict single-flight, round-robin traversal,
/// one external query per tick, results written back through the dataset
/// store. One instance per process, enforced by the leadership lock.
pub struct ReconcileWorker {
    dataset: Arc<DataStore>,
    backends: HashMap<ServerTarget, Arc<dyn QueryBackend>>,
    locks: Arc<WorkerLockRegistry>,
    failures: FailureTracker,
    connectivity: Arc<RwLock<HashMap<ServerTarget, ConnectionProbe>>>,
    config: WorkerConfig,
    instance_token: String,
    cursor: Mutex<WorkerCursor>,
    busy: AtomicBool,
    in_flight: Mutex<HashSet<MetricIdentity>>,
    running: AtomicBool,
    stop: Mutex<Option<watch::Sender<bool>>>,
    last_message: Mutex<String>,
}

impl ReconcileWorker {
    pub fn new(
        dataset: Arc<DataStore>,
        backends: HashMap<ServerTarget, Arc<dyn QueryBackend>>,
        locks: Arc<WorkerLockRegistry>,
        connectivity: Arc<RwLock<HashMap<ServerTarget, ConnectionProbe>>>,
        config: WorkerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            dataset,
            backends,
            locks,
            failures: FailureTracker::new(),
            connectivity,
            config,
            instance_token: Uuid::new_v4().to_string(),
            cursor: Mutex::new(WorkerCursor::default()),
            busy: AtomicBool::new(false),
            in_flight: Mutex::new(HashSet::new()),
            running: AtomicBool::new(false),
            stop: Mutex::new(None),
            last_message: Mutex::new(String::new()),
        })
    }

    /// Acquires the leadership lock and begins ticking, firing one tick
    /// immediately. Refused when another instance holds the lock.
    pub fn start(self: &Arc<Self>) -> AppResult<()> {
        if self.running.load(Ordering::Acquire) {
            return Err(AppError::WorkerBlocked("worker is already running".to_string()));
        }
        if !self.locks.acquire(&self.instance_token) {
            return Err(AppError::WorkerBlocked(
                "another worker instance holds the polling lock".to_string(),
            ));
        }
        self.running.store(true, Ordering::Release);

        let (tx, mut rx) = watch::channel(false);
        if let Ok(mut slot) = self.stop.lock() {
            *slot = Some(tx);
        }

        let worker = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(worker.config.poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if *rx.borrow() {
                            break;
                        }
                        worker.tick().await;
                    }
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                }
            }
            worker.running.store(false, Ordering::Release);
            worker.note("idle");
        });

        self.note("running");
        tracing::info!(token = %self.instance_token, "reconciliation worker started");
        Ok(())
    }

    /// Clears the timer at the next tick boundary and releases the lock if
    /// this instance owns it. An in-flight fetch completes and writes its
    /// result; it is never aborted.
    pub fn stop(&self) {
        if let Ok(mut slot) = self.stop.lock() {
            if let Some(tx) = slot.take() {
                let _ = tx.send(true);
            }
        }
        if self.locks.release(&self.instance_token) {
            tracing::info!(token = %self.instance_token, "polling lock released");
        }
        self.running.store(false, Ordering::Release);
        self.note("idle");
    }

    pub fn status(&self) -> WorkerStatusReport {
        let state = if self.running.load(Ordering::Acquire) {
            WorkerState::Running
        } else {
            WorkerState::Idle
        };
        WorkerStatusReport {
            state,
            cursor: self
                .cursor
                .lock()
                .map(|cursor| cursor.clone())
                .unwrap_or_default(),
            last_message: self
                .last_message
                .lock()
                .map(|message| message.clone())
                .unwrap_or_default(),
        }
    }

    pub fn failures(&self) -> &FailureTracker {
        &self.failures
    }

    /// One pass of the polling algorithm. Re-entrant-safe: a tick arriving
    /// while another is in flight is a no-op, not a queue entry.
    pub async fn tick(&self) -> TickOutcome {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.note("processing: a fetch is already in flight");
            return TickOutcome::Busy;
        }
        let _busy = BusyGuard(&self.busy);

        let records = self.dataset.records();
        if records.is_empty() {
            self.note("no metric records loaded");
            return TickOutcome::NoMetrics;
        }
        let traversal = cursor::build_traversal(&records);
        let tick_ts = tick_timestamp(Utc::now());

        let record = {
            let Ok(mut position) = self.cursor.lock() else {
                return TickOutcome::Skipped;
            };
            cursor::resolve(&mut position, &traversal).cloned()
        };
        let Some(record) = record else {
            self.advance_cursor(&traversal);
            return TickOutcome::Skipped;
        };
        let identity = record.identity();

        if self.failures.should_skip(&identity) {
            self.note(format!("skipping {} during retry back-off", identity));
            self.advance_cursor(&traversal);
            return TickOutcome::Skipped;
        }

        if !self.try_claim(&identity) {
            self.note(format!("{} is claimed by another operation", identity));
            self.advance_cursor(&traversal);
            return TickOutcome::Skipped;
        }
        let _claim = ClaimGuard {
            worker: self,
            identity: identity.clone(),
        };

        let outcome = self.dispatch(&record, tick_ts).await;
        self.mark_connected(record.server_name);
        let applied = self.apply_outcome(&record, outcome);
        if applied.wrote {
            self.dataset.persist();
        }
        self.advance_cursor(&traversal);
        TickOutcome::Dispatched
    }

    /// Operator override: executes every metric in one group right now, one
    /// at a time, optionally filtered to a single backend target. Identities
    /// claimed by the main loop are skipped, not waited on.
    pub async fn force_execute_group(
        &self,
        group: &str,
        target: Option<ServerTarget>,
    ) -> AppResult<ForceExecuteSummary> {
        let mut records: Vec<MetricRecord> = self
            .dataset
            .records()
            .into_iter()
            .filter(|record| record.chart_group == group)
            .filter(|record| target.map_or(true, |t| record.server_name == t))
            .collect();
        if records.is_empty() {
            return Err(AppError::NotFound(format!(
                "No metric records in group '{}'",
                group
            )));
        }
        records.sort_by_key(|record| record.id);

        let tick_ts = tick_timestamp(Utc::now());
        let mut summary = ForceExecuteSummary {
            group: group.to_string(),
            attempted: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
        };
        let mut wrote_any = false;

        for record in records {
            let identity = record.identity();
            if !self.try_claim(&identity) {
                summary.skipped += 1;
                continue;
            }
            let _claim = ClaimGuard {
                worker: self,
                identity: identity.clone(),
            };
            summary.attempted += 1;

            let outcome = self.dispatch(&record, tick_ts).await;
            self.mark_connected(record.server_name);
            let applied = self.apply_outcome(&record, outcome);
            wrote_any |= applied.wrote;
            if applied.success {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
            }
        }

        if wrote_any {
            self.dataset.persist();
        }
        tracing::info!(
            group,
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            "forced group execution finished"
        );
        Ok(summary)
    }

    async fn dispatch(&self, record: &MetricRecord, tick_ts: DateTime<Utc>) -> DispatchResult {
        let Some(backend) = self.backends.get(&record.server_name) else {
            return DispatchResult::Failed(QueryError::Backend(format!(
                "no backend wired for {}",
                record.server_name
            )));
        };
        let sql = render_query(&record.production_sql_expression, tick_ts);
        match backend.execute(&sql).await {
            Err(err) => DispatchResult::Failed(err),
            Ok(rows) if rows.is_empty() => DispatchResult::Empty,
            Ok(rows) => {
                if record.chart_group == cursor::AGGREGATED_GROUP {
                    DispatchResult::Aggregated(extract::extract_aggregated(&rows))
                } else {
                    DispatchResult::Single(extract::extract_single(&rows[0]))
                }
            }
        }
    }

    fn apply_outcome(&self, record: &MetricRecord, outcome: DispatchResult) -> Applied {
        let identity = record.identity();
        let now = Utc::now();

        match outcome {
            DispatchResult::Single(Some(candidate)) if candidate.is_finite() => {
                let prior = record.prod_value.filter(|p| *p != SENTINEL_ERROR_VALUE);
                let accepted = anomaly::validate(&identity, candidate, prior);
                if accepted != candidate {
                    // Anomaly-rejected: prior kept, quiet success.
                    self.failures.record_success(&identity);
                    self.note(format!("{}: candidate suppressed, prior kept", identity));
                    return Applied {
                        wrote: false,
                        success: true,
                    };
                }
                self.dataset.set_prod_value(&identity, accepted, now);
                self.failures.record_success(&identity);
                self.note(format!("{} = {}", identity, accepted));
                Applied {
                    wrote: true,
                    success: true,
                }
            }
            DispatchResult::Single(Some(_)) => {
                tracing::warn!(%identity, "extraction produced a non-finite value");
                self.write_sentinel(&identity, now, "non-finite value extracted")
            }
            DispatchResult::Single(None) => {
                tracing::warn!(%identity, "no numeric value could be extracted from the response");
                self.write_sentinel(&identity, now, "no numeric value extracted")
            }
            DispatchResult::Aggregated(pairs) if pairs.is_empty() => {
                tracing::warn!(%identity, "aggregated response had no usable rows");
                self.write_sentinel(&identity, now, "aggregated response had no usable rows")
            }
            DispatchResult::Aggregated(pairs) => {
                let group_records: Vec<MetricRecord> = self
                    .dataset
                    .records()
                    .into_iter()
                    .filter(|candidate| candidate.chart_group == record.chart_group)
                    .collect();
                let mut updated = 0usize;
                for (category, value) in &pairs {
                    let Some(matched) = group_records
                        .iter()
                        .find(|candidate| candidate.data_point == *category)
                    else {
                        continue;
                    };
                    let matched_identity = matched.identity();
                    let prior = matched.prod_value.filter(|p| *p != SENTINEL_ERROR_VALUE);
                    let accepted = anomaly::validate(&matched_identity, *value, prior);
                    if self.dataset.set_prod_value(&matched_identity, accepted, now) {
                        updated += 1;
                    }
                }
                self.failures.record_success(&identity);
                self.note(format!(
                    "{}: fanned out {} of {} categories",
                    record.chart_group,
                    updated,
                    pairs.len()
                ));
                Applied {
                    wrote: updated > 0,
                    success: true,
                }
            }
            DispatchResult::Empty => {
                tracing::warn!(%identity, "backend returned no rows");
                self.write_sentinel(&identity, now, "backend returned no rows")
            }
            DispatchResult::Failed(err) => {
                match &err {
                    QueryError::Timeout(_) | QueryError::Transport(_) => {
                        tracing::warn!(%identity, error = %err, "transport failure")
                    }
                    QueryError::Backend(_) => {
                        tracing::warn!(%identity, error = %err, "backend failure")
                    }
                }
                self.write_sentinel(&identity, now, &err.to_string())
            }
        }
    }

    fn write_sentinel(&self, identity: &MetricIdentity, now: DateTime<Utc>, reason: &str) -> Applied {
        self.dataset.set_prod_value(identity, SENTINEL_ERROR_VALUE, now);
        self.failures.record_failure(identity, reason);
        self.note(format!("{} marked offline: {}", identity, reason));
        Applied {
            wrote: true,
            success: false,
        }
    }

    fn advance_cursor(&self, traversal: &[(String, Vec<MetricRecord>)]) {
        if let Ok(mut position) = self.cursor.lock() {
            cursor::advance(&mut position, traversal);
        }
    }

    fn try_claim(&self, identity: &MetricIdentity) -> bool {
        self.in_flight
            .lock()
            .map(|mut claims| claims.insert(identity.clone()))
            .unwrap_or(false)
    }

    fn mark_connected(&self, target: ServerTarget) {
        if let Ok(mut map) = self.connectivity.write() {
            map.insert(
                target,
                ConnectionProbe {
                    target,
                    connected: true,
                    latency_ms: None,
                    error: None,
                    checked_at: Utc::now(),
                },
            );
        }
    }

    fn note(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(worker = %self.instance_token, "{}", message);
        if let Ok(mut slot) = self.last_message.lock() {
            *slot = message;
        }
    }
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct ClaimGuard<'a> {
    worker: &'a ReconcileWorker,
    identity: MetricIdentity,
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut claims) = self.worker.in_flight.lock() {
            claims.remove(&self.identity);
        }
    }
}

/// Wall clock truncated to the minute; every placeholder substitution within
/// one tick sees the same instant.
pub fn tick_timestamp(now: DateTime<Utc>) -> DateTime<Utc> {
    now.with_second(0)
        .and_then(|truncated| truncated.with_nanosecond(0))
        .unwrap_or(now)
}

/// Explicit parameterization step: the tick timestamp is bound into the
/// query template here and nowhere else.
pub fn render_query(template: &str, tick_ts: DateTime<Utc>) -> String {
    if !template.contains(NOW_PLACEHOLDER) {
        return template.to_string();
    }
    let literal = format!("'{}'", tick_ts.format("%Y-%m-%dT%H:%M:%SZ"));
    template.replace(NOW_PLACEHOLDER, &literal)
}
