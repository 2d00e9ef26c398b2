use crate::adapters::p21::P21Backend;
use crate::adapters::por::PorBackend;
use crate::adapters::simulated::SimulatedBackend;
use crate::adapters::QueryBackend;
use crate::dataset::DataStore;
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{
    AppSettings, ConnectionProbe, DashboardMode, ForceExecuteSummary, MetricField, MetricIdentity,
    MetricRecord, ServerTarget, WorkerCursor, WorkerState, WorkerStatusReport,
};
use crate::worker::lock::WorkerLockRegistry;
use crate::worker::{ReconcileWorker, WorkerConfig};
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

const P21_PROBE_SQL: &str = "SELECT 1 AS result;";
const POR_PROBE_SQL: &str = "SELECT COUNT(*) AS result FROM Transactions;";

/// The operator-command surface the (excluded) UI layer calls. Owns the
/// durable store, the dataset, the backend wiring for the active mode, and
/// at most one reconciliation worker.
pub struct AppCore {
    db: Arc<Database>,
    dataset: Arc<DataStore>,
    locks: Arc<WorkerLockRegistry>,
    backends: RwLock<HashMap<ServerTarget, Arc<dyn QueryBackend>>>,
    connectivity: Arc<RwLock<HashMap<ServerTarget, ConnectionProbe>>>,
    worker: Mutex<Option<Arc<ReconcileWorker>>>,
}

impl AppCore {
    pub fn new(app_data_dir: PathBuf) -> AppResult<Arc<Self>> {
        let db_path = app_data_dir.join("state.sqlite");
        let db = Arc::new(Database::new(&db_path)?);
        let settings = db.get_settings()?;
        let dataset = Arc::new(DataStore::load(Arc::clone(&db))?);
        let backends = build_backends(&settings)?;

        Ok(Arc::new(Self {
            db,
            dataset,
            locks: Arc::new(WorkerLockRegistry::new()),
            backends: RwLock::new(backends),
            connectivity: Arc::new(RwLock::new(HashMap::new())),
            worker: Mutex::new(None),
        }))
    }

    /// Starts the reconciliation worker for the current mode. Refused while
    /// another instance holds the polling lock.
    pub fn start_worker(&self) -> AppResult<WorkerStatusReport> {
        let settings = self.db.get_settings()?;
        let candidate = ReconcileWorker::new(
            Arc::clone(&self.dataset),
            self.backend_map()?,
            Arc::clone(&self.locks),
            Arc::clone(&self.connectivity),
            WorkerConfig {
                poll_interval: Duration::from_millis(settings.poll_interval_ms),
            },
        );
        candidate.start()?;

        let status = candidate.status();
        let mut slot = self
            .worker
            .lock()
            .map_err(|_| AppError::Internal("worker slot poisoned".to_string()))?;
        *slot = Some(candidate);
        Ok(status)
    }

    pub fn stop_worker(&self) -> WorkerStatusReport {
        if let Ok(mut slot) = self.worker.lock() {
            if let Some(worker) = slot.take() {
                worker.stop();
                return worker.status();
            }
        }
        idle_report()
    }

    pub fn worker_status(&self) -> WorkerStatusReport {
        self.worker
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|worker| worker.status()))
            .unwrap_or_else(idle_report)
    }

    /// Operator override: run every metric in one group now, optionally
    /// filtered to a single backend target. Works with or without a running
    /// worker.
    pub async fn force_execute_group(
        &self,
        group: &str,
        target: Option<ServerTarget>,
    ) -> AppResult<ForceExecuteSummary> {
        let worker = {
            let slot = self
                .worker
                .lock()
                .map_err(|_| AppError::Internal("worker slot poisoned".to_string()))?;
            slot.clone()
        };
        match worker {
            Some(worker) => worker.force_execute_group(group, target).await,
            None => {
                let transient = ReconcileWorker::new(
                    Arc::clone(&self.dataset),
                    self.backend_map()?,
                    Arc::clone(&self.locks),
                    Arc::clone(&self.connectivity),
                    WorkerConfig::default(),
                );
                transient.force_execute_group(group, target).await
            }
        }
    }

    pub fn reset_to_defaults(&self) -> AppResult<usize> {
        self.dataset.reset_to_defaults()
    }

    pub fn update_field(
        &self,
        identity: &MetricIdentity,
        field: MetricField,
        value: &serde_json::Value,
    ) -> AppResult<MetricRecord> {
        self.dataset.update_field(identity, field, value)
    }

    pub fn list_records(&self) -> Vec<MetricRecord> {
        self.dataset.records()
    }

    /// One-shot probe of each backend with a trivial query, reported
    /// per-target with latency.
    pub async fn test_connections(&self) -> AppResult<Vec<ConnectionProbe>> {
        let backends = self.backend_map()?;
        let mut probes = Vec::with_capacity(ServerTarget::ALL.len());

        for target in ServerTarget::ALL {
            let Some(backend) = backends.get(&target) else {
                continue;
            };
            let sql = match target {
                ServerTarget::P21 => P21_PROBE_SQL,
                ServerTarget::Por => POR_PROBE_SQL,
            };
            let started = Instant::now();
            let probe = match backend.execute(sql).await {
                Ok(_) => ConnectionProbe {
                    target,
                    connected: true,
                    latency_ms: Some(started.elapsed().as_millis() as u64),
                    error: None,
                    checked_at: Utc::now(),
                },
                Err(err) => ConnectionProbe {
                    target,
                    connected: false,
                    latency_ms: Some(started.elapsed().as_millis() as u64),
                    error: Some(err.to_string()),
                    checked_at: Utc::now(),
                },
            };
            if let Ok(mut map) = self.connectivity.write() {
                map.insert(target, probe.clone());
            }
            probes.push(probe);
        }
        Ok(probes)
    }

    pub fn connection_state(&self) -> Vec<ConnectionProbe> {
        let Ok(map) = self.connectivity.read() else {
            return Vec::new();
        };
        let mut probes: Vec<ConnectionProbe> = map.values().cloned().collect();
        probes.sort_by_key(|probe| probe.target);
        probes
    }

    pub fn get_settings(&self) -> AppResult<AppSettings> {
        self.db.get_settings()
    }

    /// Merges a settings patch and rewires the backends for the new mode.
    /// A running worker keeps its wiring until it is restarted.
    pub fn update_settings(&self, patch: serde_json::Value) -> AppResult<AppSettings> {
        let settings = self.db.update_settings(patch)?;
        let rebuilt = build_backends(&settings)?;
        let mut backends = self
            .backends
            .write()
            .map_err(|_| AppError::Internal("backend map poisoned".to_string()))?;
        *backends = rebuilt;
        Ok(settings)
    }

    fn backend_map(&self) -> AppResult<HashMap<ServerTarget, Arc<dyn QueryBackend>>> {
        self.backends
            .read()
            .map(|backends| backends.clone())
            .map_err(|_| AppError::Internal("backend map poisoned".to_string()))
    }
}

fn build_backends(
    settings: &AppSettings,
) -> AppResult<HashMap<ServerTarget, Arc<dyn QueryBackend>>> {
    let timeout = Duration::from_millis(settings.query_timeout_ms);
    let mut backends: HashMap<ServerTarget, Arc<dyn QueryBackend>> = HashMap::new();
    match settings.mode {
        DashboardMode::Demo => {
            backends.insert(
                ServerTarget::P21,
                Arc::new(SimulatedBackend::new(ServerTarget::P21)),
            );
            backends.insert(
                ServerTarget::Por,
                Arc::new(SimulatedBackend::new(ServerTarget::Por)),
            );
        }
        DashboardMode::Production => {
            backends.insert(
                ServerTarget::P21,
                Arc::new(P21Backend::new(&settings.p21_base_url, timeout)?),
            );
            backends.insert(
                ServerTarget::Por,
                Arc::new(PorBackend::new(&settings.por_base_url, timeout)?),
            );
        }
    }
    Ok(backends)
}

fn idle_report() -> WorkerStatusReport {
    WorkerStatusReport {
        state: WorkerState::Idle,
        cursor: WorkerCursor::default(),
        last_message: "idle".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::AppCore;
    use crate::models::{MetricField, ServerTarget};

    #[tokio::test]
    async fn demo_mode_core_boots_and_probes_both_targets() {
        let dir = tempfile::tempdir().expect("tempdir");
        let core = AppCore::new(dir.path().to_path_buf()).expect("core");

        assert!(!core.list_records().is_empty());

        let probes = core.test_connections().await.expect("probes");
        assert_eq!(probes.len(), 2);
        assert!(probes.iter().all(|probe| probe.connected));
        assert_eq!(core.connection_state().len(), 2);
    }

    #[tokio::test]
    async fn update_field_targets_one_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let core = AppCore::new(dir.path().to_path_buf()).expect("core");

        let identity = core.list_records()[0].identity();
        let updated = core
            .update_field(
                &identity,
                MetricField::TableName,
                &serde_json::json!("different_table"),
            )
            .expect("update");
        assert_eq!(updated.table_name, "different_table");

        let touched: Vec<_> = core
            .list_records()
            .into_iter()
            .filter(|record| record.table_name == "different_table")
            .collect();
        assert_eq!(touched.len(), 1);
    }

    #[tokio::test]
    async fn force_execute_runs_without_a_started_worker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let core = AppCore::new(dir.path().to_path_buf()).expect("core");

        let summary = core
            .force_execute_group("Key Metrics", Some(ServerTarget::P21))
            .await
            .expect("summary");
        assert!(summary.attempted > 0);
        assert_eq!(summary.skipped, 0);
    }
}
