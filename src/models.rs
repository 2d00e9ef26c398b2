use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reserved numeric value written in place of a live reading when a metric's
/// fetch fails. The rendering layer maps it to an OFFLINE badge; it must never
/// be confused with a legitimate zero.
pub const SENTINEL_ERROR_VALUE: f64 = 99999.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ServerTarget {
    #[serde(rename = "P21")]
    P21,
    #[serde(rename = "POR")]
    Por,
}

impl ServerTarget {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::P21 => "P21",
            Self::Por => "POR",
        }
    }

    pub const ALL: [ServerTarget; 2] = [ServerTarget::P21, ServerTarget::Por];
}

impl fmt::Display for ServerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DashboardMode {
    Demo,
    Production,
}

impl DashboardMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Demo => "demo",
            Self::Production => "production",
        }
    }
}

/// The composite key every read-modify-write path matches on. Numeric ids are
/// not unique across reload cycles, so id alone never identifies a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricIdentity {
    pub group: String,
    pub label: String,
    pub id: i64,
}

impl fmt::Display for MetricIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.group, self.label, self.id)
    }
}

/// One monitored business metric, shaped like the dashboard's JSON blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricRecord {
    pub id: i64,
    pub chart_group: String,
    pub variable_name: String,
    pub data_point: String,
    pub server_name: ServerTarget,
    #[serde(default)]
    pub table_name: String,
    pub production_sql_expression: String,
    pub value: f64,
    #[serde(default)]
    pub prod_value: Option<f64>,
    pub last_updated: DateTime<Utc>,
    #[serde(default = "default_value_column")]
    pub value_column: String,
    #[serde(default)]
    pub filter_column: Option<String>,
    #[serde(default)]
    pub filter_value: Option<String>,
    #[serde(default)]
    pub calculation_type: Option<String>,
}

fn default_value_column() -> String {
    "result".to_string()
}

impl MetricRecord {
    pub fn identity(&self) -> MetricIdentity {
        MetricIdentity {
            group: self.chart_group.clone(),
            label: self.variable_name.clone(),
            id: self.id,
        }
    }
}

/// Editor-updatable fields. The worker itself only ever touches prodValue and
/// lastUpdated, which are not exposed here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MetricField {
    ProductionSqlExpression,
    VariableName,
    ChartGroup,
    TableName,
    DataPoint,
    ValueColumn,
    FilterColumn,
    FilterValue,
    Value,
}

impl MetricField {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProductionSqlExpression => "productionSqlExpression",
            Self::VariableName => "variableName",
            Self::ChartGroup => "chartGroup",
            Self::TableName => "tableName",
            Self::DataPoint => "dataPoint",
            Self::ValueColumn => "valueColumn",
            Self::FilterColumn => "filterColumn",
            Self::FilterValue => "filterValue",
            Self::Value => "value",
        }
    }
}

/// The scheduler's traversal position across (group, member index).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerCursor {
    pub group: Option<String>,
    pub index: usize,
    pub loops: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerState {
    Idle,
    Running,
}

impl WorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatusReport {
    pub state: WorkerState,
    pub cursor: WorkerCursor,
    pub last_message: String,
}

/// Per-target connectivity indicator, also the row shape test-connections
/// reports back to the UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionProbe {
    pub target: ServerTarget,
    pub connected: bool,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForceExecuteSummary {
    pub group: String,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppSettings {
    pub mode: DashboardMode,
    pub poll_interval_ms: u64,
    pub query_timeout_ms: u64,
    pub p21_base_url: String,
    pub por_base_url: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            mode: DashboardMode::Demo,
            poll_interval_ms: 2_000,
            query_timeout_ms: 10_000,
            p21_base_url: "http://localhost:8001".to_string(),
            por_base_url: "http://localhost:8002".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_target_rejects_unknown_names() {
        assert!(serde_json::from_str::<ServerTarget>("\"P21\"").is_ok());
        assert!(serde_json::from_str::<ServerTarget>("\"POR\"").is_ok());
        assert!(serde_json::from_str::<ServerTarget>("\"SAP\"").is_err());
    }

    #[test]
    fn metric_record_round_trips_camel_case() {
        let raw = serde_json::json!({
            "id": 7,
            "chartGroup": "Key Metrics",
            "variableName": "Total Orders",
            "dataPoint": "Total Orders",
            "serverName": "P21",
            "tableName": "oe_hdr",
            "productionSqlExpression": "SELECT COUNT(order_no) AS result FROM oe_hdr;",
            "value": 12540.0,
            "prodValue": null,
            "lastUpdated": "2024-08-01T00:00:00Z",
            "valueColumn": "result"
        });
        let record: MetricRecord = serde_json::from_value(raw).expect("deserialize");
        assert_eq!(record.identity().to_string(), "Key Metrics/Total Orders#7");
        let back = serde_json::to_value(&record).expect("serialize");
        assert_eq!(back["chartGroup"], "Key Metrics");
        assert_eq!(back["serverName"], "P21");
    }

    #[test]
    fn settings_default_points_at_local_bridges() {
        let settings = AppSettings::default();
        assert_eq!(settings.mode, DashboardMode::Demo);
        assert_eq!(settings.poll_interval_ms, 2_000);
        assert!(settings.p21_base_url.ends_with("8001"));
        assert!(settings.por_base_url.ends_with("8002"));
    }
}
