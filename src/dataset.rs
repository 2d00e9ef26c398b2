use crate::db::Database;
use crate::defaults;
use crate::errors::{AppError, AppResult};
use crate::models::{MetricField, MetricIdentity, MetricRecord};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, RwLock};

pub const DATASET_BLOB_KEY: &str = "dashboard-dataset";

/// The in-memory metric collection plus its durable mirror. All writes go
/// through triple-matched read-modify-write and persist immediately;
/// persistence is best effort and never rolls back the in-memory state.
pub struct DataStore {
    db: Arc<Database>,
    records: RwLock<Vec<MetricRecord>>,
}

impl DataStore {
    /// Loads from the durable blob when present and structurally valid,
    /// otherwise from the defaults source.
    pub fn load(db: Arc<Database>) -> AppResult<Self> {
        let records = match db.get_blob(DATASET_BLOB_KEY)? {
            Some(raw) => match hydrate(&raw) {
                Some(records) => records,
                None => {
                    tracing::warn!("stored dataset blob is not usable, reloading from defaults");
                    validate_documents(defaults::default_documents()?)
                }
            },
            None => validate_documents(defaults::default_documents()?),
        };

        tracing::info!(count = records.len(), "dataset loaded");
        let store = Self {
            db,
            records: RwLock::new(records),
        };
        store.persist();
        Ok(store)
    }

    pub fn records(&self) -> Vec<MetricRecord> {
        self.records
            .read()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|records| records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, identity: &MetricIdentity) -> Option<MetricRecord> {
        let records = self.records.read().ok()?;
        records
            .iter()
            .find(|record| record.identity() == *identity)
            .cloned()
    }

    /// Editor path: point-wise field update matched on the full identity
    /// triple, persisted immediately.
    pub fn update_field(
        &self,
        identity: &MetricIdentity,
        field: MetricField,
        value: &serde_json::Value,
    ) -> AppResult<MetricRecord> {
        let updated = {
            let mut records = self
                .records
                .write()
                .map_err(|_| AppError::Internal("dataset lock poisoned".to_string()))?;
            let record = records
                .iter_mut()
                .find(|record| record.identity() == *identity)
                .ok_or_else(|| AppError::NotFound(format!("No metric record for {}", identity)))?;
            apply_field(record, field, value)?;
            record.last_updated = Utc::now();
            record.clone()
        };
        self.persist();
        Ok(updated)
    }

    /// Worker path: write the reconciled (or sentinel) production value.
    /// Returns false when no record matches the triple, which the caller
    /// treats as "dataset changed underneath us, skip".
    pub fn set_prod_value(
        &self,
        identity: &MetricIdentity,
        value: f64,
        observed_at: DateTime<Utc>,
    ) -> bool {
        let Ok(mut records) = self.records.write() else {
            return false;
        };
        let Some(record) = records
            .iter_mut()
            .find(|record| record.identity() == *identity)
        else {
            return false;
        };
        record.prod_value = Some(value);
        record.last_updated = observed_at;
        true
    }

    /// Discards the durable copy and reloads from the defaults source; all
    /// production values reset to null.
    pub fn reset_to_defaults(&self) -> AppResult<usize> {
        if let Err(err) = self.db.remove_blob(DATASET_BLOB_KEY) {
            tracing::warn!(error = %err, "failed to discard stored dataset blob");
        }
        let mut fresh = validate_documents(defaults::default_documents()?);
        for record in &mut fresh {
            record.prod_value = None;
        }
        let count = fresh.len();
        {
            let mut records = self
                .records
                .write()
                .map_err(|_| AppError::Internal("dataset lock poisoned".to_string()))?;
            *records = fresh;
        }
        self.persist();
        tracing::info!(count, "dataset reset to defaults");
        Ok(count)
    }

    /// Serializes the full dataset to the durable blob. Failures are logged
    /// and swallowed; the in-memory copy stays authoritative.
    pub fn persist(&self) {
        let serialized = {
            let Ok(records) = self.records.read() else {
                return;
            };
            serde_json::to_string(&*records)
        };
        match serialized {
            Ok(json) => {
                if let Err(err) = self.db.set_blob(DATASET_BLOB_KEY, &json) {
                    tracing::warn!(error = %err, "dataset persistence failed");
                }
            }
            Err(err) => tracing::warn!(error = %err, "dataset serialization failed"),
        }
    }
}

fn hydrate(raw: &str) -> Option<Vec<MetricRecord>> {
    let parsed: serde_json::Value = serde_json::from_str(raw).ok()?;
    let serde_json::Value::Array(entries) = parsed else {
        return None;
    };
    if entries.is_empty() {
        return None;
    }
    Some(validate_documents(entries))
}

/// Shapes raw documents into records: entries missing required identity or
/// query fields are rejected with a warning, non-numeric demo values are
/// coerced to 0, and duplicate identity triples after the first are dropped
/// so triple-matched writes stay unambiguous.
fn validate_documents(documents: Vec<serde_json::Value>) -> Vec<MetricRecord> {
    let mut records = Vec::with_capacity(documents.len());
    let mut seen: HashSet<MetricIdentity> = HashSet::new();

    for document in documents {
        let Some(record) = validate_record(document) else {
            continue;
        };
        let identity = record.identity();
        if !seen.insert(identity.clone()) {
            tracing::warn!(%identity, "duplicate identity triple in dataset, dropping record");
            continue;
        }
        records.push(record);
    }
    records
}

fn validate_record(mut document: serde_json::Value) -> Option<MetricRecord> {
    let Some(map) = document.as_object_mut() else {
        tracing::warn!("dataset entry is not an object, rejecting");
        return None;
    };

    for required in [
        "id",
        "chartGroup",
        "variableName",
        "dataPoint",
        "serverName",
        "productionSqlExpression",
    ] {
        if !map.contains_key(required) {
            tracing::warn!(field = required, "dataset entry missing required field, rejecting");
            return None;
        }
    }

    let demo_value = map.get("value").cloned().unwrap_or(serde_json::Value::Null);
    match coerce_number(&demo_value) {
        Some(number) => {
            map.insert("value".to_string(), serde_json::json!(number));
        }
        None => {
            tracing::warn!(raw = %demo_value, "non-numeric demo value coerced to 0");
            map.insert("value".to_string(), serde_json::json!(0.0));
        }
    }

    if map
        .get("lastUpdated")
        .and_then(|v| v.as_str())
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .is_none()
    {
        map.insert(
            "lastUpdated".to_string(),
            serde_json::json!(DateTime::<Utc>::UNIX_EPOCH.to_rfc3339()),
        );
    }

    match serde_json::from_value::<MetricRecord>(document) {
        Ok(record) => Some(record),
        Err(err) => {
            tracing::warn!(error = %err, "dataset entry failed validation, rejecting");
            None
        }
    }
}

fn coerce_number(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(number) => number.as_f64(),
        serde_json::Value::String(raw) => raw.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn apply_field(
    record: &mut MetricRecord,
    field: MetricField,
    value: &serde_json::Value,
) -> AppResult<()> {
    let as_string = |value: &serde_json::Value| -> AppResult<String> {
        value
            .as_str()
            .map(ToString::to_string)
            .ok_or_else(|| AppError::Validation(format!("{} requires a string value", field.as_str())))
    };
    let as_optional_string = |value: &serde_json::Value| -> AppResult<Option<String>> {
        match value {
            serde_json::Value::Null => Ok(None),
            serde_json::Value::String(raw) => Ok(Some(raw.clone())),
            _ => Err(AppError::Validation(format!(
                "{} requires a string or null",
                field.as_str()
            ))),
        }
    };

    match field {
        MetricField::ProductionSqlExpression => {
            record.production_sql_expression = as_string(value)?
        }
        MetricField::VariableName => record.variable_name = as_string(value)?,
        MetricField::ChartGroup => record.chart_group = as_string(value)?,
        MetricField::TableName => record.table_name = as_string(value)?,
        MetricField::DataPoint => record.data_point = as_string(value)?,
        MetricField::ValueColumn => record.value_column = as_string(value)?,
        MetricField::FilterColumn => record.filter_column = as_optional_string(value)?,
        MetricField::FilterValue => record.filter_value = as_optional_string(value)?,
        MetricField::Value => {
            record.value = value
                .as_f64()
                .ok_or_else(|| AppError::Validation("value requires a number".to_string()))?
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{DataStore, DATASET_BLOB_KEY};
    use crate::db::Database;
    use crate::models::{MetricField, MetricIdentity};
    use chrono::Utc;
    use std::sync::Arc;

    fn store_with_blob(blob: &str) -> (tempfile::TempDir, DataStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(Database::new(&dir.path().join("test.db")).expect("db"));
        db.set_blob(DATASET_BLOB_KEY, blob).expect("seed blob");
        let store = DataStore::load(db).expect("load");
        (dir, store)
    }

    fn record_json(id: i64, group: &str, label: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "chartGroup": group,
            "variableName": label,
            "dataPoint": label,
            "serverName": "P21",
            "tableName": "oe_hdr",
            "productionSqlExpression": "SELECT COUNT(*) AS result FROM oe_hdr;",
            "value": 10.0,
            "lastUpdated": "2024-08-01T00:00:00.000Z",
            "valueColumn": "result"
        })
    }

    #[test]
    fn falls_back_to_defaults_when_blob_is_garbage() {
        let (_dir, store) = store_with_blob("not json at all");
        assert!(!store.is_empty());
    }

    #[test]
    fn writes_match_on_the_full_identity_triple() {
        // Two records share id 5; only the targeted (group, label, id) moves.
        let blob = serde_json::json!([
            record_json(5, "Key Metrics", "Total Orders"),
            record_json(5, "Daily Orders", "Daily Orders Day 1"),
        ])
        .to_string();
        let (_dir, store) = store_with_blob(&blob);

        let identity = MetricIdentity {
            group: "Key Metrics".to_string(),
            label: "Total Orders".to_string(),
            id: 5,
        };
        assert!(store.set_prod_value(&identity, 42.0, Utc::now()));

        let records = store.records();
        let touched = records
            .iter()
            .find(|r| r.chart_group == "Key Metrics")
            .expect("targeted record");
        let untouched = records
            .iter()
            .find(|r| r.chart_group == "Daily Orders")
            .expect("other record");
        assert_eq!(touched.prod_value, Some(42.0));
        assert_eq!(untouched.prod_value, None);
    }

    #[test]
    fn rejects_entries_missing_identity_fields_and_coerces_values() {
        let blob = serde_json::json!([
            { "id": 1, "chartGroup": "Key Metrics" },
            {
                "id": 2,
                "chartGroup": "Key Metrics",
                "variableName": "Total Orders",
                "dataPoint": "Total Orders",
                "serverName": "P21",
                "productionSqlExpression": "SELECT 1 AS result;",
                "value": "not a number",
                "lastUpdated": "2024-08-01T00:00:00.000Z"
            }
        ])
        .to_string();
        let (_dir, store) = store_with_blob(&blob);

        let records = store.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, 2);
        assert_eq!(records[0].value, 0.0);
    }

    #[test]
    fn duplicate_triples_are_dropped_after_the_first() {
        let blob = serde_json::json!([
            record_json(7, "Key Metrics", "Total Orders"),
            record_json(7, "Key Metrics", "Total Orders"),
        ])
        .to_string();
        let (_dir, store) = store_with_blob(&blob);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn update_field_persists_and_validates_types() {
        let blob = serde_json::json!([record_json(1, "Key Metrics", "Total Orders")]).to_string();
        let (_dir, store) = store_with_blob(&blob);
        let identity = MetricIdentity {
            group: "Key Metrics".to_string(),
            label: "Total Orders".to_string(),
            id: 1,
        };

        let updated = store
            .update_field(
                &identity,
                MetricField::ProductionSqlExpression,
                &serde_json::json!("SELECT 2 AS result;"),
            )
            .expect("update");
        assert_eq!(updated.production_sql_expression, "SELECT 2 AS result;");

        let err = store
            .update_field(&identity, MetricField::Value, &serde_json::json!("nope"))
            .expect_err("type mismatch");
        assert!(err.to_string().contains("VALIDATION"));
    }

    #[test]
    fn reset_to_defaults_clears_production_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(Database::new(&dir.path().join("test.db")).expect("db"));
        let store = DataStore::load(Arc::clone(&db)).expect("load defaults");

        let identity = store.records()[0].identity();
        assert!(store.set_prod_value(&identity, 123.0, Utc::now()));
        store.persist();

        let count = store.reset_to_defaults().expect("reset");
        assert!(count > 0);
        assert!(store.records().iter().all(|r| r.prod_value.is_none()));
    }
}
