use crate::errors::{AppError, AppResult};

const AR_AGING: &str = include_str!("defaults/ar-aging.json");
const ACCOUNTS: &str = include_str!("defaults/accounts.json");
const WEB_ORDERS: &str = include_str!("defaults/web-orders.json");
const INVENTORY: &str = include_str!("defaults/inventory.json");
const POR_OVERVIEW: &str = include_str!("defaults/por-overview.json");
const DAILY_ORDERS: &str = include_str!("defaults/daily-orders.json");
const HISTORICAL_DATA: &str = include_str!("defaults/historical-data.json");
const CUSTOMER_METRICS: &str = include_str!("defaults/customer-metrics.json");
const KEY_METRICS: &str = include_str!("defaults/key-metrics.json");
const SITE_DISTRIBUTION: &str = include_str!("defaults/site-distribution.json");

const DOCUMENTS: [(&str, &str); 10] = [
    ("ar-aging", AR_AGING),
    ("accounts", ACCOUNTS),
    ("web-orders", WEB_ORDERS),
    ("inventory", INVENTORY),
    ("por-overview", POR_OVERVIEW),
    ("daily-orders", DAILY_ORDERS),
    ("historical-data", HISTORICAL_DATA),
    ("customer-metrics", CUSTOMER_METRICS),
    ("key-metrics", KEY_METRICS),
    ("site-distribution", SITE_DISTRIBUTION),
];

/// The raw seed documents, one JSON array per chart category, flattened in a
/// fixed order so ids stay stable across reloads.
pub fn default_documents() -> AppResult<Vec<serde_json::Value>> {
    let mut combined = Vec::new();
    for (name, raw) in DOCUMENTS {
        let parsed: serde_json::Value = serde_json::from_str(raw)
            .map_err(|err| AppError::Internal(format!("defaults document '{}' is invalid: {}", name, err)))?;
        match parsed {
            serde_json::Value::Array(entries) => combined.extend(entries),
            _ => {
                return Err(AppError::Internal(format!(
                    "defaults document '{}' is not an array",
                    name
                )))
            }
        }
    }
    Ok(combined)
}
