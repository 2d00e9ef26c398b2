use super::{QueryBackend, QueryError, Row};
use crate::models::ServerTarget;
use async_trait::async_trait;
use rand::Rng;

/// Tables the live services refuse to reach; the responder reproduces the
/// exact error text so demo mode exercises the same failure path.
const SANDBOXED_TABLES: [&str; 2] = ["mcp_sandboxed_inv", "mcp_sandboxed_rentals"];
const SANDBOX_ERROR: &str = "Connection to MCP Sandbox failed: Network timeout.";

const SITE_ROWS: [(&str, f64); 3] = [("Columbus", 40.0), ("Addison", 25.0), ("City", 12.0)];

/// Demo-mode responder: same contract as the live bridges, answers derived
/// from the query text so repeated polls of one metric stay in the same
/// neighborhood.
pub struct SimulatedBackend {
    target: ServerTarget,
}

impl SimulatedBackend {
    pub fn new(target: ServerTarget) -> Self {
        Self { target }
    }
}

#[async_trait]
impl QueryBackend for SimulatedBackend {
    fn target(&self) -> ServerTarget {
        self.target
    }

    async fn execute(&self, sql: &str) -> Result<Vec<Row>, QueryError> {
        let lowered = sql.to_lowercase();
        if SANDBOXED_TABLES
            .iter()
            .any(|table| lowered.contains(table))
        {
            return Err(QueryError::Backend(SANDBOX_ERROR.to_string()));
        }

        if lowered.contains("location_name") || lowered.contains("site_name") {
            let rows = SITE_ROWS
                .iter()
                .map(|(location, sales)| {
                    let mut row = Row::new();
                    row.insert("location_name".to_string(), serde_json::json!(location));
                    row.insert("sales".to_string(), serde_json::json!(jitter(*sales)));
                    row
                })
                .collect();
            return Ok(rows);
        }

        let mut row = Row::new();
        row.insert("result".to_string(), serde_json::json!(jitter(seed_value(sql))));
        Ok(vec![row])
    }
}

/// Stable per-query baseline so a metric's simulated reading does not jump
/// wildly between polls.
fn seed_value(sql: &str) -> f64 {
    let sum: u64 = sql.bytes().map(u64::from).sum();
    ((sum % 9_000) + 100) as f64
}

fn jitter(base: f64) -> f64 {
    let factor = rand::rng().random_range(0.98..=1.02);
    (base * factor).round()
}
