pub mod p21;
pub mod por;
pub mod simulated;

use crate::models::ServerTarget;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// One result row: column name to value, as returned by the bridge services.
pub type Row = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("TIMEOUT: backend did not respond within {0} seconds")]
    Timeout(u64),
    #[error("TRANSPORT: {0}")]
    Transport(String),
    #[error("BACKEND: {0}")]
    Backend(String),
}

/// A query backend turns SQL text into rows or a structured error. Target
/// routing is fixed at construction; retries are the scheduler's business,
/// never this layer's.
#[async_trait]
pub trait QueryBackend: Send + Sync {
    fn target(&self) -> ServerTarget;
    async fn execute(&self, sql: &str) -> Result<Vec<Row>, QueryError>;
}

pub(crate) const CALL_TOOL_PATH: &str = "/call_tool";
pub(crate) const EXECUTE_SQL_TOOL: &str = "execute_sql";

/// Normalizes the `{success, data, error}` envelope every bridge service
/// speaks into rows or a backend error.
pub(crate) fn parse_envelope(body: serde_json::Value) -> Result<Vec<Row>, QueryError> {
    let success = body
        .get("success")
        .and_then(|value| value.as_bool())
        .unwrap_or(false);
    if !success {
        let message = body
            .get("error")
            .and_then(|value| value.as_str())
            .unwrap_or("backend reported failure without detail")
            .to_string();
        return Err(QueryError::Backend(message));
    }

    let Some(serde_json::Value::Array(entries)) = body.get("data") else {
        return Err(QueryError::Backend("response is missing data rows".to_string()));
    };

    let mut rows = Vec::with_capacity(entries.len());
    for entry in entries {
        match entry.as_object() {
            Some(row) => rows.push(row.clone()),
            None => return Err(QueryError::Backend("malformed result row".to_string())),
        }
    }
    Ok(rows)
}

/// Shared HTTP path for the live backends: POST the execute_sql tool call and
/// unwrap the envelope. One request, no retries.
pub(crate) async fn execute_call_tool(
    client: &reqwest::Client,
    base_url: &str,
    sql: &str,
    timeout: Duration,
) -> Result<Vec<Row>, QueryError> {
    let url = format!("{}{}", base_url.trim_end_matches('/'), CALL_TOOL_PATH);
    let payload = serde_json::json!({
        "name": EXECUTE_SQL_TOOL,
        "arguments": { "sql_query": sql }
    });

    let response = client
        .post(&url)
        .json(&payload)
        .send()
        .await
        .map_err(|err| classify_transport(err, timeout))?;

    let body = response
        .json::<serde_json::Value>()
        .await
        .map_err(|err| classify_transport(err, timeout))?;

    parse_envelope(body)
}

fn classify_transport(err: reqwest::Error, timeout: Duration) -> QueryError {
    if err.is_timeout() {
        QueryError::Timeout(timeout.as_secs())
    } else {
        QueryError::Transport(err.to_string())
    }
}

pub(crate) fn build_client(timeout: Duration) -> Result<reqwest::Client, crate::errors::AppError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| crate::errors::AppError::Internal(err.to_string()))
}
