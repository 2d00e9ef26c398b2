use super::{build_client, execute_call_tool, QueryBackend, QueryError, Row};
use crate::errors::AppResult;
use crate::models::ServerTarget;
use async_trait::async_trait;
use std::time::Duration;

/// P21 (Epicor ERP) bridge. SQL Server dialect; the bridge only accepts
/// SELECT statements and answers on the execute_sql tool endpoint.
pub struct P21Backend {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl P21Backend {
    pub fn new(base_url: &str, timeout: Duration) -> AppResult<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url.to_string(),
            timeout,
        })
    }
}

#[async_trait]
impl QueryBackend for P21Backend {
    fn target(&self) -> ServerTarget {
        ServerTarget::P21
    }

    async fn execute(&self, sql: &str) -> Result<Vec<Row>, QueryError> {
        execute_call_tool(&self.client, &self.base_url, sql, self.timeout).await
    }
}
