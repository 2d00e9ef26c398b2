use super::{build_client, execute_call_tool, QueryBackend, QueryError, Row};
use crate::errors::AppResult;
use crate::models::ServerTarget;
use async_trait::async_trait;
use std::time::Duration;

/// POR (Point of Rental) bridge. MS Access dialect behind the same envelope;
/// the bridge rewrites LIMIT to TOP on its side, so query text passes through
/// untouched here.
pub struct PorBackend {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl PorBackend {
    pub fn new(base_url: &str, timeout: Duration) -> AppResult<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url.to_string(),
            timeout,
        })
    }
}

#[async_trait]
impl QueryBackend for PorBackend {
    fn target(&self) -> ServerTarget {
        ServerTarget::Por
    }

    async fn execute(&self, sql: &str) -> Result<Vec<Row>, QueryError> {
        execute_call_tool(&self.client, &self.base_url, sql, self.timeout).await
    }
}
