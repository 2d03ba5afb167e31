//! REST SQL executor.
//!
//! Posts each statement as the request body to `<base>/rest/sql[/<db>]`
//! with basic auth. The HTTP endpoint is stateless, so `use <db>` is kept
//! as per-executor session state and appended to the request path.

use crate::{ExecutorFactory, QueryResult, SqlExecutor};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::sync::Mutex;
use std::time::Duration;
use tmqrig_core::{ExecutorError, HarnessConfig, Value};

static USE_DB: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*use\s+(\w+)\s*;?\s*$").expect("Invalid use regex"));

/// Response envelope of the REST SQL endpoint.
#[derive(Debug, Deserialize)]
struct RestResponse {
    code: i64,
    #[serde(default)]
    desc: Option<String>,
    #[serde(default)]
    column_meta: Vec<Vec<serde_json::Value>>,
    #[serde(default)]
    data: Vec<Vec<serde_json::Value>>,
}

/// Executor backed by the store's HTTP SQL endpoint.
#[derive(Debug)]
pub struct RestExecutor {
    client: reqwest::Client,
    base_url: String,
    user: String,
    password: String,
    database: Mutex<Option<String>>,
}

impl RestExecutor {
    pub fn new(config: &HarnessConfig) -> Result<Self, ExecutorError> {
        Self::with_timeout(
            &config.rest_url,
            &config.user,
            &config.password,
            config.request_timeout,
        )
    }

    pub fn with_timeout(
        base_url: &str,
        user: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<Self, ExecutorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExecutorError::Transport {
                endpoint: base_url.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            user: user.to_string(),
            password: password.to_string(),
            database: Mutex::new(None),
        })
    }

    /// Current session database, if `use <db>` was executed.
    pub fn current_database(&self) -> Option<String> {
        self.database.lock().ok().and_then(|db| db.clone())
    }

    fn endpoint(&self) -> Result<String, ExecutorError> {
        let db = self.database.lock().map_err(|_| ExecutorError::LockPoisoned)?;
        Ok(match db.as_deref() {
            Some(db) => format!("{}/rest/sql/{}", self.base_url, db),
            None => format!("{}/rest/sql", self.base_url),
        })
    }

    async fn post(&self, sql: &str) -> Result<QueryResult, ExecutorError> {
        let endpoint = self.endpoint()?;
        let response = self
            .client
            .post(&endpoint)
            .basic_auth(&self.user, Some(&self.password))
            .body(sql.to_string())
            .send()
            .await
            .map_err(|e| ExecutorError::Transport {
                endpoint: endpoint.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| ExecutorError::Transport {
            endpoint: endpoint.clone(),
            reason: e.to_string(),
        })?;
        parse_response(&endpoint, status, &body)
    }
}

#[async_trait]
impl SqlExecutor for RestExecutor {
    async fn execute(&self, sql: &str) -> Result<QueryResult, ExecutorError> {
        tracing::trace!(sql, "rest execute");
        if let Some(caps) = USE_DB.captures(sql) {
            let db = caps[1].to_string();
            // Validate the database exists before switching the session to it.
            self.post(&format!("show {}.vgroups", db)).await?;
            let mut current = self.database.lock().map_err(|_| ExecutorError::LockPoisoned)?;
            *current = Some(db);
            return Ok(QueryResult::empty());
        }
        self.post(sql).await
    }

    fn name(&self) -> &str {
        "rest"
    }
}

/// Decode a REST SQL response body.
fn parse_response(endpoint: &str, status: u16, body: &str) -> Result<QueryResult, ExecutorError> {
    let parsed: Result<RestResponse, _> = serde_json::from_str(body);
    match parsed {
        Ok(resp) if resp.code != 0 => Err(ExecutorError::Server {
            code: resp.code,
            desc: resp.desc.unwrap_or_default(),
        }),
        Ok(resp) if (200..300).contains(&status) => {
            let columns = resp
                .column_meta
                .iter()
                .map(|meta| {
                    meta.first()
                        .and_then(|name| name.as_str())
                        .map(str::to_string)
                        .ok_or_else(|| ExecutorError::InvalidResponse {
                            reason: "column_meta entry without a name".to_string(),
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;
            let rows = resp
                .data
                .iter()
                .map(|row| row.iter().map(Value::from).collect())
                .collect();
            Ok(QueryResult::new(columns, rows))
        }
        Ok(_) => Err(ExecutorError::HttpStatus {
            endpoint: endpoint.to_string(),
            status,
            message: body.to_string(),
        }),
        Err(_) if !(200..300).contains(&status) => Err(ExecutorError::HttpStatus {
            endpoint: endpoint.to_string(),
            status,
            message: body.to_string(),
        }),
        Err(e) => Err(ExecutorError::InvalidResponse {
            reason: e.to_string(),
        }),
    }
}

/// Opens a fresh [`RestExecutor`] (own HTTP client, own session) per call.
#[derive(Debug, Clone)]
pub struct RestExecutorFactory {
    config: HarnessConfig,
}

impl RestExecutorFactory {
    pub fn new(config: HarnessConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ExecutorFactory for RestExecutorFactory {
    async fn connect(&self) -> Result<Box<dyn SqlExecutor>, ExecutorError> {
        Ok(Box::new(RestExecutor::new(&self.config)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENDPOINT: &str = "http://localhost:6041/rest/sql";

    #[test]
    fn test_parse_select_response() {
        let body = r#"{
            "code": 0,
            "column_meta": [["ts","TIMESTAMP",8],["consumerid","INT",4],["consumrowcnt","BIGINT",8]],
            "data": [["2022-01-01T00:00:00.000Z", 1, 100], ["2022-01-01T00:00:00.001Z", 2, 150]],
            "rows": 2
        }"#;
        let result = parse_response(ENDPOINT, 200, body).unwrap();
        assert_eq!(result.columns, vec!["ts", "consumerid", "consumrowcnt"]);
        assert_eq!(result.row_count(), 2);
        assert_eq!(result.get(1, 2), Some(&Value::Int(150)));
    }

    #[test]
    fn test_parse_server_error() {
        let body = r#"{"code": 9826, "desc": "Table does not exist"}"#;
        let err = parse_response(ENDPOINT, 400, body).unwrap_err();
        assert_eq!(
            err,
            ExecutorError::Server {
                code: 0x2662,
                desc: "Table does not exist".to_string()
            }
        );
        assert!(err.is_missing_table());
    }

    #[test]
    fn test_parse_non_json_error_status() {
        let err = parse_response(ENDPOINT, 502, "bad gateway").unwrap_err();
        assert!(matches!(err, ExecutorError::HttpStatus { status: 502, .. }));
    }

    #[test]
    fn test_parse_garbage_success_body() {
        let err = parse_response(ENDPOINT, 200, "not json").unwrap_err();
        assert!(matches!(err, ExecutorError::InvalidResponse { .. }));
    }

    #[test]
    fn test_use_statement_detection() {
        assert!(USE_DB.is_match("use dbt"));
        assert!(USE_DB.is_match("USE dbt;"));
        assert!(!USE_DB.is_match("use dbt; select 1"));
    }

    #[test]
    fn test_endpoint_without_session_db() {
        let executor = RestExecutor::new(&HarnessConfig::default()).unwrap();
        assert_eq!(executor.endpoint().unwrap(), ENDPOINT);
        assert_eq!(executor.current_database(), None);
    }
}
