//! Remote statement executor speaking to an HTTP Data API endpoint.
//!
//! Each statement is one `POST` of a JSON body carrying the target database
//! and the SQL text. The endpoint answers with the number of updated
//! records and, for queries, the result rows as a JSON-encoded array.
//! Queries are wrapped with [`json_rows`] like the `PostgreSQL` executor
//! does, so `JSONB` columns arrive as JSON values instead of the strings
//! the endpoint renders them as.
//!
//! Failures are classified at this boundary:
//!
//! | Response | Error |
//! |----------|-------|
//! | `429` | [`TransientKind::Throttled`] |
//! | `502`, `503`, `504` | [`TransientKind::ColdStart`] |
//! | body with `sqlState`/`code` | [`StoreError::from_sqlstate`] |
//! | anything else | [`StoreError::Statement`] without SQLSTATE |

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, TransientKind};
use crate::pool::ExecutorFactory;
use crate::sql::json_rows;
use crate::storage::StatementExecutor;

/// Default per-request timeout in seconds.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 45;

/// Connection settings of a Data API endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataApiConfig {
    /// Statement endpoint URL.
    pub endpoint: String,
    /// Database (cluster) resource identifier, when the endpoint needs one.
    pub resource_arn: Option<String>,
    /// Credentials secret identifier, when the endpoint needs one.
    pub secret_arn: Option<String>,
    /// Database the statements run in.
    pub database: String,
    /// Timeout of one request.
    pub request_timeout: Duration,
}

impl DataApiConfig {
    /// Settings for `endpoint` and `database` with the default timeout.
    pub fn new(endpoint: &str, database: &str) -> Self {
        Self {
            endpoint: endpoint.to_owned(),
            resource_arn: None,
            secret_arn: None,
            database: database.to_owned(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }

    /// Set the resource and secret identifiers.
    #[must_use]
    pub fn with_credentials(mut self, resource_arn: &str, secret_arn: &str) -> Self {
        self.resource_arn = Some(resource_arn.to_owned());
        self.secret_arn = Some(secret_arn.to_owned());
        self
    }

    /// Set the request timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatementRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    resource_arn: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    secret_arn: Option<&'a str>,
    database: &'a str,
    sql: &'a str,
    format_records_as: &'static str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementResponse {
    #[serde(default)]
    number_of_records_updated: u64,
    #[serde(default)]
    formatted_records: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    #[serde(default)]
    sql_state: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// One HTTP client bound to a Data API endpoint.
#[derive(Debug, Clone)]
pub struct DataApiExecutor {
    client: reqwest::Client,
    config: DataApiConfig,
}

impl DataApiExecutor {
    /// Build a client for `config`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Http`] if the HTTP client cannot be built.
    pub fn new(config: DataApiConfig) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { client, config })
    }

    /// The endpoint settings.
    pub const fn config(&self) -> &DataApiConfig {
        &self.config
    }

    async fn send(&self, sql: &str) -> Result<StatementResponse, StoreError> {
        let request = StatementRequest {
            resource_arn: self.config.resource_arn.as_deref(),
            secret_arn: self.config.secret_arn.as_deref(),
            database: &self.config.database,
            sql,
            format_records_as: "JSON",
        };

        let response = self
            .client
            .post(&self.config.endpoint)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_response(status, &body));
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl StatementExecutor for DataApiExecutor {
    async fn execute(&self, sql: &str) -> Result<u64, StoreError> {
        Ok(self.send(sql).await?.number_of_records_updated)
    }

    async fn fetch_json(&self, sql: &str) -> Result<Vec<serde_json::Value>, StoreError> {
        match self.send(&json_rows(sql)).await?.formatted_records {
            Some(records) => decode_records(&records),
            None => Ok(Vec::new()),
        }
    }
}

#[derive(Deserialize)]
struct WrappedRow {
    row: String,
}

/// Unwrap `formattedRecords` of a [`json_rows`] query into one JSON object
/// per row.
fn decode_records(records: &str) -> Result<Vec<serde_json::Value>, StoreError> {
    let wrapped: Vec<WrappedRow> = serde_json::from_str(records)?;
    wrapped
        .iter()
        .map(|wrapped| serde_json::from_str(&wrapped.row).map_err(StoreError::from))
        .collect()
}

/// Map a failed response to a classified error.
fn classify_response(status: StatusCode, body: &str) -> StoreError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => {
            return StoreError::Transient {
                kind: TransientKind::Throttled,
                message: body.to_owned(),
            };
        }
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            return StoreError::Transient {
                kind: TransientKind::ColdStart,
                message: body.to_owned(),
            };
        }
        _ => {}
    }

    let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) else {
        return StoreError::Statement {
            sqlstate: None,
            message: format!("Data API returned {status}: {body}"),
        };
    };
    let message = parsed
        .message
        .unwrap_or_else(|| format!("Data API returned {status}"));
    match parsed.sql_state.or(parsed.code) {
        Some(code) if is_sqlstate(&code) => StoreError::from_sqlstate(&code, message),
        _ => StoreError::Statement {
            sqlstate: None,
            message,
        },
    }
}

/// SQLSTATE codes are exactly five ASCII digits or uppercase letters.
fn is_sqlstate(code: &str) -> bool {
    code.len() == 5
        && code
            .bytes()
            .all(|b| b.is_ascii_digit() || b.is_ascii_uppercase())
}

/// Creates [`DataApiExecutor`] handles for a [`ResourcePool`](crate::pool::ResourcePool).
#[derive(Debug, Clone)]
pub struct DataApiFactory {
    config: DataApiConfig,
}

impl DataApiFactory {
    /// A factory for clients of `config`.
    pub const fn new(config: DataApiConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ExecutorFactory for DataApiFactory {
    type Handle = DataApiExecutor;

    async fn create(&self) -> Result<DataApiExecutor, StoreError> {
        DataApiExecutor::new(self.config.clone())
    }

    async fn dispose(&self, handle: DataApiExecutor) -> Result<(), StoreError> {
        drop(handle);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;

    #[test]
    fn rate_limits_are_throttling() {
        let err = classify_response(StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert!(matches!(
            err,
            StoreError::Transient {
                kind: TransientKind::Throttled,
                ..
            }
        ));
    }

    #[test]
    fn gateway_failures_are_cold_starts() {
        for status in [
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::GATEWAY_TIMEOUT,
        ] {
            assert!(classify_response(status, "").is_remote_transient());
        }
    }

    #[test]
    fn sqlstate_in_body_is_classified() {
        let body = r#"{"sqlState": "40P01", "message": "deadlock detected"}"#;
        let err = classify_response(StatusCode::BAD_REQUEST, body);
        assert!(matches!(err, StoreError::Deadlock(_)));

        let body = r#"{"code": "42P07", "message": "relation exists"}"#;
        let err = classify_response(StatusCode::BAD_REQUEST, body);
        assert_eq!(err.sqlstate(), Some("42P07"));
    }

    #[test]
    fn unstructured_failures_are_fatal() {
        let err = classify_response(StatusCode::BAD_REQUEST, "<html>bad</html>");
        assert_eq!(err.class(), ErrorClass::Fatal);
        let err = classify_response(
            StatusCode::BAD_REQUEST,
            r#"{"code": "BadRequestException", "message": "nope"}"#,
        );
        assert!(matches!(err, StoreError::Statement { sqlstate: None, .. }));
    }

    #[test]
    fn wrapped_rows_decode_to_json_columns() {
        let records = r#"[{"row": "{\"successEvent\": {\"aggregateId\": \"a\", \"aggregateVersion\": 2, \"timestamp\": 9}, \"paused\": false}"}, {"row": "{\"payload\": {\"k\": [1, 2]}}"}]"#;
        let rows = decode_records(records).expect("records");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["successEvent"]["aggregateVersion"], 2);
        assert_eq!(rows[1]["payload"]["k"][1], 2);

        let state: threadlog_types::ReplicationState =
            serde_json::from_value(rows[0].clone()).expect("state");
        assert_eq!(state.success_event.map(|e| e.timestamp), Some(9));
    }

    #[test]
    fn unwrapped_records_are_rejected() {
        let result = decode_records(r#"[{"payload": "{}"}]"#);
        assert!(matches!(result, Err(StoreError::Serialization(_))));
    }

    #[test]
    fn request_body_uses_camel_case_keys() {
        let config = DataApiConfig::new("http://localhost:8080", "postgres")
            .with_credentials("arn:cluster", "arn:secret");
        let request = StatementRequest {
            resource_arn: config.resource_arn.as_deref(),
            secret_arn: config.secret_arn.as_deref(),
            database: &config.database,
            sql: "SELECT 1",
            format_records_as: "JSON",
        };
        let json = serde_json::to_value(&request).unwrap_or_default();
        assert_eq!(json["resourceArn"], "arn:cluster");
        assert_eq!(json["formatRecordsAs"], "JSON");
        assert_eq!(json["sql"], "SELECT 1");
    }
}
