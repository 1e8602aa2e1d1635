//! Remote fetch client
//!
//! Issues one query-execution request per job against the remote agent and hands
//! back the response body as a stream. Connection-level failures are retried with
//! the configured fixed backoff; any response from the agent is final.

use crate::config::{Config, OutputFormat, RetryConfig};
use crate::error::{Error, Result};
use crate::retry::with_retry;
use crate::types::Job;
use bytes::Bytes;
use reqwest::header::ACCEPT;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Request body understood by the remote agent
#[derive(Debug, Serialize)]
struct QueryRequest<'a> {
    driver: &'a str,
    connection: &'a serde_json::Map<String, serde_json::Value>,
    sql: &'a str,
}

/// Client for the remote query-execution agent
#[derive(Clone, Debug)]
pub struct FetchClient {
    http: reqwest::Client,
    endpoint: String,
    format: OutputFormat,
    retry: RetryConfig,
}

impl FetchClient {
    /// Build a client for the agent and format in `config`
    pub fn new(config: &Config) -> Self {
        Self::with_client(reqwest::Client::new(), config)
    }

    /// Build a client reusing an existing HTTP client
    pub fn with_client(http: reqwest::Client, config: &Config) -> Self {
        Self {
            http,
            endpoint: config.sql_agent.addr.clone(),
            format: config.format,
            retry: config.retry.clone(),
        }
    }

    /// Execute `job` on the agent and return its result stream
    ///
    /// Cancelling `cancel` aborts the in-flight request (including a pending retry
    /// backoff) and yields [`Error::Cancelled`].
    pub async fn fetch(&self, job: &Job, cancel: &CancellationToken) -> Result<ResultStream> {
        let payload = QueryRequest {
            driver: &job.connection.driver,
            connection: &job.connection.info,
            sql: job.normalized_sql(),
        };

        let send = with_retry(&self.retry, |attempt| {
            let request = self
                .http
                .post(&self.endpoint)
                .header(ACCEPT, self.format.mime_type())
                .json(&payload);
            tracing::debug!(job = %job.name, attempt, "sending query request");
            async move { request.send().await.map_err(Error::from) }
        });

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = send => result?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                body = response.text() => body.unwrap_or_default(),
            };
            return Err(Error::RemoteStatus {
                status: status.as_u16(),
                body,
            });
        }

        Ok(ResultStream { response })
    }
}

/// Open result stream returned by the agent
///
/// Must be read to the end (or dropped) by the caller.
#[derive(Debug)]
pub struct ResultStream {
    response: reqwest::Response,
}

impl ResultStream {
    /// Next chunk of the body, `None` once the stream is exhausted
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        Ok(self.response.chunk().await?)
    }

    /// Content length announced by the agent, if any
    pub fn content_length(&self) -> Option<u64> {
        self.response.content_length()
    }
}
