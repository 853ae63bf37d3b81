//! HTTP transport to InfluxDB v1.
//!
//! Writes go to `POST /write` with the batch's database, retention policy,
//! and precision as query parameters and Line Protocol as the body.
//! Statements (database creation) go to `POST /query`, which reports
//! failures both as HTTP status codes and inside the response JSON.
//! The underlying `reqwest` client is thread-safe and shared by every
//! writer worker.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use opflux_core::error::SinkError;
use opflux_core::point::{Batch, Precision};
use opflux_core::sink::SinkClient;

use crate::line;

/// Connection settings for the sink.
#[derive(Debug, Clone)]
pub struct InfluxSettings {
    /// Base URL, e.g. `http://localhost:8086`.
    pub url: String,
    /// Basic-auth user; `None` disables authentication.
    pub username: Option<String>,
    /// Basic-auth password.
    pub password: Option<String>,
    /// Skip TLS certificate validation.
    pub skip_verify: bool,
    /// PEM file with the trust root for TLS connections.
    pub pem_file: Option<PathBuf>,
    /// `User-Agent` header value.
    pub user_agent: String,
    /// Request timeout.
    pub timeout: Duration,
}

impl Default for InfluxSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:8086".into(),
            username: None,
            password: None,
            skip_verify: false,
            pem_file: None,
            user_agent: "opflux".into(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Failure constructing the HTTP client; fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The PEM trust root could not be read.
    #[error("reading PEM file: {0}")]
    Pem(#[from] std::io::Error),

    /// The certificate or client could not be built.
    #[error("building HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

/// One row of the v1 `/query` response body.
#[derive(Debug, Deserialize)]
struct QueryResult {
    error: Option<String>,
}

/// The v1 `/query` response body.
#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<QueryResult>,
}

/// Shared HTTP client for InfluxDB v1.
#[derive(Debug, Clone)]
pub struct InfluxClient {
    http: reqwest::Client,
    settings: InfluxSettings,
}

impl InfluxClient {
    /// Builds the client, loading the TLS trust root when configured.
    ///
    /// # Errors
    ///
    /// [`ClientError`] when the PEM file cannot be read or the transport
    /// cannot be constructed.
    pub fn connect(settings: InfluxSettings) -> Result<Self, ClientError> {
        let mut builder = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .timeout(settings.timeout);
        if settings.skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(pem) = &settings.pem_file {
            let bundle = std::fs::read(pem)?;
            let cert = reqwest::Certificate::from_pem(&bundle)?;
            builder = builder.add_root_certificate(cert);
        }
        let http = builder.build()?;
        Ok(Self { http, settings })
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.settings.username {
            Some(user) => request.basic_auth(user, self.settings.password.as_deref()),
            None => request,
        }
    }
}

#[async_trait]
impl SinkClient for InfluxClient {
    async fn write(&self, batch: &Batch) -> Result<(), SinkError> {
        let mut request = self
            .http
            .post(format!("{}/write", self.settings.url))
            .query(&[
                ("db", batch.database.as_str()),
                ("precision", line::precision_param(batch.precision)),
            ]);
        if !batch.retention_policy.is_empty() {
            request = request.query(&[("rp", batch.retention_policy.as_str())]);
        }
        let body = line::encode_batch(batch);
        debug!(
            database = %batch.database,
            points = batch.points.len(),
            "writing batch"
        );

        let response = self
            .authorized(request)
            .body(body)
            .send()
            .await
            .map_err(|e| SinkError::Write(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let detail = response.text().await.unwrap_or_default();
        Err(SinkError::Write(format!("status {status}: {detail}")))
    }

    async fn query(
        &self,
        statement: &str,
        database: &str,
        precision: Option<Precision>,
    ) -> Result<(), SinkError> {
        let mut request = self
            .http
            .post(format!("{}/query", self.settings.url))
            .query(&[("q", statement)]);
        if !database.is_empty() {
            request = request.query(&[("db", database)]);
        }
        if let Some(precision) = precision {
            request = request.query(&[("epoch", line::precision_param(precision))]);
        }

        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| SinkError::Query(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(SinkError::Query(format!("status {status}: {detail}")));
        }

        // The server reports statement failures inside a 200 response.
        let body: QueryResponse = response
            .json()
            .await
            .map_err(|e| SinkError::Query(e.to_string()))?;
        if let Some(error) = body.results.into_iter().find_map(|r| r.error) {
            return Err(SinkError::Query(error));
        }
        Ok(())
    }
}
