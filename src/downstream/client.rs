//! HTTP client for one downstream record service.
//!
//! Every request carries the service's Basic-Auth header, waits for a slot
//! in the per-service concurrency limiter, and is retried with exponential
//! backoff and jitter when the failure is transient.
//!
//! # Example
//!
//! ```rust,no_run
//! use iot_ingestion::config::DownstreamConfig;
//! use iot_ingestion::credentials::{ResolvedCredentials, ServiceCredentials, ServiceKind};
//! use iot_ingestion::downstream::ServiceClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let creds = ServiceCredentials {
//!         url: "https://rawdata.example.com".to_string(),
//!         user: "svc".to_string(),
//!         password: "secret".to_string(),
//!     };
//!     let resolved = ResolvedCredentials::new(ServiceKind::RawData, &creds)?;
//!     let client = ServiceClient::new(resolved, &DownstreamConfig::default())?;
//!
//!     client
//!         .send_json(reqwest::Method::POST, "/raw_data", &serde_json::json!({"device_id": "d1"}))
//!         .await?;
//!     Ok(())
//! }
//! ```

use rand::Rng;
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::DownstreamError;
use crate::config::{DownstreamConfig, RetryConfig};
use crate::credentials::{ResolvedCredentials, ServiceKind};

/// Authenticated, rate-limited client for one service.
#[derive(Debug, Clone)]
pub struct ServiceClient {
    client: Client,
    credentials: ResolvedCredentials,
    limiter: Arc<Semaphore>,
    retry: RetryConfig,
}

impl ServiceClient {
    /// Creates a client with its own connection pool.
    ///
    /// # Errors
    ///
    /// Returns `DownstreamError::Http` if the HTTP client cannot be created.
    pub fn new(
        credentials: ResolvedCredentials,
        config: &DownstreamConfig,
    ) -> Result<Self, DownstreamError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self::with_client(client, credentials, config))
    }

    /// Creates a client on top of a shared `reqwest::Client`.
    pub fn with_client(
        client: Client,
        credentials: ResolvedCredentials,
        config: &DownstreamConfig,
    ) -> Self {
        Self {
            client,
            credentials,
            limiter: Arc::new(Semaphore::new(config.max_concurrent_requests)),
            retry: config.retry.clone(),
        }
    }

    /// Service this client talks to.
    pub fn kind(&self) -> ServiceKind {
        self.credentials.kind
    }

    /// Builds a request with authentication headers.
    fn build_request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, self.credentials.endpoint(path))
            .header("Authorization", self.credentials.auth_header())
            .header("Accept", "application/json")
    }

    /// GETs `path` and decodes the body.
    ///
    /// Returns `Ok(None)` when the service answers 404.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<Option<T>, DownstreamError> {
        match self.execute(Method::GET, path, None).await {
            Ok(response) => {
                let bytes = response.bytes().await?;
                Ok(Some(serde_json::from_slice(&bytes)?))
            }
            Err(DownstreamError::Api { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Sends `body` as JSON; any 2xx answer is success.
    pub async fn send_json<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<(), DownstreamError> {
        let payload = serde_json::to_vec(body)?;
        self.execute(method, path, Some(payload)).await.map(|_| ())
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<Response, DownstreamError> {
        let service = self.kind().as_str();
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let result = self.attempt(method.clone(), path, body.clone()).await;

            match result {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        service,
                        %method,
                        path,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Downstream request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<Response, DownstreamError> {
        let service = self.kind().as_str();
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| DownstreamError::Closed)?;

        let mut request = self.build_request(method.clone(), path);
        if let Some(body) = body {
            request = request
                .header("Content-Type", "application/json")
                .body(body);
        }

        let start = Instant::now();
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                let err = DownstreamError::from(e);
                crate::metrics::record_downstream_request(service, err.outcome(), start.elapsed());
                return Err(err);
            }
        };

        let status = response.status();
        if status.is_success() {
            crate::metrics::record_downstream_request(service, "success", start.elapsed());
            debug!(service, %method, path, status = status.as_u16(), "Downstream request succeeded");
            return Ok(response);
        }

        let outcome = if status == StatusCode::NOT_FOUND {
            "not_found"
        } else if status.is_server_error() {
            "server_error"
        } else {
            "client_error"
        };
        crate::metrics::record_downstream_request(service, outcome, start.elapsed());

        let body = response.text().await.unwrap_or_default();
        Err(DownstreamError::Api {
            status: status.as_u16(),
            message: body,
        })
    }

    /// Delay before attempt `attempt + 1`: doubled each time, capped, then
    /// jittered into the upper half of the window.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30);
        let base = self
            .retry
            .initial_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.retry.max_backoff_ms);

        let half = base / 2;
        let jitter = if half > 0 {
            rand::rng().random_range(0..=half)
        } else {
            0
        };

        Duration::from_millis(base - half + jitter)
    }
}
