//! HTTP record API client.

use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use recsync_common::{Endpoint, Error, Result};

use crate::api::{Ack, Envelope, RecordApi};

/// User agent sent with every request.
const USER_AGENT: &str = concat!("recsync/", env!("CARGO_PKG_VERSION"));

/// Record API client speaking JSON over HTTP.
///
/// Endpoint paths are resolved against the base URL:
/// CREATE → `POST`, UPDATE → `PUT`, DELETE → `DELETE`, fetch → `GET`.
pub struct HttpRecordApi {
    http: Client,
    base_url: Url,
    auth_token: Option<String>,
}

impl HttpRecordApi {
    /// Create a new client.
    ///
    /// `timeout` bounds each request end to end; an expired request is
    /// reported as `Error::Timeout`.
    ///
    /// # Errors
    /// - Base URL is not a valid http(s) URL
    /// - HTTP client cannot be built
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| Error::Config(format!("Invalid server URL '{}': {}", base_url, e)))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "Server URL must be http or https, got '{}'",
                base_url.scheme()
            )));
        }
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url,
            auth_token: None,
        })
    }

    /// Send `Authorization: Bearer <token>` with every request.
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Base URL all endpoints are resolved against.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Full URL for an endpoint.
    pub fn url_for(&self, endpoint: &Endpoint) -> Result<Url> {
        // "./" keeps a segment like "a:b" from being read as a scheme
        self.base_url
            .join(&format!("./{}", endpoint.to_path()))
            .map_err(|e| Error::InvalidInput(format!("Invalid endpoint '{}': {}", endpoint, e)))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth_token {
            Some(token) => request.header(header::AUTHORIZATION, format!("Bearer {}", token)),
            None => request,
        }
    }

    /// Send a request, mapping transport failures to network errors.
    async fn execute(&self, request: RequestBuilder, what: &str) -> Result<Response> {
        self.authorize(request)
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| transport_error(what, e))
    }

    /// Interpret the response to a write.
    async fn handle_ack(&self, response: Response, what: &str) -> Result<Ack> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| transport_error(what, e))?;

        if !status.is_success() {
            return Err(status_error(status, &body));
        }

        if status == StatusCode::NO_CONTENT {
            return Ok(Ack { record: None });
        }

        let envelope: Envelope = serde_json::from_str(&body).map_err(|e| Error::Rejected {
            status: Some(status.as_u16()),
            message: format!("Unrecognized response to {}: {}", what, e),
        })?;

        if envelope.success {
            Ok(Ack {
                record: envelope.data,
            })
        } else {
            Err(Error::Rejected {
                status: Some(status.as_u16()),
                message: envelope
                    .error
                    .unwrap_or_else(|| format!("{} was not accepted", what)),
            })
        }
    }
}

#[async_trait]
impl RecordApi for HttpRecordApi {
    fn name(&self) -> &str {
        "http"
    }

    async fn create(&self, endpoint: &Endpoint, payload: &Value) -> Result<Ack> {
        let url = self.url_for(endpoint)?;
        debug!("POST {}", url);
        let response = self
            .execute(self.http.post(url).json(payload), "create")
            .await?;
        self.handle_ack(response, "create").await
    }

    async fn update(&self, endpoint: &Endpoint, payload: &Value) -> Result<Ack> {
        let url = self.url_for(endpoint)?;
        debug!("PUT {}", url);
        let response = self
            .execute(self.http.put(url).json(payload), "update")
            .await?;
        self.handle_ack(response, "update").await
    }

    async fn delete(&self, endpoint: &Endpoint) -> Result<Ack> {
        let url = self.url_for(endpoint)?;
        debug!("DELETE {}", url);
        let response = self.execute(self.http.delete(url), "delete").await?;
        self.handle_ack(response, "delete").await
    }

    async fn fetch(&self, endpoint: &Endpoint) -> Result<Value> {
        let url = self.url_for(endpoint)?;
        debug!("GET {}", url);
        let response = self.execute(self.http.get(url), "fetch").await?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| transport_error("fetch", e))?;

        if status == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!("Record {} not found", endpoint)));
        }
        if !status.is_success() {
            return Err(status_error(status, &body));
        }

        let value: Value = serde_json::from_str(&body).map_err(|e| Error::Rejected {
            status: Some(status.as_u16()),
            message: format!("Unrecognized record body: {}", e),
        })?;

        // Either an envelope or the bare record
        match serde_json::from_value::<Envelope>(value.clone()) {
            Ok(envelope) if envelope.success => envelope
                .data
                .ok_or_else(|| Error::NotFound(format!("Record {} not found", endpoint))),
            Ok(envelope) => Err(Error::Rejected {
                status: Some(status.as_u16()),
                message: envelope
                    .error
                    .unwrap_or_else(|| "fetch was not accepted".to_string()),
            }),
            Err(_) => Ok(value),
        }
    }
}

/// Map a reqwest failure to a network-level error.
fn transport_error(what: &str, err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout(format!("{} request timed out: {}", what, err))
    } else {
        Error::Network(format!("Failed to {}: {}", what, err))
    }
}

/// Map a non-success status to an error.
///
/// Gateway failures mean the request never reached a server that could
/// evaluate it, so they count as network errors. Every other status is the
/// server's answer and counts as a rejection.
fn status_error(status: StatusCode, body: &str) -> Error {
    if matches!(
        status,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
    ) {
        return Error::Network(format!("Server unavailable: {}", status));
    }

    let message = serde_json::from_str::<Envelope>(body)
        .ok()
        .and_then(|envelope| envelope.error)
        .unwrap_or_else(|| {
            let body = body.trim();
            if body.is_empty() {
                status.canonical_reason().unwrap_or("request failed").to_string()
            } else {
                body.chars().take(512).collect()
            }
        });

    Error::Rejected {
        status: Some(status.as_u16()),
        message,
    }
}
