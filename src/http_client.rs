use anyhow::{anyhow, Context};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, Request};
use serde_json::Value;
use std::time::{Duration, Instant};

use crate::error::GatewayError;

/// Default per-request time budget
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// One call to the platform API, built by the caller and consumed once
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub path: String,
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
    pub timeout: Duration,
}

impl RequestDescriptor {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method,
            headers: Vec::new(),
            body: None,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::POST, path).json(body)
    }

    pub fn put(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::PUT, path).json(body)
    }

    pub fn patch(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::PATCH, path).json(body)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Add a header; caller headers override the executor defaults
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Status and body of a completed exchange, uninterpreted
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == 401
    }
}

/// Sends single requests to the platform API with a bounded timeout
pub struct RequestExecutor {
    /// Shared HTTP client with connection pooling
    client: Client,

    /// API root, e.g. `http://localhost:8000/api/v1`
    base_url: String,
}

impl RequestExecutor {
    /// Create a new executor
    pub fn new(
        base_url: &str,
        max_connections: usize,
        connect_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(max_connections)
            .connect_timeout(connect_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Join the base URL and a request path with exactly one slash
    pub fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Send one request with `access_token` attached.
    ///
    /// The whole exchange (status and body) must finish within
    /// `descriptor.timeout`; otherwise the in-flight future is dropped, which
    /// cancels the transport operation, and `Timeout` is returned.
    pub async fn send(
        &self,
        descriptor: &RequestDescriptor,
        access_token: &str,
    ) -> Result<RawResponse, GatewayError> {
        let request = self.build_request(descriptor, access_token)?;
        let url = request.url().clone();
        let trace_id = uuid::Uuid::new_v4().to_string()[..8].to_string();

        tracing::debug!(
            trace_id = %trace_id,
            method = %descriptor.method,
            url = %url,
            "Sending HTTP request"
        );

        let started = Instant::now();
        let exchange = async {
            let response = self.client.execute(request).await?;
            let status = response.status().as_u16();
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>(RawResponse {
                status,
                body: body.to_vec(),
            })
        };

        match tokio::time::timeout(descriptor.timeout, exchange).await {
            Ok(Ok(raw)) => {
                tracing::debug!(
                    trace_id = %trace_id,
                    status = raw.status,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Received HTTP response"
                );
                Ok(raw)
            }
            Ok(Err(e)) => {
                let error_kind = if e.is_timeout() {
                    "timeout"
                } else if e.is_connect() {
                    "connection_failed"
                } else if e.is_request() {
                    "request_error"
                } else if e.is_body() {
                    "body_error"
                } else if e.is_decode() {
                    "decode_error"
                } else {
                    "unknown"
                };

                tracing::warn!(
                    trace_id = %trace_id,
                    error_kind = error_kind,
                    error = %e,
                    url = %url,
                    "HTTP request error"
                );

                Err(GatewayError::Network(format!("{} (kind: {})", e, error_kind)))
            }
            Err(_) => {
                let after_ms = descriptor.timeout.as_millis() as u64;
                tracing::warn!(
                    trace_id = %trace_id,
                    url = %url,
                    after_ms = after_ms,
                    "HTTP request timed out, exchange cancelled"
                );
                Err(GatewayError::Timeout { after_ms })
            }
        }
    }

    fn build_request(
        &self,
        descriptor: &RequestDescriptor,
        access_token: &str,
    ) -> Result<Request, GatewayError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", access_token))
                .map_err(|_| anyhow!("Access token is not a valid header value"))?,
        );

        for (name, value) in &descriptor.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("Invalid header name: {}", name))?;
            let value = HeaderValue::from_str(value)
                .with_context(|| format!("Invalid value for header {}", name))?;
            headers.insert(name, value);
        }

        let mut builder = self
            .client
            .request(descriptor.method.clone(), self.url_for(&descriptor.path))
            .headers(headers);

        if let Some(ref body) = descriptor.body {
            let bytes = serde_json::to_vec(body).context("Failed to serialize request body")?;
            builder = builder.body(bytes);
        }

        let request = builder
            .build()
            .with_context(|| format!("Failed to build request for {}", descriptor.path))?;
        Ok(request)
    }

    /// Get the underlying HTTP client
    pub fn client(&self) -> &Client {
        &self.client
    }
}
