//! Backend transports.
//!
//! Both forwarding strategies implement [`BackendTransport`], so the
//! dispatcher never cares whether a backend is reached directly or
//! through a sidecar. Transport-level failures (connection refused,
//! timeout, DNS) become 502 responses with the stable error body;
//! they are logged and never crash the gateway.
//!
//! Backend calls are the only blocking I/O in the pipeline. Each
//! carries a 30 second timeout and is dropped (and thereby cancelled)
//! when the inbound request is.

use crate::middleware::stamp_identity_headers;
use crate::principal::Principal;
use async_trait::async_trait;
use axum::{
    body::{Body, Bytes},
    extract::Request,
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
};
use gatehouse_common::config::BackendConfig;
use gatehouse_common::Error;
use reqwest::Client;
use std::time::Duration;
use url::Url;

/// Per-request timeout for proxied backend calls.
pub const PROXY_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest request body the gateway will buffer for forwarding.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// A forwarding strategy for backend requests.
#[async_trait]
pub trait BackendTransport: Send + Sync {
    /// Forward the request to `backend`, with the gateway prefix
    /// already stripped from `backend_path`.
    async fn forward(&self, backend: &BackendConfig, backend_path: &str, request: Request)
        -> Response;
}

/// Build the shared outbound HTTP client.
pub fn build_client(timeout: Duration) -> gatehouse_common::Result<Client> {
    Client::builder()
        .timeout(timeout)
        .tcp_keepalive(Duration::from_secs(30))
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .build()
        .map_err(|e| Error::Internal(format!("failed to build HTTP client: {e}")))
}

/// Request pieces extracted before the body is consumed.
struct OutboundParts {
    method: Method,
    query: Option<String>,
    headers: HeaderMap,
    body: Bytes,
}

impl OutboundParts {
    /// Deconstruct the inbound request. Client-supplied identity
    /// headers are stripped and replaced with the resolved principal's
    /// before anything leaves the gateway.
    async fn from_request(request: Request) -> Result<Self, Response> {
        let method = request.method().clone();
        let query = request.uri().query().map(String::from);
        let principal = request.extensions().get::<Principal>().cloned();

        let mut headers = request.headers().clone();
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);
        stamp_identity_headers(&mut headers, principal.as_ref());

        let body = axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES)
            .await
            .map_err(|_| {
                Error::InvalidRequest("Request body too large or unreadable".into())
                    .into_response()
            })?;

        Ok(Self {
            method,
            query,
            headers,
            body,
        })
    }
}

fn append_query(mut url: String, query: Option<&str>) -> String {
    if let Some(q) = query {
        url.push('?');
        url.push_str(q);
    }
    url
}

/// Target URL for a direct forward.
fn direct_url(base: &Url, backend_path: &str, query: Option<&str>) -> String {
    let url = format!("{}{}", base.as_str().trim_end_matches('/'), backend_path);
    append_query(url, query)
}

/// Target URL for a sidecar invocation: the sidecar resolves the
/// logical service name itself.
fn sidecar_url(base: &Url, service: &str, backend_path: &str, query: Option<&str>) -> String {
    let url = format!(
        "{}/v1.0/invoke/{}/method/{}",
        base.as_str().trim_end_matches('/'),
        service,
        backend_path.trim_start_matches('/')
    );
    append_query(url, query)
}

/// Send the outbound request and wrap the backend's answer into a
/// gateway response, mapping transport failures to 502.
async fn relay(client: &Client, parts: OutboundParts, target_url: &str, backend: &str) -> Response {
    let mut builder = client.request(parts.method, target_url);

    for (name, value) in parts.headers.iter() {
        if let Ok(v) = value.to_str() {
            builder = builder.header(name.as_str(), v);
        }
    }
    if !parts.body.is_empty() {
        builder = builder.body(parts.body.to_vec());
    }

    let upstream = match builder.send().await {
        Ok(resp) => resp,
        Err(e) => {
            tracing::error!(backend = %backend, target_url = %target_url, error = %e, "Backend request failed");
            return Error::BackendUnavailable(e.to_string()).into_response();
        }
    };

    let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::OK);
    let mut response = Response::builder().status(status);

    for (name, value) in upstream.headers() {
        // Hop-by-hop headers do not survive the proxy boundary.
        if name == header::CONNECTION || name == header::TRANSFER_ENCODING {
            continue;
        }
        if let Ok(v) = value.to_str() {
            response = response.header(name.as_str(), v);
        }
    }

    let body = match upstream.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!(backend = %backend, error = %e, "Failed to read backend response body");
            return Error::BackendUnavailable(e.to_string()).into_response();
        }
    };

    response
        .body(Body::from(body))
        .unwrap_or_else(|_| Error::Internal("failed to build response".into()).into_response())
}

/// Direct reverse proxy: one fixed upstream URL per backend.
pub struct DirectHttpTransport {
    client: Client,
}

impl DirectHttpTransport {
    pub fn new() -> gatehouse_common::Result<Self> {
        Ok(Self {
            client: build_client(PROXY_TIMEOUT)?,
        })
    }
}

#[async_trait]
impl BackendTransport for DirectHttpTransport {
    async fn forward(
        &self,
        backend: &BackendConfig,
        backend_path: &str,
        request: Request,
    ) -> Response {
        let parts = match OutboundParts::from_request(request).await {
            Ok(parts) => parts,
            Err(response) => return response,
        };
        let target_url = direct_url(&backend.base_url, backend_path, parts.query.as_deref());

        tracing::debug!(backend = %backend.name, target_url = %target_url, "Proxying request");
        relay(&self.client, parts, &target_url, &backend.name).await
    }
}

/// Sidecar invocation: a unary call to a co-located helper process
/// that performs the actual network hop to the named logical service.
pub struct SidecarTransport {
    client: Client,
    base: Url,
}

impl SidecarTransport {
    pub fn new(base: Url) -> gatehouse_common::Result<Self> {
        Ok(Self {
            client: build_client(PROXY_TIMEOUT)?,
            base,
        })
    }
}

#[async_trait]
impl BackendTransport for SidecarTransport {
    async fn forward(
        &self,
        backend: &BackendConfig,
        backend_path: &str,
        request: Request,
    ) -> Response {
        let parts = match OutboundParts::from_request(request).await {
            Ok(parts) => parts,
            Err(response) => return response,
        };
        let target_url = sidecar_url(
            &self.base,
            &backend.name,
            backend_path,
            parts.query.as_deref(),
        );

        tracing::debug!(backend = %backend.name, target_url = %target_url, "Invoking via sidecar");
        relay(&self.client, parts, &target_url, &backend.name).await
    }
}
