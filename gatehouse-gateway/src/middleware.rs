//! Middleware pipeline stages.
//!
//! Each stage either calls the next stage or short-circuits with a
//! terminal response. The canonical order for protected routes is
//! CORS, authentication, rate limit, audit, security headers, access
//! log, then route-scoped authorization ahead of the dispatcher.
//! Health paths skip authentication, rate limiting, and audit but keep
//! CORS and security headers.
//!
//! The resolved [`Principal`] travels in typed request extensions, not
//! stringly-keyed context values.

use crate::audit::{AuditRecord, AuditSink};
use crate::principal::{Principal, TokenValidator};
use crate::rate_limit::RateLimiter;
use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use gatehouse_common::logging::generate_request_id;
use gatehouse_common::Error;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

// ────────────────────────────────────────────────────────────────────
// Client IP
// ────────────────────────────────────────────────────────────────────

/// Best-effort client IP from proxy headers.
///
/// Takes the first hop of `X-Forwarded-For`, then `X-Real-IP`. The
/// gateway is expected to sit behind a TLS-terminating edge that sets
/// these; without them the key degrades to a shared bucket.
pub fn client_ip(headers: &HeaderMap) -> String {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }
    "unknown".to_string()
}

// ────────────────────────────────────────────────────────────────────
// CORS
// ────────────────────────────────────────────────────────────────────

/// CORS stage state: the explicit origin allow-list.
#[derive(Clone)]
pub struct CorsState {
    pub origins: Arc<Vec<String>>,
}

impl CorsState {
    pub fn new(origins: Vec<String>) -> Self {
        Self {
            origins: Arc::new(origins),
        }
    }

    fn allows(&self, origin: &str) -> bool {
        self.origins.iter().any(|o| o == origin)
    }
}

const ALLOWED_METHODS: &str = "GET, POST, PUT, PATCH, DELETE, OPTIONS";
const ALLOWED_HEADERS: &str = "Authorization, Content-Type";

fn apply_cors_headers(headers: &mut HeaderMap, origin: &HeaderValue) {
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    headers.insert(header::VARY, HeaderValue::from_static("Origin"));
}

/// CORS stage.
///
/// `OPTIONS` requests always short-circuit with 204, independent of
/// authentication state. The request `Origin` is echoed back only when
/// it appears in the allow-list; credentials are allowed, so a
/// wildcard origin is never emitted.
pub async fn cors_middleware(
    State(state): State<CorsState>,
    request: Request,
    next: Next,
) -> Response {
    let origin = request.headers().get(header::ORIGIN).cloned();
    let allowed_origin = origin.filter(|o| {
        o.to_str()
            .map(|s| state.allows(s))
            .unwrap_or(false)
    });

    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        if let Some(origin) = allowed_origin {
            let headers = response.headers_mut();
            apply_cors_headers(headers, &origin);
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_METHODS,
                HeaderValue::from_static(ALLOWED_METHODS),
            );
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                HeaderValue::from_static(ALLOWED_HEADERS),
            );
            headers.insert(
                header::ACCESS_CONTROL_MAX_AGE,
                HeaderValue::from_static("3600"),
            );
        }
        return response;
    }

    let mut response = next.run(request).await;
    if let Some(origin) = allowed_origin {
        apply_cors_headers(response.headers_mut(), &origin);
    }
    response
}

// ────────────────────────────────────────────────────────────────────
// Authentication
// ────────────────────────────────────────────────────────────────────

/// Authentication stage state.
#[derive(Clone)]
pub struct AuthState {
    pub validator: Arc<dyn TokenValidator>,
}

/// Authentication stage.
///
/// Missing or malformed `Authorization: Bearer <token>` short-circuits
/// with 401; so does any resolver failure, with the error detail as
/// the message. On success the [`Principal`] is attached to request
/// extensions for downstream stages.
pub async fn auth_middleware(
    State(state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());

    let token = match token {
        Some(t) => t.to_string(),
        None => {
            return Error::Auth("Missing or malformed Authorization header".into())
                .into_response()
        }
    };

    match state.validator.resolve(&token) {
        Ok(principal) => {
            request.extensions_mut().insert(principal);
            next.run(request).await
        }
        Err(e) => Error::Auth(e.to_string()).into_response(),
    }
}

// ────────────────────────────────────────────────────────────────────
// Rate limiting
// ────────────────────────────────────────────────────────────────────

/// Key space for a rate-limit stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateScope {
    /// Admin surface: per authenticated principal ID.
    Principal,
    /// Public surface: per client IP.
    ClientIp,
}

/// Rate-limit stage state.
#[derive(Clone)]
pub struct RateLimitState {
    pub limiter: Arc<RateLimiter>,
    pub scope: RateScope,
}

/// Rate-limit stage. Rejects immediately with 429; the gateway never
/// queues or delays.
pub async fn rate_limit_middleware(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Response {
    let key = match state.scope {
        RateScope::Principal => request
            .extensions()
            .get::<Principal>()
            .map(|p| p.id.clone())
            .unwrap_or_else(|| client_ip(request.headers())),
        RateScope::ClientIp => client_ip(request.headers()),
    };

    if !state.limiter.allow(&key).await {
        tracing::debug!(key = %key, "Rate limit exceeded");
        return Error::RateLimited("Rate limit exceeded, retry after the window resets".into())
            .into_response();
    }

    next.run(request).await
}

// ────────────────────────────────────────────────────────────────────
// Audit
// ────────────────────────────────────────────────────────────────────

/// Audit stage state.
#[derive(Clone)]
pub struct AuditState {
    pub sink: Arc<dyn AuditSink>,
}

fn content_length(headers: &HeaderMap) -> u64 {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// Audit wrap stage. Emits one event per request after the response is
/// produced; bodies are never captured.
pub async fn audit_middleware(
    State(state): State<AuditState>,
    request: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let ip = client_ip(request.headers());
    let user_agent = request
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let request_bytes = content_length(request.headers());
    let principal = request.extensions().get::<Principal>().cloned();

    let response = next.run(request).await;

    let status = response.status().as_u16();
    let error_message = if status >= 400 {
        response
            .status()
            .canonical_reason()
            .map(String::from)
    } else {
        None
    };

    state.sink.emit(crate::audit::AuditEvent::from_record(AuditRecord {
        principal_id: principal.as_ref().map(|p| p.id.clone()),
        principal_email: principal.as_ref().map(|p| p.email.clone()),
        method,
        path,
        client_ip: ip,
        user_agent,
        status_code: status,
        latency_ms: start.elapsed().as_millis() as u64,
        request_bytes,
        response_bytes: content_length(response.headers()),
        error_message,
    }));

    response
}

// ────────────────────────────────────────────────────────────────────
// Security headers
// ────────────────────────────────────────────────────────────────────

/// Security headers stage. Applied to every surface, health included.
pub async fn security_headers_middleware(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        header::X_FRAME_OPTIONS,
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        header::STRICT_TRANSPORT_SECURITY,
        HeaderValue::from_static("max-age=31536000; includeSubDomains"),
    );
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
    );
    response
}

// ────────────────────────────────────────────────────────────────────
// Access log
// ────────────────────────────────────────────────────────────────────

/// Access log stage. One structured event per request under the
/// `access` target.
pub async fn access_log_middleware(request: Request, next: Next) -> Response {
    let request_id = generate_request_id();
    let start = Instant::now();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let ip = client_ip(request.headers());

    let response = next.run(request).await;

    tracing::info!(
        target: "access",
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = start.elapsed().as_millis() as u64,
        client_ip = %ip,
        "request completed"
    );

    response
}

// ────────────────────────────────────────────────────────────────────
// Authorization
// ────────────────────────────────────────────────────────────────────

/// Route-scoped authorization state: the roles a route requires.
#[derive(Clone)]
pub struct RequiredRoles {
    pub roles: Arc<BTreeSet<String>>,
}

impl RequiredRoles {
    pub fn new<I, S>(roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            roles: Arc::new(roles.into_iter().map(Into::into).collect()),
        }
    }
}

/// True when the principal holds at least one of the required roles.
pub fn has_required_role(principal: &Principal, required: &BTreeSet<String>) -> bool {
    principal.roles.iter().any(|r| required.contains(r))
}

/// Authorization stage, applied only to route groups declaring
/// required roles. Empty intersection short-circuits with 403.
pub async fn authorize_middleware(
    State(state): State<RequiredRoles>,
    request: Request,
    next: Next,
) -> Response {
    let Some(principal) = request.extensions().get::<Principal>() else {
        // Authentication must run before authorization.
        return Error::Auth("Authentication required".into()).into_response();
    };

    if !has_required_role(principal, &state.roles) {
        return Error::Forbidden(format!(
            "Requires one of roles: {}",
            state.roles.iter().cloned().collect::<Vec<_>>().join(", ")
        ))
        .into_response();
    }

    next.run(request).await
}

// ────────────────────────────────────────────────────────────────────
// Header hygiene for forwarding
// ────────────────────────────────────────────────────────────────────

/// Identity headers the gateway owns. Inbound values are always
/// stripped before forwarding so clients cannot spoof them.
pub const IDENTITY_HEADERS: &[&str] = &["x-user-id", "x-user-email", "x-user-roles"];

/// Strip client-supplied identity headers, then inject the resolved
/// principal's identity for the backend.
pub fn stamp_identity_headers(headers: &mut HeaderMap, principal: Option<&Principal>) {
    for name in IDENTITY_HEADERS {
        headers.remove(*name);
    }
    if let Some(p) = principal {
        if let Ok(v) = HeaderValue::from_str(&p.id) {
            headers.insert("x-user-id", v);
        }
        if let Ok(v) = HeaderValue::from_str(&p.email) {
            headers.insert("x-user-email", v);
        }
        if let Ok(v) = HeaderValue::from_str(&p.roles_header()) {
            headers.insert("x-user-roles", v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal(roles: &[&str]) -> Principal {
        Principal {
            id: "u-1".into(),
            email: "u1@example.com".into(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            active: true,
        }
    }

    #[test]
    fn test_client_ip_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );
        assert_eq!(client_ip(&headers), "203.0.113.9");
    }

    #[test]
    fn test_client_ip_real_ip_fallback() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.7"));
        assert_eq!(client_ip(&headers), "198.51.100.7");
    }

    #[test]
    fn test_client_ip_unknown() {
        assert_eq!(client_ip(&HeaderMap::new()), "unknown");
    }

    #[test]
    fn test_role_intersection() {
        let required: BTreeSet<String> =
            ["admin".to_string(), "editor".to_string()].into_iter().collect();

        assert!(has_required_role(&principal(&["admin"]), &required));
        assert!(has_required_role(&principal(&["editor", "viewer"]), &required));
        assert!(!has_required_role(&principal(&["viewer"]), &required));
        assert!(!has_required_role(&principal(&[]), &required));
    }

    #[test]
    fn test_identity_headers_stripped_and_stamped() {
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", HeaderValue::from_static("spoofed"));
        headers.insert("x-user-roles", HeaderValue::from_static("admin"));

        stamp_identity_headers(&mut headers, Some(&principal(&["editor"])));

        assert_eq!(headers.get("x-user-id").unwrap(), "u-1");
        assert_eq!(headers.get("x-user-email").unwrap(), "u1@example.com");
        assert_eq!(headers.get("x-user-roles").unwrap(), "editor");
    }

    #[test]
    fn test_identity_headers_stripped_without_principal() {
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", HeaderValue::from_static("spoofed"));
        headers.insert("x-user-email", HeaderValue::from_static("spoof@example.com"));

        stamp_identity_headers(&mut headers, None);

        assert!(headers.get("x-user-id").is_none());
        assert!(headers.get("x-user-email").is_none());
        assert!(headers.get("x-user-roles").is_none());
    }

    #[test]
    fn test_cors_state_allowlist() {
        let state = CorsState::new(vec!["https://app.example.com".into()]);
        assert!(state.allows("https://app.example.com"));
        assert!(!state.allows("https://evil.example.com"));
        assert!(!state.allows("*"));
    }
}
