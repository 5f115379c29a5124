//! Route table and request dispatch.
//!
//! Routes are built once at startup from configuration and never
//! mutated. Resolution is a longest-prefix match over the configured
//! path prefixes; the matched gateway prefix is stripped before
//! forwarding so backends see backend-relative paths.

use crate::audit::{AuditSink, LogAuditSink};
use crate::health::{health_handler, readiness_handler, HealthProber};
use crate::middleware::{
    access_log_middleware, audit_middleware, auth_middleware, authorize_middleware,
    cors_middleware, rate_limit_middleware, security_headers_middleware, AuditState, AuthState,
    CorsState, RateLimitState, RateScope, RequiredRoles,
};
use crate::principal::{validator_from_config, TokenValidator};
use crate::proxy::{BackendTransport, DirectHttpTransport, SidecarTransport, MAX_BODY_BYTES};
use crate::rate_limit::RateLimiter;
use axum::{
    extract::{Request, State},
    middleware::{from_fn, from_fn_with_state},
    response::{IntoResponse, Response},
    routing::{any, get},
    Router,
};
use gatehouse_common::config::Config;
use gatehouse_common::Error;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

pub use gatehouse_common::config::BackendConfig as BackendTarget;

/// Backstop for the whole request pipeline; backend calls carry their
/// own tighter timeouts.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// How a matched route reaches its backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    DirectProxy,
    SidecarInvoke,
}

/// One configured route. Immutable for the process lifetime.
#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub path_prefix: String,
    /// Logical name of the backend this route forwards to.
    pub backend: String,
    /// Roles required on this route; `None` means no gateway-level
    /// authorization.
    pub required_roles: Option<BTreeSet<String>>,
    pub transport: Transport,
}

impl RouteEntry {
    /// The backend-relative path: the matched prefix stripped, never
    /// empty.
    pub fn backend_relative_path(&self, path: &str) -> String {
        let rest = path.strip_prefix(&self.path_prefix).unwrap_or(path);
        if rest.is_empty() {
            "/".to_string()
        } else {
            rest.to_string()
        }
    }
}

/// Prefix-ordered route table.
pub struct RouteTable {
    /// Sorted by prefix length descending so the first match wins the
    /// longest-prefix rule.
    entries: Vec<RouteEntry>,
    backends: HashMap<String, BackendTarget>,
}

/// URL segment for a backend: `services_api` routes as `services`.
fn route_segment(backend_name: &str) -> &str {
    backend_name.strip_suffix("_api").unwrap_or(backend_name)
}

impl RouteTable {
    pub fn new(mut entries: Vec<RouteEntry>, backends: Vec<BackendTarget>) -> Self {
        entries.sort_by(|a, b| b.path_prefix.len().cmp(&a.path_prefix.len()));
        let backends = backends.into_iter().map(|b| (b.name.clone(), b)).collect();
        Self { entries, backends }
    }

    /// Derive the route table from configuration: every backend gets
    /// an authenticated admin route (direct proxy) and a public route
    /// (sidecar invocation).
    pub fn from_config(config: &Config) -> Self {
        let admin_roles: BTreeSet<String> =
            ["admin".to_string(), "editor".to_string()].into_iter().collect();

        let mut entries = Vec::new();
        for backend in &config.backends {
            let segment = route_segment(&backend.name);
            entries.push(RouteEntry {
                path_prefix: format!("/admin/api/v1/{segment}"),
                backend: backend.name.clone(),
                required_roles: Some(admin_roles.clone()),
                transport: Transport::DirectProxy,
            });
            entries.push(RouteEntry {
                path_prefix: format!("/api/v1/{segment}"),
                backend: backend.name.clone(),
                required_roles: None,
                transport: Transport::SidecarInvoke,
            });
        }
        Self::new(entries, config.backends.clone())
    }

    /// Longest-prefix match, segment-aligned: `/api/v1/services` does
    /// not match `/api/v1/services2`.
    pub fn resolve(&self, path: &str) -> Option<&RouteEntry> {
        self.entries.iter().find(|entry| {
            path.strip_prefix(&entry.path_prefix)
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
        })
    }

    pub fn backend(&self, name: &str) -> Option<&BackendTarget> {
        self.backends.get(name)
    }
}

/// Shared dispatcher state.
#[derive(Clone)]
pub struct AppState {
    pub table: Arc<RouteTable>,
    pub direct: Arc<DirectHttpTransport>,
    pub sidecar: Arc<SidecarTransport>,
}

/// Terminal handler for paths outside every configured surface.
/// Renders the same stable error body as an in-surface route miss.
async fn unmatched_path(request: Request) -> Response {
    Error::NotFound(format!("No route for {}", request.uri().path())).into_response()
}

/// Dispatcher: resolve the route, pick the transport, forward.
pub async fn dispatch(State(state): State<AppState>, request: Request) -> Response {
    let path = request.uri().path().to_string();

    let Some(entry) = state.table.resolve(&path) else {
        return Error::NotFound(format!("No route for {path}")).into_response();
    };
    let Some(backend) = state.table.backend(&entry.backend) else {
        tracing::error!(backend = %entry.backend, "Route references unknown backend");
        return Error::Internal("route references unknown backend".into()).into_response();
    };

    let backend_path = entry.backend_relative_path(&path);
    match entry.transport {
        Transport::DirectProxy => state.direct.forward(backend, &backend_path, request).await,
        Transport::SidecarInvoke => state.sidecar.forward(backend, &backend_path, request).await,
    }
}

/// A built gateway: the router plus the long-lived components whose
/// lifecycles the server owns.
pub struct Gateway {
    pub router: Router,
    pub admin_limiter: Arc<RateLimiter>,
    pub public_limiter: Arc<RateLimiter>,
    pub prober: Arc<HealthProber>,
}

/// Build the gateway with the validator and audit sink selected by
/// configuration.
pub fn build_gateway(config: &Config) -> gatehouse_common::Result<Gateway> {
    let validator = validator_from_config(&config.auth)?;
    let sink: Arc<dyn AuditSink> = Arc::new(LogAuditSink::new());
    build_gateway_with(config, validator, sink)
}

/// Build the gateway with explicit validator and audit sink. Used by
/// tests to substitute doubles.
pub fn build_gateway_with(
    config: &Config,
    validator: Arc<dyn TokenValidator>,
    sink: Arc<dyn AuditSink>,
) -> gatehouse_common::Result<Gateway> {
    let window = Duration::from_secs(config.rate_window_secs);
    // Admin keys are principal IDs, public keys are client IPs; the
    // two surfaces never share a limiter instance.
    let admin_limiter = Arc::new(RateLimiter::new(config.rate_limit, window));
    let public_limiter = Arc::new(RateLimiter::new(config.rate_limit, window));

    let app_state = AppState {
        table: Arc::new(RouteTable::from_config(config)),
        direct: Arc::new(DirectHttpTransport::new()?),
        sidecar: Arc::new(SidecarTransport::new(config.sidecar_url.clone())?),
    };
    let prober = Arc::new(HealthProber::from_backends(&config.backends)?);
    let cors = CorsState::new(config.cors_origins.clone());

    // Health paths skip authentication, rate limiting, and audit.
    let health_routes = Router::new()
        .route("/health", get(health_handler))
        .route("/health/ready", get(readiness_handler))
        .with_state(Arc::clone(&prober))
        .layer(from_fn(security_headers_middleware))
        .layer(from_fn_with_state(cors.clone(), cors_middleware));

    // Layers run outermost-last-added: the resulting request order is
    // CORS, auth, rate limit, audit, security headers, access log,
    // authorization, dispatcher.
    let admin_routes = Router::new()
        .route("/admin/api/v1/*path", any(dispatch))
        .layer(from_fn_with_state(
            RequiredRoles::new(["admin", "editor"]),
            authorize_middleware,
        ))
        .layer(from_fn(access_log_middleware))
        .layer(from_fn(security_headers_middleware))
        .layer(from_fn_with_state(
            AuditState { sink: Arc::clone(&sink) },
            audit_middleware,
        ))
        .layer(from_fn_with_state(
            RateLimitState {
                limiter: Arc::clone(&admin_limiter),
                scope: RateScope::Principal,
            },
            rate_limit_middleware,
        ))
        .layer(from_fn_with_state(AuthState { validator }, auth_middleware))
        .layer(from_fn_with_state(cors.clone(), cors_middleware))
        .with_state(app_state.clone());

    // Public surface: no gateway-level authentication; backends may
    // enforce their own.
    let public_routes = Router::new()
        .route("/api/v1/*path", any(dispatch))
        .layer(from_fn(access_log_middleware))
        .layer(from_fn(security_headers_middleware))
        .layer(from_fn_with_state(
            RateLimitState {
                limiter: Arc::clone(&public_limiter),
                scope: RateScope::ClientIp,
            },
            rate_limit_middleware,
        ))
        .layer(from_fn_with_state(cors.clone(), cors_middleware))
        .with_state(app_state);

    // Paths outside every surface still get the stable error body,
    // CORS handling, and security headers.
    let fallback = Router::new()
        .fallback(unmatched_path)
        .layer(from_fn(security_headers_middleware))
        .layer(from_fn_with_state(cors, cors_middleware));

    let router = Router::new()
        .merge(health_routes)
        .merge(admin_routes)
        .merge(public_routes)
        .fallback_service(fallback)
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES));

    Ok(Gateway {
        router,
        admin_limiter,
        public_limiter,
        prober,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RouteTable {
        RouteTable::from_config(&Config::default())
    }

    #[test]
    fn test_resolve_admin_route() {
        let table = table();
        let entry = table.resolve("/admin/api/v1/services/items").unwrap();
        assert_eq!(entry.backend, "services_api");
        assert_eq!(entry.transport, Transport::DirectProxy);
        assert!(entry.required_roles.as_ref().unwrap().contains("admin"));
        assert!(entry.required_roles.as_ref().unwrap().contains("editor"));
    }

    #[test]
    fn test_resolve_public_route() {
        let table = table();
        let entry = table.resolve("/api/v1/inquiries").unwrap();
        assert_eq!(entry.backend, "inquiries_api");
        assert_eq!(entry.transport, Transport::SidecarInvoke);
        assert!(entry.required_roles.is_none());
    }

    #[test]
    fn test_resolve_prefers_longest_prefix() {
        let entries = vec![
            RouteEntry {
                path_prefix: "/api/v1".into(),
                backend: "catchall".into(),
                required_roles: None,
                transport: Transport::DirectProxy,
            },
            RouteEntry {
                path_prefix: "/api/v1/services".into(),
                backend: "services_api".into(),
                required_roles: None,
                transport: Transport::DirectProxy,
            },
        ];
        let table = RouteTable::new(entries, Config::default().backends);

        assert_eq!(table.resolve("/api/v1/services/x").unwrap().backend, "services_api");
        assert_eq!(table.resolve("/api/v1/other").unwrap().backend, "catchall");
    }

    #[test]
    fn test_resolve_is_segment_aligned() {
        let table = table();
        // "/api/v1/services2" must not match the "/api/v1/services" prefix.
        assert!(table.resolve("/api/v1/services2/x").is_none());
    }

    #[test]
    fn test_resolve_unknown_path() {
        let table = table();
        assert!(table.resolve("/api/v2/services").is_none());
        assert!(table.resolve("/totally/elsewhere").is_none());
    }

    #[test]
    fn test_prefix_stripping() {
        let table = table();
        let entry = table.resolve("/admin/api/v1/services/items/42").unwrap();
        assert_eq!(
            entry.backend_relative_path("/admin/api/v1/services/items/42"),
            "/items/42"
        );
        assert_eq!(entry.backend_relative_path("/admin/api/v1/services"), "/");
    }

    #[test]
    fn test_route_segment() {
        assert_eq!(route_segment("services_api"), "services");
        assert_eq!(route_segment("inquiries_api"), "inquiries");
        assert_eq!(route_segment("billing"), "billing");
    }
}
