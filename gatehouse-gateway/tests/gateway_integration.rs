//! End-to-end pipeline tests against the assembled router.
//!
//! Backends are wiremock servers; authentication uses the static token
//! table; audit events are captured in-memory.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use gatehouse_common::config::Config;
use gatehouse_common::error::ErrorBody;
use gatehouse_gateway::audit::{AuditSink, MemoryAuditSink};
use gatehouse_gateway::build_gateway_with;
use gatehouse_gateway::principal::{StaticTokenValidator, TokenValidator};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use url::Url;
use wiremock::matchers::{header as match_header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn base_config() -> Config {
    let mut config = Config::default();
    config.cors_origins = vec!["https://app.example.com".into()];
    config
}

fn set_backend(config: &mut Config, name: &str, url: &str) {
    let backend = config
        .backends
        .iter_mut()
        .find(|b| b.name == name)
        .expect("configured backend");
    backend.base_url = Url::parse(url).expect("valid test url");
}

fn build_router(config: &Config) -> (Router, Arc<MemoryAuditSink>) {
    let validator: Arc<dyn TokenValidator> = Arc::new(StaticTokenValidator::with_defaults());
    let sink = Arc::new(MemoryAuditSink::new());
    let gateway = build_gateway_with(config, validator, Arc::clone(&sink) as Arc<dyn AuditSink>)
        .expect("gateway builds");
    (gateway.router, sink)
}

async fn send(router: &Router, request: Request<Body>) -> axum::response::Response {
    router.clone().oneshot(request).await.expect("infallible")
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request")
}

fn get_with_token(uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .expect("request")
}

#[tokio::test]
async fn test_health_is_always_ok() {
    let (router, _) = build_router(&base_config());

    let response = send(&router, get("/health")).await;
    assert_eq!(response.status(), StatusCode::OK);
    // Security headers apply to the health surface too.
    assert_eq!(
        response.headers().get("x-content-type-options").unwrap(),
        "nosniff"
    );
    assert_eq!(response.headers().get("x-frame-options").unwrap(), "DENY");

    assert_eq!(body_json(response).await, json!({"status": "ok"}));
}

#[tokio::test]
async fn test_readiness_reflects_backend_health() {
    let services = MockServer::start().await;
    let inquiries = MockServer::start().await;
    for server in [&services, &inquiries] {
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(server)
            .await;
    }

    let mut config = base_config();
    set_backend(&mut config, "services_api", &services.uri());
    set_backend(&mut config, "inquiries_api", &inquiries.uri());
    let (router, _) = build_router(&config);

    let response = send(&router, get("/health/ready")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({"status": "ready"}));

    // Probing is stateless; a second call re-probes and still passes.
    let response = send(&router, get("/health/ready")).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_readiness_reports_unreachable_backend() {
    let inquiries = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&inquiries)
        .await;

    let mut config = base_config();
    // Port 9 (discard) is a safe dead target.
    set_backend(&mut config, "services_api", "http://127.0.0.1:9");
    set_backend(&mut config, "inquiries_api", &inquiries.uri());
    let (router, _) = build_router(&config);

    let response = send(&router, get("/health/ready")).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let body = body_json(response).await;
    assert_eq!(body["status"], "not_ready");
    assert_eq!(body["services"]["services_api"], false);
    assert_eq!(body["services"]["inquiries_api"], true);
}

#[tokio::test]
async fn test_admin_route_requires_authentication() {
    let services = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&services)
        .await;

    let mut config = base_config();
    set_backend(&mut config, "services_api", &services.uri());
    let (router, _) = build_router(&config);

    let response = send(&router, get("/admin/api/v1/services/items")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let body: ErrorBody = serde_json::from_value(body_json(response).await).unwrap();
    assert_eq!(body.error, "Unauthorized");
}

#[tokio::test]
async fn test_unknown_token_is_rejected() {
    let (router, _) = build_router(&base_config());

    let response = send(
        &router,
        get_with_token("/admin/api/v1/services/items", "no-such-token"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_inactive_principal_is_rejected() {
    let (router, _) = build_router(&base_config());

    let response = send(
        &router,
        get_with_token("/admin/api/v1/services/items", "inactive-test-token"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_admin_token_is_proxied_with_identity_headers() {
    let services = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/items"))
        .and(match_header("x-user-id", "u-admin"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": []})))
        .expect(1)
        .mount(&services)
        .await;

    let mut config = base_config();
    set_backend(&mut config, "services_api", &services.uri());
    let (router, _) = build_router(&config);

    // The spoofed header must be replaced by the resolved identity.
    let request = Request::builder()
        .uri("/admin/api/v1/services/items")
        .header(header::AUTHORIZATION, "Bearer admin-test-token")
        .header("x-user-id", "spoofed")
        .body(Body::empty())
        .unwrap();

    let response = send(&router, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({"items": []}));
}

#[tokio::test]
async fn test_editor_role_is_sufficient() {
    let services = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/items"))
        .and(match_header("x-user-id", "u-editor"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&services)
        .await;

    let mut config = base_config();
    set_backend(&mut config, "services_api", &services.uri());
    let (router, _) = build_router(&config);

    let response = send(
        &router,
        get_with_token("/admin/api/v1/services/items", "editor-test-token"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_viewer_is_forbidden_and_audited() {
    let services = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&services)
        .await;

    let mut config = base_config();
    set_backend(&mut config, "services_api", &services.uri());
    let (router, sink) = build_router(&config);

    let response = send(
        &router,
        get_with_token("/admin/api/v1/services/items", "viewer-test-token"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert!(!events[0].success);
    assert_eq!(events[0].status_code, 403);
    assert_eq!(events[0].principal_id.as_deref(), Some("u-viewer"));
}

#[tokio::test]
async fn test_successful_admin_request_is_audited() {
    let services = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/items"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&services)
        .await;

    let mut config = base_config();
    set_backend(&mut config, "services_api", &services.uri());
    let (router, sink) = build_router(&config);

    let response = send(
        &router,
        get_with_token("/admin/api/v1/services/items", "admin-test-token"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert!(events[0].success);
    assert_eq!(events[0].action, "GET /admin/api/v1/services/items");
    assert_eq!(events[0].principal_id.as_deref(), Some("u-admin"));
}

#[tokio::test]
async fn test_rate_limit_rejects_fourth_request() {
    let services = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/items"))
        .respond_with(ResponseTemplate::new(200))
        .expect(3)
        .mount(&services)
        .await;

    let mut config = base_config();
    config.rate_limit = 3;
    set_backend(&mut config, "services_api", &services.uri());
    let (router, sink) = build_router(&config);

    for _ in 0..3 {
        let response = send(
            &router,
            get_with_token("/admin/api/v1/services/items", "admin-test-token"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = send(
        &router,
        get_with_token("/admin/api/v1/services/items", "admin-test-token"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    let body: ErrorBody = serde_json::from_value(body_json(response).await).unwrap();
    assert_eq!(body.error, "Too many requests");

    // The rejection happens before the audit stage; only the three
    // admitted requests produce events.
    assert_eq!(sink.events().len(), 3);
}

#[tokio::test]
async fn test_public_rate_limit_is_per_client_ip() {
    let sidecar = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&sidecar)
        .await;

    let mut config = base_config();
    config.rate_limit = 2;
    config.sidecar_url = Url::parse(&sidecar.uri()).unwrap();
    let (router, _) = build_router(&config);

    let from_ip = |ip: &str| {
        Request::builder()
            .uri("/api/v1/services/list")
            .header("x-forwarded-for", ip.to_string())
            .body(Body::empty())
            .unwrap()
    };

    for _ in 0..2 {
        let response = send(&router, from_ip("203.0.113.9")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = send(&router, from_ip("203.0.113.9")).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    // A different client keeps its own budget.
    let response = send(&router, from_ip("198.51.100.7")).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_preflight_short_circuits_with_204() {
    let (router, _) = build_router(&base_config());

    let request = Request::builder()
        .method("OPTIONS")
        .uri("/api/v1/services/list")
        .header(header::ORIGIN, "https://app.example.com")
        .body(Body::empty())
        .unwrap();

    let response = send(&router, request).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .unwrap(),
        "https://app.example.com"
    );
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-credentials")
            .unwrap(),
        "true"
    );
    assert!(response
        .headers()
        .get("access-control-allow-methods")
        .is_some());
}

#[tokio::test]
async fn test_preflight_from_unlisted_origin_gets_no_cors_headers() {
    let (router, _) = build_router(&base_config());

    let request = Request::builder()
        .method("OPTIONS")
        .uri("/api/v1/services/list")
        .header(header::ORIGIN, "https://evil.example.com")
        .body(Body::empty())
        .unwrap();

    let response = send(&router, request).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(response
        .headers()
        .get("access-control-allow-origin")
        .is_none());
}

#[tokio::test]
async fn test_unrouted_path_is_stable_404() {
    let (router, _) = build_router(&base_config());

    let response = send(&router, get("/api/v1/unknown/thing")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let body: ErrorBody = serde_json::from_value(body_json(response).await).unwrap();
    assert_eq!(body.error, "Not found");
}

#[tokio::test]
async fn test_unmatched_surface_renders_stable_404() {
    let (router, _) = build_router(&base_config());

    // Outside every configured surface entirely.
    let response = send(&router, get("/totally/elsewhere")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        response.headers().get("x-content-type-options").unwrap(),
        "nosniff"
    );
    let body: ErrorBody = serde_json::from_value(body_json(response).await).unwrap();
    assert_eq!(body.error, "Not found");

    // A bare surface prefix with no trailing segment falls through too.
    let response = send(&router, get("/admin/api/v1")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: ErrorBody = serde_json::from_value(body_json(response).await).unwrap();
    assert_eq!(body.error, "Not found");
}

#[tokio::test]
async fn test_unmatched_surface_preflight_still_short_circuits() {
    let (router, _) = build_router(&base_config());

    let request = Request::builder()
        .method("OPTIONS")
        .uri("/totally/elsewhere")
        .header(header::ORIGIN, "https://app.example.com")
        .body(Body::empty())
        .unwrap();

    let response = send(&router, request).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .unwrap(),
        "https://app.example.com"
    );
}

#[tokio::test]
async fn test_dead_backend_renders_stable_502() {
    let mut config = base_config();
    set_backend(&mut config, "services_api", "http://127.0.0.1:9");
    let (router, _) = build_router(&config);

    let response = send(
        &router,
        get_with_token("/admin/api/v1/services/items", "admin-test-token"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    // The body never leaks transport detail.
    assert_eq!(
        body_json(response).await,
        json!({
            "error": "Service unavailable",
            "message": "Backend service is not responding"
        })
    );
}

#[tokio::test]
async fn test_public_route_invokes_through_sidecar() {
    let sidecar = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1.0/invoke/services_api/method/list"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": [1, 2]})))
        .expect(1)
        .mount(&sidecar)
        .await;

    let mut config = base_config();
    config.sidecar_url = Url::parse(&sidecar.uri()).unwrap();
    let (router, _) = build_router(&config);

    let response = send(&router, get("/api/v1/services/list")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({"items": [1, 2]}));
}

#[tokio::test]
async fn test_public_route_strips_spoofed_identity_headers() {
    let sidecar = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&sidecar)
        .await;

    let mut config = base_config();
    config.sidecar_url = Url::parse(&sidecar.uri()).unwrap();
    let (router, _) = build_router(&config);

    let request = Request::builder()
        .uri("/api/v1/services/list")
        .header("x-user-id", "spoofed")
        .header("x-user-roles", "admin")
        .body(Body::empty())
        .unwrap();
    let response = send(&router, request).await;
    assert_eq!(response.status(), StatusCode::OK);

    let received = sidecar.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    assert!(received[0].headers.get("x-user-id").is_none());
    assert!(received[0].headers.get("x-user-roles").is_none());
}

#[tokio::test]
async fn test_proxied_response_carries_security_headers() {
    let services = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&services)
        .await;

    let mut config = base_config();
    set_backend(&mut config, "services_api", &services.uri());
    let (router, _) = build_router(&config);

    let response = send(
        &router,
        get_with_token("/admin/api/v1/services/items", "admin-test-token"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let headers = response.headers();
    assert_eq!(headers.get("x-content-type-options").unwrap(), "nosniff");
    assert_eq!(headers.get("x-frame-options").unwrap(), "DENY");
    assert_eq!(
        headers.get("strict-transport-security").unwrap(),
        "max-age=31536000; includeSubDomains"
    );
    assert_eq!(
        headers.get("content-security-policy").unwrap(),
        "default-src 'none'; frame-ancestors 'none'"
    );
}

#[tokio::test]
async fn test_cors_headers_on_actual_response() {
    let services = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&services)
        .await;

    let mut config = base_config();
    set_backend(&mut config, "services_api", &services.uri());
    let (router, _) = build_router(&config);

    let request = Request::builder()
        .uri("/admin/api/v1/services/items")
        .header(header::AUTHORIZATION, "Bearer admin-test-token")
        .header(header::ORIGIN, "https://app.example.com")
        .body(Body::empty())
        .unwrap();

    let response = send(&router, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .unwrap(),
        "https://app.example.com"
    );
}
