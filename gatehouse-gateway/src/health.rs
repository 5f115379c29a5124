//! Liveness and readiness probing.
//!
//! `/health` is a dependency-free liveness signal. `/health/ready`
//! actively probes every configured backend's health path on each
//! call; results are never cached across calls.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::future::join_all;
use gatehouse_common::config::BackendConfig;
use reqwest::Client;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Per-target probe timeout.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Overall budget for the startup dependency check.
pub const STARTUP_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

fn probe_url(base: &Url, health_path: &str) -> String {
    format!(
        "{}/{}",
        base.as_str().trim_end_matches('/'),
        health_path.trim_start_matches('/')
    )
}

struct ProbeTarget {
    name: String,
    url: String,
}

/// Active backend health prober.
pub struct HealthProber {
    client: Client,
    targets: Vec<ProbeTarget>,
}

impl HealthProber {
    pub fn from_backends(backends: &[BackendConfig]) -> gatehouse_common::Result<Self> {
        let client = crate::proxy::build_client(PROBE_TIMEOUT)?;
        let targets = backends
            .iter()
            .map(|b| ProbeTarget {
                name: b.name.clone(),
                url: probe_url(&b.base_url, &b.health_path),
            })
            .collect();
        Ok(Self { client, targets })
    }

    async fn probe_one(&self, target: &ProbeTarget) -> bool {
        match self.client.get(&target.url).send().await {
            Ok(response) => response.status() == reqwest::StatusCode::OK,
            Err(e) => {
                tracing::warn!(backend = %target.name, url = %target.url, error = %e, "Health probe failed");
                false
            }
        }
    }

    /// Probe every target concurrently. Returns the per-target result
    /// map; ordering is stable by backend name.
    pub async fn probe_all(&self) -> BTreeMap<String, bool> {
        let probes = self.targets.iter().map(|t| async {
            let healthy = self.probe_one(t).await;
            (t.name.clone(), healthy)
        });
        join_all(probes).await.into_iter().collect()
    }
}

/// One probe round at startup, bounded by [`STARTUP_CHECK_TIMEOUT`].
/// Unreachable backends are logged but do not prevent startup; they
/// surface through `/health/ready` until they recover.
pub async fn startup_check(prober: &HealthProber) {
    match tokio::time::timeout(STARTUP_CHECK_TIMEOUT, prober.probe_all()).await {
        Ok(results) => {
            for (name, healthy) in &results {
                if *healthy {
                    tracing::info!(backend = %name, "Backend reachable");
                } else {
                    tracing::warn!(backend = %name, "Backend unreachable at startup");
                }
            }
        }
        Err(_) => {
            tracing::warn!("Startup dependency check timed out");
        }
    }
}

/// `GET /health` - cheap liveness signal, no dependency checks.
pub async fn health_handler() -> Response {
    Json(json!({"status": "ok"})).into_response()
}

/// `GET /health/ready` - 200 when every backend probe passes, 503 with
/// a per-target breakdown otherwise.
pub async fn readiness_handler(State(prober): State<Arc<HealthProber>>) -> Response {
    let results = prober.probe_all().await;

    if results.values().all(|healthy| *healthy) {
        Json(json!({"status": "ready"})).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "services": results,
            })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_url_building() {
        let base = Url::parse("http://127.0.0.1:8081").unwrap();
        assert_eq!(probe_url(&base, "/health"), "http://127.0.0.1:8081/health");
        assert_eq!(probe_url(&base, "health"), "http://127.0.0.1:8081/health");

        let base = Url::parse("http://api.internal/").unwrap();
        assert_eq!(probe_url(&base, "/healthz"), "http://api.internal/healthz");
    }

    #[tokio::test]
    async fn test_probe_unreachable_backend_is_unhealthy() {
        // Port 9 (discard) is a safe dead target.
        let backends = vec![BackendConfig {
            name: "services_api".into(),
            base_url: Url::parse("http://127.0.0.1:9").unwrap(),
            health_path: "/health".into(),
        }];
        let prober = HealthProber::from_backends(&backends).unwrap();

        let results = prober.probe_all().await;
        assert_eq!(results.get("services_api"), Some(&false));
    }
}
