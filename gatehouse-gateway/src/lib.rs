//! Gatehouse - API gateway in front of the backend services.
//!
//! Every inbound request passes through a fixed middleware pipeline
//! (CORS, authentication, rate limiting, audit, security headers,
//! access logging, authorization) before being dispatched to a backend
//! either as a direct reverse-proxy call or as a sidecar invocation.

pub mod audit;
pub mod health;
pub mod middleware;
pub mod principal;
pub mod proxy;
pub mod rate_limit;
pub mod routes;

pub use routes::{build_gateway, build_gateway_with, Gateway};

use gatehouse_common::Config;

/// Run the gateway until the process is terminated.
///
/// Starts the rate-limiter eviction sweepers, performs one best-effort
/// backend reachability check, then serves.
pub async fn start_server(config: Config) -> anyhow::Result<()> {
    let gateway = build_gateway(&config)?;

    gateway.admin_limiter.start_sweeper();
    gateway.public_limiter.start_sweeper();

    health::startup_check(&gateway.prober).await;

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "Gateway listening");

    axum::serve(listener, gateway.router).await?;
    Ok(())
}
