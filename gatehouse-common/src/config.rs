//! Configuration for the Gatehouse gateway.
//!
//! All settings are read from the environment exactly once at startup;
//! there is no hot reload. A gateway with unparseable or missing
//! required settings refuses to start rather than serving traffic in a
//! half-configured state.
//!
//! # Environment Variable Mapping
//!
//! - `GATEHOUSE_LISTEN_ADDR` → listen_addr (default `127.0.0.1:8080`)
//! - `GATEHOUSE_LOG_LEVEL` → observability.log_level (default `info`)
//! - `GATEHOUSE_LOG_FORMAT` → observability.log_format (default `pretty`)
//! - `GATEHOUSE_CORS_ORIGINS` → cors_origins (comma-separated allow-list)
//! - `GATEHOUSE_RATE_LIMIT` → rate_limit (default 60)
//! - `GATEHOUSE_RATE_WINDOW_SECS` → rate_window_secs (default 60)
//! - `GATEHOUSE_AUTH_MODE` → auth.mode (`static` or `jwt`)
//! - `GATEHOUSE_JWT_SECRET` → auth.jwt_secret (required when mode=jwt)
//! - `GATEHOUSE_SERVICES_API_URL` → backends["services_api"].base_url
//! - `GATEHOUSE_INQUIRIES_API_URL` → backends["inquiries_api"].base_url
//! - `GATEHOUSE_SIDECAR_URL` → sidecar_url (default `http://127.0.0.1:3500`)

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use url::Url;

/// Token validation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// In-memory token table. CI and local development only; any
    /// production deployment must run in `jwt` mode.
    Static,
    /// Signature/claims validation via a shared secret.
    Jwt,
}

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub mode: AuthMode,
    /// Signing secret, required when `mode` is `Jwt`.
    #[serde(default)]
    pub jwt_secret: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: AuthMode::Static,
            jwt_secret: None,
        }
    }
}

/// A named backend the gateway can forward to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Logical service name, also used for sidecar invocation.
    pub name: String,
    /// Base URL for direct forwarding and health probes.
    pub base_url: Url,
    /// Path probed by the readiness check.
    pub health_path: String,
}

/// Observability settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            log_format: "pretty".into(),
        }
    }
}

/// Gateway configuration, loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub observability: ObservabilityConfig,
    /// Explicit CORS origin allow-list. Origins not in this list never
    /// receive `Access-Control-Allow-Origin`.
    pub cors_origins: Vec<String>,
    /// Maximum admitted requests per key per window.
    pub rate_limit: u32,
    /// Fixed window duration in seconds.
    pub rate_window_secs: u64,
    pub auth: AuthConfig,
    pub backends: Vec<BackendConfig>,
    pub sidecar_url: Url,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".parse().expect("valid default addr"),
            observability: ObservabilityConfig::default(),
            cors_origins: Vec::new(),
            rate_limit: 60,
            rate_window_secs: 60,
            auth: AuthConfig::default(),
            backends: vec![
                BackendConfig {
                    name: "services_api".into(),
                    base_url: Url::parse("http://127.0.0.1:8081").expect("valid default url"),
                    health_path: "/health".into(),
                },
                BackendConfig {
                    name: "inquiries_api".into(),
                    base_url: Url::parse("http://127.0.0.1:8082").expect("valid default url"),
                    health_path: "/health".into(),
                },
            ],
            sidecar_url: Url::parse("http://127.0.0.1:3500").expect("valid default url"),
        }
    }
}

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("GATEHOUSE_LISTEN_ADDR") {
            config.listen_addr = addr
                .parse()
                .map_err(|e| Error::Config(format!("invalid GATEHOUSE_LISTEN_ADDR: {e}")))?;
        }

        if let Ok(level) = std::env::var("GATEHOUSE_LOG_LEVEL") {
            config.observability.log_level = level;
        }
        if let Ok(format) = std::env::var("GATEHOUSE_LOG_FORMAT") {
            config.observability.log_format = format;
        }

        if let Ok(origins) = std::env::var("GATEHOUSE_CORS_ORIGINS") {
            config.cors_origins = origins
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect();
        }

        if let Ok(limit) = std::env::var("GATEHOUSE_RATE_LIMIT") {
            config.rate_limit = limit
                .parse()
                .map_err(|e| Error::Config(format!("invalid GATEHOUSE_RATE_LIMIT: {e}")))?;
        }
        if let Ok(window) = std::env::var("GATEHOUSE_RATE_WINDOW_SECS") {
            config.rate_window_secs = window
                .parse()
                .map_err(|e| Error::Config(format!("invalid GATEHOUSE_RATE_WINDOW_SECS: {e}")))?;
        }

        if let Ok(mode) = std::env::var("GATEHOUSE_AUTH_MODE") {
            config.auth.mode = match mode.as_str() {
                "static" => AuthMode::Static,
                "jwt" => AuthMode::Jwt,
                other => {
                    return Err(Error::Config(format!(
                        "invalid GATEHOUSE_AUTH_MODE: {other} (expected \"static\" or \"jwt\")"
                    )))
                }
            };
        }
        config.auth.jwt_secret = std::env::var("GATEHOUSE_JWT_SECRET").ok();

        if let Ok(url) = std::env::var("GATEHOUSE_SERVICES_API_URL") {
            config.set_backend_url("services_api", &url)?;
        }
        if let Ok(url) = std::env::var("GATEHOUSE_INQUIRIES_API_URL") {
            config.set_backend_url("inquiries_api", &url)?;
        }

        if let Ok(url) = std::env::var("GATEHOUSE_SIDECAR_URL") {
            config.sidecar_url = Url::parse(&url)
                .map_err(|e| Error::Config(format!("invalid GATEHOUSE_SIDECAR_URL: {e}")))?;
        }

        config.validate()?;
        Ok(config)
    }

    fn set_backend_url(&mut self, name: &str, url: &str) -> Result<()> {
        let parsed = Url::parse(url)
            .map_err(|e| Error::Config(format!("invalid backend URL for {name}: {e}")))?;
        match self.backends.iter_mut().find(|b| b.name == name) {
            Some(backend) => backend.base_url = parsed,
            None => self.backends.push(BackendConfig {
                name: name.into(),
                base_url: parsed,
                health_path: "/health".into(),
            }),
        }
        Ok(())
    }

    /// Validate invariants that cannot be expressed by parsing alone.
    pub fn validate(&self) -> Result<()> {
        if self.auth.mode == AuthMode::Jwt
            && self.auth.jwt_secret.as_deref().map_or(true, str::is_empty)
        {
            return Err(Error::Config(
                "GATEHOUSE_JWT_SECRET is required when GATEHOUSE_AUTH_MODE=jwt".into(),
            ));
        }
        if self.rate_limit == 0 {
            return Err(Error::Config("GATEHOUSE_RATE_LIMIT must be at least 1".into()));
        }
        if self.rate_window_secs == 0 {
            return Err(Error::Config(
                "GATEHOUSE_RATE_WINDOW_SECS must be at least 1".into(),
            ));
        }
        if self.backends.is_empty() {
            return Err(Error::Config("at least one backend must be configured".into()));
        }
        if self.cors_origins.iter().any(|o| o == "*") {
            // Wildcard is incompatible with credentialed CORS responses.
            return Err(Error::Config(
                "GATEHOUSE_CORS_ORIGINS must list explicit origins, not \"*\"".into(),
            ));
        }
        Ok(())
    }

    /// Look up a configured backend by logical name.
    pub fn backend(&self, name: &str) -> Option<&BackendConfig> {
        self.backends.iter().find(|b| b.name == name)
    }
}
