//! Principal resolution for the Gatehouse gateway.
//!
//! Turns a bearer credential into a [`Principal`] record. Validators
//! are side-effect-free and never log; callers map failures to HTTP
//! responses.

use chrono::Utc;
use gatehouse_common::config::{AuthConfig, AuthMode};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;

/// The authenticated identity attached to a request.
///
/// Immutable once resolved; lives in request extensions for the
/// lifetime of that request only and is never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub id: String,
    pub email: String,
    pub roles: BTreeSet<String>,
    pub active: bool,
}

impl Principal {
    /// Comma-joined role list for forwarding headers.
    pub fn roles_header(&self) -> String {
        self.roles.iter().cloned().collect::<Vec<_>>().join(",")
    }
}

/// Credential validation failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid or expired token")]
    Invalid,
    #[error("account is inactive")]
    Inactive,
}

/// Pluggable token validation.
///
/// Input is the raw bearer token value with the `Bearer ` prefix
/// already stripped by the caller.
pub trait TokenValidator: Send + Sync {
    fn resolve(&self, token: &str) -> Result<Principal, AuthError>;
}

/// In-memory token table.
///
/// CI and local development only. Production deployments must use
/// [`JwtTokenValidator`], selected via `GATEHOUSE_AUTH_MODE=jwt`.
pub struct StaticTokenValidator {
    table: HashMap<String, Principal>,
}

impl StaticTokenValidator {
    pub fn new(table: HashMap<String, Principal>) -> Self {
        Self { table }
    }

    /// Table with the well-known test tokens.
    pub fn with_defaults() -> Self {
        let mut table = HashMap::new();
        table.insert(
            "admin-test-token".to_string(),
            Principal {
                id: "u-admin".into(),
                email: "admin@example.com".into(),
                roles: BTreeSet::from(["admin".to_string()]),
                active: true,
            },
        );
        table.insert(
            "editor-test-token".to_string(),
            Principal {
                id: "u-editor".into(),
                email: "editor@example.com".into(),
                roles: BTreeSet::from(["editor".to_string()]),
                active: true,
            },
        );
        table.insert(
            "viewer-test-token".to_string(),
            Principal {
                id: "u-viewer".into(),
                email: "viewer@example.com".into(),
                roles: BTreeSet::from(["viewer".to_string()]),
                active: true,
            },
        );
        table.insert(
            "inactive-test-token".to_string(),
            Principal {
                id: "u-inactive".into(),
                email: "inactive@example.com".into(),
                roles: BTreeSet::from(["admin".to_string()]),
                active: false,
            },
        );
        Self { table }
    }
}

impl TokenValidator for StaticTokenValidator {
    fn resolve(&self, token: &str) -> Result<Principal, AuthError> {
        let principal = self.table.get(token).ok_or(AuthError::Invalid)?;
        if !principal.active {
            return Err(AuthError::Inactive);
        }
        Ok(principal.clone())
    }
}

/// JWT claims structure.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject (principal ID)
    pub sub: String,
    pub email: String,
    pub roles: Vec<String>,
    #[serde(default = "default_active")]
    pub active: bool,
    /// Expiration time (Unix timestamp)
    pub exp: usize,
    /// Issued at (Unix timestamp)
    pub iat: usize,
}

fn default_active() -> bool {
    true
}

/// Signature/claims validator backed by a shared secret.
pub struct JwtTokenValidator {
    secret: Arc<String>,
}

impl JwtTokenValidator {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: Arc::new(secret.into()),
        }
    }

    /// Mint a token for the given principal. Used by tests and tooling;
    /// the gateway itself never issues credentials.
    pub fn generate_token(
        &self,
        principal: &Principal,
        expiry_secs: u64,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let now = Utc::now().timestamp() as usize;
        let claims = Claims {
            sub: principal.id.clone(),
            email: principal.email.clone(),
            roles: principal.roles.iter().cloned().collect(),
            active: principal.active,
            exp: now + expiry_secs as usize,
            iat: now,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
    }
}

impl TokenValidator for JwtTokenValidator {
    fn resolve(&self, token: &str) -> Result<Principal, AuthError> {
        let token_data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|_| AuthError::Invalid)?;

        let claims = token_data.claims;
        if !claims.active {
            return Err(AuthError::Inactive);
        }
        Ok(Principal {
            id: claims.sub,
            email: claims.email,
            roles: claims.roles.into_iter().collect(),
            active: true,
        })
    }
}

/// Build the validator selected by configuration.
pub fn validator_from_config(
    auth: &AuthConfig,
) -> gatehouse_common::Result<Arc<dyn TokenValidator>> {
    match auth.mode {
        AuthMode::Static => Ok(Arc::new(StaticTokenValidator::with_defaults())),
        AuthMode::Jwt => {
            let secret = auth.jwt_secret.clone().ok_or_else(|| {
                gatehouse_common::Error::Config("jwt auth mode requires a secret".into())
            })?;
            Ok(Arc::new(JwtTokenValidator::new(secret)))
        }
    }
}
