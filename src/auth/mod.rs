//! # Identity Module
//!
//! Bearer-credential handling for the gateway. The engine itself never
//! touches signing algorithms: it consumes pre-parsed [`Claims`] through the
//! narrow [`TokenVerifier`] trait and only knows how to pull the credential
//! out of the `Authorization` header and compare roles.
//!
//! The bundled [`TokenAuthority`] is the HMAC collaborator used by the
//! `/auth/*` endpoints; swapping in an external verifier means implementing
//! one trait method.

mod verifier;

pub use verifier::{TokenAuthority, TokenAuthorityConfig, TokenVerifier};

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::error::GatewayError;

/// Authentication failure kinds, kept distinct so callers and metrics can
/// tell a malformed header from a bad signature from an expired token.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// Scheme prefix missing or payload failed structural validation.
    #[error("invalid credential format")]
    InvalidCredentialFormat,

    /// Signature did not verify.
    #[error("invalid signature")]
    InvalidSignature,

    /// Token is past its expiry.
    #[error("credential expired")]
    Expired,
}

impl From<AuthError> for GatewayError {
    fn from(err: AuthError) -> Self {
        GatewayError::InvalidCredential {
            reason: err.to_string(),
        }
    }
}

/// Identity claims yielded by a successful verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Stable subject identifier (`identity:` rate-limit keys use this).
    pub subject: String,

    /// Human-readable display name.
    pub name: String,

    /// Roles granted to the subject.
    pub roles: Vec<String>,

    /// Expiry instant.
    pub expires_at: DateTime<Utc>,

    /// Free-form custom attributes carried by the credential.
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl Claims {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn has_any_role(&self, roles: &[String]) -> bool {
        roles.iter().any(|r| self.has_role(r))
    }

    pub fn has_all_roles(&self, roles: &[String]) -> bool {
        roles.iter().all(|r| self.has_role(r))
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

/// Role requirement attached to a route: any-of or all-of semantics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RoleRequirement {
    AnyOf(Vec<String>),
    AllOf(Vec<String>),
}

impl RoleRequirement {
    pub fn satisfied_by(&self, claims: &Claims) -> bool {
        match self {
            RoleRequirement::AnyOf(roles) => claims.has_any_role(roles),
            RoleRequirement::AllOf(roles) => claims.has_all_roles(roles),
        }
    }
}

/// Extract the bearer token from an `Authorization` header value.
///
/// Fails with [`AuthError::InvalidCredentialFormat`] when the header is
/// absent, the scheme is not `Bearer`, or the payload is empty.
pub fn extract_bearer(header: Option<&str>) -> Result<&str, AuthError> {
    let header = header.ok_or(AuthError::InvalidCredentialFormat)?;
    let mut parts = header.splitn(2, ' ');
    match (parts.next(), parts.next()) {
        (Some("Bearer"), Some(token)) if !token.is_empty() => Ok(token),
        _ => Err(AuthError::InvalidCredentialFormat),
    }
}
