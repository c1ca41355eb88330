//! Token verification and issuance.
//!
//! [`TokenVerifier`] is the single seam between the gateway core and
//! whatever signs credentials: `verify(token) -> Claims | AuthError`. The
//! bundled [`TokenAuthority`] implements it with HMAC-signed JWTs and also
//! issues and refreshes tokens for the identity endpoints.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{AuthError, Claims};

/// The one operation the gateway core needs from an identity provider.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Claims, AuthError>;
}

/// Wire-format claims of the bundled HMAC authority.
#[derive(Debug, Serialize, Deserialize)]
struct WireClaims {
    sub: String,
    name: String,
    roles: Vec<String>,
    #[serde(default)]
    attrs: HashMap<String, String>,
    exp: i64,
    iat: i64,
    iss: String,
}

/// Settings for the bundled authority.
#[derive(Debug, Clone)]
pub struct TokenAuthorityConfig {
    pub secret: String,
    pub token_ttl: Duration,
    /// A token may be refreshed once it is within this window of expiry.
    pub refresh_window: Duration,
    pub issuer: String,
}

/// HMAC-SHA256 token issuer and verifier.
pub struct TokenAuthority {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    config: TokenAuthorityConfig,
}

impl TokenAuthority {
    pub fn new(config: TokenAuthorityConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&config.issuer]);
        validation.leeway = 0;

        Self {
            encoding_key: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
            config,
        }
    }

    /// Issue a fresh token for the given identity.
    pub fn issue(
        &self,
        subject: &str,
        name: &str,
        roles: Vec<String>,
        attributes: HashMap<String, String>,
    ) -> Result<String, AuthError> {
        let now = Utc::now();
        let wire = WireClaims {
            sub: subject.to_string(),
            name: name.to_string(),
            roles,
            attrs: attributes,
            iat: now.timestamp(),
            exp: (now
                + chrono::Duration::from_std(self.config.token_ttl)
                    .unwrap_or_else(|_| chrono::Duration::zero()))
            .timestamp(),
            iss: self.config.issuer.clone(),
        };

        encode(&Header::new(Algorithm::HS256), &wire, &self.encoding_key)
            .map_err(|_| AuthError::InvalidCredentialFormat)
    }

    /// Re-issue a token that is close to expiry.
    ///
    /// Tokens outside the refresh window are rejected so a stolen long-lived
    /// credential cannot be renewed indefinitely ahead of time.
    pub fn refresh(&self, token: &str) -> Result<String, AuthError> {
        let claims = self.verify(token)?;

        let refresh_from = claims.expires_at
            - chrono::Duration::from_std(self.config.refresh_window)
                .unwrap_or_else(|_| chrono::Duration::zero());
        if Utc::now() < refresh_from {
            debug!(subject = %claims.subject, "refresh rejected, token not close to expiry");
            return Err(AuthError::InvalidCredentialFormat);
        }

        self.issue(&claims.subject, &claims.name, claims.roles, claims.attributes)
    }

    pub fn token_ttl(&self) -> Duration {
        self.config.token_ttl
    }
}

impl TokenVerifier for TokenAuthority {
    fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let data =
            decode::<WireClaims>(token, &self.decoding_key, &self.validation).map_err(|err| {
                match err.kind() {
                    ErrorKind::ExpiredSignature => AuthError::Expired,
                    ErrorKind::InvalidSignature => AuthError::InvalidSignature,
                    _ => AuthError::InvalidCredentialFormat,
                }
            })?;

        let expires_at: DateTime<Utc> = Utc
            .timestamp_opt(data.claims.exp, 0)
            .single()
            .ok_or(AuthError::InvalidCredentialFormat)?;

        Ok(Claims {
            subject: data.claims.sub,
            name: data.claims.name,
            roles: data.claims.roles,
            expires_at,
            attributes: data.claims.attrs,
        })
    }
}
