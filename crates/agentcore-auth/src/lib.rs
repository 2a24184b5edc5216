#![forbid(unsafe_code)]

//! Capability-based security primitives for the coordination core.
//!
//! This crate defines the canonical `Claims` structure and the two key
//! traits – [`CapabilityToken`] and [`TokenValidator`] – used to authenticate
//! and authorize every call into the message broker, distributor and
//! rate limiter. A bundled HS256 JWT implementation (`JwtHs256Token` /
//! `JwtHs256Validator`) backs the v0.1 deployment; additional algorithms can
//! be added behind the same trait contracts without touching call sites.

use agentcore_errors::{codes, CoreError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Canonical claim set embedded in every capability token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject — the agent or user identifier this token speaks for.
    pub sub: String,
    /// Scopes granted to the subject (e.g. `agent:read`, `task:distribute`).
    pub scopes: Vec<String>,
    /// Issued-at timestamp (seconds since Unix epoch).
    pub iat: u64,
    /// Absolute expiry timestamp (seconds since Unix epoch).
    pub exp: u64,
    /// Unique token identifier (e.g. UUIDv4) for replay protection.
    pub jti: String,
}

impl Claims {
    /// Whether every scope in `required` is present in this claim set.
    pub fn has_scopes(&self, required: &[&str]) -> bool {
        required.iter().all(|r| self.scopes.iter().any(|s| s == r))
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

//─────────────────────────────
//  Trait definitions
//─────────────────────────────

/// Abstract behaviour common to all capability token formats.
#[async_trait]
pub trait CapabilityToken: Sized + Send + Sync {
    /// Mint a new token from raw `claims` using the provided secret / key.
    async fn mint(claims: &Claims, key: &[u8]) -> Result<Self>;

    /// Return the serialized wire representation (e.g. a JWT string).
    fn as_str(&self) -> &str;
}

/// Verifier used before dispatching any subsystem operation.
///
/// `validate` both authenticates the token and authorizes it against
/// `required_scopes`: success implies the subject holds every required
/// scope. Callers that additionally need to confirm the subject matches an
/// expected agent id compare `Claims::sub` themselves.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, raw: &str, required_scopes: &[&str]) -> Result<Claims>;
}

//─────────────────────────────
//  HS256 JWT implementation
//─────────────────────────────

pub mod hs256 {
    use super::{CapabilityToken, Claims, Result, TokenValidator};
    use agentcore_errors::CoreError;
    use async_trait::async_trait;
    use jsonwebtoken::{
        decode, encode, Algorithm, DecodingKey, EncodingKey, Header, TokenData, Validation,
    };
    use std::time::{SystemTime, UNIX_EPOCH};
    use uuid::Uuid;

    /// Concrete JWT (HS256) capability token implementation.
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    pub struct JwtHs256Token {
        token: String,
    }

    impl JwtHs256Token {
        /// Decode and validate the token, returning its [`Claims`] (expiry enforced).
        pub fn claims(&self, secret: &str) -> Result<Claims> {
            Self::decode_internal(&self.token, secret)
                .map(|d| d.claims)
                .map_err(|e| CoreError::authentication(e.to_string()))
        }

        /// Quick authenticity + expiry check, without scope enforcement.
        pub fn is_valid(&self, secret: &str) -> bool {
            let data = match Self::decode_internal(&self.token, secret) {
                Ok(d) => d,
                Err(_) => return false,
            };
            let now = match SystemTime::now().duration_since(UNIX_EPOCH) {
                Ok(d) => d.as_secs(),
                Err(_) => return false,
            };
            now < data.claims.exp
        }

        fn decode_internal(
            token: &str,
            secret: &str,
        ) -> std::result::Result<TokenData<Claims>, jsonwebtoken::errors::Error> {
            let mut validation = Validation::new(Algorithm::HS256);
            validation.validate_exp = true;
            validation.leeway = 0;
            decode::<Claims>(
                token,
                &DecodingKey::from_secret(secret.as_bytes()),
                &validation,
            )
        }

        /// Synchronous convenience constructor for tests and tooling.
        pub fn new(subject: &str, scopes: Vec<String>, secret: &str, ttl_secs: u64) -> Result<Self> {
            let claims = build_claims(subject, scopes, ttl_secs)?;
            let mut header = Header::new(Algorithm::HS256);
            header.typ = Some("agentcore.cap+jwt".into());
            let jwt = encode(&header, &claims, &EncodingKey::from_secret(secret.as_bytes()))
                .map_err(|e| CoreError::authentication(e.to_string()))?;
            Ok(Self { token: jwt })
        }
    }

    #[async_trait]
    impl CapabilityToken for JwtHs256Token {
        async fn mint(claims: &Claims, key: &[u8]) -> Result<Self> {
            let mut header = Header::new(Algorithm::HS256);
            header.typ = Some("agentcore.cap+jwt".into());
            let jwt = encode(&header, claims, &EncodingKey::from_secret(key))
                .map_err(|e| CoreError::authentication(e.to_string()))?;
            Ok(Self { token: jwt })
        }

        fn as_str(&self) -> &str {
            &self.token
        }
    }

    /// Builds a standard claim set with proper timestamps and a fresh `jti`.
    pub fn build_claims(subject: &str, scopes: Vec<String>, ttl_secs: u64) -> Result<Claims> {
        let issued_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| CoreError::system(e.to_string()))?
            .as_secs();
        Ok(Claims {
            sub: subject.to_owned(),
            scopes,
            iat: issued_at,
            exp: issued_at + ttl_secs,
            jti: Uuid::new_v4().to_string(),
        })
    }

    /// HS256 JWT validator enforcing both signature/expiry and scopes.
    #[derive(Clone, Debug)]
    pub struct JwtHs256Validator {
        secret: String,
        validation: Validation,
    }

    impl JwtHs256Validator {
        pub fn new(secret: impl Into<String>) -> Self {
            let mut validation = Validation::new(Algorithm::HS256);
            validation.validate_exp = true;
            Self {
                secret: secret.into(),
                validation,
            }
        }
    }

    #[async_trait]
    impl TokenValidator for JwtHs256Validator {
        async fn validate(&self, raw: &str, required_scopes: &[&str]) -> Result<Claims> {
            let data = decode::<Claims>(
                raw,
                &DecodingKey::from_secret(self.secret.as_bytes()),
                &self.validation,
            )
            .map_err(|e| {
                CoreError::authentication(format!("token rejected: {e}"))
                    .with_code(agentcore_errors::codes::AUTH_INVALID_TOKEN)
            })?;
            if !data.claims.has_scopes(required_scopes) {
                return Err(CoreError::authorization(format!(
                    "subject '{}' is missing one of the required scopes {:?}",
                    data.claims.sub, required_scopes
                )));
            }
            Ok(data.claims)
        }
    }

    /// Glob-import helper.
    pub mod prelude {
        pub use super::{JwtHs256Token, JwtHs256Validator};
        pub use crate::{CapabilityToken, Claims, TokenValidator};
    }
}

/// Top-level convenience export re-exporting the HS256 implementation.
pub use hs256::prelude::*;

/// Single-line glob import for downstream crates.
pub mod prelude {
    pub use super::hs256::prelude::*;
    pub use super::{CapabilityToken, Claims, TokenValidator};
}

/// Known scopes recognized across the coordination core.
pub mod scopes {
    pub const AGENT_READ: &str = "agent:read";
    pub const AGENT_WRITE: &str = "agent:write";
    pub const AGENT_EXECUTE: &str = "agent:execute";
    pub const TASK_READ: &str = "task:read";
    pub const TASK_WRITE: &str = "task:write";
    pub const TASK_DISTRIBUTE: &str = "task:distribute";
    pub const ADMIN: &str = "admin";
}
