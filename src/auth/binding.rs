//! Tamper-resistant side channel for the OAuth redirect
//!
//! The `state` query parameter alone is not trusted on the callback. At
//! `begin_oauth` the coordinator issues a binding that ties the nonce to the
//! initiating organization, user and provider; the callback must present it
//! back. [`SignedBinding`] implements this as a short-lived HS256 JWT carried
//! in an HttpOnly cookie.

use crate::{BrokerError, Result};
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

pub const BINDING_SECRET_ENV: &str = "BROKER_BINDING_SECRET";

/// Identity bound to one authorization attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingClaims {
    pub nonce: String,
    pub org_id: String,
    pub user_id: String,
    pub provider: String,
    pub expires_at: DateTime<Utc>,
}

/// Issues and verifies bindings between an OAuth nonce and its initiator
pub trait StateBinding: Send + Sync {
    fn issue_binding(&self, claims: &BindingClaims) -> Result<String>;

    fn verify_binding(&self, token: &str) -> Result<BindingClaims>;
}

/// Signing secret of at least 256 bits
#[derive(Clone)]
pub struct ValidatedSecret(String);

impl ValidatedSecret {
    pub fn from_env() -> Result<Self> {
        let secret = std::env::var(BINDING_SECRET_ENV).map_err(|_| {
            BrokerError::config(format!(
                "{} environment variable is REQUIRED.\n\
                 \n\
                 Generate a secure secret:\n\
                 $ openssl rand -hex 32",
                BINDING_SECRET_ENV
            ))
        })?;
        Self::from_string(secret)
    }

    pub fn from_string(secret: String) -> Result<Self> {
        if secret.len() < 32 {
            return Err(BrokerError::config(format!(
                "{} must be at least 32 characters (256 bits). Current length: {} characters.",
                BINDING_SECRET_ENV,
                secret.len()
            )));
        }
        if secret.len() > 512 {
            return Err(BrokerError::config(format!(
                "{} exceeds maximum length of 512 characters.",
                BINDING_SECRET_ENV
            )));
        }
        Ok(Self(secret))
    }

    fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl std::fmt::Debug for ValidatedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ValidatedSecret").field(&"[REDACTED]").finish()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct BindingJwt {
    sub: String,
    org: String,
    usr: String,
    prv: String,
    exp: usize,
    iat: usize,
    iss: String,
}

/// HS256-signed binding token
pub struct SignedBinding {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
}

impl SignedBinding {
    pub fn new(secret: &ValidatedSecret, issuer: impl Into<String>) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            issuer: issuer.into(),
        }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }
}

impl StateBinding for SignedBinding {
    fn issue_binding(&self, claims: &BindingClaims) -> Result<String> {
        let token = BindingJwt {
            sub: claims.nonce.clone(),
            org: claims.org_id.clone(),
            usr: claims.user_id.clone(),
            prv: claims.provider.clone(),
            exp: claims.expires_at.timestamp().max(0) as usize,
            iat: Utc::now().timestamp().max(0) as usize,
            iss: self.issuer.clone(),
        };

        encode(&Header::new(Algorithm::HS256), &token, &self.encoding_key)
            .map_err(|e| BrokerError::internal(format!("Failed to sign binding: {}", e)))
    }

    fn verify_binding(&self, token: &str) -> Result<BindingClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);
        validation.leeway = 0;

        let data = decode::<BindingJwt>(token, &self.decoding_key, &validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    BrokerError::binding("binding expired")
                }
                jsonwebtoken::errors::ErrorKind::InvalidSignature => {
                    BrokerError::binding("invalid signature")
                }
                jsonwebtoken::errors::ErrorKind::InvalidIssuer => {
                    BrokerError::binding("invalid issuer")
                }
                _ => BrokerError::binding("malformed binding"),
            }
        })?;

        let claims = data.claims;
        Ok(BindingClaims {
            nonce: claims.sub,
            org_id: claims.org,
            user_id: claims.usr,
            provider: claims.prv,
            expires_at: DateTime::from_timestamp(claims.exp as i64, 0).unwrap_or_else(Utc::now),
        })
    }
}
