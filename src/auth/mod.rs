//! Authentication primitives for provider integrations
//!
//! - **client**: OAuth 2.0 token endpoint client (code exchange, refresh)
//! - **binding**: signed side channel tying an OAuth nonce to its initiator
//! - **encryption**: AES-256-GCM sealing of stored credentials
//! - **middleware**: tenant context extraction for HTTP handlers
//!
//! Tenant and user authentication happens upstream; this crate receives an
//! already-authenticated [`RequestContext`].

use serde::{Deserialize, Serialize};

pub mod binding;
pub mod client;
pub mod encryption;
pub mod middleware;

pub use binding::{BindingClaims, SignedBinding, StateBinding, ValidatedSecret};
pub use client::{
    OAuth2TokenEndpoint, PkcePair, TokenEndpoint, TokenSet, build_authorization_url,
    build_installation_url,
};
pub use encryption::{CredentialEncryption, EncryptedSecret};

/// Authenticated tenant context for a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub organization_id: String,
    pub user_id: String,
    pub request_id: String,
}
