//! Error types for the integration broker
//!
//! Every public operation returns [`Result`]. Variants are grouped by the way a
//! caller should react: configuration and state errors are terminal 4xx,
//! upstream exchange errors are 502, and storage failures are opaque 500s.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(Debug, Error)]
pub enum BrokerError {
    // Configuration
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Provider not registered: {0}")]
    ProviderNotRegistered(String),

    #[error("Provider is inactive: {0}")]
    ProviderInactive(String),

    #[error("Provider {provider} does not support {auth_type} authorization")]
    UnsupportedAuthType { provider: String, auth_type: String },

    #[error("Operation {operation} is not registered for provider {provider}")]
    OperationNotRegistered { provider: String, operation: String },

    // Authorization state
    #[error("Authorization state not found")]
    StateNotFound,

    #[error("Authorization state expired")]
    StateExpired,

    #[error("Organization does not match authorization state")]
    InvalidOrganizationContext,

    #[error("Provider does not match authorization state")]
    InvalidProviderContext,

    #[error("User does not match authorization state")]
    InvalidUserContext,

    #[error("Invalid authorization binding: {0}")]
    InvalidBinding(String),

    #[error("Authorization code is required")]
    AuthorizationCodeRequired,

    #[error("Authorization was denied by the provider")]
    AuthorizationDenied,

    #[error("Health check for {provider} failed: {reason}")]
    HealthCheckFailed { provider: String, reason: String },

    // Upstream
    #[error("Authorization code exchange failed for {provider}: {reason}")]
    CodeExchangeFailed { provider: String, reason: String },

    #[error("Credential refresh failed for {provider}: {reason}")]
    RefreshFailed { provider: String, reason: String },

    #[error("{provider} API request failed: {reason}")]
    ProviderApi { provider: String, reason: String },

    // Not found
    #[error("No credential configured for provider {0}")]
    CredentialNotFound(String),

    #[error("Integration not found: {0}")]
    IntegrationNotFound(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    // Integrity
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Payload is empty")]
    EmptyPayload,

    #[error("Payload exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    // Internal
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn binding(msg: impl Into<String>) -> Self {
        Self::InvalidBinding(msg.into())
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField(field.into())
    }

    /// Stable machine-readable error kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Validation(_) => "validation",
            Self::ProviderNotRegistered(_) => "provider_not_registered",
            Self::ProviderInactive(_) => "provider_inactive",
            Self::UnsupportedAuthType { .. } => "unsupported_auth_type",
            Self::OperationNotRegistered { .. } => "operation_not_registered",
            Self::StateNotFound => "state_not_found",
            Self::StateExpired => "state_expired",
            Self::InvalidOrganizationContext => "invalid_organization_context",
            Self::InvalidProviderContext => "invalid_provider_context",
            Self::InvalidUserContext => "invalid_user_context",
            Self::InvalidBinding(_) => "invalid_binding",
            Self::AuthorizationCodeRequired => "authorization_code_required",
            Self::AuthorizationDenied => "authorization_denied",
            Self::HealthCheckFailed { .. } => "health_check_failed",
            Self::CodeExchangeFailed { .. } => "code_exchange_failed",
            Self::RefreshFailed { .. } => "refresh_failed",
            Self::ProviderApi { .. } => "provider_api",
            Self::CredentialNotFound(_) => "credential_not_found",
            Self::IntegrationNotFound(_) => "integration_not_found",
            Self::NotFound { .. } => "not_found",
            Self::MissingField(_) => "missing_field",
            Self::InvalidSignature => "invalid_signature",
            Self::EmptyPayload => "empty_payload",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::Storage(_)
            | Self::Database(_)
            | Self::Migration(_)
            | Self::Json(_)
            | Self::Io(_)
            | Self::Http(_)
            | Self::Internal(_) => "internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_)
            | Self::ProviderInactive(_)
            | Self::UnsupportedAuthType { .. }
            | Self::StateNotFound
            | Self::StateExpired
            | Self::InvalidOrganizationContext
            | Self::InvalidProviderContext
            | Self::InvalidUserContext
            | Self::InvalidBinding(_)
            | Self::AuthorizationCodeRequired
            | Self::AuthorizationDenied
            | Self::HealthCheckFailed { .. }
            | Self::MissingField(_)
            | Self::InvalidSignature
            | Self::EmptyPayload => StatusCode::BAD_REQUEST,
            Self::ProviderNotRegistered(_)
            | Self::OperationNotRegistered { .. }
            | Self::CredentialNotFound(_)
            | Self::IntegrationNotFound(_)
            | Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::CodeExchangeFailed { .. }
            | Self::RefreshFailed { .. }
            | Self::ProviderApi { .. } => StatusCode::BAD_GATEWAY,
            Self::Config(_)
            | Self::Storage(_)
            | Self::Database(_)
            | Self::Migration(_)
            | Self::Json(_)
            | Self::Io(_)
            | Self::Http(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to return to API clients
    ///
    /// Internal failures collapse to a generic message; the detail is logged.
    pub fn public_message(&self) -> String {
        if self.status_code() == StatusCode::INTERNAL_SERVER_ERROR {
            "Internal server error".to_string()
        } else {
            self.to_string()
        }
    }
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(kind = self.kind(), error = %self, "Request failed");
        } else {
            tracing::debug!(kind = self.kind(), error = %self, "Request rejected");
        }

        let body = json!({
            "success": false,
            "error": {
                "kind": self.kind(),
                "message": self.public_message(),
            }
        });
        (status, Json(body)).into_response()
    }
}
