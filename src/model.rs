//! Core data types shared by the registry, storage, broker and ingestion layers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

// ============================================================================
// Provider specifications
// ============================================================================

/// How an organization authorizes calls to a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    #[serde(rename = "oauth2")]
    OAuth2,
    Oidc,
    WorkloadIdentity,
    Static,
}

impl AuthType {
    /// Whether this auth type goes through the authorization-code flow
    pub fn is_oauth(&self) -> bool {
        matches!(self, AuthType::OAuth2 | AuthType::Oidc)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AuthType::OAuth2 => "oauth2",
            AuthType::Oidc => "oidc",
            AuthType::WorkloadIdentity => "workload_identity",
            AuthType::Static => "static",
        }
    }
}

impl fmt::Display for AuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// OAuth endpoints and client registration for a provider
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct OAuthSpec {
    pub auth_url: String,
    pub token_url: String,
    pub redirect_uri: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub pkce: bool,
    pub client_id: String,
    #[serde(default, skip_serializing)]
    pub client_secret: Option<String>,
    /// Extra query parameters appended to the authorization URL
    #[serde(default)]
    pub auth_params: HashMap<String, String>,
    /// App installation page for providers that install rather than authorize
    /// (GitHub Apps); the callback then also carries an installation id
    #[serde(default)]
    pub install_url: Option<String>,
}

impl fmt::Debug for OAuthSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthSpec")
            .field("auth_url", &self.auth_url)
            .field("token_url", &self.token_url)
            .field("redirect_uri", &self.redirect_uri)
            .field("scopes", &self.scopes)
            .field("pkce", &self.pkce)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "[REDACTED]"))
            .field("install_url", &self.install_url)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required_scopes: Vec<String>,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    #[serde(default = "default_true")]
    pub requires_credential: bool,
}

impl OperationDescriptor {
    pub fn new(name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            required_scopes: Vec::new(),
            timeout,
            requires_credential: true,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_scopes(mut self, scopes: &[&str]) -> Self {
        self.required_scopes = scopes.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn without_credential(mut self) -> Self {
        self.requires_credential = false;
        self
    }
}

fn default_true() -> bool {
    true
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSpec {
    pub name: String,
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    pub auth_type: AuthType,
    /// JSON-Schema-like document (`required`, `properties`) for static credentials
    #[serde(default)]
    pub credential_schema: Value,
    #[serde(default)]
    pub oauth: Option<OAuthSpec>,
    #[serde(default)]
    pub operations: Vec<OperationDescriptor>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default, skip_serializing)]
    pub webhook_secret: Option<String>,
    #[serde(default)]
    pub api_base_url: Option<String>,
}

/// Non-secret view of a provider for discovery consumers
#[derive(Debug, Clone, Serialize)]
pub struct ProviderSummary {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub auth_type: AuthType,
    pub active: bool,
    pub scopes: Vec<String>,
    pub pkce: bool,
    pub credential_schema: Value,
    pub operations: Vec<OperationSummary>,
    pub accepts_webhooks: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationSummary {
    pub name: String,
    pub description: String,
    pub required_scopes: Vec<String>,
    pub timeout_seconds: u64,
}

impl From<&ProviderSpec> for ProviderSummary {
    fn from(spec: &ProviderSpec) -> Self {
        Self {
            name: spec.name.clone(),
            display_name: spec.display_name.clone(),
            description: spec.description.clone(),
            auth_type: spec.auth_type,
            active: spec.active,
            scopes: spec
                .oauth
                .as_ref()
                .map(|o| o.scopes.clone())
                .unwrap_or_default(),
            pkce: spec.oauth.as_ref().is_some_and(|o| o.pkce),
            credential_schema: spec.credential_schema.clone(),
            operations: spec
                .operations
                .iter()
                .map(|op| OperationSummary {
                    name: op.name.clone(),
                    description: op.description.clone(),
                    required_scopes: op.required_scopes.clone(),
                    timeout_seconds: op.timeout.as_secs(),
                })
                .collect(),
            accepts_webhooks: spec.webhook_secret.is_some(),
        }
    }
}

// ============================================================================
// Authorization state
// ============================================================================

/// Single-use record binding an OAuth `state` nonce to the initiating tenant
#[derive(Clone, Serialize, Deserialize)]
pub struct AuthorizationState {
    pub nonce: String,
    pub org_id: String,
    pub user_id: String,
    pub provider: String,
    pub scopes: Vec<String>,
    #[serde(skip_serializing)]
    pub code_verifier: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AuthorizationState {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

impl fmt::Debug for AuthorizationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizationState")
            .field("org_id", &self.org_id)
            .field("user_id", &self.user_id)
            .field("provider", &self.provider)
            .field("scopes", &self.scopes)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Credentials
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    OAuthToken,
    StaticConfig,
}

impl CredentialKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialKind::OAuthToken => "oauth_token",
            CredentialKind::StaticConfig => "static_config",
        }
    }
}

/// OAuth token pair as returned by a provider's token endpoint
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthToken {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// When the provider issued the token; unknown for imported tokens
    #[serde(default)]
    pub issued_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl OAuthToken {
    /// True when the token is still usable at `now` with `skew` to spare
    ///
    /// For short-lived tokens the skew is capped at half the token's lifetime,
    /// otherwise a token living less than `skew` would never count as fresh.
    pub fn is_fresh_at(&self, now: DateTime<Utc>, skew: chrono::Duration) -> bool {
        let Some(expires_at) = self.expires_at else {
            return true;
        };
        let skew = match self.issued_at {
            Some(issued_at) => {
                let lifetime = (expires_at - issued_at).max(chrono::Duration::zero());
                skew.min(lifetime / 2)
            }
            None => skew,
        };
        now < expires_at - skew
    }
}

impl fmt::Debug for OAuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthToken")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .field("issued_at", &self.issued_at)
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// Decrypted credential material handed to operation handlers
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum CredentialPayload {
    OAuthToken(OAuthToken),
    StaticConfig(Map<String, Value>),
}

impl CredentialPayload {
    pub fn kind(&self) -> CredentialKind {
        match self {
            CredentialPayload::OAuthToken(_) => CredentialKind::OAuthToken,
            CredentialPayload::StaticConfig(_) => CredentialKind::StaticConfig,
        }
    }

    pub fn access_token(&self) -> Option<&str> {
        match self {
            CredentialPayload::OAuthToken(token) => Some(&token.access_token),
            CredentialPayload::StaticConfig(_) => None,
        }
    }

    /// String attribute of a static configuration
    pub fn attribute(&self, key: &str) -> Option<&str> {
        match self {
            CredentialPayload::StaticConfig(map) => map.get(key).and_then(Value::as_str),
            CredentialPayload::OAuthToken(_) => None,
        }
    }
}

impl fmt::Debug for CredentialPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialPayload::OAuthToken(token) => f.debug_tuple("OAuthToken").field(token).finish(),
            CredentialPayload::StaticConfig(map) => f
                .debug_struct("StaticConfig")
                .field("keys", &map.keys().collect::<Vec<_>>())
                .finish(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Credential {
    pub org_id: String,
    pub provider: String,
    pub payload: CredentialPayload,
    pub updated_at: DateTime<Utc>,
}

impl Credential {
    pub fn kind(&self) -> CredentialKind {
        self.payload.kind()
    }
}

// ============================================================================
// Integrations
// ============================================================================

/// A provider connected to an organization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Integration {
    pub id: String,
    pub org_id: String,
    pub provider: String,
    pub external_installation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Operations
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    pub status: OperationStatus,
    pub summary: String,
    #[serde(default)]
    pub details: Map<String, Value>,
}

impl OperationResult {
    pub fn ok(summary: impl Into<String>) -> Self {
        Self {
            status: OperationStatus::Ok,
            summary: summary.into(),
            details: Map::new(),
        }
    }

    pub fn error(summary: impl Into<String>) -> Self {
        Self {
            status: OperationStatus::Error,
            summary: summary.into(),
            details: Map::new(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: Value) -> Self {
        self.details.insert(key.to_string(), value);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == OperationStatus::Ok
    }
}

// ============================================================================
// Alerts and vulnerabilities
// ============================================================================

/// Kinds of security alerts the normalizer understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    Dependabot,
    CodeScanning,
    SecretScanning,
}

impl AlertType {
    pub const ALL: [AlertType; 3] = [
        AlertType::Dependabot,
        AlertType::CodeScanning,
        AlertType::SecretScanning,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::Dependabot => "dependabot",
            AlertType::CodeScanning => "code_scanning",
            AlertType::SecretScanning => "secret_scanning",
        }
    }

    /// Parse an alert type name, tolerating case, dashes and an `_alert` suffix
    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().to_lowercase().replace('-', "_");
        let normalized = normalized.strip_suffix("_alert").unwrap_or(&normalized);
        match normalized {
            "dependabot" => Some(AlertType::Dependabot),
            "code_scanning" => Some(AlertType::CodeScanning),
            "secret_scanning" => Some(AlertType::SecretScanning),
            _ => None,
        }
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One raw provider finding in transit to the normalizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEnvelope {
    pub alert_type: AlertType,
    pub resource: String,
    #[serde(default)]
    pub action: String,
    pub payload: Value,
}

/// Normalized security finding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vulnerability {
    pub id: String,
    pub org_id: String,
    pub external_id: String,
    pub external_owner_id: Option<String>,
    pub display_name: Option<String>,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub severity: Option<String>,
    pub status: Option<String>,
    pub category: Option<String>,
    pub external_uri: Option<String>,
    pub open: Option<bool>,
    pub published_at: Option<DateTime<Utc>>,
    pub discovered_at: Option<DateTime<Utc>>,
    pub source_updated_at: Option<DateTime<Utc>>,
    pub metadata: Option<Value>,
    pub raw_payload: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Field values extracted from one alert; `None` leaves the stored value alone
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VulnerabilityFields {
    pub external_owner_id: Option<String>,
    pub display_name: Option<String>,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub severity: Option<String>,
    pub status: Option<String>,
    pub category: Option<String>,
    pub external_uri: Option<String>,
    pub open: Option<bool>,
    pub published_at: Option<DateTime<Utc>>,
    pub discovered_at: Option<DateTime<Utc>>,
    pub source_updated_at: Option<DateTime<Utc>>,
    pub metadata: Option<Value>,
    pub raw_payload: Option<Value>,
}

/// Whether an upsert inserted a new row or updated an existing one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestSummary {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub total: usize,
}

// ============================================================================
// Webhooks
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookDeliveryRecord {
    pub event_id: String,
    pub provider: String,
    pub received_at: DateTime<Utc>,
}
