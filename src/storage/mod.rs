//! Storage backends for the integration broker
//!
//! The storage layer is split into focused traits:
//! - `CredentialStorage`: encrypted credentials keyed by (organization, provider)
//! - `AuthorizationStateStorage`: single-use OAuth state nonces
//! - `IntegrationStorage`: connected-provider records and installation lookup
//! - `WebhookDeliveryStorage`: write-once delivery ledger
//! - `VulnerabilityStorage`: normalized findings and their integration links
//! - `Storage`: composition trait implementing all of the above

pub mod sql_common;
pub mod sqlite;

use crate::model::*;
use crate::{BrokerError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::auth::CredentialEncryption;

#[async_trait]
pub trait CredentialStorage: Send + Sync {
    /// Save a credential, replacing any existing one for the same key
    ///
    /// The whole row is swapped in one statement; readers never observe a
    /// token from one write paired with an expiry from another.
    async fn save_credential(&self, credential: &Credential) -> Result<()>;

    async fn get_credential(&self, org_id: &str, provider: &str) -> Result<Option<Credential>>;

    /// Delete a credential; returns false when none existed
    async fn delete_credential(&self, org_id: &str, provider: &str) -> Result<bool>;

    async fn credential_exists(&self, org_id: &str, provider: &str) -> Result<bool>;
}

#[async_trait]
pub trait AuthorizationStateStorage: Send + Sync {
    async fn save_authorization_state(&self, state: &AuthorizationState) -> Result<()>;

    async fn get_authorization_state(&self, nonce: &str) -> Result<Option<AuthorizationState>>;

    /// Atomically delete a state
    ///
    /// Returns true only for the single caller whose delete removed the row.
    async fn consume_authorization_state(&self, nonce: &str) -> Result<bool>;

    /// Remove every state that expired at or before `now`
    async fn delete_expired_authorization_states(&self, now: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait IntegrationStorage: Send + Sync {
    /// Return the integration for (org, provider), creating it if absent
    ///
    /// A provided installation id is recorded on the existing row.
    async fn ensure_integration(
        &self,
        org_id: &str,
        provider: &str,
        external_installation_id: Option<&str>,
    ) -> Result<Integration>;

    async fn get_integration(&self, org_id: &str, provider: &str) -> Result<Option<Integration>>;

    /// Find the integration a provider installation belongs to
    async fn find_integration_by_installation(
        &self,
        provider: &str,
        external_installation_id: &str,
    ) -> Result<Option<Integration>>;
}

#[async_trait]
pub trait WebhookDeliveryStorage: Send + Sync {
    /// Insert a delivery record if absent
    ///
    /// Returns true when this call inserted it, false for a re-delivery.
    async fn record_webhook_delivery(&self, record: &WebhookDeliveryRecord) -> Result<bool>;

    async fn webhook_delivery_exists(&self, provider: &str, event_id: &str) -> Result<bool>;

    /// Forget a delivery so a provider re-delivery is processed again
    async fn release_webhook_delivery(&self, provider: &str, event_id: &str) -> Result<bool>;
}

#[async_trait]
pub trait VulnerabilityStorage: Send + Sync {
    /// Create or update the finding for (org, external_id)
    ///
    /// Fields set to `None` keep their stored value. When `integration_id` is
    /// given, a link is added; existing links are never removed.
    async fn upsert_vulnerability(
        &self,
        org_id: &str,
        external_id: &str,
        fields: &VulnerabilityFields,
        integration_id: Option<&str>,
    ) -> Result<UpsertOutcome>;

    async fn get_vulnerability(
        &self,
        org_id: &str,
        external_id: &str,
    ) -> Result<Option<Vulnerability>>;

    async fn list_vulnerabilities(&self, org_id: &str) -> Result<Vec<Vulnerability>>;

    /// Integration ids linked to a finding
    async fn list_vulnerability_integrations(&self, vulnerability_id: &str)
    -> Result<Vec<String>>;
}

/// Complete storage trait combining all focused storage traits
pub trait Storage:
    CredentialStorage
    + AuthorizationStateStorage
    + IntegrationStorage
    + WebhookDeliveryStorage
    + VulnerabilityStorage
{
}

impl<T> Storage for T where
    T: CredentialStorage
        + AuthorizationStateStorage
        + IntegrationStorage
        + WebhookDeliveryStorage
        + VulnerabilityStorage
{
}

pub use sqlite::SqliteStorage;

/// Create a storage backend from configuration
pub async fn create_storage_from_config(
    config: &crate::config::StorageConfig,
    encryption: CredentialEncryption,
) -> Result<Arc<dyn Storage>> {
    match config.driver.as_str() {
        "sqlite" => Ok(Arc::new(SqliteStorage::new(&config.dsn, encryption).await?)),
        _ => Err(BrokerError::config(format!(
            "Unknown storage driver: {}. Supported: sqlite",
            config.driver
        ))),
    }
}
