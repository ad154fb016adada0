//! SQLite storage implementation
//!
//! Persists credentials (sealed with AES-256-GCM), authorization states,
//! integrations, the webhook delivery ledger and normalized vulnerabilities.

use crate::auth::{CredentialEncryption, EncryptedSecret};
use crate::model::*;
use crate::storage::{
    AuthorizationStateStorage, CredentialStorage, IntegrationStorage, VulnerabilityStorage,
    WebhookDeliveryStorage, sql_common::*,
};
use crate::{BrokerError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    Row, SqlitePool,
    sqlite::{
        SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
    },
};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

const VULNERABILITY_COLUMNS: &str = "id, org_id, external_id, external_owner_id, display_name, \
     summary, description, severity, status, category, external_uri, open, published_at, \
     discovered_at, source_updated_at, metadata, raw_payload, created_at, updated_at";

const INTEGRATION_COLUMNS: &str =
    "id, org_id, provider, external_installation_id, created_at, updated_at";

/// SQLite storage backend
pub struct SqliteStorage {
    pool: SqlitePool,
    encryption: CredentialEncryption,
}

impl SqliteStorage {
    /// Create a new SQLite storage
    ///
    /// # Arguments
    /// * `dsn` - Database path (e.g., ".broker/broker.db" or ":memory:" for in-memory)
    /// * `encryption` - Sealer applied to every stored credential payload
    pub async fn new(dsn: &str, encryption: CredentialEncryption) -> Result<Self> {
        let file_path = dsn.strip_prefix("sqlite:").unwrap_or(dsn);
        let file_path = file_path.split('?').next().unwrap_or(file_path);

        if file_path.contains("..") {
            return Err(BrokerError::config(
                "Database path cannot contain '..' (path traversal not allowed)",
            ));
        }

        let in_memory = file_path == ":memory:";
        if !in_memory
            && let Some(parent) = Path::new(file_path).parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = if in_memory {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else {
            SqliteConnectOptions::new()
                .filename(file_path)
                .create_if_missing(true)
        }
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);

        // An in-memory database lives exactly as long as its one connection
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(8)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| BrokerError::storage(format!("Failed to connect to SQLite: {}", e)))?;

        sqlx::migrate!("./migrations/sqlite")
            .run(&pool)
            .await
            .map_err(|e| BrokerError::storage(format!("Failed to run migrations: {}", e)))?;

        Ok(Self { pool, encryption })
    }

    /// Same database, different sealing key
    #[cfg(test)]
    pub(crate) fn with_encryption(&self, encryption: CredentialEncryption) -> Self {
        Self {
            pool: self.pool.clone(),
            encryption,
        }
    }

    fn parse_credential(&self, row: &SqliteRow) -> Result<Credential> {
        let kind: String = row.try_get("kind")?;
        let kind = parse_credential_kind(&kind)
            .ok_or_else(|| BrokerError::storage(format!("Unknown credential kind: {}", kind)))?;

        let sealed = EncryptedSecret::from_database(row.try_get("payload")?)?;
        let payload = self.encryption.open_payload(&sealed)?;
        if payload.kind() != kind {
            return Err(BrokerError::storage(
                "Stored credential kind does not match its payload",
            ));
        }

        Ok(Credential {
            org_id: row.try_get("org_id")?,
            provider: row.try_get("provider")?,
            payload,
            updated_at: from_millis(row.try_get("updated_at")?),
        })
    }

    fn parse_state(row: &SqliteRow) -> Result<AuthorizationState> {
        Ok(AuthorizationState {
            nonce: row.try_get("nonce")?,
            org_id: row.try_get("org_id")?,
            user_id: row.try_get("user_id")?,
            provider: row.try_get("provider")?,
            scopes: serde_json::from_str(&row.try_get::<String, _>("scopes")?)?,
            code_verifier: row.try_get("code_verifier")?,
            created_at: from_millis(row.try_get("created_at")?),
            expires_at: from_millis(row.try_get("expires_at")?),
        })
    }

    fn parse_integration(row: &SqliteRow) -> Result<Integration> {
        Ok(Integration {
            id: row.try_get("id")?,
            org_id: row.try_get("org_id")?,
            provider: row.try_get("provider")?,
            external_installation_id: row.try_get("external_installation_id")?,
            created_at: from_millis(row.try_get("created_at")?),
            updated_at: from_millis(row.try_get("updated_at")?),
        })
    }

    fn parse_vulnerability(row: &SqliteRow) -> Result<Vulnerability> {
        let parse_json = |column: &str| -> Result<Option<serde_json::Value>> {
            row.try_get::<Option<String>, _>(column)?
                .map(|s| serde_json::from_str(&s))
                .transpose()
                .map_err(BrokerError::from)
        };

        Ok(Vulnerability {
            id: row.try_get("id")?,
            org_id: row.try_get("org_id")?,
            external_id: row.try_get("external_id")?,
            external_owner_id: row.try_get("external_owner_id")?,
            display_name: row.try_get("display_name")?,
            summary: row.try_get("summary")?,
            description: row.try_get("description")?,
            severity: row.try_get("severity")?,
            status: row.try_get("status")?,
            category: row.try_get("category")?,
            external_uri: row.try_get("external_uri")?,
            open: row.try_get::<Option<i64>, _>("open")?.map(|v| v != 0),
            published_at: opt_from_millis(row.try_get("published_at")?),
            discovered_at: opt_from_millis(row.try_get("discovered_at")?),
            source_updated_at: opt_from_millis(row.try_get("source_updated_at")?),
            metadata: parse_json("metadata")?,
            raw_payload: parse_json("raw_payload")?,
            created_at: from_millis(row.try_get("created_at")?),
            updated_at: from_millis(row.try_get("updated_at")?),
        })
    }

    async fn try_upsert_vulnerability(
        &self,
        org_id: &str,
        external_id: &str,
        fields: &VulnerabilityFields,
        integration_id: Option<&str>,
    ) -> Result<UpsertOutcome> {
        // IMMEDIATE takes the write lock up front; a deferred read would have to
        // upgrade mid-transaction, which SQLite refuses under contention.
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;

        let existing: Option<String> = sqlx::query_scalar(
            "SELECT id FROM vulnerabilities WHERE org_id = ? AND external_id = ?",
        )
        .bind(org_id)
        .bind(external_id)
        .fetch_optional(&mut *tx)
        .await?;

        let now = millis(Utc::now());
        let metadata = fields
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let raw_payload = fields
            .raw_payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        // NULL binds keep the stored column on conflict
        let id: String = sqlx::query_scalar(
            "INSERT INTO vulnerabilities
             (id, org_id, external_id, external_owner_id, display_name, summary, description,
              severity, status, category, external_uri, open, published_at, discovered_at,
              source_updated_at, metadata, raw_payload, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(org_id, external_id) DO UPDATE SET
                external_owner_id = COALESCE(excluded.external_owner_id, vulnerabilities.external_owner_id),
                display_name = COALESCE(excluded.display_name, vulnerabilities.display_name),
                summary = COALESCE(excluded.summary, vulnerabilities.summary),
                description = COALESCE(excluded.description, vulnerabilities.description),
                severity = COALESCE(excluded.severity, vulnerabilities.severity),
                status = COALESCE(excluded.status, vulnerabilities.status),
                category = COALESCE(excluded.category, vulnerabilities.category),
                external_uri = COALESCE(excluded.external_uri, vulnerabilities.external_uri),
                open = COALESCE(excluded.open, vulnerabilities.open),
                published_at = COALESCE(excluded.published_at, vulnerabilities.published_at),
                discovered_at = COALESCE(excluded.discovered_at, vulnerabilities.discovered_at),
                source_updated_at = COALESCE(excluded.source_updated_at, vulnerabilities.source_updated_at),
                metadata = COALESCE(excluded.metadata, vulnerabilities.metadata),
                raw_payload = COALESCE(excluded.raw_payload, vulnerabilities.raw_payload),
                updated_at = excluded.updated_at
             RETURNING id",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(org_id)
        .bind(external_id)
        .bind(non_blank(&fields.external_owner_id))
        .bind(non_blank(&fields.display_name))
        .bind(non_blank(&fields.summary))
        .bind(non_blank(&fields.description))
        .bind(non_blank(&fields.severity))
        .bind(non_blank(&fields.status))
        .bind(non_blank(&fields.category))
        .bind(non_blank(&fields.external_uri))
        .bind(fields.open.map(i64::from))
        .bind(fields.published_at.map(millis))
        .bind(fields.discovered_at.map(millis))
        .bind(fields.source_updated_at.map(millis))
        .bind(metadata)
        .bind(raw_payload)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        if let Some(integration_id) = integration_id {
            sqlx::query(
                "INSERT OR IGNORE INTO vulnerability_integrations
                 (vulnerability_id, integration_id, linked_at)
                 VALUES (?, ?, ?)",
            )
            .bind(&id)
            .bind(integration_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(if existing.is_some() {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Created
        })
    }
}

// ============================================================================
// Credentials
// ============================================================================

#[async_trait]
impl CredentialStorage for SqliteStorage {
    async fn save_credential(&self, credential: &Credential) -> Result<()> {
        let sealed = self.encryption.seal_payload(&credential.payload)?;
        let updated_at = millis(credential.updated_at);

        sqlx::query(
            "INSERT INTO credentials (org_id, provider, kind, payload, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(org_id, provider) DO UPDATE SET
                kind = excluded.kind,
                payload = excluded.payload,
                updated_at = excluded.updated_at",
        )
        .bind(&credential.org_id)
        .bind(&credential.provider)
        .bind(credential.kind().as_str())
        .bind(sealed.as_str())
        .bind(updated_at)
        .bind(updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_credential(&self, org_id: &str, provider: &str) -> Result<Option<Credential>> {
        let row = sqlx::query(
            "SELECT org_id, provider, kind, payload, updated_at
             FROM credentials
             WHERE org_id = ? AND provider = ?",
        )
        .bind(org_id)
        .bind(provider)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| self.parse_credential(&r)).transpose()
    }

    async fn delete_credential(&self, org_id: &str, provider: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM credentials WHERE org_id = ? AND provider = ?")
            .bind(org_id)
            .bind(provider)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn credential_exists(&self, org_id: &str, provider: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM credentials WHERE org_id = ? AND provider = ?",
        )
        .bind(org_id)
        .bind(provider)
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }
}

// ============================================================================
// Authorization states
// ============================================================================

#[async_trait]
impl AuthorizationStateStorage for SqliteStorage {
    async fn save_authorization_state(&self, state: &AuthorizationState) -> Result<()> {
        sqlx::query(
            "INSERT INTO authorization_states
             (nonce, org_id, user_id, provider, scopes, code_verifier, created_at, expires_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&state.nonce)
        .bind(&state.org_id)
        .bind(&state.user_id)
        .bind(&state.provider)
        .bind(serde_json::to_string(&state.scopes)?)
        .bind(&state.code_verifier)
        .bind(millis(state.created_at))
        .bind(millis(state.expires_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_authorization_state(&self, nonce: &str) -> Result<Option<AuthorizationState>> {
        let row = sqlx::query(
            "SELECT nonce, org_id, user_id, provider, scopes, code_verifier, created_at, expires_at
             FROM authorization_states
             WHERE nonce = ?",
        )
        .bind(nonce)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::parse_state).transpose()
    }

    async fn consume_authorization_state(&self, nonce: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM authorization_states WHERE nonce = ?")
            .bind(nonce)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete_expired_authorization_states(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM authorization_states WHERE expires_at <= ?")
            .bind(millis(now))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

// ============================================================================
// Integrations
// ============================================================================

#[async_trait]
impl IntegrationStorage for SqliteStorage {
    async fn ensure_integration(
        &self,
        org_id: &str,
        provider: &str,
        external_installation_id: Option<&str>,
    ) -> Result<Integration> {
        let now = millis(Utc::now());
        let row = sqlx::query(&format!(
            "INSERT INTO integrations
             (id, org_id, provider, external_installation_id, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(org_id, provider) DO UPDATE SET
                external_installation_id = COALESCE(excluded.external_installation_id, integrations.external_installation_id),
                updated_at = excluded.updated_at
             RETURNING {}",
            INTEGRATION_COLUMNS
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(org_id)
        .bind(provider)
        .bind(external_installation_id.filter(|id| !id.is_empty()))
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Self::parse_integration(&row)
    }

    async fn get_integration(&self, org_id: &str, provider: &str) -> Result<Option<Integration>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM integrations WHERE org_id = ? AND provider = ?",
            INTEGRATION_COLUMNS
        ))
        .bind(org_id)
        .bind(provider)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::parse_integration).transpose()
    }

    async fn find_integration_by_installation(
        &self,
        provider: &str,
        external_installation_id: &str,
    ) -> Result<Option<Integration>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM integrations
             WHERE provider = ? AND external_installation_id = ?
             ORDER BY updated_at DESC
             LIMIT 1",
            INTEGRATION_COLUMNS
        ))
        .bind(provider)
        .bind(external_installation_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::parse_integration).transpose()
    }
}

// ============================================================================
// Webhook deliveries
// ============================================================================

#[async_trait]
impl WebhookDeliveryStorage for SqliteStorage {
    async fn record_webhook_delivery(&self, record: &WebhookDeliveryRecord) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO webhook_deliveries (provider, event_id, received_at)
             VALUES (?, ?, ?)
             ON CONFLICT(provider, event_id) DO NOTHING",
        )
        .bind(&record.provider)
        .bind(&record.event_id)
        .bind(millis(record.received_at))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn webhook_delivery_exists(&self, provider: &str, event_id: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM webhook_deliveries WHERE provider = ? AND event_id = ?",
        )
        .bind(provider)
        .bind(event_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    async fn release_webhook_delivery(&self, provider: &str, event_id: &str) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM webhook_deliveries WHERE provider = ? AND event_id = ?")
                .bind(provider)
                .bind(event_id)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() == 1)
    }
}

// ============================================================================
// Vulnerabilities
// ============================================================================

#[async_trait]
impl VulnerabilityStorage for SqliteStorage {
    async fn upsert_vulnerability(
        &self,
        org_id: &str,
        external_id: &str,
        fields: &VulnerabilityFields,
        integration_id: Option<&str>,
    ) -> Result<UpsertOutcome> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .try_upsert_vulnerability(org_id, external_id, fields, integration_id)
                .await
            {
                Err(BrokerError::Database(ref e))
                    if attempt < UPSERT_MAX_ATTEMPTS && is_retryable_conflict(e) =>
                {
                    tracing::debug!(
                        org_id,
                        external_id,
                        attempt,
                        "Vulnerability upsert conflicted, retrying"
                    );
                    tokio::time::sleep(upsert_backoff(attempt)).await;
                }
                other => return other,
            }
        }
    }

    async fn get_vulnerability(
        &self,
        org_id: &str,
        external_id: &str,
    ) -> Result<Option<Vulnerability>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM vulnerabilities WHERE org_id = ? AND external_id = ?",
            VULNERABILITY_COLUMNS
        ))
        .bind(org_id)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::parse_vulnerability).transpose()
    }

    async fn list_vulnerabilities(&self, org_id: &str) -> Result<Vec<Vulnerability>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM vulnerabilities WHERE org_id = ? ORDER BY created_at, external_id",
            VULNERABILITY_COLUMNS
        ))
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::parse_vulnerability).collect()
    }

    async fn list_vulnerability_integrations(
        &self,
        vulnerability_id: &str,
    ) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar(
            "SELECT integration_id FROM vulnerability_integrations
             WHERE vulnerability_id = ?
             ORDER BY linked_at, integration_id",
        )
        .bind(vulnerability_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }
}
