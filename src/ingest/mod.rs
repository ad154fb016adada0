//! Vulnerability ingestion
//!
//! Turns [`AlertEnvelope`]s from webhooks or collection operations into
//! deduplicated vulnerability rows.

mod normalize;

pub use normalize::{NormalizedAlert, alert_id, external_id, normalize};

use crate::model::{AlertEnvelope, IngestSummary, UpsertOutcome};
use crate::storage::Storage;
use crate::Result;
use std::sync::Arc;

/// Where a batch of alerts came from, recorded in vulnerability metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestSource {
    Webhook,
    Sync,
}

impl IngestSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestSource::Webhook => "webhook",
            IngestSource::Sync => "sync",
        }
    }
}

#[derive(Clone)]
pub struct VulnerabilityIngestor {
    storage: Arc<dyn Storage>,
}

impl VulnerabilityIngestor {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Normalize and upsert a batch of envelopes for one organization
    pub async fn ingest(
        &self,
        org_id: &str,
        integration_id: Option<&str>,
        envelopes: &[AlertEnvelope],
        source: IngestSource,
    ) -> Result<IngestSummary> {
        let mut summary = IngestSummary {
            total: envelopes.len(),
            ..Default::default()
        };

        for envelope in envelopes {
            match self.ingest_one(org_id, integration_id, envelope, source).await? {
                Some(UpsertOutcome::Created) => summary.created += 1,
                Some(UpsertOutcome::Updated) => summary.updated += 1,
                None => summary.skipped += 1,
            }
        }

        tracing::info!(
            org_id,
            created = summary.created,
            updated = summary.updated,
            skipped = summary.skipped,
            source = source.as_str(),
            "Ingested alerts"
        );

        Ok(summary)
    }

    /// Upsert a single envelope; `None` when it cannot be keyed
    pub async fn ingest_one(
        &self,
        org_id: &str,
        integration_id: Option<&str>,
        envelope: &AlertEnvelope,
        source: IngestSource,
    ) -> Result<Option<UpsertOutcome>> {
        let Some(normalized) = normalize(envelope, source) else {
            tracing::warn!(
                org_id,
                alert_type = %envelope.alert_type,
                resource = %envelope.resource,
                "Skipping alert without resource or id"
            );
            return Ok(None);
        };

        let outcome = self
            .storage
            .upsert_vulnerability(
                org_id,
                &normalized.external_id,
                &normalized.fields,
                integration_id,
            )
            .await
            .inspect_err(|e| {
                tracing::error!(
                    org_id,
                    external_id = %normalized.external_id,
                    error = %e,
                    "Vulnerability upsert failed"
                )
            })?;

        Ok(Some(outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::CredentialEncryption;
    use crate::model::AlertType;
    use crate::storage::SqliteStorage;
    use serde_json::json;

    async fn ingestor() -> (VulnerabilityIngestor, Arc<dyn Storage>) {
        let storage: Arc<dyn Storage> = Arc::new(
            SqliteStorage::new(":memory:", CredentialEncryption::for_testing())
                .await
                .unwrap(),
        );
        (VulnerabilityIngestor::new(storage.clone()), storage)
    }

    fn alert(number: u64, severity: &str) -> AlertEnvelope {
        AlertEnvelope {
            alert_type: AlertType::Dependabot,
            resource: "acme/api".to_string(),
            action: "created".to_string(),
            payload: json!({
                "number": number,
                "state": "open",
                "security_vulnerability": {"severity": severity}
            }),
        }
    }

    #[tokio::test]
    async fn test_batch_counts_created_updated_skipped() {
        let (ingestor, storage) = ingestor().await;
        let integration = storage.ensure_integration("org-a", "github", None).await.unwrap();

        let mut unkeyed = alert(0, "low");
        unkeyed.payload = json!({"state": "open"});

        let summary = ingestor
            .ingest(
                "org-a",
                Some(&integration.id),
                &[alert(1, "low"), alert(2, "high"), unkeyed],
                IngestSource::Sync,
            )
            .await
            .unwrap();
        assert_eq!(
            summary,
            IngestSummary {
                created: 2,
                updated: 0,
                skipped: 1,
                total: 3
            }
        );

        let summary = ingestor
            .ingest("org-a", Some(&integration.id), &[alert(1, "critical")], IngestSource::Sync)
            .await
            .unwrap();
        assert_eq!(summary.updated, 1);
        assert_eq!(summary.created, 0);

        let vuln = storage
            .get_vulnerability("org-a", "dependabot:acme/api:1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(vuln.severity.as_deref(), Some("critical"));
    }

    #[tokio::test]
    async fn test_reingest_is_idempotent() {
        let (ingestor, storage) = ingestor().await;
        for _ in 0..3 {
            ingestor
                .ingest("org-a", None, &[alert(5, "high")], IngestSource::Webhook)
                .await
                .unwrap();
        }
        assert_eq!(storage.list_vulnerabilities("org-a").await.unwrap().len(), 1);
    }
}
