//! GitHub alert webhooks
//!
//! Deliveries are verified against the raw body before anything is parsed,
//! routed to an organization through the App installation id, and recorded in
//! a per-delivery ledger so re-deliveries are acknowledged without a second
//! mutation.

use super::AppState;
use crate::broker::{Clock, SystemClock};
use crate::ingest::{IngestSource, VulnerabilityIngestor};
use crate::model::{AlertEnvelope, AlertType, UpsertOutcome, WebhookDeliveryRecord};
use crate::registry::ProviderRegistry;
use crate::storage::Storage;
use crate::{BrokerError, Result};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::HeaderMap,
    routing::post,
};
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::{Value, json};
use sha2::Sha256;
use std::sync::Arc;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

pub const GITHUB_PROVIDER: &str = "github";
pub const DELIVERY_HEADER: &str = "x-github-delivery";
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
pub const EVENT_HEADER: &str = "x-github-event";
const INSTALLATION_EVENT: &str = "installation";

/// What happened to an accepted delivery
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// Event type carries no alert (`ping`, unsupported events)
    Ignored { event: String },
    /// No integration matches the installation
    Unroutable { installation_id: Option<String> },
    /// Delivery id already processed
    Duplicate { delivery_id: String },
    /// A GitHub App was installed for a connected organization
    Installed {
        delivery_id: String,
        org_id: String,
        account: Option<String>,
    },
    /// Alert could not be keyed and was dropped
    Skipped { delivery_id: String },
    Ingested {
        delivery_id: String,
        alert_type: AlertType,
        created: bool,
    },
}

pub struct WebhookIngestor {
    registry: Arc<ProviderRegistry>,
    storage: Arc<dyn Storage>,
    ingestor: VulnerabilityIngestor,
    clock: Arc<dyn Clock>,
    max_body_bytes: usize,
}

impl WebhookIngestor {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        storage: Arc<dyn Storage>,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            registry,
            ingestor: VulnerabilityIngestor::new(storage.clone()),
            storage,
            clock: Arc::new(SystemClock),
            max_body_bytes,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Verify, deduplicate and ingest one GitHub delivery
    pub async fn ingest(&self, headers: &HeaderMap, body: &[u8]) -> Result<WebhookOutcome> {
        if body.len() > self.max_body_bytes {
            return Err(BrokerError::PayloadTooLarge {
                limit: self.max_body_bytes,
            });
        }
        if body.is_empty() {
            return Err(BrokerError::EmptyPayload);
        }

        let delivery_id = header(headers, DELIVERY_HEADER)
            .ok_or_else(|| BrokerError::missing_field("X-GitHub-Delivery"))?
            .to_string();

        let secret = self
            .registry
            .config(GITHUB_PROVIDER)
            .and_then(|spec| spec.webhook_secret.as_deref())
            .ok_or_else(|| {
                tracing::warn!(delivery_id = %delivery_id, "No GitHub webhook secret configured");
                BrokerError::InvalidSignature
            })?;
        verify_signature(secret, header(headers, SIGNATURE_HEADER), body).inspect_err(|_| {
            tracing::warn!(delivery_id = %delivery_id, "Rejected webhook with invalid signature");
        })?;

        let payload: Value = serde_json::from_slice(body)
            .map_err(|e| BrokerError::validation(format!("Malformed webhook payload: {}", e)))?;

        let event = header(headers, EVENT_HEADER).unwrap_or_default().to_string();
        if event == "ping" {
            return Ok(WebhookOutcome::Ignored { event });
        }

        let installation_id = installation_id(&payload);
        let integration = match &installation_id {
            Some(id) => {
                self.storage
                    .find_integration_by_installation(GITHUB_PROVIDER, id)
                    .await?
            }
            None => None,
        };
        let Some(integration) = integration else {
            tracing::info!(
                delivery_id = %delivery_id,
                installation_id = ?installation_id,
                "Acknowledging unroutable webhook"
            );
            return Ok(WebhookOutcome::Unroutable { installation_id });
        };

        let first_delivery = self
            .storage
            .record_webhook_delivery(&WebhookDeliveryRecord {
                event_id: delivery_id.clone(),
                provider: GITHUB_PROVIDER.to_string(),
                received_at: self.clock.now(),
            })
            .await?;
        if !first_delivery {
            tracing::debug!(delivery_id = %delivery_id, "Duplicate webhook delivery");
            return Ok(WebhookOutcome::Duplicate { delivery_id });
        }

        let action = payload
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if event.eq_ignore_ascii_case(INSTALLATION_EVENT) {
            if !action.eq_ignore_ascii_case("created") {
                return Ok(WebhookOutcome::Ignored { event });
            }
            let account = payload
                .pointer("/installation/account/login")
                .and_then(Value::as_str)
                .map(str::to_string);
            tracing::info!(
                delivery_id = %delivery_id,
                org_id = %integration.org_id,
                account = ?account,
                "GitHub App installation created"
            );
            return Ok(WebhookOutcome::Installed {
                delivery_id,
                org_id: integration.org_id,
                account,
            });
        }

        let Some(alert_type) = AlertType::parse(&event) else {
            tracing::debug!(delivery_id = %delivery_id, event = %event, "Ignoring webhook event");
            return Ok(WebhookOutcome::Ignored { event });
        };

        let envelope = AlertEnvelope {
            alert_type,
            resource: payload
                .pointer("/repository/full_name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            action,
            payload: payload.get("alert").cloned().unwrap_or(Value::Null),
        };

        let outcome = match self
            .ingestor
            .ingest_one(
                &integration.org_id,
                Some(&integration.id),
                &envelope,
                IngestSource::Webhook,
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                // Let the provider's redelivery retry the mutation
                if let Err(release) = self
                    .storage
                    .release_webhook_delivery(GITHUB_PROVIDER, &delivery_id)
                    .await
                {
                    tracing::error!(delivery_id = %delivery_id, error = %release, "Failed to release webhook delivery");
                }
                return Err(e);
            }
        };

        Ok(match outcome {
            Some(outcome) => {
                tracing::info!(
                    delivery_id = %delivery_id,
                    org_id = %integration.org_id,
                    alert_type = %alert_type,
                    "Ingested webhook alert"
                );
                WebhookOutcome::Ingested {
                    delivery_id,
                    alert_type,
                    created: outcome == UpsertOutcome::Created,
                }
            }
            None => WebhookOutcome::Skipped { delivery_id },
        })
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn installation_id(payload: &Value) -> Option<String> {
    match payload.pointer("/installation/id")? {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

/// Check `X-Hub-Signature-256: sha256=<hex>` against the raw body in constant time
pub fn verify_signature(secret: &str, signature: Option<&str>, body: &[u8]) -> Result<()> {
    let hex_digest = signature
        .and_then(|s| s.strip_prefix("sha256="))
        .ok_or(BrokerError::InvalidSignature)?;
    let expected = hex::decode(hex_digest).map_err(|_| BrokerError::InvalidSignature)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BrokerError::InvalidSignature)?;
    mac.update(body);
    let computed = mac.finalize().into_bytes();

    if bool::from(computed.as_slice().ct_eq(&expected)) {
        Ok(())
    } else {
        Err(BrokerError::InvalidSignature)
    }
}

/// `sha256=<hex>` signature header value for `body`
pub fn sign_payload(secret: &str, body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| BrokerError::internal(format!("Invalid HMAC key: {}", e)))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

pub fn create_webhook_routes(max_body_bytes: usize) -> Router<AppState> {
    Router::new()
        .route("/webhooks/github", post(github_webhook_handler))
        .layer(DefaultBodyLimit::max(max_body_bytes))
}

async fn github_webhook_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>> {
    let outcome = state.webhooks.ingest(&headers, &body).await?;
    Ok(Json(json!({
        "status": "acknowledged",
        "result": outcome,
    })))
}
