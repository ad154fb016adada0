//! Operation runner
//!
//! Dispatches named provider operations with a freshly minted credential,
//! bounded by the operation's timeout. Identical runs inside the debounce
//! window reuse the previous result.

use crate::broker::CredentialBroker;
use crate::ingest::{IngestSource, VulnerabilityIngestor};
use crate::model::{AlertEnvelope, OperationResult};
use crate::registry::{OperationContext, ProviderRegistry};
use crate::storage::Storage;
use crate::{BrokerError, Result};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(30);

/// Operation run after a provider is connected, when the provider declares it
pub const HEALTH_OPERATION: &str = "health.default";

#[derive(Debug, Clone, Deserialize)]
pub struct RunRequest {
    pub org_id: String,
    pub provider: String,
    pub operation: String,
    #[serde(default)]
    pub config: Value,
    /// Bypass and refresh the debounce cache
    #[serde(default)]
    pub force: bool,
}

impl RunRequest {
    pub fn new(org_id: &str, provider: &str, operation: &str) -> Self {
        Self {
            org_id: org_id.to_string(),
            provider: provider.to_string(),
            operation: operation.to_string(),
            config: Value::Null,
            force: false,
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    fn cache_key(&self) -> String {
        // serde_json::Map keeps keys sorted, so equal configs render identically
        format!(
            "{}{}\u{0}{}",
            cache_prefix(&self.org_id, &self.provider),
            self.operation,
            self.config
        )
    }
}

fn cache_prefix(org_id: &str, provider: &str) -> String {
    format!("{}\u{0}{}\u{0}", org_id, provider)
}

struct CachedResult {
    result: OperationResult,
    stored_at: Instant,
}

pub struct OperationRunner {
    registry: Arc<ProviderRegistry>,
    broker: Arc<CredentialBroker>,
    storage: Arc<dyn Storage>,
    ingestor: VulnerabilityIngestor,
    debounce: Duration,
    cache: Mutex<HashMap<String, CachedResult>>,
}

impl OperationRunner {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        broker: Arc<CredentialBroker>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            registry,
            broker,
            ingestor: VulnerabilityIngestor::new(storage.clone()),
            storage,
            debounce: DEFAULT_DEBOUNCE,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Set the debounce window; zero disables caching
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub async fn run(&self, request: &RunRequest) -> Result<OperationResult> {
        let provider = request.provider.as_str();
        let operation = request.operation.as_str();

        let spec = self
            .registry
            .config(provider)
            .ok_or_else(|| BrokerError::ProviderNotRegistered(provider.to_string()))?;
        let (descriptor, handler) = self.registry.operation(provider, operation).ok_or_else(|| {
            BrokerError::OperationNotRegistered {
                provider: provider.to_string(),
                operation: operation.to_string(),
            }
        })?;

        // A disconnected provider must fail even while a result is cached
        if descriptor.requires_credential
            && !self
                .storage
                .credential_exists(&request.org_id, provider)
                .await?
        {
            self.invalidate(&request.org_id, provider);
            return Err(BrokerError::CredentialNotFound(provider.to_string()));
        }

        let key = request.cache_key();
        if !request.force
            && let Some(cached) = self.cached(&key)
        {
            tracing::debug!(
                org_id = %request.org_id,
                provider,
                operation,
                "Returning debounced operation result"
            );
            return Ok(cached);
        }

        let credential = if descriptor.requires_credential {
            Some(self.broker.mint(&request.org_id, provider).await?)
        } else {
            None
        };

        let ctx = OperationContext {
            org_id: &request.org_id,
            provider: spec,
            operation: descriptor,
            credential: credential.as_ref(),
            config: &request.config,
        };

        let started = Instant::now();
        let result = match tokio::time::timeout(descriptor.timeout, handler.execute(ctx)).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                tracing::warn!(
                    org_id = %request.org_id,
                    provider,
                    operation,
                    error = %e,
                    "Operation failed"
                );
                OperationResult::error(e.public_message())
            }
            Err(_) => {
                tracing::warn!(
                    org_id = %request.org_id,
                    provider,
                    operation,
                    timeout_secs = descriptor.timeout.as_secs(),
                    "Operation timed out"
                );
                OperationResult::error(format!(
                    "Operation {} timed out after {}s",
                    operation,
                    descriptor.timeout.as_secs()
                ))
            }
        };

        tracing::info!(
            org_id = %request.org_id,
            provider,
            operation,
            status = ?result.status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Operation finished"
        );

        self.store(key, &result);
        Ok(result)
    }

    /// Run, then ingest any `details.alerts` the operation produced
    ///
    /// Payloads are always requested so collection operations emit their
    /// envelopes. The ingest summary is attached as `details.ingest`.
    pub async fn run_and_ingest(
        &self,
        request: &RunRequest,
        integration_id: Option<&str>,
    ) -> Result<OperationResult> {
        let mut request = request.clone();
        request.config = with_payloads(request.config);
        let mut result = self.run(&request).await?;

        let Some(alerts) = result.details.get("alerts") else {
            return Ok(result);
        };
        let envelopes: Vec<AlertEnvelope> = serde_json::from_value(alerts.clone())
            .map_err(|e| BrokerError::validation(format!("Malformed alert envelopes: {}", e)))?;

        let summary = self
            .ingestor
            .ingest(&request.org_id, integration_id, &envelopes, IngestSource::Sync)
            .await?;
        result
            .details
            .insert("ingest".to_string(), serde_json::to_value(summary)?);

        Ok(result)
    }

    /// Run the provider's health operation, bypassing the debounce cache
    ///
    /// Providers without a health operation pass unchecked. An error result
    /// becomes [`BrokerError::HealthCheckFailed`].
    pub async fn check_health(&self, org_id: &str, provider: &str) -> Result<()> {
        if self.registry.operation(provider, HEALTH_OPERATION).is_none() {
            return Ok(());
        }

        let result = self
            .run(&RunRequest::new(org_id, provider, HEALTH_OPERATION).forced())
            .await?;
        if result.is_ok() {
            return Ok(());
        }

        tracing::warn!(org_id, provider, summary = %result.summary, "Provider health check failed");
        let summary = result.summary.trim();
        Err(BrokerError::HealthCheckFailed {
            provider: provider.to_string(),
            reason: if summary.is_empty() {
                "provider reported an error".to_string()
            } else {
                summary.to_string()
            },
        })
    }

    /// Drop every cached result for an organization's provider
    ///
    /// Called when the provider's credential is replaced or removed.
    pub fn invalidate(&self, org_id: &str, provider: &str) {
        let prefix = cache_prefix(org_id, provider);
        self.cache.lock().retain(|key, _| !key.starts_with(&prefix));
    }

    fn cached(&self, key: &str) -> Option<OperationResult> {
        if self.debounce.is_zero() {
            return None;
        }
        let mut cache = self.cache.lock();
        if let Some(entry) = cache.get(key)
            && entry.stored_at.elapsed() < self.debounce
        {
            return Some(entry.result.clone());
        }
        cache.remove(key);
        None
    }

    fn store(&self, key: String, result: &OperationResult) {
        if self.debounce.is_zero() {
            return;
        }
        let mut cache = self.cache.lock();
        let debounce = self.debounce;
        cache.retain(|_, entry| entry.stored_at.elapsed() < debounce);
        cache.insert(
            key,
            CachedResult {
                result: result.clone(),
                stored_at: Instant::now(),
            },
        );
    }
}

fn with_payloads(config: Value) -> Value {
    match config {
        Value::Object(mut map) => {
            map.insert("include_payloads".to_string(), Value::Bool(true));
            Value::Object(map)
        }
        Value::Null => serde_json::json!({ "include_payloads": true }),
        other => other,
    }
}
