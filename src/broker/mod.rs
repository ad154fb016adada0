//! Credential broker
//!
//! Hands out currently-valid credential payloads. Static configurations are
//! returned as stored; OAuth tokens are refreshed against the provider's token
//! endpoint once they fall inside the expiry skew.
//!
//! Refresh is single-flight per (organization, provider): the first caller
//! spawns the refresh and records a shared future in `in_flight`; concurrent
//! callers await that same future. Providers that rotate refresh tokens
//! invalidate the old one on use, so two parallel refreshes would leave one
//! caller holding a dead token.

mod clock;

pub use clock::{Clock, FixedClock, SystemClock};

use crate::auth::TokenEndpoint;
use crate::model::{Credential, CredentialPayload, OAuthToken};
use crate::registry::ProviderRegistry;
use crate::storage::Storage;
use crate::{BrokerError, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

pub const DEFAULT_REFRESH_SKEW_SECONDS: i64 = 300;

type RefreshKey = (String, String);
type SharedRefresh = Shared<BoxFuture<'static, std::result::Result<OAuthToken, SharedError>>>;

/// Refresh failure that can be handed to every waiter
#[derive(Clone)]
struct SharedError(Arc<BrokerError>);

impl SharedError {
    fn into_error(self) -> BrokerError {
        Arc::try_unwrap(self.0).unwrap_or_else(|shared| replay(&shared))
    }
}

fn replay(err: &BrokerError) -> BrokerError {
    match err {
        BrokerError::RefreshFailed { provider, reason } => BrokerError::RefreshFailed {
            provider: provider.clone(),
            reason: reason.clone(),
        },
        BrokerError::CredentialNotFound(provider) => {
            BrokerError::CredentialNotFound(provider.clone())
        }
        BrokerError::ProviderNotRegistered(provider) => {
            BrokerError::ProviderNotRegistered(provider.clone())
        }
        BrokerError::Validation(msg) => BrokerError::Validation(msg.clone()),
        other => BrokerError::internal(other.to_string()),
    }
}

pub struct CredentialBroker {
    registry: Arc<ProviderRegistry>,
    storage: Arc<dyn Storage>,
    token_endpoint: Arc<dyn TokenEndpoint>,
    clock: Arc<dyn Clock>,
    skew: chrono::Duration,
    in_flight: Arc<Mutex<HashMap<RefreshKey, SharedRefresh>>>,
}

impl CredentialBroker {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        storage: Arc<dyn Storage>,
        token_endpoint: Arc<dyn TokenEndpoint>,
    ) -> Self {
        Self {
            registry,
            storage,
            token_endpoint,
            clock: Arc::new(SystemClock),
            skew: chrono::Duration::seconds(DEFAULT_REFRESH_SKEW_SECONDS),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_skew(mut self, skew: chrono::Duration) -> Self {
        self.skew = skew;
        self
    }

    /// Return a usable credential payload for (org, provider)
    pub async fn mint(&self, org_id: &str, provider: &str) -> Result<CredentialPayload> {
        let credential = self
            .storage
            .get_credential(org_id, provider)
            .await?
            .ok_or_else(|| BrokerError::CredentialNotFound(provider.to_string()))?;

        match &credential.payload {
            CredentialPayload::StaticConfig(_) => Ok(credential.payload),
            CredentialPayload::OAuthToken(token) => {
                if token.is_fresh_at(self.clock.now(), self.skew) {
                    return Ok(credential.payload);
                }

                tracing::info!(org_id, provider, "Access token expiring, refreshing");
                let token = self.refresh_shared(org_id, provider, false).await?;
                Ok(CredentialPayload::OAuthToken(token))
            }
        }
    }

    /// Refresh regardless of remaining validity
    pub async fn refresh(&self, org_id: &str, provider: &str) -> Result<OAuthToken> {
        self.refresh_shared(org_id, provider, true).await
    }

    /// Number of refreshes currently in flight
    pub fn in_flight_refreshes(&self) -> usize {
        self.in_flight.lock().len()
    }

    async fn refresh_shared(&self, org_id: &str, provider: &str, force: bool) -> Result<OAuthToken> {
        let key = (org_id.to_string(), provider.to_string());

        let refresh = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(&key) {
                Some(existing) => {
                    tracing::debug!(org_id, provider, "Joining in-flight refresh");
                    existing.clone()
                }
                None => {
                    let task = RefreshTask {
                        registry: self.registry.clone(),
                        storage: self.storage.clone(),
                        token_endpoint: self.token_endpoint.clone(),
                        clock: self.clock.clone(),
                        skew: self.skew,
                        org_id: org_id.to_string(),
                        provider: provider.to_string(),
                        force,
                    };

                    // The entry is inserted before this lock is released, so the
                    // task's removal below can never run ahead of the insert.
                    let registry = self.in_flight.clone();
                    let task_key = key.clone();
                    let handle = tokio::spawn(async move {
                        let result = task.run().await.map_err(|e| SharedError(Arc::new(e)));
                        registry.lock().remove(&task_key);
                        result
                    });

                    let shared = async move {
                        match handle.await {
                            Ok(result) => result,
                            Err(e) => Err(SharedError(Arc::new(BrokerError::internal(format!(
                                "Refresh task failed: {}",
                                e
                            ))))),
                        }
                    }
                    .boxed()
                    .shared();

                    in_flight.insert(key, shared.clone());
                    shared
                }
            }
        };

        refresh.await.map_err(SharedError::into_error)
    }
}

/// Owned inputs for one spawned refresh
struct RefreshTask {
    registry: Arc<ProviderRegistry>,
    storage: Arc<dyn Storage>,
    token_endpoint: Arc<dyn TokenEndpoint>,
    clock: Arc<dyn Clock>,
    skew: chrono::Duration,
    org_id: String,
    provider: String,
    force: bool,
}

impl RefreshTask {
    async fn run(self) -> Result<OAuthToken> {
        let org_id = self.org_id.as_str();
        let provider = self.provider.as_str();

        // Re-read under single-flight: a refresh that finished just before this
        // one was scheduled has already stored a fresh token.
        let credential = self
            .storage
            .get_credential(org_id, provider)
            .await?
            .ok_or_else(|| BrokerError::CredentialNotFound(provider.to_string()))?;

        let current = match credential.payload {
            CredentialPayload::OAuthToken(token) => token,
            CredentialPayload::StaticConfig(_) => {
                return Err(BrokerError::validation(format!(
                    "Static credentials for {} cannot be refreshed",
                    provider
                )));
            }
        };

        if !self.force && current.is_fresh_at(self.clock.now(), self.skew) {
            return Ok(current);
        }

        let refresh_failed = |reason: &str| BrokerError::RefreshFailed {
            provider: provider.to_string(),
            reason: reason.to_string(),
        };

        let spec = self
            .registry
            .config(provider)
            .ok_or_else(|| BrokerError::ProviderNotRegistered(provider.to_string()))?;
        let oauth = spec
            .oauth
            .as_ref()
            .ok_or_else(|| refresh_failed("provider has no token endpoint"))?;
        let refresh_token = current
            .refresh_token
            .as_deref()
            .ok_or_else(|| refresh_failed("no refresh token stored"))?;

        let token_set = self
            .token_endpoint
            .refresh(provider, oauth, refresh_token)
            .await
            .map_err(|e| match e {
                BrokerError::RefreshFailed { .. } => e,
                other => refresh_failed(&other.public_message()),
            })?;

        let now = self.clock.now();
        let refreshed = token_set.into_token(now, Some(&current));

        self.storage
            .save_credential(&Credential {
                org_id: org_id.to_string(),
                provider: provider.to_string(),
                payload: CredentialPayload::OAuthToken(refreshed.clone()),
                updated_at: now,
            })
            .await?;

        tracing::info!(
            org_id,
            provider,
            expires_at = ?refreshed.expires_at,
            "Refreshed access token"
        );

        Ok(refreshed)
    }
}
