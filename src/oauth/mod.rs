//! OAuth flow coordinator
//!
//! Drives the authorization-code handshake for OAuth providers:
//!
//! ```text
//! INIT -> STATE_ISSUED -> CODE_EXCHANGED -> COMPLETE
//!              \________________\_________-> FAILED
//! ```
//!
//! `begin_oauth` persists a single-use [`AuthorizationState`] keyed by a random
//! nonce and issues a binding for the redirect side channel. `complete_oauth`
//! only trusts the callback when the binding verifies, matches the nonce, and
//! agrees with the stored state on organization, provider and user.

use crate::auth::{
    BindingClaims, PkcePair, StateBinding, TokenEndpoint, build_authorization_url,
    build_installation_url,
};
use crate::broker::{Clock, SystemClock};
use crate::model::{AuthorizationState, Credential, CredentialPayload, OAuthSpec, ProviderSpec};
use crate::operations::OperationRunner;
use crate::registry::ProviderRegistry;
use crate::storage::Storage;
use crate::{BrokerError, Result};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

pub const DEFAULT_STATE_TTL_MINUTES: i64 = 10;
const NONCE_BYTES: usize = 16;

/// Result of starting an authorization attempt
#[derive(Debug, Clone, Serialize)]
pub struct BeginOAuth {
    pub auth_url: String,
    pub state: String,
    /// Side-channel token the HTTP layer hands back to the browser
    #[serde(skip_serializing)]
    pub binding: String,
    pub expires_at: DateTime<Utc>,
}

/// Identity bound to a completed authorization
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletedOAuth {
    pub org_id: String,
    pub user_id: String,
    pub provider: String,
    pub scopes: Vec<String>,
    pub integration_id: String,
}

#[derive(Debug, Clone, Copy)]
enum Entry {
    Authorize,
    Install,
}

pub struct OAuthCoordinator {
    registry: Arc<ProviderRegistry>,
    storage: Arc<dyn Storage>,
    token_endpoint: Arc<dyn TokenEndpoint>,
    binding: Arc<dyn StateBinding>,
    clock: Arc<dyn Clock>,
    state_ttl: Duration,
    health: Option<Arc<OperationRunner>>,
}

impl OAuthCoordinator {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        storage: Arc<dyn Storage>,
        token_endpoint: Arc<dyn TokenEndpoint>,
        binding: Arc<dyn StateBinding>,
    ) -> Self {
        Self {
            registry,
            storage,
            token_endpoint,
            binding,
            clock: Arc::new(SystemClock),
            state_ttl: Duration::minutes(DEFAULT_STATE_TTL_MINUTES),
            health: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_state_ttl(mut self, ttl: Duration) -> Self {
        self.state_ttl = ttl;
        self
    }

    pub fn state_ttl(&self) -> Duration {
        self.state_ttl
    }

    /// Run the provider's health operation once a token is stored
    ///
    /// A failing check removes the new credential and fails the completion.
    pub fn with_health_check(mut self, runner: Arc<OperationRunner>) -> Self {
        self.health = Some(runner);
        self
    }

    /// Start an authorization attempt for `provider` on behalf of `org_id`
    pub async fn begin_oauth(
        &self,
        org_id: &str,
        user_id: &str,
        provider: &str,
        scopes: &[String],
    ) -> Result<BeginOAuth> {
        self.begin(org_id, user_id, provider, scopes, Entry::Authorize).await
    }

    /// Start an app installation for `provider` (GitHub Apps)
    ///
    /// Issues the same single-use state and binding as [`Self::begin_oauth`],
    /// but sends the user to the provider's installation page. The callback
    /// carries the authorization code and the new installation id.
    pub async fn begin_installation(
        &self,
        org_id: &str,
        user_id: &str,
        provider: &str,
    ) -> Result<BeginOAuth> {
        self.begin(org_id, user_id, provider, &[], Entry::Install).await
    }

    async fn begin(
        &self,
        org_id: &str,
        user_id: &str,
        provider: &str,
        scopes: &[String],
        entry: Entry,
    ) -> Result<BeginOAuth> {
        let (spec, oauth) = self.oauth_provider(provider)?;

        let nonce = generate_nonce();
        let scopes = merge_scopes(&oauth.scopes, scopes);
        let pkce = oauth.pkce.then(PkcePair::generate);

        let now = self.clock.now();
        let expires_at = now + self.state_ttl;
        let state = AuthorizationState {
            nonce: nonce.clone(),
            org_id: org_id.to_string(),
            user_id: user_id.to_string(),
            provider: spec.name.clone(),
            scopes: scopes.clone(),
            code_verifier: pkce.as_ref().map(|p| p.verifier.clone()),
            created_at: now,
            expires_at,
        };

        let auth_url = match entry {
            Entry::Authorize => {
                build_authorization_url(oauth, &nonce, &scopes, pkce.map(|p| p.challenge))?
            }
            Entry::Install => build_installation_url(&spec.name, oauth, &nonce)?,
        };

        // Persisted before the URL leaves this method so the callback can never
        // race ahead of the state row.
        self.storage.save_authorization_state(&state).await?;

        let binding = self.binding.issue_binding(&BindingClaims {
            nonce: nonce.clone(),
            org_id: org_id.to_string(),
            user_id: user_id.to_string(),
            provider: spec.name.clone(),
            expires_at,
        })?;

        tracing::info!(
            org_id,
            user_id,
            provider,
            entry = ?entry,
            "Issued OAuth authorization state"
        );

        Ok(BeginOAuth {
            auth_url,
            state: nonce,
            binding,
            expires_at,
        })
    }

    /// Finish an authorization attempt from the provider callback
    pub async fn complete_oauth(
        &self,
        binding_token: &str,
        state: &str,
        code: &str,
    ) -> Result<CompletedOAuth> {
        self.complete_oauth_for_installation(binding_token, state, code, None)
            .await
    }

    /// Like [`Self::complete_oauth`], also recording the provider-side installation id
    ///
    /// App-style providers (GitHub Apps) pass an `installation_id` on the
    /// callback; webhooks are later routed to the organization through it.
    pub async fn complete_oauth_for_installation(
        &self,
        binding_token: &str,
        state: &str,
        code: &str,
        installation_id: Option<&str>,
    ) -> Result<CompletedOAuth> {
        let claims = self.binding.verify_binding(binding_token)?;
        if claims.nonce != state {
            return Err(BrokerError::binding("binding was issued for a different state"));
        }

        let stored = self
            .storage
            .get_authorization_state(state)
            .await?
            .ok_or(BrokerError::StateNotFound)?;

        let oauth = match self.validate_callback(&claims, &stored, code) {
            Ok(oauth) => oauth,
            Err(e) => {
                tracing::warn!(
                    org_id = %stored.org_id,
                    provider = %stored.provider,
                    kind = e.kind(),
                    "Rejected OAuth callback"
                );
                self.discard_state(state).await;
                return Err(e);
            }
        };

        // Claimed before the exchange: of two concurrent callbacks only one
        // gets to spend the authorization code.
        if !self.storage.consume_authorization_state(state).await? {
            return Err(BrokerError::StateNotFound);
        }

        let provider = stored.provider.as_str();
        let token_set = self
            .token_endpoint
            .exchange_code(provider, oauth, code, stored.code_verifier.as_deref())
            .await
            .map_err(|e| match e {
                BrokerError::CodeExchangeFailed { .. } => e,
                other => BrokerError::CodeExchangeFailed {
                    provider: provider.to_string(),
                    reason: other.public_message(),
                },
            })?;

        let now = self.clock.now();
        let mut token = token_set.into_token(now, None);
        if token.scopes.is_empty() {
            token.scopes = stored.scopes.clone();
        }
        let scopes = token.scopes.clone();

        self.storage
            .save_credential(&Credential {
                org_id: stored.org_id.clone(),
                provider: provider.to_string(),
                payload: CredentialPayload::OAuthToken(token),
                updated_at: now,
            })
            .await?;

        let integration = self
            .storage
            .ensure_integration(&stored.org_id, provider, installation_id)
            .await?;

        if let Some(runner) = &self.health {
            runner.invalidate(&stored.org_id, provider);
            if let Err(e) = runner.check_health(&stored.org_id, provider).await {
                self.storage.delete_credential(&stored.org_id, provider).await?;
                return Err(e);
            }
        }

        tracing::info!(
            org_id = %stored.org_id,
            user_id = %stored.user_id,
            provider,
            integration_id = %integration.id,
            "Completed OAuth authorization"
        );

        Ok(CompletedOAuth {
            org_id: stored.org_id,
            user_id: stored.user_id,
            provider: stored.provider,
            scopes,
            integration_id: integration.id,
        })
    }

    /// Abandon an authorization attempt the provider reported as denied
    ///
    /// The binding must verify for `state`; the state is then discarded so it
    /// cannot be completed later.
    pub async fn cancel_oauth(&self, binding_token: &str, state: &str) -> Result<()> {
        let claims = self.binding.verify_binding(binding_token)?;
        if claims.nonce != state {
            return Err(BrokerError::binding("binding was issued for a different state"));
        }
        self.discard_state(state).await;
        tracing::info!(
            org_id = %claims.org_id,
            provider = %claims.provider,
            "Provider denied OAuth authorization"
        );
        Ok(())
    }

    /// Delete authorization states past their expiry
    pub async fn sweep_expired_states(&self) -> Result<u64> {
        let removed = self
            .storage
            .delete_expired_authorization_states(self.clock.now())
            .await?;
        if removed > 0 {
            tracing::debug!(removed, "Swept expired authorization states");
        }
        Ok(removed)
    }

    fn oauth_provider(&self, provider: &str) -> Result<(&ProviderSpec, &OAuthSpec)> {
        let spec = self
            .registry
            .config(provider)
            .ok_or_else(|| BrokerError::ProviderNotRegistered(provider.to_string()))?;
        if !spec.active {
            return Err(BrokerError::ProviderInactive(provider.to_string()));
        }
        if !spec.auth_type.is_oauth() {
            return Err(BrokerError::UnsupportedAuthType {
                provider: provider.to_string(),
                auth_type: spec.auth_type.to_string(),
            });
        }
        let oauth = spec.oauth.as_ref().ok_or_else(|| {
            BrokerError::config(format!("Provider '{}' has no OAuth configuration", provider))
        })?;
        Ok((spec, oauth))
    }

    fn validate_callback(
        &self,
        claims: &BindingClaims,
        stored: &AuthorizationState,
        code: &str,
    ) -> Result<&OAuthSpec> {
        if stored.is_expired_at(self.clock.now()) {
            return Err(BrokerError::StateExpired);
        }
        if claims.org_id != stored.org_id {
            return Err(BrokerError::InvalidOrganizationContext);
        }
        if claims.provider != stored.provider {
            return Err(BrokerError::InvalidProviderContext);
        }
        if claims.user_id != stored.user_id {
            return Err(BrokerError::InvalidUserContext);
        }
        if code.trim().is_empty() {
            return Err(BrokerError::AuthorizationCodeRequired);
        }
        self.oauth_provider(&stored.provider).map(|(_, oauth)| oauth)
    }

    async fn discard_state(&self, nonce: &str) {
        if let Err(e) = self.storage.consume_authorization_state(nonce).await {
            tracing::error!(error = %e, "Failed to discard authorization state");
        }
    }
}

fn generate_nonce() -> String {
    let mut bytes = [0u8; NONCE_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Provider defaults followed by requested scopes, deduplicated case-insensitively
///
/// The first spelling of a scope wins and blanks are dropped.
pub fn merge_scopes(defaults: &[String], requested: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    defaults
        .iter()
        .chain(requested)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter(|s| seen.insert(s.to_lowercase()))
        .map(str::to_string)
        .collect()
}
