//! Shared fixtures for integration tests
//!
//! Wires the full broker against in-memory SQLite, a controllable clock and a
//! token endpoint that counts its calls instead of touching the network.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::Router;
use chrono::{Duration as ChronoDuration, Utc};
use integration_broker::auth::{
    BindingClaims, CredentialEncryption, SignedBinding, StateBinding, TokenEndpoint, TokenSet,
    ValidatedSecret,
};
use integration_broker::broker::{Clock, CredentialBroker, FixedClock};
use integration_broker::config::{Config, HttpConfig, ProviderOverride};
use integration_broker::http::webhook::{WebhookIngestor, sign_payload};
use integration_broker::http::{AppState, create_router};
use integration_broker::model::{Credential, CredentialPayload, OAuthSpec, OAuthToken};
use integration_broker::oauth::OAuthCoordinator;
use integration_broker::operations::OperationRunner;
use integration_broker::providers::builtin_definitions;
use integration_broker::registry::{ProviderDefinition, ProviderRegistry};
use integration_broker::storage::{SqliteStorage, Storage};
use integration_broker::{BrokerError, Result};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

pub const BINDING_SECRET: &str = "integration-test-binding-secret-0123456789abcdef";
pub const WEBHOOK_SECRET: &str = "integration-test-webhook-secret";
pub const GITHUB_CLIENT_ID: &str = "Iv1.test-client";

/// Token endpoint double that issues sequential tokens and counts calls
pub struct CountingTokenEndpoint {
    exchanges: AtomicUsize,
    refreshes: AtomicUsize,
    issued: AtomicUsize,
    fail_refresh: AtomicBool,
    refresh_delay: Mutex<Duration>,
    expires_in: Mutex<ChronoDuration>,
    pub last_verifier: Mutex<Option<String>>,
}

impl CountingTokenEndpoint {
    pub fn new() -> Self {
        Self {
            exchanges: AtomicUsize::new(0),
            refreshes: AtomicUsize::new(0),
            issued: AtomicUsize::new(0),
            fail_refresh: AtomicBool::new(false),
            refresh_delay: Mutex::new(Duration::ZERO),
            expires_in: Mutex::new(ChronoDuration::hours(1)),
            last_verifier: Mutex::new(None),
        }
    }

    pub fn exchanges(&self) -> usize {
        self.exchanges.load(Ordering::SeqCst)
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    pub fn fail_refreshes(&self, fail: bool) {
        self.fail_refresh.store(fail, Ordering::SeqCst);
    }

    /// Lifetime of tokens issued from now on
    pub fn issue_lifetime(&self, lifetime: ChronoDuration) {
        *self.expires_in.lock() = lifetime;
    }

    pub fn delay_refreshes(&self, delay: Duration) {
        *self.refresh_delay.lock() = delay;
    }

    fn next_tokens(&self) -> TokenSet {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        TokenSet {
            access_token: format!("access-{}", n),
            refresh_token: Some(format!("refresh-{}", n)),
            token_type: "Bearer".to_string(),
            expires_in: Some(*self.expires_in.lock()),
            scopes: None,
        }
    }
}

#[async_trait]
impl TokenEndpoint for CountingTokenEndpoint {
    async fn exchange_code(
        &self,
        provider: &str,
        _oauth: &OAuthSpec,
        code: &str,
        pkce_verifier: Option<&str>,
    ) -> Result<TokenSet> {
        self.exchanges.fetch_add(1, Ordering::SeqCst);
        *self.last_verifier.lock() = pkce_verifier.map(str::to_string);
        if code == "bad-code" {
            return Err(BrokerError::CodeExchangeFailed {
                provider: provider.to_string(),
                reason: "bad_verification_code".to_string(),
            });
        }
        Ok(self.next_tokens())
    }

    async fn refresh(
        &self,
        provider: &str,
        _oauth: &OAuthSpec,
        _refresh_token: &str,
    ) -> Result<TokenSet> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        let delay = *self.refresh_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_refresh.load(Ordering::SeqCst) {
            return Err(BrokerError::RefreshFailed {
                provider: provider.to_string(),
                reason: "invalid_grant".to_string(),
            });
        }
        Ok(self.next_tokens())
    }
}

/// Configuration with GitHub connected and a webhook secret set
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.providers = vec![ProviderOverride {
        name: "github".to_string(),
        client_id: Some(GITHUB_CLIENT_ID.to_string()),
        client_secret: Some("test-client-secret".to_string()),
        webhook_secret: Some(WEBHOOK_SECRET.to_string()),
        ..Default::default()
    }];
    config
}

/// The whole broker wired for tests
pub struct TestHarness {
    pub config: Config,
    pub storage: Arc<dyn Storage>,
    pub registry: Arc<ProviderRegistry>,
    pub clock: Arc<FixedClock>,
    pub tokens: Arc<CountingTokenEndpoint>,
    pub binding: Arc<SignedBinding>,
    pub coordinator: Arc<OAuthCoordinator>,
    pub broker: Arc<CredentialBroker>,
    pub runner: Arc<OperationRunner>,
    pub webhooks: Arc<WebhookIngestor>,
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::build(test_config(), Vec::new()).await
    }

    /// Built-in providers plus `extra` definitions
    pub async fn with_providers(extra: Vec<ProviderDefinition>) -> Self {
        Self::build(test_config(), extra).await
    }

    /// Built-in providers over a database file under `dir`
    pub async fn on_disk(dir: &Path) -> Self {
        let dsn = dir.join("broker.db");
        Self::build_at(test_config(), Vec::new(), dsn.to_str().expect("utf-8 path")).await
    }

    pub async fn build(config: Config, extra: Vec<ProviderDefinition>) -> Self {
        Self::build_at(config, extra, ":memory:").await
    }

    pub async fn build_at(config: Config, extra: Vec<ProviderDefinition>, dsn: &str) -> Self {
        let storage: Arc<dyn Storage> = Arc::new(
            SqliteStorage::new(dsn, CredentialEncryption::for_testing())
                .await
                .expect("test storage"),
        );

        let mut definitions = builtin_definitions(&config).expect("builtin providers");
        definitions.extend(extra);
        let registry = Arc::new(ProviderRegistry::new(definitions).expect("registry"));

        let clock = Arc::new(FixedClock::new(Utc::now()));
        let tokens = Arc::new(CountingTokenEndpoint::new());
        let secret = ValidatedSecret::from_string(BINDING_SECRET.to_string()).expect("secret");
        let binding = Arc::new(SignedBinding::new(&secret, "integration-broker-test"));

        let coordinator = Arc::new(
            OAuthCoordinator::new(
                registry.clone(),
                storage.clone(),
                tokens.clone(),
                binding.clone(),
            )
            .with_clock(clock.clone()),
        );
        let broker = Arc::new(
            CredentialBroker::new(registry.clone(), storage.clone(), tokens.clone())
                .with_clock(clock.clone()),
        );
        let runner = Arc::new(
            OperationRunner::new(registry.clone(), broker.clone(), storage.clone())
                .with_debounce(Duration::from_secs(config.operations.debounce_seconds)),
        );
        let webhooks = Arc::new(
            WebhookIngestor::new(
                registry.clone(),
                storage.clone(),
                config.http.max_webhook_body_bytes,
            )
            .with_clock(clock.clone()),
        );

        Self {
            config,
            storage,
            registry,
            clock,
            tokens,
            binding,
            coordinator,
            broker,
            runner,
            webhooks,
        }
    }

    /// A coordinator over the same stores that health-checks new connections
    pub fn health_checked_coordinator(&self) -> OAuthCoordinator {
        OAuthCoordinator::new(
            self.registry.clone(),
            self.storage.clone(),
            self.tokens.clone(),
            self.binding.clone(),
        )
        .with_clock(self.clock.clone())
        .with_health_check(self.runner.clone())
    }

    pub fn router(&self) -> Router {
        self.router_with(self.config.http.clone())
    }

    pub fn router_with(&self, http: HttpConfig) -> Router {
        create_router(AppState {
            registry: self.registry.clone(),
            storage: self.storage.clone(),
            coordinator: self.coordinator.clone(),
            broker: self.broker.clone(),
            runner: self.runner.clone(),
            webhooks: self.webhooks.clone(),
            http: Arc::new(http),
        })
    }

    /// Store an OAuth credential expiring `expires_in` from the harness clock
    pub async fn seed_oauth_credential(
        &self,
        org_id: &str,
        provider: &str,
        access_token: &str,
        expires_in: ChronoDuration,
    ) {
        let now = self.clock.now();
        self.storage
            .save_credential(&Credential {
                org_id: org_id.to_string(),
                provider: provider.to_string(),
                payload: CredentialPayload::OAuthToken(OAuthToken {
                    access_token: access_token.to_string(),
                    refresh_token: Some(format!("{}-refresh", access_token)),
                    token_type: "Bearer".to_string(),
                    expires_at: Some(now + expires_in),
                    issued_at: None,
                    scopes: vec!["repo".to_string()],
                }),
                updated_at: now,
            })
            .await
            .expect("seed credential");
    }

    /// A binding for `nonce` carrying someone else's identity
    pub fn forged_binding(&self, nonce: &str, org_id: &str, user_id: &str, provider: &str) -> String {
        self.binding
            .issue_binding(&BindingClaims {
                nonce: nonce.to_string(),
                org_id: org_id.to_string(),
                user_id: user_id.to_string(),
                provider: provider.to_string(),
                expires_at: Utc::now() + ChronoDuration::minutes(5),
            })
            .expect("binding")
    }
}

/// Signature header value for a webhook body
pub fn github_signature(body: &[u8]) -> String {
    sign_payload(WEBHOOK_SECRET, body).expect("signature")
}
