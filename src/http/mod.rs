//! HTTP surface
//!
//! - `/integrations/*`: provider discovery, OAuth start/callback, static
//!   credentials, disconnect, forced refresh and operation runs
//! - `/webhooks/github`: signed alert deliveries

pub mod integrations;
pub mod webhook;


use crate::broker::CredentialBroker;
use crate::config::HttpConfig;
use crate::oauth::OAuthCoordinator;
use crate::operations::OperationRunner;
use crate::registry::ProviderRegistry;
use crate::storage::Storage;
use axum::Router;
use std::sync::Arc;
use webhook::WebhookIngestor;

/// Shared dependencies for every handler
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ProviderRegistry>,
    pub storage: Arc<dyn Storage>,
    pub coordinator: Arc<OAuthCoordinator>,
    pub broker: Arc<CredentialBroker>,
    pub runner: Arc<OperationRunner>,
    pub webhooks: Arc<WebhookIngestor>,
    pub http: Arc<HttpConfig>,
}

pub fn create_router(state: AppState) -> Router {
    let max_body = state.http.max_webhook_body_bytes;
    Router::new()
        .merge(integrations::create_integration_routes())
        .merge(webhook::create_webhook_routes(max_body))
        .with_state(state)
}
