use integration_broker::auth::{
    CredentialEncryption, OAuth2TokenEndpoint, SignedBinding, StateBinding, TokenEndpoint,
    ValidatedSecret,
};
use integration_broker::broker::CredentialBroker;
use integration_broker::config::Config;
use integration_broker::http::webhook::WebhookIngestor;
use integration_broker::http::{AppState, create_router};
use integration_broker::oauth::OAuthCoordinator;
use integration_broker::operations::OperationRunner;
use integration_broker::registry::ProviderRegistry;
use integration_broker::storage::create_storage_from_config;
use integration_broker::{Result, telemetry};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::{net::TcpListener, signal};

const STATE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;
    telemetry::init_tracing(config.http.dev_mode);

    let encryption = CredentialEncryption::from_env()?;
    let binding_secret = ValidatedSecret::from_env()?;
    let binding: Arc<dyn StateBinding> = Arc::new(SignedBinding::new(
        &binding_secret,
        config.oauth.binding_issuer.clone(),
    ));

    let storage = create_storage_from_config(&config.storage, encryption).await?;
    let registry = Arc::new(ProviderRegistry::builtin(&config)?);
    let token_endpoint: Arc<dyn TokenEndpoint> = Arc::new(OAuth2TokenEndpoint::new()?);

    let broker = Arc::new(
        CredentialBroker::new(registry.clone(), storage.clone(), token_endpoint.clone())
            .with_skew(chrono::Duration::seconds(config.oauth.refresh_skew_seconds)),
    );
    let runner = Arc::new(
        OperationRunner::new(registry.clone(), broker.clone(), storage.clone())
            .with_debounce(Duration::from_secs(config.operations.debounce_seconds)),
    );
    let coordinator = Arc::new(
        OAuthCoordinator::new(registry.clone(), storage.clone(), token_endpoint, binding)
            .with_state_ttl(chrono::Duration::minutes(config.oauth.state_ttl_minutes))
            .with_health_check(runner.clone()),
    );
    let webhooks = Arc::new(WebhookIngestor::new(
        registry.clone(),
        storage.clone(),
        config.http.max_webhook_body_bytes,
    ));

    spawn_state_sweeper(coordinator.clone());

    let addr = format!("{}:{}", config.http.host, config.http.port);
    let app = create_router(AppState {
        registry: registry.clone(),
        storage,
        coordinator,
        broker,
        runner,
        webhooks,
        http: Arc::new(config.http),
    });

    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, providers = registry.len(), "Integration broker listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Periodically delete abandoned authorization states
fn spawn_state_sweeper(coordinator: Arc<OAuthCoordinator>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATE_SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            if let Err(e) = coordinator.sweep_expired_states().await {
                tracing::error!(error = %e, "Authorization state sweep failed");
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        },
    }
}
