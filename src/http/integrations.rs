//! Integration management routes
//!
//! Every route except the OAuth callback requires a [`RequestContext`]. The
//! callback arrives from the provider's redirect without tenant headers and is
//! authenticated by the binding cookie issued at start.

use super::AppState;
use crate::auth::RequestContext;
use crate::model::{AuthType, Credential, CredentialPayload, ProviderSpec, ProviderSummary};
use crate::oauth::BeginOAuth;
use crate::operations::RunRequest;
use crate::{BrokerError, Result};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, header},
    response::{IntoResponse, Redirect, Response},
    routing::{delete, get, post},
};
use chrono::Utc;
use jsonschema::error::ValidationErrorKind;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

pub const BINDING_COOKIE: &str = "integration_oauth_binding";

pub fn create_integration_routes() -> Router<AppState> {
    Router::new()
        .route("/integrations/providers", get(list_providers_handler))
        .route("/integrations/oauth/start", post(start_oauth_handler))
        .route("/integrations/oauth/callback", get(oauth_callback_handler))
        .route("/integrations/{provider}/install", post(start_install_handler))
        .route("/integrations/credentials", post(save_credentials_handler))
        .route(
            "/integrations/{provider}/credentials",
            delete(disconnect_handler),
        )
        .route("/integrations/{provider}/refresh", post(refresh_handler))
        .route("/integrations/operations/run", post(run_operation_handler))
}

// ============================================================================
// Provider discovery
// ============================================================================

#[derive(Serialize)]
struct ProviderListing {
    #[serde(flatten)]
    summary: ProviderSummary,
    connected: bool,
}

async fn list_providers_handler(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<Json<Value>> {
    let mut providers = Vec::new();
    for summary in state.registry.list() {
        let connected = state
            .storage
            .credential_exists(&ctx.organization_id, &summary.name)
            .await?;
        providers.push(ProviderListing { summary, connected });
    }
    Ok(Json(json!({ "providers": providers })))
}

// ============================================================================
// OAuth
// ============================================================================

#[derive(Debug, Deserialize)]
struct StartOAuthRequest {
    provider: String,
    #[serde(default)]
    scopes: Vec<String>,
}

async fn start_oauth_handler(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(request): Json<StartOAuthRequest>,
) -> Result<Response> {
    let begun = state
        .coordinator
        .begin_oauth(
            &ctx.organization_id,
            &ctx.user_id,
            &request.provider,
            &request.scopes,
        )
        .await?;

    started(&state, begun, "auth_url")
}

/// Start a GitHub App style installation; the callback route finishes it
async fn start_install_handler(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(provider): Path<String>,
) -> Result<Response> {
    let begun = state
        .coordinator
        .begin_installation(&ctx.organization_id, &ctx.user_id, &provider)
        .await?;

    started(&state, begun, "install_url")
}

fn started(state: &AppState, begun: BeginOAuth, url_field: &str) -> Result<Response> {
    let max_age = state.coordinator.state_ttl().num_seconds();
    let cookie = binding_cookie(&begun.binding, max_age, state.http.dev_mode)?;

    let mut body = Map::new();
    body.insert(url_field.to_string(), json!(begun.auth_url));
    body.insert("state".to_string(), json!(begun.state));
    body.insert("expires_at".to_string(), json!(begun.expires_at));

    Ok(([(header::SET_COOKIE, cookie)], Json(Value::Object(body))).into_response())
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    installation_id: Option<String>,
    error: Option<String>,
}

async fn oauth_callback_handler(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
    headers: HeaderMap,
) -> Response {
    let clear = match binding_cookie("", 0, state.http.dev_mode) {
        Ok(cookie) => cookie,
        Err(e) => return e.into_response(),
    };

    let result = complete_callback(&state, &params, &headers).await;
    let redirect_base = state.http.success_redirect_url.as_deref();

    match result {
        Ok(provider) => {
            let message = format!("Successfully connected {} integration", provider);
            match redirect_base.and_then(|base| {
                redirect_url(
                    base,
                    &[
                        ("provider", provider.as_str()),
                        ("status", "success"),
                        ("message", message.as_str()),
                    ],
                )
            }) {
                Some(url) => ([(header::SET_COOKIE, clear)], Redirect::to(&url)).into_response(),
                None => (
                    [(header::SET_COOKIE, clear)],
                    Json(json!({ "success": true, "provider": provider })),
                )
                    .into_response(),
            }
        }
        Err(e) => {
            tracing::warn!(kind = e.kind(), "OAuth callback failed");
            let message = e.public_message();
            match redirect_base
                .and_then(|base| redirect_url(base, &[("status", "error"), ("message", message.as_str())]))
            {
                Some(url) => ([(header::SET_COOKIE, clear)], Redirect::to(&url)).into_response(),
                None => ([(header::SET_COOKIE, clear)], e).into_response(),
            }
        }
    }
}

async fn complete_callback(
    state: &AppState,
    params: &CallbackParams,
    headers: &HeaderMap,
) -> Result<String> {
    let binding = read_cookie(headers, BINDING_COOKIE)
        .ok_or_else(|| BrokerError::binding("binding cookie missing"))?;
    let nonce = params
        .state
        .as_deref()
        .ok_or(BrokerError::StateNotFound)?;

    if let Some(error) = params.error.as_deref() {
        tracing::warn!(provider_error = %error, "Provider returned an OAuth error");
        state.coordinator.cancel_oauth(binding, nonce).await?;
        return Err(BrokerError::AuthorizationDenied);
    }

    let completed = state
        .coordinator
        .complete_oauth_for_installation(
            binding,
            nonce,
            params.code.as_deref().unwrap_or_default(),
            params.installation_id.as_deref(),
        )
        .await?;

    Ok(completed.provider)
}

fn binding_cookie(value: &str, max_age: i64, dev_mode: bool) -> Result<HeaderValue> {
    let attributes = if dev_mode {
        "SameSite=Lax"
    } else {
        "SameSite=None; Secure"
    };
    let cookie = format!(
        "{}={}; Path=/; HttpOnly; Max-Age={}; {}",
        BINDING_COOKIE,
        value,
        max_age.max(0),
        attributes
    );
    HeaderValue::from_str(&cookie)
        .map_err(|e| BrokerError::internal(format!("Invalid cookie value: {}", e)))
}

fn read_cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
}

fn redirect_url(base: &str, params: &[(&str, &str)]) -> Option<String> {
    match url::Url::parse(base) {
        Ok(mut url) => {
            url.query_pairs_mut().extend_pairs(params);
            Some(url.to_string())
        }
        Err(e) => {
            tracing::error!(error = %e, "Invalid success redirect URL");
            None
        }
    }
}

// ============================================================================
// Credentials
// ============================================================================

#[derive(Debug, Deserialize)]
struct SaveCredentialsRequest {
    provider: String,
    payload: Map<String, Value>,
}

async fn save_credentials_handler(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(request): Json<SaveCredentialsRequest>,
) -> Result<Json<Value>> {
    let spec = registered(&state, &request.provider)?;
    if !spec.active {
        return Err(BrokerError::ProviderInactive(spec.name.clone()));
    }
    if spec.auth_type != AuthType::Static {
        return Err(BrokerError::UnsupportedAuthType {
            provider: spec.name.clone(),
            auth_type: AuthType::Static.to_string(),
        });
    }
    validate_against_schema(&spec.credential_schema, &request.payload)?;

    state
        .storage
        .save_credential(&Credential {
            org_id: ctx.organization_id.clone(),
            provider: spec.name.clone(),
            payload: CredentialPayload::StaticConfig(request.payload),
            updated_at: Utc::now(),
        })
        .await?;
    let integration = state
        .storage
        .ensure_integration(&ctx.organization_id, &spec.name, None)
        .await?;

    state.runner.invalidate(&ctx.organization_id, &spec.name);
    if let Err(e) = state
        .runner
        .check_health(&ctx.organization_id, &spec.name)
        .await
    {
        state
            .storage
            .delete_credential(&ctx.organization_id, &spec.name)
            .await?;
        return Err(e);
    }

    tracing::info!(
        org_id = %ctx.organization_id,
        provider = %spec.name,
        request_id = %ctx.request_id,
        "Stored static credentials"
    );

    Ok(Json(json!({
        "success": true,
        "provider": spec.name,
        "integration_id": integration.id,
    })))
}

async fn disconnect_handler(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(provider): Path<String>,
) -> Result<Json<Value>> {
    let spec = registered(&state, &provider)?;
    if !state
        .storage
        .delete_credential(&ctx.organization_id, &spec.name)
        .await?
    {
        return Err(BrokerError::CredentialNotFound(spec.name.clone()));
    }
    state.runner.invalidate(&ctx.organization_id, &spec.name);

    tracing::info!(org_id = %ctx.organization_id, provider = %spec.name, "Disconnected provider");
    Ok(Json(json!({ "success": true, "provider": spec.name })))
}

async fn refresh_handler(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(provider): Path<String>,
) -> Result<Json<Value>> {
    let spec = registered(&state, &provider)?;
    let token = state.broker.refresh(&ctx.organization_id, &spec.name).await?;
    Ok(Json(json!({
        "success": true,
        "provider": spec.name,
        "expires_at": token.expires_at,
    })))
}

fn registered<'a>(state: &'a AppState, provider: &str) -> Result<&'a ProviderSpec> {
    state
        .registry
        .config(provider)
        .ok_or_else(|| BrokerError::ProviderNotRegistered(provider.to_string()))
}

/// Validate a static credential against the provider's JSON Schema
///
/// Blank strings and nulls count as absent, so a blank required field is a
/// [`BrokerError::MissingField`]. A null schema accepts any payload.
pub fn validate_against_schema(schema: &Value, payload: &Map<String, Value>) -> Result<()> {
    if schema.is_null() {
        return Ok(());
    }
    let validator = jsonschema::validator_for(schema)
        .map_err(|e| BrokerError::config(format!("Invalid credential schema: {}", e)))?;

    let instance = Value::Object(
        payload
            .iter()
            .filter(|(_, value)| match value {
                Value::Null => false,
                Value::String(s) => !s.trim().is_empty(),
                _ => true,
            })
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
    );

    let Some(error) = validator.iter_errors(&instance).next() else {
        return Ok(());
    };
    match &error.kind {
        ValidationErrorKind::Required { property } => Err(BrokerError::missing_field(
            property.as_str().map(str::to_string).unwrap_or_else(|| property.to_string()),
        )),
        _ => {
            let path = error.instance_path.to_string();
            let field = path.trim_start_matches('/');
            Err(BrokerError::validation(if field.is_empty() {
                error.to_string()
            } else {
                format!("Field '{}' is invalid: {}", field, error)
            }))
        }
    }
}

// ============================================================================
// Operations
// ============================================================================

#[derive(Debug, Deserialize)]
struct RunOperationRequest {
    provider: String,
    operation: String,
    #[serde(default)]
    config: Value,
    #[serde(default)]
    force: bool,
    #[serde(default)]
    ingest: bool,
}

async fn run_operation_handler(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(request): Json<RunOperationRequest>,
) -> Result<Json<Value>> {
    let run = RunRequest {
        org_id: ctx.organization_id.clone(),
        provider: request.provider,
        operation: request.operation,
        config: request.config,
        force: request.force,
    };

    let result = if request.ingest {
        let integration = state
            .storage
            .get_integration(&run.org_id, &run.provider)
            .await?;
        state
            .runner
            .run_and_ingest(&run, integration.as_ref().map(|i| i.id.as_str()))
            .await?
    } else {
        state.runner.run(&run).await?
    };

    Ok(Json(serde_json::to_value(result)?))
}
