//! GitHub provider
//!
//! OAuth app authorization plus two operations: a token health check and
//! collection of Dependabot, code scanning and secret scanning alerts.

use super::{ApiClient, access_token, base_url, config_bool, config_str, config_strings, config_usize};
use crate::model::{
    AlertEnvelope, AlertType, AuthType, OAuthSpec, OperationDescriptor, OperationResult,
    ProviderSpec,
};
use crate::registry::{OperationContext, OperationHandler, ProviderDefinition};
use crate::{BrokerError, Result};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub const PROVIDER: &str = "github";
pub const OPERATION_HEALTH: &str = "health.default";
pub const OPERATION_COLLECT: &str = "vulnerabilities.collect";

const DEFAULT_API_BASE: &str = "https://api.github.com";
const PER_PAGE: usize = 100;
const MAX_PAGES: usize = 10;
const COLLECT_MIN_TIMEOUT: Duration = Duration::from_secs(120);

pub fn definition(timeout: Duration) -> Result<ProviderDefinition> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
    headers.insert("X-GitHub-Api-Version", HeaderValue::from_static("2022-11-28"));
    let api = ApiClient::new(PROVIDER, headers)?;

    let spec = ProviderSpec {
        name: PROVIDER.to_string(),
        display_name: "GitHub".to_string(),
        description: "Source control, Dependabot, code scanning and secret scanning alerts"
            .to_string(),
        auth_type: AuthType::OAuth2,
        credential_schema: Value::Null,
        oauth: Some(OAuthSpec {
            auth_url: "https://github.com/login/oauth/authorize".to_string(),
            token_url: "https://github.com/login/oauth/access_token".to_string(),
            redirect_uri: String::new(),
            scopes: vec![
                "repo".to_string(),
                "read:org".to_string(),
                "security_events".to_string(),
            ],
            pkce: false,
            client_id: String::new(),
            client_secret: None,
            auth_params: HashMap::new(),
            install_url: None,
        }),
        operations: vec![
            OperationDescriptor::new(OPERATION_HEALTH, timeout)
                .with_description("Validate the token by fetching the authenticated user"),
            OperationDescriptor::new(OPERATION_COLLECT, timeout.max(COLLECT_MIN_TIMEOUT))
                .with_description("Collect repository security alerts as alert envelopes")
                .with_scopes(&["repo", "security_events"]),
        ],
        active: true,
        webhook_secret: None,
        api_base_url: Some(DEFAULT_API_BASE.to_string()),
    };

    Ok(ProviderDefinition::new(spec)
        .handler(OPERATION_HEALTH, Arc::new(Health { api: api.clone() }))
        .handler(OPERATION_COLLECT, Arc::new(CollectVulnerabilities { api })))
}

struct Health {
    api: ApiClient,
}

#[async_trait]
impl OperationHandler for Health {
    async fn execute(&self, ctx: OperationContext<'_>) -> Result<OperationResult> {
        let token = access_token(&ctx)?;
        let base = base_url(ctx.provider, DEFAULT_API_BASE);

        let user = self.api.get(&format!("{}/user", base), token, &[]).await?;
        let login = user.get("login").and_then(Value::as_str).unwrap_or("unknown");

        Ok(OperationResult::ok(format!("GitHub token valid for {}", login))
            .with_detail("login", json!(login))
            .with_detail("id", user.get("id").cloned().unwrap_or(Value::Null)))
    }
}

struct CollectVulnerabilities {
    api: ApiClient,
}

impl CollectVulnerabilities {
    /// Follow `page` pagination until a short page or the page cap
    async fn paged(
        &self,
        url: &str,
        token: &str,
        extra: &[(&str, String)],
    ) -> Result<Vec<Value>> {
        let mut items = Vec::new();
        for page in 1..=MAX_PAGES {
            let mut query = vec![
                ("per_page", PER_PAGE.to_string()),
                ("page", page.to_string()),
            ];
            query.extend(extra.iter().cloned());

            let batch = match self.api.get(url, token, &query).await? {
                Value::Array(batch) => batch,
                other => {
                    return Err(BrokerError::ProviderApi {
                        provider: PROVIDER.to_string(),
                        reason: format!("expected a list, got {}", json_kind(&other)),
                    });
                }
            };
            let short = batch.len() < PER_PAGE;
            items.extend(batch);
            if short {
                break;
            }
        }
        Ok(items)
    }

    async fn repositories(&self, base: &str, token: &str) -> Result<Vec<String>> {
        let repos = self
            .paged(&format!("{}/user/repos", base), token, &[])
            .await?;
        Ok(repos
            .iter()
            .filter_map(|r| r.get("full_name").and_then(Value::as_str))
            .map(str::to_string)
            .collect())
    }
}

#[async_trait]
impl OperationHandler for CollectVulnerabilities {
    async fn execute(&self, ctx: OperationContext<'_>) -> Result<OperationResult> {
        let token = access_token(&ctx)?;
        let base = base_url(ctx.provider, DEFAULT_API_BASE);
        let config = ctx.config;

        let alert_types = requested_alert_types(config)?;
        let mut repositories = config_strings(config, "repositories");
        if repositories.is_empty() {
            repositories = self.repositories(base, token).await?;
        }
        if let Some(max) = config_usize(config, "max_repositories") {
            repositories.truncate(max);
        }

        if repositories.is_empty() {
            return Ok(OperationResult::ok("No repositories available for vulnerability alerts")
                .with_detail("repositories_scanned", json!(0))
                .with_detail("alerts_total", json!(0)));
        }

        let state_filter: Vec<(&str, String)> = config_str(config, "alert_state")
            .map(|state| vec![("state", state.to_lowercase())])
            .unwrap_or_default();

        let mut envelopes = Vec::new();
        let mut counts: Map<String, Value> = Map::new();
        for repo in &repositories {
            for alert_type in &alert_types {
                let url = format!("{}/repos/{}/{}", base, repo, alerts_path(*alert_type));
                let batch = self.paged(&url, token, &state_filter).await?;

                let count = counts
                    .entry(alert_type.as_str())
                    .or_insert_with(|| json!(0));
                *count = json!(count.as_u64().unwrap_or(0) + batch.len() as u64);

                envelopes.extend(batch.into_iter().map(|payload| AlertEnvelope {
                    alert_type: *alert_type,
                    resource: repo.clone(),
                    action: "sync".to_string(),
                    payload,
                }));
            }
        }

        let total = envelopes.len();
        let mut result = OperationResult::ok(format!(
            "Collected {} vulnerability alerts from {} repositories",
            total,
            repositories.len()
        ))
        .with_detail("repositories_scanned", json!(repositories.len()))
        .with_detail("alerts_total", json!(total))
        .with_detail("alert_type_counts", Value::Object(counts));

        if config_bool(config, "include_payloads") {
            result = result.with_detail("alerts", serde_json::to_value(&envelopes)?);
        }

        tracing::debug!(
            org_id = ctx.org_id,
            repositories = repositories.len(),
            alerts = total,
            "Collected GitHub alerts"
        );

        Ok(result)
    }
}

fn alerts_path(alert_type: AlertType) -> &'static str {
    match alert_type {
        AlertType::Dependabot => "dependabot/alerts",
        AlertType::CodeScanning => "code-scanning/alerts",
        AlertType::SecretScanning => "secret-scanning/alerts",
    }
}

/// Alert types named in `alert_types`, defaulting to all of them
fn requested_alert_types(config: &Value) -> Result<Vec<AlertType>> {
    let names = config_strings(config, "alert_types");
    if names.is_empty() {
        return Ok(AlertType::ALL.to_vec());
    }

    let mut types = Vec::with_capacity(names.len());
    for name in &names {
        let alert_type = AlertType::parse(name)
            .ok_or_else(|| BrokerError::validation(format!("Unknown alert type: {}", name)))?;
        if !types.contains(&alert_type) {
            types.push(alert_type);
        }
    }
    Ok(types)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requested_alert_types_default_to_all() {
        assert_eq!(
            requested_alert_types(&Value::Null).unwrap(),
            AlertType::ALL.to_vec()
        );
    }

    #[test]
    fn test_requested_alert_types_parse_and_dedupe() {
        let types = requested_alert_types(&json!({
            "alert_types": ["secret-scanning", "dependabot_alert", "secret_scanning"]
        }))
        .unwrap();
        assert_eq!(types, vec![AlertType::SecretScanning, AlertType::Dependabot]);
    }

    #[test]
    fn test_unknown_alert_type_rejected() {
        let err = requested_alert_types(&json!({"alert_types": ["pull_request"]})).unwrap_err();
        assert!(matches!(err, BrokerError::Validation(_)));
    }

    #[test]
    fn test_definition_declares_collect_with_longer_timeout() {
        let definition = definition(Duration::from_secs(30)).unwrap();
        let collect = definition
            .spec
            .operations
            .iter()
            .find(|op| op.name == OPERATION_COLLECT)
            .unwrap();
        assert_eq!(collect.timeout, COLLECT_MIN_TIMEOUT);
        assert!(definition.handlers.contains_key(OPERATION_HEALTH));
    }
}
