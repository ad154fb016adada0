//! Slack provider

use super::{ApiClient, access_token, base_url};
use crate::model::{AuthType, OAuthSpec, OperationDescriptor, OperationResult, ProviderSpec};
use crate::registry::{OperationContext, OperationHandler, ProviderDefinition};
use crate::{BrokerError, Result};
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub const PROVIDER: &str = "slack";
pub const OPERATION_HEALTH: &str = "health.default";
pub const OPERATION_TEAM_INFO: &str = "team.info";

const DEFAULT_API_BASE: &str = "https://slack.com";

pub fn definition(timeout: Duration) -> Result<ProviderDefinition> {
    let api = ApiClient::new(PROVIDER, HeaderMap::new())?;

    let spec = ProviderSpec {
        name: PROVIDER.to_string(),
        display_name: "Slack".to_string(),
        description: "Workspace messaging".to_string(),
        auth_type: AuthType::OAuth2,
        credential_schema: Value::Null,
        oauth: Some(OAuthSpec {
            auth_url: "https://slack.com/oauth/v2/authorize".to_string(),
            token_url: "https://slack.com/api/oauth.v2.access".to_string(),
            redirect_uri: String::new(),
            scopes: vec!["team:read".to_string(), "users:read".to_string()],
            pkce: false,
            client_id: String::new(),
            client_secret: None,
            auth_params: HashMap::new(),
            install_url: None,
        }),
        operations: vec![
            OperationDescriptor::new(OPERATION_HEALTH, timeout)
                .with_description("Validate the token with auth.test"),
            OperationDescriptor::new(OPERATION_TEAM_INFO, timeout)
                .with_description("Fetch workspace details")
                .with_scopes(&["team:read"]),
        ],
        active: true,
        webhook_secret: None,
        api_base_url: Some(DEFAULT_API_BASE.to_string()),
    };

    Ok(ProviderDefinition::new(spec)
        .handler(OPERATION_HEALTH, Arc::new(AuthTest { api: api.clone() }))
        .handler(OPERATION_TEAM_INFO, Arc::new(TeamInfo { api })))
}

/// Slack reports failures as `{"ok": false, "error": "..."}` with a 200 status
fn check_ok(response: Value, method: &str) -> Result<Value> {
    if response.get("ok").and_then(Value::as_bool) == Some(true) {
        return Ok(response);
    }
    let error = response
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("unknown_error");
    Err(BrokerError::ProviderApi {
        provider: PROVIDER.to_string(),
        reason: format!("{} failed: {}", method, error),
    })
}

struct AuthTest {
    api: ApiClient,
}

#[async_trait]
impl OperationHandler for AuthTest {
    async fn execute(&self, ctx: OperationContext<'_>) -> Result<OperationResult> {
        let token = access_token(&ctx)?;
        let base = base_url(ctx.provider, DEFAULT_API_BASE);

        let response = self
            .api
            .post(&format!("{}/api/auth.test", base), token)
            .await?;
        let response = check_ok(response, "auth.test")?;

        let team = response.get("team").and_then(Value::as_str).unwrap_or("unknown");
        Ok(OperationResult::ok(format!("Slack token valid for workspace {}", team))
            .with_detail("team", json!(team))
            .with_detail("team_id", response.get("team_id").cloned().unwrap_or(Value::Null))
            .with_detail("user", response.get("user").cloned().unwrap_or(Value::Null)))
    }
}

struct TeamInfo {
    api: ApiClient,
}

#[async_trait]
impl OperationHandler for TeamInfo {
    async fn execute(&self, ctx: OperationContext<'_>) -> Result<OperationResult> {
        let token = access_token(&ctx)?;
        let base = base_url(ctx.provider, DEFAULT_API_BASE);

        let response = self
            .api
            .get(&format!("{}/api/team.info", base), token, &[])
            .await?;
        let response = check_ok(response, "team.info")?;

        let team = response.get("team").cloned().unwrap_or(Value::Null);
        let name = team.get("name").and_then(Value::as_str).unwrap_or("unknown");
        Ok(OperationResult::ok(format!("Fetched Slack workspace {}", name))
            .with_detail("team", json!({
                "id": team.get("id"),
                "name": team.get("name"),
                "domain": team.get("domain"),
            })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_ok_surfaces_slack_error() {
        let err = check_ok(json!({"ok": false, "error": "invalid_auth"}), "auth.test").unwrap_err();
        assert!(err.to_string().contains("invalid_auth"));
        assert_eq!(err.kind(), "provider_api");
    }

    #[test]
    fn test_check_ok_passes_success() {
        assert!(check_ok(json!({"ok": true, "team": "Acme"}), "auth.test").is_ok());
    }
}
