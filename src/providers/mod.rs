//! Built-in providers
//!
//! Each submodule contributes a [`ProviderDefinition`]: a spec with sensible
//! public defaults plus handlers for its operations. Deployment specifics
//! (client credentials, redirect URI, webhook secret) come from
//! `config.providers`; an OAuth provider without a client id stays inactive.

pub mod gcp_scc;
pub mod github;
pub mod slack;

use crate::config::{Config, ProviderOverride, expand_env_value};
use crate::model::{CredentialPayload, ProviderSpec};
use crate::registry::{OperationContext, ProviderDefinition};
use crate::{BrokerError, Result};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;
use std::time::Duration;

const HTTP_TIMEOUT_SECS: u64 = 30;
const CLIENT_USER_AGENT: &str = concat!("integration-broker/", env!("CARGO_PKG_VERSION"));

/// Definitions for every built-in provider with `config` overrides applied
pub fn builtin_definitions(config: &Config) -> Result<Vec<ProviderDefinition>> {
    let timeout = Duration::from_secs(config.operations.default_timeout_seconds);
    let default_redirect = format!(
        "http://localhost:{}/integrations/oauth/callback",
        config.http.port
    );

    let mut definitions = vec![
        github::definition(timeout)?,
        gcp_scc::definition(timeout)?,
        slack::definition(timeout)?,
    ];

    for definition in &mut definitions {
        let name = definition.spec.name.clone();
        apply_override(
            &mut definition.spec,
            config.provider_override(&name),
            &default_redirect,
        );
        if !definition.spec.active {
            tracing::info!(provider = %name, "Provider registered inactive");
        }
    }

    for unknown in config
        .providers
        .iter()
        .filter(|o| !definitions.iter().any(|d| d.spec.name == o.name))
    {
        tracing::warn!(provider = %unknown.name, "Ignoring override for unknown provider");
    }

    Ok(definitions)
}

fn expand(value: &Option<String>) -> Option<String> {
    value.as_deref().and_then(expand_env_value)
}

fn apply_override(spec: &mut ProviderSpec, over: Option<&ProviderOverride>, default_redirect: &str) {
    if let Some(over) = over {
        if let Some(base) = expand(&over.api_base_url) {
            spec.api_base_url = Some(base);
        }
        spec.webhook_secret = expand(&over.webhook_secret);

        if let Some(oauth) = spec.oauth.as_mut() {
            if let Some(client_id) = expand(&over.client_id) {
                oauth.client_id = client_id;
            }
            oauth.client_secret = expand(&over.client_secret);
            if let Some(redirect_uri) = expand(&over.redirect_uri) {
                oauth.redirect_uri = redirect_uri;
            }
            if let Some(scopes) = &over.scopes {
                oauth.scopes = scopes.clone();
            }
            if let Some(install_url) = expand(&over.install_url) {
                oauth.install_url = Some(install_url);
            }
        }
    }

    if let Some(oauth) = spec.oauth.as_mut()
        && oauth.redirect_uri.is_empty()
    {
        oauth.redirect_uri = default_redirect.to_string();
    }

    let configured = spec
        .oauth
        .as_ref()
        .is_none_or(|oauth| !oauth.client_id.trim().is_empty());
    spec.active = over.and_then(|o| o.active).unwrap_or(true) && configured;
}

// ============================================================================
// Shared HTTP plumbing for provider APIs
// ============================================================================

/// JSON API client for one provider
#[derive(Clone)]
pub(crate) struct ApiClient {
    provider: &'static str,
    http: reqwest::Client,
}

impl ApiClient {
    pub(crate) fn new(provider: &'static str, mut headers: HeaderMap) -> Result<Self> {
        headers.insert(USER_AGENT, HeaderValue::from_static(CLIENT_USER_AGENT));
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| {
                BrokerError::config(format!("Failed to build HTTP client for {}: {}", provider, e))
            })?;
        Ok(Self { provider, http })
    }

    pub(crate) async fn get(&self, url: &str, token: &str, query: &[(&str, String)]) -> Result<Value> {
        let request = self.http.get(url).bearer_auth(token).query(query);
        self.send("GET", url, request).await
    }

    pub(crate) async fn post(&self, url: &str, token: &str) -> Result<Value> {
        let request = self.http.post(url).bearer_auth(token);
        self.send("POST", url, request).await
    }

    async fn send(&self, method: &str, url: &str, request: reqwest::RequestBuilder) -> Result<Value> {
        let path = url::Url::parse(url)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| url.to_string());

        let response = request.send().await.map_err(|e| {
            let reason = if e.is_timeout() {
                format!("{} {} timed out", method, path)
            } else {
                format!("{} {} could not be sent", method, path)
            };
            self.api_error(reason)
        })?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(provider = self.provider, %status, path = %path, "Provider API error");
            return Err(self.api_error(format!("{} {} returned {}", method, path, status)));
        }

        response
            .json()
            .await
            .map_err(|_| self.api_error(format!("{} {} returned invalid JSON", method, path)))
    }

    fn api_error(&self, reason: String) -> BrokerError {
        BrokerError::ProviderApi {
            provider: self.provider.to_string(),
            reason,
        }
    }
}

/// API base URL for the provider, without a trailing slash
pub(crate) fn base_url<'a>(spec: &'a ProviderSpec, default: &'a str) -> &'a str {
    spec.api_base_url
        .as_deref()
        .unwrap_or(default)
        .trim_end_matches('/')
}

pub(crate) fn access_token<'a>(ctx: &OperationContext<'a>) -> Result<&'a str> {
    ctx.credential
        .and_then(CredentialPayload::access_token)
        .ok_or_else(|| BrokerError::CredentialNotFound(ctx.provider.name.clone()))
}

pub(crate) fn config_bool(config: &Value, key: &str) -> bool {
    config.get(key).and_then(Value::as_bool).unwrap_or(false)
}

pub(crate) fn config_usize(config: &Value, key: &str) -> Option<usize> {
    config
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|n| usize::try_from(n).ok())
        .filter(|n| *n > 0)
}

pub(crate) fn config_str<'a>(config: &'a Value, key: &str) -> Option<&'a str> {
    config
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Non-blank strings from an array config value
pub(crate) fn config_strings(config: &Value, key: &str) -> Vec<String> {
    config
        .get(key)
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn github_override() -> ProviderOverride {
        ProviderOverride {
            name: "github".to_string(),
            client_id: Some("client-abc".to_string()),
            client_secret: Some("secret".to_string()),
            webhook_secret: Some("hook".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_oauth_provider_without_client_id_is_inactive() {
        let definitions = builtin_definitions(&Config::default()).unwrap();
        let github = definitions.iter().find(|d| d.spec.name == "github").unwrap();
        assert!(!github.spec.active);

        let gcp = definitions.iter().find(|d| d.spec.name == "gcp_scc").unwrap();
        assert!(gcp.spec.active);
    }

    #[test]
    fn test_override_activates_and_configures() {
        let config = Config {
            providers: vec![github_override()],
            ..Default::default()
        };
        let definitions = builtin_definitions(&config).unwrap();
        let github = &definitions.iter().find(|d| d.spec.name == "github").unwrap().spec;

        assert!(github.active);
        let oauth = github.oauth.as_ref().unwrap();
        assert_eq!(oauth.client_id, "client-abc");
        assert_eq!(oauth.client_secret.as_deref(), Some("secret"));
        assert_eq!(oauth.redirect_uri, "http://localhost:8080/integrations/oauth/callback");
        assert_eq!(github.webhook_secret.as_deref(), Some("hook"));
        assert_eq!(oauth.install_url, None);
    }

    #[test]
    fn test_override_sets_app_install_url() {
        let mut over = github_override();
        over.install_url =
            Some("https://github.com/apps/acme-broker/installations/new".to_string());
        let config = Config {
            providers: vec![over],
            ..Default::default()
        };
        let definitions = builtin_definitions(&config).unwrap();
        let oauth = definitions[0].spec.oauth.as_ref().unwrap();
        assert_eq!(
            oauth.install_url.as_deref(),
            Some("https://github.com/apps/acme-broker/installations/new")
        );
    }

    #[test]
    fn test_override_can_deactivate() {
        let mut over = github_override();
        over.active = Some(false);
        let config = Config {
            providers: vec![over],
            ..Default::default()
        };
        let definitions = builtin_definitions(&config).unwrap();
        assert!(!definitions[0].spec.active);
    }

    #[test]
    fn test_config_helpers() {
        let config = json!({
            "repositories": ["acme/api", " ", "acme/web"],
            "include_payloads": true,
            "max_repositories": 0,
            "filter": "  state=\"ACTIVE\" "
        });
        assert_eq!(config_strings(&config, "repositories"), vec!["acme/api", "acme/web"]);
        assert!(config_bool(&config, "include_payloads"));
        assert_eq!(config_usize(&config, "max_repositories"), None);
        assert_eq!(config_str(&config, "filter"), Some("state=\"ACTIVE\""));
        assert!(config_strings(&Value::Null, "repositories").is_empty());
    }
}
