//! Google Cloud Security Command Center provider
//!
//! Uses a static credential: an access token with Security Center read access
//! and the source to collect findings from. There is deliberately no
//! `health.default` operation.

use super::{ApiClient, access_token, base_url, config_bool, config_str, config_usize};
use crate::model::{AuthType, OperationDescriptor, OperationResult, ProviderSpec};
use crate::registry::{OperationContext, OperationHandler, ProviderDefinition};
use crate::{BrokerError, Result};
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

pub const PROVIDER: &str = "gcp_scc";
pub const OPERATION_FINDINGS: &str = "findings.collect";
pub const OPERATION_SETTINGS: &str = "settings.scan";

const DEFAULT_API_BASE: &str = "https://securitycenter.googleapis.com";
const FINDINGS_PAGE_SIZE: usize = 100;
const FINDINGS_MAX_PAGE_SIZE: usize = 1000;
const MAX_SAMPLE: usize = 5;

pub fn definition(timeout: Duration) -> Result<ProviderDefinition> {
    let api = ApiClient::new(PROVIDER, HeaderMap::new())?;

    let spec = ProviderSpec {
        name: PROVIDER.to_string(),
        display_name: "Google Cloud Security Command Center".to_string(),
        description: "Security findings and notification settings from GCP SCC".to_string(),
        auth_type: AuthType::Static,
        credential_schema: json!({
            "type": "object",
            "required": ["access_token", "source_id"],
            "properties": {
                "access_token": {"type": "string"},
                "source_id": {"type": "string"},
                "organization_id": {"type": "string"},
                "filter": {"type": "string"}
            }
        }),
        oauth: None,
        operations: vec![
            OperationDescriptor::new(OPERATION_FINDINGS, timeout)
                .with_description("Collect findings under the configured source"),
            OperationDescriptor::new(OPERATION_SETTINGS, timeout)
                .with_description("Inspect notification configurations for the organization"),
        ],
        active: true,
        webhook_secret: None,
        api_base_url: Some(DEFAULT_API_BASE.to_string()),
    };

    Ok(ProviderDefinition::new(spec)
        .handler(OPERATION_FINDINGS, Arc::new(CollectFindings { api: api.clone() }))
        .handler(OPERATION_SETTINGS, Arc::new(ScanSettings { api })))
}

/// Static credentials carry their token as an attribute rather than an OAuth token
fn static_token<'a>(ctx: &OperationContext<'a>) -> Result<&'a str> {
    ctx.credential
        .and_then(|c| c.attribute("access_token"))
        .map_or_else(|| access_token(ctx), Ok)
}

fn credential_attr<'a>(ctx: &OperationContext<'a>, key: &str) -> Option<&'a str> {
    ctx.credential
        .and_then(|c| c.attribute(key))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Full source resource name; bare ids expand against `organization_id`
fn source_name(ctx: &OperationContext<'_>) -> Result<String> {
    let source = config_str(ctx.config, "source_id")
        .or_else(|| credential_attr(ctx, "source_id"))
        .ok_or_else(|| BrokerError::missing_field("source_id"))?;

    if source.contains('/') {
        return Ok(source.to_string());
    }
    let org = credential_attr(ctx, "organization_id")
        .ok_or_else(|| BrokerError::missing_field("organization_id"))?;
    Ok(format!("organizations/{}/sources/{}", org, source))
}

/// `organizations/<id>` from the credential, or the prefix of the source name
fn organization_parent(ctx: &OperationContext<'_>) -> Result<String> {
    if let Some(org) = credential_attr(ctx, "organization_id") {
        return Ok(format!("organizations/{}", org.trim_start_matches("organizations/")));
    }
    let source = source_name(ctx)?;
    let mut parts = source.split('/');
    match (parts.next(), parts.next()) {
        (Some("organizations"), Some(id)) if !id.is_empty() => Ok(format!("organizations/{}", id)),
        _ => Err(BrokerError::missing_field("organization_id")),
    }
}

struct CollectFindings {
    api: ApiClient,
}

#[async_trait]
impl OperationHandler for CollectFindings {
    async fn execute(&self, ctx: OperationContext<'_>) -> Result<OperationResult> {
        let token = static_token(&ctx)?;
        let base = base_url(ctx.provider, DEFAULT_API_BASE);
        let source = source_name(&ctx)?;
        let filter = config_str(ctx.config, "filter").or_else(|| credential_attr(&ctx, "filter"));
        let page_size = config_usize(ctx.config, "page_size")
            .unwrap_or(FINDINGS_PAGE_SIZE)
            .min(FINDINGS_MAX_PAGE_SIZE);
        let max_findings = config_usize(ctx.config, "max_findings");

        let url = format!("{}/v2/{}/locations/global/findings", base, source);
        let mut findings = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![("pageSize", page_size.to_string())];
            if let Some(filter) = filter {
                query.push(("filter", filter.to_string()));
            }
            if let Some(page_token) = &page_token {
                query.push(("pageToken", page_token.clone()));
            }

            let page = self.api.get(&url, token, &query).await?;
            if let Some(results) = page.get("listFindingsResults").and_then(Value::as_array) {
                findings.extend(results.iter().filter_map(|r| r.get("finding")).cloned());
            }

            if max_findings.is_some_and(|max| findings.len() >= max) {
                break;
            }
            page_token = page
                .get("nextPageToken")
                .and_then(Value::as_str)
                .filter(|t| !t.is_empty())
                .map(str::to_string);
            if page_token.is_none() {
                break;
            }
        }

        if let Some(max) = max_findings {
            findings.truncate(max);
        }

        let sample: Vec<Value> = findings
            .iter()
            .take(MAX_SAMPLE)
            .map(|f| {
                json!({
                    "name": f.get("name"),
                    "category": f.get("category"),
                    "severity": f.get("severity"),
                    "state": f.get("state"),
                })
            })
            .collect();

        let mut result = OperationResult::ok(format!(
            "Collected {} findings from {}",
            findings.len(),
            source
        ))
        .with_detail("source", json!(source))
        .with_detail("findings_total", json!(findings.len()))
        .with_detail("sample", Value::Array(sample));

        if config_bool(ctx.config, "include_payloads") {
            result = result.with_detail("findings", Value::Array(findings));
        }

        Ok(result)
    }
}

struct ScanSettings {
    api: ApiClient,
}

#[async_trait]
impl OperationHandler for ScanSettings {
    async fn execute(&self, ctx: OperationContext<'_>) -> Result<OperationResult> {
        let token = static_token(&ctx)?;
        let base = base_url(ctx.provider, DEFAULT_API_BASE);
        let parent = organization_parent(&ctx)?;

        let url = format!("{}/v2/{}/locations/global/notificationConfigs", base, parent);
        let response = self
            .api
            .get(&url, token, &[("pageSize", "10".to_string())])
            .await?;

        let configs: Vec<Value> = response
            .get("notificationConfigs")
            .and_then(Value::as_array)
            .map(|configs| {
                configs
                    .iter()
                    .map(|c| {
                        json!({
                            "name": c.get("name"),
                            "description": c.get("description"),
                            "pubsub_topic": c.get("pubsubTopic"),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(OperationResult::ok(format!(
            "Found {} notification configs for {}",
            configs.len(),
            parent
        ))
        .with_detail("parent", json!(parent))
        .with_detail("notification_configs", Value::Array(configs)))
    }
}
