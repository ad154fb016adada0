//! Alert normalization
//!
//! One function per [`AlertType`]; adding a variant fails to compile until it
//! is handled in [`normalize`].

use super::IngestSource;
use crate::model::{AlertEnvelope, AlertType, VulnerabilityFields};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};

/// An envelope reduced to its upsert key and field values
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedAlert {
    pub external_id: String,
    pub fields: VulnerabilityFields,
}

/// Provider alert id: `id`, else `number`, as a string or integer
pub fn alert_id(payload: &Value) -> Option<String> {
    ["id", "number"]
        .iter()
        .filter_map(|key| payload.get(key))
        .find_map(|value| match value {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

pub fn external_id(alert_type: AlertType, resource: &str, alert_id: &str) -> String {
    format!("{}:{}:{}", alert_type, resource, alert_id)
}

/// Normalize one envelope; `None` when it lacks a resource or alert id
pub fn normalize(envelope: &AlertEnvelope, source: IngestSource) -> Option<NormalizedAlert> {
    let resource = envelope.resource.trim();
    if resource.is_empty() {
        return None;
    }
    let id = alert_id(&envelope.payload)?;

    let payload = &envelope.payload;
    let mut fields = common_fields(envelope, resource, source);
    let extra = match envelope.alert_type {
        AlertType::Dependabot => dependabot(payload, &mut fields),
        AlertType::CodeScanning => code_scanning(payload, &mut fields),
        AlertType::SecretScanning => secret_scanning(payload, &mut fields),
    };
    if let Some(Value::Object(metadata)) = fields.metadata.as_mut() {
        metadata.extend(extra);
    }

    Some(NormalizedAlert {
        external_id: external_id(envelope.alert_type, resource, &id),
        fields,
    })
}

fn common_fields(envelope: &AlertEnvelope, resource: &str, source: IngestSource) -> VulnerabilityFields {
    let payload = &envelope.payload;
    let state = text(payload, "/state").map(|s| s.to_lowercase());

    VulnerabilityFields {
        external_owner_id: resource
            .split_once('/')
            .map(|(owner, _)| owner.to_string())
            .filter(|owner| !owner.is_empty()),
        status: state.clone(),
        open: state.as_deref().map(|s| matches!(s, "open" | "active" | "new")),
        category: Some(envelope.alert_type.to_string()),
        external_uri: text(payload, "/html_url"),
        discovered_at: timestamp(payload, "/created_at"),
        source_updated_at: timestamp(payload, "/updated_at"),
        metadata: Some(json!({
            "alert_type": envelope.alert_type,
            "repository": resource,
            "action": envelope.action,
            "source": source.as_str(),
        })),
        raw_payload: Some(payload.clone()),
        ..Default::default()
    }
}

fn dependabot(payload: &Value, fields: &mut VulnerabilityFields) -> Map<String, Value> {
    let advisory_summary = text(payload, "/security_advisory/summary");

    fields.display_name =
        text(payload, "/dependency/package/name").or_else(|| advisory_summary.clone());
    fields.summary = advisory_summary;
    fields.description = text(payload, "/security_advisory/description");
    fields.severity = text(payload, "/security_vulnerability/severity")
        .or_else(|| text(payload, "/security_advisory/severity"))
        .map(|s| s.to_lowercase());
    fields.published_at = timestamp(payload, "/security_advisory/published_at");

    pick(payload, &["dependency", "security_advisory", "security_vulnerability"])
}

fn code_scanning(payload: &Value, fields: &mut VulnerabilityFields) -> Map<String, Value> {
    let rule_description = text(payload, "/rule/description");

    fields.display_name = text(payload, "/rule/name").or_else(|| text(payload, "/rule/id"));
    fields.summary = rule_description.clone().or_else(|| fields.display_name.clone());
    fields.description = rule_description;
    fields.severity = text(payload, "/rule/security_severity_level")
        .or_else(|| text(payload, "/rule/severity"))
        .map(|s| s.to_lowercase());

    pick(payload, &["rule", "tool", "most_recent_instance"])
}

fn secret_scanning(payload: &Value, fields: &mut VulnerabilityFields) -> Map<String, Value> {
    fields.display_name =
        text(payload, "/secret_type_display_name").or_else(|| text(payload, "/secret_type"));
    fields.summary = fields.display_name.clone();
    fields.description = text(payload, "/resolution_comment");
    fields.source_updated_at =
        timestamp(payload, "/resolved_at").or_else(|| timestamp(payload, "/updated_at"));

    pick(payload, &["secret_type", "secret_type_display_name", "resolution"])
}

/// Non-blank string at a JSON pointer
fn text(value: &Value, pointer: &str) -> Option<String> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn timestamp(value: &Value, pointer: &str) -> Option<DateTime<Utc>> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn pick(payload: &Value, keys: &[&str]) -> Map<String, Value> {
    keys.iter()
        .filter_map(|key| {
            payload
                .get(*key)
                .filter(|v| !v.is_null())
                .map(|v| (key.to_string(), v.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(alert_type: AlertType, payload: Value) -> AlertEnvelope {
        AlertEnvelope {
            alert_type,
            resource: "acme/api".to_string(),
            action: "created".to_string(),
            payload,
        }
    }

    #[test]
    fn test_alert_id_prefers_id_then_number() {
        assert_eq!(alert_id(&json!({"id": 7, "number": 42})).as_deref(), Some("7"));
        assert_eq!(alert_id(&json!({"number": 42})).as_deref(), Some("42"));
        assert_eq!(alert_id(&json!({"id": "abc"})).as_deref(), Some("abc"));
        assert_eq!(alert_id(&json!({"id": "  ", "number": 3})).as_deref(), Some("3"));
        assert_eq!(alert_id(&json!({"id": null})), None);
    }

    #[test]
    fn test_dependabot_mapping() {
        let normalized = normalize(
            &envelope(
                AlertType::Dependabot,
                json!({
                    "number": 42,
                    "state": "OPEN",
                    "html_url": "https://github.com/acme/api/security/dependabot/42",
                    "created_at": "2025-01-02T03:04:05Z",
                    "dependency": {"package": {"name": "lodash", "ecosystem": "npm"}},
                    "security_advisory": {
                        "summary": "Prototype pollution",
                        "description": "Details",
                        "severity": "medium",
                        "published_at": "2024-12-01T00:00:00Z"
                    },
                    "security_vulnerability": {"severity": "HIGH"}
                }),
            ),
            IngestSource::Webhook,
        )
        .unwrap();

        assert_eq!(normalized.external_id, "dependabot:acme/api:42");
        let f = normalized.fields;
        assert_eq!(f.display_name.as_deref(), Some("lodash"));
        assert_eq!(f.summary.as_deref(), Some("Prototype pollution"));
        assert_eq!(f.severity.as_deref(), Some("high"));
        assert_eq!(f.status.as_deref(), Some("open"));
        assert_eq!(f.open, Some(true));
        assert_eq!(f.external_owner_id.as_deref(), Some("acme"));
        assert_eq!(f.category.as_deref(), Some("dependabot"));
        assert!(f.published_at.is_some());
        assert!(f.discovered_at.is_some());

        let metadata = f.metadata.unwrap();
        assert_eq!(metadata["source"], "webhook");
        assert_eq!(metadata["repository"], "acme/api");
        assert_eq!(metadata["dependency"]["package"]["name"], "lodash");
    }

    #[test]
    fn test_code_scanning_falls_back_to_rule_id() {
        let f = normalize(
            &envelope(
                AlertType::CodeScanning,
                json!({
                    "number": 3,
                    "state": "dismissed",
                    "rule": {"id": "js/xss", "severity": "Warning"}
                }),
            ),
            IngestSource::Sync,
        )
        .unwrap()
        .fields;

        assert_eq!(f.display_name.as_deref(), Some("js/xss"));
        assert_eq!(f.summary.as_deref(), Some("js/xss"));
        assert_eq!(f.severity.as_deref(), Some("warning"));
        assert_eq!(f.open, Some(false));
        assert_eq!(f.metadata.unwrap()["source"], "sync");
    }

    #[test]
    fn test_secret_scanning_uses_resolved_at() {
        let f = normalize(
            &envelope(
                AlertType::SecretScanning,
                json!({
                    "number": 9,
                    "secret_type": "github_personal_access_token",
                    "resolution": "revoked",
                    "resolved_at": "2025-03-01T00:00:00Z",
                    "updated_at": "2025-02-01T00:00:00Z"
                }),
            ),
            IngestSource::Webhook,
        )
        .unwrap()
        .fields;

        assert_eq!(f.display_name.as_deref(), Some("github_personal_access_token"));
        assert_eq!(
            f.source_updated_at,
            timestamp(&json!({"t": "2025-03-01T00:00:00Z"}), "/t")
        );
        assert_eq!(f.open, None);
    }

    #[test]
    fn test_missing_resource_or_id_is_skipped() {
        let mut no_resource = envelope(AlertType::Dependabot, json!({"number": 1}));
        no_resource.resource = "  ".to_string();
        assert!(normalize(&no_resource, IngestSource::Sync).is_none());

        let no_id = envelope(AlertType::Dependabot, json!({"state": "open"}));
        assert!(normalize(&no_id, IngestSource::Sync).is_none());
    }
}
