//! Webhook ingestion through the installation-routed GitHub pipeline

mod common;

use axum::http::{HeaderMap, HeaderValue};
use common::{TestHarness, github_signature};
use integration_broker::BrokerError;
use integration_broker::http::webhook::{
    DELIVERY_HEADER, EVENT_HEADER, SIGNATURE_HEADER, WebhookOutcome,
};
use integration_broker::model::AlertType;
use serde_json::{Value, json};

fn headers(delivery_id: &str, event: &str, body: &[u8]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(DELIVERY_HEADER, HeaderValue::from_str(delivery_id).unwrap());
    headers.insert(EVENT_HEADER, HeaderValue::from_str(event).unwrap());
    headers.insert(
        SIGNATURE_HEADER,
        HeaderValue::from_str(&github_signature(body)).unwrap(),
    );
    headers
}

fn event(action: &str, alert: Value) -> Vec<u8> {
    json!({
        "action": action,
        "installation": {"id": 4242},
        "repository": {"full_name": "org/repo"},
        "alert": alert,
    })
    .to_string()
    .into_bytes()
}

async fn connected_harness() -> (TestHarness, String) {
    let h = TestHarness::new().await;
    let integration = h
        .storage
        .ensure_integration("org-a", "github", Some("4242"))
        .await
        .unwrap();
    (h, integration.id)
}

#[tokio::test]
async fn test_duplicate_delivery_creates_one_vulnerability() {
    let (h, integration_id) = connected_harness().await;
    let body = event(
        "created",
        json!({
            "number": 42,
            "state": "open",
            "dependency": {"package": {"name": "minimist"}},
            "security_advisory": {"summary": "Prototype pollution in minimist"},
            "security_vulnerability": {"severity": "CRITICAL"}
        }),
    );

    let first = h
        .webhooks
        .ingest(&headers("evt-1", "dependabot_alert", &body), &body)
        .await
        .unwrap();
    let second = h
        .webhooks
        .ingest(&headers("evt-1", "dependabot_alert", &body), &body)
        .await
        .unwrap();

    assert_eq!(
        first,
        WebhookOutcome::Ingested {
            delivery_id: "evt-1".to_string(),
            alert_type: AlertType::Dependabot,
            created: true,
        }
    );
    assert_eq!(
        second,
        WebhookOutcome::Duplicate {
            delivery_id: "evt-1".to_string()
        }
    );

    let stored = h.storage.list_vulnerabilities("org-a").await.unwrap();
    assert_eq!(stored.len(), 1);
    let finding = &stored[0];
    assert_eq!(finding.external_id, "dependabot:org/repo:42");
    assert_eq!(finding.severity.as_deref(), Some("critical"));
    assert_eq!(finding.external_owner_id.as_deref(), Some("org"));
    assert_eq!(
        h.storage
            .list_vulnerability_integrations(&finding.id)
            .await
            .unwrap(),
        vec![integration_id]
    );
}

#[tokio::test]
async fn test_new_delivery_updates_existing_finding() {
    let (h, _) = connected_harness().await;

    let opened = event("created", json!({"number": 9, "state": "open", "rule": {"id": "js/xss", "severity": "error"}}));
    h.webhooks
        .ingest(&headers("evt-1", "code_scanning_alert", &opened), &opened)
        .await
        .unwrap();

    let fixed = event("fixed", json!({"number": 9, "state": "fixed", "rule": {"id": "js/xss"}}));
    let outcome = h
        .webhooks
        .ingest(&headers("evt-2", "code_scanning_alert", &fixed), &fixed)
        .await
        .unwrap();
    assert!(matches!(outcome, WebhookOutcome::Ingested { created: false, .. }));

    let finding = h
        .storage
        .get_vulnerability("org-a", "code_scanning:org/repo:9")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(finding.status.as_deref(), Some("fixed"));
    assert_eq!(finding.open, Some(false));
    // Absent in the second delivery, so the first value is kept
    assert_eq!(finding.severity.as_deref(), Some("error"));
    assert_eq!(finding.metadata.as_ref().unwrap()["action"], "fixed");
}

#[tokio::test]
async fn test_alert_without_id_is_skipped() {
    let (h, _) = connected_harness().await;
    let body = event("created", json!({"state": "open", "secret_type": "github_pat"}));

    let outcome = h
        .webhooks
        .ingest(&headers("evt-7", "secret_scanning_alert", &body), &body)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        WebhookOutcome::Skipped {
            delivery_id: "evt-7".to_string()
        }
    );
    assert!(h.storage.list_vulnerabilities("org-a").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_deliveries_never_cross_organizations() {
    let (h, _) = connected_harness().await;
    h.storage
        .ensure_integration("org-b", "github", Some("5151"))
        .await
        .unwrap();

    let body = event("created", json!({"number": 1, "state": "open"}));
    h.webhooks
        .ingest(&headers("evt-1", "dependabot_alert", &body), &body)
        .await
        .unwrap();

    assert_eq!(h.storage.list_vulnerabilities("org-a").await.unwrap().len(), 1);
    assert!(h.storage.list_vulnerabilities("org-b").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_malformed_json_is_rejected_after_signature_check() {
    let (h, _) = connected_harness().await;
    let body = b"{not json".to_vec();

    let err = h
        .webhooks
        .ingest(&headers("evt-1", "dependabot_alert", &body), &body)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Validation(_)));
    assert!(
        !h.storage
            .webhook_delivery_exists("github", "evt-1")
            .await
            .unwrap()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_redeliveries_ingest_once() {
    let dir = tempfile::TempDir::new().unwrap();
    let h = TestHarness::on_disk(dir.path()).await;
    h.storage
        .ensure_integration("org-a", "github", Some("4242"))
        .await
        .unwrap();

    let body = event(
        "created",
        json!({"number": 9, "state": "open", "security_advisory": {"severity": "high"}}),
    );

    let tasks: Vec<_> = (0..12)
        .map(|_| {
            let webhooks = h.webhooks.clone();
            let body = body.clone();
            tokio::spawn(async move {
                let headers = headers("delivery-race", "dependabot_alert", &body);
                webhooks.ingest(&headers, &body).await
            })
        })
        .collect();

    let mut ingested = 0;
    let mut duplicates = 0;
    for task in tasks {
        match task.await.unwrap().unwrap() {
            WebhookOutcome::Ingested { created, .. } => {
                assert!(created);
                ingested += 1;
            }
            WebhookOutcome::Duplicate { .. } => duplicates += 1,
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    assert_eq!(ingested, 1);
    assert_eq!(duplicates, 11);
    assert_eq!(h.storage.list_vulnerabilities("org-a").await.unwrap().len(), 1);
}
