//! Credential minting and single-flight refresh tests

mod common;

use chrono::Duration;
use common::TestHarness;
use futures::future::join_all;
use integration_broker::BrokerError;
use integration_broker::broker::Clock;
use integration_broker::model::{Credential, CredentialPayload};
use serde_json::{Map, json};

fn access_token(payload: &CredentialPayload) -> &str {
    payload.access_token().expect("OAuth credential")
}

#[tokio::test]
async fn test_expired_token_is_refreshed_once() {
    let h = TestHarness::new().await;
    h.seed_oauth_credential("org-a", "github", "stale", Duration::minutes(-1))
        .await;

    let minted = h.broker.mint("org-a", "github").await.unwrap();
    assert_eq!(access_token(&minted), "access-1");
    assert_eq!(h.tokens.refreshes(), 1);

    let stored = h.storage.get_credential("org-a", "github").await.unwrap().unwrap();
    let CredentialPayload::OAuthToken(token) = &stored.payload else {
        panic!("expected OAuth token");
    };
    assert_eq!(token.expires_at, Some(h.clock.now() + Duration::hours(1)));
    assert_eq!(token.refresh_token.as_deref(), Some("refresh-1"));

    // Inside the new validity window no further refresh happens
    h.clock.advance(Duration::minutes(30));
    let again = h.broker.mint("org-a", "github").await.unwrap();
    assert_eq!(access_token(&again), "access-1");
    assert_eq!(h.tokens.refreshes(), 1);
}

#[tokio::test]
async fn test_token_inside_skew_window_is_refreshed() {
    let h = TestHarness::new().await;
    h.seed_oauth_credential("org-a", "github", "nearly-expired", Duration::minutes(2))
        .await;

    let minted = h.broker.mint("org-a", "github").await.unwrap();
    assert_eq!(access_token(&minted), "access-1");
    assert_eq!(h.tokens.refreshes(), 1);
}

#[tokio::test]
async fn test_fresh_token_is_returned_without_refresh() {
    let h = TestHarness::new().await;
    h.seed_oauth_credential("org-a", "github", "fresh", Duration::hours(2))
        .await;

    let minted = h.broker.mint("org-a", "github").await.unwrap();
    assert_eq!(access_token(&minted), "fresh");
    assert_eq!(h.tokens.refreshes(), 0);
}

#[tokio::test]
async fn test_short_lived_token_is_not_refreshed_on_every_mint() {
    let h = TestHarness::new().await;
    h.tokens.issue_lifetime(Duration::seconds(60));
    h.seed_oauth_credential("org-a", "github", "stale", Duration::minutes(-1))
        .await;

    let minted = h.broker.mint("org-a", "github").await.unwrap();
    assert_eq!(access_token(&minted), "access-1");

    // A 60s token is shorter than the 300s skew but still serves half its life
    h.clock.advance(Duration::seconds(20));
    let again = h.broker.mint("org-a", "github").await.unwrap();
    assert_eq!(access_token(&again), "access-1");
    assert_eq!(h.tokens.refreshes(), 1);

    h.clock.advance(Duration::seconds(15));
    let renewed = h.broker.mint("org-a", "github").await.unwrap();
    assert_eq!(access_token(&renewed), "access-2");
    assert_eq!(h.tokens.refreshes(), 2);
}

#[tokio::test]
async fn test_concurrent_mints_share_one_refresh() {
    let h = TestHarness::new().await;
    h.seed_oauth_credential("org-a", "github", "stale", Duration::minutes(-5))
        .await;
    h.tokens
        .delay_refreshes(std::time::Duration::from_millis(50));

    let results = join_all((0..16).map(|_| h.broker.mint("org-a", "github"))).await;

    for result in &results {
        assert_eq!(access_token(result.as_ref().unwrap()), "access-1");
    }
    assert_eq!(h.tokens.refreshes(), 1);
    assert_eq!(h.broker.in_flight_refreshes(), 0);
}

#[tokio::test]
async fn test_concurrent_mints_for_different_orgs_refresh_independently() {
    let h = TestHarness::new().await;
    h.seed_oauth_credential("org-a", "github", "stale-a", Duration::minutes(-5))
        .await;
    h.seed_oauth_credential("org-b", "github", "stale-b", Duration::minutes(-5))
        .await;
    h.tokens
        .delay_refreshes(std::time::Duration::from_millis(20));

    let (a, b) = tokio::join!(
        h.broker.mint("org-a", "github"),
        h.broker.mint("org-b", "github")
    );

    assert_ne!(access_token(&a.unwrap()), access_token(&b.unwrap()));
    assert_eq!(h.tokens.refreshes(), 2);
}

#[tokio::test]
async fn test_failed_refresh_leaves_credential_untouched() {
    let h = TestHarness::new().await;
    h.seed_oauth_credential("org-a", "github", "stale", Duration::minutes(-1))
        .await;
    let before = h.storage.get_credential("org-a", "github").await.unwrap();
    h.tokens.fail_refreshes(true);

    let err = h.broker.mint("org-a", "github").await.unwrap_err();
    assert!(matches!(err, BrokerError::RefreshFailed { .. }));
    assert!(err.to_string().contains("invalid_grant"));

    let after = h.storage.get_credential("org-a", "github").await.unwrap();
    assert_eq!(before, after);
    assert_eq!(h.broker.in_flight_refreshes(), 0);

    // The next caller starts a fresh attempt rather than replaying the failure
    h.tokens.fail_refreshes(false);
    let minted = h.broker.mint("org-a", "github").await.unwrap();
    assert_eq!(access_token(&minted), "access-1");
    assert_eq!(h.tokens.refreshes(), 2);
}

#[tokio::test]
async fn test_concurrent_waiters_all_see_refresh_failure() {
    let h = TestHarness::new().await;
    h.seed_oauth_credential("org-a", "github", "stale", Duration::minutes(-1))
        .await;
    h.tokens.fail_refreshes(true);
    h.tokens
        .delay_refreshes(std::time::Duration::from_millis(30));

    let results = join_all((0..5).map(|_| h.broker.mint("org-a", "github"))).await;

    assert!(
        results
            .iter()
            .all(|r| matches!(r, Err(BrokerError::RefreshFailed { .. })))
    );
    assert_eq!(h.tokens.refreshes(), 1);
}

#[tokio::test]
async fn test_forced_refresh_ignores_remaining_validity() {
    let h = TestHarness::new().await;
    h.seed_oauth_credential("org-a", "github", "fresh", Duration::hours(2))
        .await;

    let token = h.broker.refresh("org-a", "github").await.unwrap();
    assert_eq!(token.access_token, "access-1");
    assert_eq!(h.tokens.refreshes(), 1);
}

#[tokio::test]
async fn test_static_credentials_pass_through() {
    let h = TestHarness::new().await;
    let mut config = Map::new();
    config.insert("access_token".to_string(), json!("ya29.static"));
    config.insert("source_id".to_string(), json!("organizations/1/sources/2"));
    h.storage
        .save_credential(&Credential {
            org_id: "org-a".to_string(),
            provider: "gcp_scc".to_string(),
            payload: CredentialPayload::StaticConfig(config.clone()),
            updated_at: h.clock.now(),
        })
        .await
        .unwrap();

    let minted = h.broker.mint("org-a", "gcp_scc").await.unwrap();
    assert_eq!(minted, CredentialPayload::StaticConfig(config));
    assert_eq!(h.tokens.refreshes(), 0);
}

#[tokio::test]
async fn test_missing_credential_is_reported() {
    let h = TestHarness::new().await;
    h.seed_oauth_credential("org-a", "github", "fresh", Duration::hours(1))
        .await;

    let err = h.broker.mint("org-b", "github").await.unwrap_err();
    assert!(matches!(err, BrokerError::CredentialNotFound(_)));
}
