//! Integration tests for token validity, refresh, restore and logout
//!
//! Sessions are seeded through the persisted store and restored, the way a
//! returning admin's page load starts. A wiremock server stands in for
//! Keycloak.

use std::sync::Arc;
use std::time::Duration;

use peppertree_auth::store::TOKENS_KEY;
use peppertree_auth::testing::{fake_jwt, RecordingUserAgent};
use peppertree_auth::{
    AuthConfig, AuthService, KeycloakClient, MemoryStore, SessionState, SessionStorage,
    SessionStore, TokenSet,
};
use serde_json::json;
use url::Url;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

const TOKEN_PATH: &str = "/realms/peppertree/protocol/openid-connect/token";
const USERINFO_PATH: &str = "/realms/peppertree/protocol/openid-connect/userinfo";
const LOGOUT_PATH: &str = "/realms/peppertree/protocol/openid-connect/logout";

type Service = AuthService<KeycloakClient, MemoryStore, RecordingUserAgent>;

fn service_for(server: &MockServer, store: Arc<MemoryStore>) -> Service {
    // Probe on every call so provider-side changes are observed immediately
    let config = AuthConfig::new(Url::parse(&server.uri()).unwrap(), "peppertree-admin")
        .with_http_timeout(Duration::from_secs(2))
        .with_probe_cache_ttl(Duration::ZERO);
    let http = reqwest::Client::builder().timeout(config.http_timeout()).no_proxy().build().unwrap();
    let provider = Arc::new(KeycloakClient::with_http_client(&config, http).unwrap());
    AuthService::new(config, provider, store, Arc::new(RecordingUserAgent::localhost())).unwrap()
}

async fn seed(store: &Arc<MemoryStore>, access_token: &str, refresh_token: &str) {
    SessionStorage::new(Arc::clone(store))
        .save_tokens(&TokenSet::new(access_token, Some(refresh_token.to_string()), 300))
        .await
        .unwrap();
}

/// Accept `access_token` at userinfo, at most `times` times when given
async fn accept(server: &MockServer, access_token: &str, times: Option<u64>) {
    let mock = Mock::given(method("GET"))
        .and(path(USERINFO_PATH))
        .and(header("authorization", format!("Bearer {access_token}").as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "sub": "user-1",
            "email": "owner@peppertree.test"
        })));
    match times {
        Some(n) => mock.up_to_n_times(n).mount(server).await,
        None => mock.mount(server).await,
    }
}

/// Answer every other userinfo request with 401
async fn reject_unknown_tokens(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path(USERINFO_PATH))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({ "error": "invalid_token" })))
        .with_priority(10)
        .mount(server)
        .await;
}

fn refresh_requests(requests: &[Request]) -> Vec<&Request> {
    requests
        .iter()
        .filter(|r| {
            r.url.path() == TOKEN_PATH
                && String::from_utf8_lossy(&r.body).contains("grant_type=refresh_token")
        })
        .collect()
}

/// Validates refresh of a stale access token during restore.
///
/// # Test Steps
/// 1. Persist an expired access token with a valid refresh token
/// 2. Start the service
/// 3. Verify the refreshed token is active and stored, keeping the refresh
///    token the provider did not rotate
#[tokio::test]
async fn restore_refreshes_expired_access_token() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    reject_unknown_tokens(&server).await;
    accept(&server, "access-2", None).await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=refresh-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "access-2",
            "expires_in": 300,
            "token_type": "Bearer"
        })))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    seed(&store, "expired", "refresh-1").await;
    let service = service_for(&server, Arc::clone(&store));

    let state = service.start().await;
    assert_eq!(state.tokens().map(|t| t.access_token.as_str()), Some("access-2"));
    assert_eq!(service.get_valid_access_token().await.as_deref(), Some("access-2"));
    assert_eq!(service.get_valid_access_token().await.as_deref(), Some("access-2"));

    let stored = SessionStorage::new(Arc::clone(&store)).load_tokens().await?.unwrap();
    assert_eq!(stored.access_token, "access-2");
    assert_eq!(stored.refresh_token.as_deref(), Some("refresh-1"));
    assert_eq!(refresh_requests(&server.received_requests().await.unwrap()).len(), 1);
    Ok(())
}

/// Validates that a session with both tokens invalid ends cleanly.
///
/// # Test Steps
/// 1. Restore a session whose access token is accepted once
/// 2. Let the provider reject the access token and the refresh grant
/// 3. Verify no token is served, the store is empty and the session ended
#[tokio::test]
async fn both_tokens_invalid_ends_session() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    reject_unknown_tokens(&server).await;
    accept(&server, "access-1", Some(1)).await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant",
            "error_description": "Token is not active"
        })))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    seed(&store, "access-1", "refresh-1").await;
    let service = service_for(&server, Arc::clone(&store));
    assert!(service.start().await.is_authenticated());

    assert_eq!(service.get_valid_access_token().await, None);
    assert_eq!(service.current(), SessionState::Unauthenticated);
    assert!(store.is_empty());
    Ok(())
}

/// Validates that concurrent callers share a single refresh.
///
/// # Test Steps
/// 1. Restore a session, then let the provider reject its access token
/// 2. Request a token from eight callers at once while refresh is slow
/// 3. Verify every caller gets the new token from one refresh grant
#[tokio::test]
async fn concurrent_callers_share_one_refresh() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    reject_unknown_tokens(&server).await;
    accept(&server, "access-1", Some(1)).await;
    accept(&server, "access-2", None).await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({
                    "access_token": "access-2",
                    "refresh_token": "refresh-2",
                    "expires_in": 300
                }))
                .set_delay(Duration::from_millis(100)),
        )
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    seed(&store, "access-1", "refresh-1").await;
    let service = service_for(&server, Arc::clone(&store));
    assert!(service.start().await.is_authenticated());

    let calls = (0..8).map(|_| service.get_valid_access_token());
    let results = futures::future::join_all(calls).await;

    assert!(results.iter().all(|r| r.as_deref() == Some("access-2")));
    assert_eq!(refresh_requests(&server.received_requests().await.unwrap()).len(), 1);

    let stored = SessionStorage::new(Arc::clone(&store)).load_tokens().await?.unwrap();
    assert_eq!(stored.refresh_token.as_deref(), Some("refresh-2"));
    Ok(())
}

/// Validates logout against the provider.
///
/// # Test Steps
/// 1. Restore a session
/// 2. Log out
/// 3. Verify the refresh token was posted and local state is gone
#[tokio::test]
async fn logout_posts_refresh_token_and_clears_store() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    accept(&server, "access-1", None).await;
    Mock::given(method("POST"))
        .and(path(LOGOUT_PATH))
        .and(body_string_contains("client_id=peppertree-admin"))
        .and(body_string_contains("refresh_token=refresh-1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    seed(&store, "access-1", "refresh-1").await;
    let service = service_for(&server, Arc::clone(&store));
    assert!(service.start().await.is_authenticated());

    service.logout().await;

    assert_eq!(service.current(), SessionState::Unauthenticated);
    assert!(store.is_empty());
    assert_eq!(service.get_valid_access_token().await, None);
    Ok(())
}

/// Validates that logout completes locally when the provider fails.
///
/// # Test Steps
/// 1. Restore a session
/// 2. Log out while the logout endpoint answers 500
/// 3. Verify the session still ended and the store is empty
#[tokio::test]
async fn logout_survives_provider_failure() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    accept(&server, "access-1", None).await;
    Mock::given(method("POST"))
        .and(path(LOGOUT_PATH))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    seed(&store, "access-1", "refresh-1").await;
    let service = service_for(&server, Arc::clone(&store));
    service.start().await;

    service.logout().await;

    assert_eq!(service.current(), SessionState::Unauthenticated);
    assert!(store.is_empty());
    Ok(())
}

/// Validates that an unreadable persisted session is discarded.
///
/// # Test Steps
/// 1. Persist a corrupt token record
/// 2. Start the service
/// 3. Verify it settles unauthenticated without contacting the provider
#[tokio::test]
async fn corrupt_session_is_discarded() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let store = Arc::new(MemoryStore::new());
    store.set(TOKENS_KEY, "{\"access_token\":").await?;
    let service = service_for(&server, Arc::clone(&store));

    assert_eq!(service.start().await, SessionState::Unauthenticated);
    assert!(!store.contains(TOKENS_KEY));
    assert!(server.received_requests().await.unwrap().is_empty());
    Ok(())
}

/// Validates role hints on a restored session.
///
/// # Test Steps
/// 1. Restore a session whose access token carries a realm admin role
/// 2. Verify `is_admin` and `has_capability` read it
/// 3. Log out and verify the hints are gone
#[tokio::test]
async fn role_hints_follow_the_session() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let token = fake_jwt(&json!({
        "sub": "user-1",
        "realm_access": { "roles": ["admin", "bookings-viewer"] }
    }));
    accept(&server, &token, None).await;
    Mock::given(method("POST"))
        .and(path(LOGOUT_PATH))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    seed(&store, &token, "refresh-1").await;
    let service = service_for(&server, Arc::clone(&store));
    service.start().await;

    assert!(service.is_admin());
    assert!(service.has_capability("bookings-viewer"));
    assert!(!service.has_capability("bookings-editor"));

    service.logout().await;
    assert!(!service.is_admin());
    Ok(())
}
