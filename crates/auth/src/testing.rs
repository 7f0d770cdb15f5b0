//! Test doubles for the authentication client
//!
//! Available to this crate's unit tests and, with the `test-utils` feature,
//! to integration tests and downstream crates.

// Allow missing error/panic docs for test mocks - they are designed to be simple
// and errors are clearly indicated by their return types
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use url::Url;

use crate::crypto::{base64url_encode, ChallengeHasher, HashError};
use crate::error::{ProviderError, StoreError};
use crate::store::{MemoryStore, SessionStore};
use crate::traits::{IdentityProvider, UserAgent};
use crate::types::{TokenResponse, UserProfile};

/// Build a token endpoint response
#[must_use]
pub fn token_response(access_token: &str, refresh_token: Option<&str>) -> TokenResponse {
    TokenResponse {
        access_token: access_token.to_string(),
        refresh_token: refresh_token.map(str::to_string),
        id_token: None,
        token_type: "Bearer".to_string(),
        expires_in: 300,
        scope: Some("openid profile email".to_string()),
    }
}

/// Build an unsigned JWT carrying `claims`
#[must_use]
pub fn fake_jwt(claims: &Value) -> String {
    format!(
        "{}.{}.unsigned",
        base64url_encode(br#"{"alg":"none","typ":"JWT"}"#),
        base64url_encode(claims.to_string().as_bytes())
    )
}

/// Build a profile from a JSON object literal
#[must_use]
pub fn profile(claims: &Value) -> UserProfile {
    match claims {
        Value::Object(map) => UserProfile(map.clone()),
        _ => UserProfile::default(),
    }
}

/// Scriptable in-process identity provider
///
/// Access tokens are valid only after [`accept_access_token`]
/// (or when issued by a scripted exchange/refresh); refresh tokens only work
/// when scripted with [`on_refresh`].
///
/// [`accept_access_token`]: Self::accept_access_token
/// [`on_refresh`]: Self::on_refresh
#[derive(Debug)]
pub struct MockIdentityProvider {
    authorization_endpoint: Url,
    valid_access_tokens: Mutex<HashSet<String>>,
    refresh_script: Mutex<HashMap<String, TokenResponse>>,
    exchange_script: Mutex<HashMap<String, TokenResponse>>,
    profile: Mutex<UserProfile>,
    refresh_delay: Mutex<Duration>,
    userinfo_down: AtomicBool,
    logout_down: AtomicBool,
    /// Number of userinfo requests
    pub userinfo_calls: AtomicUsize,
    /// Number of refresh grants
    pub refresh_calls: AtomicUsize,
    /// Number of code exchanges
    pub exchange_calls: AtomicUsize,
    /// Refresh tokens passed to logout
    pub logouts: Mutex<Vec<String>>,
}

impl Default for MockIdentityProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockIdentityProvider {
    /// Create a provider that accepts nothing
    #[must_use]
    pub fn new() -> Self {
        Self {
            authorization_endpoint: Url::parse(
                "https://idp.test/realms/peppertree/protocol/openid-connect/auth",
            )
            .unwrap_or_else(|_| unreachable!("static URL is valid")),
            valid_access_tokens: Mutex::new(HashSet::new()),
            refresh_script: Mutex::new(HashMap::new()),
            exchange_script: Mutex::new(HashMap::new()),
            profile: Mutex::new(profile(&serde_json::json!({
                "sub": "user-1",
                "email": "owner@peppertree.test",
                "preferred_username": "owner"
            }))),
            refresh_delay: Mutex::new(Duration::ZERO),
            userinfo_down: AtomicBool::new(false),
            logout_down: AtomicBool::new(false),
            userinfo_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            exchange_calls: AtomicUsize::new(0),
            logouts: Mutex::new(Vec::new()),
        }
    }

    /// Make `access_token` pass the userinfo probe
    pub fn accept_access_token(&self, access_token: &str) {
        self.valid_access_tokens.lock().insert(access_token.to_string());
    }

    /// Make `access_token` fail the userinfo probe
    pub fn revoke_access_token(&self, access_token: &str) {
        self.valid_access_tokens.lock().remove(access_token);
    }

    /// Answer a refresh grant for `refresh_token` with `response`
    pub fn on_refresh(&self, refresh_token: &str, response: TokenResponse) {
        self.refresh_script.lock().insert(refresh_token.to_string(), response);
    }

    /// Answer a code exchange for `code` with `response`
    pub fn on_exchange(&self, code: &str, response: TokenResponse) {
        self.exchange_script.lock().insert(code.to_string(), response);
    }

    /// Profile returned by userinfo
    pub fn set_profile(&self, profile: UserProfile) {
        *self.profile.lock() = profile;
    }

    /// Delay every refresh grant
    pub fn set_refresh_delay(&self, delay: Duration) {
        *self.refresh_delay.lock() = delay;
    }

    /// Make userinfo answer 503 for every token
    pub fn set_userinfo_down(&self, down: bool) {
        self.userinfo_down.store(down, Ordering::SeqCst);
    }

    /// Make logout answer 500
    pub fn set_logout_down(&self, down: bool) {
        self.logout_down.store(down, Ordering::SeqCst);
    }

    fn issue(&self, response: &TokenResponse) -> TokenResponse {
        self.accept_access_token(&response.access_token);
        response.clone()
    }
}

fn rejected(operation: &'static str, status: u16, error: &str) -> ProviderError {
    ProviderError::Status { operation, status, body: format!(r#"{{"error":"{error}"}}"#) }
}

#[async_trait]
impl IdentityProvider for MockIdentityProvider {
    fn authorization_endpoint(&self) -> Url {
        self.authorization_endpoint.clone()
    }

    fn client_id(&self) -> &str {
        "peppertree-admin"
    }

    async fn exchange_code(
        &self,
        code: &str,
        _code_verifier: &str,
        _redirect_uri: &Url,
    ) -> Result<TokenResponse, ProviderError> {
        self.exchange_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.exchange_script.lock().remove(code);
        scripted
            .map(|response| self.issue(&response))
            .ok_or_else(|| rejected("token exchange", 400, "invalid_grant"))
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, ProviderError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.refresh_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.refresh_script.lock().get(refresh_token).cloned();
        scripted
            .map(|response| self.issue(&response))
            .ok_or_else(|| rejected("token refresh", 400, "invalid_grant"))
    }

    async fn userinfo(&self, access_token: &str) -> Result<UserProfile, ProviderError> {
        self.userinfo_calls.fetch_add(1, Ordering::SeqCst);
        if self.userinfo_down.load(Ordering::SeqCst) {
            return Err(rejected("userinfo", 503, "temporarily_unavailable"));
        }
        if self.valid_access_tokens.lock().contains(access_token) {
            Ok(self.profile.lock().clone())
        } else {
            Err(rejected("userinfo", 401, "invalid_token"))
        }
    }

    async fn logout(&self, refresh_token: &str) -> Result<(), ProviderError> {
        self.logouts.lock().push(refresh_token.to_string());
        if self.logout_down.load(Ordering::SeqCst) {
            return Err(rejected("logout", 500, "server_error"));
        }
        Ok(())
    }
}

/// User agent that records navigations instead of performing them
#[derive(Debug)]
pub struct RecordingUserAgent {
    origin: Mutex<Url>,
    navigations: Mutex<Vec<Url>>,
    refuse: AtomicBool,
}

impl RecordingUserAgent {
    /// Serve from `origin`
    #[must_use]
    pub fn new(origin: Url) -> Self {
        Self { origin: Mutex::new(origin), navigations: Mutex::new(Vec::new()), refuse: AtomicBool::new(false) }
    }

    /// Serve from `http://localhost:3000`
    #[must_use]
    pub fn localhost() -> Self {
        Self::new(
            Url::parse("http://localhost:3000").unwrap_or_else(|_| unreachable!("static URL is valid")),
        )
    }

    /// Move the application to another origin
    pub fn set_origin(&self, origin: Url) {
        *self.origin.lock() = origin;
    }

    /// Make subsequent navigations fail
    pub fn refuse_navigation(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Every URL navigated to, oldest first
    #[must_use]
    pub fn navigations(&self) -> Vec<Url> {
        self.navigations.lock().clone()
    }

    /// The most recent navigation
    #[must_use]
    pub fn last_navigation(&self) -> Option<Url> {
        self.navigations.lock().last().cloned()
    }
}

impl UserAgent for RecordingUserAgent {
    fn origin(&self) -> Url {
        self.origin.lock().clone()
    }

    fn navigate(&self, url: &Url) -> Result<(), String> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err("navigation blocked".to_string());
        }
        self.navigations.lock().push(url.clone());
        Ok(())
    }
}

/// Memory store whose writes can be made to fail
#[derive(Debug, Default)]
pub struct FailingStore {
    inner: MemoryStore,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    /// Number of successful `set` calls
    pub writes: AtomicUsize,
}

impl FailingStore {
    /// Create a store that works until told otherwise
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every `set` and `remove`
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Fail every `get`
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// The wrapped store, for inspection
    #[must_use]
    pub const fn inner(&self) -> &MemoryStore {
        &self.inner
    }
}

#[async_trait]
impl SessionStore for FailingStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("storage disabled".to_string()));
        }
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("quota exceeded".to_string()));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.set(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("quota exceeded".to_string()));
        }
        self.inner.remove(key).await
    }
}

/// Hasher with a fixed failure
#[derive(Debug, Clone)]
pub struct StubHasher {
    error: HashError,
}

impl StubHasher {
    /// SHA-256 missing from the environment (triggers the `plain` fallback)
    #[must_use]
    pub fn unavailable() -> Self {
        Self { error: HashError::Unavailable("not a secure context".to_string()) }
    }

    /// SHA-256 present but failing
    #[must_use]
    pub fn failing() -> Self {
        Self { error: HashError::Failed("digest failed".to_string()) }
    }
}

impl ChallengeHasher for StubHasher {
    fn sha256(&self, _input: &[u8]) -> Result<[u8; 32], HashError> {
        Err(self.error.clone())
    }
}
