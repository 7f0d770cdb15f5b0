//! Token lifecycle manager
//!
//! Decides whether the current access token is still usable by asking the
//! provider (the userinfo endpoint doubles as the probe), refreshes it when
//! it is not, and ends the session when refreshing fails. Local expiry
//! timestamps are never trusted.
//!
//! Every probe/refresh sequence runs behind one async gate, so concurrent
//! callers trigger at most one refresh and the store never holds a token
//! pair from two different refreshes. The callback handler commits logins
//! behind the same gate (see [`TokenManager::gate`]), and a refresh whose
//! session was replaced while the grant was in flight is discarded.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::AuthError;
use crate::session::{SessionEvent, SessionMachine, SessionState};
use crate::store::{SessionStorage, SessionStore};
use crate::traits::IdentityProvider;
use crate::types::{TokenSet, UserProfile};

/// Last successful probe, keyed by the access token it validated
#[derive(Debug)]
struct ProbeRecord {
    access_token: String,
    at: Instant,
}

/// Keeps the session's tokens valid
///
/// # Type Parameters
/// * `P` - Identity provider used for probes and refresh grants
/// * `S` - Session store the token set is persisted in
pub struct TokenManager<P: IdentityProvider, S: SessionStore> {
    provider: Arc<P>,
    storage: SessionStorage<S>,
    session: Arc<SessionMachine>,
    gate: Arc<tokio::sync::Mutex<()>>,
    last_probe: Mutex<Option<ProbeRecord>>,
    probe_cache_ttl: Duration,
}

impl<P: IdentityProvider, S: SessionStore> TokenManager<P, S> {
    /// Create a token manager
    ///
    /// # Arguments
    /// * `provider` - Identity provider client
    /// * `storage` - Persisted session records
    /// * `session` - State machine to report into
    /// * `probe_cache_ttl` - How long a successful probe is trusted for the
    ///   same access token; zero probes on every call
    #[must_use]
    pub fn new(
        provider: Arc<P>,
        storage: SessionStorage<S>,
        session: Arc<SessionMachine>,
        probe_cache_ttl: Duration,
    ) -> Self {
        Self {
            provider,
            storage,
            session,
            gate: Arc::new(tokio::sync::Mutex::new(())),
            last_probe: Mutex::new(None),
            probe_cache_ttl,
        }
    }

    /// Gate serializing token writes
    ///
    /// Anything else that replaces the persisted token set (a completed
    /// login) must hold it while writing and dispatching.
    #[must_use]
    pub fn gate(&self) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(&self.gate)
    }

    /// Return a usable access token, refreshing if needed
    ///
    /// Only tokens of an `Authenticated` session count. When the token is
    /// rejected and cannot be refreshed the session is cleared and `None` is
    /// returned; this never fails.
    pub async fn get_valid_access_token(&self) -> Option<String> {
        let _gate = self.gate.lock().await;

        let tokens = self.session.inspect(|state| state.tokens().cloned())?;

        if self.probe_is_cached(&tokens.access_token) {
            debug!("Access token validated by cached probe");
            return Some(tokens.access_token);
        }

        match self.provider.userinfo(&tokens.access_token).await {
            Ok(_) => {
                debug!("Access token accepted by provider");
                self.remember_probe(&tokens.access_token);
                return Some(tokens.access_token);
            }
            Err(e) => debug!(
                error = %e,
                expires_in = ?tokens.seconds_until_expiry(),
                "Access token probe failed, refreshing"
            ),
        }

        let outcome = self.refresh_grant(&tokens).await;

        // A login or logout may have replaced the session during the grant
        if !self.holds(&tokens.access_token) {
            debug!("Session replaced while refreshing, discarding result");
            return None;
        }

        let stored = match outcome {
            Ok(refreshed) => match self.storage.save_tokens(&refreshed).await {
                Ok(()) => Ok(refreshed),
                Err(e) => Err(AuthError::from(e)),
            },
            Err(e) => Err(e),
        };

        match stored {
            Ok(refreshed) => {
                let access_token = refreshed.access_token.clone();
                if self.session.dispatch(SessionEvent::TokensRefreshed { tokens: refreshed }).is_err() {
                    // Session ended while the refresh was being stored
                    return None;
                }
                self.remember_probe(&access_token);
                info!("Access token refreshed");
                Some(access_token)
            }
            Err(e) => {
                warn!(error = %e, "Token refresh failed, clearing session");
                self.clear_locked().await;
                None
            }
        }
    }

    /// Validate the persisted session at process start
    ///
    /// Loads the stored token set, probes it (refreshing once if needed) and
    /// dispatches `SessionRestored`. Anything else, including an empty or
    /// corrupt store, dispatches `SessionCleared`. Returns the settled state.
    pub async fn restore(&self) -> SessionState {
        let _gate = self.gate.lock().await;

        let tokens = match self.storage.load_tokens().await {
            Ok(Some(tokens)) => tokens,
            Ok(None) => {
                debug!("No persisted session to restore");
                self.clear_locked().await;
                return self.session.current();
            }
            Err(e) => {
                warn!(error = %e, "Persisted session unreadable, discarding");
                self.clear_locked().await;
                return self.session.current();
            }
        };

        match self.establish(tokens).await {
            Ok((user, tokens)) => self.activate(user, tokens).await,
            Err(e) => {
                info!(error = %e, "Persisted session no longer valid");
                self.clear_locked().await;
            }
        }
        self.session.current()
    }

    /// Complete a login whose profile fetch failed, using the tokens the
    /// callback persisted
    ///
    /// Transport failures leave the tokens and the `Failed` state in place so
    /// the call can be repeated. A rejected refresh ends the session.
    ///
    /// # Errors
    /// Returns `AuthError::ProfileFetchFailed` if no session awaits a profile
    /// or the provider is still unreachable, and the refresh/storage error if
    /// the tokens turned out to be unusable
    pub async fn retry_profile(&self) -> Result<UserProfile, AuthError> {
        let _gate = self.gate.lock().await;

        let awaiting = self.session.inspect(|state| {
            matches!(state, SessionState::Failed { reason: AuthError::ProfileFetchFailed(_) })
        });
        if !awaiting {
            return Err(AuthError::ProfileFetchFailed("no login is awaiting a profile".to_string()));
        }

        let tokens = self.storage.load_tokens().await?.ok_or_else(|| {
            AuthError::ProfileFetchFailed("no persisted tokens to retry with".to_string())
        })?;

        match self.establish(tokens).await {
            Ok((user, tokens)) => {
                self.activate(user.clone(), tokens).await;
                Ok(user)
            }
            Err(e @ AuthError::ProfileFetchFailed(_)) => Err(e),
            Err(e) => {
                self.clear_locked().await;
                Err(e)
            }
        }
    }

    /// Clear persisted tokens and end the session
    ///
    /// Waits for an in-flight refresh so it cannot write tokens back after
    /// the clear.
    pub async fn clear(&self) {
        let _gate = self.gate.lock().await;
        self.clear_locked().await;
    }

    /// Probe `tokens`, refreshing once if the probe fails, and return the
    /// confirmed profile with the tokens that produced it
    async fn establish(&self, tokens: TokenSet) -> Result<(UserProfile, TokenSet), AuthError> {
        match self.provider.userinfo(&tokens.access_token).await {
            Ok(user) => return Ok((user, tokens)),
            Err(e) => debug!(error = %e, "Persisted access token rejected, refreshing"),
        }

        let refreshed = self.refresh_and_store(&tokens).await?;
        let user = self
            .provider
            .userinfo(&refreshed.access_token)
            .await
            .map_err(|e| AuthError::ProfileFetchFailed(e.to_string()))?;
        Ok((user, refreshed))
    }

    /// Run the refresh grant and persist the result as one record
    async fn refresh_and_store(&self, tokens: &TokenSet) -> Result<TokenSet, AuthError> {
        let refreshed = self.refresh_grant(tokens).await?;
        self.storage.save_tokens(&refreshed).await?;
        Ok(refreshed)
    }

    async fn refresh_grant(&self, tokens: &TokenSet) -> Result<TokenSet, AuthError> {
        let refresh_token = match tokens.refresh_token.as_deref() {
            Some(token) if tokens.can_refresh() => token,
            _ => return Err(AuthError::RefreshFailed("no refresh token".to_string())),
        };

        let response = self
            .provider
            .refresh(refresh_token)
            .await
            .map_err(|e| AuthError::RefreshFailed(e.to_string()))?;

        Ok(TokenSet::from_response(response, Some(refresh_token)))
    }

    /// Whether the session still holds `access_token`
    fn holds(&self, access_token: &str) -> bool {
        self.session.inspect(|state| state.tokens().is_some_and(|t| t.access_token == access_token))
    }

    async fn activate(&self, user: UserProfile, tokens: TokenSet) {
        let access_token = tokens.access_token.clone();
        if self.session.dispatch(SessionEvent::SessionRestored { user: user.clone(), tokens }).is_err() {
            // A new login started meanwhile; it owns the session now
            return;
        }
        info!("Session restored");
        self.remember_probe(&access_token);
        if let Err(e) = self.storage.save_user(&user).await {
            warn!(error = %e, "Failed to persist user profile");
        }
    }

    async fn clear_locked(&self) {
        *self.last_probe.lock() = None;
        if let Err(e) = self.storage.clear_session().await {
            warn!(error = %e, "Failed to clear persisted session");
        }
        // SessionCleared is accepted from every state
        let _ = self.session.dispatch(SessionEvent::SessionCleared);
    }

    fn probe_is_cached(&self, access_token: &str) -> bool {
        if self.probe_cache_ttl.is_zero() {
            return false;
        }
        self.last_probe.lock().as_ref().is_some_and(|probe| {
            probe.access_token == access_token && probe.at.elapsed() < self.probe_cache_ttl
        })
    }

    fn remember_probe(&self, access_token: &str) {
        *self.last_probe.lock() =
            Some(ProbeRecord { access_token: access_token.to_string(), at: Instant::now() });
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for token_manager.
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::store::{MemoryStore, TOKENS_KEY, USER_KEY};
    use crate::testing::{token_response, MockIdentityProvider};

    struct Fixture {
        provider: Arc<MockIdentityProvider>,
        store: Arc<MemoryStore>,
        session: Arc<SessionMachine>,
        manager: TokenManager<MockIdentityProvider, MemoryStore>,
    }

    fn fixture(probe_cache_ttl: Duration) -> Fixture {
        let provider = Arc::new(MockIdentityProvider::new());
        let store = Arc::new(MemoryStore::new());
        let session = Arc::new(SessionMachine::new());
        let manager = TokenManager::new(
            Arc::clone(&provider),
            SessionStorage::new(Arc::clone(&store)),
            Arc::clone(&session),
            probe_cache_ttl,
        );
        Fixture { provider, store, session, manager }
    }

    async fn authenticate(f: &Fixture, access: &str, refresh: Option<&str>) {
        let tokens = TokenSet::new(access, refresh.map(str::to_string), 300);
        SessionStorage::new(Arc::clone(&f.store)).save_tokens(&tokens).await.unwrap();
        f.session
            .dispatch(SessionEvent::SessionRestored { user: UserProfile::default(), tokens })
            .unwrap();
    }

    #[tokio::test]
    async fn no_session_yields_none_without_network() {
        let f = fixture(Duration::ZERO);
        assert_eq!(f.manager.get_valid_access_token().await, None);
        assert_eq!(f.provider.userinfo_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn valid_token_is_returned_as_is() {
        let f = fixture(Duration::ZERO);
        f.provider.accept_access_token("access-1");
        authenticate(&f, "access-1", Some("refresh-1")).await;

        assert_eq!(f.manager.get_valid_access_token().await.as_deref(), Some("access-1"));
        assert_eq!(f.provider.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn probe_cache_skips_repeat_probes() {
        let f = fixture(Duration::from_secs(60));
        f.provider.accept_access_token("access-1");
        authenticate(&f, "access-1", None).await;

        f.manager.get_valid_access_token().await.unwrap();
        f.manager.get_valid_access_token().await.unwrap();
        assert_eq!(f.provider.userinfo_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejected_token_is_refreshed_and_stored() {
        let f = fixture(Duration::ZERO);
        f.provider.on_refresh("refresh-1", token_response("access-2", None));
        authenticate(&f, "expired", Some("refresh-1")).await;

        assert_eq!(f.manager.get_valid_access_token().await.as_deref(), Some("access-2"));

        let stored = SessionStorage::new(Arc::clone(&f.store)).load_tokens().await.unwrap().unwrap();
        assert_eq!(stored.access_token, "access-2");
        // Not rotated: previous refresh token kept
        assert_eq!(stored.refresh_token.as_deref(), Some("refresh-1"));
        assert_eq!(f.session.access_token().as_deref(), Some("access-2"));
    }

    #[tokio::test]
    async fn failed_refresh_clears_session() {
        let f = fixture(Duration::ZERO);
        authenticate(&f, "expired", Some("revoked")).await;

        assert_eq!(f.manager.get_valid_access_token().await, None);
        assert_eq!(f.session.current(), SessionState::Unauthenticated);
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn missing_refresh_token_clears_session() {
        let f = fixture(Duration::ZERO);
        authenticate(&f, "expired", None).await;

        assert_eq!(f.manager.get_valid_access_token().await, None);
        assert_eq!(f.provider.refresh_calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.session.current(), SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let f = fixture(Duration::ZERO);
        f.provider.on_refresh("refresh-1", token_response("access-2", Some("refresh-2")));
        f.provider.set_refresh_delay(Duration::from_millis(50));
        authenticate(&f, "expired", Some("refresh-1")).await;

        let calls = (0..8).map(|_| f.manager.get_valid_access_token());
        let results = futures::future::join_all(calls).await;

        assert!(results.iter().all(|r| r.as_deref() == Some("access-2")));
        assert_eq!(f.provider.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn login_during_refresh_keeps_new_tokens() {
        let f = fixture(Duration::ZERO);
        f.provider.on_refresh("old-refresh", token_response("old-refreshed", Some("old-refresh-2")));
        f.provider.set_refresh_delay(Duration::from_millis(100));
        authenticate(&f, "old-access", Some("old-refresh")).await;

        let new_tokens = TokenSet::new("new-access", Some("new-refresh".into()), 300);
        let relogin = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            f.session.dispatch(SessionEvent::LoginStarted).unwrap();
            let gate = f.manager.gate();
            let _commit = gate.lock().await;
            SessionStorage::new(Arc::clone(&f.store)).save_tokens(&new_tokens).await.unwrap();
            f.session
                .dispatch(SessionEvent::LoginSucceeded {
                    user: UserProfile::default(),
                    tokens: new_tokens.clone(),
                })
                .unwrap();
        };

        let (returned, ()) = tokio::join!(f.manager.get_valid_access_token(), relogin);

        assert_eq!(returned, None);
        assert_eq!(f.provider.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.session.access_token().as_deref(), Some("new-access"));
        let stored = SessionStorage::new(Arc::clone(&f.store)).load_tokens().await.unwrap().unwrap();
        assert_eq!(stored.access_token, "new-access");
        assert_eq!(stored.refresh_token.as_deref(), Some("new-refresh"));
    }

    #[tokio::test]
    async fn restore_empty_store_settles_unauthenticated() {
        let f = fixture(Duration::ZERO);
        assert_eq!(f.manager.restore().await, SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn restore_corrupt_record_is_discarded() {
        let f = fixture(Duration::ZERO);
        f.store.set(TOKENS_KEY, "{garbage").await.unwrap();

        assert_eq!(f.manager.restore().await, SessionState::Unauthenticated);
        assert!(!f.store.contains(TOKENS_KEY));
    }

    #[tokio::test]
    async fn restore_refreshes_stale_tokens() {
        let f = fixture(Duration::ZERO);
        f.provider.on_refresh("refresh-1", token_response("access-2", Some("refresh-2")));
        SessionStorage::new(Arc::clone(&f.store))
            .save_tokens(&TokenSet::new("stale", Some("refresh-1".into()), 300))
            .await
            .unwrap();

        let state = f.manager.restore().await;
        assert_eq!(state.tokens().unwrap().access_token, "access-2");
        assert_eq!(state.tokens().unwrap().refresh_token.as_deref(), Some("refresh-2"));
        assert!(f.store.contains(USER_KEY));
    }

    #[tokio::test]
    async fn clear_ends_session() {
        let f = fixture(Duration::ZERO);
        authenticate(&f, "access-1", Some("refresh-1")).await;

        f.manager.clear().await;
        assert_eq!(f.session.current(), SessionState::Unauthenticated);
        assert!(f.store.is_empty());
    }
}
