//! Authorization flow initiator
//!
//! First half of the redirect round trip: generate per-attempt secrets,
//! persist them, and send the user agent to the provider. The second half
//! ([`CallbackHandler`](crate::callback::CallbackHandler)) runs in a fresh
//! page load and finds the secrets through the session store only.

use std::sync::Arc;

use tracing::{info, warn};
use url::Url;

use crate::config::AuthConfig;
use crate::crypto::{ChallengeHasher, Sha256Hasher};
use crate::error::AuthError;
use crate::pkce::{generate_state, PkceChallenge};
use crate::session::{SessionEvent, SessionMachine};
use crate::store::{SessionStorage, SessionStore};
use crate::traits::{IdentityProvider, UserAgent};
use crate::types::PendingLogin;

/// Parameters of one authorization request
#[derive(Debug, Clone, Copy)]
pub struct AuthorizationRequest<'a> {
    /// Registered client id
    pub client_id: &'a str,
    /// Callback URL on the current origin
    pub redirect_uri: &'a Url,
    /// Space-separated scopes
    pub scope: &'a str,
    /// Anti-CSRF state
    pub state: &'a str,
    /// PKCE challenge and method
    pub pkce: &'a PkceChallenge,
}

/// Append the authorization request to the provider's endpoint
#[must_use]
pub fn build_authorization_url(endpoint: &Url, request: &AuthorizationRequest<'_>) -> Url {
    let mut url = endpoint.clone();
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", request.client_id)
        .append_pair("redirect_uri", request.redirect_uri.as_str())
        .append_pair("scope", request.scope)
        .append_pair("state", request.state)
        .append_pair("code_challenge", &request.pkce.challenge)
        .append_pair("code_challenge_method", request.pkce.method.as_str());
    url
}

/// Starts logins
pub struct LoginInitiator<P: IdentityProvider, S: SessionStore, U: UserAgent> {
    config: Arc<AuthConfig>,
    provider: Arc<P>,
    storage: SessionStorage<S>,
    agent: Arc<U>,
    session: Arc<SessionMachine>,
    hasher: Arc<dyn ChallengeHasher>,
}

impl<P: IdentityProvider, S: SessionStore, U: UserAgent> LoginInitiator<P, S, U> {
    /// Create an initiator using the built-in SHA-256 hasher
    #[must_use]
    pub fn new(
        config: Arc<AuthConfig>,
        provider: Arc<P>,
        storage: SessionStorage<S>,
        agent: Arc<U>,
        session: Arc<SessionMachine>,
    ) -> Self {
        Self { config, provider, storage, agent, session, hasher: Arc::new(Sha256Hasher) }
    }

    /// Replace the challenge hasher
    #[must_use]
    pub fn with_hasher(mut self, hasher: Arc<dyn ChallengeHasher>) -> Self {
        self.hasher = hasher;
        self
    }

    /// Start a login and navigate the user agent to the provider
    ///
    /// Any previous pending login is replaced, so only the latest attempt's
    /// callback can validate. Returns the authorization URL navigated to.
    ///
    /// # Errors
    /// Random generation, storage, URL construction and navigation failures
    /// are returned after dispatching `LoginFailed`; nothing is navigated to
    /// in that case.
    pub async fn login(&self) -> Result<Url, AuthError> {
        // Accepted from every state
        let _ = self.session.dispatch(SessionEvent::LoginStarted);

        let url = match self.prepare().await {
            Ok(url) => url,
            Err(e) => return Err(self.fail(e).await),
        };

        if let Err(reason) = self.agent.navigate(&url) {
            return Err(self.fail(AuthError::Navigation(reason)).await);
        }

        info!(endpoint = %self.provider.authorization_endpoint(), "Redirecting to identity provider");
        Ok(url)
    }

    async fn prepare(&self) -> Result<Url, AuthError> {
        let state = generate_state()?;
        let pkce = PkceChallenge::generate_with(self.hasher.as_ref())?;
        let redirect_uri = self.config.redirect_uri(&self.agent.origin())?;

        self.storage
            .save_pending(&PendingLogin { state: state.clone(), code_verifier: pkce.verifier.clone() })
            .await?;

        let scope = self.config.scope_string();
        Ok(build_authorization_url(
            &self.provider.authorization_endpoint(),
            &AuthorizationRequest {
                client_id: self.provider.client_id(),
                redirect_uri: &redirect_uri,
                scope: &scope,
                state: &state,
                pkce: &pkce,
            },
        ))
    }

    async fn fail(&self, reason: AuthError) -> AuthError {
        warn!(error = %reason, "Login could not be started");
        if let Err(e) = self.storage.clear_pending().await {
            warn!(error = %e, "Failed to clear pending login");
        }
        let _ = self.session.dispatch(SessionEvent::LoginFailed { reason: reason.clone() });
        reason
    }
}
