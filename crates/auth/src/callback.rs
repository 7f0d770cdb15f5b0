//! Callback handler
//!
//! Second half of the redirect round trip. Validation is fail-closed and
//! strictly ordered; each step is a precondition for the next:
//!
//! 1. provider `error` → [`AuthError::Provider`]
//! 2. `code` and `state` present → [`AuthError::MissingParameter`]
//! 3. pending login present → [`AuthError::MissingPendingLogin`]
//! 4. `state` equals the stored one → [`AuthError::StateMismatch`]
//! 5. code exchange → [`AuthError::TokenExchangeFailed`]
//! 6. profile fetch → [`AuthError::ProfileFetchFailed`]
//! 7. commit tokens and profile, drop the pending login
//!
//! Failures clear tokens, profile and pending login. A failed profile fetch
//! is the one exception: the fresh tokens are persisted (but not activated)
//! so the profile can be fetched again without another login.
//!
//! Every outcome is written behind the token manager's gate (see
//! [`CallbackHandler::with_token_gate`]) so a refresh of the previous session
//! cannot overwrite the new one.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::pkce::validate_state;
use crate::session::{SessionEvent, SessionMachine, SessionState};
use crate::store::{SessionStorage, SessionStore};
use crate::traits::{IdentityProvider, UserAgent};
use crate::types::{CallbackParams, TokenSet, UserProfile};

/// Outcome of the steps after validation that need special cleanup
enum Failure {
    /// Tokens were issued but the profile could not be fetched
    ProfileFetch { tokens: TokenSet, reason: AuthError },
    /// Anything else
    Other(AuthError),
}

impl From<AuthError> for Failure {
    fn from(err: AuthError) -> Self {
        Self::Other(err)
    }
}

/// Completes logins when the provider redirects back
pub struct CallbackHandler<P: IdentityProvider, S: SessionStore, U: UserAgent> {
    config: Arc<AuthConfig>,
    provider: Arc<P>,
    storage: SessionStorage<S>,
    agent: Arc<U>,
    session: Arc<SessionMachine>,
    gate: Arc<Mutex<()>>,
}

impl<P: IdentityProvider, S: SessionStore, U: UserAgent> CallbackHandler<P, S, U> {
    /// Create a callback handler
    #[must_use]
    pub fn new(
        config: Arc<AuthConfig>,
        provider: Arc<P>,
        storage: SessionStorage<S>,
        agent: Arc<U>,
        session: Arc<SessionMachine>,
    ) -> Self {
        Self { config, provider, storage, agent, session, gate: Arc::new(Mutex::new(())) }
    }

    /// Commit outcomes behind `gate`, normally
    /// [`TokenManager::gate`](crate::token_manager::TokenManager::gate)
    #[must_use]
    pub fn with_token_gate(mut self, gate: Arc<Mutex<()>>) -> Self {
        self.gate = gate;
        self
    }

    /// Validate the redirect parameters and complete the login
    ///
    /// The redirect lands in a fresh process, so the attempt is resumed
    /// (`LoginStarted`) when the session is not already `Authenticating`.
    ///
    /// # Errors
    /// Returns the first failed validation step; the session is `Failed`
    /// with the same reason afterwards
    pub async fn handle_callback(&self, params: CallbackParams) -> Result<(), AuthError> {
        if self.session.inspect(|state| *state != SessionState::Authenticating) {
            let _ = self.session.dispatch(SessionEvent::LoginStarted);
        }

        let outcome = self.complete(params).await;
        let _commit = self.gate.lock().await;

        match outcome {
            Ok((user, tokens)) => {
                if let Err(e) = self.commit(&user, &tokens).await {
                    warn!(error = %e, "Failed to persist session");
                    self.discard_all().await;
                    return Err(self.fail(e));
                }
                info!(sub = user.sub().unwrap_or_default(), "Login completed");
                let _ = self.session.dispatch(SessionEvent::LoginSucceeded { user, tokens });
                Ok(())
            }
            Err(Failure::ProfileFetch { tokens, reason }) => {
                warn!(error = %reason, "Profile fetch failed, keeping tokens for retry");
                self.keep_tokens_only(&tokens).await;
                Err(self.fail(reason))
            }
            Err(Failure::Other(reason)) => {
                if reason.is_protocol_violation() {
                    warn!(error = %reason, "Rejected login callback");
                } else {
                    warn!(error = %reason, "Login callback failed");
                }
                self.discard_all().await;
                Err(self.fail(reason))
            }
        }
    }

    async fn complete(&self, params: CallbackParams) -> Result<(UserProfile, TokenSet), Failure> {
        if let Some(error) = params.error {
            return Err(AuthError::Provider { error, description: params.error_description }.into());
        }

        let (code, state) = match (params.code, params.state) {
            (Some(code), Some(state)) => (code, state),
            (None, Some(_)) => return Err(AuthError::MissingParameter("code".to_string()).into()),
            (Some(_), None) => return Err(AuthError::MissingParameter("state".to_string()).into()),
            (None, None) => {
                return Err(AuthError::MissingParameter("code, state".to_string()).into());
            }
        };

        let pending = self
            .storage
            .load_pending()
            .await
            .map_err(AuthError::from)?
            .ok_or(AuthError::MissingPendingLogin)?;

        if !validate_state(&pending.state, &state) {
            return Err(AuthError::StateMismatch.into());
        }

        let redirect_uri = self.config.redirect_uri(&self.agent.origin())?;
        let response = self
            .provider
            .exchange_code(&code, &pending.code_verifier, &redirect_uri)
            .await
            .map_err(|e| AuthError::TokenExchangeFailed(e.to_string()))?;
        let tokens = TokenSet::from_response(response, None);

        let user = match self.provider.userinfo(&tokens.access_token).await {
            Ok(user) => user,
            Err(e) => {
                return Err(Failure::ProfileFetch {
                    tokens,
                    reason: AuthError::ProfileFetchFailed(e.to_string()),
                });
            }
        };

        Ok((user, tokens))
    }

    async fn commit(&self, user: &UserProfile, tokens: &TokenSet) -> Result<(), AuthError> {
        self.storage.save_tokens(tokens).await?;
        self.storage.save_user(user).await?;
        if let Err(e) = self.storage.clear_pending().await {
            warn!(error = %e, "Failed to clear pending login");
        }
        Ok(())
    }

    fn fail(&self, reason: AuthError) -> AuthError {
        let _ = self.session.dispatch(SessionEvent::LoginFailed { reason: reason.clone() });
        reason
    }

    async fn discard_all(&self) {
        if let Err(e) = self.storage.clear_all().await {
            warn!(error = %e, "Failed to clear session artifacts");
        }
    }

    async fn keep_tokens_only(&self, tokens: &TokenSet) {
        if let Err(e) = self.storage.save_tokens(tokens).await {
            warn!(error = %e, "Failed to persist tokens for profile retry");
        }
        if let Err(e) = self.storage.clear_pending().await {
            warn!(error = %e, "Failed to clear pending login");
        }
        if let Err(e) = self.storage.clear_user().await {
            warn!(error = %e, "Failed to clear user profile");
        }
    }
}
