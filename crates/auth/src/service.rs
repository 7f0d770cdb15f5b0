//! High-level authentication service
//!
//! Wires the login initiator, callback handler, token manager and role
//! inspector around one [`SessionMachine`] and one session store, and adds
//! the operations that span them (logout, profile retry).

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

use crate::callback::CallbackHandler;
use crate::client::KeycloakClient;
use crate::config::AuthConfig;
use crate::crypto::ChallengeHasher;
use crate::error::{AuthError, AuthResult};
use crate::login::LoginInitiator;
use crate::roles::RoleInspector;
use crate::session::{SessionMachine, SessionState};
use crate::store::{SessionStorage, SessionStore};
use crate::token_manager::TokenManager;
use crate::traits::{IdentityProvider, UserAgent};
use crate::types::{CallbackParams, UserProfile};

/// Authentication service for the admin area
///
/// One instance per application (per browser context); it owns the session
/// state everything else observes.
///
/// # Type Parameters
/// * `P` - Identity provider client
/// * `S` - Session store shared across the redirect round trip
/// * `U` - User agent performing navigation
pub struct AuthService<P: IdentityProvider, S: SessionStore, U: UserAgent> {
    provider: Arc<P>,
    storage: SessionStorage<S>,
    session: Arc<SessionMachine>,
    login: LoginInitiator<P, S, U>,
    callback: CallbackHandler<P, S, U>,
    token_manager: TokenManager<P, S>,
    roles: RoleInspector,
}

impl<S: SessionStore, U: UserAgent> AuthService<KeycloakClient, S, U> {
    /// Create a service talking to Keycloak over HTTP
    ///
    /// # Errors
    /// Returns `AuthError::Configuration` if the configuration is invalid or
    /// the HTTP client cannot be built
    pub fn keycloak(config: AuthConfig, store: Arc<S>, agent: Arc<U>) -> AuthResult<Self> {
        config.validate()?;
        let provider = Arc::new(KeycloakClient::new(&config)?);
        Self::new(config, provider, store, agent)
    }
}

impl<P: IdentityProvider, S: SessionStore, U: UserAgent> AuthService<P, S, U> {
    /// Create a service from its collaborators
    ///
    /// The session starts `Initializing`; call [`start`](Self::start) once
    /// at process start.
    ///
    /// # Errors
    /// Returns `AuthError::Configuration` if the configuration is invalid
    pub fn new(
        config: AuthConfig,
        provider: Arc<P>,
        store: Arc<S>,
        agent: Arc<U>,
    ) -> AuthResult<Self> {
        config.validate()?;

        let config = Arc::new(config);
        let storage = SessionStorage::new(store);
        let session = Arc::new(SessionMachine::new());

        let login = LoginInitiator::new(
            Arc::clone(&config),
            Arc::clone(&provider),
            storage.clone(),
            Arc::clone(&agent),
            Arc::clone(&session),
        );
        let token_manager = TokenManager::new(
            Arc::clone(&provider),
            storage.clone(),
            Arc::clone(&session),
            config.probe_cache_ttl(),
        );
        let callback = CallbackHandler::new(
            Arc::clone(&config),
            Arc::clone(&provider),
            storage.clone(),
            agent,
            Arc::clone(&session),
        )
        .with_token_gate(token_manager.gate());
        let roles = RoleInspector::new(
            Arc::clone(&session),
            config.client_id.clone(),
            config.admin_roles.clone(),
        );

        Ok(Self { provider, storage, session, login, callback, token_manager, roles })
    }

    /// Replace the PKCE challenge hasher
    #[must_use]
    pub fn with_hasher(mut self, hasher: Arc<dyn ChallengeHasher>) -> Self {
        self.login = self.login.with_hasher(hasher);
        self
    }

    /// Restore the persisted session, if any, and settle the state
    ///
    /// Safe to call on the callback page too: with nothing persisted the
    /// session settles `Unauthenticated` and the callback resumes the login.
    pub async fn start(&self) -> SessionState {
        let state = self.token_manager.restore().await;
        debug!(state = state.name(), "Session initialized");
        state
    }

    /// Start a login and navigate to the provider
    ///
    /// # Errors
    /// See [`LoginInitiator::login`]
    pub async fn login(&self) -> Result<Url, AuthError> {
        self.login.login().await
    }

    /// Complete a login from parsed redirect parameters
    ///
    /// # Errors
    /// See [`CallbackHandler::handle_callback`]
    pub async fn handle_callback(&self, params: CallbackParams) -> Result<(), AuthError> {
        self.callback.handle_callback(params).await
    }

    /// Complete a login from the full redirect URL
    ///
    /// # Errors
    /// See [`CallbackHandler::handle_callback`]
    pub async fn handle_callback_url(&self, url: &Url) -> Result<(), AuthError> {
        self.callback.handle_callback(CallbackParams::from_url(url)).await
    }

    /// Usable access token for API calls, refreshed if needed
    pub async fn get_valid_access_token(&self) -> Option<String> {
        self.token_manager.get_valid_access_token().await
    }

    /// Finish a login whose profile fetch failed
    ///
    /// # Errors
    /// See [`TokenManager::retry_profile`]
    pub async fn retry_profile_fetch(&self) -> Result<UserProfile, AuthError> {
        self.token_manager.retry_profile().await
    }

    /// End the session
    ///
    /// The refresh token is revoked at the provider on a best-effort basis;
    /// local state is cleared and the session ends `Unauthenticated` even if
    /// that call fails.
    pub async fn logout(&self) {
        if let Some(refresh_token) = self.refresh_token().await {
            match self.provider.logout(&refresh_token).await {
                Ok(()) => debug!("Provider session ended"),
                Err(e) => warn!(error = %e, "Provider logout failed, clearing local session anyway"),
            }
        }

        self.token_manager.clear().await;
        if let Err(e) = self.storage.clear_pending().await {
            warn!(error = %e, "Failed to clear pending login");
        }
        info!("Logged out");
    }

    /// Current state snapshot
    #[must_use]
    pub fn current(&self) -> SessionState {
        self.session.current()
    }

    /// Whether a verified session is active
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.session.inspect(SessionState::is_authenticated)
    }

    /// Profile of the active session
    #[must_use]
    pub fn user(&self) -> Option<UserProfile> {
        self.session.inspect(|state| state.user().cloned())
    }

    /// Receive every state change
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.session.subscribe()
    }

    /// Resolve once the state has left `Initializing`
    pub async fn wait_until_settled(&self) -> SessionState {
        self.session.wait_until_settled().await
    }

    /// Whether the session holds role `name`; a UI hint only
    #[must_use]
    pub fn has_capability(&self, name: &str) -> bool {
        self.roles.has_capability(name)
    }

    /// Whether the session holds an admin role; a UI hint only
    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.roles.is_admin()
    }

    /// The shared state machine
    #[must_use]
    pub fn session(&self) -> Arc<SessionMachine> {
        Arc::clone(&self.session)
    }

    /// Refresh token of the active session, or of tokens kept for a
    /// profile retry
    async fn refresh_token(&self) -> Option<String> {
        let active = self.session.inspect(|state| state.tokens().and_then(|t| t.refresh_token.clone()));
        let token = match active {
            Some(token) => Some(token),
            None => match self.storage.load_tokens().await {
                Ok(tokens) => tokens.and_then(|t| t.refresh_token),
                Err(e) => {
                    debug!(error = %e, "No readable tokens to revoke");
                    None
                }
            },
        };
        token.filter(|t| !t.is_empty())
    }
}

impl<P: IdentityProvider, S: SessionStore, U: UserAgent> fmt::Debug for AuthService<P, S, U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthService")
            .field("client_id", &self.provider.client_id())
            .field("state", &self.session.inspect(|state| state.name()))
            .finish_non_exhaustive()
    }
}
