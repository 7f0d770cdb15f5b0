//! Traits for identity-provider and user-agent operations
//!
//! These traits enable dependency injection and testing by abstracting
//! external collaborators (the OAuth server and the browser that carries the
//! redirect round trip).

use async_trait::async_trait;
use url::Url;

use crate::error::ProviderError;
use crate::types::{TokenResponse, UserProfile};

/// Trait for identity provider operations
///
/// [`KeycloakClient`](crate::client::KeycloakClient) is the production
/// implementation; tests point it at a `wiremock` server.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Authorization endpoint the user agent is sent to.
    ///
    /// Query parameters are appended by the caller.
    fn authorization_endpoint(&self) -> Url;

    /// Client identifier registered with the provider
    fn client_id(&self) -> &str;

    /// Exchange an authorization code for tokens
    ///
    /// # Arguments
    /// * `code` - Authorization code from the redirect
    /// * `code_verifier` - PKCE verifier whose challenge started the flow
    /// * `redirect_uri` - Must be identical to the one sent in the
    ///   authorization request
    ///
    /// # Errors
    /// Returns error if the request fails or the provider rejects the grant
    async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
        redirect_uri: &Url,
    ) -> Result<TokenResponse, ProviderError>;

    /// Refresh access token using refresh token
    ///
    /// # Errors
    /// Returns error if refresh fails or token is invalid/revoked
    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, ProviderError>;

    /// Fetch the user profile. Also used as the access-token liveness probe.
    ///
    /// # Errors
    /// Returns error if the token is rejected or the request fails
    async fn userinfo(&self, access_token: &str) -> Result<UserProfile, ProviderError>;

    /// End the provider-side session for `refresh_token`
    ///
    /// # Errors
    /// Returns error if the request fails or the provider rejects it
    async fn logout(&self, refresh_token: &str) -> Result<(), ProviderError>;
}

/// The browser (or embedding shell) that performs top-level navigation
pub trait UserAgent: Send + Sync {
    /// Origin the application is currently served from.
    ///
    /// Used to derive the redirect URI per call instead of hard-coding it.
    fn origin(&self) -> Url;

    /// Leave the application for `url`.
    ///
    /// # Errors
    /// Returns a description if navigation could not be started
    fn navigate(&self, url: &Url) -> Result<(), String>;
}
