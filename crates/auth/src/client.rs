//! Keycloak OpenID Connect client
//!
//! HTTP side of the flow, including:
//! - Authorization code exchange (PKCE)
//! - Refresh token grant
//! - Userinfo (doubles as the token liveness probe)
//! - Logout
//!
//! `client_secret` is only sent when configured. Browser-style public
//! clients never have one.

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use crate::config::AuthConfig;
use crate::error::{AuthError, AuthResult, ProviderError};
use crate::traits::IdentityProvider;
use crate::types::{TokenResponse, UserProfile};

/// Keycloak client for one realm
#[derive(Debug, Clone)]
pub struct KeycloakClient {
    client: Client,
    client_id: String,
    client_secret: Option<String>,
    authorization_url: Url,
    token_url: Url,
    userinfo_url: Url,
    logout_url: Url,
}

impl KeycloakClient {
    /// Create a client with its own HTTP connection pool
    ///
    /// Every request carries the configured timeout.
    ///
    /// # Errors
    /// Returns `AuthError::Configuration` if endpoints cannot be derived or
    /// the HTTP client cannot be built
    pub fn new(config: &AuthConfig) -> AuthResult<Self> {
        let client = Client::builder()
            .timeout(config.http_timeout())
            .build()
            .map_err(|e| AuthError::Configuration(format!("Failed to build HTTP client: {e}")))?;
        Self::with_http_client(config, client)
    }

    /// Create a client on top of an existing `reqwest::Client`
    ///
    /// The caller is responsible for the client's timeout.
    ///
    /// # Errors
    /// Returns `AuthError::Configuration` if endpoints cannot be derived
    pub fn with_http_client(config: &AuthConfig, client: Client) -> AuthResult<Self> {
        Ok(Self {
            client,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone().filter(|s| !s.is_empty()),
            authorization_url: config.authorization_url()?,
            token_url: config.token_url()?,
            userinfo_url: config.userinfo_url()?,
            logout_url: config.logout_url()?,
        })
    }

    fn with_secret<'a>(&'a self, mut params: Vec<(&'a str, &'a str)>) -> Vec<(&'a str, &'a str)> {
        if let Some(secret) = self.client_secret.as_deref() {
            params.push(("client_secret", secret));
        }
        params
    }

    async fn post_token(
        &self,
        operation: &'static str,
        params: &[(&str, &str)],
    ) -> Result<TokenResponse, ProviderError> {
        let response = self.client.post(self.token_url.clone()).form(params).send().await?;
        read_json(response, operation).await
    }
}

/// Fail on non-2xx with the provider's body, otherwise parse JSON
async fn read_json<T: DeserializeOwned>(
    response: Response,
    operation: &'static str,
) -> Result<T, ProviderError> {
    let body = ensure_success(response, operation).await?.text().await?;
    serde_json::from_str(&body)
        .map_err(|e| ProviderError::Parse { operation, message: e.to_string() })
}

async fn ensure_success(
    response: Response,
    operation: &'static str,
) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    debug!(operation, status = status.as_u16(), "Identity provider rejected request");
    Err(ProviderError::Status { operation, status: status.as_u16(), body })
}

#[async_trait]
impl IdentityProvider for KeycloakClient {
    fn authorization_endpoint(&self) -> Url {
        self.authorization_url.clone()
    }

    fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
        redirect_uri: &Url,
    ) -> Result<TokenResponse, ProviderError> {
        let params = self.with_secret(vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri.as_str()),
            ("client_id", self.client_id.as_str()),
            ("code_verifier", code_verifier),
        ]);
        self.post_token("token exchange", &params).await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, ProviderError> {
        let params = self.with_secret(vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
        ]);
        self.post_token("token refresh", &params).await
    }

    async fn userinfo(&self, access_token: &str) -> Result<UserProfile, ProviderError> {
        let response =
            self.client.get(self.userinfo_url.clone()).bearer_auth(access_token).send().await?;
        read_json(response, "userinfo").await
    }

    async fn logout(&self, refresh_token: &str) -> Result<(), ProviderError> {
        let params = self.with_secret(vec![
            ("client_id", self.client_id.as_str()),
            ("refresh_token", refresh_token),
        ]);
        let response = self.client.post(self.logout_url.clone()).form(&params).send().await?;
        ensure_success(response, "logout").await?;
        Ok(())
    }
}
