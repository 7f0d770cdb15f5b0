//! OAuth 2.0 types and structures
//!
//! Token sets, user profiles, pending-login artifacts and callback
//! parameters. Everything that is persisted derives `Serialize`/`Deserialize`
//! and is stored as a single JSON record per key.

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

/// Lifetime assumed when the provider omits `expires_in`
const DEFAULT_EXPIRES_IN: i64 = 300;

/// OAuth 2.0 access and refresh tokens with metadata
///
/// `expires_at` is computed locally when the set is created and is only
/// informational: validity is always decided by asking the provider.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    /// Bearer access token (a JWT for Keycloak)
    pub access_token: String,

    /// Refresh token; optional because some grants don't issue one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// ID token (OpenID Connect)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,

    /// Token type, "Bearer" in practice
    pub token_type: String,

    /// Access token lifetime in seconds as issued
    pub expires_in: i64,

    /// Absolute expiration timestamp (UTC), derived from `expires_in`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    /// Granted scopes (space-separated)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl TokenSet {
    /// Create a new `TokenSet` with calculated expiration time
    #[must_use]
    pub fn new(access_token: impl Into<String>, refresh_token: Option<String>, expires_in: i64) -> Self {
        // Out-of-range lifetimes from the provider leave the expiry unknown
        let expires_at = TimeDelta::try_seconds(expires_in)
            .filter(|_| expires_in > 0)
            .and_then(|lifetime| Utc::now().checked_add_signed(lifetime));

        Self {
            access_token: access_token.into(),
            refresh_token,
            id_token: None,
            token_type: "Bearer".to_string(),
            expires_in,
            expires_at,
            scope: None,
        }
    }

    /// Build a set from a token endpoint response.
    ///
    /// Providers that do not rotate refresh tokens omit `refresh_token` from
    /// refresh responses; in that case `previous_refresh_token` is carried
    /// over so the stored pair stays usable.
    #[must_use]
    pub fn from_response(response: TokenResponse, previous_refresh_token: Option<&str>) -> Self {
        let mut tokens = Self::new(
            response.access_token,
            response
                .refresh_token
                .or_else(|| previous_refresh_token.map(str::to_string)),
            response.expires_in,
        );
        tokens.token_type = response.token_type;
        tokens.id_token = response.id_token;
        tokens.scope = response.scope;
        tokens
    }

    /// Seconds until the locally computed expiry, if one is known.
    #[must_use]
    pub fn seconds_until_expiry(&self) -> Option<i64> {
        self.expires_at.map(|expires_at| (expires_at - Utc::now()).num_seconds())
    }

    /// Whether a refresh grant is possible.
    #[must_use]
    pub fn can_refresh(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

impl fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// OAuth token response from the token endpoint (RFC 6749 §5.1)
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    /// Issued access token
    pub access_token: String,
    /// Issued (or rotated) refresh token
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// OpenID Connect ID token
    #[serde(default)]
    pub id_token: Option<String>,
    /// Token type
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Lifetime in seconds
    #[serde(default = "default_expires_in")]
    pub expires_in: i64,
    /// Granted scope
    #[serde(default)]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

const fn default_expires_in() -> i64 {
    DEFAULT_EXPIRES_IN
}

/// User claims returned by the userinfo endpoint.
///
/// Treated as an opaque mapping; accessors cover the claims the admin UI
/// displays.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserProfile(pub Map<String, Value>);

impl UserProfile {
    /// Look up an arbitrary claim.
    #[must_use]
    pub fn claim(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    fn str_claim(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    /// Subject identifier.
    #[must_use]
    pub fn sub(&self) -> Option<&str> {
        self.str_claim("sub")
    }

    /// Email address.
    #[must_use]
    pub fn email(&self) -> Option<&str> {
        self.str_claim("email")
    }

    /// Full display name.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.str_claim("name")
    }

    /// Login name.
    #[must_use]
    pub fn preferred_username(&self) -> Option<&str> {
        self.str_claim("preferred_username")
    }
}

/// Artifacts of one in-flight login, persisted across the redirect
#[derive(Clone, PartialEq, Eq)]
pub struct PendingLogin {
    /// Anti-CSRF state sent in the authorization request
    pub state: String,
    /// PKCE verifier whose challenge was sent in the request
    pub code_verifier: String,
}

impl fmt::Debug for PendingLogin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingLogin")
            .field("state", &self.state)
            .field("code_verifier", &"<redacted>")
            .finish()
    }
}

/// Parameters the identity provider appends to the redirect URI
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CallbackParams {
    /// Authorization code
    pub code: Option<String>,
    /// Returned state
    pub state: Option<String>,
    /// OAuth error code
    pub error: Option<String>,
    /// OAuth error description
    pub error_description: Option<String>,
}

impl CallbackParams {
    /// Extract callback parameters from the redirect URL's query string.
    ///
    /// Empty values are treated as absent.
    #[must_use]
    pub fn from_url(url: &Url) -> Self {
        let mut params = Self::default();
        for (key, value) in url.query_pairs() {
            if value.is_empty() {
                continue;
            }
            let value = Some(value.into_owned());
            match key.as_ref() {
                "code" => params.code = value,
                "state" => params.state = value,
                "error" => params.error = value,
                "error_description" => params.error_description = value,
                _ => {}
            }
        }
        params
    }
}
