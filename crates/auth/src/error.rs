//! Error taxonomy for the authentication client
//!
//! Three layers of errors exist:
//!
//! - [`ProviderError`]: transport and HTTP failures talking to the identity
//!   provider
//! - [`StoreError`]: failures of the persisted session store
//! - [`AuthError`]: the protocol-level taxonomy surfaced to callers and kept
//!   inside [`SessionState::Failed`](crate::session::SessionState::Failed)
//!
//! `AuthError` only carries strings so that it is `Clone + PartialEq` and can
//! be stored in the session state and compared in tests.

use thiserror::Error;

/// Result alias used across the crate.
pub type AuthResult<T> = Result<T, AuthError>;

/// Protocol-level authentication errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Missing or invalid client settings (fatal, surfaced at startup)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The identity provider redirected back with an error code
    #[error("Identity provider error: {error}{}", describe(.description))]
    Provider {
        /// OAuth error code (e.g. `access_denied`)
        error: String,
        /// Optional human-readable description supplied by the provider
        description: Option<String>,
    },

    /// A required redirect parameter was absent
    #[error("Missing callback parameter: {0}")]
    MissingParameter(String),

    /// No pending login exists for this callback (replay, cleared storage,
    /// or another tab completed first)
    #[error("No pending login found for this callback")]
    MissingPendingLogin,

    /// The returned `state` does not match the stored one
    #[error("State parameter mismatch")]
    StateMismatch,

    /// Authorization code exchange failed
    #[error("Token exchange failed: {0}")]
    TokenExchangeFailed(String),

    /// Refresh-token grant failed
    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    /// Userinfo request failed
    #[error("Profile fetch failed: {0}")]
    ProfileFetchFailed(String),

    /// Malformed token payload
    #[error("Token decode error: {0}")]
    Decode(String),

    /// Session store failure
    #[error("Session storage error: {0}")]
    Storage(String),

    /// Secure random generation or hashing failure
    #[error("Secure random generation failed: {0}")]
    Random(String),

    /// The user agent refused to navigate
    #[error("Navigation failed: {0}")]
    Navigation(String),
}

fn describe(description: &Option<String>) -> String {
    description.as_deref().map(|d| format!(" ({d})")).unwrap_or_default()
}

impl AuthError {
    /// Protocol-integrity violations are hostile or stale input and are never
    /// retried automatically.
    #[must_use]
    pub const fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::MissingParameter(_) | Self::MissingPendingLogin | Self::StateMismatch)
    }

    /// Network/provider failures the user may retry by logging in again.
    #[must_use]
    pub const fn is_retryable_by_login(&self) -> bool {
        matches!(
            self,
            Self::Provider { .. }
                | Self::TokenExchangeFailed(_)
                | Self::RefreshFailed(_)
                | Self::ProfileFetchFailed(_)
                | Self::Navigation(_)
        )
    }
}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Errors returned by [`IdentityProvider`](crate::traits::IdentityProvider)
/// implementations.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// HTTP request failed (connect, timeout, TLS)
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Provider answered with a non-success status
    #[error("{operation} returned HTTP {status}: {body}")]
    Status {
        /// Operation that failed (e.g. "token exchange")
        operation: &'static str,
        /// HTTP status code
        status: u16,
        /// Raw response body (the provider's error document)
        body: String,
    },

    /// Response body could not be parsed
    #[error("Failed to parse {operation} response: {message}")]
    Parse {
        /// Operation whose response was malformed
        operation: &'static str,
        /// Parser message
        message: String,
    },
}

impl ProviderError {
    /// HTTP status for `Status` errors.
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether the provider rejected the credential itself (401/403).
    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        matches!(self.status(), Some(401 | 403))
    }
}

/// Errors returned by [`SessionStore`](crate::store::SessionStore)
/// implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend-specific failure
    #[error("Store backend error: {0}")]
    Backend(String),
}
