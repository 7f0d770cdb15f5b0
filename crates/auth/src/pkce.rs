//! PKCE (Proof Key for Code Exchange) implementation for OAuth 2.0
//!
//! Implements RFC 7636. A fresh [`PkceChallenge`] is generated for every
//! login attempt; the verifier stays in the session store until the callback
//! exchanges the authorization code.

use std::fmt;

use tracing::warn;

use crate::crypto::{base64url_encode, random_bytes, ChallengeHasher, HashError, Sha256Hasher};
use crate::error::AuthError;

/// Random bytes behind a verifier (32 bytes → 43 base64url characters)
const VERIFIER_BYTES: usize = 32;

/// Random bytes behind a state token
const STATE_BYTES: usize = 32;

/// RFC 7636 length bounds for a code verifier
pub const VERIFIER_MIN_LEN: usize = 43;
/// RFC 7636 length bounds for a code verifier
pub const VERIFIER_MAX_LEN: usize = 128;

/// PKCE code challenge method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeMethod {
    /// `BASE64URL(SHA256(verifier))`
    S256,
    /// Challenge equals the verifier. Only used when SHA-256 is unavailable.
    Plain,
}

impl ChallengeMethod {
    /// RFC 7636 identifier sent as `code_challenge_method`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::S256 => "S256",
            Self::Plain => "plain",
        }
    }
}

impl fmt::Display for ChallengeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generate a cryptographically secure code verifier
///
/// Returns 32 OS-random bytes as base64url without padding (43 characters).
///
/// # Errors
/// Returns [`AuthError::Random`] if the OS random source fails
pub fn generate_code_verifier() -> Result<String, AuthError> {
    let bytes = random_bytes(VERIFIER_BYTES).map_err(AuthError::Random)?;
    Ok(base64url_encode(&bytes))
}

/// Generate code challenge from verifier using SHA256
///
/// Per RFC 7636, the challenge is `BASE64URL(SHA256(ASCII(code_verifier)))`.
///
/// # Errors
/// Returns the hasher's error unchanged
pub fn generate_code_challenge(
    hasher: &dyn ChallengeHasher,
    verifier: &str,
) -> Result<String, HashError> {
    let digest = hasher.sha256(verifier.as_bytes())?;
    Ok(base64url_encode(&digest))
}

/// Generate a random state token for CSRF protection
///
/// # Errors
/// Returns [`AuthError::Random`] if the OS random source fails
pub fn generate_state() -> Result<String, AuthError> {
    let bytes = random_bytes(STATE_BYTES).map_err(AuthError::Random)?;
    Ok(base64url_encode(&bytes))
}

/// Exact comparison of the stored and returned state.
#[must_use]
pub fn validate_state(expected: &str, actual: &str) -> bool {
    expected == actual
}

/// PKCE triple for one authorization request
#[derive(Clone, PartialEq, Eq)]
pub struct PkceChallenge {
    /// Random secret, kept in the session store until token exchange
    pub verifier: String,

    /// Value sent in the authorization request
    pub challenge: String,

    /// How `challenge` was derived from `verifier`
    pub method: ChallengeMethod,
}

impl fmt::Debug for PkceChallenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PkceChallenge")
            .field("verifier", &"<redacted>")
            .field("challenge", &self.challenge)
            .field("method", &self.method)
            .finish()
    }
}

impl PkceChallenge {
    /// Generate a challenge with the built-in SHA-256 hasher.
    ///
    /// # Examples
    /// ```
    /// use peppertree_auth::pkce::{ChallengeMethod, PkceChallenge};
    ///
    /// let pkce = PkceChallenge::generate().expect("Failed to generate PKCE challenge");
    /// assert_eq!(pkce.verifier.len(), 43);
    /// assert_eq!(pkce.method, ChallengeMethod::S256);
    /// ```
    ///
    /// # Errors
    /// Returns [`AuthError::Random`] if random generation fails
    pub fn generate() -> Result<Self, AuthError> {
        Self::generate_with(&Sha256Hasher)
    }

    /// Generate a challenge using `hasher`.
    ///
    /// When the hasher reports [`HashError::Unavailable`] the challenge
    /// degrades to `plain` (challenge = verifier) and a warning is logged,
    /// since this weakens the protocol. Any other hashing failure is an
    /// error.
    ///
    /// # Errors
    /// Returns [`AuthError::Random`] for RNG failures and hashing failures
    /// other than unavailability
    pub fn generate_with(hasher: &dyn ChallengeHasher) -> Result<Self, AuthError> {
        let verifier = generate_code_verifier()?;

        match generate_code_challenge(hasher, &verifier) {
            Ok(challenge) => Ok(Self { verifier, challenge, method: ChallengeMethod::S256 }),
            Err(HashError::Unavailable(reason)) => {
                warn!(
                    reason = %reason,
                    "SHA-256 unavailable, falling back to plain PKCE challenge method"
                );
                Ok(Self { challenge: verifier.clone(), verifier, method: ChallengeMethod::Plain })
            }
            Err(err @ HashError::Failed(_)) => Err(AuthError::Random(err.to_string())),
        }
    }
}
