//! Secure random generation and URL-safe encoding helpers
//!
//! All randomness comes from the operating system RNG and is fallible: a
//! failing RNG is reported instead of silently producing weak values.
//!
//! SHA-256 is reached through the [`ChallengeHasher`] seam so the PKCE
//! generator can tell "primitive unavailable" (documented `plain` fallback)
//! apart from any other hashing failure (propagated).

use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Failure modes of a [`ChallengeHasher`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HashError {
    /// The hashing primitive is not available in this environment
    #[error("SHA-256 primitive unavailable: {0}")]
    Unavailable(String),

    /// The primitive exists but hashing failed
    #[error("SHA-256 hashing failed: {0}")]
    Failed(String),
}

/// SHA-256 provider used for PKCE challenges.
pub trait ChallengeHasher: Send + Sync {
    /// Compute the SHA-256 digest of `input`.
    ///
    /// # Errors
    /// [`HashError::Unavailable`] when the primitive cannot be used at all,
    /// [`HashError::Failed`] for any other failure.
    fn sha256(&self, input: &[u8]) -> Result<[u8; 32], HashError>;
}

/// Default hasher backed by the `sha2` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Hasher;

impl ChallengeHasher for Sha256Hasher {
    fn sha256(&self, input: &[u8]) -> Result<[u8; 32], HashError> {
        Ok(Sha256::digest(input).into())
    }
}

/// Fill a buffer of `len` bytes from the OS random number generator.
///
/// # Errors
/// Returns the RNG's error message if the OS source fails.
pub fn random_bytes(len: usize) -> Result<Vec<u8>, String> {
    let mut bytes = vec![0u8; len];
    OsRng.try_fill_bytes(&mut bytes).map_err(|e| e.to_string())?;
    Ok(bytes)
}

/// Encode bytes as base64url without padding.
#[must_use]
pub fn base64url_encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Decode base64url, tolerating the standard alphabet and padding.
///
/// Token payloads seen in the wild mix `-`/`_` with `+`/`/` and sometimes
/// carry `=` padding; all of these are normalised before decoding.
///
/// # Errors
/// Returns the decoder message for input that is not base64 at all.
pub fn base64url_decode_lenient(input: &str) -> Result<Vec<u8>, String> {
    let normalized: String = input
        .trim()
        .trim_end_matches('=')
        .chars()
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            other => other,
        })
        .collect();
    STANDARD_NO_PAD.decode(normalized).map_err(|e| e.to_string())
}
