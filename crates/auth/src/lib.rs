//! OAuth 2.0 Authorization Code + PKCE client for the Peppertree admin area
//!
//! Acquires, stores, refreshes and inspects Keycloak credentials on behalf of
//! the admin pages of the booking site. Token issuance, signature
//! verification and authorization policy stay with the identity provider and
//! the booking API.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   AuthService   │  Orchestrator, logout
//! └────────┬────────┘
//!          │
//!          ├──► LoginInitiator   (PKCE + state, redirect)
//!          ├──► CallbackHandler  (validation, code exchange, profile)
//!          ├──► TokenManager     (probe, single-flight refresh, restore)
//!          ├──► RoleInspector    (unverified JWT role hints)
//!          │
//!          ├──► SessionMachine   (the one observable session state)
//!          ├──► SessionStore     (survives the redirect round trip)
//!          └──► IdentityProvider (KeycloakClient over HTTP)
//! ```
//!
//! `LoginInitiator` and `CallbackHandler` are separate entry points: the
//! redirect ends the first process (page) and starts the second, which finds
//! the pending login through the [`SessionStore`] only.
//!
//! # Usage Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use peppertree_auth::{AuthService, FileStore, UserAgent};
//! use url::Url;
//!
//! struct Browser;
//!
//! impl UserAgent for Browser {
//!     fn origin(&self) -> Url {
//!         Url::parse("https://peppertree.example").unwrap_or_else(|_| unreachable!())
//!     }
//!
//!     fn navigate(&self, url: &Url) -> Result<(), String> {
//!         println!("Open {url}");
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = peppertree_auth::config::load(None)?;
//!     let store = Arc::new(FileStore::new("session.json"));
//!     let auth = AuthService::keycloak(config, store, Arc::new(Browser))?;
//!
//!     auth.start().await;
//!     if !auth.is_authenticated() {
//!         auth.login().await?;
//!         return Ok(());
//!     }
//!
//!     if let Some(token) = auth.get_valid_access_token().await {
//!         println!("Bearer token of {} bytes", token.len());
//!     }
//!     println!("Admin: {}", auth.is_admin());
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! - **[`crypto`]**: OS randomness, base64url, SHA-256 seam
//! - **[`pkce`]**: PKCE challenge and state generation
//! - **[`store`]** / **[`file_store`]**: persisted session records
//! - **[`login`]** / **[`callback`]**: the two halves of the redirect
//! - **[`token_manager`]**: token validity and refresh
//! - **[`session`]**: state machine and change notifications
//! - **[`roles`]**: role checks on the access token
//! - **[`client`]**: Keycloak HTTP client
//! - **[`config`]**: configuration from environment or file
//!
//! # Security Notes
//!
//! - Role checks decode the access token without verifying its signature;
//!   they only decide what the UI shows
//! - Tokens, verifiers and codes are never logged
//! - `state` mismatches abort before any token request

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod callback;
pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod file_store;
pub mod login;
pub mod observability;
pub mod pkce;
pub mod roles;
pub mod service;
pub mod session;
pub mod store;
pub mod token_manager;
pub mod traits;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use callback::CallbackHandler;
pub use client::KeycloakClient;
pub use config::AuthConfig;
pub use error::{AuthError, AuthResult, ProviderError, StoreError};
pub use file_store::FileStore;
pub use login::LoginInitiator;
pub use pkce::{generate_code_challenge, generate_code_verifier, generate_state, validate_state};
pub use pkce::{ChallengeMethod, PkceChallenge};
pub use roles::{Claims, RoleInspector};
pub use service::AuthService;
pub use session::{transition, InvalidTransition, SessionEvent, SessionMachine, SessionState};
pub use store::{MemoryStore, SessionStorage, SessionStore};
pub use token_manager::TokenManager;
pub use traits::{IdentityProvider, UserAgent};
pub use types::{CallbackParams, PendingLogin, TokenResponse, TokenSet, UserProfile};
