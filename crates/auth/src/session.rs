//! Session state machine
//!
//! [`transition`] is a pure reducer over [`SessionState`] and
//! [`SessionEvent`]. [`SessionMachine`] owns the single current state,
//! applies events through the reducer and notifies subscribers over a
//! `tokio::sync::watch` channel. No other component mutates the state.
//!
//! | event             | accepted from                 | result            |
//! |-------------------|-------------------------------|-------------------|
//! | `LoginStarted`    | any                           | `Authenticating`  |
//! | `LoginSucceeded`  | `Authenticating`              | `Authenticated`   |
//! | `LoginFailed`     | `Authenticating`              | `Failed`          |
//! | `SessionRestored` | `Initializing`, `Failed`      | `Authenticated`   |
//! | `TokensRefreshed` | `Authenticated`               | `Authenticated`   |
//! | `SessionCleared`  | any                           | `Unauthenticated` |

use std::fmt;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::AuthError;
use crate::types::{TokenSet, UserProfile};

/// Authentication state observed by the rest of the application
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    /// Persisted session not yet checked (process start)
    Initializing,
    /// No session
    Unauthenticated,
    /// A login attempt is in flight (redirect round trip)
    Authenticating,
    /// Logged in with a verified profile
    Authenticated {
        /// Profile returned by the userinfo endpoint
        user: UserProfile,
        /// Tokens currently in use
        tokens: TokenSet,
    },
    /// The last login attempt failed; `login()` is always a valid retry
    Failed {
        /// Why it failed
        reason: AuthError,
    },
}

impl SessionState {
    /// Short name for logs and errors
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Initializing => "Initializing",
            Self::Unauthenticated => "Unauthenticated",
            Self::Authenticating => "Authenticating",
            Self::Authenticated { .. } => "Authenticated",
            Self::Failed { .. } => "Failed",
        }
    }

    /// Whether a usable session exists
    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated { .. })
    }

    /// Whether the startup check has finished
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        !matches!(self, Self::Initializing)
    }

    /// Tokens of an authenticated session
    #[must_use]
    pub const fn tokens(&self) -> Option<&TokenSet> {
        match self {
            Self::Authenticated { tokens, .. } => Some(tokens),
            _ => None,
        }
    }

    /// Profile of an authenticated session
    #[must_use]
    pub const fn user(&self) -> Option<&UserProfile> {
        match self {
            Self::Authenticated { user, .. } => Some(user),
            _ => None,
        }
    }

    /// Failure reason, if the state is `Failed`
    #[must_use]
    pub const fn failure(&self) -> Option<&AuthError> {
        match self {
            Self::Failed { reason } => Some(reason),
            _ => None,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Requests to change the session state
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// `login()` was called
    LoginStarted,
    /// The callback completed the code exchange and profile fetch
    LoginSucceeded {
        /// Fetched profile
        user: UserProfile,
        /// Issued tokens
        tokens: TokenSet,
    },
    /// The login attempt failed
    LoginFailed {
        /// Why it failed
        reason: AuthError,
    },
    /// A persisted session was validated
    SessionRestored {
        /// Profile confirmed by the provider
        user: UserProfile,
        /// Valid (possibly refreshed) tokens
        tokens: TokenSet,
    },
    /// The access token was refreshed
    TokensRefreshed {
        /// Replacement token set
        tokens: TokenSet,
    },
    /// Logout, failed refresh, or nothing to restore
    SessionCleared,
}

impl SessionEvent {
    /// Short name for logs and errors
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::LoginStarted => "LoginStarted",
            Self::LoginSucceeded { .. } => "LoginSucceeded",
            Self::LoginFailed { .. } => "LoginFailed",
            Self::SessionRestored { .. } => "SessionRestored",
            Self::TokensRefreshed { .. } => "TokensRefreshed",
            Self::SessionCleared => "SessionCleared",
        }
    }
}

/// An event that is not accepted in the current state
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{event} is not valid in state {from}")]
pub struct InvalidTransition {
    /// State the event was applied to
    pub from: &'static str,
    /// Rejected event
    pub event: &'static str,
}

/// Compute the state that follows `state` on `event`
///
/// # Errors
/// Returns [`InvalidTransition`] for events the current state does not
/// accept; the state is then left unchanged by the caller.
pub fn transition(state: &SessionState, event: SessionEvent) -> Result<SessionState, InvalidTransition> {
    use SessionEvent as E;
    use SessionState as S;

    match (state, event) {
        (_, E::LoginStarted) => Ok(S::Authenticating),
        (S::Authenticating, E::LoginSucceeded { user, tokens }) => {
            Ok(S::Authenticated { user, tokens })
        }
        (S::Authenticating, E::LoginFailed { reason }) => Ok(S::Failed { reason }),
        (S::Initializing | S::Failed { .. }, E::SessionRestored { user, tokens }) => {
            Ok(S::Authenticated { user, tokens })
        }
        (S::Authenticated { user, .. }, E::TokensRefreshed { tokens }) => {
            Ok(S::Authenticated { user: user.clone(), tokens })
        }
        (_, E::SessionCleared) => Ok(S::Unauthenticated),
        (state, event) => Err(InvalidTransition { from: state.name(), event: event.name() }),
    }
}

/// Owner of the current [`SessionState`]
///
/// Starts in `Initializing`. Components report events with
/// [`dispatch`](Self::dispatch); observers read [`current`](Self::current)
/// or [`subscribe`](Self::subscribe) for changes.
#[derive(Debug)]
pub struct SessionMachine {
    tx: watch::Sender<SessionState>,
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMachine {
    /// Create a machine in `Initializing`
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionState::Initializing);
        Self { tx }
    }

    /// Apply `event` to the current state
    ///
    /// Rejected events leave the state unchanged and are logged.
    ///
    /// # Errors
    /// Returns [`InvalidTransition`] if the event was rejected
    pub fn dispatch(&self, event: SessionEvent) -> Result<(), InvalidTransition> {
        let mut outcome = Ok(());
        self.tx.send_if_modified(|state| match transition(state, event) {
            Ok(next) => {
                info!(from = state.name(), to = next.name(), "Session state changed");
                *state = next;
                true
            }
            Err(rejected) => {
                warn!(from = rejected.from, event = rejected.event, "Rejected session event");
                outcome = Err(rejected);
                false
            }
        });
        outcome
    }

    /// Snapshot of the current state
    #[must_use]
    pub fn current(&self) -> SessionState {
        self.tx.borrow().clone()
    }

    /// Run `f` against the current state without cloning it
    pub fn inspect<R>(&self, f: impl FnOnce(&SessionState) -> R) -> R {
        f(&self.tx.borrow())
    }

    /// Access token of the authenticated session, without any validity check
    #[must_use]
    pub fn access_token(&self) -> Option<String> {
        self.inspect(|state| state.tokens().map(|t| t.access_token.clone()))
    }

    /// Receive every subsequent state change
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    /// Resolve once the state has left `Initializing`
    pub async fn wait_until_settled(&self) -> SessionState {
        let mut rx = self.subscribe();
        let settled = match rx.wait_for(SessionState::is_settled).await {
            Ok(state) => state.clone(),
            Err(_) => self.current(),
        };
        settled
    }
}
