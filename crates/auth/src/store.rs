//! Persisted session store
//!
//! [`SessionStore`] is a string key/value seam that survives the redirect
//! round trip (and process restarts when backed by
//! [`FileStore`](crate::file_store::FileStore)). [`SessionStorage`] layers
//! typed JSON records on top of it.
//!
//! Persisted schema, one JSON value per key:
//!
//! | key                   | record          |
//! |-----------------------|-----------------|
//! | `auth_tokens`         | [`TokenSet`]    |
//! | `auth_user`           | [`UserProfile`] |
//! | `oauth_state`         | state string    |
//! | `oauth_code_verifier` | verifier string |

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::error::StoreError;
use crate::types::{PendingLogin, TokenSet, UserProfile};

/// Key holding the serialized [`TokenSet`]
pub const TOKENS_KEY: &str = "auth_tokens";
/// Key holding the serialized [`UserProfile`]
pub const USER_KEY: &str = "auth_user";
/// Key holding the pending login's state
pub const STATE_KEY: &str = "oauth_state";
/// Key holding the pending login's PKCE verifier
pub const VERIFIER_KEY: &str = "oauth_code_verifier";

/// Trait for session storage backends
///
/// Values are opaque strings. Implementations must make each `set` atomic
/// per key; no multi-key transactions are required.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Read the value stored under `key`
    ///
    /// # Errors
    /// Returns error if the backend cannot be read
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Store `value` under `key`, replacing any previous value
    ///
    /// # Errors
    /// Returns error if the backend cannot be written
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Remove `key`; removing an absent key is not an error
    ///
    /// # Errors
    /// Returns error if the backend cannot be written
    async fn remove(&self, key: &str) -> Result<(), StoreError>;
}

#[async_trait]
impl<S: SessionStore + ?Sized> SessionStore for Arc<S> {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        (**self).set(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        (**self).remove(key).await
    }
}

/// Typed access to the session records of a [`SessionStore`]
///
/// Cheap to clone; all clones share the underlying store. The two halves of
/// a pending login are read and written as one unit across clones.
pub struct SessionStorage<S: ?Sized> {
    store: Arc<S>,
    pending_lock: Arc<tokio::sync::Mutex<()>>,
}

impl<S: ?Sized> Clone for SessionStorage<S> {
    fn clone(&self) -> Self {
        Self { store: Arc::clone(&self.store), pending_lock: Arc::clone(&self.pending_lock) }
    }
}

impl<S: SessionStore + ?Sized> SessionStorage<S> {
    /// Wrap a shared store
    pub fn new(store: Arc<S>) -> Self {
        Self { store, pending_lock: Arc::new(tokio::sync::Mutex::new(())) }
    }

    /// The underlying store
    pub const fn inner(&self) -> &Arc<S> {
        &self.store
    }

    async fn load_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.store.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn save_json<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let raw = serde_json::to_string(value)?;
        self.store.set(key, &raw).await
    }

    /// Load the persisted token set
    ///
    /// # Errors
    /// Returns error on backend failure or a corrupt record
    pub async fn load_tokens(&self) -> Result<Option<TokenSet>, StoreError> {
        self.load_json(TOKENS_KEY).await
    }

    /// Persist a token set as one record
    ///
    /// # Errors
    /// Returns error on backend failure
    pub async fn save_tokens(&self, tokens: &TokenSet) -> Result<(), StoreError> {
        self.save_json(TOKENS_KEY, tokens).await
    }

    /// Persist the user profile
    ///
    /// # Errors
    /// Returns error on backend failure
    pub async fn save_user(&self, user: &UserProfile) -> Result<(), StoreError> {
        self.save_json(USER_KEY, user).await
    }

    /// Delete the user profile
    ///
    /// # Errors
    /// Returns error on backend failure
    pub async fn clear_user(&self) -> Result<(), StoreError> {
        self.store.remove(USER_KEY).await
    }

    /// Load the pending login, present only when both halves are stored
    ///
    /// # Errors
    /// Returns error on backend failure or a corrupt record
    pub async fn load_pending(&self) -> Result<Option<PendingLogin>, StoreError> {
        let _pending = self.pending_lock.lock().await;
        let state: Option<String> = self.load_json(STATE_KEY).await?;
        let verifier: Option<String> = self.load_json(VERIFIER_KEY).await?;

        Ok(match (state, verifier) {
            (Some(state), Some(code_verifier)) => Some(PendingLogin { state, code_verifier }),
            (Some(_), None) | (None, Some(_)) => {
                warn!("Ignoring half-written pending login");
                None
            }
            (None, None) => None,
        })
    }

    /// Persist a pending login, replacing any previous one.
    ///
    /// The old state is removed first and the new state written last, so an
    /// interrupted write can never leave a state that validates against the
    /// wrong verifier.
    ///
    /// # Errors
    /// Returns error on backend failure
    pub async fn save_pending(&self, pending: &PendingLogin) -> Result<(), StoreError> {
        let _pending = self.pending_lock.lock().await;
        self.store.remove(STATE_KEY).await?;
        self.save_json(VERIFIER_KEY, &pending.code_verifier).await?;
        self.save_json(STATE_KEY, &pending.state).await
    }

    /// Delete the pending login
    ///
    /// # Errors
    /// Returns error on backend failure
    pub async fn clear_pending(&self) -> Result<(), StoreError> {
        let _pending = self.pending_lock.lock().await;
        self.store.remove(STATE_KEY).await?;
        self.store.remove(VERIFIER_KEY).await
    }

    /// Delete the token set and user profile
    ///
    /// # Errors
    /// Returns error on backend failure
    pub async fn clear_session(&self) -> Result<(), StoreError> {
        self.store.remove(TOKENS_KEY).await?;
        self.clear_user().await
    }

    /// Delete every record this crate owns
    ///
    /// # Errors
    /// Returns error on backend failure
    pub async fn clear_all(&self) -> Result<(), StoreError> {
        self.clear_session().await?;
        self.clear_pending().await
    }
}

/// In-memory [`SessionStore`]
///
/// Useful for single-process embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` currently holds a value
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.data.lock().contains_key(key)
    }

    /// Whether the store holds nothing at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.data.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.data.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.data.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> (Arc<MemoryStore>, SessionStorage<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (Arc::clone(&store), SessionStorage::new(store))
    }

    #[tokio::test]
    async fn tokens_round_trip_as_single_record() {
        let (store, storage) = storage();
        let tokens = TokenSet::new("access", Some("refresh".into()), 300);

        storage.save_tokens(&tokens).await.unwrap();
        assert!(store.contains(TOKENS_KEY));
        assert_eq!(storage.load_tokens().await.unwrap(), Some(tokens));
    }

    #[tokio::test]
    async fn corrupt_record_is_a_serialization_error() {
        let (store, storage) = storage();
        store.set(TOKENS_KEY, "{not json").await.unwrap();

        let result = storage.load_tokens().await;
        assert!(matches!(result, Err(StoreError::Serialization(_))));
    }

    #[tokio::test]
    async fn pending_login_requires_both_halves() {
        let (store, storage) = storage();
        let pending =
            PendingLogin { state: "state-1".into(), code_verifier: "verifier-1".into() };

        storage.save_pending(&pending).await.unwrap();
        assert_eq!(storage.load_pending().await.unwrap(), Some(pending));

        store.remove(VERIFIER_KEY).await.unwrap();
        assert_eq!(storage.load_pending().await.unwrap(), None);
    }

    #[tokio::test]
    async fn new_pending_login_replaces_previous() {
        let (_store, storage) = storage();
        let first = PendingLogin { state: "first".into(), code_verifier: "v1".into() };
        let second = PendingLogin { state: "second".into(), code_verifier: "v2".into() };

        storage.save_pending(&first).await.unwrap();
        storage.save_pending(&second).await.unwrap();

        assert_eq!(storage.load_pending().await.unwrap(), Some(second));
    }

    /// Yields before every operation so concurrent callers interleave
    struct YieldingStore(MemoryStore);

    #[async_trait]
    impl SessionStore for YieldingStore {
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            tokio::task::yield_now().await;
            self.0.get(key).await
        }

        async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
            tokio::task::yield_now().await;
            self.0.set(key, value).await
        }

        async fn remove(&self, key: &str) -> Result<(), StoreError> {
            tokio::task::yield_now().await;
            self.0.remove(key).await
        }
    }

    #[tokio::test]
    async fn concurrent_pending_logins_never_mix_halves() {
        let storage = SessionStorage::new(Arc::new(YieldingStore(MemoryStore::new())));

        let writes = (0..8).map(|i| {
            let storage = storage.clone();
            async move {
                storage
                    .save_pending(&PendingLogin {
                        state: format!("state-{i}"),
                        code_verifier: format!("verifier-{i}"),
                    })
                    .await
            }
        });
        for result in futures::future::join_all(writes).await {
            result.unwrap();
        }

        let pending = storage.load_pending().await.unwrap().unwrap();
        let attempt = pending.state.trim_start_matches("state-");
        assert_eq!(pending.code_verifier, format!("verifier-{attempt}"));
    }

    #[tokio::test]
    async fn clear_all_empties_the_store() {
        let (store, storage) = storage();
        storage.save_tokens(&TokenSet::new("a", None, 60)).await.unwrap();
        storage.save_user(&UserProfile::default()).await.unwrap();
        storage
            .save_pending(&PendingLogin { state: "s".into(), code_verifier: "v".into() })
            .await
            .unwrap();

        storage.clear_all().await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn clear_session_keeps_pending_login() {
        let (store, storage) = storage();
        storage.save_tokens(&TokenSet::new("a", None, 60)).await.unwrap();
        storage
            .save_pending(&PendingLogin { state: "s".into(), code_verifier: "v".into() })
            .await
            .unwrap();

        storage.clear_session().await.unwrap();
        assert!(!store.contains(TOKENS_KEY));
        assert!(store.contains(STATE_KEY));
    }
}
