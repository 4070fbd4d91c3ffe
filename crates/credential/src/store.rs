//! Durable holder of the current credential
//!
//! `TokenStore` keeps exactly one optional credential in an in-memory slot
//! and writes every change through to a `KeyValueStore` backend. Reads are
//! synchronous and never wait on disk. The store has no policy: it does not
//! refresh, does not retry, and does not notify anyone of changes.

use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::Mutex;
use tracing::debug;

use crate::credential::Credential;
use crate::error::{Error, Result};
use crate::kv::{KeyValueStore, MemoryKv};

/// Backend key under which the credential is persisted.
pub const CREDENTIAL_KEY: &str = "credential";

/// Single-credential store.
///
/// The `RwLock` slot makes `get` observe either the old or the new value,
/// never a partial one. The async `write_lock` keeps the backend write order
/// equal to the slot write order when writers race.
pub struct TokenStore {
    slot: RwLock<Option<Credential>>,
    write_lock: Mutex<()>,
    backend: Arc<dyn KeyValueStore>,
}

impl TokenStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self {
            slot: RwLock::new(None),
            write_lock: Mutex::new(()),
            backend,
        }
    }

    /// Store backed by a fresh `MemoryKv`.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryKv::new()))
    }

    /// Populate the slot from the backend.
    ///
    /// Called once at startup. A missing entry leaves the slot empty.
    pub async fn load(&self) -> Result<Option<Credential>> {
        let _guard = self.write_lock.lock().await;
        let credential = match self.backend.get(CREDENTIAL_KEY).await? {
            Some(value) => Some(
                serde_json::from_value::<Credential>(value)
                    .map_err(|e| Error::CredentialParse(format!("stored credential: {e}")))?,
            ),
            None => None,
        };
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = credential.clone();
        Ok(credential)
    }

    /// Clone of the current credential, if any.
    pub fn get(&self) -> Option<Credential> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the credential and persist it.
    ///
    /// The in-memory slot is updated before the backend write, so a failed
    /// persist still leaves the process using the new credential.
    pub async fn set(&self, credential: Credential) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let value = serde_json::to_value(&credential)
            .map_err(|e| Error::CredentialParse(format!("serializing credential: {e}")))?;
        let fingerprint = credential.fingerprint();
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = Some(credential);
        debug!(fingerprint, "credential replaced");
        self.backend.put(CREDENTIAL_KEY, value).await
    }

    /// Drop the credential from memory and the backend.
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = None;
        debug!("credential cleared");
        self.backend.remove(CREDENTIAL_KEY).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::FileKv;

    fn test_credential(suffix: &str, expires_at: u64) -> Credential {
        Credential::new(format!("at_{suffix}"), format!("rt_{suffix}"), expires_at)
    }

    #[tokio::test]
    async fn empty_store_returns_none() {
        let store = TokenStore::in_memory();
        assert!(store.get().is_none());
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn set_replaces_wholesale() {
        let store = TokenStore::in_memory();
        store.set(test_credential("1", 1000)).await.unwrap();
        store.set(test_credential("2", 2000)).await.unwrap();

        let cred = store.get().unwrap();
        assert_eq!(cred.access.expose(), "at_2");
        assert_eq!(cred.refresh.expose(), "rt_2");
        assert_eq!(cred.expires_at, 2000);
    }

    #[tokio::test]
    async fn clear_empties_slot_and_backend() {
        let backend = Arc::new(MemoryKv::new());
        let store = TokenStore::new(backend.clone());
        store.set(test_credential("1", 1000)).await.unwrap();

        store.clear().await.unwrap();
        assert!(store.get().is_none());
        assert!(backend.get(CREDENTIAL_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn roundtrip_through_file_backend() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        let store = TokenStore::new(Arc::new(FileKv::load(path.clone()).await.unwrap()));
        store.set(test_credential("1", 1_735_500_000_000)).await.unwrap();

        let reopened = TokenStore::new(Arc::new(FileKv::load(path).await.unwrap()));
        assert!(reopened.get().is_none(), "slot is empty until load()");
        let loaded = reopened.load().await.unwrap().unwrap();
        assert_eq!(loaded.access.expose(), "at_1");
        assert_eq!(reopened.get().unwrap().expires_at, 1_735_500_000_000);
    }

    #[tokio::test]
    async fn load_rejects_malformed_entry() {
        let backend = Arc::new(MemoryKv::new());
        backend
            .put(CREDENTIAL_KEY, serde_json::json!({"access": 5}))
            .await
            .unwrap();
        let store = TokenStore::new(backend);

        assert!(matches!(store.load().await, Err(Error::CredentialParse(_))));
    }

    #[tokio::test]
    async fn concurrent_writes_leave_one_whole_credential() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        let store = Arc::new(TokenStore::new(Arc::new(
            FileKv::load(path.clone()).await.unwrap(),
        )));

        let mut handles = vec![];
        for i in 0..10u64 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .set(test_credential(&i.to_string(), 1000 + i))
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        // Memory and disk agree on the last writer
        let in_memory = store.get().unwrap();
        let reopened = TokenStore::new(Arc::new(FileKv::load(path).await.unwrap()));
        let on_disk = reopened.load().await.unwrap().unwrap();
        assert!(in_memory.same_as(&on_disk));
        assert_eq!(
            in_memory.access.expose(),
            &format!("at_{}", in_memory.expires_at - 1000)
        );
    }
}
