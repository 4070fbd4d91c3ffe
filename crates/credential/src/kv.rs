//! Pluggable key-value backends for credential persistence
//!
//! `TokenStore` writes through to a `KeyValueStore`. Two backends ship here:
//! `MemoryKv` for tests and ephemeral processes, and `FileKv`, a JSON object
//! file where every write uses atomic temp-file + rename so a crash never
//! leaves a half-written credential on disk.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Boxed future used by the dyn-compatible traits in this crate.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Minimal async key-value contract for credential persistence.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn KeyValueStore>`).
pub trait KeyValueStore: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<serde_json::Value>>>;

    fn put<'a>(&'a self, key: &'a str, value: serde_json::Value) -> BoxFuture<'a, Result<()>>;

    /// Remove a key. Removing a missing key is not an error.
    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>>;
}

/// In-process backend. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryKv {
    state: Mutex<HashMap<String, serde_json::Value>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryKv {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<serde_json::Value>>> {
        Box::pin(async move { Ok(self.state.lock().await.get(key).cloned()) })
    }

    fn put<'a>(&'a self, key: &'a str, value: serde_json::Value) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.state.lock().await.insert(key.to_string(), value);
            Ok(())
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.state.lock().await.remove(key);
            Ok(())
        })
    }
}

/// JSON-file backend.
///
/// The Mutex serializes all writes. Reads clone from the in-memory copy and
/// never touch the disk after `load`.
pub struct FileKv {
    path: PathBuf,
    state: Mutex<HashMap<String, serde_json::Value>>,
}

impl FileKv {
    /// Load the backing file.
    ///
    /// If the file doesn't exist, creates it as `{}` (cold start, nobody has
    /// logged in yet).
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading credential file: {e}")))?;
            let entries: HashMap<String, serde_json::Value> = serde_json::from_str(&contents)
                .map_err(|e| Error::CredentialParse(format!("parsing credential file: {e}")))?;
            info!(path = %path.display(), keys = entries.len(), "loaded credential file");
            entries
        } else {
            info!(path = %path.display(), "credential file not found, starting empty");
            let entries = HashMap::new();
            write_atomic(&path, &entries).await?;
            entries
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyValueStore for FileKv {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<serde_json::Value>>> {
        Box::pin(async move { Ok(self.state.lock().await.get(key).cloned()) })
    }

    fn put<'a>(&'a self, key: &'a str, value: serde_json::Value) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.insert(key.to_string(), value);
            debug!(key, "stored value");
            write_atomic(&self.path, &state).await
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if state.remove(key).is_some() {
                debug!(key, "removed value");
                write_atomic(&self.path, &state).await?;
            }
            Ok(())
        })
    }
}

/// Write the map to `path` atomically.
///
/// Writes a temp file in the same directory, then renames it over the
/// target. Permissions are 0600 on unix since the file holds secrets.
async fn write_atomic(path: &Path, data: &HashMap<String, serde_json::Value>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::CredentialParse(format!("serializing credential file: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("credential path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".credentials.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), "persisted credential file");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn memory_kv_put_get_remove() {
        let kv = MemoryKv::new();
        assert!(kv.get("credential").await.unwrap().is_none());

        kv.put("credential", json!({"a": 1})).await.unwrap();
        assert_eq!(kv.get("credential").await.unwrap(), Some(json!({"a": 1})));

        kv.remove("credential").await.unwrap();
        assert!(kv.get("credential").await.unwrap().is_none());
        // Removing again is fine
        kv.remove("credential").await.unwrap();
    }

    #[tokio::test]
    async fn file_kv_cold_start_creates_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        assert!(!path.exists());
        let kv = FileKv::load(path.clone()).await.unwrap();
        assert!(path.exists());
        assert_eq!(kv.path(), path.as_path());
        assert!(kv.get("credential").await.unwrap().is_none());

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: HashMap<String, serde_json::Value> = serde_json::from_str(&contents).unwrap();
        assert!(parsed.is_empty());
    }

    #[tokio::test]
    async fn file_kv_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        let kv = FileKv::load(path.clone()).await.unwrap();
        kv.put("credential", json!({"expires_at": 42})).await.unwrap();

        let reloaded = FileKv::load(path).await.unwrap();
        assert_eq!(
            reloaded.get("credential").await.unwrap(),
            Some(json!({"expires_at": 42}))
        );
    }

    #[tokio::test]
    async fn file_kv_remove_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        let kv = FileKv::load(path.clone()).await.unwrap();
        kv.put("credential", json!("x")).await.unwrap();
        kv.remove("credential").await.unwrap();

        let reloaded = FileKv::load(path).await.unwrap();
        assert!(reloaded.get("credential").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_kv_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        tokio::fs::write(&path, "not json").await.unwrap();

        let result = FileKv::load(path).await;
        assert!(matches!(result, Err(Error::CredentialParse(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_permissions_are_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        let kv = FileKv::load(path.clone()).await.unwrap();
        kv.put("credential", json!("x")).await.unwrap();

        let metadata = tokio::fs::metadata(&path).await.unwrap();
        let mode = metadata.permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "credential file must be 0600, got {mode:o}");
    }
}
