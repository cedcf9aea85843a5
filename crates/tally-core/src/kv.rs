//! Key-value storage abstraction.
//!
//! The rest of the crate only ever talks to [`KeyValueStore`]; which
//! backend is in use (persistent or volatile) is decided once, at
//! construction. [`FileStore`] is the persistent backend and enforces a
//! byte quota, mirroring the size-constrained stores this library targets.
//! [`MemoryStore`] is the volatile backend and the test fake.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Errors from the underlying key-value store. `QuotaExceeded` is the one
/// variant callers react to structurally (cleanup-then-retry); everything
/// else is passed through.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("storage quota exceeded while writing {key}")]
    QuotaExceeded { key: String },

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// The injected storage capability. All values are serialized strings;
/// serialization is the caller's concern.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, KvError>;
    fn set(&self, key: &str, value: &str) -> Result<(), KvError>;
    fn remove(&self, key: &str) -> Result<(), KvError>;
    fn keys(&self) -> Result<Vec<String>, KvError>;
}

impl<S: KeyValueStore + ?Sized> KeyValueStore for Arc<S> {
    fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), KvError> {
        (**self).remove(key)
    }

    fn keys(&self) -> Result<Vec<String>, KvError> {
        (**self).keys()
    }
}

/// Volatile in-memory store with an optional byte quota.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
    quota_bytes: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that rejects writes once total key+value bytes would exceed
    /// `quota_bytes`. Used to exercise quota handling in tests.
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            quota_bytes: Some(quota_bytes),
        }
    }

    fn usage(entries: &HashMap<String, String>) -> usize {
        entries.iter().map(|(k, v)| k.len() + v.len()).sum()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let entries = self.entries.lock().expect("memory store lock poisoned");
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        let mut entries = self.entries.lock().expect("memory store lock poisoned");
        if let Some(quota) = self.quota_bytes {
            let existing = entries.get(key).map(|v| key.len() + v.len()).unwrap_or(0);
            let projected = Self::usage(&entries) - existing + key.len() + value.len();
            if projected > quota {
                return Err(KvError::QuotaExceeded {
                    key: key.to_string(),
                });
            }
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), KvError> {
        let mut entries = self.entries.lock().expect("memory store lock poisoned");
        entries.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, KvError> {
        let entries = self.entries.lock().expect("memory store lock poisoned");
        Ok(entries.keys().cloned().collect())
    }
}

/// Default byte quota for [`FileStore`], in the ballpark of the
/// client-side stores this backs up.
pub const DEFAULT_FILE_QUOTA_BYTES: u64 = 5 * 1024 * 1024;

/// Persistent store: one file per key under a directory, with an enforced
/// byte quota. Writes go through a temp file and rename so a crashed write
/// never leaves a torn value behind.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    quota_bytes: u64,
}

impl FileStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, KvError> {
        Self::open_with_quota(root, DEFAULT_FILE_QUOTA_BYTES)
    }

    pub fn open_with_quota(root: impl Into<PathBuf>, quota_bytes: u64) -> Result<Self, KvError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root, quota_bytes })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, KvError> {
        if key.is_empty()
            || !key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(KvError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(format!("{key}.json")))
    }

    fn usage(&self) -> Result<u64, KvError> {
        let mut total = 0;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.path().extension().is_some_and(|e| e == "json") {
                total += entry.metadata()?.len();
            }
        }
        Ok(total)
    }

    fn key_from_path(path: &Path) -> Option<String> {
        path.file_stem().and_then(|s| s.to_str()).map(String::from)
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        let path = self.path_for(key)?;
        let existing = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        let projected = self.usage()? - existing + value.len() as u64;
        if projected > self.quota_bytes {
            return Err(KvError::QuotaExceeded {
                key: key.to_string(),
            });
        }

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), KvError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn keys(&self) -> Result<Vec<String>, KvError> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "json") {
                if let Some(key) = Self::key_from_path(&path) {
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryStore::new();
        assert_eq!(store.get("a").unwrap(), None);

        store.set("a", "1").unwrap();
        store.set("b", "2").unwrap();
        assert_eq!(store.get("a").unwrap(), Some("1".into()));

        let mut keys = store.keys().unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);

        store.remove("a").unwrap();
        assert_eq!(store.get("a").unwrap(), None);
    }

    #[test]
    fn memory_store_enforces_quota() {
        let store = MemoryStore::with_quota(10);
        store.set("k", "12345").unwrap(); // 6 bytes
        let err = store.set("q", "123456789").unwrap_err();
        assert!(matches!(err, KvError::QuotaExceeded { .. }));
        // Overwriting an existing key frees its old bytes first.
        store.set("k", "123456789").unwrap();
    }

    #[test]
    fn file_store_round_trip_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.set("tally.records", r#"{"records":[]}"#).unwrap();

        let reopened = FileStore::open(dir.path()).unwrap();
        assert_eq!(
            reopened.get("tally.records").unwrap(),
            Some(r#"{"records":[]}"#.into())
        );
        assert_eq!(reopened.keys().unwrap(), vec!["tally.records"]);

        reopened.remove("tally.records").unwrap();
        assert_eq!(reopened.get("tally.records").unwrap(), None);
        // Removing a missing key is not an error.
        reopened.remove("tally.records").unwrap();
    }

    #[test]
    fn file_store_enforces_quota() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open_with_quota(dir.path(), 16).unwrap();
        store.set("small", "0123456789").unwrap();
        let err = store.set("other", "0123456789").unwrap_err();
        assert!(matches!(err, KvError::QuotaExceeded { .. }));
    }

    #[test]
    fn file_store_rejects_path_traversal_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert!(matches!(
            store.set("../escape", "x"),
            Err(KvError::InvalidKey(_))
        ));
        assert!(matches!(store.get(""), Err(KvError::InvalidKey(_))));
    }

    #[test]
    fn arc_wrapper_delegates() {
        let store = Arc::new(MemoryStore::new());
        let clone = Arc::clone(&store);
        clone.set("shared", "value").unwrap();
        assert_eq!(store.get("shared").unwrap(), Some("value".into()));
    }
}
