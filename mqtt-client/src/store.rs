use std::{collections::HashMap, fs, path::PathBuf, sync::Mutex};

use crate::error::{ClientError, ClientErrorKind};

/// Persistence backend contract: put/get/remove/list by string key.
///
/// The engine does not care where records live — only that writes, once
/// acknowledged, survive a crash long enough to be replayed on the next `create`.
pub trait Store: Send + Sync {
    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), ClientError>;
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ClientError>;
    fn remove(&self, key: &str) -> Result<(), ClientError>;
    /// Keys currently stored whose name begins with `prefix`, in no particular order.
    fn list(&self, prefix: &str) -> Result<Vec<String>, ClientError>;
}

/// Volatile store used by tests and by clients that opt out of persistence
/// (equivalent to never restoring anything on restart).
#[derive(Default)]
pub struct MemStore {
    records: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemStore {
    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), ClientError> {
        self.records
            .lock()
            .expect("MemStore mutex poisoned")
            .insert(key.to_string(), value);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ClientError> {
        Ok(self
            .records
            .lock()
            .expect("MemStore mutex poisoned")
            .get(key)
            .cloned())
    }

    fn remove(&self, key: &str) -> Result<(), ClientError> {
        self.records.lock().expect("MemStore mutex poisoned").remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, ClientError> {
        Ok(self
            .records
            .lock()
            .expect("MemStore mutex poisoned")
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// One file per key under a client-scoped directory. Simple and crash-safe enough
/// for the persistence the engine needs: a torn write is detected on the next
/// restore attempt by the enclosing `CommandRecord::decode` failing, and is
/// logged and skipped rather than treated as fatal.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, ClientError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|err| {
            ClientError::new(
                ClientErrorKind::PersistenceError,
                format!("could not create persistence directory {}: {err}", dir.display()),
            )
        })?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }
}

impl Store for FileStore {
    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), ClientError> {
        fs::write(self.path_for(key), value).map_err(|err| {
            ClientError::new(
                ClientErrorKind::PersistenceError,
                format!("could not persist record {key}: {err}"),
            )
        })
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ClientError> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(ClientError::new(
                ClientErrorKind::PersistenceError,
                format!("could not read record {key}: {err}"),
            )),
        }
    }

    fn remove(&self, key: &str) -> Result<(), ClientError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(ClientError::new(
                ClientErrorKind::PersistenceError,
                format!("could not remove record {key}: {err}"),
            )),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, ClientError> {
        let entries = fs::read_dir(&self.dir).map_err(|err| {
            ClientError::new(
                ClientErrorKind::PersistenceError,
                format!("could not list persistence directory {}: {err}", self.dir.display()),
            )
        })?;

        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| {
                ClientError::new(ClientErrorKind::PersistenceError, err.to_string())
            })?;
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with(prefix) {
                    keys.push(name.to_string());
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
    fn mem_store_round_trips() {
        let store = MemStore::new();
        store.put("c-1", vec![1, 2, 3]).unwrap();
        assert_eq!(store.get("c-1").unwrap(), Some(vec![1, 2, 3]));
        store.remove("c-1").unwrap();
        assert_eq!(store.get("c-1").unwrap(), None);
    }

    #[test]
    fn mem_store_lists_by_prefix() {
        let store = MemStore::new();
        store.put("c-1", vec![]).unwrap();
        store.put("c-2", vec![]).unwrap();
        store.put("other", vec![]).unwrap();
        let mut keys = store.list("c-").unwrap();
        keys.sort();
        assert_eq!(keys, vec!["c-1".to_string(), "c-2".to_string()]);
    }

    #[test]
    fn file_store_round_trips() {
        let dir = std::env::temp_dir().join(format!("mqtt-client-test-{}", std::process::id()));
        let store = FileStore::new(&dir).unwrap();
        store.put("c-1", vec![9, 9]).unwrap();
        assert_eq!(store.get("c-1").unwrap(), Some(vec![9, 9]));
        store.remove("c-1").unwrap();
        assert_eq!(store.get("c-1").unwrap(), None);
        let _ = fs::remove_dir_all(&dir);
    }
}
