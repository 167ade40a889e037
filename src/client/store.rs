use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, instrument, warn};

use super::ClientError;

const STORE_FILE: &str = "store.json";
const CHANGE_CAPACITY: usize = 64;

/// Raised after every successful write. `value` is `Null` when a key is removed.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreChange {
    pub key: String,
    pub value: Value,
}

/// JSON key-value document kept in one file. Writes replace the file atomically
/// and only reach memory once the file is on disk.
pub struct LocalStore {
    path: PathBuf,
    entries: Mutex<Map<String, Value>>,
    changes: broadcast::Sender<StoreChange>,
}

impl LocalStore {
    #[instrument]
    pub fn open(dir: &Path) -> Result<Self, ClientError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(STORE_FILE);

        let entries = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<Map<String, Value>>(&raw) {
                Ok(entries) => entries,
                Err(err) => {
                    let aside = path.with_extension("json.corrupt");
                    warn!(error = %err, aside = ?aside, "Local store is unreadable, starting empty");
                    fs::rename(&path, &aside)?;
                    Map::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(err) => return Err(err.into()),
        };

        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Ok(Self {
            path,
            entries: Mutex::new(entries),
            changes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Map<String, Value>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stored value for `key`, or `default` when missing or not of type `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get_opt(key).unwrap_or(default)
    }

    pub fn get_opt<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.lock().get(key).cloned()?;
        match serde_json::from_value(value) {
            Ok(parsed) => Some(parsed),
            Err(err) => {
                warn!(key, error = %err, "Error reading local key, using default");
                None
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), ClientError> {
        let value = serde_json::to_value(value)?;
        {
            let mut entries = self.lock();
            let mut staged = entries.clone();
            staged.insert(key.to_string(), value.clone());
            self.persist(&staged)?;
            *entries = staged;
        }
        self.notify(key, value);
        Ok(())
    }

    /// Read-modify-write of one key under a single lock.
    pub fn update<T, F>(&self, key: &str, default: T, f: F) -> Result<T, ClientError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(T) -> T,
    {
        let (next, value) = {
            let mut entries = self.lock();
            let current = entries
                .get(key)
                .cloned()
                .and_then(|v| match serde_json::from_value(v) {
                    Ok(parsed) => Some(parsed),
                    Err(err) => {
                        warn!(key, error = %err, "Error reading local key, using default");
                        None
                    }
                })
                .unwrap_or(default);

            let next = f(current);
            let value = serde_json::to_value(&next)?;
            let mut staged = entries.clone();
            staged.insert(key.to_string(), value.clone());
            self.persist(&staged)?;
            *entries = staged;
            (next, value)
        };
        self.notify(key, value);
        Ok(next)
    }

    pub fn remove(&self, key: &str) -> Result<(), ClientError> {
        let removed = {
            let mut entries = self.lock();
            let mut staged = entries.clone();
            let removed = staged.remove(key).is_some();
            if removed {
                self.persist(&staged)?;
                *entries = staged;
            }
            removed
        };
        if removed {
            self.notify(key, Value::Null);
        }
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    fn notify(&self, key: &str, value: Value) {
        // No receivers is fine.
        let _ = self.changes.send(StoreChange {
            key: key.to_string(),
            value,
        });
    }

    fn persist(&self, entries: &Map<String, Value>) -> Result<(), ClientError> {
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(entries)?)?;
        fs::rename(&tmp, &self.path)?;
        debug!(path = ?self.path, keys = entries.len(), "Local store saved");
        Ok(())
    }
}
