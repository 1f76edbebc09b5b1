//! Local device key-value storage.
//!
//! Values are JSON encoded. Reads fall back to a default and writes are
//! dropped when the backing store is unavailable, so callers never fail on
//! storage. Writes are last-write-wins.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use rand::distributions::{Alphanumeric, DistString};
use rand::rngs::OsRng;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;

use crate::error::{PortalError, Result};

const PROBE_KEY: &str = "__storage_test__";
const EVENT_CAPACITY: usize = 64;
const GUEST_ID_LENGTH: usize = 26;

/// Keys persisted on the device.
pub mod keys {
    /// Stable guest identifier.
    pub const GUEST_ID: &str = "sro_guest_id";
    /// Day-bucketed guest question counter.
    pub const GUEST_QUESTIONS: &str = "sro_guest_questions";
    /// Bounded guest chat transcript.
    pub const GUEST_CHAT_HISTORY: &str = "sro_guest_chat_history";
    /// Whether the storage consent banner was displayed.
    pub const CONSENT_BANNER_SHOWN: &str = "sro_consent_banner_shown";
    /// Backend authentication session.
    pub const AUTH_SESSION: &str = "sro_auth_session";

    /// Login attempt timestamps of one INN.
    pub fn login_attempts(inn: &str) -> String {
        format!("login_attempts_{inn}")
    }
}

/// Raw string store.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;
}

/// Volatile store, lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self
            .entries
            .read()
            .map_err(|err| PortalError::Storage(err.to_string()))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .write()
            .map_err(|err| PortalError::Storage(err.to_string()))?
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries
            .write()
            .map_err(|err| PortalError::Storage(err.to_string()))?
            .remove(key);
        Ok(())
    }
}

/// Store persisted as a single JSON object on disk.
///
/// The whole file is rewritten on every change.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl FileStore {
    /// Open `path`, starting empty when the file does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|err| PortalError::Storage(err.to_string()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                HashMap::new()
            },
            Err(err) => return Err(PortalError::Storage(err.to_string())),
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn flush(&self, entries: &HashMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| PortalError::Storage(err.to_string()))?;
        }
        let bytes = serde_json::to_vec(entries)
            .map_err(|err| PortalError::Storage(err.to_string()))?;
        fs::write(&self.path, bytes)
            .map_err(|err| PortalError::Storage(err.to_string()))
    }

    fn update(&self, f: impl FnOnce(&mut HashMap<String, String>)) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|err| PortalError::Storage(err.to_string()))?;
        f(&mut *entries);
        self.flush(&entries)
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self
            .entries
            .lock()
            .map_err(|err| PortalError::Storage(err.to_string()))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.update(|entries| {
            entries.insert(key.to_owned(), value.to_owned());
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.update(|entries| {
            entries.remove(key);
        })
    }
}

/// Store that refuses every operation, as a browser in private mode does.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledStore;

impl KeyValueStore for DisabledStore {
    fn get(&self, _key: &str) -> Result<Option<String>> {
        Err(PortalError::Storage("storage disabled".into()))
    }

    fn set(&self, _key: &str, _value: &str) -> Result<()> {
        Err(PortalError::Storage("storage disabled".into()))
    }

    fn remove(&self, _key: &str) -> Result<()> {
        Err(PortalError::Storage("storage disabled".into()))
    }
}

/// Notification sent after a key changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
}

/// Typed, failure-tolerant access to a [`KeyValueStore`].
#[derive(Clone)]
pub struct Storage {
    backend: Arc<dyn KeyValueStore>,
    available: Arc<OnceLock<bool>>,
    events: broadcast::Sender<StorageEvent>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("available", &self.available.get())
            .finish_non_exhaustive()
    }
}

impl Storage {
    /// Create a new [`Storage`] over `backend`.
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            backend,
            available: Arc::new(OnceLock::new()),
            events,
        }
    }

    /// In-memory storage.
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryStore::default()))
    }

    /// Probe the backend once and cache the answer.
    pub fn is_available(&self) -> bool {
        *self.available.get_or_init(|| {
            let probe = self
                .backend
                .set(PROBE_KEY, PROBE_KEY)
                .and_then(|_| self.backend.remove(PROBE_KEY));
            match probe {
                Ok(()) => true,
                Err(err) => {
                    tracing::warn!(error = %err, "local storage is not available, some features may be limited");
                    false
                },
            }
        })
    }

    /// Read and decode `key`.
    ///
    /// # Errors
    ///
    /// Returns `Err` when the stored value cannot be decoded.
    pub fn try_get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        if !self.is_available() {
            return Ok(None);
        }

        match self.backend.get(key)? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|err| PortalError::Storage(err.to_string())),
            None => Ok(None),
        }
    }

    /// Read `key`, or `default` if missing, unreadable or unavailable.
    pub fn get<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        match self.try_get(key) {
            Ok(Some(value)) => value,
            Ok(None) => default,
            Err(err) => {
                tracing::error!(key, error = %err, "cannot read local storage");
                default
            },
        }
    }

    /// Encode and write `value` under `key`.
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) {
        if !self.is_available() {
            return;
        }

        let written = serde_json::to_string(value)
            .map_err(|err| PortalError::Storage(err.to_string()))
            .and_then(|raw| self.backend.set(key, &raw));
        match written {
            Ok(()) => self.notify(key),
            Err(err) => {
                tracing::error!(key, error = %err, "cannot save to local storage")
            },
        }
    }

    /// Delete `key`.
    pub fn remove(&self, key: &str) {
        if !self.is_available() {
            return;
        }

        match self.backend.remove(key) {
            Ok(()) => self.notify(key),
            Err(err) => {
                tracing::error!(key, error = %err, "cannot remove from local storage")
            },
        }
    }

    /// Receive a [`StorageEvent`] after each successful write.
    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }

    fn notify(&self, key: &str) {
        // No receiver is not an error.
        let _ = self.events.send(StorageEvent {
            key: key.to_owned(),
        });
    }

    /// Get the persisted guest identifier, generating it on first use.
    pub fn guest_id(&self) -> String {
        let guest_id: String = self.get(keys::GUEST_ID, String::new());
        if !guest_id.is_empty() {
            return guest_id;
        }

        let guest_id = format!(
            "guest_{}",
            Alphanumeric
                .sample_string(&mut OsRng, GUEST_ID_LENGTH)
                .to_lowercase()
        );
        self.set(keys::GUEST_ID, &guest_id);
        guest_id
    }

    pub fn is_consent_banner_shown(&self) -> bool {
        self.get(keys::CONSENT_BANNER_SHOWN, false)
    }

    pub fn set_consent_banner_shown(&self) {
        self.set(keys::CONSENT_BANNER_SHOWN, &true);
    }
}
