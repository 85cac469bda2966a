//! Persistent key-value storage used for session tokens and the request queue.
//!
//! [`KeyValueStore`] is the collaborator interface. [`MemoryStore`] keeps everything in memory;
//! [`FileStore`] additionally mirrors the contents into a JSON file so that state survives
//! process restarts. [`Preferences`] is the typed facade the rest of the crate uses.
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use serde::{Deserialize, Serialize};

use crate::Result;

/// Sentinel returned for unset string values.
pub const NO_STRING_VALUE: &str = "bnc_no_value";

/// A single stored value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum StoredValue {
    String(String),
    Long(i64),
    Int(i32),
    Bool(bool),
}

/// Persistence provider.
///
/// Implementations must be thread-safe: the queue persists itself from whichever thread mutates
/// it.
pub trait KeyValueStore {
    /// Read a raw value.
    fn get(&self, key: &str) -> Option<StoredValue>;

    /// Write a raw value.
    fn set(&self, key: &str, value: StoredValue) -> Result<()>;

    /// Delete a value. Deleting a missing key is not an error.
    fn remove(&self, key: &str) -> Result<()>;

    /// Atomically wipe the store, keeping only the values under `keep`.
    fn clear_and_restore(&self, keep: &[&str]) -> Result<()>;

    /// Read a string, returning [`NO_STRING_VALUE`] when unset.
    fn get_string(&self, key: &str) -> String {
        match self.get(key) {
            Some(StoredValue::String(value)) => value,
            _ => NO_STRING_VALUE.to_owned(),
        }
    }

    fn set_string(&self, key: &str, value: &str) -> Result<()> {
        self.set(key, StoredValue::String(value.to_owned()))
    }

    /// Read a long, returning 0 when unset.
    fn get_long(&self, key: &str) -> i64 {
        match self.get(key) {
            Some(StoredValue::Long(value)) => value,
            _ => 0,
        }
    }

    fn set_long(&self, key: &str, value: i64) -> Result<()> {
        self.set(key, StoredValue::Long(value))
    }

    /// Read an int, returning `default` when unset.
    fn get_int(&self, key: &str, default: i32) -> i32 {
        match self.get(key) {
            Some(StoredValue::Int(value)) => value,
            _ => default,
        }
    }

    fn set_int(&self, key: &str, value: i32) -> Result<()> {
        self.set(key, StoredValue::Int(value))
    }

    /// Read a bool, returning `false` when unset.
    fn get_bool(&self, key: &str) -> bool {
        matches!(self.get(key), Some(StoredValue::Bool(true)))
    }

    fn set_bool(&self, key: &str, value: bool) -> Result<()> {
        self.set(key, StoredValue::Bool(value))
    }
}

/// Shared handle to a key-value store.
pub type SharedStore = Arc<dyn KeyValueStore + Send + Sync>;

/// Thread-safe in-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<String, StoredValue>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    fn snapshot(&self) -> HashMap<String, StoredValue> {
        // A poisoned lock still holds consistent data: every write is a single map operation.
        self.values
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn write<R>(&self, f: impl FnOnce(&mut HashMap<String, StoredValue>) -> R) -> R {
        let mut values = self
            .values
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut values)
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<StoredValue> {
        self.values
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: StoredValue) -> Result<()> {
        self.write(|values| values.insert(key.to_owned(), value));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.write(|values| values.remove(key));
        Ok(())
    }

    fn clear_and_restore(&self, keep: &[&str]) -> Result<()> {
        self.write(|values| values.retain(|key, _| keep.contains(&key.as_str())));
        Ok(())
    }
}

/// A [`MemoryStore`] mirrored into a JSON file after every write.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    memory: MemoryStore,
}

impl FileStore {
    /// Open the store at `path`, loading existing contents. A missing file yields an empty
    /// store; an unreadable one is reported as an error.
    pub fn open(path: impl Into<PathBuf>) -> Result<FileStore> {
        let path = path.into();
        let values: HashMap<String, StoredValue> = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(err.into()),
        };
        log::debug!(target: "attribution", entries = values.len(); "opened preferences file");
        Ok(FileStore {
            path,
            memory: MemoryStore {
                values: RwLock::new(values),
            },
        })
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> Result<()> {
        let bytes = serde_json::to_vec(&self.memory.snapshot())?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<StoredValue> {
        self.memory.get(key)
    }

    fn set(&self, key: &str, value: StoredValue) -> Result<()> {
        self.memory.set(key, value)?;
        self.flush()
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.memory.remove(key)?;
        self.flush()
    }

    fn clear_and_restore(&self, keep: &[&str]) -> Result<()> {
        self.memory.clear_and_restore(keep)?;
        self.flush()
    }
}

/// Preference keys.
pub mod pref_keys {
    pub const APP_KEY: &str = "bnc_branch_key";
    pub const SESSION_ID: &str = "bnc_session_id";
    pub const RANDOMIZED_DEVICE_TOKEN: &str = "bnc_randomized_device_token";
    pub const RANDOMIZED_BUNDLE_TOKEN: &str = "bnc_randomized_bundle_token";
    pub const IDENTITY: &str = "bnc_identity";
    pub const IDENTITY_ID: &str = "bnc_identity_id";
    pub const USER_URL: &str = "bnc_user_url";
    pub const SESSION_PARAMS: &str = "bnc_session_params";
    pub const INSTALL_PARAMS: &str = "bnc_install_params";
    pub const LINK_CLICK_ID: &str = "bnc_link_click_id";
    pub const LINK_CLICK_IDENTIFIER: &str = "bnc_link_click_identifier";
    pub const APP_LINK: &str = "bnc_app_link";
    pub const PUSH_IDENTIFIER: &str = "bnc_push_identifier";
    pub const EXTERNAL_INTENT_URI: &str = "bnc_external_intent_uri";
    pub const INSTALL_REFERRER: &str = "bnc_install_referrer";
    pub const REFERRER_CLICK_TS: &str = "bnc_referrer_click_ts";
    pub const INSTALL_BEGIN_TS: &str = "bnc_install_begin_ts";
    pub const TRACKING_DISABLED: &str = "bnc_tracking_state";
    pub const REQUEST_QUEUE: &str = "server_request_queue";
}

/// Typed facade over a [`KeyValueStore`].
#[derive(Clone)]
pub struct Preferences {
    store: SharedStore,
}

impl std::fmt::Debug for Preferences {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Preferences").finish_non_exhaustive()
    }
}

impl Preferences {
    /// Values that survive an app key change.
    const KEPT_ON_KEY_CHANGE: [&'static str; 4] = [
        pref_keys::LINK_CLICK_ID,
        pref_keys::LINK_CLICK_IDENTIFIER,
        pref_keys::APP_LINK,
        pref_keys::PUSH_IDENTIFIER,
    ];

    /// One-shot launch values cleared once an init request completes.
    const CLEARED_AFTER_INIT: [&'static str; 7] = [
        pref_keys::LINK_CLICK_IDENTIFIER,
        pref_keys::APP_LINK,
        pref_keys::PUSH_IDENTIFIER,
        pref_keys::EXTERNAL_INTENT_URI,
        pref_keys::INSTALL_REFERRER,
        pref_keys::REFERRER_CLICK_TS,
        pref_keys::INSTALL_BEGIN_TS,
    ];

    pub fn new(store: SharedStore) -> Preferences {
        Preferences { store }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Read a string, mapping the sentinel to `None`.
    pub fn get(&self, key: &str) -> Option<String> {
        let value = self.store.get_string(key);
        (value != NO_STRING_VALUE && !value.is_empty()).then_some(value)
    }

    /// Write a string; `None` stores the sentinel. Failures are logged, not propagated.
    pub fn set(&self, key: &str, value: Option<&str>) {
        if let Err(err) = self.store.set_string(key, value.unwrap_or(NO_STRING_VALUE)) {
            log::error!(target: "attribution", key; "failed to write preference: {err}");
        }
    }

    pub fn get_long(&self, key: &str) -> i64 {
        self.store.get_long(key)
    }

    pub fn set_long(&self, key: &str, value: i64) {
        if let Err(err) = self.store.set_long(key, value) {
            log::error!(target: "attribution", key; "failed to write preference: {err}");
        }
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.store.get_bool(key)
    }

    pub fn set_bool(&self, key: &str, value: bool) {
        if let Err(err) = self.store.set_bool(key, value) {
            log::error!(target: "attribution", key; "failed to write preference: {err}");
        }
    }

    pub fn session_id(&self) -> Option<String> {
        self.get(pref_keys::SESSION_ID)
    }

    pub fn randomized_device_token(&self) -> Option<String> {
        self.get(pref_keys::RANDOMIZED_DEVICE_TOKEN)
    }

    pub fn randomized_bundle_token(&self) -> Option<String> {
        self.get(pref_keys::RANDOMIZED_BUNDLE_TOKEN)
    }

    /// A session is established once the server issued a session id.
    pub fn has_session(&self) -> bool {
        self.session_id().is_some()
    }

    /// A user exists once the server handed out a bundle token.
    pub fn has_user(&self) -> bool {
        self.randomized_bundle_token().is_some()
    }

    /// Store `app_key`. If it differs from the stored key, wipe everything except link
    /// identifiers and return `true`.
    pub fn set_app_key(&self, app_key: &str) -> bool {
        let previous = self.get(pref_keys::APP_KEY);
        if previous.as_deref() == Some(app_key) {
            return false;
        }
        if previous.is_some() {
            log::info!(target: "attribution", "app key changed, clearing stored state");
        }
        if let Err(err) = self.store.clear_and_restore(&Self::KEPT_ON_KEY_CHANGE) {
            log::error!(target: "attribution", "failed to clear preferences: {err}");
        }
        self.set(pref_keys::APP_KEY, Some(app_key));
        previous.is_some()
    }

    /// Clear one-shot launch data after a session-init request completed.
    pub fn post_init_clear(&self) {
        for key in Self::CLEARED_AFTER_INIT {
            self.set(key, None);
        }
    }
}
