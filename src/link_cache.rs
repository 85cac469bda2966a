//! Cache of short links keyed by the link payload that produced them.
use std::{collections::HashMap, sync::Mutex};

use serde_json::Value;

use crate::request::{keys, Payload};

/// Keys that do not describe the link itself and are ignored when computing the cache key.
const VOLATILE_KEYS: [&str; 5] = [
    keys::SESSION_ID,
    keys::RANDOMIZED_DEVICE_TOKEN,
    keys::RANDOMIZED_BUNDLE_TOKEN,
    keys::INSTRUMENTATION,
    keys::METADATA,
];

/// Thread-safe map from link payload digest to URL.
#[derive(Debug, Default)]
pub struct LinkCache {
    links: Mutex<HashMap<String, String>>,
}

impl LinkCache {
    pub fn new() -> LinkCache {
        LinkCache::default()
    }

    /// Digest of the canonical JSON form of `payload`.
    ///
    /// `serde_json::Map` keeps keys sorted, so serializing it is canonical.
    pub fn key(payload: &Payload) -> String {
        let mut canonical = payload.clone();
        for key in VOLATILE_KEYS {
            canonical.remove(key);
        }
        let bytes = serde_json::to_vec(&Value::Object(canonical)).unwrap_or_default();
        format!("{:x}", md5::compute(bytes))
    }

    pub fn get(&self, payload: &Payload) -> Option<String> {
        self.links
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&LinkCache::key(payload))
            .cloned()
    }

    pub fn put(&self, payload: &Payload, url: impl Into<String>) {
        self.links
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(LinkCache::key(payload), url.into());
    }

    pub fn clear(&self) {
        let mut links = self
            .links
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !links.is_empty() {
            log::debug!(target: "attribution", entries = links.len(); "clearing link cache");
        }
        links.clear();
    }

    pub fn len(&self) -> usize {
        self.links
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
