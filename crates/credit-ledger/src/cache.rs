//! Bounded memoization of completion responses.
//!
//! Keys are exact: a SHA-256 over the model, the user id and every message
//! in order, each message serialized with sorted object keys. Two requests
//! share an entry only when they are semantically identical.

use lru::LruCache;
use parking_lot::Mutex as SyncMutex;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;

use crate::completion::ChatMessage;
use crate::types::UserId;

/// Default number of memoized responses.
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// Canonical cache key for `(messages, model, user_id)`.
pub fn cache_key(
    messages: &[ChatMessage],
    model: &str,
    user_id: UserId,
) -> serde_json::Result<String> {
    let mut hasher = Sha256::new();
    hash_field(&mut hasher, model.as_bytes());
    hasher.update(user_id.to_le_bytes());
    hasher.update((messages.len() as u64).to_le_bytes());

    for message in messages {
        let canonical = canonicalize(serde_json::to_value(message)?);
        hash_field(&mut hasher, serde_json::to_string(&canonical)?.as_bytes());
    }

    Ok(hex::encode(hasher.finalize()))
}

// Length prefix keeps field boundaries unambiguous.
fn hash_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

/// Rebuild every object with its keys in sorted order.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (key, value) in entries {
                sorted.insert(key, canonicalize(value));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// LRU map from cache key to response text.
pub struct MemoCache {
    entries: SyncMutex<LruCache<String, String>>,
}

impl MemoCache {
    /// A zero capacity is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: SyncMutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    pub fn insert(&self, key: String, response: String) {
        self.entries.lock().put(key, response);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }
}

impl Default for MemoCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}
