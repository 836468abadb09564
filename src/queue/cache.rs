use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const SWEEP_WATERMARK: usize = 1024;

/// Short-TTL key/value namespace carried by the queue for query results.
/// Writes are last-writer-wins and reads never fail: a poisoned lock degrades
/// to a miss, which callers treat as "go to the store".
#[derive(Clone, Default)]
pub struct TtlCache {
    inner: Arc<Mutex<HashMap<String, CacheSlot>>>,
}

struct CacheSlot {
    value: JsonValue,
    expires_at: Instant,
}

impl TtlCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<JsonValue> {
        let mut map = self.inner.lock().ok()?;
        match map.get(key) {
            Some(slot) if slot.expires_at > Instant::now() => Some(slot.value.clone()),
            Some(_) => {
                map.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn set_ex(&self, key: &str, ttl: Duration, value: JsonValue) {
        let Ok(mut map) = self.inner.lock() else {
            return;
        };
        let now = Instant::now();
        if map.len() >= SWEEP_WATERMARK {
            map.retain(|_, slot| slot.expires_at > now);
        }
        map.insert(
            key.to_string(),
            CacheSlot {
                value,
                expires_at: now + ttl,
            },
        );
    }

    pub fn del(&self, key: &str) {
        if let Ok(mut map) = self.inner.lock() {
            map.remove(key);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|map| map.len()).unwrap_or(0)
    }
}
