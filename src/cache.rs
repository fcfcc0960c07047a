use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::RequestKey;

/// Store of decoded JSON results keyed by request identity.
#[async_trait]
pub trait ResponseCache: Send + Sync {
    async fn get(&self, key: &RequestKey) -> Option<Value>;
    async fn put(&self, key: RequestKey, value: Value);
    async fn remove(&self, key: &RequestKey);
}

/// In-process [`ResponseCache`]. Entries live until replaced or removed.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<RequestKey, Value>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl ResponseCache for MemoryCache {
    async fn get(&self, key: &RequestKey) -> Option<Value> {
        self.entries.lock().get(key).cloned()
    }

    async fn put(&self, key: RequestKey, value: Value) {
        self.entries.lock().insert(key, value);
    }

    async fn remove(&self, key: &RequestKey) {
        self.entries.lock().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{MemoryCache, ResponseCache};
    use crate::Request;

    #[tokio::test]
    async fn entries_are_keyed_by_request_identity() {
        let cache = MemoryCache::new();
        let key = Request::get("https://api.example.com/files/1")
            .query("fields", "name")
            .key();
        cache.put(key.clone(), json!({ "id": "1" })).await;

        let same = Request::get("https://api.example.com/files/1")
            .query("fields", "name")
            .key();
        assert_eq!(cache.get(&same).await, Some(json!({ "id": "1" })));

        let other = Request::get("https://api.example.com/files/1").key();
        assert_eq!(cache.get(&other).await, None);

        cache.remove(&key).await;
        assert!(cache.is_empty());
    }
}
