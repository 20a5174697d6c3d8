use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Read-through cache keyed by opaque strings, with tag-based bulk
/// invalidation. Absence of an entry is never an error.
pub trait Cache: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: String, tags: &[String]);
    fn invalidate_tags(&self, tags: &[String]);
}

/// Decode a cached JSON value. A corrupt entry counts as a miss.
pub fn get_json<T: DeserializeOwned>(cache: &dyn Cache, key: &str) -> Option<T> {
    let raw = cache.get(key)?;
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            debug!("Discarding unreadable cache entry {}: {}", key, e);
            None
        }
    }
}

pub fn set_json<T: Serialize>(cache: &dyn Cache, key: &str, value: &T, tags: &[String]) {
    if let Ok(raw) = serde_json::to_string(value) {
        cache.set(key, raw, tags);
    }
}

#[derive(Serialize, Deserialize)]
struct Stamped<T> {
    stamp: String,
    value: T,
}

/// Cached value that is only returned while `stamp` still matches the one it
/// was stored with. Lets another process's writes invalidate entries here.
pub fn get_stamped<T: DeserializeOwned>(cache: &dyn Cache, key: &str, stamp: &str) -> Option<T> {
    let entry = get_json::<Stamped<T>>(cache, key)?;
    if entry.stamp == stamp {
        Some(entry.value)
    } else {
        debug!("Cache entry {} is stale", key);
        None
    }
}

pub fn set_stamped<T: Serialize>(
    cache: &dyn Cache,
    key: &str,
    stamp: &str,
    value: &T,
    tags: &[String],
) {
    let entry = Stamped {
        stamp: stamp.to_string(),
        value,
    };
    set_json(cache, key, &entry, tags);
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, String>,
    by_tag: HashMap<String, HashSet<String>>,
}

/// Process-local cache.
#[derive(Default)]
pub struct MemoryCache {
    state: RwLock<CacheState>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.state.read().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of tags that still index at least one key.
    pub fn tag_count(&self) -> usize {
        self.state.read().map(|s| s.by_tag.len()).unwrap_or(0)
    }
}

impl Cache for MemoryCache {
    fn get(&self, key: &str) -> Option<String> {
        self.state.read().ok()?.entries.get(key).cloned()
    }

    fn set(&self, key: &str, value: String, tags: &[String]) {
        let Ok(mut state) = self.state.write() else {
            return;
        };
        state.entries.insert(key.to_string(), value);
        for tag in tags {
            state
                .by_tag
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
    }

    fn invalidate_tags(&self, tags: &[String]) {
        let Ok(mut state) = self.state.write() else {
            return;
        };
        let mut evicted = HashSet::new();
        for tag in tags {
            if let Some(keys) = state.by_tag.remove(tag) {
                evicted.extend(keys);
            }
        }
        if evicted.is_empty() {
            return;
        }
        for key in &evicted {
            state.entries.remove(key);
        }
        state.by_tag.retain(|_, keys| {
            keys.retain(|k| !evicted.contains(k));
            !keys.is_empty()
        });
    }
}

/// Cache that stores nothing.
pub struct NoCache;

impl Cache for NoCache {
    fn get(&self, _key: &str) -> Option<String> {
        None
    }

    fn set(&self, _key: &str, _value: String, _tags: &[String]) {}

    fn invalidate_tags(&self, _tags: &[String]) {}
}

pub fn project_tag(project_id: &str) -> String {
    format!("project:{}", project_id)
}

pub fn task_tag(task_id: &str) -> String {
    format!("task:{}", task_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalidating_a_tag_drops_every_key_under_it() {
        let cache = MemoryCache::new();
        cache.set("a", "1".to_string(), &["t1".to_string()]);
        cache.set("b", "2".to_string(), &["t1".to_string(), "t2".to_string()]);
        cache.set("c", "3".to_string(), &["t2".to_string()]);

        cache.invalidate_tags(&["t1".to_string()]);
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_none());
        assert_eq!(cache.get("c").as_deref(), Some("3"));
    }

    #[test]
    fn eviction_unlists_keys_from_their_other_tags() {
        let cache = MemoryCache::new();
        cache.set("b", "2".to_string(), &["t1".to_string(), "t2".to_string()]);
        cache.set("c", "3".to_string(), &["t2".to_string(), "t3".to_string()]);
        cache.invalidate_tags(&["t1".to_string()]);
        assert_eq!(cache.tag_count(), 2);

        cache.invalidate_tags(&["t3".to_string()]);
        assert!(cache.is_empty());
        assert_eq!(cache.tag_count(), 0);

        for round in 0..50 {
            let key = format!("k{}", round);
            cache.set(&key, "v".to_string(), &["project:p1".to_string(), format!("task:{}", round)]);
            cache.invalidate_tags(&[format!("task:{}", round)]);
        }
        assert_eq!(cache.tag_count(), 0);
    }

    #[test]
    fn stamped_entries_expire_when_the_stamp_moves() {
        let cache = MemoryCache::new();
        set_stamped(&cache, "task:1", "pending|t0", &"draft".to_string(), &[]);
        assert_eq!(
            get_stamped::<String>(&cache, "task:1", "pending|t0").as_deref(),
            Some("draft")
        );
        assert_eq!(get_stamped::<String>(&cache, "task:1", "completed|t1"), None);
    }

    #[test]
    fn json_helpers_treat_garbage_as_miss() {
        let cache = MemoryCache::new();
        set_json(&cache, "nums", &vec![1, 2, 3], &[]);
        assert_eq!(get_json::<Vec<i32>>(&cache, "nums"), Some(vec![1, 2, 3]));
        cache.set("bad", "{not json".to_string(), &[]);
        assert_eq!(get_json::<Vec<i32>>(&cache, "bad"), None);
    }

    #[test]
    fn no_cache_never_hits() {
        let cache = NoCache;
        cache.set("a", "1".to_string(), &[]);
        assert!(cache.get("a").is_none());
    }
}
