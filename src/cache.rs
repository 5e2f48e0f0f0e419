//! Entity cache collaborator
//!
//! Shards feed decoded dispatch payloads into a [`Cache`] and emit the
//! resulting `(new, old)` pair. Entity schemas are opaque JSON here.

use dashmap::DashMap;
use serde_json::Value;

/// Kind of cached entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Guild,
    Channel,
    Thread,
    Member,
    Role,
    Message,
    User,
    Presence,
    VoiceState,
}

/// Identifies one cached entity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub kind: EntityKind,
    pub id: String,
}

impl CacheKey {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    /// Key for an entity scoped to a guild (members, voice states)
    pub fn scoped(kind: EntityKind, guild_id: &str, id: &str) -> Self {
        Self {
            kind,
            id: format!("{guild_id}:{id}"),
        }
    }
}

/// Get/update/delete-by-id store the shards write into.
///
/// Implementations must be cheap and non-blocking: they run on the shard task.
pub trait Cache: Send + Sync + 'static {
    /// Look up an entity
    fn get(&self, key: &CacheKey) -> Option<Value>;

    /// Apply a partial update, creating the entity if absent.
    ///
    /// Returns the entity after the update and a copy from before it.
    fn update(&self, key: CacheKey, delta: Value) -> (Value, Option<Value>);

    /// Remove an entity, returning it if it was cached
    fn remove(&self, key: &CacheKey) -> Option<Value>;
}

/// Default cache backed by a concurrent map
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: DashMap<CacheKey, Value>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of cached entities of one kind
    pub fn count(&self, kind: EntityKind) -> usize {
        self.entries.iter().filter(|entry| entry.key().kind == kind).count()
    }
}

impl Cache for InMemoryCache {
    fn get(&self, key: &CacheKey) -> Option<Value> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    fn update(&self, key: CacheKey, delta: Value) -> (Value, Option<Value>) {
        let mut entry = self.entries.entry(key).or_insert(Value::Null);
        let old = match entry.value() {
            Value::Null => None,
            existing => Some(existing.clone()),
        };
        merge(entry.value_mut(), delta);
        (entry.value().clone(), old)
    }

    fn remove(&self, key: &CacheKey) -> Option<Value> {
        self.entries.remove(key).map(|(_, value)| value)
    }
}

/// Shallow merge: object fields in `delta` overwrite fields in `target`
fn merge(target: &mut Value, delta: Value) {
    match (target, delta) {
        (Value::Object(existing), Value::Object(fields)) => {
            for (name, value) in fields {
                existing.insert(name, value);
            }
        }
        (target, delta) => *target = delta,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_update_creates_then_merges() {
        let cache = InMemoryCache::new();
        let key = CacheKey::new(EntityKind::Guild, "1");

        let (new, old) = cache.update(key.clone(), json!({"id": "1", "name": "a", "large": false}));
        assert!(old.is_none());
        assert_eq!(new["name"], "a");

        let (new, old) = cache.update(key.clone(), json!({"name": "b"}));
        assert_eq!(old.unwrap()["name"], "a");
        assert_eq!(new, json!({"id": "1", "name": "b", "large": false}));
    }

    #[test]
    fn test_remove_returns_old() {
        let cache = InMemoryCache::new();
        let key = CacheKey::scoped(EntityKind::Member, "1", "2");
        assert_eq!(key.id, "1:2");

        cache.update(key.clone(), json!({"nick": "x"}));
        assert_eq!(cache.count(EntityKind::Member), 1);
        assert_eq!(cache.remove(&key), Some(json!({"nick": "x"})));
        assert!(cache.get(&key).is_none());
        assert!(cache.is_empty());
    }
}
