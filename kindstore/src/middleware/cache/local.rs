use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;

use super::CacheStorage;
use crate::{Context, Error, Key, PropertyList};

struct Entry {
    properties: PropertyList,
    expires: Option<Instant>,
    seq: u64,
}

#[derive(Default)]
struct Entries {
    map: HashMap<Key, Entry>,
    seq: u64,
}

/// In-process cache storage.
///
/// Entries expire after `ttl` when one is set. With a capacity, inserting
/// into a full cache evicts the oldest entry.
#[derive(Default)]
pub struct LocalStorage {
    entries: Mutex<Entries>,
    ttl: Option<Duration>,
    capacity: Option<usize>,
}

impl LocalStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity.max(1));
        self
    }

    fn entries(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries()
            .map
            .values()
            .filter(|e| e.expires.is_none_or(|at| at > now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.lookup(key).is_some()
    }

    fn lookup(&self, key: &Key) -> Option<PropertyList> {
        let mut entries = self.entries();
        let entry = entries.map.get(key)?;
        if entry.expires.is_some_and(|at| at <= Instant::now()) {
            entries.map.remove(key);
            return None;
        }
        Some(entry.properties.clone())
    }

    fn insert(&self, key: Key, properties: PropertyList) {
        let expires = self.ttl.map(|ttl| Instant::now() + ttl);
        let mut entries = self.entries();
        if let Some(capacity) = self.capacity {
            if !entries.map.contains_key(&key) && entries.map.len() >= capacity {
                let oldest = entries
                    .map
                    .iter()
                    .min_by_key(|(_, e)| e.seq)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    entries.map.remove(&oldest);
                }
            }
        }
        entries.seq += 1;
        let seq = entries.seq;
        entries.map.insert(
            key,
            Entry {
                properties,
                expires,
                seq,
            },
        );
    }
}

impl CacheStorage for LocalStorage {
    fn get_multi<'a>(
        &'a self,
        ctx: &'a Context,
        keys: &'a [Key],
    ) -> BoxFuture<'a, Result<Vec<Option<PropertyList>>, Error>> {
        Box::pin(async move {
            ctx.check()?;
            Ok(keys.iter().map(|key| self.lookup(key)).collect())
        })
    }

    fn set_multi<'a>(
        &'a self,
        ctx: &'a Context,
        items: &'a [(Key, PropertyList)],
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            ctx.check()?;
            for (key, properties) in items {
                self.insert(key.clone(), properties.clone());
            }
            Ok(())
        })
    }

    fn delete_multi<'a>(&'a self, ctx: &'a Context, keys: &'a [Key]) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            ctx.check()?;
            let mut entries = self.entries();
            for key in keys {
                entries.map.remove(key);
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Property, Value};

    fn props(n: i64) -> PropertyList {
        PropertyList::from(vec![Property::new("N", Value::Int(n))])
    }

    #[tokio::test]
    async fn set_get_delete() {
        let ctx = Context::background();
        let storage = LocalStorage::new();
        let a = Key::with_id("Data", 1, None);
        let b = Key::with_id("Data", 2, None);
        storage.set_multi(&ctx, &[(a.clone(), props(1))]).await.unwrap();

        let found = storage.get_multi(&ctx, &[a.clone(), b.clone()]).await.unwrap();
        assert_eq!(found, vec![Some(props(1)), None]);

        storage.delete_multi(&ctx, &[a.clone()]).await.unwrap();
        assert!(!storage.contains(&a));
    }

    #[tokio::test]
    async fn entries_expire() {
        let ctx = Context::background();
        let storage = LocalStorage::new().with_ttl(Duration::from_millis(20));
        let key = Key::with_id("Data", 1, None);
        storage.set_multi(&ctx, &[(key.clone(), props(1))]).await.unwrap();
        assert!(storage.contains(&key));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!storage.contains(&key));
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn full_cache_evicts_oldest() {
        let ctx = Context::background();
        let storage = LocalStorage::new().with_capacity(2);
        let keys: Vec<Key> = (1..=3).map(|i| Key::with_id("Data", i, None)).collect();
        for (i, key) in keys.iter().enumerate() {
            storage
                .set_multi(&ctx, &[(key.clone(), props(i as i64))])
                .await
                .unwrap();
        }
        assert_eq!(storage.len(), 2);
        assert!(!storage.contains(&keys[0]));
        assert!(storage.contains(&keys[2]));
    }
}
