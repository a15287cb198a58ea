//! Read-through entity cache.
//!
//! Non-transactional gets are served from a [`CacheStorage`] when possible
//! and filled on miss. Writes and deletes outside transactions invalidate
//! the touched keys; inside a transaction the keys are remembered and
//! invalidated once the transaction commits. Queries never touch the cache.

mod encoded;
mod local;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;

use super::{Middleware, MiddlewareInfo};
use crate::error::slot_errors;
use crate::transaction::WeakTransaction;
use crate::{Commit, Context, Error, Key, MultiError, PendingKey, PropertyList, Transaction};

pub use encoded::{ByteStore, EncodedStorage};
pub use local::LocalStorage;

/// Where cached entities live.
pub trait CacheStorage: Send + Sync {
    /// One slot per key; `None` is a miss.
    fn get_multi<'a>(
        &'a self,
        ctx: &'a Context,
        keys: &'a [Key],
    ) -> BoxFuture<'a, Result<Vec<Option<PropertyList>>, Error>>;

    fn set_multi<'a>(
        &'a self,
        ctx: &'a Context,
        items: &'a [(Key, PropertyList)],
    ) -> BoxFuture<'a, Result<(), Error>>;

    fn delete_multi<'a>(&'a self, ctx: &'a Context, keys: &'a [Key]) -> BoxFuture<'a, Result<(), Error>>;
}

type KeyPredicate = Arc<dyn Fn(&Key) -> bool + Send + Sync>;

/// Decides which keys are cached. Accepts everything by default.
#[derive(Clone, Default)]
pub struct CacheFilter {
    include: Option<HashSet<String>>,
    exclude: HashSet<String>,
    predicate: Option<KeyPredicate>,
}

impl fmt::Debug for CacheFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheFilter")
            .field("include", &self.include)
            .field("exclude", &self.exclude)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

impl CacheFilter {
    pub fn all() -> Self {
        Self::default()
    }

    /// Only the kinds of types deriving `KvEntity`.
    pub fn registered_kinds() -> Self {
        Self::all().include_kinds(crate::registered_kinds())
    }

    pub fn include_kinds<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include
            .get_or_insert_with(HashSet::new)
            .extend(kinds.into_iter().map(Into::into));
        self
    }

    pub fn exclude_kinds<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude.extend(kinds.into_iter().map(Into::into));
        self
    }

    pub fn with_predicate(mut self, predicate: impl Fn(&Key) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn accepts(&self, key: &Key) -> bool {
        if key.is_incomplete() || self.exclude.contains(key.kind()) {
            return false;
        }
        if let Some(include) = &self.include {
            if !include.contains(key.kind()) {
                return false;
            }
        }
        self.predicate.as_ref().is_none_or(|p| p(key))
    }
}

/// Keys written by one open transaction.
struct PendingWrites {
    tx: WeakTransaction,
    keys: Vec<Key>,
}

pub struct CacheMiddleware<S> {
    storage: S,
    filter: CacheFilter,
    pending: Mutex<HashMap<u64, PendingWrites>>,
}

impl<S: CacheStorage> CacheMiddleware<S> {
    pub fn new(storage: S, filter: CacheFilter) -> Self {
        Self {
            storage,
            filter,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<u64, PendingWrites>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cacheable(&self, keys: &[Key]) -> Vec<Key> {
        keys.iter()
            .filter(|key| self.filter.accepts(key))
            .cloned()
            .collect()
    }

    async fn invalidate(&self, ctx: &Context, keys: Vec<Key>) {
        if keys.is_empty() {
            return;
        }
        if let Err(err) = self.storage.delete_multi(ctx, &keys).await {
            log::warn!("cache invalidation of {} keys failed: {}", keys.len(), err);
        }
    }

    fn remember(&self, tx: Option<&Transaction>, keys: &[Key]) {
        let Some(tx) = tx else {
            return;
        };
        let keys = self.cacheable(keys);
        if keys.is_empty() {
            return;
        }
        let mut pending = self.pending();
        // Transactions dropped without commit or rollback never report back.
        pending.retain(|_, writes| !writes.tx.is_dropped());
        pending
            .entry(tx.id())
            .or_insert_with(|| PendingWrites {
                tx: tx.downgrade(),
                keys: Vec::new(),
            })
            .keys
            .extend(keys);
    }

    /// Serves what the cache holds and forwards the rest as one request.
    async fn read_through(
        &self,
        info: &MiddlewareInfo<'_>,
        keys: &[Key],
        dst: &mut [PropertyList],
    ) -> Result<(), Error> {
        let cacheable: Vec<usize> = (0..keys.len())
            .filter(|&i| self.filter.accepts(&keys[i]))
            .collect();
        let mut hit = vec![false; keys.len()];
        if !cacheable.is_empty() {
            let lookup: Vec<Key> = cacheable.iter().map(|&i| keys[i].clone()).collect();
            match self.storage.get_multi(info.context, &lookup).await {
                Ok(found) => {
                    for (&i, properties) in cacheable.iter().zip(found) {
                        if let Some(properties) = properties {
                            dst[i] = properties;
                            hit[i] = true;
                        }
                    }
                }
                Err(err) => log::warn!("cache lookup of {} keys failed: {}", lookup.len(), err),
            }
        }

        let misses: Vec<usize> = (0..keys.len()).filter(|&i| !hit[i]).collect();
        if misses.is_empty() {
            return Ok(());
        }
        let miss_keys: Vec<Key> = misses.iter().map(|&i| keys[i].clone()).collect();
        let mut fetched = vec![PropertyList::new(); misses.len()];
        let result = info
            .next
            .get_multi_without_tx(&miss_keys, &mut fetched)
            .await;
        let errors = slot_errors(result, misses.len())?;

        let mut merged = MultiError::new(keys.len());
        let mut fill = Vec::new();
        for (slot, (&i, properties)) in misses.iter().zip(fetched).enumerate() {
            match errors.get(slot) {
                Some(err) => merged.set(i, err.clone()),
                None => {
                    if self.filter.accepts(&keys[i]) {
                        fill.push((keys[i].clone(), properties.clone()));
                    }
                    dst[i] = properties;
                }
            }
        }
        if !fill.is_empty() {
            if let Err(err) = self.storage.set_multi(info.context, &fill).await {
                log::warn!("cache fill of {} keys failed: {}", fill.len(), err);
            }
        }
        merged.into_result()
    }
}

impl<S: CacheStorage> Middleware for CacheMiddleware<S> {
    fn get_multi_without_tx<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        keys: &'a [Key],
        dst: &'a mut [PropertyList],
    ) -> BoxFuture<'a, Result<(), Error>> {
        if keys.len() != dst.len() {
            return info.next.get_multi_without_tx(keys, dst);
        }
        Box::pin(self.read_through(info, keys, dst))
    }

    fn put_multi_without_tx<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        keys: &'a [Key],
        src: &'a [PropertyList],
    ) -> BoxFuture<'a, Result<Vec<Key>, Error>> {
        Box::pin(async move {
            let result = info.next.put_multi_without_tx(keys, src).await;
            self.invalidate(info.context, self.cacheable(keys)).await;
            result
        })
    }

    fn delete_multi_without_tx<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        keys: &'a [Key],
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let result = info.next.delete_multi_without_tx(keys).await;
            self.invalidate(info.context, self.cacheable(keys)).await;
            result
        })
    }

    fn put_multi_with_tx<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        keys: &'a [Key],
        src: &'a [PropertyList],
    ) -> BoxFuture<'a, Result<Vec<PendingKey>, Error>> {
        self.remember(info.transaction, keys);
        info.next.put_multi_with_tx(keys, src)
    }

    fn delete_multi_with_tx<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        keys: &'a [Key],
    ) -> BoxFuture<'a, Result<(), Error>> {
        self.remember(info.transaction, keys);
        info.next.delete_multi_with_tx(keys)
    }

    fn post_commit<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        tx: &'a Transaction,
        commit: &'a Commit,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let keys = self
                .pending()
                .remove(&tx.id())
                .map(|writes| writes.keys)
                .unwrap_or_default();
            self.invalidate(info.context, keys).await;
            info.next.post_commit(tx, commit).await
        })
    }

    fn post_rollback<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        tx: &'a Transaction,
    ) -> BoxFuture<'a, Result<(), Error>> {
        self.pending().remove(&tx.id());
        info.next.post_rollback(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_by_kind_and_predicate() {
        let data = Key::with_id("Data", 1, None);
        let other = Key::with_id("Other", 1, None);
        assert!(CacheFilter::all().accepts(&data));
        assert!(!CacheFilter::all().accepts(&Key::incomplete("Data", None)));

        let only_data = CacheFilter::all().include_kinds(["Data"]);
        assert!(only_data.accepts(&data));
        assert!(!only_data.accepts(&other));

        let no_data = CacheFilter::all().exclude_kinds(["Data"]);
        assert!(!no_data.accepts(&data));

        let even = CacheFilter::all().with_predicate(|k| k.id() % 2 == 0);
        assert!(!even.accepts(&data));
        assert!(even.accepts(&Key::with_id("Data", 2, None)));
    }

    #[tokio::test]
    async fn dropped_transactions_release_their_keys() {
        use crate::backend::MemoryBackend;
        use crate::{Client, ClientOptions, Property, Value};

        let client = Client::new(MemoryBackend::new(), ClientOptions::default());
        let cache = Arc::new(CacheMiddleware::new(LocalStorage::new(), CacheFilter::all()));
        client.append_middleware(cache.clone()).unwrap();

        let ctx = Context::background();
        let src = PropertyList::from(vec![Property::new("N", Value::Int(1))]);
        for id in 1..=3 {
            let tx = client.new_transaction(&ctx).await.unwrap();
            tx.put(&Key::with_id("Data", id, None), &src).await.unwrap();
        }
        assert_eq!(cache.pending().len(), 1);

        let tx = client.new_transaction(&ctx).await.unwrap();
        tx.put(&Key::with_id("Data", 9, None), &src).await.unwrap();
        assert_eq!(cache.pending().len(), 1);
        tx.commit().await.unwrap();
        assert!(cache.pending().is_empty());
    }
}
