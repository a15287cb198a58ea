use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;

use super::eval::{self, Evaluated};
use super::{Backend, BackendIterator, BackendTransaction, VecIterator, fill_slots};
use crate::{Context, Error, Key, PropertyList, QueryDump};

#[derive(Default)]
struct Store {
    entities: BTreeMap<Key, PropertyList>,
    versions: HashMap<Key, u64>,
    clock: u64,
    last_id: i64,
}

impl Store {
    fn version(&self, key: &Key) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    fn touch(&mut self, key: &Key) {
        self.clock += 1;
        self.versions.insert(key.clone(), self.clock);
    }

    /// Ids already written, explicitly or not, are never handed out again.
    fn complete(&mut self, key: &Key) -> Key {
        if !key.is_incomplete() {
            return key.clone();
        }
        loop {
            self.last_id += 1;
            let candidate = key.completed(self.last_id);
            if !self.versions.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    fn put(&mut self, key: &Key, properties: PropertyList) -> Key {
        let key = self.complete(key);
        self.touch(&key);
        self.entities.insert(key.clone(), properties);
        key
    }

    fn delete(&mut self, key: &Key) {
        if self.entities.remove(key).is_some() {
            self.touch(key);
        }
    }

    fn evaluate(&self, dump: &QueryDump) -> Result<Evaluated, Error> {
        eval::evaluate(
            dump,
            self.entities
                .iter()
                .map(|(key, properties)| (key.clone(), properties.clone())),
        )
    }
}

/// In-process backend.
///
/// Clones share one store. Every write bumps the written key's version;
/// transactions remember the versions they read and refuse to commit when
/// any of them moved.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    store: Arc<Mutex<Store>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of stored entities.
    pub fn len(&self) -> usize {
        self.store().entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.store().entities.contains_key(key)
    }
}

fn check_lengths(keys: &[Key], src: &[PropertyList]) -> Result<(), Error> {
    if keys.len() != src.len() {
        return Err(Error::InvalidArgument(format!(
            "{} keys but {} entities",
            keys.len(),
            src.len()
        )));
    }
    Ok(())
}

impl Backend for MemoryBackend {
    fn get_multi<'a>(
        &'a self,
        _ctx: &'a Context,
        keys: &'a [Key],
        dst: &'a mut [PropertyList],
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let store = self.store();
            fill_slots(keys, dst, |key| Ok(store.entities.get(key).cloned()))
        })
    }

    fn put_multi<'a>(
        &'a self,
        _ctx: &'a Context,
        keys: &'a [Key],
        src: &'a [PropertyList],
    ) -> BoxFuture<'a, Result<Vec<Key>, Error>> {
        Box::pin(async move {
            check_lengths(keys, src)?;
            let mut store = self.store();
            let mut stored = keys.to_vec();
            // Explicit keys go first so completion sees every id this call writes.
            for (i, properties) in src.iter().enumerate() {
                if !keys[i].is_incomplete() {
                    stored[i] = store.put(&keys[i], properties.clone());
                }
            }
            for (i, properties) in src.iter().enumerate() {
                if keys[i].is_incomplete() {
                    stored[i] = store.put(&keys[i], properties.clone());
                }
            }
            Ok(stored)
        })
    }

    fn delete_multi<'a>(&'a self, _ctx: &'a Context, keys: &'a [Key]) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let mut store = self.store();
            for key in keys {
                store.delete(key);
            }
            Ok(())
        })
    }

    fn allocate_ids<'a>(&'a self, _ctx: &'a Context, keys: &'a [Key]) -> BoxFuture<'a, Result<Vec<Key>, Error>> {
        Box::pin(async move {
            if let Some(key) = keys.iter().find(|key| !key.is_incomplete()) {
                return Err(Error::InvalidKey(format!("{} is already complete", key)));
            }
            let mut store = self.store();
            Ok(keys.iter().map(|key| store.complete(key)).collect())
        })
    }

    fn run_query<'a>(
        &'a self,
        _ctx: &'a Context,
        dump: &'a QueryDump,
    ) -> BoxFuture<'a, Result<Box<dyn BackendIterator>, Error>> {
        Box::pin(async move {
            let evaluated = self.store().evaluate(dump)?;
            Ok(Box::new(VecIterator::new(evaluated)) as Box<dyn BackendIterator>)
        })
    }

    fn count<'a>(&'a self, _ctx: &'a Context, dump: &'a QueryDump) -> BoxFuture<'a, Result<usize, Error>> {
        Box::pin(async move { Ok(self.store().evaluate(dump)?.items.len()) })
    }

    fn new_transaction<'a>(&'a self, _ctx: &'a Context) -> BoxFuture<'a, Result<Box<dyn BackendTransaction>, Error>> {
        Box::pin(async move {
            Ok(Box::new(MemoryTransaction {
                store: self.clone(),
                state: Mutex::new(TxState::default()),
            }) as Box<dyn BackendTransaction>)
        })
    }
}

enum TxOp {
    Put {
        slot: u64,
        key: Key,
        properties: PropertyList,
    },
    Delete(Key),
}

#[derive(Default)]
struct TxState {
    reads: HashMap<Key, u64>,
    ops: Vec<TxOp>,
    next_slot: u64,
    finished: bool,
}

impl TxState {
    fn ensure_open(&self) -> Result<(), Error> {
        if self.finished {
            Err(Error::TransactionFinished)
        } else {
            Ok(())
        }
    }

    fn observe(&mut self, store: &Store, key: &Key) {
        self.reads
            .entry(key.clone())
            .or_insert_with(|| store.version(key));
    }
}

struct MemoryTransaction {
    store: MemoryBackend,
    state: Mutex<TxState>,
}

impl MemoryTransaction {
    fn state(&self) -> MutexGuard<'_, TxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn evaluate(&self, dump: &QueryDump) -> Result<Evaluated, Error> {
        if dump.ancestor.is_none() {
            return Err(Error::InvalidQuery(
                "queries inside a transaction need an ancestor".to_string(),
            ));
        }
        let mut state = self.state();
        state.ensure_open()?;
        let store = self.store.store();
        let evaluated = store.evaluate(dump)?;
        for (key, _) in evaluated.items.iter() {
            state.observe(&store, key);
        }
        Ok(evaluated)
    }
}

impl BackendTransaction for MemoryTransaction {
    fn get_multi<'a>(
        &'a self,
        _ctx: &'a Context,
        keys: &'a [Key],
        dst: &'a mut [PropertyList],
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let mut state = self.state();
            state.ensure_open()?;
            let store = self.store.store();
            fill_slots(keys, dst, |key| {
                state.observe(&store, key);
                Ok(store.entities.get(key).cloned())
            })
        })
    }

    fn put_multi<'a>(
        &'a self,
        _ctx: &'a Context,
        keys: &'a [Key],
        src: &'a [PropertyList],
    ) -> BoxFuture<'a, Result<Vec<u64>, Error>> {
        Box::pin(async move {
            check_lengths(keys, src)?;
            let mut state = self.state();
            state.ensure_open()?;
            let mut slots = Vec::with_capacity(keys.len());
            for (key, properties) in keys.iter().zip(src) {
                let slot = state.next_slot;
                state.next_slot += 1;
                state.ops.push(TxOp::Put {
                    slot,
                    key: key.clone(),
                    properties: properties.clone(),
                });
                slots.push(slot);
            }
            Ok(slots)
        })
    }

    fn delete_multi<'a>(&'a self, _ctx: &'a Context, keys: &'a [Key]) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let mut state = self.state();
            state.ensure_open()?;
            state
                .ops
                .extend(keys.iter().cloned().map(TxOp::Delete));
            Ok(())
        })
    }

    fn run_query<'a>(
        &'a self,
        _ctx: &'a Context,
        dump: &'a QueryDump,
    ) -> BoxFuture<'a, Result<Box<dyn BackendIterator>, Error>> {
        Box::pin(async move {
            let evaluated = self.evaluate(dump)?;
            Ok(Box::new(VecIterator::new(evaluated)) as Box<dyn BackendIterator>)
        })
    }

    fn count<'a>(&'a self, _ctx: &'a Context, dump: &'a QueryDump) -> BoxFuture<'a, Result<usize, Error>> {
        Box::pin(async move { Ok(self.evaluate(dump)?.items.len()) })
    }

    fn commit<'a>(&'a self, _ctx: &'a Context) -> BoxFuture<'a, Result<HashMap<u64, Key>, Error>> {
        Box::pin(async move {
            let mut state = self.state();
            state.ensure_open()?;
            state.finished = true;
            let mut store = self.store.store();
            let conflict = state
                .reads
                .iter()
                .any(|(key, version)| store.version(key) != *version);
            if conflict {
                return Err(Error::ConcurrentTransaction);
            }
            let (incomplete, ops): (Vec<_>, Vec<_>) = std::mem::take(&mut state.ops)
                .into_iter()
                .partition(|op| matches!(op, TxOp::Put { key, .. } if key.is_incomplete()));
            let mut committed = HashMap::new();
            for op in ops.into_iter().chain(incomplete) {
                match op {
                    TxOp::Put {
                        slot,
                        key,
                        properties,
                    } => {
                        committed.insert(slot, store.put(&key, properties));
                    }
                    TxOp::Delete(key) => store.delete(&key),
                }
            }
            Ok(committed)
        })
    }

    fn rollback<'a>(&'a self, _ctx: &'a Context) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let mut state = self.state();
            state.ensure_open()?;
            state.finished = true;
            state.ops.clear();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Property, Query, Value};

    fn props(n: i64) -> PropertyList {
        vec![Property::new("N", Value::Int(n))].into()
    }

    #[tokio::test]
    async fn put_completes_incomplete_keys() {
        let backend = MemoryBackend::new();
        let ctx = Context::background();
        let keys = backend
            .put_multi(&ctx, &[Key::incomplete("Data", None), Key::with_name("Data", "x", None)], &[props(1), props(2)])
            .await
            .unwrap();
        assert!(!keys[0].is_incomplete());
        assert_eq!(keys[1].name(), "x");

        let mut dst = vec![PropertyList::new(); 3];
        let missing = Key::with_id("Data", 999, None);
        let err = backend
            .get_multi(&ctx, &[keys[0].clone(), missing, keys[1].clone()], &mut dst)
            .await
            .unwrap_err();
        match err {
            Error::Multi(m) => {
                assert!(m.get(0).is_none());
                assert!(m.get(1).is_some_and(Error::is_no_such_entity));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(dst[2], props(2));
    }

    #[tokio::test]
    async fn completion_skips_explicit_ids() {
        let backend = MemoryBackend::new();
        let ctx = Context::background();
        let explicit = Key::with_id("Data", 1, None);
        backend.put_multi(&ctx, &[explicit.clone()], &[props(1)]).await.unwrap();
        let keys = backend
            .put_multi(&ctx, &[Key::incomplete("Data", None)], &[props(2)])
            .await
            .unwrap();
        assert_ne!(keys[0], explicit);
        assert_eq!(backend.len(), 2);

        // Within one call the incomplete key comes first.
        let keys = backend
            .put_multi(
                &ctx,
                &[Key::incomplete("Data", None), Key::with_id("Data", 3, None)],
                &[props(4), props(3)],
            )
            .await
            .unwrap();
        assert_ne!(keys[0], keys[1]);
        assert_eq!(backend.len(), 4);

        let mut dst = vec![PropertyList::new(); 2];
        backend
            .get_multi(&ctx, &[explicit, keys[0].clone()], &mut dst)
            .await
            .unwrap();
        assert_eq!(dst, vec![props(1), props(2)]);
    }

    #[tokio::test]
    async fn deleting_absent_keys_leaves_no_versions() {
        let backend = MemoryBackend::new();
        let ctx = Context::background();
        let keys: Vec<Key> = (1..=50).map(|i| Key::with_id("Data", i, None)).collect();
        backend.delete_multi(&ctx, &keys).await.unwrap();
        assert!(backend.store().versions.is_empty());

        backend.put_multi(&ctx, &keys[..1], &[props(1)]).await.unwrap();
        backend.delete_multi(&ctx, &keys[..1]).await.unwrap();
        assert_eq!(backend.store().versions.len(), 1);
    }

    #[tokio::test]
    async fn allocate_ids_rejects_complete_keys() {
        let backend = MemoryBackend::new();
        let ctx = Context::background();
        let ids = backend
            .allocate_ids(&ctx, &[Key::incomplete("Data", None), Key::incomplete("Data", None)])
            .await
            .unwrap();
        assert_ne!(ids[0], ids[1]);
        assert!(backend.is_empty());
        assert!(matches!(
            backend.allocate_ids(&ctx, &[Key::with_id("Data", 1, None)]).await,
            Err(Error::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn conflicting_transactions() {
        let backend = MemoryBackend::new();
        let ctx = Context::background();
        let key = Key::with_id("Data", 1, None);
        backend.put_multi(&ctx, &[key.clone()], &[props(0)]).await.unwrap();

        let t1 = backend.new_transaction(&ctx).await.unwrap();
        let t2 = backend.new_transaction(&ctx).await.unwrap();
        let mut dst = vec![PropertyList::new()];
        t1.get_multi(&ctx, &[key.clone()], &mut dst).await.unwrap();
        t2.get_multi(&ctx, &[key.clone()], &mut dst).await.unwrap();
        t1.put_multi(&ctx, &[key.clone()], &[props(1)]).await.unwrap();
        t2.put_multi(&ctx, &[key.clone()], &[props(2)]).await.unwrap();

        let committed = t1.commit(&ctx).await.unwrap();
        assert_eq!(committed.get(&0), Some(&key));
        assert!(matches!(t2.commit(&ctx).await, Err(Error::ConcurrentTransaction)));
        assert!(matches!(t2.rollback(&ctx).await, Err(Error::TransactionFinished)));
    }

    #[tokio::test]
    async fn transaction_queries_need_an_ancestor() {
        let backend = MemoryBackend::new();
        let ctx = Context::background();
        let tx = backend.new_transaction(&ctx).await.unwrap();
        assert!(matches!(
            tx.count(&ctx, Query::new("Data").dump()).await,
            Err(Error::InvalidQuery(_))
        ));
        let parent = Key::with_id("Org", 1, None);
        assert_eq!(tx.count(&ctx, Query::new("Data").ancestor(&parent).dump()).await.unwrap(), 0);
    }
}
