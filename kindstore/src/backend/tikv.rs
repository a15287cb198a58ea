use std::collections::{BTreeMap, HashMap};

use futures::future::BoxFuture;
use futures::lock::Mutex;
use tikv_client::proto::kvrpcpb;
use tikv_client::{CheckLevel, TransactionClient, TransactionOptions};

use super::eval::{self, Evaluated};
use super::{Backend, BackendIterator, BackendTransaction, VecIterator, fill_slots};
use crate::codec::{decode_properties, encode_properties};
use crate::utils::{
    entity_path, key_from_path, kind_prefix, namespace_prefix, next_key, prefix_range,
    sequence_path,
};
use crate::{Context, Error, Key, PropertyList, QueryDump};

const PAGE_SIZE: u32 = 128;
const SEQUENCE_ATTEMPTS: usize = 8;

/// Maps TiKV failures onto the error taxonomy: write conflicts become
/// `ConcurrentTransaction`, timeouts and unavailable regions become
/// `Transient`.
fn classify(err: tikv_client::Error) -> Error {
    let message = format!("{:?}", err);
    if message.contains("WriteConflict") || message.contains("write conflict") {
        Error::ConcurrentTransaction
    } else if message.contains("Timeout")
        || message.contains("timed out")
        || message.contains("Unavailable")
        || message.contains("ServerIsBusy")
        || message.contains("NotLeader")
    {
        Error::Transient(err.to_string())
    } else {
        err.into()
    }
}

fn optimistic() -> TransactionOptions {
    TransactionOptions::new_optimistic().drop_check(CheckLevel::Warn)
}

/// Scans every entity under a path prefix, a page at a time.
macro_rules! scan_prefix {
    ($reader:expr, $prefix:expr) => {{
        let (mut start_key, end_key) = prefix_range($prefix);
        let mut entities = Vec::new();
        loop {
            let kvs = $reader
                .scan(start_key.clone()..end_key.clone(), PAGE_SIZE)
                .await
                .map_err(classify)?
                .collect::<Vec<_>>();
            let Some(last) = kvs.last() else {
                break;
            };
            start_key = next_key(last.key());
            let len = kvs.len();
            for kv in kvs {
                let key = key_from_path(kv.key())?;
                entities.push((key, decode_properties(kv.value())?));
            }
            if len < PAGE_SIZE as usize {
                break;
            }
        }
        entities
    }};
}

fn query_prefix(dump: &QueryDump) -> String {
    if dump.is_kindless() {
        namespace_prefix(&dump.namespace)
    } else {
        kind_prefix(&dump.namespace, &dump.kind)
    }
}

fn put_mutation(key: &Key, properties: &PropertyList) -> kvrpcpb::Mutation {
    kvrpcpb::Mutation {
        key: entity_path(key).into(),
        op: kvrpcpb::Op::Put.into(),
        value: encode_properties(properties),
        ..Default::default()
    }
}

fn delete_mutation(key: &Key) -> kvrpcpb::Mutation {
    kvrpcpb::Mutation {
        key: entity_path(key).into(),
        op: kvrpcpb::Op::Del.into(),
        ..Default::default()
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

/// Backend storing entities in TiKV.
///
/// Entities live under `entity/{namespace}/{kind}/{encoded key}` as encoded
/// property lists, with namespace and kind hex encoded; id sequences live
/// under `sequence/{namespace}/{kind}`.
#[derive(Clone)]
pub struct TikvBackend {
    client: TransactionClient,
}

impl TikvBackend {
    pub async fn connect(pd_endpoints: Vec<String>) -> Result<Self, Error> {
        let client = TransactionClient::new(pd_endpoints).await?;
        Ok(Self { client })
    }

    pub fn from_client(client: TransactionClient) -> Self {
        Self { client }
    }

    async fn snapshot(&self) -> Result<tikv_client::Snapshot, Error> {
        Ok(self.client.snapshot(
            self.client.current_timestamp().await.map_err(classify)?,
            TransactionOptions::new_optimistic(),
        ))
    }

    /// Reserves `count` ids from the sequence of `(namespace, kind)` and
    /// returns the first one.
    async fn reserve(&self, namespace: &str, kind: &str, count: usize) -> Result<i64, Error> {
        let path = sequence_path(namespace, kind);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut txn = self.client.begin_with_options(optimistic()).await.map_err(classify)?;
            let last = match txn.get(path.clone()).await.map_err(classify)? {
                Some(data) => {
                    let bytes: [u8; 8] = data.as_slice().try_into().map_err(|_| {
                        Error::InvalidArgument(format!("corrupt sequence {}", path))
                    })?;
                    i64::from_be_bytes(bytes)
                }
                None => 0,
            };
            let reserved = last + count as i64;
            txn.put(path.clone(), reserved.to_be_bytes().to_vec())
                .await
                .map_err(classify)?;
            match txn.commit().await.map_err(classify) {
                Ok(_) => return Ok(last + 1),
                Err(Error::ConcurrentTransaction) if attempt < SEQUENCE_ATTEMPTS => {
                    log::debug!("sequence {} contended, attempt {}", path, attempt);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Completes incomplete keys, leaving complete ones as they are.
    async fn complete(&self, keys: &[Key]) -> Result<Vec<Key>, Error> {
        let mut groups: BTreeMap<(&str, &str), usize> = BTreeMap::new();
        for key in keys.iter().filter(|key| key.is_incomplete()) {
            *groups.entry((key.namespace(), key.kind())).or_default() += 1;
        }
        let mut next_ids = HashMap::new();
        for ((namespace, kind), count) in groups {
            next_ids.insert((namespace, kind), self.reserve(namespace, kind, count).await?);
        }
        Ok(keys
            .iter()
            .map(|key| match next_ids.get_mut(&(key.namespace(), key.kind())) {
                Some(id) if key.is_incomplete() => {
                    let completed = key.completed(*id);
                    *id += 1;
                    completed
                }
                _ => key.clone(),
            })
            .collect())
    }

    async fn load(&self, dump: &QueryDump) -> Result<Evaluated, Error> {
        let mut snapshot = self.snapshot().await?;
        let entities = scan_prefix!(snapshot, &query_prefix(dump));
        eval::evaluate(dump, entities)
    }
}

/// Fills `dst` from the pairs a batch read returned.
fn fill_from_pairs(keys: &[Key], dst: &mut [PropertyList], pairs: Vec<tikv_client::KvPair>) -> Result<(), Error> {
    let mut found = HashMap::new();
    for kv in pairs {
        let path: Vec<u8> = kv.key().clone().into();
        found.insert(path, kv.into_value());
    }
    fill_slots(keys, dst, |key| {
        let path: Vec<u8> = entity_path(key).into();
        found
            .remove(&path)
            .map(|data| decode_properties(&data))
            .transpose()
    })
}

impl Backend for TikvBackend {
    fn get_multi<'a>(
        &'a self,
        _ctx: &'a Context,
        keys: &'a [Key],
        dst: &'a mut [PropertyList],
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let mut snapshot = self.snapshot().await?;
            let pairs = snapshot
                .batch_get(keys.iter().map(entity_path))
                .await
                .map_err(classify)?
                .collect();
            fill_from_pairs(keys, dst, pairs)
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
            let keys = self.complete(keys).await?;
            let mutations: Vec<_> = keys
                .iter()
                .zip(src)
                .map(|(key, properties)| put_mutation(key, properties))
                .collect();
            let mut txn = self.client.begin_with_options(optimistic()).await.map_err(classify)?;
            txn.batch_mutate(mutations).await.map_err(classify)?;
            txn.commit().await.map_err(classify)?;
            Ok(keys)
        })
    }

    fn delete_multi<'a>(&'a self, _ctx: &'a Context, keys: &'a [Key]) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let mut txn = self.client.begin_with_options(optimistic()).await.map_err(classify)?;
            txn.batch_mutate(keys.iter().map(delete_mutation))
                .await
                .map_err(classify)?;
            txn.commit().await.map_err(classify)?;
            Ok(())
        })
    }

    fn allocate_ids<'a>(&'a self, _ctx: &'a Context, keys: &'a [Key]) -> BoxFuture<'a, Result<Vec<Key>, Error>> {
        Box::pin(async move {
            if let Some(key) = keys.iter().find(|key| !key.is_incomplete()) {
                return Err(Error::InvalidKey(format!("{} is already complete", key)));
            }
            self.complete(keys).await
        })
    }

    fn run_query<'a>(
        &'a self,
        _ctx: &'a Context,
        dump: &'a QueryDump,
    ) -> BoxFuture<'a, Result<Box<dyn BackendIterator>, Error>> {
        Box::pin(async move {
            let evaluated = self.load(dump).await?;
            Ok(Box::new(VecIterator::new(evaluated)) as Box<dyn BackendIterator>)
        })
    }

    fn count<'a>(&'a self, _ctx: &'a Context, dump: &'a QueryDump) -> BoxFuture<'a, Result<usize, Error>> {
        Box::pin(async move { Ok(self.load(dump).await?.items.len()) })
    }

    fn new_transaction<'a>(&'a self, _ctx: &'a Context) -> BoxFuture<'a, Result<Box<dyn BackendTransaction>, Error>> {
        Box::pin(async move {
            let txn = self.client.begin_with_options(optimistic()).await.map_err(classify)?;
            Ok(Box::new(TikvTransaction {
                backend: self.clone(),
                txn: Mutex::new(txn),
                slots: Mutex::new(Vec::new()),
            }) as Box<dyn BackendTransaction>)
        })
    }
}

/// Open TiKV transaction. Ids for incomplete keys are reserved when they are
/// put, so the slot table already holds final keys at commit.
struct TikvTransaction {
    backend: TikvBackend,
    txn: Mutex<tikv_client::Transaction>,
    slots: Mutex<Vec<Key>>,
}

impl TikvTransaction {
    async fn load(&self, dump: &QueryDump) -> Result<Evaluated, Error> {
        if dump.ancestor.is_none() {
            return Err(Error::InvalidQuery(
                "queries inside a transaction need an ancestor".to_string(),
            ));
        }
        let mut txn = self.txn.lock().await;
        let entities = scan_prefix!(txn, &query_prefix(dump));
        eval::evaluate(dump, entities)
    }
}

impl BackendTransaction for TikvTransaction {
    fn get_multi<'a>(
        &'a self,
        _ctx: &'a Context,
        keys: &'a [Key],
        dst: &'a mut [PropertyList],
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let pairs = self
                .txn
                .lock()
                .await
                .batch_get(keys.iter().map(entity_path))
                .await
                .map_err(classify)?
                .collect();
            fill_from_pairs(keys, dst, pairs)
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
            let keys = self.backend.complete(keys).await?;
            let mutations: Vec<_> = keys
                .iter()
                .zip(src)
                .map(|(key, properties)| put_mutation(key, properties))
                .collect();
            self.txn
                .lock()
                .await
                .batch_mutate(mutations)
                .await
                .map_err(classify)?;
            let mut slots = self.slots.lock().await;
            let first = slots.len() as u64;
            slots.extend(keys);
            Ok((first..slots.len() as u64).collect())
        })
    }

    fn delete_multi<'a>(&'a self, _ctx: &'a Context, keys: &'a [Key]) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            self.txn
                .lock()
                .await
                .batch_mutate(keys.iter().map(delete_mutation))
                .await
                .map_err(classify)
        })
    }

    fn run_query<'a>(
        &'a self,
        _ctx: &'a Context,
        dump: &'a QueryDump,
    ) -> BoxFuture<'a, Result<Box<dyn BackendIterator>, Error>> {
        Box::pin(async move {
            let evaluated = self.load(dump).await?;
            Ok(Box::new(VecIterator::new(evaluated)) as Box<dyn BackendIterator>)
        })
    }

    fn count<'a>(&'a self, _ctx: &'a Context, dump: &'a QueryDump) -> BoxFuture<'a, Result<usize, Error>> {
        Box::pin(async move { Ok(self.load(dump).await?.items.len()) })
    }

    fn commit<'a>(&'a self, _ctx: &'a Context) -> BoxFuture<'a, Result<HashMap<u64, Key>, Error>> {
        Box::pin(async move {
            self.txn.lock().await.commit().await.map_err(classify)?;
            let slots = std::mem::take(&mut *self.slots.lock().await);
            Ok(slots
                .into_iter()
                .enumerate()
                .map(|(slot, key)| (slot as u64, key))
                .collect())
        })
    }

    fn rollback<'a>(&'a self, _ctx: &'a Context) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            self.txn.lock().await.rollback().await.map_err(classify)?;
            self.slots.lock().await.clear();
            Ok(())
        })
    }
}
