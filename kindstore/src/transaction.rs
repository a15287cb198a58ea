use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::backend::BackendTransaction;
use crate::batch::TransactionBatch;
use crate::middleware::Next;
use crate::{Client, Context, Error, Key, KvEntity};

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

/// Placeholder for a key written inside a transaction. Resolve it with
/// [`Commit::key`] once the transaction committed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PendingKey {
    transaction_id: u64,
    slot: u64,
}

impl PendingKey {
    pub(crate) fn new(transaction_id: u64, slot: u64) -> Self {
        Self {
            transaction_id,
            slot,
        }
    }

    pub fn transaction_id(&self) -> u64 {
        self.transaction_id
    }

    pub fn slot(&self) -> u64 {
        self.slot
    }
}

/// Outcome of a successful commit: the final key of every pending key the
/// transaction handed out.
#[derive(Clone, Debug)]
pub struct Commit {
    transaction_id: u64,
    keys: HashMap<u64, Key>,
}

impl Commit {
    pub(crate) fn new(transaction_id: u64, keys: HashMap<u64, Key>) -> Self {
        Self {
            transaction_id,
            keys,
        }
    }

    pub fn transaction_id(&self) -> u64 {
        self.transaction_id
    }

    /// Resolves a pending key.
    ///
    /// # Panics
    ///
    /// Panics if `pending` was issued by another transaction.
    pub fn key(&self, pending: &PendingKey) -> Key {
        match self.try_key(pending) {
            Ok(key) => key,
            Err(_) => panic!(
                "pending key {:?} does not belong to transaction {}",
                pending, self.transaction_id
            ),
        }
    }

    pub fn try_key(&self, pending: &PendingKey) -> Result<Key, Error> {
        if pending.transaction_id != self.transaction_id {
            return Err(Error::PendingKeyMismatch);
        }
        self.keys
            .get(&pending.slot)
            .cloned()
            .ok_or(Error::PendingKeyMismatch)
    }

    /// Every key the transaction wrote.
    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.keys.values()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionState {
    Open,
    Committed,
    RolledBack,
}

struct TransactionInner {
    id: u64,
    client: Client,
    context: Context,
    backend: Box<dyn BackendTransaction>,
    state: Mutex<TransactionState>,
    finishing: AtomicBool,
}

pub(crate) struct WeakTransaction(Weak<TransactionInner>);

impl WeakTransaction {
    /// True once every [`Transaction`] handle is gone.
    pub(crate) fn is_dropped(&self) -> bool {
        self.0.strong_count() == 0
    }
}

/// Handle to an open transaction. Clones refer to the same transaction.
///
/// Operations run under the context the transaction was opened with.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Transaction {
    pub(crate) fn new(client: Client, context: Context, backend: Box<dyn BackendTransaction>) -> Self {
        Self {
            inner: Arc::new(TransactionInner {
                id: NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed),
                client,
                context,
                backend,
                state: Mutex::new(TransactionState::Open),
                finishing: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn state(&self) -> TransactionState {
        *self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_open(&self) -> bool {
        self.state() == TransactionState::Open && !self.inner.finishing.load(Ordering::Acquire)
    }

    pub fn context(&self) -> &Context {
        &self.inner.context
    }

    pub fn client(&self) -> &Client {
        &self.inner.client
    }

    /// A handle that does not keep the transaction alive.
    pub(crate) fn downgrade(&self) -> WeakTransaction {
        WeakTransaction(Arc::downgrade(&self.inner))
    }

    pub(crate) fn backend(&self) -> &dyn BackendTransaction {
        self.inner.backend.as_ref()
    }

    fn set_state(&self, state: TransactionState) {
        *self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::TransactionFinished)
        }
    }

    pub async fn get<T: KvEntity>(&self, key: &Key, dst: &mut T) -> Result<(), Error> {
        self.get_multi(std::slice::from_ref(key), std::slice::from_mut(dst))
            .await
            .map_err(Error::single)
    }

    pub async fn get_multi<T: KvEntity>(&self, keys: &[Key], dst: &mut [T]) -> Result<(), Error> {
        self.ensure_open()?;
        self.inner
            .client
            .dispatch_get(&self.inner.context, Some(self), keys, dst)
            .await
    }

    pub async fn put<T: KvEntity>(&self, key: &Key, src: &T) -> Result<PendingKey, Error> {
        let mut pending = self
            .put_multi(std::slice::from_ref(key), std::slice::from_ref(src))
            .await
            .map_err(Error::single)?;
        pending
            .pop()
            .ok_or_else(|| Error::InvalidArgument("put returned no pending key".to_string()))
    }

    pub async fn put_multi<T: KvEntity>(&self, keys: &[Key], src: &[T]) -> Result<Vec<PendingKey>, Error> {
        self.ensure_open()?;
        let src = self.inner.client.prepare_put(keys, src)?;
        let chain = self.inner.client.chain();
        Next::new(&chain, &self.inner.context, &self.inner.client, Some(self))
            .put_multi_with_tx(keys, &src)
            .await
    }

    pub async fn delete(&self, key: &Key) -> Result<(), Error> {
        self.delete_multi(std::slice::from_ref(key))
            .await
            .map_err(Error::single)
    }

    pub async fn delete_multi(&self, keys: &[Key]) -> Result<(), Error> {
        self.ensure_open()?;
        self.inner
            .client
            .dispatch_delete(&self.inner.context, Some(self), keys)
            .await
    }

    pub fn batch(&self) -> TransactionBatch {
        TransactionBatch::new(self.clone())
    }

    fn begin_finish(&self) -> Result<(), Error> {
        if self.state() != TransactionState::Open
            || self.inner.finishing.swap(true, Ordering::AcqRel)
        {
            return Err(Error::TransactionFinished);
        }
        Ok(())
    }

    /// Commits the transaction.
    ///
    /// After the backend committed, `post_commit` runs through the pipeline
    /// and the transaction becomes committed even if a hook failed; the
    /// hook's error is still returned. A failed backend commit rolls the
    /// transaction back and fires `post_rollback`.
    pub async fn commit(&self) -> Result<Commit, Error> {
        self.begin_finish()?;
        let ctx = &self.inner.context;
        let chain = self.inner.client.chain();
        let next = Next::new(&chain, ctx, &self.inner.client, Some(self));

        let keys = match self.backend().commit(ctx).await {
            Ok(keys) => keys,
            Err(err) => {
                log::debug!("transaction {} failed to commit: {}", self.id(), err);
                let hooks = next.post_rollback(self).await;
                self.set_state(TransactionState::RolledBack);
                if let Err(hook_err) = hooks {
                    log::warn!("post-rollback hook failed for transaction {}: {}", self.id(), hook_err);
                }
                return Err(err);
            }
        };

        let commit = Commit::new(self.id(), keys);
        let hooks = next.post_commit(self, &commit).await;
        self.set_state(TransactionState::Committed);
        if let Err(err) = hooks {
            log::warn!("post-commit hook failed for transaction {}: {}", self.id(), err);
            return Err(err);
        }
        Ok(commit)
    }

    pub async fn rollback(&self) -> Result<(), Error> {
        self.begin_finish()?;
        let ctx = &self.inner.context;
        let result = self.backend().rollback(ctx).await;
        let chain = self.inner.client.chain();
        let hooks = Next::new(&chain, ctx, &self.inner.client, Some(self))
            .post_rollback(self)
            .await;
        self.set_state(TransactionState::RolledBack);
        result?;
        hooks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit() -> Commit {
        let mut keys = HashMap::new();
        keys.insert(0, Key::with_id("Data", 5, None));
        Commit::new(7, keys)
    }

    #[test]
    fn commit_resolves_its_own_pending_keys() {
        let commit = commit();
        assert_eq!(commit.key(&PendingKey::new(7, 0)), Key::with_id("Data", 5, None));
        assert!(matches!(
            commit.try_key(&PendingKey::new(8, 0)),
            Err(Error::PendingKeyMismatch)
        ));
        assert!(matches!(
            commit.try_key(&PendingKey::new(7, 1)),
            Err(Error::PendingKeyMismatch)
        ));
    }

    #[test]
    #[should_panic(expected = "does not belong")]
    fn foreign_pending_key_panics() {
        commit().key(&PendingKey::new(1, 0));
    }
}
