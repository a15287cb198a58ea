//! The middleware pipeline.
//!
//! Every client operation is lowered into one of the hooks of
//! [`Middleware`] and threaded through the client's middleware list, head
//! first. Each frame receives a fresh [`MiddlewareInfo`] whose `next`
//! continues the call with the rest of the list; after the last middleware
//! the call reaches the backend.
//!
//! Every hook forwards to `next` by default, so a middleware overrides only
//! the hooks it cares about:
//!
//! ```rust,ignore
//! struct CountGets(AtomicUsize);
//!
//! impl Middleware for CountGets {
//!     fn get_multi_without_tx<'a>(
//!         &'a self,
//!         info: &'a MiddlewareInfo<'a>,
//!         keys: &'a [Key],
//!         dst: &'a mut [PropertyList],
//!     ) -> BoxFuture<'a, Result<(), Error>> {
//!         self.0.fetch_add(1, Ordering::Relaxed);
//!         info.next.get_multi_without_tx(keys, dst)
//!     }
//! }
//! ```

mod cache;
mod chain;
mod chaos;
mod fishbone;
mod logging;
mod retry;
mod split;

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::iterator::IteratorState;
use crate::{Client, Commit, Context, Error, Key, PendingKey, PropertyList, QueryDump, Transaction};

pub use cache::{
    ByteStore, CacheFilter, CacheMiddleware, CacheStorage, EncodedStorage, LocalStorage,
};
pub use chain::Next;
pub use chaos::{FailureInjection, FaultRule};
pub use fishbone::Fishbone;
pub use logging::Logging;
pub use retry::{Retry, RetryOptions};
pub use split::{Split, SplitOptions};

/// Line sink used by middlewares that report what they do.
pub type LogFn = Arc<dyn Fn(&str) + Send + Sync>;

pub(crate) fn emit(logf: &Option<LogFn>, line: &str) {
    match logf {
        Some(f) => f(line),
        None => log::debug!(target: "kindstore::middleware", "{}", line),
    }
}

/// Per-frame call record.
pub struct MiddlewareInfo<'a> {
    pub context: &'a Context,
    pub client: &'a Client,
    pub transaction: Option<&'a Transaction>,
    pub next: Next<'a>,
}

/// Every pipeline-visible operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    AllocateIds,
    PutMultiWithoutTx,
    PutMultiWithTx,
    GetMultiWithoutTx,
    GetMultiWithTx,
    DeleteMultiWithoutTx,
    DeleteMultiWithTx,
    PostCommit,
    PostRollback,
    Run,
    GetAll,
    Next,
    Count,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::AllocateIds => "AllocateIDs",
            Operation::PutMultiWithoutTx => "PutMultiWithoutTx",
            Operation::PutMultiWithTx => "PutMultiWithTx",
            Operation::GetMultiWithoutTx => "GetMultiWithoutTx",
            Operation::GetMultiWithTx => "GetMultiWithTx",
            Operation::DeleteMultiWithoutTx => "DeleteMultiWithoutTx",
            Operation::DeleteMultiWithTx => "DeleteMultiWithTx",
            Operation::PostCommit => "PostCommit",
            Operation::PostRollback => "PostRollback",
            Operation::Run => "Run",
            Operation::GetAll => "GetAll",
            Operation::Next => "Next",
            Operation::Count => "Count",
        })
    }
}

pub trait Middleware: Send + Sync {
    fn allocate_ids<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        keys: &'a [Key],
    ) -> BoxFuture<'a, Result<Vec<Key>, Error>> {
        info.next.allocate_ids(keys)
    }

    fn put_multi_without_tx<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        keys: &'a [Key],
        src: &'a [PropertyList],
    ) -> BoxFuture<'a, Result<Vec<Key>, Error>> {
        info.next.put_multi_without_tx(keys, src)
    }

    fn put_multi_with_tx<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        keys: &'a [Key],
        src: &'a [PropertyList],
    ) -> BoxFuture<'a, Result<Vec<PendingKey>, Error>> {
        info.next.put_multi_with_tx(keys, src)
    }

    /// Fills `dst` slot by slot. Per-key failures come back as
    /// `Error::Multi` with the same length as `keys`.
    fn get_multi_without_tx<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        keys: &'a [Key],
        dst: &'a mut [PropertyList],
    ) -> BoxFuture<'a, Result<(), Error>> {
        info.next.get_multi_without_tx(keys, dst)
    }

    fn get_multi_with_tx<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        keys: &'a [Key],
        dst: &'a mut [PropertyList],
    ) -> BoxFuture<'a, Result<(), Error>> {
        info.next.get_multi_with_tx(keys, dst)
    }

    fn delete_multi_without_tx<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        keys: &'a [Key],
    ) -> BoxFuture<'a, Result<(), Error>> {
        info.next.delete_multi_without_tx(keys)
    }

    fn delete_multi_with_tx<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        keys: &'a [Key],
    ) -> BoxFuture<'a, Result<(), Error>> {
        info.next.delete_multi_with_tx(keys)
    }

    /// Runs after the backend committed `tx`, before the handle is marked
    /// committed.
    fn post_commit<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        tx: &'a Transaction,
        commit: &'a Commit,
    ) -> BoxFuture<'a, Result<(), Error>> {
        info.next.post_commit(tx, commit)
    }

    fn post_rollback<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        tx: &'a Transaction,
    ) -> BoxFuture<'a, Result<(), Error>> {
        info.next.post_rollback(tx)
    }

    fn run<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        dump: &'a QueryDump,
    ) -> BoxFuture<'a, Result<IteratorState, Error>> {
        info.next.run(dump)
    }

    fn get_all<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        dump: &'a QueryDump,
    ) -> BoxFuture<'a, Result<(Vec<Key>, Vec<PropertyList>), Error>> {
        info.next.get_all(dump)
    }

    /// Advances `iter` by one item. `dump` is the query as the caller built
    /// it; exhaustion is `Error::Done`.
    fn next<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        dump: &'a QueryDump,
        iter: &'a mut IteratorState,
    ) -> BoxFuture<'a, Result<(Key, PropertyList), Error>> {
        info.next.next(dump, iter)
    }

    fn count<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        dump: &'a QueryDump,
    ) -> BoxFuture<'a, Result<usize, Error>> {
        info.next.count(dump)
    }
}

/// Forwards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct Noop;

impl Middleware for Noop {}
