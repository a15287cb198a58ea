use futures::future::BoxFuture;

use super::{LogFn, Middleware, MiddlewareInfo, Operation, emit};
use crate::iterator::IteratorState;
use crate::{Commit, Error, Key, PendingKey, PropertyList, QueryDump, Transaction};

/// Reports every call and its outcome, one line each way.
#[derive(Clone, Default)]
pub struct Logging {
    logf: Option<LogFn>,
}

impl Logging {
    pub fn new(logf: Option<LogFn>) -> Self {
        Self { logf }
    }

    fn enter(&self, operation: Operation, detail: std::fmt::Arguments<'_>) {
        emit(&self.logf, &format!("{}: {}", operation, detail));
    }

    fn leave<T>(&self, operation: Operation, result: Result<T, Error>) -> Result<T, Error> {
        match &result {
            Ok(_) => emit(&self.logf, &format!("{}: ok", operation)),
            Err(err) => emit(&self.logf, &format!("{}: error: {}", operation, err)),
        }
        result
    }
}

fn describe(dump: &QueryDump) -> String {
    let kind = if dump.is_kindless() { "(kindless)" } else { dump.kind.as_str() };
    format!(
        "kind={} filters={} orders={} keys_only={}",
        kind,
        dump.filters.len(),
        dump.orders.len(),
        dump.keys_only
    )
}

impl Middleware for Logging {
    fn allocate_ids<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        keys: &'a [Key],
    ) -> BoxFuture<'a, Result<Vec<Key>, Error>> {
        Box::pin(async move {
            self.enter(Operation::AllocateIds, format_args!("{} keys", keys.len()));
            self.leave(Operation::AllocateIds, info.next.allocate_ids(keys).await)
        })
    }

    fn put_multi_without_tx<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        keys: &'a [Key],
        src: &'a [PropertyList],
    ) -> BoxFuture<'a, Result<Vec<Key>, Error>> {
        Box::pin(async move {
            self.enter(Operation::PutMultiWithoutTx, format_args!("{} keys", keys.len()));
            self.leave(
                Operation::PutMultiWithoutTx,
                info.next.put_multi_without_tx(keys, src).await,
            )
        })
    }

    fn put_multi_with_tx<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        keys: &'a [Key],
        src: &'a [PropertyList],
    ) -> BoxFuture<'a, Result<Vec<PendingKey>, Error>> {
        Box::pin(async move {
            self.enter(Operation::PutMultiWithTx, format_args!("{} keys", keys.len()));
            self.leave(
                Operation::PutMultiWithTx,
                info.next.put_multi_with_tx(keys, src).await,
            )
        })
    }

    fn get_multi_without_tx<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        keys: &'a [Key],
        dst: &'a mut [PropertyList],
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            self.enter(Operation::GetMultiWithoutTx, format_args!("{} keys", keys.len()));
            self.leave(
                Operation::GetMultiWithoutTx,
                info.next.get_multi_without_tx(keys, dst).await,
            )
        })
    }

    fn get_multi_with_tx<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        keys: &'a [Key],
        dst: &'a mut [PropertyList],
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            self.enter(Operation::GetMultiWithTx, format_args!("{} keys", keys.len()));
            self.leave(
                Operation::GetMultiWithTx,
                info.next.get_multi_with_tx(keys, dst).await,
            )
        })
    }

    fn delete_multi_without_tx<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        keys: &'a [Key],
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            self.enter(Operation::DeleteMultiWithoutTx, format_args!("{} keys", keys.len()));
            self.leave(
                Operation::DeleteMultiWithoutTx,
                info.next.delete_multi_without_tx(keys).await,
            )
        })
    }

    fn delete_multi_with_tx<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        keys: &'a [Key],
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            self.enter(Operation::DeleteMultiWithTx, format_args!("{} keys", keys.len()));
            self.leave(
                Operation::DeleteMultiWithTx,
                info.next.delete_multi_with_tx(keys).await,
            )
        })
    }

    fn post_commit<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        tx: &'a Transaction,
        commit: &'a Commit,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            self.enter(Operation::PostCommit, format_args!("transaction {}", tx.id()));
            self.leave(Operation::PostCommit, info.next.post_commit(tx, commit).await)
        })
    }

    fn post_rollback<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        tx: &'a Transaction,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            self.enter(Operation::PostRollback, format_args!("transaction {}", tx.id()));
            self.leave(Operation::PostRollback, info.next.post_rollback(tx).await)
        })
    }

    fn run<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        dump: &'a QueryDump,
    ) -> BoxFuture<'a, Result<IteratorState, Error>> {
        Box::pin(async move {
            self.enter(Operation::Run, format_args!("{}", describe(dump)));
            self.leave(Operation::Run, info.next.run(dump).await)
        })
    }

    fn get_all<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        dump: &'a QueryDump,
    ) -> BoxFuture<'a, Result<(Vec<Key>, Vec<PropertyList>), Error>> {
        Box::pin(async move {
            self.enter(Operation::GetAll, format_args!("{}", describe(dump)));
            self.leave(Operation::GetAll, info.next.get_all(dump).await)
        })
    }

    fn next<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        dump: &'a QueryDump,
        iter: &'a mut IteratorState,
    ) -> BoxFuture<'a, Result<(Key, PropertyList), Error>> {
        Box::pin(async move {
            let result = info.next.next(dump, iter).await;
            match &result {
                Ok((key, _)) => emit(&self.logf, &format!("{}: {}", Operation::Next, key)),
                Err(Error::Done) => emit(&self.logf, &format!("{}: done", Operation::Next)),
                Err(err) => emit(&self.logf, &format!("{}: error: {}", Operation::Next, err)),
            }
            result
        })
    }

    fn count<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        dump: &'a QueryDump,
    ) -> BoxFuture<'a, Result<usize, Error>> {
        Box::pin(async move {
            self.enter(Operation::Count, format_args!("{}", describe(dump)));
            self.leave(Operation::Count, info.next.count(dump).await)
        })
    }
}
