use std::sync::Arc;

use futures::future::BoxFuture;

use super::{Middleware, MiddlewareInfo};
use crate::iterator::IteratorState;
use crate::{Client, Commit, Context, Error, Key, PendingKey, PropertyList, QueryDump, Transaction};

/// Continuation of a call: the middlewares after the current frame, then the
/// backend.
///
/// A `Next` borrows the call it belongs to and cannot outlive the hook that
/// received it.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    context: &'a Context,
    client: &'a Client,
    transaction: Option<&'a Transaction>,
}

impl<'a> Next<'a> {
    pub(crate) fn new(
        chain: &'a [Arc<dyn Middleware>],
        context: &'a Context,
        client: &'a Client,
        transaction: Option<&'a Transaction>,
    ) -> Self {
        Next {
            chain,
            context,
            client,
            transaction,
        }
    }

    /// Number of middlewares still ahead of the backend.
    pub fn remaining(&self) -> usize {
        self.chain.len()
    }

    fn frame(&self) -> (Option<&'a Arc<dyn Middleware>>, MiddlewareInfo<'a>) {
        let (head, rest) = match self.chain.split_first() {
            Some((head, rest)) => (Some(head), rest),
            None => (None, &[][..]),
        };
        let info = MiddlewareInfo {
            context: self.context,
            client: self.client,
            transaction: self.transaction,
            next: Next {
                chain: rest,
                ..*self
            },
        };
        (head, info)
    }

    pub fn allocate_ids<'b>(&'b self, keys: &'b [Key]) -> BoxFuture<'b, Result<Vec<Key>, Error>> {
        let (head, info) = self.frame();
        Box::pin(async move {
            match head {
                Some(m) => m.allocate_ids(&info, keys).await,
                None => terminal::allocate_ids(&info, keys).await,
            }
        })
    }

    pub fn put_multi_without_tx<'b>(
        &'b self,
        keys: &'b [Key],
        src: &'b [PropertyList],
    ) -> BoxFuture<'b, Result<Vec<Key>, Error>> {
        let (head, info) = self.frame();
        Box::pin(async move {
            match head {
                Some(m) => m.put_multi_without_tx(&info, keys, src).await,
                None => terminal::put_multi_without_tx(&info, keys, src).await,
            }
        })
    }

    pub fn put_multi_with_tx<'b>(
        &'b self,
        keys: &'b [Key],
        src: &'b [PropertyList],
    ) -> BoxFuture<'b, Result<Vec<PendingKey>, Error>> {
        let (head, info) = self.frame();
        Box::pin(async move {
            match head {
                Some(m) => m.put_multi_with_tx(&info, keys, src).await,
                None => terminal::put_multi_with_tx(&info, keys, src).await,
            }
        })
    }

    pub fn get_multi_without_tx<'b>(
        &'b self,
        keys: &'b [Key],
        dst: &'b mut [PropertyList],
    ) -> BoxFuture<'b, Result<(), Error>> {
        let (head, info) = self.frame();
        Box::pin(async move {
            match head {
                Some(m) => m.get_multi_without_tx(&info, keys, dst).await,
                None => terminal::get_multi_without_tx(&info, keys, dst).await,
            }
        })
    }

    pub fn get_multi_with_tx<'b>(
        &'b self,
        keys: &'b [Key],
        dst: &'b mut [PropertyList],
    ) -> BoxFuture<'b, Result<(), Error>> {
        let (head, info) = self.frame();
        Box::pin(async move {
            match head {
                Some(m) => m.get_multi_with_tx(&info, keys, dst).await,
                None => terminal::get_multi_with_tx(&info, keys, dst).await,
            }
        })
    }

    pub fn delete_multi_without_tx<'b>(&'b self, keys: &'b [Key]) -> BoxFuture<'b, Result<(), Error>> {
        let (head, info) = self.frame();
        Box::pin(async move {
            match head {
                Some(m) => m.delete_multi_without_tx(&info, keys).await,
                None => terminal::delete_multi_without_tx(&info, keys).await,
            }
        })
    }

    pub fn delete_multi_with_tx<'b>(&'b self, keys: &'b [Key]) -> BoxFuture<'b, Result<(), Error>> {
        let (head, info) = self.frame();
        Box::pin(async move {
            match head {
                Some(m) => m.delete_multi_with_tx(&info, keys).await,
                None => terminal::delete_multi_with_tx(&info, keys).await,
            }
        })
    }

    pub fn post_commit<'b>(
        &'b self,
        tx: &'b Transaction,
        commit: &'b Commit,
    ) -> BoxFuture<'b, Result<(), Error>> {
        let (head, info) = self.frame();
        Box::pin(async move {
            match head {
                Some(m) => m.post_commit(&info, tx, commit).await,
                None => Ok(()),
            }
        })
    }

    pub fn post_rollback<'b>(&'b self, tx: &'b Transaction) -> BoxFuture<'b, Result<(), Error>> {
        let (head, info) = self.frame();
        Box::pin(async move {
            match head {
                Some(m) => m.post_rollback(&info, tx).await,
                None => Ok(()),
            }
        })
    }

    pub fn run<'b>(&'b self, dump: &'b QueryDump) -> BoxFuture<'b, Result<IteratorState, Error>> {
        let (head, info) = self.frame();
        Box::pin(async move {
            match head {
                Some(m) => m.run(&info, dump).await,
                None => terminal::run(&info, dump).await,
            }
        })
    }

    pub fn get_all<'b>(
        &'b self,
        dump: &'b QueryDump,
    ) -> BoxFuture<'b, Result<(Vec<Key>, Vec<PropertyList>), Error>> {
        let (head, info) = self.frame();
        Box::pin(async move {
            match head {
                Some(m) => m.get_all(&info, dump).await,
                None => terminal::get_all(&info, dump).await,
            }
        })
    }

    pub fn next<'b>(
        &'b self,
        dump: &'b QueryDump,
        iter: &'b mut IteratorState,
    ) -> BoxFuture<'b, Result<(Key, PropertyList), Error>> {
        let (head, info) = self.frame();
        Box::pin(async move {
            match head {
                Some(m) => m.next(&info, dump, iter).await,
                None => terminal::next(&info, iter).await,
            }
        })
    }

    pub fn count<'b>(&'b self, dump: &'b QueryDump) -> BoxFuture<'b, Result<usize, Error>> {
        let (head, info) = self.frame();
        Box::pin(async move {
            match head {
                Some(m) => m.count(&info, dump).await,
                None => terminal::count(&info, dump).await,
            }
        })
    }
}

/// The end of the pipeline: hands calls to the backend or to the
/// transaction's backend handle.
mod terminal {
    use super::*;
    use crate::backend::BackendIterator;

    fn transaction<'a>(info: &MiddlewareInfo<'a>) -> Result<&'a Transaction, Error> {
        info.transaction.ok_or_else(|| {
            Error::InvalidArgument("transactional operation without a transaction".to_string())
        })
    }

    pub(super) async fn allocate_ids(info: &MiddlewareInfo<'_>, keys: &[Key]) -> Result<Vec<Key>, Error> {
        info.context.check()?;
        info.client.backend().allocate_ids(info.context, keys).await
    }

    pub(super) async fn put_multi_without_tx(
        info: &MiddlewareInfo<'_>,
        keys: &[Key],
        src: &[PropertyList],
    ) -> Result<Vec<Key>, Error> {
        info.context.check()?;
        info.client.backend().put_multi(info.context, keys, src).await
    }

    pub(super) async fn put_multi_with_tx(
        info: &MiddlewareInfo<'_>,
        keys: &[Key],
        src: &[PropertyList],
    ) -> Result<Vec<PendingKey>, Error> {
        info.context.check()?;
        let tx = transaction(info)?;
        let slots = tx.backend().put_multi(info.context, keys, src).await?;
        Ok(slots.into_iter().map(|slot| PendingKey::new(tx.id(), slot)).collect())
    }

    pub(super) async fn get_multi_without_tx(
        info: &MiddlewareInfo<'_>,
        keys: &[Key],
        dst: &mut [PropertyList],
    ) -> Result<(), Error> {
        info.context.check()?;
        info.client.backend().get_multi(info.context, keys, dst).await
    }

    pub(super) async fn get_multi_with_tx(
        info: &MiddlewareInfo<'_>,
        keys: &[Key],
        dst: &mut [PropertyList],
    ) -> Result<(), Error> {
        info.context.check()?;
        transaction(info)?
            .backend()
            .get_multi(info.context, keys, dst)
            .await
    }

    pub(super) async fn delete_multi_without_tx(info: &MiddlewareInfo<'_>, keys: &[Key]) -> Result<(), Error> {
        info.context.check()?;
        info.client.backend().delete_multi(info.context, keys).await
    }

    pub(super) async fn delete_multi_with_tx(info: &MiddlewareInfo<'_>, keys: &[Key]) -> Result<(), Error> {
        info.context.check()?;
        transaction(info)?
            .backend()
            .delete_multi(info.context, keys)
            .await
    }

    async fn open(info: &MiddlewareInfo<'_>, dump: &QueryDump) -> Result<Box<dyn BackendIterator>, Error> {
        info.context.check()?;
        match &dump.transaction {
            Some(tx) => tx.backend().run_query(info.context, dump).await,
            None => info.client.backend().run_query(info.context, dump).await,
        }
    }

    pub(super) async fn run(info: &MiddlewareInfo<'_>, dump: &QueryDump) -> Result<IteratorState, Error> {
        Ok(IteratorState::new(open(info, dump).await?))
    }

    pub(super) async fn get_all(
        info: &MiddlewareInfo<'_>,
        dump: &QueryDump,
    ) -> Result<(Vec<Key>, Vec<PropertyList>), Error> {
        let mut iter = open(info, dump).await?;
        let mut keys = Vec::new();
        let mut entities = Vec::new();
        while let Some((key, properties)) = iter.next(info.context).await? {
            keys.push(key);
            entities.push(properties);
        }
        Ok((keys, entities))
    }

    pub(super) async fn next(
        info: &MiddlewareInfo<'_>,
        iter: &mut IteratorState,
    ) -> Result<(Key, PropertyList), Error> {
        info.context.check()?;
        match iter.backend_mut().next(info.context).await? {
            Some(item) => Ok(item),
            None => Err(Error::Done),
        }
    }

    pub(super) async fn count(info: &MiddlewareInfo<'_>, dump: &QueryDump) -> Result<usize, Error> {
        info.context.check()?;
        match &dump.transaction {
            Some(tx) => tx.backend().count(info.context, dump).await,
            None => info.client.backend().count(info.context, dump).await,
        }
    }
}
