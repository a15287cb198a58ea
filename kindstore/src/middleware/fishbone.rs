use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::BoxFuture;

use super::{Middleware, MiddlewareInfo};
use crate::iterator::IteratorState;
use crate::{Error, Key, PropertyList, QueryDump};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Runs queries keys-only and loads the entities by key afterwards, so
/// lookups can be served by the middlewares below (a cache, typically).
///
/// Projection and distinct queries are left alone.
#[derive(Debug)]
pub struct Fishbone {
    id: u64,
}

impl Default for Fishbone {
    fn default() -> Self {
        Self::new()
    }
}

impl Fishbone {
    pub fn new() -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Keys-only copy of `dump`, or `None` when the query is not rewritten.
    fn rewrite(dump: &QueryDump) -> Option<QueryDump> {
        if dump.keys_only || !dump.projection.is_empty() || !dump.distinct_on.is_empty() {
            return None;
        }
        let mut rewritten = dump.clone();
        rewritten.keys_only = true;
        Some(rewritten)
    }
}

async fn refetch(info: &MiddlewareInfo<'_>, dump: &QueryDump, keys: &[Key]) -> Result<Vec<PropertyList>, Error> {
    let mut dst = vec![PropertyList::new(); keys.len()];
    match (&dump.transaction, info.transaction) {
        (Some(tx), _) => tx.get_multi(keys, &mut dst).await?,
        (None, Some(_)) => {
            return Err(Error::InvalidQuery(
                "transactional query without a bound transaction".to_string(),
            ));
        }
        (None, None) => info.client.get_multi(info.context, keys, &mut dst).await?,
    }
    Ok(dst)
}

impl Middleware for Fishbone {
    fn run<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        dump: &'a QueryDump,
    ) -> BoxFuture<'a, Result<IteratorState, Error>> {
        let Some(rewritten) = Self::rewrite(dump) else {
            return info.next.run(dump);
        };
        Box::pin(async move {
            let mut iter = info.next.run(&rewritten).await?;
            iter.mark_owned(self.id);
            Ok(iter)
        })
    }

    fn next<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        dump: &'a QueryDump,
        iter: &'a mut IteratorState,
    ) -> BoxFuture<'a, Result<(Key, PropertyList), Error>> {
        Box::pin(async move {
            let owned = iter.is_owned(self.id);
            let (key, properties) = info.next.next(dump, &mut *iter).await?;
            if !owned {
                return Ok((key, properties));
            }
            let mut fetched = refetch(info, dump, std::slice::from_ref(&key))
                .await
                .map_err(Error::single)?;
            Ok((key, fetched.pop().unwrap_or_default()))
        })
    }

    fn get_all<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        dump: &'a QueryDump,
    ) -> BoxFuture<'a, Result<(Vec<Key>, Vec<PropertyList>), Error>> {
        let Some(rewritten) = Self::rewrite(dump) else {
            return info.next.get_all(dump);
        };
        Box::pin(async move {
            let (keys, _) = info.next.get_all(&rewritten).await?;
            let entities = refetch(info, dump, &keys).await?;
            Ok((keys, entities))
        })
    }
}
