use std::pin::Pin;

use async_stream::try_stream;
use futures::Stream;

use crate::backend::BackendIterator;
use crate::middleware::Next;
use crate::query::Cursor;
use crate::{Client, Context, Error, Key, KvEntity, PropertyList, QueryDump};

/// Pipeline-side state of a running query: the backend iterator plus the
/// marks middlewares leave on it.
pub struct IteratorState {
    backend: Box<dyn BackendIterator>,
    owners: Vec<u64>,
}

impl IteratorState {
    pub fn new(backend: Box<dyn BackendIterator>) -> Self {
        Self {
            backend,
            owners: Vec::new(),
        }
    }

    pub fn backend_mut(&mut self) -> &mut dyn BackendIterator {
        self.backend.as_mut()
    }

    /// Records that the middleware identified by `owner` rewrote this query
    /// and must post-process its items.
    pub fn mark_owned(&mut self, owner: u64) {
        if !self.owners.contains(&owner) {
            self.owners.push(owner);
        }
    }

    pub fn is_owned(&self, owner: u64) -> bool {
        self.owners.contains(&owner)
    }

    pub fn cursor(&self) -> Result<Cursor, Error> {
        self.backend.cursor()
    }
}

/// Results of [`Client::run`].
pub struct QueryIterator {
    client: Client,
    context: Context,
    dump: QueryDump,
    state: IteratorState,
}

impl QueryIterator {
    pub(crate) fn new(client: Client, context: Context, dump: QueryDump, state: IteratorState) -> Self {
        Self {
            client,
            context,
            dump,
            state,
        }
    }

    /// Advances to the next result and returns its key.
    ///
    /// Properties are loaded into `dst` unless the query is keys-only.
    /// Returns `Error::Done` once the results are exhausted.
    pub async fn next<T: KvEntity>(&mut self, dst: &mut T) -> Result<Key, Error> {
        let (key, properties) = self.next_properties().await?;
        if !self.dump.keys_only {
            dst.load(properties, &self.client.load_options())?;
        }
        Ok(key)
    }

    /// Like [`QueryIterator::next`], without conversion.
    pub async fn next_properties(&mut self) -> Result<(Key, PropertyList), Error> {
        let chain = self.client.chain();
        let next = Next::new(
            &chain,
            &self.context,
            &self.client,
            self.dump.transaction.as_ref(),
        );
        next.next(&self.dump, &mut self.state).await
    }

    /// Position after the last item returned.
    pub fn cursor(&self) -> Result<Cursor, Error> {
        self.state.cursor()
    }

    pub fn into_stream<T>(mut self) -> Pin<Box<dyn Stream<Item = Result<(Key, T), Error>> + Send>>
    where
        T: KvEntity + Default + Send + 'static,
    {
        Box::pin(try_stream! {
            loop {
                let mut dst = T::default();
                match self.next(&mut dst).await {
                    Ok(key) => yield (key, dst),
                    Err(Error::Done) => break,
                    Err(err) => Err(err)?,
                }
            }
        })
    }
}
