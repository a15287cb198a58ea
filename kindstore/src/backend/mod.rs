//! Bridges to the remote store.
//!
//! The pipeline ends in a [`Backend`]. Transactions opened on it are
//! [`BackendTransaction`]s and queries produce [`BackendIterator`]s. Multi
//! operations report per-key outcomes as `Error::Multi` of the request's
//! length, or a single error for the whole call.

pub mod eval;
mod memory;
mod tikv;

use std::collections::{HashMap, VecDeque};

use futures::future::BoxFuture;

use crate::query::Cursor;
use crate::{Context, Error, Key, PropertyList, QueryDump};

pub use memory::MemoryBackend;
pub use tikv::TikvBackend;

pub trait Backend: Send + Sync {
    fn get_multi<'a>(
        &'a self,
        ctx: &'a Context,
        keys: &'a [Key],
        dst: &'a mut [PropertyList],
    ) -> BoxFuture<'a, Result<(), Error>>;

    /// Stores the entities and returns their keys, completing incomplete
    /// ones.
    fn put_multi<'a>(
        &'a self,
        ctx: &'a Context,
        keys: &'a [Key],
        src: &'a [PropertyList],
    ) -> BoxFuture<'a, Result<Vec<Key>, Error>>;

    fn delete_multi<'a>(&'a self, ctx: &'a Context, keys: &'a [Key]) -> BoxFuture<'a, Result<(), Error>>;

    /// Completes incomplete keys without storing anything.
    fn allocate_ids<'a>(&'a self, ctx: &'a Context, keys: &'a [Key]) -> BoxFuture<'a, Result<Vec<Key>, Error>>;

    fn run_query<'a>(
        &'a self,
        ctx: &'a Context,
        dump: &'a QueryDump,
    ) -> BoxFuture<'a, Result<Box<dyn BackendIterator>, Error>>;

    fn count<'a>(&'a self, ctx: &'a Context, dump: &'a QueryDump) -> BoxFuture<'a, Result<usize, Error>>;

    fn new_transaction<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, Result<Box<dyn BackendTransaction>, Error>>;

    fn decode_key(&self, encoded: &str) -> Result<Key, Error> {
        Key::decode(encoded)
    }

    fn decode_cursor(&self, encoded: &str) -> Result<Cursor, Error> {
        crate::codec::decode_cursor(encoded)
    }

    fn close(&self) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async { Ok(()) })
    }
}

/// Backend side of an open transaction.
///
/// Puts return slot ids; [`BackendTransaction::commit`] maps every slot it
/// handed out to the stored key.
pub trait BackendTransaction: Send + Sync {
    fn get_multi<'a>(
        &'a self,
        ctx: &'a Context,
        keys: &'a [Key],
        dst: &'a mut [PropertyList],
    ) -> BoxFuture<'a, Result<(), Error>>;

    fn put_multi<'a>(
        &'a self,
        ctx: &'a Context,
        keys: &'a [Key],
        src: &'a [PropertyList],
    ) -> BoxFuture<'a, Result<Vec<u64>, Error>>;

    fn delete_multi<'a>(&'a self, ctx: &'a Context, keys: &'a [Key]) -> BoxFuture<'a, Result<(), Error>>;

    fn run_query<'a>(
        &'a self,
        ctx: &'a Context,
        dump: &'a QueryDump,
    ) -> BoxFuture<'a, Result<Box<dyn BackendIterator>, Error>>;

    fn count<'a>(&'a self, ctx: &'a Context, dump: &'a QueryDump) -> BoxFuture<'a, Result<usize, Error>>;

    fn commit<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, Result<HashMap<u64, Key>, Error>>;

    fn rollback<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, Result<(), Error>>;
}

pub trait BackendIterator: Send {
    fn next<'a>(&'a mut self, ctx: &'a Context) -> BoxFuture<'a, Result<Option<(Key, PropertyList)>, Error>>;

    /// Position of the next item.
    fn cursor(&self) -> Result<Cursor, Error>;
}

/// Iterator over results that were evaluated up front.
pub struct VecIterator {
    items: VecDeque<(Key, PropertyList)>,
    position: usize,
}

impl VecIterator {
    pub fn new(evaluated: eval::Evaluated) -> Self {
        Self {
            items: evaluated.items.into(),
            position: evaluated.first_position,
        }
    }
}

impl BackendIterator for VecIterator {
    fn next<'a>(&'a mut self, _ctx: &'a Context) -> BoxFuture<'a, Result<Option<(Key, PropertyList)>, Error>> {
        let item = self.items.pop_front();
        if item.is_some() {
            self.position += 1;
        }
        Box::pin(async move { Ok(item) })
    }

    fn cursor(&self) -> Result<Cursor, Error> {
        Ok(Cursor::new(self.position))
    }
}

/// Writes the per-key outcome of a lookup into `dst`: found entries are
/// stored, missing ones become `NoSuchEntity` slots.
pub(crate) fn fill_slots(
    keys: &[Key],
    dst: &mut [PropertyList],
    mut lookup: impl FnMut(&Key) -> Result<Option<PropertyList>, Error>,
) -> Result<(), Error> {
    if keys.len() != dst.len() {
        return Err(Error::InvalidArgument(format!(
            "{} keys but {} destinations",
            keys.len(),
            dst.len()
        )));
    }
    let mut errors = crate::MultiError::new(keys.len());
    for (i, key) in keys.iter().enumerate() {
        match lookup(key)? {
            Some(properties) => dst[i] = properties,
            None => errors.set(i, Error::NoSuchEntity),
        }
    }
    errors.into_result()
}
