//! Client-side access layer for a schemaless key-value store.
//!
//! Entities are property lists grouped under kinds and addressed by
//! hierarchical [`Key`]s. Every [`Client`] operation runs through a pipeline
//! of [`middleware::Middleware`]s before it reaches the [`backend::Backend`],
//! so caching, retries, request splitting and query rewriting are added by
//! registering middlewares rather than by changing call sites.

pub mod backend;
mod batch;
mod client;
mod codec;
mod context;
mod entity;
mod error;
mod iterator;
mod key;
pub mod middleware;
mod property;
mod query;
mod transaction;
mod utils;

use std::collections::HashSet;

pub use batch::{Batch, BatchFuture, TransactionBatch};
pub use client::{Client, ClientOptions};
pub use codec::{decode_cursor, decode_key, decode_properties, encode_properties};
pub use context::{CancelHandle, Context};
pub use entity::{EntityKind, FromValue, KvEntity, LoadOptions, ToValue, load_nested, save_nested};
pub use error::{Error, MultiError};
pub use iterator::{IteratorState, QueryIterator};
pub use key::Key;
pub use kindstore_derive::KvEntity;
pub use property::{
    Blob, Entity, GeoPoint, Property, PropertyList, Value, truncate_time, validate_property_name,
};
pub use query::{Cursor, Direction, Filter, FilterOp, Order, Query, QueryDump};
pub use transaction::{Commit, PendingKey, Transaction, TransactionState};

#[doc(hidden)]
pub use inventory;

// Lets `#[derive(KvEntity)]` expand inside this crate.
extern crate self as kindstore;

/// Registration of a type deriving `KvEntity`.
pub struct EntityMeta {
    pub type_path: &'static str,
    pub kind: &'static str,
    pub property_names: fn() -> Vec<&'static str>,
}

impl std::fmt::Debug for EntityMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "EntityMeta {{ type_path: {}, kind: {}, properties: {:?} }}",
            self.type_path,
            self.kind,
            (self.property_names)()
        )
    }
}

inventory::collect!(EntityMeta);

/// Every entity type registered in the binary.
pub fn registered_entities() -> Vec<&'static EntityMeta> {
    inventory::iter::<EntityMeta>().collect()
}

/// Kinds of the registered entity types.
pub fn registered_kinds() -> HashSet<&'static str> {
    inventory::iter::<EntityMeta>()
        .map(|meta| meta.kind)
        .collect()
}
