use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use crate::backend::{Backend, TikvBackend};
use crate::batch::Batch;
use crate::entity::{EntityKind, LoadOptions, save_all};
use crate::error::slot_errors;
use crate::iterator::QueryIterator;
use crate::middleware::{Middleware, Next};
use crate::query::{Cursor, Query};
use crate::{Context, Error, Key, KvEntity, PropertyList, Transaction};

/// Settings of a [`Client`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientOptions {
    pub project_id: String,
    /// Namespace of keys and queries built through the client.
    pub namespace: String,
    /// Load entities even when stored properties have no matching field.
    pub suppress_field_mismatch: bool,
}

impl ClientOptions {
    /// Reads `KINDSTORE_PROJECT_ID`, `KINDSTORE_NAMESPACE` and
    /// `KINDSTORE_SUPPRESS_FIELD_MISMATCH`.
    pub fn from_env() -> Result<Self, Error> {
        let suppress_field_mismatch = match std::env::var("KINDSTORE_SUPPRESS_FIELD_MISMATCH") {
            Ok(value) => parse_flag(&value)?,
            Err(_) => false,
        };
        Ok(Self {
            project_id: std::env::var("KINDSTORE_PROJECT_ID").unwrap_or_default(),
            namespace: std::env::var("KINDSTORE_NAMESPACE").unwrap_or_default(),
            suppress_field_mismatch,
        })
    }
}

fn parse_flag(value: &str) -> Result<bool, Error> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "0" | "false" | "no" | "off" => Ok(false),
        "1" | "true" | "yes" | "on" => Ok(true),
        other => Err(Error::InvalidArgument(format!("invalid flag value {:?}", other))),
    }
}

fn check_lengths(keys: usize, values: usize) -> Result<(), Error> {
    if keys != values {
        return Err(Error::InvalidArgument(format!(
            "{} keys but {} values",
            keys, values
        )));
    }
    Ok(())
}

fn validate_complete(keys: &[Key]) -> Result<(), Error> {
    keys.iter().try_for_each(Key::validate_complete)
}

struct ClientInner {
    backend: Box<dyn Backend>,
    options: ClientOptions,
    middlewares: RwLock<Vec<Arc<dyn Middleware>>>,
}

/// Entry point of every operation.
///
/// Calls are lowered into pipeline hooks and threaded through the
/// registered middlewares before reaching the backend. Clones share the
/// backend and the middleware list.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn new(backend: impl Backend + 'static, options: ClientOptions) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                backend: Box::new(backend),
                options,
                middlewares: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Connects to TiKV through the given placement driver endpoints.
    pub async fn connect(pd_endpoints: Vec<String>) -> Result<Self, Error> {
        let backend = TikvBackend::connect(pd_endpoints).await?;
        Ok(Self::new(backend, ClientOptions::from_env()?))
    }

    /// Connects to the comma separated endpoints in
    /// `KINDSTORE_PD_ENDPOINTS`.
    pub async fn connect_from_env() -> Result<Self, Error> {
        let endpoints = std::env::var("KINDSTORE_PD_ENDPOINTS")
            .map_err(|_| Error::InvalidArgument("KINDSTORE_PD_ENDPOINTS is not set".to_string()))?;
        let endpoints: Vec<String> = endpoints
            .split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(String::from)
            .collect();
        if endpoints.is_empty() {
            return Err(Error::InvalidArgument(
                "KINDSTORE_PD_ENDPOINTS has no endpoints".to_string(),
            ));
        }
        Self::connect(endpoints).await
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    pub fn backend(&self) -> &dyn Backend {
        self.inner.backend.as_ref()
    }

    pub(crate) fn load_options(&self) -> LoadOptions {
        LoadOptions {
            suppress_field_mismatch: self.inner.options.suppress_field_mismatch,
        }
    }

    pub(crate) fn chain(&self) -> Vec<Arc<dyn Middleware>> {
        self.inner
            .middlewares
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Appends a middleware at the tail of the pipeline. Registering the
    /// same instance twice is rejected.
    pub fn append_middleware(&self, middleware: Arc<dyn Middleware>) -> Result<(), Error> {
        let mut middlewares = self
            .inner
            .middlewares
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if middlewares
            .iter()
            .any(|m| std::ptr::addr_eq(Arc::as_ptr(m), Arc::as_ptr(&middleware)))
        {
            return Err(Error::InvalidArgument(
                "middleware is already registered".to_string(),
            ));
        }
        middlewares.push(middleware);
        Ok(())
    }

    /// Removes a middleware by identity. Returns whether it was registered.
    pub fn remove_middleware(&self, middleware: &Arc<dyn Middleware>) -> bool {
        let mut middlewares = self
            .inner
            .middlewares
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = middlewares.len();
        middlewares.retain(|m| !std::ptr::addr_eq(Arc::as_ptr(m), Arc::as_ptr(middleware)));
        middlewares.len() != before
    }

    /// Registered middlewares, head first.
    pub fn middlewares(&self) -> Vec<Arc<dyn Middleware>> {
        self.chain()
    }

    pub fn incomplete_key(&self, kind: &str, parent: Option<&Key>) -> Key {
        self.scoped(Key::incomplete(kind, parent), parent)
    }

    pub fn id_key(&self, kind: &str, id: i64, parent: Option<&Key>) -> Key {
        self.scoped(Key::with_id(kind, id, parent), parent)
    }

    pub fn name_key(&self, kind: &str, name: &str, parent: Option<&Key>) -> Key {
        self.scoped(Key::with_name(kind, name, parent), parent)
    }

    /// Keys with a parent stay in the parent's namespace; root keys take the
    /// client's.
    fn scoped(&self, key: Key, parent: Option<&Key>) -> Key {
        match parent {
            Some(_) => key,
            None => key.in_namespace(self.inner.options.namespace.clone()),
        }
    }

    pub fn new_query(&self, kind: &str) -> Query {
        Query::new(kind).namespace(self.inner.options.namespace.clone())
    }

    /// Query over the kind of `T`.
    pub fn query_of<T: EntityKind>(&self) -> Query {
        self.new_query(T::kind())
    }

    pub fn decode_key(&self, encoded: &str) -> Result<Key, Error> {
        self.backend().decode_key(encoded)
    }

    pub fn decode_cursor(&self, encoded: &str) -> Result<Cursor, Error> {
        self.backend().decode_cursor(encoded)
    }

    pub fn batch(&self) -> Batch {
        Batch::new(self.clone())
    }

    pub async fn close(&self) -> Result<(), Error> {
        self.backend().close().await
    }

    pub async fn allocate_ids(&self, ctx: &Context, keys: &[Key]) -> Result<Vec<Key>, Error> {
        for key in keys {
            key.validate()?;
        }
        let chain = self.chain();
        Next::new(&chain, ctx, self, None).allocate_ids(keys).await
    }

    pub async fn get<T: KvEntity>(&self, ctx: &Context, key: &Key, dst: &mut T) -> Result<(), Error> {
        self.get_multi(ctx, std::slice::from_ref(key), std::slice::from_mut(dst))
            .await
            .map_err(Error::single)
    }

    /// Loads the entities of `keys` into `dst`, slot by slot.
    ///
    /// Per-key failures (missing entities, load errors) are reported as
    /// `Error::Multi`; the other slots are loaded regardless.
    pub async fn get_multi<T: KvEntity>(&self, ctx: &Context, keys: &[Key], dst: &mut [T]) -> Result<(), Error> {
        self.dispatch_get(ctx, None, keys, dst).await
    }

    pub(crate) async fn dispatch_get<T: KvEntity>(
        &self,
        ctx: &Context,
        tx: Option<&Transaction>,
        keys: &[Key],
        dst: &mut [T],
    ) -> Result<(), Error> {
        check_lengths(keys.len(), dst.len())?;
        validate_complete(keys)?;
        let mut raw = vec![PropertyList::new(); keys.len()];
        let chain = self.chain();
        let next = Next::new(&chain, ctx, self, tx);
        let result = match tx {
            Some(_) => next.get_multi_with_tx(keys, &mut raw).await,
            None => next.get_multi_without_tx(keys, &mut raw).await,
        };
        let mut errors = slot_errors(result, keys.len())?;
        let options = self.load_options();
        for (i, properties) in raw.into_iter().enumerate() {
            if errors.get(i).is_some() {
                continue;
            }
            if let Err(err) = dst[i].load(properties, &options) {
                errors.set(i, err);
            }
        }
        errors.into_result()
    }

    pub(crate) fn prepare_put<T: KvEntity>(&self, keys: &[Key], src: &[T]) -> Result<Vec<PropertyList>, Error> {
        check_lengths(keys.len(), src.len())?;
        for key in keys {
            key.validate()?;
        }
        save_all(src)
    }

    pub async fn put<T: KvEntity>(&self, ctx: &Context, key: &Key, src: &T) -> Result<Key, Error> {
        let mut keys = self
            .put_multi(ctx, std::slice::from_ref(key), std::slice::from_ref(src))
            .await
            .map_err(Error::single)?;
        keys.pop()
            .ok_or_else(|| Error::InvalidArgument("put returned no key".to_string()))
    }

    /// Stores the entities and returns their keys, with incomplete keys
    /// completed.
    pub async fn put_multi<T: KvEntity>(&self, ctx: &Context, keys: &[Key], src: &[T]) -> Result<Vec<Key>, Error> {
        let src = self.prepare_put(keys, src)?;
        let chain = self.chain();
        Next::new(&chain, ctx, self, None)
            .put_multi_without_tx(keys, &src)
            .await
    }

    pub async fn delete(&self, ctx: &Context, key: &Key) -> Result<(), Error> {
        self.delete_multi(ctx, std::slice::from_ref(key))
            .await
            .map_err(Error::single)
    }

    pub async fn delete_multi(&self, ctx: &Context, keys: &[Key]) -> Result<(), Error> {
        self.dispatch_delete(ctx, None, keys).await
    }

    pub(crate) async fn dispatch_delete(&self, ctx: &Context, tx: Option<&Transaction>, keys: &[Key]) -> Result<(), Error> {
        validate_complete(keys)?;
        let chain = self.chain();
        let next = Next::new(&chain, ctx, self, tx);
        match tx {
            Some(_) => next.delete_multi_with_tx(keys).await,
            None => next.delete_multi_without_tx(keys).await,
        }
    }

    /// Starts the query. The iterator keeps `ctx` for its `next` calls.
    pub async fn run(&self, ctx: &Context, query: &Query) -> Result<QueryIterator, Error> {
        let dump = query.checked_dump()?;
        let chain = self.chain();
        let state = Next::new(&chain, ctx, self, dump.transaction.as_ref())
            .run(&dump)
            .await?;
        Ok(QueryIterator::new(self.clone(), ctx.clone(), dump, state))
    }

    /// Runs the query to completion, loading results into `dst` and
    /// returning their keys. `dst` is left untouched by keys-only queries.
    pub async fn get_all<T: KvEntity + Default>(
        &self,
        ctx: &Context,
        query: &Query,
        dst: &mut Vec<T>,
    ) -> Result<Vec<Key>, Error> {
        let dump = query.checked_dump()?;
        let chain = self.chain();
        let (keys, entities) = Next::new(&chain, ctx, self, dump.transaction.as_ref())
            .get_all(&dump)
            .await?;
        if dump.keys_only {
            return Ok(keys);
        }
        let options = self.load_options();
        for properties in entities {
            let mut value = T::default();
            value.load(properties, &options)?;
            dst.push(value);
        }
        Ok(keys)
    }

    pub async fn count(&self, ctx: &Context, query: &Query) -> Result<usize, Error> {
        let dump = query.checked_dump()?;
        let chain = self.chain();
        Next::new(&chain, ctx, self, dump.transaction.as_ref())
            .count(&dump)
            .await
    }

    /// Opens a transaction. Its operations run under `ctx`.
    pub async fn new_transaction(&self, ctx: &Context) -> Result<Transaction, Error> {
        ctx.check()?;
        let backend = self.backend().new_transaction(ctx).await?;
        let tx = Transaction::new(self.clone(), ctx.clone(), backend);
        log::debug!("transaction {} opened", tx.id());
        Ok(tx)
    }

    /// Runs `f` in a new transaction, committing when it returns `Ok` and
    /// rolling back when it returns `Err`.
    pub async fn run_in_transaction<F, Fut, R>(&self, ctx: &Context, f: F) -> Result<(R, crate::Commit), Error>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = Result<R, Error>>,
    {
        let tx = self.new_transaction(ctx).await?;
        match f(tx.clone()).await {
            Ok(value) => {
                let commit = tx.commit().await?;
                Ok((value, commit))
            }
            Err(err) => {
                if tx.is_open() {
                    if let Err(rollback_err) = tx.rollback().await {
                        log::warn!("rollback of transaction {} failed: {}", tx.id(), rollback_err);
                    }
                }
                Err(err)
            }
        }
    }
}
