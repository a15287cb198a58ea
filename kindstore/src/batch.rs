//! Deferred requests applied together.
//!
//! A batch collects puts, gets and deletes and hands back a [`BatchFuture`]
//! for each. `exec` issues at most one multi call per request kind (puts,
//! then gets, then deletes) and resolves every future before it returns. A
//! batch dropped without `exec` resolves its futures to
//! `Error::BatchCanceled`.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use futures::channel::oneshot;

use crate::entity::LoadOptions;
use crate::{Client, Context, Error, Key, KvEntity, MultiError, PendingKey, PropertyList, Transaction};

/// Result of one batched request.
#[must_use = "a batch future resolves only after the batch is executed"]
pub struct BatchFuture<T> {
    rx: oneshot::Receiver<Result<T, Error>>,
}

impl<T> Future for BatchFuture<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.get_mut().rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(Error::BatchCanceled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn channel<T>() -> (oneshot::Sender<Result<T, Error>>, BatchFuture<T>) {
    let (tx, rx) = oneshot::channel();
    (tx, BatchFuture { rx })
}

fn reply<T>(sender: oneshot::Sender<Result<T, Error>>, result: Result<T, Error>) {
    // The caller may have dropped the future; nobody is left to tell.
    let _ = sender.send(result);
}

struct PutRequest<K> {
    key: Key,
    properties: Result<PropertyList, Error>,
    reply: oneshot::Sender<Result<K, Error>>,
}

type GetReply = Box<dyn FnOnce(Result<PropertyList, Error>) + Send>;

struct GetRequest {
    key: Key,
    reply: GetReply,
}

struct DeleteRequest {
    key: Key,
    reply: oneshot::Sender<Result<(), Error>>,
}

struct Requests<K> {
    puts: Vec<PutRequest<K>>,
    gets: Vec<GetRequest>,
    deletes: Vec<DeleteRequest>,
}

impl<K> Default for Requests<K> {
    fn default() -> Self {
        Self {
            puts: Vec::new(),
            gets: Vec::new(),
            deletes: Vec::new(),
        }
    }
}

impl<K> Requests<K> {
    fn put<T: KvEntity>(&mut self, key: &Key, src: &T) -> BatchFuture<K> {
        let (reply, future) = channel();
        self.puts.push(PutRequest {
            key: key.clone(),
            properties: src.save(),
            reply,
        });
        future
    }

    fn get<T>(&mut self, key: &Key, options: LoadOptions) -> BatchFuture<T>
    where
        T: KvEntity + Default + Send + 'static,
    {
        let (sender, future) = channel();
        self.gets.push(GetRequest {
            key: key.clone(),
            reply: Box::new(move |result: Result<PropertyList, Error>| {
                let result = result.and_then(|properties| {
                    let mut dst = T::default();
                    dst.load(properties, &options)?;
                    Ok(dst)
                });
                reply(sender, result);
            }),
        });
        future
    }

    fn delete(&mut self, key: &Key) -> BatchFuture<()> {
        let (reply, future) = channel();
        self.deletes.push(DeleteRequest {
            key: key.clone(),
            reply,
        });
        future
    }

    fn len(&self) -> usize {
        self.puts.len() + self.gets.len() + self.deletes.len()
    }
}

/// Remembers the first failure of an `exec`.
#[derive(Default)]
struct FirstError(Option<Error>);

impl FirstError {
    fn record(&mut self, err: &Error) {
        if self.0.is_none() {
            self.0 = Some(err.clone());
        }
    }

    fn into_result(self) -> Result<(), Error> {
        match self.0 {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Splits the put requests into what goes to the pipeline. Requests whose
/// entity failed to save are answered right away.
fn prepare_puts<K>(
    puts: Vec<PutRequest<K>>,
    first: &mut FirstError,
) -> (Vec<Key>, Vec<PropertyList>, Vec<oneshot::Sender<Result<K, Error>>>) {
    let mut keys = Vec::with_capacity(puts.len());
    let mut lists = Vec::with_capacity(puts.len());
    let mut replies = Vec::with_capacity(puts.len());
    for put in puts {
        match put.properties {
            Ok(properties) => {
                keys.push(put.key);
                lists.push(properties);
                replies.push(put.reply);
            }
            Err(err) => {
                first.record(&err);
                reply(put.reply, Err(err));
            }
        }
    }
    (keys, lists, replies)
}

/// Answers every request of one multi call. On a multi error, slots without
/// an error are answered by `partial`.
fn settle<K>(
    replies: Vec<oneshot::Sender<Result<K, Error>>>,
    keys: &[Key],
    result: Result<Vec<K>, Error>,
    partial: impl Fn(&Key, &MultiError) -> Result<K, Error>,
    first: &mut FirstError,
) {
    match result {
        Ok(values) if values.len() == replies.len() => {
            for (sender, value) in replies.into_iter().zip(values) {
                reply(sender, Ok(value));
            }
        }
        Ok(values) => {
            let err = Error::InvalidArgument(format!(
                "{} results for {} requests",
                values.len(),
                replies.len()
            ));
            first.record(&err);
            for sender in replies {
                reply(sender, Err(err.clone()));
            }
        }
        Err(Error::Multi(m)) if m.len() == replies.len() => {
            for (i, sender) in replies.into_iter().enumerate() {
                match m.get(i) {
                    Some(err) => reply(sender, Err(err.clone())),
                    None => reply(sender, partial(&keys[i], &m)),
                }
            }
            first.record(&Error::Multi(m));
        }
        Err(err) => {
            first.record(&err);
            for sender in replies {
                reply(sender, Err(err.clone()));
            }
        }
    }
}

async fn exec_gets(client: &Client, ctx: &Context, tx: Option<&Transaction>, gets: Vec<GetRequest>, first: &mut FirstError) {
    if gets.is_empty() {
        return;
    }
    let keys: Vec<Key> = gets.iter().map(|g| g.key.clone()).collect();
    let mut dst = vec![PropertyList::new(); keys.len()];
    let result = match tx {
        Some(tx) => tx.get_multi(&keys, &mut dst).await,
        None => client.get_multi(ctx, &keys, &mut dst).await,
    };
    let errors = match result {
        Ok(()) => MultiError::new(keys.len()),
        Err(Error::Multi(m)) if m.len() == keys.len() => {
            first.record(&Error::Multi(m.clone()));
            m
        }
        Err(err) => {
            first.record(&err);
            for get in gets {
                (get.reply)(Err(err.clone()));
            }
            return;
        }
    };
    for (i, (get, properties)) in gets.into_iter().zip(dst).enumerate() {
        match errors.get(i) {
            Some(err) => (get.reply)(Err(err.clone())),
            None => (get.reply)(Ok(properties)),
        }
    }
}

fn delete_parts(deletes: Vec<DeleteRequest>) -> (Vec<Key>, Vec<oneshot::Sender<Result<(), Error>>>) {
    deletes.into_iter().map(|d| (d.key, d.reply)).unzip()
}

/// Batch of non-transactional requests, created by [`Client::batch`].
pub struct Batch {
    client: Client,
    requests: Requests<Key>,
}

impl Batch {
    pub(crate) fn new(client: Client) -> Self {
        Self {
            client,
            requests: Requests::default(),
        }
    }

    /// Queues a put; the future yields the stored key.
    pub fn put<T: KvEntity>(&mut self, key: &Key, src: &T) -> BatchFuture<Key> {
        self.requests.put(key, src)
    }

    pub fn get<T>(&mut self, key: &Key) -> BatchFuture<T>
    where
        T: KvEntity + Default + Send + 'static,
    {
        let options = self.client.load_options();
        self.requests.get(key, options)
    }

    pub fn delete(&mut self, key: &Key) -> BatchFuture<()> {
        self.requests.delete(key)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs the queued requests and returns the first error encountered.
    ///
    /// A put that partially failed answers its successful slots with the
    /// key that was requested.
    pub async fn exec(self, ctx: &Context) -> Result<(), Error> {
        let Batch { client, requests } = self;
        let mut first = FirstError::default();

        let (keys, lists, replies) = prepare_puts(requests.puts, &mut first);
        if !keys.is_empty() {
            let result = client.put_multi(ctx, &keys, &lists).await;
            settle(replies, &keys, result, |key, _| Ok(key.clone()), &mut first);
        }

        exec_gets(&client, ctx, None, requests.gets, &mut first).await;

        let (keys, replies) = delete_parts(requests.deletes);
        if !keys.is_empty() {
            let result = client.delete_multi(ctx, &keys).await;
            let result = result.map(|()| vec![(); keys.len()]);
            settle(replies, &keys, result, |_, _| Ok(()), &mut first);
        }

        first.into_result()
    }
}

/// Batch of requests inside a transaction, created by
/// [`Transaction::batch`]. Puts yield pending keys.
pub struct TransactionBatch {
    transaction: Transaction,
    requests: Requests<PendingKey>,
}

impl TransactionBatch {
    pub(crate) fn new(transaction: Transaction) -> Self {
        Self {
            transaction,
            requests: Requests::default(),
        }
    }

    pub fn put<T: KvEntity>(&mut self, key: &Key, src: &T) -> BatchFuture<PendingKey> {
        self.requests.put(key, src)
    }

    pub fn get<T>(&mut self, key: &Key) -> BatchFuture<T>
    where
        T: KvEntity + Default + Send + 'static,
    {
        let options = self.transaction.client().load_options();
        self.requests.get(key, options)
    }

    pub fn delete(&mut self, key: &Key) -> BatchFuture<()> {
        self.requests.delete(key)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs the queued requests in the transaction and returns the first
    /// error encountered. Slots of a partially failed put have no pending
    /// key and resolve to the whole multi error.
    pub async fn exec(self) -> Result<(), Error> {
        let TransactionBatch {
            transaction,
            requests,
        } = self;
        let mut first = FirstError::default();

        let (keys, lists, replies) = prepare_puts(requests.puts, &mut first);
        if !keys.is_empty() {
            let result = transaction.put_multi(&keys, &lists).await;
            settle(
                replies,
                &keys,
                result,
                |_, m| Err(Error::Multi(m.clone())),
                &mut first,
            );
        }

        let ctx = transaction.context().clone();
        exec_gets(transaction.client(), &ctx, Some(&transaction), requests.gets, &mut first).await;

        let (keys, replies) = delete_parts(requests.deletes);
        if !keys.is_empty() {
            let result = transaction.delete_multi(&keys).await;
            let result = result.map(|()| vec![(); keys.len()]);
            settle(replies, &keys, result, |_, _| Ok(()), &mut first);
        }

        first.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dropped_batch_cancels_its_futures() {
        let mut requests: Requests<Key> = Requests::default();
        let put = requests.put(&Key::with_id("Data", 1, None), &PropertyList::new());
        let delete = requests.delete(&Key::with_id("Data", 1, None));
        drop(requests);
        assert!(matches!(put.await, Err(Error::BatchCanceled)));
        assert!(matches!(delete.await, Err(Error::BatchCanceled)));
    }

    #[tokio::test]
    async fn settle_answers_partial_failures_per_slot() {
        let keys = vec![Key::with_id("Data", 1, None), Key::with_id("Data", 2, None)];
        let (s1, f1) = channel::<Key>();
        let (s2, f2) = channel::<Key>();
        let mut m = MultiError::new(2);
        m.set(1, Error::NoSuchEntity);
        let mut first = FirstError::default();
        settle(vec![s1, s2], &keys, Err(Error::Multi(m)), |k, _| Ok(k.clone()), &mut first);
        assert_eq!(f1.await.unwrap(), keys[0]);
        assert!(matches!(f2.await, Err(Error::NoSuchEntity)));
        assert!(matches!(first.into_result(), Err(Error::Multi(_))));
    }
}
