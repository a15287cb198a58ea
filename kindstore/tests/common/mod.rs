#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use kindstore::backend::MemoryBackend;
use kindstore::middleware::{Middleware, MiddlewareInfo};
use kindstore::{Client, ClientOptions, Commit, Error, Key, PropertyList, Transaction};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn memory_client() -> (Client, MemoryBackend) {
    init_logger();
    let backend = MemoryBackend::new();
    let client = Client::new(backend.clone(), ClientOptions::default());
    (client, backend)
}

#[derive(kindstore::KvEntity, Clone, Debug, Default, PartialEq)]
#[kv(kind = "Data")]
pub struct Data {
    pub name: String,
    pub value: i64,
}

impl Data {
    pub fn new(name: &str, value: i64) -> Self {
        Self {
            name: name.to_string(),
            value,
        }
    }
}

/// Writes `label:op` lines around the hooks it implements.
pub struct Recorder {
    label: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn new(label: &'static str, log: Arc<Mutex<Vec<String>>>) -> Self {
        Self { label, log }
    }

    fn push(&self, line: String) {
        self.log.lock().unwrap().push(line);
    }
}

impl Middleware for Recorder {
    fn put_multi_without_tx<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        keys: &'a [Key],
        src: &'a [PropertyList],
    ) -> BoxFuture<'a, Result<Vec<Key>, Error>> {
        Box::pin(async move {
            self.push(format!("{}:put:enter", self.label));
            let result = info.next.put_multi_without_tx(keys, src).await;
            self.push(format!("{}:put:leave", self.label));
            result
        })
    }

    fn get_multi_without_tx<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        keys: &'a [Key],
        dst: &'a mut [PropertyList],
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            self.push(format!("{}:get:{}", self.label, keys.len()));
            info.next.get_multi_without_tx(keys, dst).await
        })
    }

    fn post_commit<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        tx: &'a Transaction,
        commit: &'a Commit,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            self.push(format!("{}:commit", self.label));
            info.next.post_commit(tx, commit).await
        })
    }

    fn post_rollback<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        tx: &'a Transaction,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            self.push(format!("{}:rollback", self.label));
            info.next.post_rollback(tx).await
        })
    }
}
