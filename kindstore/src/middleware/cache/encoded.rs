use std::time::Duration;

use futures::future::BoxFuture;

use super::CacheStorage;
use crate::codec::{decode_properties, encode_properties};
use crate::{Context, Error, Key, PropertyList};

/// A remote byte cache (memcached, redis and the like).
pub trait ByteStore: Send + Sync {
    fn get_multi<'a>(
        &'a self,
        ctx: &'a Context,
        keys: &'a [String],
    ) -> BoxFuture<'a, Result<Vec<Option<Vec<u8>>>, Error>>;

    fn set_multi<'a>(
        &'a self,
        ctx: &'a Context,
        items: &'a [(String, Vec<u8>)],
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, Result<(), Error>>;

    fn delete_multi<'a>(&'a self, ctx: &'a Context, keys: &'a [String]) -> BoxFuture<'a, Result<(), Error>>;
}

/// Stores property lists in a [`ByteStore`] under `prefix` plus the encoded
/// key. Entries that fail to decode are misses.
pub struct EncodedStorage<B> {
    store: B,
    prefix: String,
    ttl: Option<Duration>,
}

impl<B: ByteStore> EncodedStorage<B> {
    pub fn new(store: B) -> Self {
        Self {
            store,
            prefix: "kindstore:".to_string(),
            ttl: None,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn store(&self) -> &B {
        &self.store
    }

    fn cache_key(&self, key: &Key) -> String {
        format!("{}{}", self.prefix, key.encode())
    }
}

impl<B: ByteStore> CacheStorage for EncodedStorage<B> {
    fn get_multi<'a>(
        &'a self,
        ctx: &'a Context,
        keys: &'a [Key],
    ) -> BoxFuture<'a, Result<Vec<Option<PropertyList>>, Error>> {
        Box::pin(async move {
            let names: Vec<String> = keys.iter().map(|k| self.cache_key(k)).collect();
            let found = self.store.get_multi(ctx, &names).await?;
            if found.len() != keys.len() {
                return Err(Error::Cache(format!(
                    "byte store returned {} entries for {} keys",
                    found.len(),
                    keys.len()
                )));
            }
            Ok(found
                .into_iter()
                .zip(&names)
                .map(|(data, name)| {
                    let data = data?;
                    match decode_properties(&data) {
                        Ok(properties) => Some(properties),
                        Err(err) => {
                            log::warn!("dropping undecodable cache entry {}: {}", name, err);
                            None
                        }
                    }
                })
                .collect())
        })
    }

    fn set_multi<'a>(
        &'a self,
        ctx: &'a Context,
        items: &'a [(Key, PropertyList)],
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let encoded: Vec<(String, Vec<u8>)> = items
                .iter()
                .map(|(key, properties)| (self.cache_key(key), encode_properties(properties)))
                .collect();
            self.store.set_multi(ctx, &encoded, self.ttl).await
        })
    }

    fn delete_multi<'a>(&'a self, ctx: &'a Context, keys: &'a [Key]) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let names: Vec<String> = keys.iter().map(|k| self.cache_key(k)).collect();
            self.store.delete_multi(ctx, &names).await
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;
    use crate::{Property, Value};

    #[derive(Default)]
    struct MapStore {
        data: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl ByteStore for MapStore {
        fn get_multi<'a>(
            &'a self,
            _ctx: &'a Context,
            keys: &'a [String],
        ) -> BoxFuture<'a, Result<Vec<Option<Vec<u8>>>, Error>> {
            let data = self.data.lock().unwrap();
            let found = keys.iter().map(|k| data.get(k).cloned()).collect();
            Box::pin(async move { Ok(found) })
        }

        fn set_multi<'a>(
            &'a self,
            _ctx: &'a Context,
            items: &'a [(String, Vec<u8>)],
            _ttl: Option<Duration>,
        ) -> BoxFuture<'a, Result<(), Error>> {
            self.data.lock().unwrap().extend(items.iter().cloned());
            Box::pin(async { Ok(()) })
        }

        fn delete_multi<'a>(&'a self, _ctx: &'a Context, keys: &'a [String]) -> BoxFuture<'a, Result<(), Error>> {
            let mut data = self.data.lock().unwrap();
            for k in keys {
                data.remove(k);
            }
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn stores_encoded_entities_under_prefix() {
        let ctx = Context::background();
        let storage = EncodedStorage::new(MapStore::default()).with_prefix("t:");
        let key = Key::with_id("Data", 7, None);
        let properties = PropertyList::from(vec![Property::new("Name", Value::String("x".into()))]);

        storage
            .set_multi(&ctx, &[(key.clone(), properties.clone())])
            .await
            .unwrap();
        let name = format!("t:{}", key.encode());
        assert!(storage.store().data.lock().unwrap().contains_key(&name));

        let found = storage.get_multi(&ctx, &[key.clone()]).await.unwrap();
        assert_eq!(found, vec![Some(properties)]);
    }

    #[tokio::test]
    async fn garbage_is_a_miss() {
        let ctx = Context::background();
        let storage = EncodedStorage::new(MapStore::default());
        let key = Key::with_id("Data", 7, None);
        storage
            .store()
            .data
            .lock()
            .unwrap()
            .insert(format!("kindstore:{}", key.encode()), vec![0xff, 0xff, 0xff]);

        let found = storage.get_multi(&ctx, &[key]).await.unwrap();
        assert_eq!(found, vec![None]);
    }
}
