use std::sync::Arc;

use kindstore::middleware::{CacheFilter, CacheMiddleware, Fishbone, LocalStorage, Logging, Retry, Split};
use kindstore::{Client, Context, EntityKind, Error, KvEntity};

#[derive(KvEntity, Clone, Debug, Default)]
#[kv(kind = "UserInfo")]
pub struct UserInfo {
    pub name: String,
    pub age: i32,
    #[kv(noindex)]
    pub email: String,
}

#[derive(KvEntity, Clone, Debug, Default)]
pub struct UserExtend {
    pub extend: String,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();

    let client = Client::connect_from_env().await?;
    client.append_middleware(Arc::new(Logging::default()))?;
    client.append_middleware(Arc::new(Fishbone::new()))?;
    client.append_middleware(Arc::new(Retry::default()))?;
    client.append_middleware(Arc::new(Split::default()))?;
    client.append_middleware(Arc::new(CacheMiddleware::new(
        LocalStorage::new(),
        CacheFilter::registered_kinds(),
    )))?;

    let ctx = Context::background();
    let alice = client.name_key(UserInfo::kind(), "alice", None);
    client
        .put(
            &ctx,
            &alice,
            &UserInfo {
                name: "Alice".to_string(),
                age: 25,
                email: "alice@example.com".to_string(),
            },
        )
        .await?;

    let extend = client.incomplete_key(UserExtend::kind(), Some(&alice));
    let (pending, commit) = client
        .run_in_transaction(&ctx, |tx| async move {
            tx.put(
                &extend,
                &UserExtend {
                    extend: "extend".to_string(),
                },
            )
            .await
        })
        .await?;
    println!("stored extension at {}", commit.key(&pending));

    let mut a = UserInfo::default();
    client.get(&ctx, &alice, &mut a).await?;
    println!("{:?}", a);

    let query = client.query_of::<UserInfo>().filter_expr("age >=", 18).order("name");
    let mut adults: Vec<UserInfo> = Vec::new();
    let keys = client.get_all(&ctx, &query, &mut adults).await?;
    for (key, user) in keys.iter().zip(&adults) {
        println!("{} => {:?}", key, user);
    }

    let count = client.count(&ctx, &client.new_query(UserExtend::kind()).ancestor(&alice)).await?;
    println!("alice has {} extensions", count);

    client.delete(&ctx, &alice).await?;
    client.close().await
}
