mod common;

use std::sync::{Arc, Mutex};

use common::{Data, Recorder, memory_client};
use kindstore::middleware::{CacheFilter, CacheMiddleware, FailureInjection, LocalStorage, Operation};
use kindstore::{Context, Error, TransactionState};

fn finish_hooks(log: &Mutex<Vec<String>>) -> Vec<String> {
    log.lock()
        .unwrap()
        .iter()
        .filter(|line| line.ends_with(":commit") || line.ends_with(":rollback"))
        .cloned()
        .collect()
}

#[tokio::test]
async fn transaction_cache_invalidation() {
    let (client, _) = memory_client();
    let cache = Arc::new(CacheMiddleware::new(LocalStorage::new(), CacheFilter::registered_kinds()));
    let chaos = Arc::new(FailureInjection::new());
    client.append_middleware(cache.clone()).unwrap();
    client.append_middleware(chaos.clone()).unwrap();

    let ctx = Context::background();
    let key = client.id_key("Data", 1, None);
    client.put(&ctx, &key, &Data::new("old", 1)).await.unwrap();

    let mut dst = Data::default();
    client.get(&ctx, &key, &mut dst).await.unwrap();
    assert!(cache.storage().contains(&key));
    assert_eq!(chaos.calls(Operation::GetMultiWithoutTx), 1);

    let tx = client.new_transaction(&ctx).await.unwrap();
    tx.put(&key, &Data::new("new", 2)).await.unwrap();
    // Nothing is invalidated before the commit.
    client.get(&ctx, &key, &mut dst).await.unwrap();
    assert_eq!(dst, Data::new("old", 1));
    assert_eq!(chaos.calls(Operation::GetMultiWithoutTx), 1);

    tx.commit().await.unwrap();
    assert!(!cache.storage().contains(&key));
    client.get(&ctx, &key, &mut dst).await.unwrap();
    assert_eq!(dst, Data::new("new", 2));
    assert_eq!(chaos.calls(Operation::GetMultiWithoutTx), 2);
}

#[tokio::test]
async fn rollback_keeps_the_cache() {
    let (client, _) = memory_client();
    let cache = Arc::new(CacheMiddleware::new(LocalStorage::new(), CacheFilter::all()));
    client.append_middleware(cache.clone()).unwrap();

    let ctx = Context::background();
    let key = client.id_key("Data", 1, None);
    client.put(&ctx, &key, &Data::new("a", 1)).await.unwrap();
    let mut dst = Data::default();
    client.get(&ctx, &key, &mut dst).await.unwrap();

    let tx = client.new_transaction(&ctx).await.unwrap();
    tx.delete(&key).await.unwrap();
    tx.rollback().await.unwrap();
    assert_eq!(tx.state(), TransactionState::RolledBack);
    assert!(cache.storage().contains(&key));
}

#[tokio::test]
async fn concurrent_transaction_loss() {
    let (client, _) = memory_client();
    let log = Arc::new(Mutex::new(Vec::new()));
    client
        .append_middleware(Arc::new(Recorder::new("r", log.clone())))
        .unwrap();

    let ctx = Context::background();
    let key = client.id_key("Data", 1, None);
    client.put(&ctx, &key, &Data::new("a", 0)).await.unwrap();

    let t1 = client.new_transaction(&ctx).await.unwrap();
    let t2 = client.new_transaction(&ctx).await.unwrap();
    let mut seen = Data::default();
    t1.get(&key, &mut seen).await.unwrap();
    t2.get(&key, &mut seen).await.unwrap();

    t2.put(&key, &Data::new("t2", 2)).await.unwrap();
    t2.commit().await.unwrap();

    t1.put(&key, &Data::new("t1", 1)).await.unwrap();
    let err = t1.commit().await.unwrap_err();
    assert!(err.is_concurrent_transaction());
    assert_eq!(t1.state(), TransactionState::RolledBack);
    assert_eq!(finish_hooks(&log), vec!["r:commit", "r:rollback"]);

    let mut dst = Data::default();
    client.get(&ctx, &key, &mut dst).await.unwrap();
    assert_eq!(dst, Data::new("t2", 2));
}

#[tokio::test]
async fn pending_key_misuse() {
    let (client, _) = memory_client();
    let ctx = Context::background();

    let t1 = client.new_transaction(&ctx).await.unwrap();
    let p1 = t1
        .put(&client.incomplete_key("Data", None), &Data::new("one", 1))
        .await
        .unwrap();
    let c1 = t1.commit().await.unwrap();

    let t2 = client.new_transaction(&ctx).await.unwrap();
    let p2 = t2
        .put(&client.incomplete_key("Data", None), &Data::new("two", 2))
        .await
        .unwrap();
    let c2 = t2.commit().await.unwrap();

    let k1 = c1.key(&p1);
    assert!(!k1.is_incomplete());
    assert!(matches!(c1.try_key(&p2), Err(Error::PendingKeyMismatch)));
    assert_ne!(c2.key(&p2), k1);

    let mut dst = Data::default();
    client.get(&ctx, &k1, &mut dst).await.unwrap();
    assert_eq!(dst, Data::new("one", 1));
}

#[tokio::test]
#[should_panic(expected = "does not belong")]
async fn resolving_a_foreign_pending_key_panics() {
    let (client, _) = memory_client();
    let ctx = Context::background();
    let t1 = client.new_transaction(&ctx).await.unwrap();
    let c1 = t1.commit().await.unwrap();
    let t2 = client.new_transaction(&ctx).await.unwrap();
    let p2 = t2
        .put(&client.incomplete_key("Data", None), &Data::new("two", 2))
        .await
        .unwrap();
    c1.key(&p2);
}

#[tokio::test]
async fn finished_transactions_reject_operations() {
    let (client, _) = memory_client();
    let ctx = Context::background();
    let key = client.id_key("Data", 1, None);

    let tx = client.new_transaction(&ctx).await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(tx.state(), TransactionState::Committed);
    assert!(matches!(
        tx.put(&key, &Data::default()).await,
        Err(Error::TransactionFinished)
    ));
    assert!(matches!(tx.commit().await, Err(Error::TransactionFinished)));
    assert!(matches!(tx.rollback().await, Err(Error::TransactionFinished)));
}

#[tokio::test]
async fn run_in_transaction_commits_or_rolls_back() {
    let (client, _) = memory_client();
    let log = Arc::new(Mutex::new(Vec::new()));
    client
        .append_middleware(Arc::new(Recorder::new("r", log.clone())))
        .unwrap();
    let ctx = Context::background();

    let key = client.incomplete_key("Data", None);
    let (pending, commit) = client
        .run_in_transaction(&ctx, |tx| async move { tx.put(&key, &Data::new("a", 1)).await })
        .await
        .unwrap();
    let stored = commit.key(&pending);
    let mut dst = Data::default();
    client.get(&ctx, &stored, &mut dst).await.unwrap();
    assert_eq!(dst, Data::new("a", 1));

    let result = client
        .run_in_transaction(&ctx, |tx| async move {
            tx.delete(&stored).await?;
            Err::<(), _>(Error::InvalidArgument("changed my mind".to_string()))
        })
        .await;
    assert!(matches!(result, Err(Error::InvalidArgument(_))));
    assert_eq!(finish_hooks(&log), vec!["r:commit", "r:rollback"]);
}

#[tokio::test]
async fn transactional_queries_need_an_ancestor() {
    let (client, _) = memory_client();
    let ctx = Context::background();
    let parent = client.name_key("Group", &uuid::Uuid::new_v4().to_string(), None);
    let child = client.id_key("Data", 1, Some(&parent));
    client.put(&ctx, &child, &Data::new("c", 1)).await.unwrap();

    let tx = client.new_transaction(&ctx).await.unwrap();
    let unscoped = client.query_of::<Data>().transaction(&tx);
    assert!(matches!(
        client.count(&ctx, &unscoped).await,
        Err(Error::InvalidQuery(_))
    ));

    let scoped = client.query_of::<Data>().ancestor(&parent).transaction(&tx);
    let mut dst: Vec<Data> = Vec::new();
    let keys = client.get_all(&ctx, &scoped, &mut dst).await.unwrap();
    assert_eq!(keys, vec![child]);
    tx.rollback().await.unwrap();
}
