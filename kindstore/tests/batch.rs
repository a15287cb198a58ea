mod common;

use std::sync::Arc;

use common::{Data, memory_client};
use kindstore::middleware::{FailureInjection, Operation};
use kindstore::{Context, Error};

#[tokio::test]
async fn batch_issues_one_call_per_request_kind() {
    let (client, backend) = memory_client();
    let chaos = Arc::new(FailureInjection::new());
    client.append_middleware(chaos.clone()).unwrap();

    let ctx = Context::background();
    let old = client.id_key("Data", 9, None);
    client.put(&ctx, &old, &Data::new("old", 9)).await.unwrap();

    let mut batch = client.batch();
    let first = batch.put(&client.id_key("Data", 1, None), &Data::new("a", 1));
    let second = batch.put(&client.incomplete_key("Data", None), &Data::new("b", 2));
    let fetched = batch.get::<Data>(&old);
    let deleted = batch.delete(&old);
    assert_eq!(batch.len(), 4);
    batch.exec(&ctx).await.unwrap();

    assert_eq!(first.await.unwrap(), client.id_key("Data", 1, None));
    assert!(!second.await.unwrap().is_incomplete());
    assert_eq!(fetched.await.unwrap(), Data::new("old", 9));
    deleted.await.unwrap();

    assert_eq!(chaos.calls(Operation::PutMultiWithoutTx), 2);
    assert_eq!(chaos.calls(Operation::GetMultiWithoutTx), 1);
    assert_eq!(chaos.calls(Operation::DeleteMultiWithoutTx), 1);
    assert!(!backend.contains(&old));
    assert_eq!(backend.len(), 2);
}

#[tokio::test]
async fn batch_reports_missing_entities_per_request() {
    let (client, _) = memory_client();
    let ctx = Context::background();
    let present = client.id_key("Data", 1, None);
    client.put(&ctx, &present, &Data::new("a", 1)).await.unwrap();

    let mut batch = client.batch();
    let found = batch.get::<Data>(&present);
    let missing = batch.get::<Data>(&client.id_key("Data", 2, None));
    assert!(batch.exec(&ctx).await.is_err());

    assert_eq!(found.await.unwrap(), Data::new("a", 1));
    assert!(missing.await.unwrap_err().is_no_such_entity());
}

#[tokio::test]
async fn empty_batch_is_a_no_op() {
    let (client, _) = memory_client();
    let chaos = Arc::new(FailureInjection::new());
    client.append_middleware(chaos.clone()).unwrap();

    let batch = client.batch();
    assert!(batch.is_empty());
    batch.exec(&Context::background()).await.unwrap();
    assert_eq!(chaos.calls(Operation::PutMultiWithoutTx), 0);
    assert_eq!(chaos.calls(Operation::GetMultiWithoutTx), 0);
}

#[tokio::test]
async fn dropped_batch_cancels_pending_requests() {
    let (client, _) = memory_client();
    let mut batch = client.batch();
    let put = batch.put(&client.id_key("Data", 1, None), &Data::new("a", 1));
    drop(batch);
    assert!(matches!(put.await, Err(Error::BatchCanceled)));
}

#[tokio::test]
async fn transaction_batch_yields_pending_keys() {
    let (client, _) = memory_client();
    let ctx = Context::background();
    let tx = client.new_transaction(&ctx).await.unwrap();

    let mut batch = tx.batch();
    let pending = batch.put(&client.incomplete_key("Data", None), &Data::new("a", 1));
    batch.exec().await.unwrap();
    let pending = pending.await.unwrap();

    let commit = tx.commit().await.unwrap();
    let key = commit.key(&pending);
    let mut dst = Data::default();
    client.get(&ctx, &key, &mut dst).await.unwrap();
    assert_eq!(dst, Data::new("a", 1));
}
