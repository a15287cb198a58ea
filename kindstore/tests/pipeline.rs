mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{Data, Recorder, memory_client};
use kindstore::middleware::{
    FailureInjection, FaultRule, Middleware, Operation, Retry, RetryOptions, Split, SplitOptions,
};
use kindstore::{Context, Error, Key};

fn data_keys(client: &kindstore::Client, n: i64) -> Vec<Key> {
    (1..=n).map(|i| client.id_key("Data", i, None)).collect()
}

#[tokio::test]
async fn split_then_get() {
    let (client, backend) = memory_client();
    let chaos = Arc::new(FailureInjection::new());
    client
        .append_middleware(Arc::new(Split::new(SplitOptions::default())))
        .unwrap();
    client.append_middleware(chaos.clone()).unwrap();

    let ctx = Context::background();
    let keys = data_keys(&client, 1200);
    let src: Vec<Data> = (1..=1200).map(|i| Data::new("d", i)).collect();
    let stored = client.put_multi(&ctx, &keys, &src).await.unwrap();
    assert_eq!(stored, keys);
    assert_eq!(backend.len(), 1200);
    assert_eq!(chaos.calls(Operation::PutMultiWithoutTx), 3);

    let mut dst = vec![Data::default(); 1200];
    client.get_multi(&ctx, &keys, &mut dst).await.unwrap();
    assert_eq!(dst, src);
    assert_eq!(chaos.calls(Operation::GetMultiWithoutTx), 2);
}

#[tokio::test]
async fn split_keeps_missing_slots_in_place() {
    let (client, _) = memory_client();
    client
        .append_middleware(Arc::new(Split::new(SplitOptions {
            get_split_threshold: 2,
            ..SplitOptions::default()
        })))
        .unwrap();

    let ctx = Context::background();
    let keys = data_keys(&client, 5);
    client
        .put(&ctx, &keys[1], &Data::new("one", 1))
        .await
        .unwrap();
    client
        .put(&ctx, &keys[4], &Data::new("four", 4))
        .await
        .unwrap();

    let mut dst = vec![Data::default(); 5];
    let Err(Error::Multi(errors)) = client.get_multi(&ctx, &keys, &mut dst).await else {
        panic!("expected a multi error");
    };
    assert_eq!(errors.len(), 5);
    for i in [0, 2, 3] {
        assert!(errors.get(i).is_some_and(Error::is_no_such_entity));
    }
    assert!(errors.get(1).is_none());
    assert_eq!(dst[4], Data::new("four", 4));
}

#[tokio::test]
async fn retry_on_transient() {
    let (client, _) = memory_client();
    let chaos = Arc::new(FailureInjection::new());
    chaos.add_rule(
        FaultRule::new(Error::transient("server is busy"))
            .on(Operation::PutMultiWithoutTx)
            .times(2),
    );
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = lines.clone();
    client
        .append_middleware(Arc::new(Retry::new(RetryOptions {
            min_backoff: Duration::from_millis(1),
            logf: Some(Arc::new(move |line: &str| {
                sink.lock().unwrap().push(line.to_string())
            })),
            ..RetryOptions::default()
        })))
        .unwrap();
    client.append_middleware(chaos.clone()).unwrap();

    let ctx = Context::background();
    let key = client.id_key("Data", 1, None);
    client.put(&ctx, &key, &Data::new("a", 1)).await.unwrap();

    assert_eq!(chaos.calls(Operation::PutMultiWithoutTx), 3);
    let lines = lines.lock().unwrap();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("PutMultiWithoutTx: attempt 1 failed"));
}

#[tokio::test]
async fn retry_waits_double_between_attempts() {
    let (client, _) = memory_client();
    let key = client.id_key("Data", 111, None);
    let chaos = Arc::new(FailureInjection::new());
    chaos.add_rule(
        FaultRule::new(Error::transient("unavailable"))
            .on(Operation::PutMultiWithoutTx)
            .for_key(key.clone())
            .times(3),
    );
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = lines.clone();
    client
        .append_middleware(Arc::new(Retry::new(RetryOptions {
            retry_limit: 4,
            min_backoff: Duration::from_nanos(1),
            logf: Some(Arc::new(move |line: &str| {
                sink.lock().unwrap().push(line.to_string())
            })),
            ..RetryOptions::default()
        })))
        .unwrap();
    client.append_middleware(chaos.clone()).unwrap();

    let ctx = Context::background();
    client.put(&ctx, &key, &Data::new("a", 111)).await.unwrap();

    assert_eq!(chaos.calls(Operation::PutMultiWithoutTx), 4);
    let lines = lines.lock().unwrap();
    assert_eq!(lines.len(), 3);
    for (i, wait) in ["1ns", "2ns", "4ns"].iter().enumerate() {
        assert!(lines[i].starts_with(&format!("PutMultiWithoutTx: attempt {} failed", i + 1)));
        assert!(lines[i].ends_with(&format!("retrying after {}", wait)), "{}", lines[i]);
    }
}

#[tokio::test]
async fn retry_returns_validation_errors_at_once() {
    let (client, _) = memory_client();
    let chaos = Arc::new(FailureInjection::new());
    chaos.add_rule(FaultRule::new(Error::InvalidQuery("bad".to_string())).on(Operation::GetMultiWithoutTx));
    client
        .append_middleware(Arc::new(Retry::new(RetryOptions {
            min_backoff: Duration::from_millis(1),
            ..RetryOptions::default()
        })))
        .unwrap();
    client.append_middleware(chaos.clone()).unwrap();

    let ctx = Context::background();
    let mut dst = Data::default();
    let err = client
        .get(&ctx, &client.id_key("Data", 1, None), &mut dst)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidQuery(_)));
    assert_eq!(chaos.calls(Operation::GetMultiWithoutTx), 1);
}

#[tokio::test]
async fn retry_gives_up_after_the_limit() {
    let (client, _) = memory_client();
    let chaos = Arc::new(FailureInjection::new());
    chaos.add_rule(FaultRule::new(Error::transient("down")).on(Operation::GetMultiWithoutTx));
    client
        .append_middleware(Arc::new(Retry::new(RetryOptions {
            retry_limit: 2,
            min_backoff: Duration::from_millis(1),
            ..RetryOptions::default()
        })))
        .unwrap();
    client.append_middleware(chaos.clone()).unwrap();

    let ctx = Context::background();
    let mut dst = Data::default();
    let err = client
        .get(&ctx, &client.id_key("Data", 1, None), &mut dst)
        .await
        .unwrap_err();
    assert!(err.is_transient());
    assert_eq!(chaos.calls(Operation::GetMultiWithoutTx), 2);
}

#[tokio::test]
async fn retry_does_not_repeat_missing_entities() {
    let (client, _) = memory_client();
    let chaos = Arc::new(FailureInjection::new());
    client.append_middleware(Arc::new(Retry::default())).unwrap();
    client.append_middleware(chaos.clone()).unwrap();

    let ctx = Context::background();
    let mut dst = Data::default();
    let err = client
        .get(&ctx, &client.id_key("Data", 1, None), &mut dst)
        .await
        .unwrap_err();
    assert!(err.is_no_such_entity());
    assert_eq!(chaos.calls(Operation::GetMultiWithoutTx), 1);
}

#[tokio::test]
async fn hooks_run_in_registration_order() {
    let (client, _) = memory_client();
    let log = Arc::new(Mutex::new(Vec::new()));
    client
        .append_middleware(Arc::new(Recorder::new("outer", log.clone())))
        .unwrap();
    client
        .append_middleware(Arc::new(Recorder::new("inner", log.clone())))
        .unwrap();

    let ctx = Context::background();
    client
        .put(&ctx, &client.id_key("Data", 1, None), &Data::new("a", 1))
        .await
        .unwrap();
    assert_eq!(
        *log.lock().unwrap(),
        vec!["outer:put:enter", "inner:put:enter", "inner:put:leave", "outer:put:leave"]
    );
}

#[tokio::test]
async fn removed_middleware_is_skipped_by_later_calls() {
    let (client, _) = memory_client();
    let log = Arc::new(Mutex::new(Vec::new()));
    let recorder: Arc<dyn Middleware> = Arc::new(Recorder::new("r", log.clone()));
    client.append_middleware(recorder.clone()).unwrap();

    let ctx = Context::background();
    let key = client.id_key("Data", 1, None);
    client.put(&ctx, &key, &Data::new("a", 1)).await.unwrap();
    assert!(client.remove_middleware(&recorder));
    client.put(&ctx, &key, &Data::new("b", 2)).await.unwrap();
    assert_eq!(log.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn get_multi_rejects_mismatched_lengths() {
    let (client, _) = memory_client();
    let chaos = Arc::new(FailureInjection::new());
    client.append_middleware(chaos.clone()).unwrap();

    let ctx = Context::background();
    let keys = data_keys(&client, 3);
    let mut dst = vec![Data::default(); 2];
    assert!(matches!(
        client.get_multi(&ctx, &keys, &mut dst).await,
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(chaos.calls(Operation::GetMultiWithoutTx), 0);
}

#[tokio::test]
async fn incomplete_keys_are_completed_on_put() {
    let (client, _) = memory_client();
    let ctx = Context::background();
    let key = client
        .put(&ctx, &client.incomplete_key("Data", None), &Data::new("a", 1))
        .await
        .unwrap();
    assert!(!key.is_incomplete());

    let mut dst = Data::default();
    client.get(&ctx, &key, &mut dst).await.unwrap();
    assert_eq!(dst, Data::new("a", 1));
}

#[tokio::test]
async fn completed_keys_never_replace_explicit_ones() {
    let (client, backend) = memory_client();
    let ctx = Context::background();
    let explicit = client.id_key("Data", 1, None);
    client.put(&ctx, &explicit, &Data::new("explicit", 1)).await.unwrap();
    let allocated = client
        .put(&ctx, &client.incomplete_key("Data", None), &Data::new("auto", 2))
        .await
        .unwrap();

    assert_ne!(allocated, explicit);
    assert_eq!(backend.len(), 2);
    let mut dst = Data::default();
    client.get(&ctx, &explicit, &mut dst).await.unwrap();
    assert_eq!(dst, Data::new("explicit", 1));
    client.get(&ctx, &allocated, &mut dst).await.unwrap();
    assert_eq!(dst, Data::new("auto", 2));
}

#[tokio::test]
async fn canceled_context_stops_calls() {
    let (client, _) = memory_client();
    let (ctx, cancel) = Context::background().with_cancel();
    cancel.cancel();
    let err = client
        .put(&ctx, &client.id_key("Data", 1, None), &Data::new("a", 1))
        .await
        .unwrap_err();
    assert!(err.is_cancellation());
}
