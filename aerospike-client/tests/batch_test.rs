//! Batch reads against the mock server.

mod common;

use aerospike_client::{BatchPolicy, Bins, Expression, Key, Value};

use common::{connect, key, MockServer};

fn keys(count: usize) -> Vec<Key> {
    (0..count).map(|i| key("items", &format!("item-{}", i))).collect()
}

#[tokio::test]
async fn test_batch_get_keeps_key_order() {
    let server = MockServer::start("A").await;
    let keys = keys(20);
    for (i, k) in keys.iter().enumerate() {
        if i % 3 != 0 {
            server.insert(k, &[("n", Value::Int(i as i64)), ("other", Value::from("x"))]);
        }
    }
    let client = connect(&server).await;

    let records = client
        .batch_get(&BatchPolicy::default(), &keys, Bins::All)
        .await
        .unwrap();
    assert_eq!(records.len(), keys.len());
    for (i, record) in records.iter().enumerate() {
        match record {
            Some(r) => {
                assert_ne!(i % 3, 0);
                assert_eq!(r.bin("n"), Some(&Value::Int(i as i64)));
                assert_eq!(r.key.as_ref(), Some(&keys[i]));
            }
            None => assert_eq!(i % 3, 0),
        }
    }
    client.close().await;
}

#[tokio::test]
async fn test_batch_get_selected_bins_with_set_names() {
    let server = MockServer::start("A").await;
    let keys = vec![key("a", "1"), key("a", "2"), key("b", "3")];
    for k in &keys {
        server.insert(k, &[("x", Value::Int(1)), ("y", Value::Int(2))]);
    }
    let client = connect(&server).await;
    let policy = BatchPolicy {
        send_set_name: true,
        ..BatchPolicy::default()
    };

    let records = client.batch_get(&policy, &keys, Bins::from(["y"])).await.unwrap();
    for record in records {
        let record = record.unwrap();
        assert_eq!(record.bins.len(), 1);
        assert_eq!(record.bin("y"), Some(&Value::Int(2)));
    }

    let headers = client.batch_get(&policy, &keys, Bins::None).await.unwrap();
    assert!(headers.iter().all(|r| r.as_ref().is_some_and(|r| r.bins.is_empty())));
    client.close().await;
}

#[tokio::test]
async fn test_batch_exists() {
    let server = MockServer::start("A").await;
    let keys = keys(6);
    server.insert(&keys[1], &[("n", Value::Int(1))]);
    server.insert(&keys[4], &[("n", Value::Int(4))]);
    let client = connect(&server).await;

    let found = client.batch_exists(&BatchPolicy::default(), &keys).await.unwrap();
    assert_eq!(found, vec![false, true, false, false, true, false]);
    client.close().await;
}

#[tokio::test]
async fn test_empty_batch_sends_nothing() {
    let server = MockServer::start("A").await;
    let client = connect(&server).await;

    let records = client.batch_get(&BatchPolicy::default(), &[], Bins::All).await.unwrap();
    assert!(records.is_empty());
    assert!(client.batch_exists(&BatchPolicy::default(), &[]).await.unwrap().is_empty());
    assert_eq!(server.data_requests(), 0);
    client.close().await;
}

#[tokio::test]
async fn test_filtered_records_read_as_none() {
    let server = MockServer::start("A").await;
    let keys = keys(6);
    for (i, k) in keys.iter().enumerate() {
        server.insert(k, &[("n", Value::Int(i as i64))]);
    }
    let client = connect(&server).await;

    let mut policy = BatchPolicy::default();
    policy.base.filter_expression = Some(Expression::not(Expression::ge(
        Expression::int_bin("n"),
        Expression::int(3),
    )));
    let records = client.batch_get(&policy, &keys, Bins::All).await.unwrap();
    let present: Vec<bool> = records.iter().map(Option::is_some).collect();
    assert_eq!(present, vec![true, true, true, false, false, false]);
    client.close().await;
}
