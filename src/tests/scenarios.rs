//! End-to-end sink and join scenarios over the in-memory backends.

use super::{TestRig, join_pipeline, user_event, users_pipeline, wait_until};
use crate::dlq::{DLQ_REASON_KIND_HEADER, DLQ_STAGE_HEADER};
use crate::schema::types::Value;
use crate::substrate::types::{AckPolicy, ConsumerSpec};
use crate::substrate::{Substrate, SubstrateConsumer};
use std::time::Duration;

#[tokio::test]
async fn size_triggered_sink_flushes_in_order() {
    let rig = TestRig::new();
    rig.engine
        .deploy(users_pipeline("s1", 2, "60s"))
        .await
        .unwrap();

    rig.publish_json("ingest.users", user_event("Alice", "alice@example.com", "signup"))
        .await;
    rig.publish_json("ingest.users", user_event("Bob", "bob@example.com", "login"))
        .await;

    let sink = rig.sink("s1");
    assert!(
        wait_until(Duration::from_secs(5), || sink.row_count() == 2).await,
        "expected 2 rows, got {}",
        sink.row_count()
    );

    // Publish order is preserved.
    let rows = sink.rows();
    assert_eq!(rows[0][1], Value::String("Alice".into()));
    assert_eq!(rows[1][1], Value::String("Bob".into()));

    let health = rig.engine.get_health("s1").await.unwrap();
    assert_eq!(health.records_in, 2);
    assert_eq!(health.batches_out, 1);
    assert_eq!(health.dlq_count, 0);
}

#[tokio::test]
async fn delay_triggered_flush_fires_at_max_delay() {
    let rig = TestRig::new();
    rig.engine
        .deploy(users_pipeline("s2", 100, "3s"))
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    for i in 0..4 {
        rig.publish_json(
            "ingest.users",
            user_event(&format!("user{i}"), "u@example.com", "login"),
        )
        .await;
    }

    let sink = rig.sink("s2");
    // Under-size batch must not flush before the delay.
    tokio::time::sleep_until(started + Duration::from_millis(2500)).await;
    assert_eq!(sink.row_count(), 0, "flushed before max_delay_time");

    // And must flush at ~3s, well before 5s.
    assert!(
        wait_until(Duration::from_secs(2), || sink.row_count() == 4).await,
        "delay-triggered flush did not happen"
    );
    assert!(started.elapsed() < Duration::from_millis(4500));
}

#[tokio::test]
async fn basic_join_emits_matching_pairs() {
    let rig = TestRig::new();
    rig.engine
        .deploy(join_pipeline("s3", "2s", "2s"))
        .await
        .unwrap();

    for (id, name) in [(1, "Alice"), (2, "Bob"), (3, "Charlie")] {
        rig.publish_json("ingest.accounts", serde_json::json!({"id": id, "name": name}))
            .await;
    }
    // Let the left side land in join state first.
    tokio::time::sleep(Duration::from_millis(300)).await;
    for (id, email) in [(2, "bob@example.com"), (1, "alice@example.com")] {
        rig.publish_json("ingest.contacts", serde_json::json!({"id": id, "email": email}))
            .await;
    }

    let sink = rig.sink("s3");
    assert!(
        wait_until(Duration::from_secs(5), || sink.row_count() == 2).await,
        "expected 2 joined rows, got {}",
        sink.row_count()
    );
    let rows = sink.rows();
    assert!(rows.contains(&vec![
        Value::Int64(2),
        Value::String("Bob".into()),
        Value::String("bob@example.com".into()),
    ]));
    assert!(rows.contains(&vec![
        Value::Int64(1),
        Value::String("Alice".into()),
        Value::String("alice@example.com".into()),
    ]));

    // No further emissions sneak in.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(sink.row_count(), 2);
}

#[tokio::test]
async fn join_is_many_to_many() {
    let rig = TestRig::new();
    rig.engine
        .deploy(join_pipeline("s4", "2s", "2s"))
        .await
        .unwrap();

    for (id, name) in [(1, "Alice"), (2, "Bob"), (1, "Charlie")] {
        rig.publish_json("ingest.accounts", serde_json::json!({"id": id, "name": name}))
            .await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    for (id, email) in [(2, "bob@example.com"), (1, "svc@example.com")] {
        rig.publish_json("ingest.contacts", serde_json::json!({"id": id, "email": email}))
            .await;
    }

    let sink = rig.sink("s4");
    assert!(
        wait_until(Duration::from_secs(5), || sink.row_count() == 3).await,
        "expected 3 joined rows (many-to-many), got {}",
        sink.row_count()
    );
    let rows = sink.rows();
    assert!(rows.contains(&vec![
        Value::Int64(2),
        Value::String("Bob".into()),
        Value::String("bob@example.com".into()),
    ]));
    // Both lefts with id=1 match the single right.
    assert!(rows.contains(&vec![
        Value::Int64(1),
        Value::String("Alice".into()),
        Value::String("svc@example.com".into()),
    ]));
    assert!(rows.contains(&vec![
        Value::Int64(1),
        Value::String("Charlie".into()),
        Value::String("svc@example.com".into()),
    ]));
}

#[tokio::test]
async fn join_without_matches_emits_nothing() {
    let rig = TestRig::new();
    rig.engine
        .deploy(join_pipeline("s5", "2s", "2s"))
        .await
        .unwrap();

    for id in [1, 2, 3] {
        rig.publish_json("ingest.accounts", serde_json::json!({"id": id, "name": "x"}))
            .await;
    }
    for id in [4, 5] {
        rig.publish_json("ingest.contacts", serde_json::json!({"id": id, "email": "y"}))
            .await;
    }

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(rig.sink("s5").row_count(), 0);
    assert_eq!(rig.substrate.stream_len("joined"), 0);
}

#[tokio::test]
async fn schema_mismatch_routes_to_dlq_and_acks() {
    let rig = TestRig::new();
    rig.engine
        .deploy(users_pipeline("s6", 10, "100ms"))
        .await
        .unwrap();

    let original = serde_json::json!({
        "event_id": "not-a-uuid",
        "name": "Mallory",
        "email": "m@example.com",
        "timestamp": "2024-05-01T10:00:00Z",
        "action": "signup"
    });
    rig.publish_json("ingest.users", original.clone()).await;

    let sink = rig.sink("s6");
    assert!(
        wait_until(Duration::from_secs(5), || {
            rig.substrate.stream_len("dlq") == 1
        })
        .await,
        "record never reached the DLQ"
    );
    assert_eq!(sink.row_count(), 0);

    // DLQ payload is the original, verbatim, with the coercion reason.
    let mut dlq_consumer = rig
        .substrate
        .create_consumer(ConsumerSpec {
            stream: "dlq".into(),
            name: "inspect".into(),
            filter_subject: None,
            ack_policy: AckPolicy::Explicit,
            ack_wait: Duration::from_secs(30),
            max_deliver: 0,
        })
        .await
        .unwrap();
    let records = dlq_consumer
        .fetch(10, Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].payload, bytes::Bytes::from(original.to_string()));
    assert_eq!(records[0].headers[DLQ_REASON_KIND_HEADER], "SchemaCoercionError");
    assert_eq!(records[0].headers[DLQ_STAGE_HEADER], "mapper");

    // Source record was acked: consumer lag drains to zero.
    let mut acked = false;
    for _ in 0..200 {
        let health = rig.engine.get_health("s6").await.unwrap();
        if health.lag == 0 && health.dlq_count == 1 {
            acked = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(acked, "poison record was not acked");
}

// ---- Boundary behaviors

#[tokio::test]
async fn batch_size_one_flushes_every_record() {
    let rig = TestRig::new();
    rig.engine
        .deploy(users_pipeline("b1", 1, "60s"))
        .await
        .unwrap();

    for i in 0..3 {
        rig.publish_json(
            "ingest.users",
            user_event(&format!("u{i}"), "u@example.com", "login"),
        )
        .await;
    }

    let sink = rig.sink("b1");
    assert!(wait_until(Duration::from_secs(5), || sink.row_count() == 3).await);
    let health = rig.engine.get_health("b1").await.unwrap();
    assert_eq!(health.batches_out, 3, "every record flushes individually");
}

#[tokio::test]
async fn zero_delay_flushes_each_fetch_immediately() {
    let rig = TestRig::new();
    rig.engine
        .deploy(users_pipeline("b2", 100, "0"))
        .await
        .unwrap();

    for i in 0..3 {
        rig.publish_json(
            "ingest.users",
            user_event(&format!("u{i}"), "u@example.com", "login"),
        )
        .await;
    }

    let sink = rig.sink("b2");
    // No size trigger and no delay budget: rows land as soon as fetched.
    assert!(wait_until(Duration::from_secs(2), || sink.row_count() == 3).await);
}

#[tokio::test]
async fn zero_ttl_join_matches_nothing_across_time() {
    let rig = TestRig::new();
    rig.engine
        .deploy(join_pipeline("b3", "0", "0"))
        .await
        .unwrap();

    rig.publish_json("ingest.accounts", serde_json::json!({"id": 1, "name": "Alice"}))
        .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    rig.publish_json("ingest.contacts", serde_json::json!({"id": 1, "email": "a@x"}))
        .await;

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(rig.sink("b3").row_count(), 0);
}
