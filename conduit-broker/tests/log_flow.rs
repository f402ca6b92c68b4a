//! End-to-end flows over the in-process partitioned log.
//!
//! Run with: cargo test -p conduit-broker --test log_flow

use std::sync::Arc;
use std::time::Duration;

use conduit_broker::log::{LogProvider, MemoryLog, SeekTo};
use conduit_broker::{
    Broker, BrokerService, BrokerType, ConsumerStatus, OffsetResetStrategy, ProducerStatus, Topic,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Order {
    id: u32,
    item: String,
}

fn order(id: u32) -> Order {
    Order {
        id,
        item: format!("item-{id}"),
    }
}

fn setup(log: &MemoryLog) -> BrokerService {
    BrokerService::new(vec![Arc::new(LogProvider::new(Arc::new(log.clone())))])
}

fn orders_topic(service: &BrokerService, strategy: OffsetResetStrategy) -> Arc<Topic> {
    let broker = Arc::new(Broker::new(BrokerType::Kafka, "local"));
    service.register_topic(
        Topic::new(broker, "orders")
            .with_subscription("billing")
            .with_offset_reset_strategy(strategy),
    )
}

fn append_orders(log: &MemoryLog, ids: impl IntoIterator<Item = u32>) {
    for id in ids {
        let payload = serde_json::to_vec(&order(id)).unwrap();
        log.append("orders", None, &payload);
    }
}

#[tokio::test]
async fn earliest_seeds_each_partition_once() {
    let log = MemoryLog::with_partitions(2);
    append_orders(&log, 1..=3);
    let service = setup(&log);
    let topic = orders_topic(&service, OffsetResetStrategy::Earliest);

    let consumer = service
        .create_consumer::<String, Order>(&topic)
        .await
        .unwrap();
    let events = consumer.poll(Duration::from_secs(1)).await.unwrap();
    assert_eq!(events.len(), 3);
    assert_eq!(events[0].value(), &order(1));

    let seeks = log.seeks();
    assert_eq!(seeks.len(), 2);
    assert!(seeks.iter().all(|s| s.to == SeekTo::Beginning));

    // A broker-driven rebalance hands the same partitions back.
    log.revoke_all("billing", "orders");
    log.rebalance("billing", "orders");
    assert_eq!(log.seeks().len(), 2);

    // Rollback reconnects; uncommitted events come back without reseeking.
    consumer.rollback().await.unwrap();
    assert_eq!(log.seeks().len(), 2);
    assert_eq!(consumer.rollback_count(), 1);
    assert_eq!(consumer.status(), ConsumerStatus::Idle);

    let redelivered = consumer.poll(Duration::from_secs(1)).await.unwrap();
    assert_eq!(redelivered.len(), 3);

    consumer.commit().await.unwrap();
    assert_eq!(log.committed("billing", "orders", 0), Some(3));
    consumer.release().await;
}

#[tokio::test]
async fn rebalances_during_a_poll_seed_each_partition_once() {
    let log = MemoryLog::with_partitions(3);
    let service = setup(&log);
    let topic = orders_topic(&service, OffsetResetStrategy::Earliest);
    let consumer = service
        .create_consumer::<String, Order>(&topic)
        .await
        .unwrap();
    assert_eq!(log.seeks().len(), 3);

    let broker_side = log.clone();
    let rebalancer = std::thread::spawn(move || {
        for _ in 0..20 {
            broker_side.revoke_all("billing", "orders");
            broker_side.rebalance("billing", "orders");
        }
        for partition in 0..3 {
            let payload = serde_json::to_vec(&order(partition as u32 + 1)).unwrap();
            broker_side.append_to("orders", partition, None, &payload);
        }
    });

    let mut ids = Vec::new();
    for _ in 0..5 {
        let events = consumer.poll(Duration::from_millis(500)).await.unwrap();
        ids.extend(events.iter().map(|e| e.value().id));
        if ids.len() == 3 {
            break;
        }
    }
    rebalancer.join().unwrap();

    ids.sort_unstable();
    assert_eq!(ids, [1, 2, 3]);
    let seeks = log.seeks();
    assert_eq!(seeks.len(), 3);
    let mut seeded: Vec<i32> = seeks.iter().map(|s| s.partition).collect();
    seeded.sort_unstable();
    assert_eq!(seeded, [0, 1, 2]);

    let partitions: Vec<i32> = consumer.partitions().iter().map(|p| p.value()).collect();
    assert_eq!(partitions, [0, 1, 2]);
    assert_eq!(consumer.status(), ConsumerStatus::Idle);
    consumer.release().await;
}

#[tokio::test]
async fn committed_progress_survives_rollback() {
    let log = MemoryLog::with_partitions(1);
    append_orders(&log, 1..=2);
    let service = setup(&log);
    let topic = orders_topic(&service, OffsetResetStrategy::Earliest);
    let consumer = service
        .create_consumer::<String, Order>(&topic)
        .await
        .unwrap();

    assert_eq!(consumer.poll(Duration::from_secs(1)).await.unwrap().len(), 2);
    consumer.commit().await.unwrap();
    consumer.rollback().await.unwrap();

    let events = consumer.poll(Duration::from_millis(50)).await.unwrap();
    assert!(events.is_empty());
    assert_eq!(consumer.poll_count(), 2);
    assert_eq!(consumer.event_count(), 2);
}

#[tokio::test]
async fn latest_skips_existing_events() {
    let log = MemoryLog::with_partitions(1);
    append_orders(&log, 1..=2);
    let service = setup(&log);
    let topic = orders_topic(&service, OffsetResetStrategy::Latest);
    let consumer = service
        .create_consumer::<String, Order>(&topic)
        .await
        .unwrap();

    assert!(consumer.poll(Duration::from_millis(50)).await.unwrap().is_empty());
    assert_eq!(log.seeks()[0].to, SeekTo::End);

    append_orders(&log, [3]);
    let events = consumer.poll(Duration::from_secs(1)).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].value().id, 3);
    assert_eq!(events[0].offset().position(), 2);
}

#[tokio::test]
async fn producer_commits_transactionally() {
    let log = MemoryLog::with_partitions(1);
    let service = setup(&log);
    let topic = orders_topic(&service, OffsetResetStrategy::Earliest);
    let producer = service
        .create_producer::<String, Order>(&topic)
        .await
        .unwrap();

    for id in 1..=3 {
        producer
            .send(Some(&format!("order-{id}")), &order(id))
            .await
            .unwrap();
    }
    assert!(log.is_empty("orders"));

    producer.commit().await.unwrap();
    assert_eq!(producer.commit_count(), 1);
    assert_eq!(producer.event_count(), 3);
    assert_eq!(producer.status(), ProducerStatus::Idle);
    assert_eq!(log.len("orders"), 3);

    producer.send(None, &order(4)).await.unwrap();
    producer.rollback().await.unwrap();
    producer.commit().await.unwrap();
    assert_eq!(log.len("orders"), 3);
    assert_eq!(producer.rollback_count(), 1);
}

#[tokio::test]
async fn produced_events_reach_a_consumer() {
    let log = MemoryLog::with_partitions(3);
    let service = setup(&log);
    let topic = orders_topic(&service, OffsetResetStrategy::Earliest);

    let producer = service
        .create_producer::<String, Order>(&topic)
        .await
        .unwrap();
    producer.send(Some(&"a".to_string()), &order(1)).await.unwrap();
    producer.send(Some(&"b".to_string()), &order(2)).await.unwrap();
    producer.commit().await.unwrap();

    let consumer = service
        .create_consumer::<String, Order>(&topic)
        .await
        .unwrap();
    let mut seen = Vec::new();
    while seen.len() < 2 {
        let events = consumer.poll(Duration::from_secs(1)).await.unwrap();
        assert!(!events.is_empty(), "events went missing");
        seen.extend(events.into_iter().map(|e| (e.key().cloned(), e.into_value().id)));
    }
    seen.sort_by_key(|(_, id)| *id);
    assert_eq!(
        seen,
        vec![(Some("a".to_string()), 1), (Some("b".to_string()), 2)]
    );
}

#[tokio::test]
async fn poll_failure_is_recorded_and_cleared() {
    let log = MemoryLog::with_partitions(1);
    append_orders(&log, [1]);
    let service = setup(&log);
    let topic = orders_topic(&service, OffsetResetStrategy::Earliest);
    let consumer = service
        .create_consumer::<String, Order>(&topic)
        .await
        .unwrap();

    log.fail_next_poll("leader not available");
    let err = consumer.poll(Duration::from_secs(1)).await.unwrap_err();
    assert!(err.to_string().starts_with("Failed to poll events from 'orders'"));
    assert_eq!(consumer.status(), ConsumerStatus::Failed);
    assert!(
        consumer
            .last_failure()
            .is_some_and(|f| f.contains("leader not available"))
    );

    let events = consumer.poll(Duration::from_secs(1)).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(consumer.status(), ConsumerStatus::Idle);
    assert!(consumer.last_failure().is_none());
}

#[tokio::test]
async fn undecodable_events_fail_the_poll() {
    let log = MemoryLog::with_partitions(1);
    log.append("orders", None, b"not json");
    let service = setup(&log);
    let topic = orders_topic(&service, OffsetResetStrategy::Earliest);
    let consumer = service
        .create_consumer::<String, Order>(&topic)
        .await
        .unwrap();

    let err = consumer.poll(Duration::from_secs(1)).await.unwrap_err();
    assert!(err.to_string().starts_with("Failed to decode events from"));
    assert_eq!(consumer.status(), ConsumerStatus::Failed);
}

#[tokio::test]
async fn unavailable_broker_fails_creation_and_releases() {
    let log = MemoryLog::new();
    log.set_unavailable(true);
    let service = setup(&log);
    let topic = orders_topic(&service, OffsetResetStrategy::Earliest);

    let err = service
        .create_consumer::<String, Order>(&topic)
        .await
        .unwrap_err();
    assert!(err.to_string().starts_with("Failed to connect consumer for 'orders'"));
    assert!(service.consumers().is_empty());
    assert_eq!(log.members("billing", "orders"), 0);
}

#[tokio::test]
async fn release_leaves_the_group_and_is_idempotent() {
    let log = MemoryLog::with_partitions(2);
    let service = setup(&log);
    let topic = orders_topic(&service, OffsetResetStrategy::Earliest);
    let first = service
        .create_consumer::<String, Order>(&topic)
        .await
        .unwrap();
    let second = service
        .create_consumer::<String, Order>(&topic)
        .await
        .unwrap();
    assert_eq!(log.members("billing", "orders"), 2);
    assert_eq!(first.partitions().len() + second.partitions().len(), 2);

    first.release().await;
    first.release().await;
    assert!(first.is_closed());
    assert_eq!(log.members("billing", "orders"), 1);
    assert_eq!(second.partitions().len(), 2);
    assert_eq!(service.consumers().len(), 1);

    let err = first.poll(Duration::from_millis(10)).await.unwrap_err();
    assert!(err.to_string().contains("is closed"));
}

#[tokio::test]
async fn lag_tracks_unread_events() {
    let log = MemoryLog::with_partitions(1);
    let service = setup(&log);
    let topic = service.register_topic(
        Topic::new(Arc::new(Broker::new(BrokerType::Kafka, "local")), "orders")
            .with_offset_reset_strategy(OffsetResetStrategy::Earliest)
            .with_max_poll_records(2),
    );
    append_orders(&log, 1..=5);
    let consumer = service
        .create_consumer::<String, Order>(&topic)
        .await
        .unwrap();

    assert_eq!(consumer.poll(Duration::from_secs(1)).await.unwrap().len(), 2);
    assert_eq!(consumer.lag(), 3);
    let snapshot = consumer.info().snapshot();
    assert_eq!(snapshot.lag, 3);
    assert_eq!(snapshot.event_count, 2);
}
