#![forbid(unsafe_code)]

use std::time::Duration;

use tokio::time::timeout;

use crate::server::broker::{Broker, BrokerError, BrokerSubscription, LocalBroker, LocalBrokerConfig, StartFrom};

fn broker(start_from: StartFrom, retention: usize) -> LocalBroker {
	LocalBroker::new(LocalBrokerConfig {
		partitions: 4,
		retention_per_partition: retention,
		consumer_queue_capacity: 8,
		start_from,
	})
}

async fn next_payload(sub: &mut BrokerSubscription) -> String {
	timeout(Duration::from_millis(500), sub.rx.recv())
		.await
		.expect("expected a record within timeout")
		.expect("subscription open")
		.payload
}

async fn assert_quiet(sub: &mut BrokerSubscription) {
	let got = timeout(Duration::from_millis(50), sub.rx.recv()).await;
	assert!(got.is_err(), "unexpected record: {got:?}");
}

#[tokio::test]
async fn records_stay_ordered_per_key() {
	let b = broker(StartFrom::Earliest, 64);
	let mut sub = b.subscribe("room-a").await.unwrap();

	for i in 0..20 {
		b.publish("room-a", "room-a", format!("m{i}")).await.unwrap();
	}

	for i in 0..20 {
		assert_eq!(next_payload(&mut sub).await, format!("m{i}"));
	}
}

#[tokio::test]
async fn topics_are_isolated() {
	let b = broker(StartFrom::Earliest, 64);
	let mut sub_a = b.subscribe("a").await.unwrap();

	b.publish("b", "b", "for-b".to_string()).await.unwrap();
	assert_quiet(&mut sub_a).await;

	b.publish("a", "a", "for-a".to_string()).await.unwrap();
	assert_eq!(next_payload(&mut sub_a).await, "for-a");
}

#[tokio::test]
async fn earliest_subscription_sees_records_published_before_it() {
	let b = broker(StartFrom::Earliest, 64);
	b.publish("room", "room", "before".to_string()).await.unwrap();

	let mut sub = b.subscribe("room").await.unwrap();
	assert_eq!(next_payload(&mut sub).await, "before");

	b.publish("room", "room", "after".to_string()).await.unwrap();
	assert_eq!(next_payload(&mut sub).await, "after");
}

#[tokio::test]
async fn latest_subscription_skips_history() {
	let b = broker(StartFrom::Latest, 64);
	b.publish("room", "room", "before".to_string()).await.unwrap();

	let mut sub = b.subscribe("room").await.unwrap();
	assert_quiet(&mut sub).await;

	b.publish("room", "room", "after".to_string()).await.unwrap();
	assert_eq!(next_payload(&mut sub).await, "after");
}

#[tokio::test]
async fn retention_evicts_oldest_records() {
	let b = broker(StartFrom::Earliest, 2);
	for i in 0..5 {
		b.publish("room", "room", format!("m{i}")).await.unwrap();
	}

	let mut sub = b.subscribe("room").await.unwrap();
	assert_eq!(next_payload(&mut sub).await, "m3");
	assert_eq!(next_payload(&mut sub).await, "m4");
	assert_quiet(&mut sub).await;
}

#[tokio::test]
async fn independent_subscriptions_each_get_every_record() {
	let b = broker(StartFrom::Earliest, 64);
	let mut one = b.subscribe("room").await.unwrap();
	let mut two = b.subscribe("room").await.unwrap();
	assert_ne!(one.id, two.id);

	b.publish("room", "room", "hello".to_string()).await.unwrap();
	assert_eq!(next_payload(&mut one).await, "hello");
	assert_eq!(next_payload(&mut two).await, "hello");
}

#[tokio::test]
async fn slow_subscriber_loses_nothing_within_retention() {
	let b = broker(StartFrom::Earliest, 1024);
	let mut sub = b.subscribe("room").await.unwrap();

	// Far more than the 8-slot queue.
	for i in 0..100 {
		b.publish("room", "room", format!("m{i}")).await.unwrap();
	}

	for i in 0..100 {
		assert_eq!(next_payload(&mut sub).await, format!("m{i}"));
	}
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
	let b = broker(StartFrom::Earliest, 64);
	let mut sub = b.subscribe("room").await.unwrap();
	assert_eq!(b.subscription_count().await, 1);

	b.unsubscribe(sub.id).await;
	assert_eq!(b.subscription_count().await, 0);

	b.publish("room", "room", "late".to_string()).await.unwrap();
	let got = timeout(Duration::from_millis(250), sub.rx.recv())
		.await
		.expect("channel should close promptly");
	assert!(got.is_none(), "received a record after unsubscribe: {got:?}");
}

#[tokio::test]
async fn topic_history_outlives_its_subscribers() {
	let b = broker(StartFrom::Earliest, 2);
	let first = b.subscribe("room").await.unwrap();
	for n in 0..3 {
		b.publish("room", "room", format!("m{n}")).await.unwrap();
	}
	b.unsubscribe(first.id).await;
	assert_eq!(b.subscription_count().await, 0);

	let mut again = b.subscribe("room").await.unwrap();
	assert_eq!(next_payload(&mut again).await, "m1");
	assert_eq!(next_payload(&mut again).await, "m2");
	assert_quiet(&mut again).await;
}

#[tokio::test]
async fn shutdown_makes_broker_unavailable() {
	let b = broker(StartFrom::Earliest, 64);
	b.shutdown().await;

	let err = b.publish("room", "room", "x".to_string()).await.unwrap_err();
	assert!(matches!(err, BrokerError::Unavailable(_)));
	assert!(b.subscribe("room").await.is_err());
}
