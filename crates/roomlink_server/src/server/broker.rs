#![forbid(unsafe_code)]

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
	#[error("broker unavailable: {0}")]
	Unavailable(String),
}

/// One record read from a topic partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerRecord {
	pub topic: String,
	pub partition: u32,
	pub offset: u64,
	pub key: String,
	pub payload: String,
}

/// Where a fresh subscription starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartFrom {
	/// Oldest retained record.
	#[default]
	Earliest,
	/// Only records published after subscribing.
	Latest,
}

/// Live subscription to one topic. Records arrive ordered per partition.
#[derive(Debug)]
pub struct BrokerSubscription {
	pub id: u64,
	pub topic: String,
	pub rx: mpsc::Receiver<BrokerRecord>,
}

/// Durable partitioned pub/sub log, as seen by the bridge.
#[async_trait]
pub trait Broker: Send + Sync {
	/// Append `payload` to `topic`; records with the same key stay ordered.
	async fn publish(&self, topic: &str, key: &str, payload: String) -> Result<(), BrokerError>;

	/// Start a new independent consumer on `topic`.
	async fn subscribe(&self, topic: &str) -> Result<BrokerSubscription, BrokerError>;

	/// Stop a consumer. Nothing is delivered on its receiver once this returns.
	async fn unsubscribe(&self, subscription_id: u64);
}

/// Configuration for `LocalBroker`.
#[derive(Debug, Clone)]
pub struct LocalBrokerConfig {
	pub partitions: u32,
	/// Records kept per partition before the oldest are evicted.
	pub retention_per_partition: usize,
	/// Queue depth between the log and one subscriber.
	pub consumer_queue_capacity: usize,
	pub start_from: StartFrom,
}

impl Default for LocalBrokerConfig {
	fn default() -> Self {
		Self {
			partitions: 4,
			retention_per_partition: 2048,
			consumer_queue_capacity: 256,
			start_from: StartFrom::Earliest,
		}
	}
}

/// In-process broker: a retained log per topic, pulled by one pump task per subscription.
///
/// A topic log is created on first publish or subscribe and kept until the broker is
/// dropped, even after its last subscriber leaves or its room is removed. Each topic holds
/// at most `retention_per_partition` records in each of `partitions` partitions, so memory
/// grows only with the number of distinct rooms ever used.
#[derive(Clone)]
pub struct LocalBroker {
	inner: Arc<Inner>,
}

struct Inner {
	cfg: LocalBrokerConfig,
	topics: Mutex<HashMap<String, Arc<TopicLog>>>,
	pumps: Mutex<HashMap<u64, JoinHandle<()>>>,
	next_subscription_id: AtomicU64,
	closed: AtomicBool,
}

struct TopicLog {
	name: String,
	partitions: Mutex<Vec<Partition>>,
	version: watch::Sender<u64>,
}

#[derive(Default)]
struct Partition {
	next_offset: u64,
	records: VecDeque<BrokerRecord>,
}

impl LocalBroker {
	pub fn new(cfg: LocalBrokerConfig) -> Self {
		let cfg = LocalBrokerConfig {
			partitions: cfg.partitions.max(1),
			retention_per_partition: cfg.retention_per_partition.max(1),
			consumer_queue_capacity: cfg.consumer_queue_capacity.max(1),
			..cfg
		};

		Self {
			inner: Arc::new(Inner {
				cfg,
				topics: Mutex::new(HashMap::new()),
				pumps: Mutex::new(HashMap::new()),
				next_subscription_id: AtomicU64::new(1),
				closed: AtomicBool::new(false),
			}),
		}
	}

	/// Refuse further publishes/subscribes and stop every pump.
	pub async fn shutdown(&self) {
		self.inner.closed.store(true, Ordering::SeqCst);
		let mut pumps = self.inner.pumps.lock().await;
		for (_, pump) in pumps.drain() {
			pump.abort();
		}
	}

	/// Number of live subscriptions across all topics.
	#[allow(dead_code)]
	pub async fn subscription_count(&self) -> usize {
		let mut pumps = self.inner.pumps.lock().await;
		pumps.retain(|_, pump| !pump.is_finished());
		pumps.len()
	}

	fn ensure_open(&self) -> Result<(), BrokerError> {
		if self.inner.closed.load(Ordering::SeqCst) {
			return Err(BrokerError::Unavailable("local broker is shut down".to_string()));
		}
		Ok(())
	}

	async fn topic(&self, name: &str) -> Arc<TopicLog> {
		let mut topics = self.inner.topics.lock().await;
		let partitions = self.inner.cfg.partitions;
		Arc::clone(topics.entry(name.to_string()).or_insert_with(|| {
			Arc::new(TopicLog {
				name: name.to_string(),
				partitions: Mutex::new((0..partitions).map(|_| Partition::default()).collect()),
				version: watch::channel(0).0,
			})
		}))
	}

	fn partition_for(&self, key: &str) -> usize {
		let mut hasher = DefaultHasher::new();
		key.hash(&mut hasher);
		(hasher.finish() % u64::from(self.inner.cfg.partitions)) as usize
	}
}

#[async_trait]
impl Broker for LocalBroker {
	async fn publish(&self, topic: &str, key: &str, payload: String) -> Result<(), BrokerError> {
		self.ensure_open()?;

		let log = self.topic(topic).await;
		let idx = self.partition_for(key);
		{
			let mut partitions = log.partitions.lock().await;
			let partition = &mut partitions[idx];
			let record = BrokerRecord {
				topic: topic.to_string(),
				partition: idx as u32,
				offset: partition.next_offset,
				key: key.to_string(),
				payload,
			};
			partition.next_offset += 1;
			partition.records.push_back(record);

			while partition.records.len() > self.inner.cfg.retention_per_partition {
				partition.records.pop_front();
			}
		}

		log.version.send_modify(|v| *v = v.wrapping_add(1));
		Ok(())
	}

	async fn subscribe(&self, topic: &str) -> Result<BrokerSubscription, BrokerError> {
		self.ensure_open()?;

		let log = self.topic(topic).await;
		let cursors: Vec<u64> = {
			let partitions = log.partitions.lock().await;
			partitions
				.iter()
				.map(|p| match self.inner.cfg.start_from {
					StartFrom::Earliest => p.records.front().map(|r| r.offset).unwrap_or(p.next_offset),
					StartFrom::Latest => p.next_offset,
				})
				.collect()
		};

		let id = self.inner.next_subscription_id.fetch_add(1, Ordering::Relaxed);
		let (tx, rx) = mpsc::channel(self.inner.cfg.consumer_queue_capacity);
		let pump = tokio::spawn(run_pump(id, Arc::clone(&log), cursors, tx));

		self.inner.pumps.lock().await.insert(id, pump);
		debug!(topic, subscription_id = id, "broker: subscribed");

		Ok(BrokerSubscription {
			id,
			topic: topic.to_string(),
			rx,
		})
	}

	async fn unsubscribe(&self, subscription_id: u64) {
		let pump = self.inner.pumps.lock().await.remove(&subscription_id);
		if let Some(pump) = pump {
			pump.abort();
			let _ = pump.await;
			debug!(subscription_id, "broker: unsubscribed");
		}
	}
}

async fn run_pump(id: u64, log: Arc<TopicLog>, mut cursors: Vec<u64>, tx: mpsc::Sender<BrokerRecord>) {
	let mut version_rx = log.version.subscribe();

	loop {
		version_rx.borrow_and_update();

		let batch: Vec<BrokerRecord> = {
			let partitions = log.partitions.lock().await;
			let mut batch = Vec::new();
			for (idx, partition) in partitions.iter().enumerate() {
				let cursor = &mut cursors[idx];
				if let Some(oldest) = partition.records.front()
					&& *cursor < oldest.offset
				{
					warn!(
						topic = %log.name,
						subscription_id = id,
						partition = idx,
						evicted = oldest.offset - *cursor,
						"broker: consumer fell behind retention; skipping evicted records"
					);
					*cursor = oldest.offset;
				}
				batch.extend(partition.records.iter().filter(|r| r.offset >= *cursor).cloned());
				*cursor = partition.next_offset;
			}
			batch
		};

		if batch.is_empty() {
			if version_rx.changed().await.is_err() {
				return;
			}
			continue;
		}

		for record in batch {
			if tx.send(record).await.is_err() {
				return;
			}
		}
	}
}
