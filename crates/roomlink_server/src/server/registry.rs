#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use roomlink_domain::{Destination, ErrorKind, RoomId, SessionId};
use roomlink_protocol::codec;
use roomlink_protocol::messages::ServerFrame;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::server::broker::{Broker, BrokerError, BrokerRecord};
use crate::server::sessions::SessionHub;

#[derive(Debug, Error)]
pub enum RegistryError {
	#[error("session {0} has been released")]
	SessionReleased(SessionId),

	#[error(transparent)]
	Broker(#[from] BrokerError),
}

impl RegistryError {
	pub fn kind(&self) -> ErrorKind {
		match self {
			RegistryError::SessionReleased(_) => ErrorKind::Internal,
			RegistryError::Broker(_) => ErrorKind::BrokerUnavailable,
		}
	}
}

/// Identifies one (session, room) consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerHandle {
	pub session: SessionId,
	pub room: RoomId,
	pub subscription_id: u64,
}

/// Owns every broker consumer, scoped per (session, room).
pub struct SessionConsumerRegistry {
	broker: Arc<dyn Broker>,
	sessions: SessionHub,
	by_session: Mutex<HashMap<SessionId, Arc<Mutex<SessionConsumers>>>>,
}

#[derive(Default)]
struct SessionConsumers {
	released: bool,
	consumers: HashMap<RoomId, Consumer>,
}

struct Consumer {
	handle: ConsumerHandle,
	task: JoinHandle<()>,
}

impl SessionConsumerRegistry {
	pub fn new(broker: Arc<dyn Broker>, sessions: SessionHub) -> Self {
		Self {
			broker,
			sessions,
			by_session: Mutex::new(HashMap::new()),
		}
	}

	/// Return the session's consumer for `room`, subscribing a new one if absent.
	pub async fn ensure_consumer(
		&self,
		session: SessionId,
		room: &RoomId,
		principal: &str,
	) -> Result<ConsumerHandle, RegistryError> {
		let state = {
			let mut by_session = self.by_session.lock().await;
			match by_session.get(&session) {
				Some(state) => Arc::clone(state),
				None => {
					if self.sessions.outbox(session).await.is_none() {
						return Err(RegistryError::SessionReleased(session));
					}
					Arc::clone(by_session.entry(session).or_default())
				}
			}
		};

		let mut state = state.lock().await;
		if state.released {
			return Err(RegistryError::SessionReleased(session));
		}
		if let Some(existing) = state.consumers.get(room) {
			debug!(session_id = %session, room = %room, "registry: consumer already present");
			return Ok(existing.handle.clone());
		}

		let Some(outbox) = self.sessions.outbox(session).await else {
			return Err(RegistryError::SessionReleased(session));
		};

		let subscription = self.broker.subscribe(room.as_str()).await?;
		let handle = ConsumerHandle {
			session,
			room: room.clone(),
			subscription_id: subscription.id,
		};
		let task = tokio::spawn(run_delivery(session, room.clone(), subscription.rx, outbox));

		state.consumers.insert(
			room.clone(),
			Consumer {
				handle: handle.clone(),
				task,
			},
		);
		metrics::gauge!("roomlink_server_active_consumers").increment(1.0);
		info!(session_id = %session, room = %room, principal, "registry: consumer started");

		Ok(handle)
	}

	/// Stop and discard every consumer of `session`. Nothing reaches the session afterwards.
	pub async fn release_session(&self, session: SessionId) {
		let Some(state) = self.by_session.lock().await.remove(&session) else {
			return;
		};

		let consumers = {
			let mut state = state.lock().await;
			state.released = true;
			std::mem::take(&mut state.consumers)
		};

		let released = consumers.len();
		for (_, consumer) in consumers {
			consumer.task.abort();
			let _ = consumer.task.await;
			self.broker.unsubscribe(consumer.handle.subscription_id).await;
			metrics::gauge!("roomlink_server_active_consumers").decrement(1.0);
		}

		if released > 0 {
			info!(session_id = %session, released, "registry: session released");
		}
	}

	pub async fn consumer_count(&self, session: SessionId) -> usize {
		let state = self.by_session.lock().await.get(&session).cloned();
		match state {
			Some(state) => state.lock().await.consumers.len(),
			None => 0,
		}
	}
}

async fn run_delivery(
	session: SessionId,
	room: RoomId,
	mut records: mpsc::Receiver<BrokerRecord>,
	outbox: mpsc::Sender<ServerFrame>,
) {
	let destination = Destination::room(&room).to_string();

	while let Some(record) = records.recv().await {
		let event = match codec::decode(&record.payload) {
			Ok(event) => event,
			Err(e) => {
				metrics::counter!("roomlink_server_decode_failures_total").increment(1);
				warn!(
					session_id = %session,
					room = %room,
					partition = record.partition,
					offset = record.offset,
					error = %e,
					"registry: dropping undecodable record"
				);
				continue;
			}
		};

		let frame = ServerFrame::Deliver {
			destination: destination.clone(),
			event,
		};
		if outbox.send(frame).await.is_err() {
			debug!(session_id = %session, room = %room, "registry: session outbox closed");
			return;
		}
	}
}
