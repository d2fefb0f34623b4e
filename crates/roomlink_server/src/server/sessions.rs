#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use roomlink_domain::{ChatEvent, Destination, Email, SessionId};
use roomlink_protocol::messages::ServerFrame;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

/// Live sessions keyed by id: principal, bound display name, outbound queue and
/// approved broadcast destinations.
#[derive(Debug, Clone, Default)]
pub struct SessionHub {
	inner: Arc<Mutex<HashMap<SessionId, SessionEntry>>>,
}

#[derive(Debug)]
struct SessionEntry {
	principal: Option<Email>,
	display_name: Option<String>,
	outbox: mpsc::Sender<ServerFrame>,
	/// `Public` / `ServiceQueue` subscriptions approved for this session.
	subscriptions: HashSet<Destination>,
}

impl SessionHub {
	pub fn new() -> Self {
		Self::default()
	}

	pub async fn open(&self, session: SessionId, principal: Option<Email>, outbox: mpsc::Sender<ServerFrame>) {
		let mut inner = self.inner.lock().await;
		inner.insert(
			session,
			SessionEntry {
				principal,
				display_name: None,
				outbox,
				subscriptions: HashSet::new(),
			},
		);
		metrics::gauge!("roomlink_server_active_sessions").set(inner.len() as f64);
	}

	pub async fn close(&self, session: SessionId) {
		let mut inner = self.inner.lock().await;
		if inner.remove(&session).is_some() {
			debug!(session_id = %session, "session hub: closed");
		}
		metrics::gauge!("roomlink_server_active_sessions").set(inner.len() as f64);
	}

	/// Outbound queue of a live session.
	pub async fn outbox(&self, session: SessionId) -> Option<mpsc::Sender<ServerFrame>> {
		self.inner.lock().await.get(&session).map(|e| e.outbox.clone())
	}

	pub async fn bind_display_name(&self, session: SessionId, display_name: String) {
		if let Some(entry) = self.inner.lock().await.get_mut(&session) {
			entry.display_name = Some(display_name);
		}
	}

	#[allow(dead_code)]
	pub async fn display_name(&self, session: SessionId) -> Option<String> {
		self.inner.lock().await.get(&session).and_then(|e| e.display_name.clone())
	}

	/// Record an approved subscription. Room destinations are served by consumers, not tracked here.
	pub async fn subscribe(&self, session: SessionId, destination: Destination) {
		if matches!(destination, Destination::Room(_)) {
			return;
		}
		if let Some(entry) = self.inner.lock().await.get_mut(&session) {
			entry.subscriptions.insert(destination);
		}
	}

	/// Deliver to the private queue of every session of `email`; returns sessions reached.
	pub async fn send_to_user(&self, email: &Email, event: ChatEvent) -> usize {
		let inner = self.inner.lock().await;
		let targets = inner.values().filter(|e| {
			e.principal.as_ref() == Some(email) && e.subscriptions.contains(&Destination::ServiceQueue)
		});
		fan_out(targets, Destination::ServiceQueue, event)
	}

	/// Deliver to every session subscribed to the public destination.
	pub async fn broadcast(&self, event: ChatEvent) -> usize {
		let inner = self.inner.lock().await;
		let targets = inner
			.values()
			.filter(|e| e.subscriptions.contains(&Destination::Public));
		fan_out(targets, Destination::Public, event)
	}

	#[allow(dead_code)]
	pub async fn session_count(&self) -> usize {
		self.inner.lock().await.len()
	}
}

fn fan_out<'a>(targets: impl Iterator<Item = &'a SessionEntry>, destination: Destination, event: ChatEvent) -> usize {
	let destination = destination.to_string();
	let mut delivered = 0;
	let mut dropped: u64 = 0;

	for entry in targets {
		let frame = ServerFrame::Deliver {
			destination: destination.clone(),
			event: event.clone(),
		};
		match entry.outbox.try_send(frame) {
			Ok(()) => delivered += 1,
			Err(mpsc::error::TrySendError::Full(_)) => dropped += 1,
			Err(mpsc::error::TrySendError::Closed(_)) => {}
		}
	}

	if dropped > 0 {
		metrics::counter!("roomlink_server_outbox_dropped_total").increment(dropped);
		debug!(%destination, dropped, "session hub: dropped due to full outboxes");
	}

	delivered
}
