#![forbid(unsafe_code)]

use std::sync::Arc;

use roomlink_domain::{Destination, Email};
use tracing::{debug, warn};

use crate::server::directory::RoomDirectory;

/// Approves subscribe requests. Decisions are never cached.
#[derive(Clone)]
pub struct SubscriptionGuard {
	directory: Arc<RoomDirectory>,
}

impl SubscriptionGuard {
	pub fn new(directory: Arc<RoomDirectory>) -> Self {
		Self { directory }
	}

	pub async fn authorize_subscribe(&self, principal: Option<&Email>, destination: &str) -> bool {
		let allowed = self.decide(principal, destination).await;
		if !allowed {
			metrics::counter!("roomlink_server_subscribe_denied_total").increment(1);
		}
		allowed
	}

	async fn decide(&self, principal: Option<&Email>, destination: &str) -> bool {
		let Some(email) = principal else {
			debug!(destination, "subscribe denied: not authenticated");
			return false;
		};

		match Destination::parse(destination) {
			Ok(Destination::Public | Destination::ServiceQueue) => true,
			Ok(Destination::Room(room)) => match self.directory.check_membership(Some(email), room.as_str()).await {
				Ok(member) => {
					if !member {
						debug!(destination, principal = %email, "subscribe denied: not a member");
					}
					member
				}
				Err(e) => {
					warn!(destination, principal = %email, error = %e, "subscribe denied: membership lookup failed");
					false
				}
			},
			Err(e) => {
				debug!(destination, error = %e, "subscribe denied: unknown destination");
				false
			}
		}
	}
}
