#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use roomlink_domain::{ChatEvent, CorrelationToken, Destination, ErrorKind, EventKind, RoomId, SessionId};
use roomlink_protocol::codec;
use roomlink_protocol::messages::{ClientAction, ReplyBody, ServerFrame, UserSummary};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::server::auth::Principal;
use crate::server::broker::Broker;
use crate::server::directory::{DirectoryError, RoomDirectory, parse_room_key};
use crate::server::guard::SubscriptionGuard;
use crate::server::registry::SessionConsumerRegistry;
use crate::server::sessions::SessionHub;

/// Display name bound when a client identifies with an empty name.
const UNKNOWN_DISPLAY_NAME: &str = "unknown";

/// Per-connection identity handed to the router.
#[derive(Debug, Clone)]
pub struct SessionContext {
	pub session_id: SessionId,
	pub principal: Option<Principal>,
}

/// What the connection should do after an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterOutcome {
	Reply { status: u16, body: ReplyBody },
	NoReply,
	/// Send an error frame and close the connection.
	Fatal { kind: ErrorKind, message: String },
}

impl RouterOutcome {
	fn ok(body: ReplyBody) -> Self {
		RouterOutcome::Reply { status: 200, body }
	}

	fn text(text: &str) -> Self {
		Self::ok(ReplyBody::Text(text.to_string()))
	}

	fn failed(kind: ErrorKind, message: impl Into<String>) -> Self {
		RouterOutcome::Reply {
			status: kind.status(),
			body: ReplyBody::Text(message.into()),
		}
	}
}

impl From<DirectoryError> for RouterOutcome {
	fn from(e: DirectoryError) -> Self {
		if let DirectoryError::Store(inner) = &e {
			warn!(error = %inner, "router: directory store failure");
			return RouterOutcome::failed(ErrorKind::Internal, "internal error");
		}
		RouterOutcome::failed(e.kind(), e.to_string())
	}
}

/// Orchestrates inbound client actions and the session lifecycle around them.
pub struct EventRouter {
	directory: Arc<RoomDirectory>,
	guard: SubscriptionGuard,
	registry: Arc<SessionConsumerRegistry>,
	sessions: SessionHub,
	broker: Arc<dyn Broker>,
}

impl EventRouter {
	pub fn new(directory: Arc<RoomDirectory>, broker: Arc<dyn Broker>) -> Self {
		let sessions = SessionHub::new();
		Self {
			guard: SubscriptionGuard::new(Arc::clone(&directory)),
			registry: Arc::new(SessionConsumerRegistry::new(Arc::clone(&broker), sessions.clone())),
			directory,
			sessions,
			broker,
		}
	}

	#[allow(dead_code)]
	pub fn registry(&self) -> &SessionConsumerRegistry {
		&self.registry
	}

	/// Register the session; authenticated principals are registered with the directory first.
	pub async fn open_session(
		&self,
		ctx: &SessionContext,
		outbox: mpsc::Sender<ServerFrame>,
	) -> Result<(), DirectoryError> {
		if let Some(principal) = ctx.principal.as_ref() {
			self.directory
				.ensure_user(&principal.email, &principal.display_name)
				.await?;
		}
		self.sessions
			.open(ctx.session_id, ctx.principal.as_ref().map(|p| p.email.clone()), outbox)
			.await;
		Ok(())
	}

	/// Tear down everything the session owns.
	pub async fn close_session(&self, session: SessionId) {
		self.sessions.close(session).await;
		self.registry.release_session(session).await;
	}

	/// Publish an event on its room's topic. Failures are logged and counted.
	pub async fn publish_event(&self, event: &ChatEvent) -> bool {
		let payload = codec::encode(event);
		match self.broker.publish(&event.room_id, &event.room_id, payload).await {
			Ok(()) => true,
			Err(e) => {
				metrics::counter!("roomlink_server_publish_failures_total").increment(1);
				warn!(room = %event.room_id, error = %e, "router: publish failed");
				false
			}
		}
	}

	pub async fn handle(&self, ctx: &SessionContext, action: ClientAction) -> RouterOutcome {
		let action_name = action.name();
		debug!(session_id = %ctx.session_id, action = action_name, "router: action");

		match action {
			ClientAction::SendMessage { room_id, content } => self.send_message(ctx, &room_id, content).await,
			ClientAction::JoinRoom { room_id } => self.join_room(ctx, &room_id).await,
			ClientAction::AddDisplayName { display_name } => self.identify(ctx, display_name).await,
			ClientAction::Subscribe { destination } => self.subscribe(ctx, &destination).await,
			other => {
				let Some(principal) = ctx.principal.as_ref() else {
					info!(session_id = %ctx.session_id, action = action_name, "router: unauthenticated request refused");
					return RouterOutcome::failed(ErrorKind::AuthzDenied, "not authenticated");
				};
				self.handle_authenticated(principal, other).await
			}
		}
	}

	async fn handle_authenticated(&self, principal: &Principal, action: ClientAction) -> RouterOutcome {
		match action {
			ClientAction::CreateRoom { emails } => match self.directory.create_room(&principal.email, &emails).await {
				Ok(created) => {
					for member in &created.members {
						self.sessions.send_to_user(member, ChatEvent::chats_update()).await;
					}
					self.publish_event(&created.announcement).await;
					RouterOutcome::text("New chat created")
				}
				Err(e) => e.into(),
			},

			ClientAction::RemoveRoom { room_id } => {
				let Ok(room) = RoomId::new(room_id.clone()) else {
					return DirectoryError::Forbidden(room_id).into();
				};
				match self.directory.remove_room(&principal.email, &room).await {
					Ok(_) => RouterOutcome::text("Chat removed"),
					Err(e) => e.into(),
				}
			}

			ClientAction::AddMembers { room_id, emails } => {
				let Ok(room) = RoomId::new(room_id.clone()) else {
					return DirectoryError::Forbidden(room_id).into();
				};
				match self.directory.add_members(&principal.email, &room, &emails).await {
					Ok(added) => {
						for member in &added {
							self.sessions.send_to_user(member, ChatEvent::chats_update()).await;
						}
						RouterOutcome::text("Users added to chat")
					}
					Err(e) => e.into(),
				}
			}

			ClientAction::FindUser { query } => match self.directory.find_users(&query).await {
				Ok(users) => RouterOutcome::ok(ReplyBody::Users(
					users
						.into_iter()
						.map(|u| UserSummary {
							display_name: u.display_name,
							email: u.email.into(),
						})
						.collect(),
				)),
				Err(e) => e.into(),
			},

			ClientAction::ListAllUsers => match self.directory.all_users().await {
				Ok(users) => RouterOutcome::ok(ReplyBody::UserDirectory(
					users.into_iter().map(|u| (u.display_name, u.email.into())).collect(),
				)),
				Err(e) => e.into(),
			},

			ClientAction::ListMyRooms => match self.directory.accessible_rooms(&principal.email).await {
				Ok(listings) => RouterOutcome::ok(ReplyBody::Rooms(
					listings
						.into_iter()
						.map(|l| (l.room.into_string(), l.member_names))
						.collect::<BTreeMap<_, _>>(),
				)),
				Err(e) => e.into(),
			},

			ClientAction::SendMessage { .. }
			| ClientAction::JoinRoom { .. }
			| ClientAction::AddDisplayName { .. }
			| ClientAction::Subscribe { .. } => RouterOutcome::NoReply,
		}
	}

	/// Publish a chat message; the sender is always the session principal.
	async fn send_message(&self, ctx: &SessionContext, room_id: &str, content: String) -> RouterOutcome {
		let Some(principal) = ctx.principal.as_ref() else {
			info!(session_id = %ctx.session_id, room = room_id, "router: send dropped (not authenticated)");
			return RouterOutcome::NoReply;
		};
		let Some(room) = self.member_room(ctx, principal, room_id, "send").await else {
			return RouterOutcome::NoReply;
		};

		let sender_name = match self.directory.user(&principal.email).await {
			Ok(Some(user)) => user.display_name,
			Ok(None) => principal.display_name.clone(),
			Err(e) => {
				warn!(session_id = %ctx.session_id, error = %e, "router: sender lookup failed");
				principal.display_name.clone()
			}
		};

		let event = ChatEvent::chat(&room, content, &principal.email, sender_name);
		if self.publish_event(&event).await {
			debug!(session_id = %ctx.session_id, room = %room, correlation = %event.correlation, "router: message published");
		}
		RouterOutcome::NoReply
	}

	async fn join_room(&self, ctx: &SessionContext, room_id: &str) -> RouterOutcome {
		let Some(principal) = ctx.principal.as_ref() else {
			info!(session_id = %ctx.session_id, room = room_id, "router: join dropped (not authenticated)");
			return RouterOutcome::NoReply;
		};
		let Some(room) = self.member_room(ctx, principal, room_id, "join").await else {
			return RouterOutcome::NoReply;
		};

		if let Err(e) = self
			.registry
			.ensure_consumer(ctx.session_id, &room, principal.email.as_str())
			.await
		{
			warn!(session_id = %ctx.session_id, room = %room, kind = %e.kind(), error = %e, "router: join failed");
		}
		RouterOutcome::NoReply
	}

	/// Bind a presentation name to the session and echo it on the public destination.
	async fn identify(&self, ctx: &SessionContext, display_name: String) -> RouterOutcome {
		let display_name = match display_name.trim() {
			"" => UNKNOWN_DISPLAY_NAME.to_string(),
			name => name.to_string(),
		};
		self.sessions
			.bind_display_name(ctx.session_id, display_name.clone())
			.await;

		let echo = ChatEvent {
			room_id: "public".to_string(),
			kind: EventKind::System,
			content: display_name.clone(),
			sender_email: ctx
				.principal
				.as_ref()
				.map(|p| p.email.to_string())
				.unwrap_or_default(),
			sender_name: display_name,
			correlation: CorrelationToken::generate(),
		};
		self.sessions.broadcast(echo).await;
		RouterOutcome::NoReply
	}

	async fn subscribe(&self, ctx: &SessionContext, destination: &str) -> RouterOutcome {
		let email = ctx.principal.as_ref().map(|p| &p.email);
		if !self.guard.authorize_subscribe(email, destination).await {
			warn!(session_id = %ctx.session_id, destination, "router: subscription refused");
			return RouterOutcome::Fatal {
				kind: ErrorKind::AuthzDenied,
				message: "Requested destination is not available for this user".to_string(),
			};
		}

		if let Ok(parsed) = Destination::parse(destination) {
			self.sessions.subscribe(ctx.session_id, parsed).await;
		}
		RouterOutcome::ok(ReplyBody::Empty)
	}

	/// Resolve `room_id` only if the principal is a member; otherwise log and return `None`.
	async fn member_room(&self, ctx: &SessionContext, principal: &Principal, room_id: &str, action: &str) -> Option<RoomId> {
		match self.directory.check_membership(Some(&principal.email), room_id).await {
			Ok(true) => parse_room_key(room_id),
			Ok(false) => {
				info!(session_id = %ctx.session_id, room = room_id, action, "router: access denied");
				None
			}
			Err(e) => {
				warn!(session_id = %ctx.session_id, room = room_id, action, error = %e, "router: membership lookup failed");
				None
			}
		}
	}
}
