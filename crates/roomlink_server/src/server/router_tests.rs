#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use roomlink_domain::{CHATS_UPDATE, Destination, Email, ErrorKind, EventKind, RoomId, SessionId};
use roomlink_protocol::messages::{ClientAction, ReplyBody, ServerFrame};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::server::auth::Principal;
use crate::server::broker::{Broker, BrokerError, BrokerSubscription, LocalBroker, LocalBrokerConfig};
use crate::server::directory::{MemoryStore, RoomDirectory};
use crate::server::router::{EventRouter, RouterOutcome, SessionContext};

struct FailingBroker;

#[async_trait]
impl Broker for FailingBroker {
	async fn publish(&self, _topic: &str, _key: &str, _payload: String) -> Result<(), BrokerError> {
		Err(BrokerError::Unavailable("down for test".to_string()))
	}

	async fn subscribe(&self, _topic: &str) -> Result<BrokerSubscription, BrokerError> {
		Err(BrokerError::Unavailable("down for test".to_string()))
	}

	async fn unsubscribe(&self, _subscription_id: u64) {}
}

async fn router_with(broker: Arc<dyn Broker>) -> EventRouter {
	let directory = Arc::new(RoomDirectory::new(Arc::new(MemoryStore::new())));
	directory.init_main_room().await.unwrap();
	EventRouter::new(directory, broker)
}

async fn router() -> EventRouter {
	router_with(Arc::new(LocalBroker::new(LocalBrokerConfig::default()))).await
}

fn ctx(id: u64, email: &str, name: &str) -> SessionContext {
	SessionContext {
		session_id: SessionId(id),
		principal: Some(Principal {
			email: Email::new(email).unwrap(),
			display_name: name.to_string(),
		}),
	}
}

async fn connect(router: &EventRouter, id: u64, email: &str, name: &str) -> (SessionContext, mpsc::Receiver<ServerFrame>) {
	let ctx = ctx(id, email, name);
	let (tx, rx) = mpsc::channel(64);
	router.open_session(&ctx, tx).await.unwrap();
	(ctx, rx)
}

async fn next_frame(rx: &mut mpsc::Receiver<ServerFrame>) -> ServerFrame {
	timeout(Duration::from_millis(500), rx.recv())
		.await
		.expect("expected a frame within timeout")
		.expect("outbox open")
}

/// Next chat message delivered on a room destination, skipping system events.
async fn next_chat(rx: &mut mpsc::Receiver<ServerFrame>) -> (String, roomlink_domain::ChatEvent) {
	loop {
		if let ServerFrame::Deliver { destination, event } = next_frame(rx).await
			&& event.kind == EventKind::Chat
		{
			return (destination, event);
		}
	}
}

async fn assert_no_chat(rx: &mut mpsc::Receiver<ServerFrame>) {
	let deadline = tokio::time::Instant::now() + Duration::from_millis(100);
	while let Ok(Some(frame)) = tokio::time::timeout_at(deadline, rx.recv()).await {
		if let ServerFrame::Deliver { event, .. } = &frame {
			assert_ne!(event.kind, EventKind::Chat, "unexpected chat delivery: {frame:?}");
		}
	}
}

fn text(status: u16, s: &str) -> RouterOutcome {
	RouterOutcome::Reply {
		status,
		body: ReplyBody::Text(s.to_string()),
	}
}

fn subscribe(destination: &str) -> ClientAction {
	ClientAction::Subscribe {
		destination: destination.to_string(),
	}
}

async fn only_private_room(router: &EventRouter, ctx: &SessionContext) -> String {
	match router.handle(ctx, ClientAction::ListMyRooms).await {
		RouterOutcome::Reply {
			status: 200,
			body: ReplyBody::Rooms(rooms),
		} => {
			let ids: Vec<_> = rooms.into_keys().filter(|k| k != RoomId::MAIN).collect();
			assert_eq!(ids.len(), 1, "expected one private room: {ids:?}");
			ids.into_iter().next().unwrap()
		}
		other => panic!("unexpected outcome: {other:?}"),
	}
}

#[tokio::test]
async fn create_join_and_chat_between_two_users() {
	let router = router().await;
	let (a, mut a_rx) = connect(&router, 1, "a@x", "alice").await;
	let (b, mut b_rx) = connect(&router, 2, "b@x", "bob").await;

	let ok = RouterOutcome::Reply {
		status: 200,
		body: ReplyBody::Empty,
	};
	assert_eq!(router.handle(&a, subscribe(Destination::SERVICE_QUEUE)).await, ok);
	assert_eq!(router.handle(&b, subscribe(Destination::SERVICE_QUEUE)).await, ok);

	let created = router
		.handle(
			&a,
			ClientAction::CreateRoom {
				emails: vec!["b@x".to_string()],
			},
		)
		.await;
	assert_eq!(created, text(200, "New chat created"));

	for rx in [&mut a_rx, &mut b_rx] {
		match next_frame(rx).await {
			ServerFrame::Deliver { destination, event } => {
				assert_eq!(destination, Destination::SERVICE_QUEUE);
				assert_eq!(event.content, CHATS_UPDATE);
			}
			other => panic!("unexpected frame: {other:?}"),
		}
	}

	let room_id = only_private_room(&router, &b).await;
	assert_eq!(
		router
			.handle(
				&b,
				ClientAction::JoinRoom {
					room_id: room_id.clone()
				}
			)
			.await,
		RouterOutcome::NoReply
	);
	assert_eq!(router.registry().consumer_count(SessionId(2)).await, 1);

	let sent = router
		.handle(
			&a,
			ClientAction::SendMessage {
				room_id: room_id.clone(),
				content: "hi".to_string(),
			},
		)
		.await;
	assert_eq!(sent, RouterOutcome::NoReply);

	let (destination, event) = next_chat(&mut b_rx).await;
	assert_eq!(destination, format!("/topic/room/{room_id}"));
	assert_eq!(event.content, "hi");
	assert_eq!(event.sender_email, "a@x");
	assert_eq!(event.sender_name, "alice");
	assert_eq!(event.room_id, room_id);

	router.close_session(SessionId(2)).await;
	assert_eq!(router.registry().consumer_count(SessionId(2)).await, 0);
}

#[tokio::test]
async fn non_member_send_is_dropped() {
	let router = router().await;
	let (a, _a_rx) = connect(&router, 1, "a@x", "alice").await;
	let (b, mut b_rx) = connect(&router, 2, "b@x", "bob").await;
	let (c, _c_rx) = connect(&router, 3, "c@x", "carol").await;

	router
		.handle(
			&a,
			ClientAction::CreateRoom {
				emails: vec!["b@x".to_string()],
			},
		)
		.await;
	let room_id = only_private_room(&router, &b).await;
	router.handle(&b, ClientAction::JoinRoom { room_id: room_id.clone() }).await;

	let outcome = router
		.handle(
			&c,
			ClientAction::SendMessage {
				room_id: room_id.clone(),
				content: "intrusion".to_string(),
			},
		)
		.await;
	assert_eq!(outcome, RouterOutcome::NoReply);

	// Joining does not help a non-member either.
	router.handle(&c, ClientAction::JoinRoom { room_id }).await;
	assert_eq!(router.registry().consumer_count(SessionId(3)).await, 0);

	assert_no_chat(&mut b_rx).await;
}

#[tokio::test]
async fn unregistered_principal_cannot_post_to_main() {
	let router = router().await;
	let (b, mut b_rx) = connect(&router, 2, "b@x", "bob").await;
	router
		.handle(
			&b,
			ClientAction::JoinRoom {
				room_id: RoomId::MAIN.to_string(),
			},
		)
		.await;

	// Never went through open_session, so never registered.
	let stranger = ctx(9, "z@x", "zed");
	router
		.handle(
			&stranger,
			ClientAction::SendMessage {
				room_id: RoomId::MAIN.to_string(),
				content: "hello?".to_string(),
			},
		)
		.await;
	assert_no_chat(&mut b_rx).await;

	router
		.handle(
			&b,
			ClientAction::SendMessage {
				room_id: RoomId::MAIN.to_string(),
				content: "member speaking".to_string(),
			},
		)
		.await;
	let (_, event) = next_chat(&mut b_rx).await;
	assert_eq!(event.content, "member speaking");
}

#[tokio::test]
async fn refused_subscription_is_fatal() {
	let router = router().await;
	let (a, _a_rx) = connect(&router, 1, "a@x", "alice").await;
	let (_b, _b_rx) = connect(&router, 2, "b@x", "bob").await;
	let (c, _c_rx) = connect(&router, 3, "c@x", "carol").await;

	router
		.handle(
			&a,
			ClientAction::CreateRoom {
				emails: vec!["b@x".to_string()],
			},
		)
		.await;
	let room_id = only_private_room(&router, &a).await;

	let outcome = router.handle(&c, subscribe(&format!("/topic/room/{room_id}"))).await;
	assert!(matches!(
		outcome,
		RouterOutcome::Fatal {
			kind: ErrorKind::AuthzDenied,
			..
		}
	));

	let allowed = router.handle(&a, subscribe(&format!("/topic/room/{room_id}"))).await;
	assert_eq!(
		allowed,
		RouterOutcome::Reply {
			status: 200,
			body: ReplyBody::Empty
		}
	);

	let anonymous = SessionContext {
		session_id: SessionId(7),
		principal: None,
	};
	assert!(matches!(
		router.handle(&anonymous, subscribe(Destination::PUBLIC)).await,
		RouterOutcome::Fatal { .. }
	));
}

#[tokio::test]
async fn invalid_requests_get_error_replies() {
	let router = router().await;
	let (a, _a_rx) = connect(&router, 1, "a@x", "alice").await;

	let outcome = router.handle(&a, ClientAction::CreateRoom { emails: vec![] }).await;
	assert!(matches!(outcome, RouterOutcome::Reply { status: 400, .. }));

	let outcome = router
		.handle(
			&a,
			ClientAction::RemoveRoom {
				room_id: RoomId::MAIN.to_string(),
			},
		)
		.await;
	assert!(matches!(outcome, RouterOutcome::Reply { status: 403, .. }));

	let outcome = router
		.handle(
			&a,
			ClientAction::RemoveRoom {
				room_id: "not a room".to_string(),
			},
		)
		.await;
	assert!(matches!(outcome, RouterOutcome::Reply { status: 403, .. }));

	let outcome = router
		.handle(
			&a,
			ClientAction::CreateRoom {
				emails: vec!["ghost@x".to_string()],
			},
		)
		.await;
	assert!(matches!(outcome, RouterOutcome::Reply { status: 404, .. }));

	let anonymous = SessionContext {
		session_id: SessionId(7),
		principal: None,
	};
	assert_eq!(
		router.handle(&anonymous, ClientAction::ListMyRooms).await,
		text(403, "not authenticated")
	);
}

#[tokio::test]
async fn room_lifecycle_replies() {
	let router = router().await;
	let (a, _a_rx) = connect(&router, 1, "a@x", "alice").await;
	let (_b, _b_rx) = connect(&router, 2, "b@x", "bob").await;
	let (c, mut c_rx) = connect(&router, 3, "c@x", "carol").await;
	router.handle(&c, subscribe(Destination::SERVICE_QUEUE)).await;

	router
		.handle(
			&a,
			ClientAction::CreateRoom {
				emails: vec!["b@x".to_string()],
			},
		)
		.await;
	let room_id = only_private_room(&router, &a).await;

	let added = router
		.handle(
			&a,
			ClientAction::AddMembers {
				room_id: room_id.clone(),
				emails: vec!["c@x".to_string()],
			},
		)
		.await;
	assert_eq!(added, text(200, "Users added to chat"));
	match next_frame(&mut c_rx).await {
		ServerFrame::Deliver { event, .. } => assert_eq!(event.content, CHATS_UPDATE),
		other => panic!("unexpected frame: {other:?}"),
	}

	match router.handle(&a, ClientAction::ListMyRooms).await {
		RouterOutcome::Reply {
			body: ReplyBody::Rooms(rooms),
			..
		} => {
			let mut names = rooms[&room_id].clone();
			names.sort();
			assert_eq!(names, vec!["alice", "bob", "carol"]);
			assert!(rooms.contains_key(RoomId::MAIN));
		}
		other => panic!("unexpected outcome: {other:?}"),
	}

	assert_eq!(
		router.handle(&a, ClientAction::RemoveRoom { room_id }).await,
		text(200, "Chat removed")
	);
	match router.handle(&a, ClientAction::ListMyRooms).await {
		RouterOutcome::Reply {
			body: ReplyBody::Rooms(rooms),
			..
		} => assert_eq!(rooms.keys().collect::<Vec<_>>(), vec![RoomId::MAIN]),
		other => panic!("unexpected outcome: {other:?}"),
	}
}

#[tokio::test]
async fn user_lookups() {
	let router = router().await;
	let (a, _a_rx) = connect(&router, 1, "a@x", "alice").await;
	let (_b, _b_rx) = connect(&router, 2, "b@x", "bob").await;

	match router.handle(&a, ClientAction::FindUser { query: "BO".to_string() }).await {
		RouterOutcome::Reply {
			status: 200,
			body: ReplyBody::Users(users),
		} => {
			assert_eq!(users.len(), 1);
			assert_eq!(users[0].display_name, "bob");
			assert_eq!(users[0].email, "b@x");
		}
		other => panic!("unexpected outcome: {other:?}"),
	}

	match router.handle(&a, ClientAction::ListAllUsers).await {
		RouterOutcome::Reply {
			status: 200,
			body: ReplyBody::UserDirectory(users),
		} => {
			assert_eq!(users.get("alice").map(String::as_str), Some("a@x"));
			assert_eq!(users.get("bob").map(String::as_str), Some("b@x"));
		}
		other => panic!("unexpected outcome: {other:?}"),
	}
}

#[tokio::test]
async fn identify_echoes_on_public_destination() {
	let router = router().await;
	let (a, mut a_rx) = connect(&router, 1, "a@x", "alice").await;
	let (b, _b_rx) = connect(&router, 2, "b@x", "bob").await;
	router.handle(&a, subscribe(Destination::PUBLIC)).await;

	let outcome = router
		.handle(
			&b,
			ClientAction::AddDisplayName {
				display_name: "Bobby".to_string(),
			},
		)
		.await;
	assert_eq!(outcome, RouterOutcome::NoReply);
	match next_frame(&mut a_rx).await {
		ServerFrame::Deliver { destination, event } => {
			assert_eq!(destination, Destination::PUBLIC);
			assert_eq!(event.content, "Bobby");
			assert_eq!(event.kind, EventKind::System);
		}
		other => panic!("unexpected frame: {other:?}"),
	}

	router
		.handle(
			&b,
			ClientAction::AddDisplayName {
				display_name: "   ".to_string(),
			},
		)
		.await;
	match next_frame(&mut a_rx).await {
		ServerFrame::Deliver { event, .. } => assert_eq!(event.content, "unknown"),
		other => panic!("unexpected frame: {other:?}"),
	}
}

#[tokio::test]
async fn publish_failure_is_not_fatal() {
	let router = router_with(Arc::new(FailingBroker)).await;
	let (a, _a_rx) = connect(&router, 1, "a@x", "alice").await;
	let (_b, _b_rx) = connect(&router, 2, "b@x", "bob").await;

	let created = router
		.handle(
			&a,
			ClientAction::CreateRoom {
				emails: vec!["b@x".to_string()],
			},
		)
		.await;
	assert_eq!(created, text(200, "New chat created"));

	let sent = router
		.handle(
			&a,
			ClientAction::SendMessage {
				room_id: RoomId::MAIN.to_string(),
				content: "into the void".to_string(),
			},
		)
		.await;
	assert_eq!(sent, RouterOutcome::NoReply);

	router
		.handle(
			&a,
			ClientAction::JoinRoom {
				room_id: RoomId::MAIN.to_string(),
			},
		)
		.await;
	assert_eq!(router.registry().consumer_count(SessionId(1)).await, 0);
}
