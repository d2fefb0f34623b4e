#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use roomlink_domain::{ChatEvent, SessionId};
use serde::{Deserialize, Serialize};

/// Client → server frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
	/// First frame on every connection.
	Hello {
		version: u32,
		client_name: String,
		#[serde(default)]
		auth_token: Option<String>,
	},

	Request {
		#[serde(default)]
		request_id: String,
		action: ClientAction,
	},
}

/// Inbound client action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientAction {
	SendMessage { room_id: String, content: String },
	AddDisplayName { display_name: String },
	JoinRoom { room_id: String },
	Subscribe { destination: String },
	CreateRoom { emails: Vec<String> },
	RemoveRoom { room_id: String },
	AddMembers { room_id: String, emails: Vec<String> },
	FindUser { query: String },
	ListAllUsers,
	ListMyRooms,
}

impl ClientAction {
	/// Short name for logs and metrics labels.
	pub fn name(&self) -> &'static str {
		match self {
			ClientAction::SendMessage { .. } => "send_message",
			ClientAction::AddDisplayName { .. } => "add_display_name",
			ClientAction::JoinRoom { .. } => "join_room",
			ClientAction::Subscribe { .. } => "subscribe",
			ClientAction::CreateRoom { .. } => "create_room",
			ClientAction::RemoveRoom { .. } => "remove_room",
			ClientAction::AddMembers { .. } => "add_members",
			ClientAction::FindUser { .. } => "find_user",
			ClientAction::ListAllUsers => "list_all_users",
			ClientAction::ListMyRooms => "list_my_rooms",
		}
	}
}

/// Server → client frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
	Welcome {
		version: u32,
		session_id: SessionId,
		principal: Option<String>,
	},

	Reply {
		request_id: String,
		status: u16,
		body: ReplyBody,
	},

	/// Event addressed to a client destination.
	Deliver {
		destination: String,
		event: ChatEvent,
	},

	Error {
		code: String,
		message: String,
		#[serde(default)]
		request_id: String,
	},
}

/// Reply payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ReplyBody {
	Empty,
	Text(String),
	Users(Vec<UserSummary>),
	/// display name → email
	UserDirectory(BTreeMap<String, String>),
	/// room destination key → member display names
	Rooms(BTreeMap<String, Vec<String>>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
	pub display_name: String,
	pub email: String,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn client_request_json_shape() {
		let json = r#"{"type":"request","request_id":"r1","action":{"action":"create_room","emails":["b@x"]}}"#;
		let frame: ClientFrame = serde_json::from_str(json).unwrap();
		assert_eq!(
			frame,
			ClientFrame::Request {
				request_id: "r1".to_string(),
				action: ClientAction::CreateRoom {
					emails: vec!["b@x".to_string()]
				},
			}
		);
	}

	#[test]
	fn unit_actions_parse() {
		let json = r#"{"type":"request","action":{"action":"list_my_rooms"}}"#;
		let frame: ClientFrame = serde_json::from_str(json).unwrap();
		assert!(matches!(
			frame,
			ClientFrame::Request {
				action: ClientAction::ListMyRooms,
				..
			}
		));
	}

	#[test]
	fn hello_token_is_optional() {
		let frame: ClientFrame = serde_json::from_str(r#"{"type":"hello","version":1,"client_name":"cli"}"#).unwrap();
		assert!(matches!(frame, ClientFrame::Hello { auth_token: None, .. }));
	}
}
