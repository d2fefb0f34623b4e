#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
	#[error("unknown event kind: {0}")]
	UnknownKind(String),
}

/// Room identifier. Doubles as the broker topic key and the client path segment.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomId(String);

impl RoomId {
	/// Id of the reserved system-wide room.
	pub const MAIN: &'static str = "main";

	/// Create a `RoomId`; rejects empty values and values containing `/` or whitespace.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		if id.contains('/') || id.chars().any(char::is_whitespace) {
			return Err(ParseIdError::InvalidFormat(format!("room id must be a single path segment: {id:?}")));
		}
		Ok(Self(id))
	}

	/// Fresh random id (32 lowercase hex chars).
	pub fn generate() -> Self {
		Self(uuid::Uuid::new_v4().simple().to_string())
	}

	pub fn main() -> Self {
		Self(Self::MAIN.to_string())
	}

	pub fn is_main(&self) -> bool {
		self.0 == Self::MAIN
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for RoomId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for RoomId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		RoomId::new(s.trim().to_string())
	}
}

impl TryFrom<String> for RoomId {
	type Error = ParseIdError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		RoomId::new(value)
	}
}

impl From<RoomId> for String {
	fn from(value: RoomId) -> Self {
		value.0
	}
}

/// Stable user identity. Member sets are compared on this, never on email strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub uuid::Uuid);

impl UserId {
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for UserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		uuid::Uuid::parse_str(s.trim())
			.map(Self)
			.map_err(|e| ParseIdError::InvalidFormat(e.to_string()))
	}
}

/// Email address used as the authentication key of a user.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Email(String);

impl Email {
	pub fn new(email: impl Into<String>) -> Result<Self, ParseIdError> {
		let email = email.into().trim().to_string();
		if email.is_empty() {
			return Err(ParseIdError::Empty);
		}
		match email.split_once('@') {
			Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(Self(email)),
			_ => Err(ParseIdError::InvalidFormat(format!("expected local@domain, got {email:?}"))),
		}
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// Part before `@`, used as a fallback display name.
	pub fn local_part(&self) -> &str {
		self.0.split_once('@').map(|(local, _)| local).unwrap_or(&self.0)
	}
}

impl fmt::Display for Email {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for Email {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Email::new(s)
	}
}

impl TryFrom<String> for Email {
	type Error = ParseIdError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		Email::new(value)
	}
}

impl From<Email> for String {
	fn from(value: Email) -> Self {
		value.0
	}
}

/// Live connection identifier assigned by the accept loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "session-{}", self.0)
	}
}

/// Per-event correlation token: 32 lowercase hex chars, never contains `-`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationToken(String);

impl CorrelationToken {
	pub fn generate() -> Self {
		Self(uuid::Uuid::new_v4().simple().to_string())
	}

	/// Wrap a token read back from the wire.
	pub fn from_wire(token: impl Into<String>) -> Self {
		Self(token.into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for CorrelationToken {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Kind of a chat event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
	Chat,
	System,
}

impl EventKind {
	/// Stable wire identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			EventKind::Chat => "CHAT",
			EventKind::System => "SYSTEM",
		}
	}
}

impl fmt::Display for EventKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for EventKind {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"CHAT" => Ok(EventKind::Chat),
			"SYSTEM" => Ok(EventKind::System),
			"" => Err(ParseIdError::Empty),
			other => Err(ParseIdError::UnknownKind(other.to_string())),
		}
	}
}

/// Sender identity used on broker-side system events.
pub const SYSTEM_SENDER: &str = "System";

/// Sender identity used on private-queue notices.
pub const NOTICE_SENDER: &str = "system";

/// Content of the notice telling a user their room list changed.
pub const CHATS_UPDATE: &str = "CHATS_UPDATE";

/// Chat event as carried through the broker and delivered to sessions.
///
/// `room_id` stays a plain string: private-queue notices use the pseudo room `service`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEvent {
	pub room_id: String,
	pub kind: EventKind,
	pub content: String,
	pub sender_email: String,
	pub sender_name: String,
	pub correlation: CorrelationToken,
}

impl ChatEvent {
	/// User-authored chat message with a fresh correlation token.
	pub fn chat(room: &RoomId, content: impl Into<String>, sender_email: &Email, sender_name: impl Into<String>) -> Self {
		Self {
			room_id: room.as_str().to_string(),
			kind: EventKind::Chat,
			content: content.into(),
			sender_email: sender_email.as_str().to_string(),
			sender_name: sender_name.into(),
			correlation: CorrelationToken::generate(),
		}
	}

	/// System event published on a room topic.
	pub fn system(room: &RoomId, content: impl Into<String>) -> Self {
		Self {
			room_id: room.as_str().to_string(),
			kind: EventKind::System,
			content: content.into(),
			sender_email: SYSTEM_SENDER.to_string(),
			sender_name: SYSTEM_SENDER.to_string(),
			correlation: CorrelationToken::generate(),
		}
	}

	/// `CHATS_UPDATE` notice for a user's private queue.
	pub fn chats_update() -> Self {
		Self {
			room_id: "service".to_string(),
			kind: EventKind::System,
			content: CHATS_UPDATE.to_string(),
			sender_email: NOTICE_SENDER.to_string(),
			sender_name: NOTICE_SENDER.to_string(),
			correlation: CorrelationToken::generate(),
		}
	}
}

/// Client-facing subscription destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
	/// Broadcast path for announcements.
	Public,
	/// The principal's private notice queue.
	ServiceQueue,
	/// Per-room delivery path.
	Room(RoomId),
}

impl Destination {
	pub const PUBLIC: &'static str = "/topic/public";
	pub const SERVICE_QUEUE: &'static str = "/user/queue/service";
	pub const ROOM_PREFIX: &'static str = "/topic/room/";

	pub fn room(room: &RoomId) -> Self {
		Self::Room(room.clone())
	}

	/// Parse a client destination path.
	pub fn parse(s: &str) -> Result<Self, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		match s {
			Self::PUBLIC => Ok(Self::Public),
			Self::SERVICE_QUEUE => Ok(Self::ServiceQueue),
			_ => {
				let rest = s
					.strip_prefix(Self::ROOM_PREFIX)
					.ok_or_else(|| ParseIdError::InvalidFormat(format!("unknown destination: {s}")))?;
				Ok(Self::Room(RoomId::new(rest.to_string())?))
			}
		}
	}
}

impl fmt::Display for Destination {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Destination::Public => f.write_str(Self::PUBLIC),
			Destination::ServiceQueue => f.write_str(Self::SERVICE_QUEUE),
			Destination::Room(room) => write!(f, "{}{}", Self::ROOM_PREFIX, room),
		}
	}
}

impl FromStr for Destination {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Destination::parse(s)
	}
}

/// Error taxonomy shared by every component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
	AuthzDenied,
	NotFound,
	Conflict,
	InvalidRequest,
	MalformedPayload,
	BrokerUnavailable,
	Internal,
}

impl ErrorKind {
	/// Stable error code written into error frames.
	pub const fn as_code(self) -> &'static str {
		match self {
			ErrorKind::AuthzDenied => "AUTHZ_DENIED",
			ErrorKind::NotFound => "NOT_FOUND",
			ErrorKind::Conflict => "CONFLICT",
			ErrorKind::InvalidRequest => "INVALID_REQUEST",
			ErrorKind::MalformedPayload => "MALFORMED_PAYLOAD",
			ErrorKind::BrokerUnavailable => "BROKER_UNAVAILABLE",
			ErrorKind::Internal => "INTERNAL",
		}
	}

	/// HTTP-style status carried in replies.
	pub const fn status(self) -> u16 {
		match self {
			ErrorKind::AuthzDenied => 403,
			ErrorKind::NotFound => 404,
			ErrorKind::Conflict => 409,
			ErrorKind::InvalidRequest | ErrorKind::MalformedPayload => 400,
			ErrorKind::BrokerUnavailable => 503,
			ErrorKind::Internal => 500,
		}
	}
}

impl fmt::Display for ErrorKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_code())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn room_id_rules() {
		assert!(RoomId::new("").is_err());
		assert!(RoomId::new("a/b").is_err());
		assert!(RoomId::new("a b").is_err());
		assert!(RoomId::main().is_main());

		let generated = RoomId::generate();
		assert_eq!(generated.as_str().len(), 32);
		assert!(!generated.as_str().contains('-'));
	}

	#[test]
	fn email_parse() {
		let e: Email = " a@x ".parse().unwrap();
		assert_eq!(e.as_str(), "a@x");
		assert_eq!(e.local_part(), "a");
		assert!(Email::new("nope").is_err());
		assert!(Email::new("@x").is_err());
	}

	#[test]
	fn correlation_tokens_are_dashless_hex() {
		let t = CorrelationToken::generate();
		assert_eq!(t.as_str().len(), 32);
		assert!(t.as_str().chars().all(|c| c.is_ascii_hexdigit()));
		assert_ne!(t, CorrelationToken::generate());
	}

	#[test]
	fn destination_parse_roundtrip() {
		assert_eq!(Destination::parse("/topic/public").unwrap(), Destination::Public);
		assert_eq!(Destination::parse("/user/queue/service").unwrap(), Destination::ServiceQueue);

		let d = Destination::parse("/topic/room/main").unwrap();
		assert_eq!(d, Destination::Room(RoomId::main()));
		assert_eq!(d.to_string(), "/topic/room/main");

		assert!(Destination::parse("/topic/room/").is_err());
		assert!(Destination::parse("/queue/other").is_err());
	}

	#[test]
	fn event_kind_wire_names() {
		assert_eq!("CHAT".parse::<EventKind>().unwrap(), EventKind::Chat);
		assert_eq!(EventKind::System.to_string(), "SYSTEM");
		assert!(matches!("JOIN".parse::<EventKind>(), Err(ParseIdError::UnknownKind(_))));
	}
}
