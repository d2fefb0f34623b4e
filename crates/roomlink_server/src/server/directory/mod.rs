#![forbid(unsafe_code)]

//! Room and user membership: creation, dedup, removal, add-members and the
//! membership predicate every authorization decision goes through.

pub mod memory;
pub mod sqlite;
pub mod store;

use std::collections::BTreeSet;
use std::sync::Arc;

use roomlink_domain::{ChatEvent, Destination, Email, ErrorKind, RoomId, UserId};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use store::{DirectoryStore, Room, User};

/// Content of the system event announcing a new room on its topic.
pub const NEW_ROOM_ANNOUNCEMENT: &str = "NEW CHAT CREATED";

/// Content of the system event published when `main` is created.
pub const MAIN_ROOM_ANNOUNCEMENT: &str = "Main chat initialized";

#[derive(Debug, Error)]
pub enum DirectoryError {
	#[error("member list is empty")]
	EmptyMemberList,

	#[error("a room needs at least one member besides the requester")]
	SelfChat,

	#[error("unknown user: {0}")]
	UnknownUser(String),

	#[error("requester {0} is not registered")]
	UnknownRequester(Email),

	#[error("a room with the same members already exists: {0}")]
	AlreadyExists(RoomId),

	#[error("room {0} is protected")]
	Protected(RoomId),

	#[error("not allowed to manipulate room {0}")]
	Forbidden(String),

	#[error("display name {0:?} is already taken")]
	DisplayNameTaken(String),

	#[error(transparent)]
	Store(#[from] anyhow::Error),
}

impl DirectoryError {
	pub fn kind(&self) -> ErrorKind {
		match self {
			DirectoryError::EmptyMemberList | DirectoryError::SelfChat => ErrorKind::InvalidRequest,
			DirectoryError::UnknownUser(_) => ErrorKind::NotFound,
			DirectoryError::AlreadyExists(_) | DirectoryError::DisplayNameTaken(_) => ErrorKind::Conflict,
			DirectoryError::UnknownRequester(_) | DirectoryError::Protected(_) | DirectoryError::Forbidden(_) => {
				ErrorKind::AuthzDenied
			}
			DirectoryError::Store(_) => ErrorKind::Internal,
		}
	}
}

/// Result of a successful room creation.
#[derive(Debug, Clone)]
pub struct CreatedRoom {
	pub room: Room,
	/// Every member, requester included; each gets a `CHATS_UPDATE` notice.
	pub members: Vec<Email>,
	/// System event to publish on the new room's topic.
	pub announcement: ChatEvent,
}

/// Room membership as listed to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomListing {
	pub room: RoomId,
	pub member_names: Vec<String>,
}

pub struct RoomDirectory {
	store: Arc<dyn DirectoryStore>,
	/// Serializes read-check-write sequences inside this process.
	write_lock: Mutex<()>,
}

impl RoomDirectory {
	pub fn new(store: Arc<dyn DirectoryStore>) -> Self {
		Self {
			store,
			write_lock: Mutex::new(()),
		}
	}

	/// Create `main` if absent. Returns the announcement to publish when it was created.
	pub async fn init_main_room(&self) -> Result<Option<ChatEvent>, DirectoryError> {
		let _guard = self.write_lock.lock().await;

		let main = RoomId::main();
		let room = Room {
			id: main.clone(),
			name: main.as_str().to_string(),
			members: BTreeSet::new(),
		};
		if !self.store.insert_room(&room).await? {
			debug!("directory: main room already present");
			return Ok(None);
		}

		info!("directory: main room created");
		Ok(Some(ChatEvent::system(&main, MAIN_ROOM_ANNOUNCEMENT)))
	}

	/// Register a first-time principal and add them to `main`; returns the stored user.
	pub async fn ensure_user(&self, email: &Email, display_name: &str) -> Result<User, DirectoryError> {
		let _guard = self.write_lock.lock().await;

		if let Some(existing) = self.store.user_by_email(email).await? {
			return Ok(existing);
		}

		let display_name = match display_name.trim() {
			"" => email.local_part(),
			name => name,
		};
		if self.store.user_by_display_name(display_name).await?.is_some() {
			return Err(DirectoryError::DisplayNameTaken(display_name.to_string()));
		}

		let user = User {
			id: UserId::new_v4(),
			email: email.clone(),
			display_name: display_name.to_string(),
		};
		self.store.insert_user(&user).await?;

		let main = RoomId::main();
		if self.store.room(&main).await?.is_some() {
			self.store.add_member(&main, user.id).await?;
		} else {
			warn!(email = %email, "directory: main room missing; new user not added to it");
		}

		info!(email = %email, display_name = %user.display_name, "directory: registered user");
		Ok(user)
	}

	pub async fn user(&self, email: &Email) -> Result<Option<User>, DirectoryError> {
		Ok(self.store.user_by_email(email).await?)
	}

	/// Exact match on a room's path segment; a full `/topic/room/<id>` destination is accepted too.
	pub async fn find_room_by_session_key(&self, key: &str) -> Result<Option<Room>, DirectoryError> {
		let Some(id) = parse_room_key(key) else {
			return Ok(None);
		};
		Ok(self.store.room(&id).await?)
	}

	pub async fn rooms_for_user(&self, email: &Email) -> Result<Vec<Room>, DirectoryError> {
		let Some(user) = self.store.user_by_email(email).await? else {
			return Ok(Vec::new());
		};
		Ok(self.store.rooms_for_user(user.id).await?)
	}

	/// True iff `principal` resolves to a member of the room named by `key`. Always read from the store.
	pub async fn check_membership(&self, principal: Option<&Email>, key: &str) -> Result<bool, DirectoryError> {
		let Some(email) = principal else {
			return Ok(false);
		};
		let Some(user) = self.store.user_by_email(email).await? else {
			return Ok(false);
		};
		let Some(room) = self.find_room_by_session_key(key).await? else {
			return Ok(false);
		};
		Ok(room.has_member(user.id))
	}

	pub async fn create_room(&self, requester: &Email, member_emails: &[String]) -> Result<CreatedRoom, DirectoryError> {
		if member_emails.is_empty() {
			return Err(DirectoryError::EmptyMemberList);
		}

		let _guard = self.write_lock.lock().await;

		let requester = self.requester(requester).await?;
		let resolved = self.resolve_users(member_emails).await?;

		let mut members: BTreeSet<UserId> = resolved.iter().map(|u| u.id).collect();
		members.insert(requester.id);
		if members.len() == 1 {
			return Err(DirectoryError::SelfChat);
		}

		if let Some(existing) = self.duplicate_of(requester.id, &members, None).await? {
			return Err(DirectoryError::AlreadyExists(existing));
		}

		let id = RoomId::generate();
		let room = Room {
			id: id.clone(),
			name: id.as_str().to_string(),
			members,
		};
		if !self.store.insert_room(&room).await? {
			return Err(DirectoryError::Store(anyhow::anyhow!("generated room id {id} collided")));
		}

		let mut seen = BTreeSet::from([requester.id]);
		let mut notify = vec![requester.email.clone()];
		for user in resolved {
			if seen.insert(user.id) {
				notify.push(user.email);
			}
		}

		info!(room = %id, requester = %requester.email, members = room.members.len(), "directory: room created");
		Ok(CreatedRoom {
			announcement: ChatEvent::system(&id, NEW_ROOM_ANNOUNCEMENT),
			members: notify,
			room,
		})
	}

	pub async fn remove_room(&self, requester: &Email, room_id: &RoomId) -> Result<Room, DirectoryError> {
		if room_id.is_main() {
			return Err(DirectoryError::Protected(room_id.clone()));
		}

		let _guard = self.write_lock.lock().await;

		let room = self.owned_room(requester, room_id).await?;
		self.store.delete_room(room_id).await?;

		info!(room = %room_id, requester = %requester, "directory: room removed");
		Ok(room)
	}

	/// Add users to a room the requester belongs to; returns the emails that became members.
	pub async fn add_members(
		&self,
		requester: &Email,
		room_id: &RoomId,
		emails: &[String],
	) -> Result<Vec<Email>, DirectoryError> {
		if room_id.is_main() {
			return Err(DirectoryError::Protected(room_id.clone()));
		}

		let _guard = self.write_lock.lock().await;

		let room = self.owned_room(requester, room_id).await?;
		let resolved = self.resolve_users(emails).await?;

		let fresh: Vec<User> = resolved.into_iter().filter(|u| !room.has_member(u.id)).collect();
		if fresh.is_empty() {
			return Ok(Vec::new());
		}

		let mut members = room.members.clone();
		members.extend(fresh.iter().map(|u| u.id));

		let requester = self.requester(requester).await?;
		if let Some(existing) = self.duplicate_of(requester.id, &members, Some(room_id)).await? {
			return Err(DirectoryError::AlreadyExists(existing));
		}

		let mut added = Vec::with_capacity(fresh.len());
		for user in fresh {
			if self.store.add_member(room_id, user.id).await? {
				added.push(user.email);
			}
		}

		info!(room = %room_id, added = added.len(), "directory: members added");
		Ok(added)
	}

	pub async fn find_users(&self, prefix: &str) -> Result<Vec<User>, DirectoryError> {
		Ok(self.store.users_with_name_prefix(prefix.trim()).await?)
	}

	pub async fn all_users(&self) -> Result<Vec<User>, DirectoryError> {
		Ok(self.store.all_users().await?)
	}

	/// Rooms the principal can access, with member display names.
	pub async fn accessible_rooms(&self, email: &Email) -> Result<Vec<RoomListing>, DirectoryError> {
		let rooms = self.rooms_for_user(email).await?;

		let mut listings = Vec::with_capacity(rooms.len());
		for room in rooms {
			let member_names = self
				.store
				.users_by_ids(&room.members)
				.await?
				.into_iter()
				.map(|u| u.display_name)
				.collect();
			listings.push(RoomListing {
				room: room.id,
				member_names,
			});
		}
		Ok(listings)
	}

	async fn requester(&self, email: &Email) -> Result<User, DirectoryError> {
		self.store
			.user_by_email(email)
			.await?
			.ok_or_else(|| DirectoryError::UnknownRequester(email.clone()))
	}

	/// Resolve every email or fail on the first unknown one.
	async fn resolve_users(&self, emails: &[String]) -> Result<Vec<User>, DirectoryError> {
		let mut users = Vec::with_capacity(emails.len());
		for raw in emails {
			let email = Email::new(raw.as_str()).map_err(|_| DirectoryError::UnknownUser(raw.clone()))?;
			let user = self
				.store
				.user_by_email(&email)
				.await?
				.ok_or_else(|| DirectoryError::UnknownUser(raw.clone()))?;
			users.push(user);
		}
		Ok(users)
	}

	/// Load a room only if `requester` is a member of it.
	async fn owned_room(&self, requester: &Email, room_id: &RoomId) -> Result<Room, DirectoryError> {
		let forbidden = || DirectoryError::Forbidden(room_id.to_string());

		let user = self.store.user_by_email(requester).await?.ok_or_else(forbidden)?;
		let room = self.store.room(room_id).await?.ok_or_else(forbidden)?;
		if !room.has_member(user.id) {
			return Err(forbidden());
		}
		Ok(room)
	}

	/// First room of `user` (other than `main` and `except`) whose member set equals `members`.
	async fn duplicate_of(
		&self,
		user: UserId,
		members: &BTreeSet<UserId>,
		except: Option<&RoomId>,
	) -> Result<Option<RoomId>, DirectoryError> {
		let rooms = self.store.rooms_for_user(user).await?;
		Ok(rooms
			.into_iter()
			.filter(|r| !r.id.is_main() && Some(&r.id) != except)
			.find(|r| &r.members == members)
			.map(|r| r.id))
	}
}

/// Room id named by a path segment or a full room destination.
pub fn parse_room_key(key: &str) -> Option<RoomId> {
	let key = key.trim();
	let segment = key.strip_prefix(Destination::ROOM_PREFIX).unwrap_or(key);
	RoomId::new(segment.to_string()).ok()
}
