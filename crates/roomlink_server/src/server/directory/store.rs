#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use roomlink_domain::{Email, RoomId, UserId};

/// Registered user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
	pub id: UserId,
	pub email: Email,
	pub display_name: String,
}

/// Room with its member ids; both sides of the membership relation come from one row set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
	pub id: RoomId,
	pub name: String,
	pub members: BTreeSet<UserId>,
}

impl Room {
	pub fn has_member(&self, user: UserId) -> bool {
		self.members.contains(&user)
	}
}

/// Persistent Room/User records. Every method is a single read or a single atomic write.
#[async_trait::async_trait]
pub trait DirectoryStore: Send + Sync {
	async fn user_by_email(&self, email: &Email) -> anyhow::Result<Option<User>>;

	async fn user_by_display_name(&self, display_name: &str) -> anyhow::Result<Option<User>>;

	/// Users for `ids`; unknown ids are skipped.
	async fn users_by_ids(&self, ids: &BTreeSet<UserId>) -> anyhow::Result<Vec<User>>;

	/// Case-insensitive display-name prefix match.
	async fn users_with_name_prefix(&self, prefix: &str) -> anyhow::Result<Vec<User>>;

	async fn all_users(&self) -> anyhow::Result<Vec<User>>;

	async fn insert_user(&self, user: &User) -> anyhow::Result<()>;

	async fn room(&self, id: &RoomId) -> anyhow::Result<Option<Room>>;

	/// Rooms `user` belongs to, oldest first.
	async fn rooms_for_user(&self, user: UserId) -> anyhow::Result<Vec<Room>>;

	/// Insert `room` with its memberships; `false` if the id is already taken.
	async fn insert_room(&self, room: &Room) -> anyhow::Result<bool>;

	/// Delete a room and every membership row pointing at it; `false` if absent.
	async fn delete_room(&self, id: &RoomId) -> anyhow::Result<bool>;

	/// Add one membership; `false` if it already existed.
	async fn add_member(&self, room: &RoomId, user: UserId) -> anyhow::Result<bool>;
}
