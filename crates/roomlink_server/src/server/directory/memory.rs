#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use roomlink_domain::{Email, RoomId, UserId};
use tokio::sync::RwLock;

use super::store::{DirectoryStore, Room, User};

/// In-process store for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
	inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
	users: Vec<User>,
	/// Creation order.
	rooms: Vec<Room>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait::async_trait]
impl DirectoryStore for MemoryStore {
	async fn user_by_email(&self, email: &Email) -> anyhow::Result<Option<User>> {
		let inner = self.inner.read().await;
		Ok(inner.users.iter().find(|u| &u.email == email).cloned())
	}

	async fn user_by_display_name(&self, display_name: &str) -> anyhow::Result<Option<User>> {
		let inner = self.inner.read().await;
		Ok(inner.users.iter().find(|u| u.display_name == display_name).cloned())
	}

	async fn users_by_ids(&self, ids: &BTreeSet<UserId>) -> anyhow::Result<Vec<User>> {
		let inner = self.inner.read().await;
		Ok(inner.users.iter().filter(|u| ids.contains(&u.id)).cloned().collect())
	}

	async fn users_with_name_prefix(&self, prefix: &str) -> anyhow::Result<Vec<User>> {
		let prefix = prefix.to_lowercase();
		let inner = self.inner.read().await;
		Ok(inner
			.users
			.iter()
			.filter(|u| u.display_name.to_lowercase().starts_with(&prefix))
			.cloned()
			.collect())
	}

	async fn all_users(&self) -> anyhow::Result<Vec<User>> {
		Ok(self.inner.read().await.users.clone())
	}

	async fn insert_user(&self, user: &User) -> anyhow::Result<()> {
		let mut inner = self.inner.write().await;
		if inner
			.users
			.iter()
			.any(|u| u.id == user.id || u.email == user.email || u.display_name == user.display_name)
		{
			anyhow::bail!("user {} violates a uniqueness constraint", user.email);
		}
		inner.users.push(user.clone());
		Ok(())
	}

	async fn room(&self, id: &RoomId) -> anyhow::Result<Option<Room>> {
		let inner = self.inner.read().await;
		Ok(inner.rooms.iter().find(|r| &r.id == id).cloned())
	}

	async fn rooms_for_user(&self, user: UserId) -> anyhow::Result<Vec<Room>> {
		let inner = self.inner.read().await;
		Ok(inner.rooms.iter().filter(|r| r.has_member(user)).cloned().collect())
	}

	async fn insert_room(&self, room: &Room) -> anyhow::Result<bool> {
		let mut inner = self.inner.write().await;
		if inner.rooms.iter().any(|r| r.id == room.id) {
			return Ok(false);
		}
		inner.rooms.push(room.clone());
		Ok(true)
	}

	async fn delete_room(&self, id: &RoomId) -> anyhow::Result<bool> {
		let mut inner = self.inner.write().await;
		let before = inner.rooms.len();
		inner.rooms.retain(|r| &r.id != id);
		Ok(inner.rooms.len() != before)
	}

	async fn add_member(&self, room: &RoomId, user: UserId) -> anyhow::Result<bool> {
		let mut inner = self.inner.write().await;
		let Some(target) = inner.rooms.iter_mut().find(|r| &r.id == room) else {
			anyhow::bail!("room {room} does not exist");
		};
		Ok(target.members.insert(user))
	}
}
