#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::str::FromStr;

use anyhow::{Context, anyhow};
use roomlink_domain::{Email, RoomId, UserId};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use super::store::{DirectoryStore, Room, User};

type UserRow = (String, String, String);

/// `sqlx` SQLite backend.
#[derive(Debug, Clone)]
pub struct SqliteStore {
	pool: SqlitePool,
}

impl SqliteStore {
	pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
		if !database_url.starts_with("sqlite:") {
			return Err(anyhow!("unsupported database_url (expected sqlite:...)"));
		}

		let options = SqliteConnectOptions::from_str(database_url)
			.context("parse sqlite url")?
			.create_if_missing(true)
			.foreign_keys(true);

		// Every connection to an in-memory URL opens its own empty database.
		let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
		let pool_options = if in_memory {
			SqlitePoolOptions::new()
				.max_connections(1)
				.min_connections(1)
				.idle_timeout(None)
				.max_lifetime(None)
		} else {
			SqlitePoolOptions::new().max_connections(max_connections.max(1))
		};

		let pool = pool_options.connect_with(options).await.context("connect sqlite")?;
		sqlx::migrate!("migrations/sqlite")
			.run(&pool)
			.await
			.context("run sqlite migrations")?;

		Ok(Self { pool })
	}

	async fn members_of(&self, room: &str) -> anyhow::Result<BTreeSet<UserId>> {
		let rows: Vec<(String,)> = sqlx::query_as("SELECT user_id FROM room_members WHERE room_id = ?")
			.bind(room)
			.fetch_all(&self.pool)
			.await
			.context("load room members")?;

		rows.into_iter()
			.map(|(id,)| UserId::from_str(&id).map_err(|e| anyhow!("stored user id {id:?}: {e}")))
			.collect()
	}

	async fn room_from_row(&self, (id, name): (String, String)) -> anyhow::Result<Room> {
		let members = self.members_of(&id).await?;
		Ok(Room {
			id: RoomId::new(id).map_err(|e| anyhow!("stored room id: {e}"))?,
			name,
			members,
		})
	}
}

fn user_from_row((id, email, display_name): UserRow) -> anyhow::Result<User> {
	Ok(User {
		id: UserId::from_str(&id).map_err(|e| anyhow!("stored user id {id:?}: {e}"))?,
		email: Email::new(email).map_err(|e| anyhow!("stored email: {e}"))?,
		display_name,
	})
}

fn escape_like(s: &str) -> String {
	let mut out = String::with_capacity(s.len());
	for c in s.chars() {
		if matches!(c, '\\' | '%' | '_') {
			out.push('\\');
		}
		out.push(c);
	}
	out
}

#[async_trait::async_trait]
impl DirectoryStore for SqliteStore {
	async fn user_by_email(&self, email: &Email) -> anyhow::Result<Option<User>> {
		let row: Option<UserRow> = sqlx::query_as("SELECT id, email, display_name FROM users WHERE email = ?")
			.bind(email.as_str())
			.fetch_optional(&self.pool)
			.await
			.context("load user by email")?;
		row.map(user_from_row).transpose()
	}

	async fn user_by_display_name(&self, display_name: &str) -> anyhow::Result<Option<User>> {
		let row: Option<UserRow> = sqlx::query_as("SELECT id, email, display_name FROM users WHERE display_name = ?")
			.bind(display_name)
			.fetch_optional(&self.pool)
			.await
			.context("load user by display name")?;
		row.map(user_from_row).transpose()
	}

	async fn users_by_ids(&self, ids: &BTreeSet<UserId>) -> anyhow::Result<Vec<User>> {
		if ids.is_empty() {
			return Ok(Vec::new());
		}

		let mut qb = QueryBuilder::<Sqlite>::new("SELECT id, email, display_name FROM users WHERE id IN (");
		let mut separated = qb.separated(", ");
		for id in ids {
			separated.push_bind(id.to_string());
		}
		separated.push_unseparated(") ORDER BY rowid");

		let rows: Vec<UserRow> = qb
			.build_query_as()
			.fetch_all(&self.pool)
			.await
			.context("load users by id")?;
		rows.into_iter().map(user_from_row).collect()
	}

	async fn users_with_name_prefix(&self, prefix: &str) -> anyhow::Result<Vec<User>> {
		let pattern = format!("{}%", escape_like(&prefix.to_lowercase()));
		let rows: Vec<UserRow> = sqlx::query_as(
			"SELECT id, email, display_name FROM users WHERE lower(display_name) LIKE ? ESCAPE '\\' ORDER BY rowid",
		)
		.bind(pattern)
		.fetch_all(&self.pool)
		.await
		.context("search users by display name")?;
		rows.into_iter().map(user_from_row).collect()
	}

	async fn all_users(&self) -> anyhow::Result<Vec<User>> {
		let rows: Vec<UserRow> = sqlx::query_as("SELECT id, email, display_name FROM users ORDER BY rowid")
			.fetch_all(&self.pool)
			.await
			.context("load users")?;
		rows.into_iter().map(user_from_row).collect()
	}

	async fn insert_user(&self, user: &User) -> anyhow::Result<()> {
		sqlx::query("INSERT INTO users (id, email, display_name) VALUES (?, ?, ?)")
			.bind(user.id.to_string())
			.bind(user.email.as_str())
			.bind(&user.display_name)
			.execute(&self.pool)
			.await
			.context("insert user")?;
		Ok(())
	}

	async fn room(&self, id: &RoomId) -> anyhow::Result<Option<Room>> {
		let row: Option<(String, String)> = sqlx::query_as("SELECT id, name FROM rooms WHERE id = ?")
			.bind(id.as_str())
			.fetch_optional(&self.pool)
			.await
			.context("load room")?;

		match row {
			Some(row) => Ok(Some(self.room_from_row(row).await?)),
			None => Ok(None),
		}
	}

	async fn rooms_for_user(&self, user: UserId) -> anyhow::Result<Vec<Room>> {
		let rows: Vec<(String, String)> = sqlx::query_as(
			"SELECT r.id, r.name FROM rooms r JOIN room_members m ON m.room_id = r.id WHERE m.user_id = ? ORDER BY r.rowid",
		)
		.bind(user.to_string())
		.fetch_all(&self.pool)
		.await
		.context("load rooms for user")?;

		let mut rooms = Vec::with_capacity(rows.len());
		for row in rows {
			rooms.push(self.room_from_row(row).await?);
		}
		Ok(rooms)
	}

	async fn insert_room(&self, room: &Room) -> anyhow::Result<bool> {
		let mut tx = self.pool.begin().await.context("begin insert room")?;

		let inserted = sqlx::query("INSERT INTO rooms (id, name) VALUES (?, ?) ON CONFLICT(id) DO NOTHING")
			.bind(room.id.as_str())
			.bind(&room.name)
			.execute(&mut *tx)
			.await
			.context("insert room")?
			.rows_affected();
		if inserted == 0 {
			tx.rollback().await.context("rollback insert room")?;
			return Ok(false);
		}

		for member in &room.members {
			sqlx::query("INSERT INTO room_members (room_id, user_id) VALUES (?, ?)")
				.bind(room.id.as_str())
				.bind(member.to_string())
				.execute(&mut *tx)
				.await
				.context("insert room member")?;
		}

		tx.commit().await.context("commit insert room")?;
		Ok(true)
	}

	async fn delete_room(&self, id: &RoomId) -> anyhow::Result<bool> {
		let mut tx = self.pool.begin().await.context("begin delete room")?;

		sqlx::query("DELETE FROM room_members WHERE room_id = ?")
			.bind(id.as_str())
			.execute(&mut *tx)
			.await
			.context("delete room members")?;
		let deleted = sqlx::query("DELETE FROM rooms WHERE id = ?")
			.bind(id.as_str())
			.execute(&mut *tx)
			.await
			.context("delete room")?
			.rows_affected();

		tx.commit().await.context("commit delete room")?;
		Ok(deleted > 0)
	}

	async fn add_member(&self, room: &RoomId, user: UserId) -> anyhow::Result<bool> {
		let inserted = sqlx::query("INSERT INTO room_members (room_id, user_id) VALUES (?, ?) ON CONFLICT DO NOTHING")
			.bind(room.as_str())
			.bind(user.to_string())
			.execute(&self.pool)
			.await
			.context("insert room member")?
			.rows_affected();
		Ok(inserted > 0)
	}
}
