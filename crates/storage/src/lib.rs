use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, QueryBuilder, Row, Sqlite,
};

use shared::{
    domain::{
        Channel, ChannelId, ChannelKind, DirectPairKey, DirectThread, Message, MessageId,
        MessageScope, MessageUpdate, Reactions, Role, ServerId, ThreadId, ThreadInsert, UserId,
    },
    error::{ApiException, ErrorCode},
    rules::DELETED_MESSAGE_PLACEHOLDER,
};

const MESSAGE_COLUMNS: &str = "id, channel_id, thread_id, sender_id, content, created_at, updated_at, is_deleted, is_edited, edited_at, parent_message_id";

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        // Every connection to `sqlite::memory:` opens its own database, so an
        // in-memory store must stay on a single long-lived connection.
        let pool_options = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(connect_options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_user(&self, username: &str) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (username, display_name) VALUES (?, ?)
             ON CONFLICT(username) DO UPDATE SET username=excluded.username
             RETURNING id",
        )
        .bind(username)
        .bind(username)
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn set_display_name(&self, user_id: UserId, display_name: &str) -> Result<()> {
        sqlx::query("UPDATE users SET display_name = ? WHERE id = ?")
            .bind(display_name)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Display name per user, falling back to the username.
    pub async fn display_names(&self, user_ids: &[UserId]) -> Result<HashMap<UserId, String>> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT id, COALESCE(display_name, username) FROM users WHERE id IN (",
        );
        let mut ids = query.separated(", ");
        for user_id in user_ids {
            ids.push_bind(user_id.0);
        }
        query.push(")");
        let rows = query.build().fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|r| (UserId(r.get::<i64, _>(0)), r.get::<String, _>(1)))
            .collect())
    }

    pub async fn create_server(&self, name: &str, owner_user_id: UserId) -> Result<ServerId> {
        let rec =
            sqlx::query("INSERT INTO servers (name, owner_user_id) VALUES (?, ?) RETURNING id")
                .bind(name)
                .bind(owner_user_id.0)
                .fetch_one(&self.pool)
                .await?;
        let server_id = ServerId(rec.get::<i64, _>(0));
        self.add_membership(server_id, owner_user_id, Role::Owner)
            .await?;
        Ok(server_id)
    }

    pub async fn add_membership(
        &self,
        server_id: ServerId,
        user_id: UserId,
        role: Role,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO server_members (server_id, user_id, role)
             VALUES (?, ?, ?)
             ON CONFLICT(server_id, user_id) DO UPDATE SET role=excluded.role",
        )
        .bind(server_id.0)
        .bind(user_id.0)
        .bind(role.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn membership_role(
        &self,
        server_id: ServerId,
        user_id: UserId,
    ) -> Result<Option<Role>> {
        let row = sqlx::query("SELECT role FROM server_members WHERE server_id = ? AND user_id = ?")
            .bind(server_id.0)
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| Role::parse_lossy(&r.get::<String, _>(0))))
    }

    pub async fn create_channel(
        &self,
        server_id: ServerId,
        name: &str,
        kind: ChannelKind,
    ) -> Result<ChannelId> {
        let rec = sqlx::query(
            "INSERT INTO channels (server_id, name, kind) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(server_id.0)
        .bind(name)
        .bind(kind.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(ChannelId(rec.get::<i64, _>(0)))
    }

    pub async fn get_channel(&self, channel_id: ChannelId) -> Result<Option<Channel>> {
        let row = sqlx::query("SELECT id, server_id, name, kind FROM channels WHERE id = ?")
            .bind(channel_id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| channel_from_row(&r)).transpose()
    }

    pub async fn list_channels_for_server(&self, server_id: ServerId) -> Result<Vec<Channel>> {
        let rows = sqlx::query(
            "SELECT id, server_id, name, kind FROM channels WHERE server_id = ? ORDER BY id ASC",
        )
        .bind(server_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(channel_from_row).collect()
    }

    pub async fn insert_message(
        &self,
        scope: MessageScope,
        sender_id: UserId,
        content: &str,
        parent_message_id: Option<MessageId>,
    ) -> Result<Message> {
        let now = Utc::now();
        let rec = sqlx::query(
            "INSERT INTO messages (channel_id, thread_id, sender_id, content, created_at, updated_at, parent_message_id)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(scope.channel_id().map(|id| id.0))
        .bind(scope.thread_id().map(|id| id.0))
        .bind(sender_id.0)
        .bind(content)
        .bind(now)
        .bind(now)
        .bind(parent_message_id.map(|id| id.0))
        .fetch_one(&self.pool)
        .await?;
        let message_id = MessageId(rec.get::<i64, _>(0));

        if let MessageScope::Thread(thread_id) = scope {
            self.touch_thread(thread_id, now).await?;
        }

        self.get_message(message_id)
            .await?
            .ok_or_else(|| anyhow!("message {message_id} vanished after insert"))
    }

    pub async fn get_message(&self, message_id: MessageId) -> Result<Option<Message>> {
        let row = sqlx::query(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"))
            .bind(message_id.0)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut message = message_from_row(&row)?;
        message.reactions = self
            .load_reactions(&[message_id])
            .await?
            .remove(&message_id)
            .unwrap_or_default();
        Ok(Some(message))
    }

    /// One page of live messages, newest first.
    pub async fn list_messages(
        &self,
        scope: MessageScope,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Message>> {
        let (column, scope_id) = match scope {
            MessageScope::Channel(id) => ("channel_id", id.0),
            MessageScope::Thread(id) => ("thread_id", id.0),
        };
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE {column} = ? AND is_deleted = 0
             ORDER BY created_at DESC, id DESC
             LIMIT ? OFFSET ?"
        ))
        .bind(scope_id)
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await?;

        let mut messages = rows
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>>>()?;
        let ids = messages.iter().map(|m| m.id).collect::<Vec<_>>();
        let mut reactions = self.load_reactions(&ids).await?;
        for message in &mut messages {
            message.reactions = reactions.remove(&message.id).unwrap_or_default();
        }
        Ok(messages)
    }

    pub async fn update_message(
        &self,
        message_id: MessageId,
        update: &MessageUpdate,
    ) -> Result<Option<Message>> {
        let result = match update {
            MessageUpdate::Edit { content, edited_at } => {
                sqlx::query(
                    "UPDATE messages
                     SET content = ?, is_edited = 1, edited_at = ?, updated_at = ?
                     WHERE id = ? AND is_deleted = 0",
                )
                .bind(content)
                .bind(edited_at)
                .bind(edited_at)
                .bind(message_id.0)
                .execute(&self.pool)
                .await?
            }
            MessageUpdate::SoftDelete { deleted_at } => {
                sqlx::query(
                    "UPDATE messages
                     SET is_deleted = 1, content = ?, updated_at = ?
                     WHERE id = ?",
                )
                .bind(DELETED_MESSAGE_PLACEHOLDER)
                .bind(deleted_at)
                .bind(message_id.0)
                .execute(&self.pool)
                .await?
            }
        };

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_message(message_id).await
    }

    /// Adds the user to the emoji's set, or removes them if already present.
    pub async fn toggle_reaction(
        &self,
        message_id: MessageId,
        user_id: UserId,
        emoji: &str,
    ) -> Result<Option<Message>> {
        let removed = sqlx::query(
            "DELETE FROM message_reactions WHERE message_id = ? AND emoji = ? AND user_id = ?",
        )
        .bind(message_id.0)
        .bind(emoji)
        .bind(user_id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if removed == 0 {
            sqlx::query(
                "INSERT INTO message_reactions (message_id, emoji, user_id) VALUES (?, ?, ?)",
            )
            .bind(message_id.0)
            .bind(emoji)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        }

        sqlx::query("UPDATE messages SET updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(message_id.0)
            .execute(&self.pool)
            .await?;
        self.get_message(message_id).await
    }

    async fn load_reactions(
        &self,
        message_ids: &[MessageId],
    ) -> Result<HashMap<MessageId, Reactions>> {
        if message_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT message_id, emoji, user_id FROM message_reactions WHERE message_id IN (",
        );
        let mut ids = query.separated(", ");
        for message_id in message_ids {
            ids.push_bind(message_id.0);
        }
        query.push(")");
        let rows = query.build().fetch_all(&self.pool).await?;

        let mut reactions: HashMap<MessageId, Reactions> = HashMap::new();
        for row in rows {
            reactions
                .entry(MessageId(row.get::<i64, _>(0)))
                .or_default()
                .entry(row.get::<String, _>(1))
                .or_default()
                .insert(UserId(row.get::<i64, _>(2)));
        }
        Ok(reactions)
    }

    pub async fn touch_thread(&self, thread_id: ThreadId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE dm_threads SET last_message_at = ? WHERE id = ?")
            .bind(at)
            .bind(thread_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn participant_thread_ids(&self, user_id: UserId) -> Result<Vec<ThreadId>> {
        let rows = sqlx::query(
            "SELECT thread_id FROM dm_participants WHERE user_id = ? ORDER BY thread_id ASC",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| ThreadId(r.get::<i64, _>(0)))
            .collect())
    }

    /// Non-group threads among `thread_ids` that also include `user_id`.
    pub async fn threads_with_participant(
        &self,
        thread_ids: &[ThreadId],
        user_id: UserId,
    ) -> Result<Vec<ThreadId>> {
        if thread_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT p.thread_id
             FROM dm_participants p
             INNER JOIN dm_threads t ON t.id = p.thread_id
             WHERE t.is_group = 0 AND p.user_id = ",
        );
        query.push_bind(user_id.0);
        query.push(" AND p.thread_id IN (");
        let mut ids = query.separated(", ");
        for thread_id in thread_ids {
            ids.push_bind(thread_id.0);
        }
        query.push(") ORDER BY p.thread_id ASC");
        let rows = query.build().fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|r| ThreadId(r.get::<i64, _>(0)))
            .collect())
    }

    /// Inserts the one-to-one thread for `pair`, or reports the row another
    /// writer already created for the same pair.
    pub async fn insert_direct_thread(&self, pair: DirectPairKey) -> Result<ThreadInsert> {
        let pair_key = pair.to_string();
        let inserted = sqlx::query(
            "INSERT INTO dm_threads (is_group, pair_key, created_at) VALUES (0, ?, ?)
             ON CONFLICT(pair_key) DO NOTHING
             RETURNING id",
        )
        .bind(&pair_key)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = inserted {
            return Ok(ThreadInsert::Created(ThreadId(row.get::<i64, _>(0))));
        }

        let existing = sqlx::query("SELECT id FROM dm_threads WHERE pair_key = ?")
            .bind(&pair_key)
            .fetch_optional(&self.pool)
            .await?;
        match existing {
            Some(row) => Ok(ThreadInsert::Existing(ThreadId(row.get::<i64, _>(0)))),
            None => Err(ApiException::new(
                ErrorCode::Conflict,
                format!("thread for pair {pair_key} conflicted but could not be loaded"),
            )
            .into()),
        }
    }

    pub async fn insert_participants(&self, thread_id: ThreadId, user_ids: &[UserId]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for user_id in user_ids {
            sqlx::query("INSERT OR IGNORE INTO dm_participants (thread_id, user_id) VALUES (?, ?)")
                .bind(thread_id.0)
                .bind(user_id.0)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn is_thread_participant(&self, thread_id: ThreadId, user_id: UserId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM dm_participants WHERE thread_id = ? AND user_id = ?")
            .bind(thread_id.0)
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn list_threads_for_user(&self, user_id: UserId) -> Result<Vec<DirectThread>> {
        let rows = sqlx::query(
            "SELECT t.id, t.is_group, t.last_message_at, t.created_at
             FROM dm_threads t
             INNER JOIN dm_participants p ON p.thread_id = t.id
             WHERE p.user_id = ?
             ORDER BY t.last_message_at IS NULL, t.last_message_at DESC, t.id DESC",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;

        let mut threads = Vec::with_capacity(rows.len());
        for row in rows {
            let thread_id = ThreadId(row.get::<i64, _>(0));
            let participants = sqlx::query(
                "SELECT user_id FROM dm_participants WHERE thread_id = ? ORDER BY user_id ASC",
            )
            .bind(thread_id.0)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|r| UserId(r.get::<i64, _>(0)))
            .collect();
            threads.push(DirectThread {
                id: thread_id,
                is_group: row.get::<bool, _>(1),
                participants,
                last_message_at: row.get::<Option<DateTime<Utc>>, _>(2),
                created_at: row.get::<DateTime<Utc>, _>(3),
            });
        }
        Ok(threads)
    }
}

fn channel_from_row(row: &SqliteRow) -> Result<Channel> {
    let kind = row
        .get::<String, _>(3)
        .parse::<ChannelKind>()
        .map_err(|e| anyhow!(e))?;
    Ok(Channel {
        id: ChannelId(row.get::<i64, _>(0)),
        server_id: ServerId(row.get::<i64, _>(1)),
        name: row.get::<String, _>(2),
        kind,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<Message> {
    let scope = match (
        row.get::<Option<i64>, _>("channel_id"),
        row.get::<Option<i64>, _>("thread_id"),
    ) {
        (Some(channel_id), None) => MessageScope::Channel(ChannelId(channel_id)),
        (None, Some(thread_id)) => MessageScope::Thread(ThreadId(thread_id)),
        _ => {
            return Err(anyhow!(
                "message {} has no single scope",
                row.get::<i64, _>("id")
            ))
        }
    };
    Ok(Message {
        id: MessageId(row.get::<i64, _>("id")),
        scope,
        sender_id: UserId(row.get::<i64, _>("sender_id")),
        content: row.get::<String, _>("content"),
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
        updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
        is_deleted: row.get::<bool, _>("is_deleted"),
        is_edited: row.get::<bool, _>("is_edited"),
        edited_at: row.get::<Option<DateTime<Utc>>, _>("edited_at"),
        parent_message_id: row
            .get::<Option<i64>, _>("parent_message_id")
            .map(MessageId),
        reactions: Reactions::new(),
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create sqlite parent directory '{}' for '{database_url}'",
            parent.display()
        )
    })?;
    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.contains(":memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
