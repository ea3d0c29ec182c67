use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::Row;
use std::str::FromStr;

use crate::core::{EntryId, FlagType, Role, ShoutTime, TopicId, UserId};
use crate::error::{AppError, AppResult};
use crate::models::{Author, Entry, NewEntry, Topic, UserInfo};

// Async shoutbox database over a SQLx SQLite pool
pub struct ShoutDatabase {
    pub pool: SqlitePool, // Public for the query modules in `services`
}

impl ShoutDatabase {
    pub async fn new(database_url: &str) -> AppResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| {
                AppError::ConfigurationError(format!("Invalid DATABASE_URL '{}': {}", database_url, e))
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to connect to {}: {}", database_url, e)))?;

        Ok(Self { pool })
    }

    /// Single-connection in-memory database for tests
    pub async fn new_in_memory() -> AppResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| AppError::DatabaseError(e.to_string()))?
            .foreign_keys(true);

        // Every connection to :memory: is a separate database, so keep exactly one alive.
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| {
                AppError::DatabaseError(format!("Failed to connect to in-memory SQLite: {}", e))
            })?;

        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    /// Create the shoutbox tables; safe to run on every startup
    pub async fn init(&self) -> AppResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                ext_id TEXT NOT NULL UNIQUE,
                email TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                role TEXT NOT NULL DEFAULT 'member',
                created INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS authors (
                id INTEGER PRIMARY KEY,
                user_id INTEGER NOT NULL UNIQUE REFERENCES users(id),
                name TEXT NOT NULL,
                picture TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS topics (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL DEFAULT '',
                locked INTEGER NOT NULL DEFAULT 0
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS entries (
                id INTEGER PRIMARY KEY,
                ts INTEGER NOT NULL,
                author_id INTEGER NOT NULL REFERENCES users(id),
                topic_id INTEGER REFERENCES topics(id),
                text TEXT NOT NULL DEFAULT '',
                image TEXT,
                hidden INTEGER NOT NULL DEFAULT 0
            )",
        )
        .execute(&self.pool)
        .await?;

        // One marker of each type per (user, entry); toggles are upserts against this.
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS entry_flags (
                id INTEGER PRIMARY KEY,
                user_id INTEGER NOT NULL REFERENCES users(id),
                entry_id INTEGER NOT NULL REFERENCES entries(id),
                flag_type TEXT NOT NULL CHECK (flag_type IN ('like', 'flag')),
                created INTEGER NOT NULL,
                UNIQUE(user_id, entry_id, flag_type)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_entries_topic_visible ON entries(topic_id, hidden, ts DESC, id DESC)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_entry_flags_entry ON entry_flags(entry_id, flag_type)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ---- users & authors ----

    pub async fn find_user_by_ext_id(&self, ext_id: &str) -> AppResult<Option<UserInfo>> {
        let row = sqlx::query("SELECT id, ext_id, email, enabled, role FROM users WHERE ext_id = ?")
            .bind(ext_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    pub async fn get_user(&self, id: UserId) -> AppResult<Option<UserInfo>> {
        let row = sqlx::query("SELECT id, ext_id, email, enabled, role FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    /// Create a user and its author profile in one transaction.
    /// A concurrent creation for the same `ext_id` resolves to the existing rows.
    pub async fn create_user_with_author(
        &self,
        ext_id: &str,
        email: &str,
        name: &str,
        picture: Option<&str>,
        role: Role,
    ) -> AppResult<(UserInfo, Author)> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO users (ext_id, email, enabled, role, created) VALUES (?, ?, 1, ?, ?)
             ON CONFLICT(ext_id) DO NOTHING",
        )
        .bind(ext_id)
        .bind(email)
        .bind(role.as_str())
        .bind(ShoutTime::now())
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query("SELECT id, ext_id, email, enabled, role FROM users WHERE ext_id = ?")
            .bind(ext_id)
            .fetch_one(&mut *tx)
            .await?;
        let user = user_from_row(&row)?;

        sqlx::query(
            "INSERT INTO authors (user_id, name, picture) VALUES (?, ?, ?)
             ON CONFLICT(user_id) DO NOTHING",
        )
        .bind(user.id)
        .bind(name)
        .bind(picture)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query("SELECT id, user_id, name, picture FROM authors WHERE user_id = ?")
            .bind(user.id)
            .fetch_one(&mut *tx)
            .await?;
        let author = author_from_row(&row)?;

        tx.commit().await?;
        Ok((user, author))
    }

    pub async fn get_author_for_user(&self, user_id: UserId) -> AppResult<Option<Author>> {
        let row = sqlx::query("SELECT id, user_id, name, picture FROM authors WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(author_from_row).transpose()
    }

    pub async fn update_author_profile(
        &self,
        user_id: UserId,
        name: &str,
        picture: Option<&str>,
    ) -> AppResult<bool> {
        let result = sqlx::query("UPDATE authors SET name = ?, picture = ? WHERE user_id = ?")
            .bind(name)
            .bind(picture)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_user_role(&self, user_id: UserId, role: Role) -> AppResult<bool> {
        let result = sqlx::query("UPDATE users SET role = ? WHERE id = ?")
            .bind(role.as_str())
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Returns false when the user does not exist
    pub async fn set_user_enabled(&self, user_id: UserId, enabled: bool) -> AppResult<bool> {
        let result = sqlx::query("UPDATE users SET enabled = ? WHERE id = ?")
            .bind(enabled)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ---- topics ----

    pub async fn find_topic_by_name(&self, name: &str) -> AppResult<Option<Topic>> {
        let row = sqlx::query("SELECT id, name, description, locked FROM topics WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(topic_from_row).transpose()
    }

    /// Returns true when this call created the topic
    pub async fn insert_topic_if_absent(&self, name: &str, description: &str) -> AppResult<bool> {
        let result = sqlx::query(
            "INSERT INTO topics (name, description) VALUES (?, ?) ON CONFLICT(name) DO NOTHING",
        )
        .bind(name)
        .bind(description)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn update_topic_description(&self, name: &str, description: &str) -> AppResult<bool> {
        let result = sqlx::query("UPDATE topics SET description = ? WHERE name = ?")
            .bind(description)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ---- entries ----

    pub async fn insert_entry(&self, entry: &NewEntry) -> AppResult<Entry> {
        let result = sqlx::query(
            "INSERT INTO entries (ts, author_id, topic_id, text, image, hidden) VALUES (?, ?, ?, ?, ?, 0)",
        )
        .bind(entry.ts)
        .bind(entry.author_id)
        .bind(entry.topic_id)
        .bind(&entry.text)
        .bind(entry.image.as_deref())
        .execute(&self.pool)
        .await?;

        Ok(Entry {
            id: EntryId(result.last_insert_rowid()),
            ts: entry.ts,
            author_id: entry.author_id,
            topic_id: entry.topic_id,
            text: entry.text.clone(),
            image: entry.image.clone(),
            hidden: false,
        })
    }

    pub async fn get_entry(&self, id: EntryId) -> AppResult<Option<Entry>> {
        let row = sqlx::query(
            "SELECT id, ts, author_id, topic_id, text, image, hidden FROM entries WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    /// Returns false when the entry does not exist
    pub async fn set_entry_hidden(&self, id: EntryId, hidden: bool) -> AppResult<bool> {
        let result = sqlx::query("UPDATE entries SET hidden = ? WHERE id = ?")
            .bind(hidden)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count_entries(&self) -> AppResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entries")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // ---- flags ----

    /// Insert a like/flag marker for a visible entry.
    /// Returns false when the marker already existed or the entry is missing or hidden.
    pub async fn add_flag_if_visible(
        &self,
        user_id: UserId,
        entry_id: EntryId,
        flag_type: FlagType,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            "INSERT INTO entry_flags (user_id, entry_id, flag_type, created)
             SELECT ?, id, ?, ? FROM entries WHERE id = ? AND hidden = 0
             ON CONFLICT(user_id, entry_id, flag_type) DO NOTHING",
        )
        .bind(user_id)
        .bind(flag_type.as_str())
        .bind(ShoutTime::now())
        .bind(entry_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_user_flag(
        &self,
        user_id: UserId,
        entry_id: EntryId,
        flag_type: FlagType,
    ) -> AppResult<u64> {
        let result = sqlx::query(
            "DELETE FROM entry_flags WHERE user_id = ? AND entry_id = ? AND flag_type = ?",
        )
        .bind(user_id)
        .bind(entry_id)
        .bind(flag_type.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Remove every marker of one type from an entry, whoever set it
    pub async fn delete_all_flags(&self, entry_id: EntryId, flag_type: FlagType) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM entry_flags WHERE entry_id = ? AND flag_type = ?")
            .bind(entry_id)
            .bind(flag_type.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn user_from_row(row: &SqliteRow) -> AppResult<UserInfo> {
    let role: String = row.try_get("role")?;
    Ok(UserInfo {
        id: row.try_get("id")?,
        ext_id: row.try_get("ext_id")?,
        email: row.try_get("email")?,
        enabled: row.try_get("enabled")?,
        role: Role::parse(&role),
    })
}

fn author_from_row(row: &SqliteRow) -> AppResult<Author> {
    Ok(Author {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        name: row.try_get("name")?,
        picture: row.try_get("picture")?,
    })
}

fn topic_from_row(row: &SqliteRow) -> AppResult<Topic> {
    Ok(Topic {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        locked: row.try_get("locked")?,
    })
}

fn entry_from_row(row: &SqliteRow) -> AppResult<Entry> {
    Ok(Entry {
        id: row.try_get("id")?,
        ts: row.try_get("ts")?,
        author_id: row.try_get("author_id")?,
        topic_id: row.try_get("topic_id")?,
        text: row.try_get("text")?,
        image: row.try_get("image")?,
        hidden: row.try_get("hidden")?,
    })
}
