use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use shared::domain::{FileId, UserId};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use uuid::Uuid;

/// SQLite persistence for the backing service: registered users, flat JSON
/// documents keyed by `(collection, id)` with an owner column, and uploaded
/// file blobs.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredUser {
    pub id: UserId,
    pub email: String,
    pub display_name: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub id: String,
    pub owner_id: Option<UserId>,
    pub doc: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct StoredFile {
    pub file_id: FileId,
    pub uploader_id: UserId,
    pub folder: String,
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
    pub size_bytes: u64,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // An in-memory database lives and dies with its connection, so it
        // must not be spread over a pool.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Returns `None` when the email is already registered.
    pub async fn create_user(
        &self,
        email: &str,
        display_name: &str,
        password_hash: &str,
    ) -> Result<Option<StoredUser>> {
        let id = UserId::generate();
        let row = sqlx::query(
            "INSERT INTO users (id, email, display_name, password_hash) VALUES (?, ?, ?, ?)
             ON CONFLICT(email) DO NOTHING
             RETURNING id, email, display_name, password_hash, created_at",
        )
        .bind(id.to_string())
        .bind(email)
        .bind(display_name)
        .bind(password_hash)
        .fetch_optional(&self.pool)
        .await?;

        row.map(user_from_row).transpose()
    }

    pub async fn user_by_email(&self, email: &str) -> Result<Option<StoredUser>> {
        let row = sqlx::query(
            "SELECT id, email, display_name, password_hash, created_at FROM users WHERE email = ?",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        row.map(user_from_row).transpose()
    }

    pub async fn put_document(
        &self,
        collection: &str,
        id: &str,
        owner_id: Option<UserId>,
        doc: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO documents (collection, id, owner_id, doc, updated_at)
             VALUES (?, ?, ?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(collection, id) DO UPDATE SET
                owner_id = excluded.owner_id,
                doc = excluded.doc,
                updated_at = CURRENT_TIMESTAMP",
        )
        .bind(collection)
        .bind(id)
        .bind(owner_id.map(|owner| owner.to_string()))
        .bind(doc.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_document(&self, collection: &str, id: &str) -> Result<Option<StoredDocument>> {
        let row = sqlx::query("SELECT id, owner_id, doc FROM documents WHERE collection = ? AND id = ?")
            .bind(collection)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(document_from_row).transpose()
    }

    pub async fn list_documents(
        &self,
        collection: &str,
        owner_id: Option<UserId>,
    ) -> Result<Vec<StoredDocument>> {
        let rows = if let Some(owner) = owner_id {
            sqlx::query(
                "SELECT id, owner_id, doc FROM documents
                 WHERE collection = ? AND owner_id = ?
                 ORDER BY id",
            )
            .bind(collection)
            .bind(owner.to_string())
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query("SELECT id, owner_id, doc FROM documents WHERE collection = ? ORDER BY id")
                .bind(collection)
                .fetch_all(&self.pool)
                .await?
        };

        rows.into_iter().map(document_from_row).collect()
    }

    pub async fn delete_document(&self, collection: &str, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM documents WHERE collection = ? AND id = ?")
            .bind(collection)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn store_file(
        &self,
        file_id: FileId,
        uploader_id: UserId,
        folder: &str,
        filename: &str,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<()> {
        let size_bytes = i64::try_from(bytes.len()).unwrap_or(i64::MAX);
        sqlx::query(
            "INSERT INTO files (id, uploader_id, folder, filename, content_type, bytes, size_bytes)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(file_id.to_string())
        .bind(uploader_id.to_string())
        .bind(folder)
        .bind(filename)
        .bind(content_type)
        .bind(bytes)
        .bind(size_bytes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_file(&self, file_id: FileId) -> Result<Option<StoredFile>> {
        let row = sqlx::query(
            "SELECT id, uploader_id, folder, filename, content_type, bytes, size_bytes
             FROM files WHERE id = ?",
        )
        .bind(file_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            Ok(StoredFile {
                file_id: FileId(parse_uuid(&r.get::<String, _>(0))?),
                uploader_id: UserId(parse_uuid(&r.get::<String, _>(1))?),
                folder: r.get::<String, _>(2),
                filename: r.get::<String, _>(3),
                content_type: r.get::<String, _>(4),
                bytes: r.get::<Vec<u8>, _>(5),
                size_bytes: r.get::<Option<i64>, _>(6).unwrap_or_default() as u64,
            })
        })
        .transpose()
    }
}

fn user_from_row(row: sqlx::sqlite::SqliteRow) -> Result<StoredUser> {
    Ok(StoredUser {
        id: UserId(parse_uuid(&row.get::<String, _>(0))?),
        email: row.get::<String, _>(1),
        display_name: row.get::<String, _>(2),
        password_hash: row.get::<String, _>(3),
        created_at: row.get::<DateTime<Utc>, _>(4),
    })
}

fn document_from_row(row: sqlx::sqlite::SqliteRow) -> Result<StoredDocument> {
    let raw = row.get::<String, _>(2);
    Ok(StoredDocument {
        id: row.get::<String, _>(0),
        owner_id: row
            .get::<Option<String>, _>(1)
            .map(|owner| parse_uuid(&owner).map(UserId))
            .transpose()?,
        doc: serde_json::from_str(&raw).context("stored document is not valid JSON")?,
    })
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("invalid uuid '{raw}' in database"))
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
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
