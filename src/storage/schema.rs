use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    SqlitePool,
};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use super::types::StorageError;

/// Schema version recorded in `PRAGMA user_version`.
const SCHEMA_VERSION: i64 = 1;

// ============================================================================
// Database
// ============================================================================

/// Handle to the local dictionary store.
///
/// Cloning is cheap and shares the underlying pool; `close()` on any clone
/// closes it for all of them.
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Open (creating if necessary) the store at `path` and run migrations.
    ///
    /// Safe to call on every startup: all schema statements are idempotent.
    /// `":memory:"` opens a private in-memory store shared by the pool.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Locked` if another process holds the database
    /// lock, and `StorageError::Init` if the location is unwritable, the file
    /// is not a database, or migration fails.
    pub async fn open(path: &str) -> Result<Self, StorageError> {
        let in_memory = path == ":memory:";

        if !in_memory {
            prepare_db_file(Path::new(path))?;
        }

        let url = format!("sqlite:{}?mode=rwc", path);
        // busy_timeout=5000: wait up to 5 seconds for a writer to release the lock.
        let mut options = SqliteConnectOptions::from_str(&url)
            .map_err(StorageError::from_open)?
            .pragma("busy_timeout", "5000");
        if !in_memory {
            // WAL lets readers keep their snapshot while an ingestion
            // transaction holds the write lock.
            options = options
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal);
        }

        // SQLite is single-writer; 5 connections lets reads proceed during an
        // ingestion write transaction.
        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10));
        if in_memory {
            // The in-memory database lives only as long as one connection does.
            pool_options = pool_options
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(StorageError::from_open)?;

        let db = Self { pool };
        db.migrate().await.map_err(|e| match e {
            StorageError::Database(inner) => StorageError::from_open(inner),
            other => other,
        })?;

        tracing::debug!(path = %path, "Dictionary store ready");
        Ok(db)
    }

    /// Release the pool. Every later operation fails with `StorageError::Closed`.
    pub async fn close(&self) {
        self.pool.close().await;
        tracing::debug!("Dictionary store closed");
    }

    /// Whether `close()` has been called.
    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Run database migrations atomically within a transaction.
    ///
    /// Tables, indexes and the search index are created in one transaction;
    /// a failure leaves the file as it was. The search index has no triggers:
    /// every mutating operation maintains it explicitly.
    async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA busy_timeout = 5000")
            .execute(&self.pool)
            .await?;

        let (version,): (i64,) = sqlx::query_as("PRAGMA user_version")
            .fetch_one(&self.pool)
            .await?;
        if version > SCHEMA_VERSION {
            return Err(StorageError::Init(format!(
                "database schema version {} is newer than supported version {}",
                version, SCHEMA_VERSION
            )));
        }

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dictionary_items (
                id TEXT PRIMARY KEY CHECK (length(id) > 0),
                name TEXT NOT NULL,
                content TEXT,
                reference TEXT,
                dictionary_type TEXT,
                type_code TEXT,
                type_name TEXT,
                copyright TEXT,
                data_link TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // No foreign key: an annotation may be recorded before its item is ingested
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_annotations (
                item_id TEXT PRIMARY KEY,
                is_bookmarked INTEGER NOT NULL DEFAULT 0,
                note TEXT,
                last_viewed INTEGER,
                view_count INTEGER NOT NULL DEFAULT 0
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_items_name ON dictionary_items(name COLLATE NOCASE)",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_type_code ON dictionary_items(type_code)")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_items_dictionary_type ON dictionary_items(dictionary_type)",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_annotations_bookmarked ON user_annotations(is_bookmarked)",
        )
        .execute(&mut *tx)
        .await?;
        // Partial index for the recent-items listing
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_annotations_last_viewed ON user_annotations(last_viewed DESC) WHERE last_viewed IS NOT NULL",
        )
        .execute(&mut *tx)
        .await?;

        // Standalone FTS5 table keyed by dictionary_items.rowid
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE IF NOT EXISTS items_fts
            USING fts5(name, content, reference, type_name)
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Backfill an empty index from existing items (first run after a
        // manual wipe of the index, or a store written by an older build)
        let (index_count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM items_fts")
            .fetch_one(&mut *tx)
            .await?;
        if index_count == 0 {
            let result = sqlx::query(
                r#"
                INSERT INTO items_fts(rowid, name, content, reference, type_name)
                SELECT rowid, name, content, reference, type_name FROM dictionary_items
            "#,
            )
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() > 0 {
                tracing::info!(
                    indexed = result.rows_affected(),
                    "Search index backfilled from stored items"
                );
            }
        }

        // PRAGMA does not accept bound parameters
        sqlx::query(&format!("PRAGMA user_version = {}", SCHEMA_VERSION))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(())
    }
}

/// Make sure the database file's directory exists and the file is created
/// with user-only permissions.
fn prepare_db_file(db_path: &Path) -> Result<(), StorageError> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::Init(format!(
                    "cannot create directory '{}': {}",
                    parent.display(),
                    e
                ))
            })?;
        }
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

        if db_path.exists() {
            let perms = std::fs::Permissions::from_mode(0o600);
            if let Err(e) = std::fs::set_permissions(db_path, perms) {
                tracing::warn!(
                    path = %db_path.display(),
                    error = %e,
                    "Failed to set database file permissions"
                );
            }
        } else {
            // Pre-create with mode 0600 so the file never exists with umask permissions.
            // If creation fails, SQLite reports the error at connect time.
            let _file = std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(db_path)
                .ok();
        }
    }

    Ok(())
}
