//! Persistent user registry and append-only usage log.
//!
//! The SQLite backend keeps a single connection behind a `parking_lot::Mutex`
//! and runs every statement on the blocking pool, so a slow disk never
//! stalls the async runtime and the non-`Send` guard never crosses an
//! `.await`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex as SyncMutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;

use crate::error::Result;
use crate::types::{Balance, UsageEntry, User, UserId};

/// Storage backend for the credit ledger.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert the user, or refresh the display name of an existing one.
    /// Returns `true` when the user was created.
    async fn upsert_user(&self, user_id: UserId, display_name: &str) -> Result<bool>;

    /// Like [`Self::upsert_user`], but a created user also gets `grant`
    /// appended in the same transaction. Either both land or neither does.
    async fn upsert_user_with_grant(
        &self,
        user_id: UserId,
        display_name: &str,
        grant: &UsageEntry,
    ) -> Result<bool>;

    async fn get_user(&self, user_id: UserId) -> Result<Option<User>>;

    async fn append(&self, entry: &UsageEntry) -> Result<()>;

    /// Signed token sum and cost sum, or `None` when the user has no entries.
    async fn totals(&self, user_id: UserId) -> Result<Option<Balance>>;

    /// All entries for a user, oldest first.
    async fn entries(&self, user_id: UserId) -> Result<Vec<UsageEntry>>;

    /// Cheap round trip used by the health endpoint.
    async fn ping(&self) -> Result<()>;
}

/// SQLite-backed [`LedgerStore`].
#[derive(Clone)]
pub struct SqliteLedgerStore {
    conn: Arc<SyncMutex<Connection>>,
}

impl SqliteLedgerStore {
    /// Open (or create) the ledger tables in the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    crate::Error::StoreUnavailable(format!(
                        "failed to create database dir {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        Self::from_connection(conn)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                user_id      INTEGER PRIMARY KEY,
                display_name TEXT NOT NULL,
                created_at   TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS openai_usage (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id        INTEGER NOT NULL,
                timestamp      TEXT NOT NULL,
                model          TEXT NOT NULL,
                tokens_used    INTEGER NOT NULL,
                estimated_cost REAL NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(user_id)
            );
            CREATE INDEX IF NOT EXISTS idx_openai_usage_user
                ON openai_usage(user_id);",
        )?;

        Ok(Self {
            conn: Arc::new(SyncMutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let value = tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            f(&mut conn)
        })
        .await??;
        Ok(value)
    }
}

fn upsert_in(conn: &Connection, user_id: UserId, display_name: &str) -> rusqlite::Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM users WHERE user_id = ?1",
            params![user_id],
            |_| Ok(()),
        )
        .optional()?
        .is_some();

    if exists {
        conn.execute(
            "UPDATE users SET display_name = ?2 WHERE user_id = ?1",
            params![user_id, display_name],
        )?;
    } else {
        conn.execute(
            "INSERT INTO users (user_id, display_name, created_at) VALUES (?1, ?2, ?3)",
            params![user_id, display_name, Utc::now()],
        )?;
    }
    Ok(!exists)
}

fn insert_entry(conn: &Connection, entry: &UsageEntry) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO openai_usage (user_id, timestamp, model, tokens_used, estimated_cost)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            entry.user_id,
            entry.timestamp,
            entry.model,
            entry.tokens,
            entry.cost
        ],
    )?;
    Ok(())
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn upsert_user(&self, user_id: UserId, display_name: &str) -> Result<bool> {
        let display_name = display_name.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let created = upsert_in(&tx, user_id, &display_name)?;
            tx.commit()?;
            Ok(created)
        })
        .await
    }

    async fn upsert_user_with_grant(
        &self,
        user_id: UserId,
        display_name: &str,
        grant: &UsageEntry,
    ) -> Result<bool> {
        let display_name = display_name.to_string();
        let grant = grant.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let created = upsert_in(&tx, user_id, &display_name)?;
            if created {
                insert_entry(&tx, &grant)?;
            }
            tx.commit()?;
            Ok(created)
        })
        .await
    }

    async fn get_user(&self, user_id: UserId) -> Result<Option<User>> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT user_id, display_name, created_at FROM users WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok(User {
                        user_id: row.get(0)?,
                        display_name: row.get(1)?,
                        created_at: row.get::<_, DateTime<Utc>>(2)?,
                    })
                },
            )
            .optional()
        })
        .await
    }

    async fn append(&self, entry: &UsageEntry) -> Result<()> {
        let entry = entry.clone();
        self.with_conn(move |conn| insert_entry(conn, &entry)).await
    }

    async fn totals(&self, user_id: UserId) -> Result<Option<Balance>> {
        self.with_conn(move |conn| {
            let (count, tokens, cost): (i64, i64, f64) = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(tokens_used), 0), COALESCE(SUM(estimated_cost), 0.0)
                 FROM openai_usage
                 WHERE user_id = ?1",
                params![user_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;

            if count == 0 {
                return Ok(None);
            }
            Ok(Some(Balance { tokens, cost }))
        })
        .await
    }

    async fn entries(&self, user_id: UserId) -> Result<Vec<UsageEntry>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id, timestamp, model, tokens_used, estimated_cost
                 FROM openai_usage
                 WHERE user_id = ?1
                 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![user_id], |row| {
                Ok(UsageEntry {
                    user_id: row.get(0)?,
                    timestamp: row.get(1)?,
                    model: row.get(2)?,
                    tokens: row.get(3)?,
                    cost: row.get(4)?,
                })
            })?;
            let entries = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
        .await
    }

    async fn ping(&self) -> Result<()> {
        self.with_conn(|conn| conn.query_row("SELECT 1", [], |_| Ok(())))
            .await
    }
}
