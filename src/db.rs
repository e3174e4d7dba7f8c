//! SQLite key-value store for restart-surviving instance state
//!
//! Every instance owns one namespace. Keys never cross namespaces, so two
//! instances can use the same key names without colliding.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Database connection wrapper with thread-safe access
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path).context("Failed to open database")?;

        // WAL with full sync: a committed write survives a crash
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                Self::migrate_v1(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: key-value table
    fn migrate_v1(conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: kv table");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                namespace TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (namespace, key)
            );

            INSERT INTO schema_migrations (version) VALUES (1);
        "#,
        )?;

        Ok(())
    }

    /// A view of the store restricted to one namespace
    pub fn namespace(&self, namespace: impl Into<String>) -> NamespacedStore {
        NamespacedStore {
            db: self.clone(),
            namespace: namespace.into(),
        }
    }

    pub fn get(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT value FROM kv WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Write several keys in one transaction
    pub fn put_many(&self, namespace: &str, entries: &[(&str, &str)]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for (key, value) in entries {
            tx.execute(
                "INSERT INTO kv (namespace, key, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(namespace, key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = datetime('now')",
                params![namespace, key, value],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// List entries whose key starts with `prefix`, ordered by key
    pub fn list(&self, namespace: &str, prefix: &str) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT key, value FROM kv
             WHERE namespace = ?1 AND substr(key, 1, length(?2)) = ?2
             ORDER BY key",
        )?;
        let rows = stmt.query_map(params![namespace, prefix], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        let entries = rows.collect::<rusqlite::Result<Vec<(String, String)>>>()?;
        Ok(entries)
    }

    /// Delete every key of a namespace, returning how many were removed
    pub fn delete_all(&self, namespace: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let removed = conn.execute("DELETE FROM kv WHERE namespace = ?1", params![namespace])?;
        Ok(removed)
    }

    /// Durability barrier: flush the write-ahead log into the main database
    pub fn sync(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.query_row("PRAGMA wal_checkpoint(FULL)", [], |_| Ok(()))?;
        Ok(())
    }
}

/// Key-value operations scoped to a single namespace
#[derive(Clone)]
pub struct NamespacedStore {
    db: Database,
    namespace: String,
}

impl NamespacedStore {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        self.db.get(&self.namespace, key)
    }

    pub fn put(&self, key: &str, value: &str) -> Result<()> {
        self.db.put_many(&self.namespace, &[(key, value)])
    }

    pub fn put_many(&self, entries: &[(&str, &str)]) -> Result<()> {
        self.db.put_many(&self.namespace, entries)
    }

    pub fn list(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        self.db.list(&self.namespace, prefix)
    }

    pub fn delete_all(&self) -> Result<usize> {
        self.db.delete_all(&self.namespace)
    }

    pub fn sync(&self) -> Result<()> {
        self.db.sync()
    }
}
