//! Database connection management

use std::path::Path;

use libsql::{Builder, Connection, Database as LibSqlDatabase};
use tokio::sync::{Mutex, MutexGuard};

use super::migrations;
use crate::error::Result;
use crate::sync::LocalChangeFeed;

/// Local libSQL database holding records, settings, and sync bookkeeping.
pub struct LocalDatabase {
    _db: LibSqlDatabase,
    conn: Connection,
    writes: Mutex<()>,
    feed: LocalChangeFeed,
}

impl LocalDatabase {
    /// Open a database at the given path, creating it if it doesn't exist
    ///
    /// Runs migrations automatically.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let db = Builder::new_local(&path_str).build().await?;
        Self::from_database(db).await
    }

    /// Open an in-memory database (useful for testing)
    pub async fn open_in_memory() -> Result<Self> {
        let db = Builder::new_local(":memory:").build().await?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self> {
        let conn = db.connect()?;
        let database = Self {
            _db: db,
            conn,
            writes: Mutex::new(()),
            feed: LocalChangeFeed::new(),
        };
        database.configure().await?;
        migrations::run(&database.conn).await?;
        Ok(database)
    }

    async fn configure(&self) -> Result<()> {
        // In-memory databases reject WAL; that's fine.
        self.conn
            .execute("PRAGMA journal_mode = WAL;", ())
            .await
            .ok();
        self.conn
            .execute("PRAGMA synchronous = NORMAL;", ())
            .await
            .ok();
        self.conn.execute("PRAGMA foreign_keys = ON;", ()).await?;
        Ok(())
    }

    /// Get a reference to the underlying connection
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }

    pub(super) const fn feed(&self) -> &LocalChangeFeed {
        &self.feed
    }

    /// Serializes writers so an import transaction never interleaves with
    /// single-row writes on the shared connection.
    pub(super) async fn write_lock(&self) -> MutexGuard<'_, ()> {
        self.writes.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test(flavor = "multi_thread")]
    async fn open_in_memory_runs_migrations() {
        let db = LocalDatabase::open_in_memory().await.unwrap();
        let mut rows = db
            .connection()
            .query("SELECT COUNT(*) FROM records", ())
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        assert_eq!(row.get::<i64>(0).unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn open_file_creates_database() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("satchel.db");

        LocalDatabase::open(&path).await.unwrap();
        assert!(path.exists());
    }
}
