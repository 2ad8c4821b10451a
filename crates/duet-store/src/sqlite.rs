use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use duet_core::now_millis;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::StoreError;
use crate::kv::KvBackend;

const PRAGMAS: &str = r"
PRAGMA journal_mode = WAL;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
";

const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    expires_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_kv_expires_at ON kv(expires_at) WHERE expires_at IS NOT NULL;
";

/// SQLite-backed key/value store.
///
/// The connection sits behind a `parking_lot::Mutex` and every statement
/// runs on the blocking pool, so a slow write never parks a runtime worker.
/// Expiry is wall-clock epoch milliseconds.
#[derive(Clone)]
pub struct SqliteKv {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl SqliteKv {
    /// Open or create a database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Io(format!("create dir: {e}")))?;
            }
        }
        let conn = Connection::open(path)?;
        let kv = Self::init(conn, path.to_owned())?;
        info!(path = %path.display(), "kv database opened");
        Ok(kv)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, PathBuf::from(":memory:"))
    }

    fn init(conn: Connection, path: PathBuf) -> Result<Self, StoreError> {
        conn.execute_batch(PRAGMAS)
            .map_err(|e| StoreError::Database(format!("pragmas: {e}")))?;
        conn.execute_batch(CREATE_TABLES)
            .map_err(|e| StoreError::Database(format!("schema: {e}")))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Database(format!("blocking task failed: {e}")))?
    }

    /// Delete expired rows. Returns how many were removed.
    pub async fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = now_millis();
        self.with_conn(move |conn| {
            Ok(conn.execute(
                "DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                [now],
            )?)
        })
        .await
    }
}

#[async_trait]
impl KvBackend for SqliteKv {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let now = now_millis();
        let owned = key.to_owned();
        let row: Option<(String, Option<i64>)> = self
            .with_conn(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT value, expires_at FROM kv WHERE key = ?1",
                        [&owned],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?)
            })
            .await?;

        let Some((raw, expires_at)) = row else {
            return Ok(None);
        };
        if expires_at.is_some_and(|at| at <= now) {
            self.delete(key).await?;
            return Ok(None);
        }
        // Unparseable text is handed back as a string so shape checks upstream
        // see it as a corrupt value rather than a backend failure.
        Ok(Some(serde_json::from_str(&raw).unwrap_or_else(|e| {
            warn!(key, error = %e, "stored value is not valid JSON");
            Value::String(raw)
        })))
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), StoreError> {
        let text = serde_json::to_string(&value)?;
        let expires_at = ttl.map(|ttl| {
            now_millis().saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
        });
        let key = key.to_owned();
        self.with_conn(move |conn| {
            let _ = conn.execute(
                "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
                params![key, text, expires_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let key = key.to_owned();
        self.with_conn(move |conn| {
            let _ = conn.execute("DELETE FROM kv WHERE key = ?1", [&key])?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn roundtrip_in_memory() {
        let kv = SqliteKv::in_memory().unwrap();
        assert_eq!(kv.path(), Path::new(":memory:"));
        kv.set("messages:private", json!([{"id": "m1"}]), None)
            .await
            .unwrap();
        assert_eq!(
            kv.get("messages:private").await.unwrap(),
            Some(json!([{"id": "m1"}]))
        );
    }

    #[tokio::test]
    async fn upsert_replaces_value() {
        let kv = SqliteKv::in_memory().unwrap();
        kv.set("k", json!(1), None).await.unwrap();
        kv.set("k", json!(2), None).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn zero_ttl_reads_as_absent() {
        let kv = SqliteKv::in_memory().unwrap();
        kv.set("typing", json!(true), Some(Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(kv.get("typing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn long_ttl_survives() {
        let kv = SqliteKv::in_memory().unwrap();
        kv.set("presence", json!({}), Some(Duration::from_secs(3600)))
            .await
            .unwrap();
        assert!(kv.get("presence").await.unwrap().is_some());
        assert_eq!(kv.purge_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn invalid_json_comes_back_as_string() {
        let kv = SqliteKv::in_memory().unwrap();
        kv.with_conn(|conn| {
            let _ = conn.execute(
                "INSERT INTO kv (key, value) VALUES ('messages:private', '{broken')",
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(
            kv.get("messages:private").await.unwrap(),
            Some(Value::String("{broken".into()))
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn held_connection_does_not_stall_the_runtime() {
        let kv = SqliteKv::in_memory().unwrap();
        let conn = Arc::clone(&kv.conn);
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let holder = std::thread::spawn(move || {
            let _guard = conn.lock();
            locked_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(400));
        });
        locked_rx.recv().unwrap();

        let read = tokio::spawn({
            let kv = kv.clone();
            async move { kv.get("presence:private").await }
        });
        let started = std::time::Instant::now();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(
            started.elapsed() < Duration::from_millis(200),
            "timer waited {:?} behind a blocked statement",
            started.elapsed()
        );

        assert_eq!(read.await.unwrap().unwrap(), None);
        holder.join().unwrap();
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("duet.db");
        {
            let kv = SqliteKv::open(&path).unwrap();
            kv.set("lastread:private:alice", json!(42), None)
                .await
                .unwrap();
        }
        let kv = SqliteKv::open(&path).unwrap();
        assert_eq!(
            kv.get("lastread:private:alice").await.unwrap(),
            Some(json!(42))
        );
    }
}
