//! SQLite relational store: one table per batch source, keyed by dedup key.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use ingest_api::error::PluginError;
use ingest_api::record::BatchSource;
use ingest_api::store::{DbRow, RelationalStore};
use rusqlite::{Connection, params};

const PRAGMAS: &str = r"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA busy_timeout = 5000;
";

fn create_table_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            dedup_key TEXT PRIMARY KEY,
            pipeline TEXT NOT NULL,
            topic TEXT NOT NULL,
            partition_key TEXT NOT NULL,
            received_ms INTEGER NOT NULL,
            loaded_ms INTEGER NOT NULL,
            payload BLOB NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_{table}_received ON {table} (received_ms);"
    )
}

fn db_err(e: rusqlite::Error) -> PluginError {
    PluginError::io(format!("sqlite: {e}"))
}

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, PluginError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| PluginError::from(e).with_context(format!("create {}", parent.display())))?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch(PRAGMAS).map_err(db_err)?;
        tracing::info!(path = %path.display(), "sqlite store opened");
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self, PluginError> {
        Self::init(Connection::open_in_memory().map_err(db_err)?)
    }

    fn init(conn: Connection) -> Result<Self, PluginError> {
        for source in BatchSource::ALL {
            conn.execute_batch(&create_table_sql(source.table())).map_err(db_err)?;
        }
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T: Send + 'static>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, PluginError> + Send + 'static,
    ) -> Result<T, PluginError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = lock(&conn);
            f(&mut guard)
        })
        .await
        .map_err(|e| PluginError::logic(format!("sqlite task failed: {e}")))?
    }
}

fn lock(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    match conn.lock() {
        Ok(g) => g,
        Err(poisoned) => {
            tracing::warn!("sqlite connection lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

fn insert_all(conn: &mut Connection, rows: &[DbRow]) -> Result<usize, PluginError> {
    let tx = conn.transaction().map_err(db_err)?;
    let mut inserted = 0;
    for row in rows {
        let sql = format!(
            "INSERT INTO {} (dedup_key, pipeline, topic, partition_key, received_ms, loaded_ms, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(dedup_key) DO NOTHING",
            row.source.table()
        );
        let mut stmt = tx.prepare_cached(&sql).map_err(db_err)?;
        inserted += stmt
            .execute(params![
                row.dedup_key,
                row.pipeline,
                row.topic,
                row.partition_key,
                row.received_ms,
                row.loaded_ms,
                row.payload,
            ])
            .map_err(db_err)?;
    }
    tx.commit().map_err(db_err)?;
    Ok(inserted)
}

impl RelationalStore for SqliteStore {
    fn insert_rows<'a>(
        &'a self,
        rows: &'a [DbRow],
    ) -> Pin<Box<dyn Future<Output = Result<usize, PluginError>> + Send + 'a>> {
        Box::pin(async move {
            if let Some(row) = rows.iter().find(|r| r.dedup_key.is_empty()) {
                return Err(PluginError::validation(format!(
                    "row for topic '{}' has an empty dedup key",
                    row.topic
                )));
            }
            if rows.is_empty() {
                return Ok(0);
            }
            let rows = rows.to_vec();
            self.with_conn(move |conn| insert_all(conn, &rows)).await
        })
    }

    fn delete_older_than(
        &self,
        cutoff_ms: i64,
    ) -> Pin<Box<dyn Future<Output = Result<u64, PluginError>> + Send + '_>> {
        Box::pin(async move {
            self.with_conn(move |conn| {
                let tx = conn.transaction().map_err(db_err)?;
                let mut deleted = 0u64;
                for source in BatchSource::ALL {
                    let sql = format!("DELETE FROM {} WHERE received_ms < ?1", source.table());
                    deleted += tx.execute(&sql, [cutoff_ms]).map_err(db_err)? as u64;
                }
                tx.commit().map_err(db_err)?;
                Ok(deleted)
            })
            .await
        })
    }

    fn count_rows(
        &self,
        source: BatchSource,
    ) -> Pin<Box<dyn Future<Output = Result<u64, PluginError>> + Send + '_>> {
        Box::pin(async move {
            self.with_conn(move |conn| {
                let sql = format!("SELECT COUNT(*) FROM {}", source.table());
                let n: i64 = conn.query_row(&sql, [], |row| row.get(0)).map_err(db_err)?;
                Ok(n as u64)
            })
            .await
        })
    }
}
