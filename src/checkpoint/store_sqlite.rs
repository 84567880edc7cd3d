/*!
SQLite checkpoint store.

Durable `CheckpointStore` backend over sqlx. One row per flow holds the
latest checkpoint blob; a side table keeps the per-session dedup sequence
watermarks that survive checkpoint-skipping suspensions.

The schema is created on connect (idempotent); there is no migration
machinery — two tables of primitives do not warrant one. Blobs are opaque
here: all structure lives in the codec.
*/

use chrono::Utc;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tracing::instrument;

use crate::checkpoint::store::{CheckpointStore, Result, StoreError, StoreTransaction};
use crate::ids::{FlowId, SessionId};

/// SQLite-backed checkpoint store.
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteCheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteCheckpointStore").finish()
    }
}

fn backend(context: &str, e: sqlx::Error) -> StoreError {
    let message = format!("{context}: {e}");
    // SQLITE_BUSY / SQLITE_LOCKED are contention, not corruption.
    if message.contains("locked") || message.contains("busy") {
        StoreError::Busy { message }
    } else {
        StoreError::Backend { message }
    }
}

impl SqliteCheckpointStore {
    /// Connect (or create) a SQLite database at `database_url`, e.g.
    /// `sqlite://flowstate.db`, and ensure the schema exists.
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> Result<Self> {
        // Ensure the underlying file exists; SqlitePool will not create it.
        if let Some(path) = database_url.strip_prefix("sqlite://") {
            let path = path.trim();
            if !path.is_empty() && path != ":memory:" {
                let p = std::path::Path::new(path);
                if let Some(parent) = p.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                if !p.exists() {
                    let _ = std::fs::File::create_new(p);
                }
            }
        }
        let pool = SqlitePool::connect(database_url)
            .await
            .map_err(|e| backend("connect", e))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                flow_id    TEXT PRIMARY KEY,
                blob       BLOB NOT NULL,
                updated_at TEXT NOT NULL
            )
        "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| backend("create checkpoints table", e))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dedup_watermarks (
                flow_id    TEXT    NOT NULL,
                session_id INTEGER NOT NULL,
                sequence   INTEGER NOT NULL,
                PRIMARY KEY (flow_id, session_id)
            )
        "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| backend("create dedup_watermarks table", e))?;

        Ok(Self { pool })
    }
}

#[async_trait::async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        let txn = self
            .pool
            .begin()
            .await
            .map_err(|e| backend("tx begin", e))?;
        Ok(Box::new(SqliteStoreTransaction { txn: Some(txn) }))
    }
}

struct SqliteStoreTransaction {
    txn: Option<sqlx::Transaction<'static, sqlx::Sqlite>>,
}

impl SqliteStoreTransaction {
    fn open(&mut self) -> Result<&mut sqlx::Transaction<'static, sqlx::Sqlite>> {
        self.txn.as_mut().ok_or_else(|| StoreError::Backend {
            message: "transaction already finished".to_string(),
        })
    }
}

#[async_trait::async_trait]
impl StoreTransaction for SqliteStoreTransaction {
    async fn add(&mut self, flow_id: FlowId, blob: Vec<u8>) -> Result<()> {
        let tx = self.open()?;
        let result = sqlx::query(
            r#"
            INSERT INTO checkpoints (flow_id, blob, updated_at)
            VALUES (?1, ?2, ?3)
        "#,
        )
        .bind(flow_id.to_string())
        .bind(&blob)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut **tx)
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::Conflict { flow_id })
            }
            Err(e) => Err(backend("insert checkpoint", e)),
        }
    }

    async fn update(&mut self, flow_id: FlowId, blob: Vec<u8>) -> Result<()> {
        let tx = self.open()?;
        let result = sqlx::query(
            r#"
            UPDATE checkpoints SET blob = ?2, updated_at = ?3 WHERE flow_id = ?1
        "#,
        )
        .bind(flow_id.to_string())
        .bind(&blob)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut **tx)
        .await
        .map_err(|e| backend("update checkpoint", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { flow_id });
        }
        Ok(())
    }

    async fn remove(&mut self, flow_id: FlowId) -> Result<()> {
        let tx = self.open()?;
        sqlx::query("DELETE FROM checkpoints WHERE flow_id = ?1")
            .bind(flow_id.to_string())
            .execute(&mut **tx)
            .await
            .map_err(|e| backend("delete checkpoint", e))?;
        sqlx::query("DELETE FROM dedup_watermarks WHERE flow_id = ?1")
            .bind(flow_id.to_string())
            .execute(&mut **tx)
            .await
            .map_err(|e| backend("delete watermarks", e))?;
        Ok(())
    }

    async fn get(&mut self, flow_id: FlowId) -> Result<Option<Vec<u8>>> {
        let tx = self.open()?;
        let row = sqlx::query("SELECT blob FROM checkpoints WHERE flow_id = ?1")
            .bind(flow_id.to_string())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| backend("select checkpoint", e))?;
        Ok(row.map(|r| r.get::<Vec<u8>, _>("blob")))
    }

    async fn list(&mut self) -> Result<Vec<(FlowId, Vec<u8>)>> {
        let tx = self.open()?;
        let rows = sqlx::query("SELECT flow_id, blob FROM checkpoints ORDER BY flow_id")
            .fetch_all(&mut **tx)
            .await
            .map_err(|e| backend("list checkpoints", e))?;
        let mut listed = Vec::with_capacity(rows.len());
        for row in rows {
            let raw: String = row.get("flow_id");
            let uuid = raw.parse().map_err(|e| StoreError::Backend {
                message: format!("corrupt flow id {raw}: {e}"),
            })?;
            listed.push((FlowId::from_uuid(uuid), row.get::<Vec<u8>, _>("blob")));
        }
        Ok(listed)
    }

    async fn record_dedup_watermark(
        &mut self,
        flow_id: FlowId,
        session_id: SessionId,
        sequence: u64,
    ) -> Result<()> {
        let tx = self.open()?;
        sqlx::query(
            r#"
            INSERT INTO dedup_watermarks (flow_id, session_id, sequence)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (flow_id, session_id)
            DO UPDATE SET sequence = MAX(sequence, excluded.sequence)
        "#,
        )
        .bind(flow_id.to_string())
        .bind(session_id.as_raw() as i64)
        .bind(sequence as i64)
        .execute(&mut **tx)
        .await
        .map_err(|e| backend("record watermark", e))?;
        Ok(())
    }

    async fn dedup_watermarks(&mut self, flow_id: FlowId) -> Result<Vec<(SessionId, u64)>> {
        let tx = self.open()?;
        let rows = sqlx::query(
            "SELECT session_id, sequence FROM dedup_watermarks WHERE flow_id = ?1 ORDER BY session_id",
        )
        .bind(flow_id.to_string())
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| backend("select watermarks", e))?;
        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    SessionId::from_raw(row.get::<i64, _>("session_id") as u64),
                    row.get::<i64, _>("sequence") as u64,
                )
            })
            .collect())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        let tx = self.txn.take().ok_or_else(|| StoreError::Backend {
            message: "transaction already finished".to_string(),
        })?;
        tx.commit().await.map_err(|e| backend("tx commit", e))
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        let tx = self.txn.take().ok_or_else(|| StoreError::Backend {
            message: "transaction already finished".to_string(),
        })?;
        tx.rollback().await.map_err(|e| backend("tx rollback", e))
    }
}
