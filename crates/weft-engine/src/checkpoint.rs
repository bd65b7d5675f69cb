use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};

use weft_core::error::{Result, WeftError};
use weft_core::traits::{CheckpointRecord, CheckpointStore};

/// Checkpoints held in process memory. Lost on restart.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    records: tokio::sync::Mutex<HashMap<(String, String), CheckpointRecord>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(
        &self,
        run_id: String,
        node_id: String,
        state_tag: String,
        payload: Vec<u8>,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.records
                .lock()
                .await
                .insert((run_id, node_id), CheckpointRecord { state_tag, payload });
            Ok(())
        })
    }

    fn load(
        &self,
        run_id: String,
        node_id: String,
    ) -> BoxFuture<'_, Result<Option<CheckpointRecord>>> {
        Box::pin(async move { Ok(self.records.lock().await.get(&(run_id, node_id)).cloned()) })
    }

    fn delete(&self, run_id: String, node_id: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.records.lock().await.remove(&(run_id, node_id));
            Ok(())
        })
    }
}

/// Persistent checkpoint store backed by SQLite. One row per suspended
/// (run, node); saving again overwrites.
pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
}

impl SqliteCheckpointStore {
    /// Open or create the checkpoint database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                WeftError::Checkpoint(format!("Failed to create checkpoint directory: {}", e))
            })?;
        }
        let conn = Connection::open(path)
            .map_err(|e| WeftError::Checkpoint(format!("Failed to open checkpoint store: {}", e)))?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| WeftError::Checkpoint(format!("Failed to open checkpoint store: {}", e)))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS node_checkpoints (
                 run_id TEXT NOT NULL,
                 node_id TEXT NOT NULL,
                 state_tag TEXT NOT NULL,
                 payload BLOB NOT NULL,
                 saved_at TEXT NOT NULL,
                 PRIMARY KEY (run_id, node_id)
             );",
        )
        .map_err(|e| {
            WeftError::Checkpoint(format!("Failed to initialize checkpoint schema: {}", e))
        })?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn save_row(&self, run_id: &str, node_id: &str, state_tag: &str, payload: &[u8]) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO node_checkpoints (run_id, node_id, state_tag, payload, saved_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(run_id, node_id) DO UPDATE SET
                 state_tag = excluded.state_tag,
                 payload = excluded.payload,
                 saved_at = excluded.saved_at",
            params![run_id, node_id, state_tag, payload, Utc::now().to_rfc3339()],
        )
        .map_err(|e| WeftError::Checkpoint(format!("Failed to save checkpoint: {}", e)))?;
        Ok(())
    }

    fn load_row(&self, run_id: &str, node_id: &str) -> Result<Option<CheckpointRecord>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT state_tag, payload FROM node_checkpoints WHERE run_id = ?1 AND node_id = ?2",
            params![run_id, node_id],
            |row| {
                Ok(CheckpointRecord {
                    state_tag: row.get(0)?,
                    payload: row.get(1)?,
                })
            },
        )
        .optional()
        .map_err(|e| WeftError::Checkpoint(format!("Failed to load checkpoint: {}", e)))
    }

    fn delete_row(&self, run_id: &str, node_id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM node_checkpoints WHERE run_id = ?1 AND node_id = ?2",
            params![run_id, node_id],
        )
        .map_err(|e| WeftError::Checkpoint(format!("Failed to delete checkpoint: {}", e)))?;
        Ok(())
    }

    /// Checkpoints still stored for a run, as (node_id, state_tag).
    pub fn list_run(&self, run_id: &str) -> Result<Vec<(String, String)>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT node_id, state_tag FROM node_checkpoints
                 WHERE run_id = ?1 ORDER BY node_id",
            )
            .map_err(|e| WeftError::Checkpoint(format!("Failed to prepare query: {}", e)))?;
        let rows = stmt
            .query_map(params![run_id], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(|e| WeftError::Checkpoint(format!("Failed to list checkpoints: {}", e)))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| WeftError::Checkpoint(format!("Failed to read checkpoint row: {}", e)))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| WeftError::Checkpoint(e.to_string()))
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn save(
        &self,
        run_id: String,
        node_id: String,
        state_tag: String,
        payload: Vec<u8>,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.save_row(&run_id, &node_id, &state_tag, &payload) })
    }

    fn load(
        &self,
        run_id: String,
        node_id: String,
    ) -> BoxFuture<'_, Result<Option<CheckpointRecord>>> {
        Box::pin(async move { self.load_row(&run_id, &node_id) })
    }

    fn delete(&self, run_id: String, node_id: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.delete_row(&run_id, &node_id) })
    }
}
