//! SQLite storage for the latest kickoff's task outputs

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// One task output row of the latest kickoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTaskOutput {
    pub task_index: usize,
    pub task_id: String,
    pub task_name: String,
    pub expected_output: String,
    pub output: JsonValue,
    pub inputs: JsonValue,
    pub was_replayed: bool,
    pub timestamp: DateTime<Utc>,
}

/// Handle to the kickoff output database
#[derive(Clone)]
pub struct KickoffStore {
    conn: Arc<Mutex<Connection>>,
}

impl KickoffStore {
    /// Open (or create) the store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create store directory {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open kickoff store at {}", path.display()))?;
        info!("Opened kickoff store at {:?}", path);

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_tables()?;
        Ok(store)
    }

    /// In-memory store, used by tests and dry runs
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory store")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_tables()?;
        Ok(store)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("kickoff store lock poisoned"))
    }

    fn init_tables(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS latest_kickoff_task_outputs (
                task_index INTEGER PRIMARY KEY,
                task_id TEXT NOT NULL,
                task_name TEXT NOT NULL,
                expected_output TEXT NOT NULL,
                output TEXT NOT NULL,
                inputs TEXT NOT NULL,
                was_replayed INTEGER NOT NULL DEFAULT 0,
                timestamp TEXT NOT NULL
            )",
            [],
        )
        .context("Failed to create latest_kickoff_task_outputs table")?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_kickoff_task_id ON latest_kickoff_task_outputs(task_id)",
            [],
        )
        .context("Failed to create task_id index")?;

        debug!("Kickoff store tables initialized");
        Ok(())
    }

    /// Remove every stored output (a fresh kickoff starts from scratch)
    pub fn reset(&self) -> Result<()> {
        let conn = self.lock()?;
        let removed = conn
            .execute("DELETE FROM latest_kickoff_task_outputs", [])
            .context("Failed to reset kickoff store")?;
        debug!("Reset kickoff store ({} rows removed)", removed);
        Ok(())
    }

    /// Insert or replace the output stored at `record.task_index`
    pub fn upsert(&self, record: &StoredTaskOutput) -> Result<()> {
        let output = serde_json::to_string(&record.output)
            .context("Failed to serialize task output")?;
        let inputs = serde_json::to_string(&record.inputs)
            .context("Failed to serialize kickoff inputs")?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO latest_kickoff_task_outputs
                (task_index, task_id, task_name, expected_output, output, inputs, was_replayed, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(task_index) DO UPDATE SET
                task_id = excluded.task_id,
                task_name = excluded.task_name,
                expected_output = excluded.expected_output,
                output = excluded.output,
                inputs = excluded.inputs,
                was_replayed = excluded.was_replayed,
                timestamp = excluded.timestamp",
            params![
                record.task_index as i64,
                &record.task_id,
                &record.task_name,
                &record.expected_output,
                &output,
                &inputs,
                record.was_replayed as i32,
                record.timestamp.to_rfc3339(),
            ],
        )
        .context("Failed to store task output")?;

        debug!(
            "Stored output of task {} ({}) at index {}",
            record.task_name, record.task_id, record.task_index
        );
        Ok(())
    }

    /// All stored outputs, ordered by task index
    pub fn load(&self) -> Result<Vec<StoredTaskOutput>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT task_index, task_id, task_name, expected_output, output, inputs, was_replayed, timestamp
                 FROM latest_kickoff_task_outputs ORDER BY task_index",
            )
            .context("Failed to prepare kickoff output query")?;

        let rows = stmt
            .query_map([], row_to_raw)
            .context("Failed to query kickoff outputs")?;

        let mut outputs = Vec::new();
        for row in rows {
            let raw = row.context("Failed to read kickoff output row")?;
            outputs.push(raw.into_stored()?);
        }
        Ok(outputs)
    }

    /// Look up a stored output by task id
    pub fn find(&self, task_id: &str) -> Result<Option<StoredTaskOutput>> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                "SELECT task_index, task_id, task_name, expected_output, output, inputs, was_replayed, timestamp
                 FROM latest_kickoff_task_outputs WHERE task_id = ?1",
                params![task_id],
                row_to_raw,
            )
            .optional()
            .context("Failed to look up task output")?;

        raw.map(RawRow::into_stored).transpose()
    }
}

struct RawRow {
    task_index: i64,
    task_id: String,
    task_name: String,
    expected_output: String,
    output: String,
    inputs: String,
    was_replayed: i32,
    timestamp: String,
}

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        task_index: row.get(0)?,
        task_id: row.get(1)?,
        task_name: row.get(2)?,
        expected_output: row.get(3)?,
        output: row.get(4)?,
        inputs: row.get(5)?,
        was_replayed: row.get(6)?,
        timestamp: row.get(7)?,
    })
}

impl RawRow {
    fn into_stored(self) -> Result<StoredTaskOutput> {
        let output = serde_json::from_str(&self.output)
            .with_context(|| format!("Corrupt output stored for task {}", self.task_id))?;
        let inputs = serde_json::from_str(&self.inputs)
            .with_context(|| format!("Corrupt inputs stored for task {}", self.task_id))?;
        let timestamp = match DateTime::parse_from_rfc3339(&self.timestamp) {
            Ok(dt) => dt.with_timezone(&Utc),
            Err(e) => {
                warn!("Failed to parse timestamp for {}: {}", self.task_id, e);
                Utc::now()
            }
        };

        Ok(StoredTaskOutput {
            task_index: usize::try_from(self.task_index)
                .with_context(|| format!("Negative task index for {}", self.task_id))?,
            task_id: self.task_id,
            task_name: self.task_name,
            expected_output: self.expected_output,
            output,
            inputs,
            was_replayed: self.was_replayed != 0,
            timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(index: usize, id: &str) -> StoredTaskOutput {
        StoredTaskOutput {
            task_index: index,
            task_id: id.to_string(),
            task_name: format!("task_{}", index),
            expected_output: "a summary".to_string(),
            output: json!({"raw": format!("output {}", index)}),
            inputs: json!({"action": "Process emails from yesterday"}),
            was_replayed: false,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_upsert_and_load_ordered() -> Result<()> {
        let store = KickoffStore::in_memory()?;
        store.upsert(&record(1, "b"))?;
        store.upsert(&record(0, "a"))?;

        let rows = store.load()?;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].task_id, "a");
        assert_eq!(rows[1].task_id, "b");
        assert_eq!(rows[1].output["raw"], "output 1");
        Ok(())
    }

    #[test]
    fn test_upsert_replaces_same_index() -> Result<()> {
        let store = KickoffStore::in_memory()?;
        store.upsert(&record(0, "first"))?;

        let mut replayed = record(0, "second");
        replayed.was_replayed = true;
        store.upsert(&replayed)?;

        let rows = store.load()?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].task_id, "second");
        assert!(rows[0].was_replayed);
        Ok(())
    }

    #[test]
    fn test_find_by_task_id() -> Result<()> {
        let store = KickoffStore::in_memory()?;
        store.upsert(&record(0, "a"))?;
        store.upsert(&record(1, "b"))?;

        let found = store.find("b")?.expect("task b stored");
        assert_eq!(found.task_index, 1);
        assert!(store.find("missing")?.is_none());
        Ok(())
    }

    #[test]
    fn test_reset_clears_rows() -> Result<()> {
        let store = KickoffStore::in_memory()?;
        store.upsert(&record(0, "a"))?;
        store.reset()?;
        assert!(store.load()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_persists_across_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("kickoff.db");

        {
            let store = KickoffStore::open(&path)?;
            store.upsert(&record(0, "kept"))?;
        }

        let store = KickoffStore::open(&path)?;
        let rows = store.load()?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].task_id, "kept");
        assert_eq!(rows[0].inputs["action"], "Process emails from yesterday");
        Ok(())
    }
}
