//! SQLite-backed persistence for runs, experiments, the experiment queue,
//! and published network snapshots.
//!
//! Connections are opened per call and blocking work runs under
//! `spawn_blocking`, so the async handlers never hold a connection across an
//! await point. Timestamps are unix milliseconds.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use thiserror::Error;

use arbor::ids::now_ms;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage: {0}")]
    Storage(String),
    #[error("serialize: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

/// One persisted run.
#[derive(Clone, Debug, Default)]
pub struct RunRow {
    pub run_id: String,
    pub network_id: Option<i64>,
    pub network_version_id: Option<i64>,
    pub graph_version_key: Option<String>,
    pub user_message: Option<String>,
    pub status: String,
    pub request_payload: Value,
    pub response_payload: Value,
    pub experiment_id: Option<String>,
    pub experiment_desc: Option<String>,
    pub experiment_item_index: Option<i64>,
    pub experiment_iteration: Option<i64>,
    pub experiment_item_payload: Option<Value>,
    pub created_at_ms: i64,
}

/// One registered experiment.
#[derive(Clone, Debug)]
pub struct ExperimentRow {
    pub experiment_id: String,
    pub description: Option<String>,
    pub payload: Value,
    pub created_at_ms: i64,
}

/// One queued run of one experiment item.
#[derive(Clone, Debug)]
pub struct QueueRow {
    pub id: i64,
    pub experiment_id: String,
    pub item_index: i64,
    pub iteration: i64,
    pub status: String,
    pub enqueued_at_ms: i64,
    pub started_at_ms: Option<i64>,
    pub completed_at_ms: Option<i64>,
    pub error: Option<String>,
    pub payload: Value,
    pub result: Option<Value>,
}

/// A queue row to insert: the exact run request to execute.
#[derive(Clone, Debug)]
pub struct QueueItemInsert {
    pub experiment_id: String,
    pub item_index: i64,
    pub iteration: i64,
    pub payload: Value,
}

/// A published snapshot resolved by `(name, version)` or the current flag.
#[derive(Clone, Debug)]
pub struct SnapshotRow {
    pub network_id: i64,
    pub version: i64,
    pub compiled_graph: Value,
}

impl SnapshotRow {
    pub fn graph_version_key(&self) -> String {
        format!("{}:{}", self.network_id, self.version)
    }
}

/// SQLite store. Cheap to clone behind an `Arc`; every method opens its own
/// connection.
pub struct Store {
    db_path: PathBuf,
}

impl Store {
    /// Opens (or creates) the database and ensures the schema exists.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_path = path.as_ref().to_path_buf();
        let conn = Connection::open(&db_path)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS run_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL UNIQUE,
                network_id INTEGER,
                network_version_id INTEGER,
                graph_version_key TEXT,
                user_message TEXT,
                status TEXT NOT NULL DEFAULT 'unknown',
                request_payload TEXT NOT NULL,
                response_payload TEXT NOT NULL,
                experiment_id TEXT,
                experiment_desc TEXT,
                experiment_item_index INTEGER,
                experiment_iteration INTEGER,
                experiment_item_payload TEXT,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS ix_run_history_experiment_id
                ON run_history (experiment_id);
            CREATE TABLE IF NOT EXISTS experiment_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                experiment_id TEXT NOT NULL UNIQUE,
                description TEXT,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS experiment_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                experiment_id TEXT NOT NULL,
                item_index INTEGER NOT NULL,
                iteration INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                enqueued_at INTEGER NOT NULL,
                started_at INTEGER,
                completed_at INTEGER,
                error TEXT,
                payload TEXT NOT NULL,
                result TEXT
            );
            CREATE INDEX IF NOT EXISTS ix_experiment_queue_experiment_id
                ON experiment_queue (experiment_id);
            CREATE INDEX IF NOT EXISTS ix_experiment_queue_status
                ON experiment_queue (status, enqueued_at);
            CREATE TABLE IF NOT EXISTS network_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                version INTEGER NOT NULL,
                is_current INTEGER NOT NULL DEFAULT 0,
                compiled_graph TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE (name, version)
            );
            "#,
        )?;
        Ok(Self { db_path })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path)?;
            f(conn)
        })
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?
    }

    // --- runs ---

    pub async fn insert_run(&self, row: RunRow) -> Result<(), StoreError> {
        let request_payload = serde_json::to_string(&row.request_payload)?;
        let response_payload = serde_json::to_string(&row.response_payload)?;
        let experiment_item_payload = row
            .experiment_item_payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.blocking(move |conn| {
            conn.execute(
                r#"
                INSERT INTO run_history (
                    run_id, network_id, network_version_id, graph_version_key,
                    user_message, status, request_payload, response_payload,
                    experiment_id, experiment_desc, experiment_item_index,
                    experiment_iteration, experiment_item_payload, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                "#,
                params![
                    row.run_id,
                    row.network_id,
                    row.network_version_id,
                    row.graph_version_key,
                    row.user_message,
                    row.status,
                    request_payload,
                    response_payload,
                    row.experiment_id,
                    row.experiment_desc,
                    row.experiment_item_index,
                    row.experiment_iteration,
                    experiment_item_payload,
                    row.created_at_ms,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn list_runs(&self, limit: i64) -> Result<Vec<RunRow>, StoreError> {
        let limit = if limit <= 0 { 20 } else { limit };
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT run_id, network_id, network_version_id, graph_version_key, user_message, \
                 status, request_payload, response_payload, experiment_id, experiment_desc, \
                 experiment_item_index, experiment_iteration, experiment_item_payload, created_at \
                 FROM run_history ORDER BY created_at DESC, id DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit], row_to_run)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<RunRow>, StoreError> {
        let run_id = run_id.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT run_id, network_id, network_version_id, graph_version_key, user_message, \
                 status, request_payload, response_payload, experiment_id, experiment_desc, \
                 experiment_item_index, experiment_iteration, experiment_item_payload, created_at \
                 FROM run_history WHERE run_id = ?1",
            )?;
            let row = stmt.query_row(params![run_id], row_to_run).optional()?;
            Ok(row)
        })
        .await
    }

    // --- snapshots ---

    /// Publishes a compiled graph for `(name, version)` and marks it current.
    pub async fn publish_snapshot(
        &self,
        name: &str,
        version: i64,
        compiled_graph: &Value,
    ) -> Result<(), StoreError> {
        let name = name.trim().to_lowercase();
        let graph = serde_json::to_string(compiled_graph)?;
        let now = now_ms();
        self.blocking(move |conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "UPDATE network_snapshots SET is_current = 0 WHERE name = ?1",
                params![name],
            )?;
            tx.execute(
                "INSERT INTO network_snapshots (name, version, is_current, compiled_graph, created_at) \
                 VALUES (?1, ?2, 1, ?3, ?4) \
                 ON CONFLICT (name, version) DO UPDATE SET is_current = 1, compiled_graph = ?3",
                params![name, version, graph, now],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Resolves `(name, version)`, or the current version when `version` is
    /// `None`. Returns `None` when the network or version is unknown.
    pub async fn load_snapshot(
        &self,
        name: &str,
        version: Option<i64>,
    ) -> Result<Option<SnapshotRow>, StoreError> {
        let name = name.trim().to_lowercase();
        self.blocking(move |conn| {
            let sql = match version {
                Some(_) => {
                    "SELECT id, version, compiled_graph FROM network_snapshots \
                     WHERE name = ?1 AND version = ?2"
                }
                None => {
                    "SELECT id, version, compiled_graph FROM network_snapshots \
                     WHERE name = ?1 AND is_current = 1 ORDER BY version DESC LIMIT 1"
                }
            };
            let mut stmt = conn.prepare(sql)?;
            let map = |row: &rusqlite::Row<'_>| -> rusqlite::Result<(i64, i64, String)> {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            };
            let found = match version {
                Some(v) => stmt.query_row(params![name, v], map).optional()?,
                None => stmt.query_row(params![name], map).optional()?,
            };
            let Some((network_id, version, graph)) = found else {
                return Ok(None);
            };
            let compiled_graph: Value = serde_json::from_str(&graph)?;
            Ok(Some(SnapshotRow {
                network_id,
                version,
                compiled_graph,
            }))
        })
        .await
    }

    // --- experiments ---

    pub async fn insert_experiment(
        &self,
        experiment_id: &str,
        description: Option<&str>,
        payload: &Value,
    ) -> Result<(), StoreError> {
        let experiment_id = experiment_id.to_string();
        let description = description.map(String::from);
        let payload = serde_json::to_string(payload)?;
        let now = now_ms();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO experiment_history (experiment_id, description, payload, created_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![experiment_id, description, payload, now],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn list_experiments(&self, limit: i64) -> Result<Vec<ExperimentRow>, StoreError> {
        let limit = if limit <= 0 { 50 } else { limit };
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT experiment_id, description, payload, created_at FROM experiment_history \
                 ORDER BY created_at DESC, id DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit], row_to_experiment)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn get_experiment(
        &self,
        experiment_id: &str,
    ) -> Result<Option<ExperimentRow>, StoreError> {
        let experiment_id = experiment_id.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT experiment_id, description, payload, created_at FROM experiment_history \
                 WHERE experiment_id = ?1",
            )?;
            let row = stmt
                .query_row(params![experiment_id], row_to_experiment)
                .optional()?;
            Ok(row)
        })
        .await
    }

    // --- experiment queue ---

    /// Writes all queue rows in one transaction, in `(item_index, iteration)`
    /// order.
    pub async fn enqueue_items(&self, mut items: Vec<QueueItemInsert>) -> Result<(), StoreError> {
        items.sort_by_key(|i| (i.item_index, i.iteration));
        let now = now_ms();
        let encoded: Vec<(QueueItemInsert, String)> = items
            .into_iter()
            .map(|item| {
                let payload = serde_json::to_string(&item.payload)?;
                Ok((item, payload))
            })
            .collect::<Result<_, serde_json::Error>>()?;
        self.blocking(move |conn| {
            let tx = conn.unchecked_transaction()?;
            for (item, payload) in &encoded {
                tx.execute(
                    "INSERT INTO experiment_queue \
                     (experiment_id, item_index, iteration, status, enqueued_at, payload) \
                     VALUES (?1, ?2, ?3, 'pending', ?4, ?5)",
                    params![item.experiment_id, item.item_index, item.iteration, now, payload],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Leases the oldest pending row: flips it to `in_progress` and stamps
    /// `started_at`, all in one immediate transaction. Returns `None` when
    /// the queue is drained.
    pub async fn lease_next(&self) -> Result<Option<QueueRow>, StoreError> {
        self.blocking(move |mut conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let found = {
                let mut stmt = tx.prepare(
                    "SELECT id, experiment_id, item_index, iteration, status, enqueued_at, \
                     started_at, completed_at, error, payload, result \
                     FROM experiment_queue WHERE status = 'pending' \
                     ORDER BY enqueued_at ASC, id ASC LIMIT 1",
                )?;
                stmt.query_row([], row_to_queue).optional()?
            };
            let Some(mut row) = found else {
                tx.commit()?;
                return Ok(None);
            };
            let started_at = now_ms();
            tx.execute(
                "UPDATE experiment_queue SET status = 'in_progress', started_at = ?1 WHERE id = ?2",
                params![started_at, row.id],
            )?;
            tx.commit()?;
            row.status = "in_progress".to_string();
            row.started_at_ms = Some(started_at);
            Ok(Some(row))
        })
        .await
    }

    /// Records the terminal status of a leased row.
    pub async fn mark_completed(
        &self,
        id: i64,
        succeeded: bool,
        error: Option<&str>,
        result: Option<&Value>,
    ) -> Result<(), StoreError> {
        let status = if succeeded { "completed" } else { "failed" };
        let error = error.map(String::from);
        let result = result.map(serde_json::to_string).transpose()?;
        let now = now_ms();
        self.blocking(move |conn| {
            conn.execute(
                "UPDATE experiment_queue SET status = ?1, completed_at = ?2, error = ?3, result = ?4 \
                 WHERE id = ?5",
                params![status, now, error, result, id],
            )?;
            Ok(())
        })
        .await
    }

    /// Resets `in_progress` rows whose lease is older than `stale_ms` back to
    /// `pending`. An interrupted run is retried; duplicate external side
    /// effects are possible and documented on the worker.
    pub async fn recover_stale(&self, stale_ms: i64) -> Result<usize, StoreError> {
        let cutoff = now_ms() - stale_ms;
        self.blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE experiment_queue \
                 SET status = 'pending', started_at = NULL, error = NULL, result = NULL \
                 WHERE status = 'in_progress' AND started_at IS NOT NULL AND started_at < ?1",
                params![cutoff],
            )?;
            Ok(changed)
        })
        .await
    }

    pub async fn queue_rows_for_experiment(
        &self,
        experiment_id: &str,
    ) -> Result<Vec<QueueRow>, StoreError> {
        let experiment_id = experiment_id.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, experiment_id, item_index, iteration, status, enqueued_at, \
                 started_at, completed_at, error, payload, result \
                 FROM experiment_queue WHERE experiment_id = ?1 \
                 ORDER BY item_index ASC, iteration ASC",
            )?;
            let rows = stmt
                .query_map(params![experiment_id], row_to_queue)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// `(status, count)` pairs for one experiment's queue rows.
    pub async fn queue_counts_for_experiment(
        &self,
        experiment_id: &str,
    ) -> Result<Vec<(String, i64)>, StoreError> {
        let experiment_id = experiment_id.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT status, COUNT(*) FROM experiment_queue WHERE experiment_id = ?1 \
                 GROUP BY status",
            )?;
            let rows = stmt
                .query_map(params![experiment_id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }
}

fn parse_json_column(raw: Option<String>) -> Option<Value> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRow> {
    let request_payload: String = row.get(6)?;
    let response_payload: String = row.get(7)?;
    Ok(RunRow {
        run_id: row.get(0)?,
        network_id: row.get(1)?,
        network_version_id: row.get(2)?,
        graph_version_key: row.get(3)?,
        user_message: row.get(4)?,
        status: row.get(5)?,
        request_payload: serde_json::from_str(&request_payload).unwrap_or(Value::Null),
        response_payload: serde_json::from_str(&response_payload).unwrap_or(Value::Null),
        experiment_id: row.get(8)?,
        experiment_desc: row.get(9)?,
        experiment_item_index: row.get(10)?,
        experiment_iteration: row.get(11)?,
        experiment_item_payload: parse_json_column(row.get(12)?),
        created_at_ms: row.get(13)?,
    })
}

fn row_to_experiment(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExperimentRow> {
    let payload: String = row.get(2)?;
    Ok(ExperimentRow {
        experiment_id: row.get(0)?,
        description: row.get(1)?,
        payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
        created_at_ms: row.get(3)?,
    })
}

fn row_to_queue(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueRow> {
    let payload: String = row.get(9)?;
    Ok(QueueRow {
        id: row.get(0)?,
        experiment_id: row.get(1)?,
        item_index: row.get(2)?,
        iteration: row.get(3)?,
        status: row.get(4)?,
        enqueued_at_ms: row.get(5)?,
        started_at_ms: row.get(6)?,
        completed_at_ms: row.get(7)?,
        error: row.get(8)?,
        payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
        result: parse_json_column(row.get(10)?),
    })
}
