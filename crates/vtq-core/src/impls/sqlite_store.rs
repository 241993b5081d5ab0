//! SqliteStore - SQLite による TaskStore 実装
//!
//! # 実装詳細
//! - `Mutex<Connection>` を 1 本持つ（同一プロセス内の直列化）
//! - プロセス間の排他は SQLite のロック + ガード付き UPDATE に任せる
//! - WAL / foreign_keys / busy_timeout を接続時に設定
//! - トランザクションは `BEGIN IMMEDIATE`（読み取り→書き込みの昇格で詰まらないように）
//!
//! # Workspace
//! テーブル名は `<workspace>_virtual_queue`, `<workspace>_task`,
//! `<workspace>_task_error`。1 つの DB ファイルに複数の workspace を置けます。

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior, ffi, params};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;
use ulid::Ulid;

use crate::domain::time::{NEVER_VISIBLE_MS, from_millis, to_millis};
use crate::domain::{
    NewTask, StoreError, TaskError, TaskId, TaskRecord, TaskStatus, VQueuePolicy, VirtualQueue,
};
use crate::ports::{
    BucketWeight, Candidate, StoreTx, TaskChange, TaskGuard, TaskStore, Visibility,
};

pub const DEFAULT_WORKSPACE: &str = "vtq";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Table names of one workspace.
#[derive(Debug, Clone)]
struct Tables {
    vqueue: String,
    task: String,
    error: String,
}

impl Tables {
    fn new(workspace: &str) -> Result<Self, StoreError> {
        let valid = !workspace.is_empty()
            && workspace
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(StoreError::InvalidWorkspace(workspace.to_string()));
        }
        Ok(Self {
            vqueue: format!("{workspace}_virtual_queue"),
            task: format!("{workspace}_task"),
            error: format!("{workspace}_task_error"),
        })
    }

    fn schema(&self) -> String {
        let Tables {
            vqueue,
            task,
            error,
        } = self;
        format!(
            "CREATE TABLE IF NOT EXISTS {vqueue} (
                name TEXT PRIMARY KEY,
                priority INTEGER NOT NULL,
                bucket_name TEXT NOT NULL,
                bucket_weight INTEGER NOT NULL,
                visibility_timeout INTEGER NOT NULL,
                hidden INTEGER NOT NULL DEFAULT 0,
                hidden_by TEXT,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {task} (
                id TEXT PRIMARY KEY,
                vqueue_name TEXT NOT NULL REFERENCES {vqueue}(name),
                data BLOB NOT NULL,
                priority INTEGER NOT NULL,
                status INTEGER NOT NULL,
                visible_at INTEGER NOT NULL,
                queued_at INTEGER NOT NULL,
                started_at INTEGER,
                ended_at INTEGER,
                lease_count INTEGER NOT NULL DEFAULT 0,
                retries INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS {task}_ready ON {task}(status, visible_at);
            CREATE INDEX IF NOT EXISTS {task}_order ON {task}(vqueue_name, priority DESC, queued_at);
            CREATE TABLE IF NOT EXISTS {error} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL REFERENCES {task}(id),
                error_message TEXT NOT NULL,
                happened_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS {error}_task ON {error}(task_id);"
        )
    }
}

/// SqliteStore は SQLite ファイル（またはメモリ）上の正本
pub struct SqliteStore {
    conn: Mutex<Connection>,
    tables: Tables,
    workspace: String,
}

impl SqliteStore {
    /// ファイルを開き、workspace のテーブルを（無ければ）作成する
    pub fn open(path: impl AsRef<Path>, workspace: &str) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(StoreError::unavailable)?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(StoreError::unavailable)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(StoreError::unavailable)?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(StoreError::unavailable)?;
        debug!(path = %path.display(), workspace, "opened sqlite store");
        Self::init(conn, workspace)
    }

    /// テスト・一時利用向けのメモリ DB
    pub fn open_in_memory(workspace: &str) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(StoreError::unavailable)?;
        Self::init(conn, workspace)
    }

    fn init(conn: Connection, workspace: &str) -> Result<Self, StoreError> {
        let tables = Tables::new(workspace)?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(StoreError::unavailable)?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(StoreError::unavailable)?;
        conn.execute_batch(&tables.schema())
            .map_err(StoreError::unavailable)?;
        Ok(Self {
            conn: Mutex::new(conn),
            tables,
            workspace: workspace.to_string(),
        })
    }

    pub fn workspace(&self) -> &str {
        &self.workspace
    }
}

impl TaskStore for SqliteStore {
    fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn StoreTx) -> Result<T, E>,
        E: From<StoreError>,
    {
        // panic 中に drop された Transaction は rollback 済みなので、poison は無視してよい
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::unavailable)?;
        let out = {
            let mut handle = SqliteTx {
                tx: &tx,
                tables: &self.tables,
            };
            f(&mut handle)?
        };
        tx.commit().map_err(StoreError::unavailable)?;
        Ok(out)
    }
}

struct SqliteTx<'a> {
    tx: &'a Transaction<'a>,
    tables: &'a Tables,
}

impl SqliteTx<'_> {
    /// `UPDATE ... RETURNING name` を実行し、名前順で返す
    fn returning_names(&self, sql: &str, values: Vec<Value>) -> Result<Vec<String>, StoreError> {
        let mut stmt = self.tx.prepare(sql).map_err(StoreError::unavailable)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(values), |row| row.get::<_, String>(0))
            .map_err(StoreError::unavailable)?;
        let mut names = Vec::new();
        for row in rows {
            names.push(row.map_err(StoreError::unavailable)?);
        }
        names.sort();
        Ok(names)
    }
}

fn status_list(statuses: &[TaskStatus]) -> String {
    statuses
        .iter()
        .map(|s| s.code().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn ready_clause() -> String {
    format!(
        "t.status IN ({}) AND t.visible_at <= ?1 AND v.hidden = 0",
        status_list(TaskStatus::SELECTABLE)
    )
}

fn is_constraint(err: &rusqlite::Error, extended: &[std::ffi::c_int]) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if extended.contains(&e.extended_code)
    )
}

fn timestamp(ms: i64, column: &str) -> Result<DateTime<Utc>, StoreError> {
    from_millis(ms).ok_or_else(|| StoreError::Corrupt(format!("{column}={ms}")))
}

fn parse_id(raw: &str) -> Result<TaskId, StoreError> {
    Ulid::from_string(raw)
        .map(TaskId::from_ulid)
        .map_err(|_| StoreError::Corrupt(format!("task id={raw}")))
}

fn status(code: i64) -> Result<TaskStatus, StoreError> {
    TaskStatus::from_code(code).ok_or_else(|| StoreError::Corrupt(format!("status={code}")))
}

fn weight(raw: i64) -> u64 {
    u64::try_from(raw).unwrap_or(0)
}

const TASK_COLUMNS: &str = "id, vqueue_name, data, priority, status, visible_at, queued_at, \
     started_at, ended_at, lease_count, retries, updated_at";

/// Raw task row, decoded outside the rusqlite row callback.
struct RawTask {
    id: String,
    vqueue_name: String,
    data: Vec<u8>,
    priority: i64,
    status: i64,
    visible_at: i64,
    queued_at: i64,
    started_at: Option<i64>,
    ended_at: Option<i64>,
    lease_count: i64,
    retries: i64,
    updated_at: i64,
}

impl RawTask {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            vqueue_name: row.get(1)?,
            data: row.get(2)?,
            priority: row.get(3)?,
            status: row.get(4)?,
            visible_at: row.get(5)?,
            queued_at: row.get(6)?,
            started_at: row.get(7)?,
            ended_at: row.get(8)?,
            lease_count: row.get(9)?,
            retries: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn into_record(self) -> Result<TaskRecord, StoreError> {
        Ok(TaskRecord {
            id: parse_id(&self.id)?,
            vqueue_name: self.vqueue_name,
            data: self.data,
            priority: self.priority,
            status: status(self.status)?,
            visible_at: from_millis(self.visible_at),
            queued_at: timestamp(self.queued_at, "queued_at")?,
            started_at: self
                .started_at
                .map(|ms| timestamp(ms, "started_at"))
                .transpose()?,
            ended_at: self
                .ended_at
                .map(|ms| timestamp(ms, "ended_at"))
                .transpose()?,
            lease_count: self.lease_count,
            retries: self.retries,
            updated_at: timestamp(self.updated_at, "updated_at")?,
        })
    }
}

struct RawVQueue {
    name: String,
    priority: i64,
    bucket_name: String,
    bucket_weight: i64,
    visibility_timeout: i64,
    hidden: bool,
    hidden_by: Option<String>,
    updated_at: i64,
}

impl RawVQueue {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            name: row.get(0)?,
            priority: row.get(1)?,
            bucket_name: row.get(2)?,
            bucket_weight: row.get(3)?,
            visibility_timeout: row.get(4)?,
            hidden: row.get(5)?,
            hidden_by: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn into_vqueue(self) -> Result<VirtualQueue, StoreError> {
        Ok(VirtualQueue {
            name: self.name,
            policy: VQueuePolicy {
                priority: self.priority,
                bucket_name: self.bucket_name,
                bucket_weight: weight(self.bucket_weight),
                visibility_timeout: Duration::from_secs(weight(self.visibility_timeout)),
            },
            hidden: self.hidden,
            hidden_by: self.hidden_by,
            updated_at: timestamp(self.updated_at, "updated_at")?,
        })
    }
}

const VQUEUE_COLUMNS: &str =
    "name, priority, bucket_name, bucket_weight, visibility_timeout, hidden, hidden_by, updated_at";

impl StoreTx for SqliteTx<'_> {
    fn find_vqueue(&mut self, name: &str) -> Result<Option<VirtualQueue>, StoreError> {
        let sql = format!(
            "SELECT {VQUEUE_COLUMNS} FROM {} WHERE name = ?1",
            self.tables.vqueue
        );
        self.tx
            .query_row(&sql, params![name], RawVQueue::read)
            .optional()
            .map_err(StoreError::unavailable)?
            .map(RawVQueue::into_vqueue)
            .transpose()
    }

    fn insert_vqueue(&mut self, vqueue: &VirtualQueue) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT INTO {} ({VQUEUE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            self.tables.vqueue
        );
        let policy = &vqueue.policy;
        let result = self.tx.execute(
            &sql,
            params![
                vqueue.name,
                policy.priority,
                policy.bucket_name,
                i64::try_from(policy.bucket_weight).unwrap_or(i64::MAX),
                i64::try_from(policy.visibility_timeout.as_secs()).unwrap_or(i64::MAX),
                vqueue.hidden,
                vqueue.hidden_by,
                to_millis(vqueue.updated_at),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(e)
                if is_constraint(
                    &e,
                    &[ffi::SQLITE_CONSTRAINT_PRIMARYKEY, ffi::SQLITE_CONSTRAINT_UNIQUE],
                ) =>
            {
                Err(StoreError::DuplicateVirtualQueue(vqueue.name.clone()))
            }
            Err(e) => Err(StoreError::unavailable(e)),
        }
    }

    fn list_vqueues(&mut self) -> Result<Vec<VirtualQueue>, StoreError> {
        let sql = format!(
            "SELECT {VQUEUE_COLUMNS} FROM {} ORDER BY priority DESC, name",
            self.tables.vqueue
        );
        let mut stmt = self.tx.prepare(&sql).map_err(StoreError::unavailable)?;
        let rows = stmt
            .query_map([], RawVQueue::read)
            .map_err(StoreError::unavailable)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(StoreError::unavailable)?.into_vqueue()?);
        }
        Ok(out)
    }

    fn set_vqueue_hidden(
        &mut self,
        names: &[String],
        hidden: bool,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        if names.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE {} SET hidden = ?, hidden_by = NULL, updated_at = ?
             WHERE (hidden != ? OR hidden_by IS NOT NULL) AND name IN ({})",
            self.tables.vqueue,
            placeholders(names.len())
        );
        let mut values = vec![
            Value::from(hidden),
            Value::from(to_millis(now)),
            Value::from(hidden),
        ];
        values.extend(names.iter().cloned().map(Value::from));
        self.tx
            .execute(&sql, rusqlite::params_from_iter(values))
            .map_err(StoreError::unavailable)
    }

    fn hide_vqueues_for(
        &mut self,
        limiter: &str,
        names: &[String],
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "UPDATE {} SET hidden = 1, hidden_by = ?, updated_at = ?
             WHERE hidden = 0 AND name IN ({}) RETURNING name",
            self.tables.vqueue,
            placeholders(names.len())
        );
        let mut values = vec![Value::from(limiter.to_string()), Value::from(to_millis(now))];
        values.extend(names.iter().cloned().map(Value::from));
        self.returning_names(&sql, values)
    }

    fn unhide_vqueues_of(
        &mut self,
        limiter: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError> {
        let sql = format!(
            "UPDATE {} SET hidden = 0, hidden_by = NULL, updated_at = ?
             WHERE hidden_by = ? RETURNING name",
            self.tables.vqueue
        );
        let values = vec![Value::from(to_millis(now)), Value::from(limiter.to_string())];
        self.returning_names(&sql, values)
    }

    fn insert_task(&mut self, task: &NewTask) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT INTO {} (id, vqueue_name, data, priority, status, visible_at, queued_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            self.tables.task
        );
        let result = self.tx.execute(
            &sql,
            params![
                task.id.as_ulid().to_string(),
                task.vqueue_name,
                task.data,
                task.priority,
                TaskStatus::Pending.code(),
                to_millis(task.visible_at),
                to_millis(task.queued_at),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_constraint(&e, &[ffi::SQLITE_CONSTRAINT_FOREIGNKEY]) => {
                Err(StoreError::MissingVirtualQueue(task.vqueue_name.clone()))
            }
            Err(e) => Err(StoreError::unavailable(e)),
        }
    }

    fn get_task(&mut self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM {} WHERE id = ?1",
            self.tables.task
        );
        self.tx
            .query_row(&sql, params![id.as_ulid().to_string()], RawTask::read)
            .optional()
            .map_err(StoreError::unavailable)?
            .map(RawTask::into_record)
            .transpose()
    }

    fn task_status(&mut self, id: TaskId) -> Result<Option<TaskStatus>, StoreError> {
        let sql = format!("SELECT status FROM {} WHERE id = ?1", self.tables.task);
        self.tx
            .query_row(&sql, params![id.as_ulid().to_string()], |row| {
                row.get::<_, i64>(0)
            })
            .optional()
            .map_err(StoreError::unavailable)?
            .map(status)
            .transpose()
    }

    fn update_task_where(
        &mut self,
        id: TaskId,
        guard: &TaskGuard<'_>,
        change: &TaskChange,
    ) -> Result<usize, StoreError> {
        if guard.statuses.is_empty() {
            return Ok(0);
        }
        let task = &self.tables.task;

        let mut sets = vec!["updated_at = ?"];
        let mut values = vec![Value::from(to_millis(change.updated_at))];
        if let Some(status) = change.status {
            sets.push("status = ?");
            values.push(Value::from(status.code()));
        }
        if let Some(visibility) = change.visible_at {
            sets.push("visible_at = ?");
            values.push(Value::from(match visibility {
                Visibility::At(at) => to_millis(at),
                Visibility::Never => NEVER_VISIBLE_MS,
            }));
        }
        if let Some(at) = change.started_at {
            sets.push("started_at = ?");
            values.push(Value::from(to_millis(at)));
        }
        if let Some(ended) = change.ended_at {
            sets.push("ended_at = ?");
            values.push(ended.map(to_millis).map_or(Value::Null, Value::from));
        }
        if change.bump_lease_count {
            sets.push("lease_count = lease_count + 1");
        }
        if change.bump_retries {
            sets.push("retries = retries + 1");
        }

        let mut sql = format!(
            "UPDATE {task} SET {} WHERE id = ? AND status IN ({})",
            sets.join(", "),
            status_list(guard.statuses)
        );
        values.push(Value::from(id.as_ulid().to_string()));
        if let Some(now) = guard.due_by {
            sql.push_str(" AND visible_at <= ?");
            values.push(Value::from(to_millis(now)));
        }
        if let Some(expected) = guard.lease_count {
            sql.push_str(" AND lease_count = ?");
            values.push(Value::from(expected));
        }
        if guard.vqueue_visible {
            sql.push_str(&format!(
                " AND EXISTS (SELECT 1 FROM {} v WHERE v.name = {task}.vqueue_name AND v.hidden = 0)",
                self.tables.vqueue
            ));
        }

        self.tx
            .execute(&sql, rusqlite::params_from_iter(values))
            .map_err(StoreError::unavailable)
    }

    fn delete_task(&mut self, id: TaskId) -> Result<bool, StoreError> {
        let key = id.as_ulid().to_string();
        self.tx
            .execute(
                &format!("DELETE FROM {} WHERE task_id = ?1", self.tables.error),
                params![key],
            )
            .map_err(StoreError::unavailable)?;
        let deleted = self
            .tx
            .execute(
                &format!("DELETE FROM {} WHERE id = ?1", self.tables.task),
                params![key],
            )
            .map_err(StoreError::unavailable)?;
        Ok(deleted > 0)
    }

    fn append_error(&mut self, error: &TaskError) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT INTO {} (task_id, error_message, happened_at) VALUES (?1, ?2, ?3)",
            self.tables.error
        );
        self.tx
            .execute(
                &sql,
                params![
                    error.task_id.as_ulid().to_string(),
                    error.error_message,
                    to_millis(error.happened_at),
                ],
            )
            .map_err(StoreError::unavailable)?;
        Ok(())
    }

    fn task_errors(&mut self, id: TaskId) -> Result<Vec<TaskError>, StoreError> {
        let sql = format!(
            "SELECT error_message, happened_at FROM {} WHERE task_id = ?1 ORDER BY id",
            self.tables.error
        );
        let mut stmt = self.tx.prepare(&sql).map_err(StoreError::unavailable)?;
        let rows = stmt
            .query_map(params![id.as_ulid().to_string()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(StoreError::unavailable)?;
        let mut out = Vec::new();
        for row in rows {
            let (error_message, happened_at) = row.map_err(StoreError::unavailable)?;
            out.push(TaskError {
                task_id: id,
                error_message,
                happened_at: timestamp(happened_at, "happened_at")?,
            });
        }
        Ok(out)
    }

    fn max_ready_priority(&mut self, now: DateTime<Utc>) -> Result<Option<i64>, StoreError> {
        let sql = format!(
            "SELECT MAX(v.priority) FROM {} t JOIN {} v ON v.name = t.vqueue_name WHERE {}",
            self.tables.task,
            self.tables.vqueue,
            ready_clause()
        );
        self.tx
            .query_row(&sql, params![to_millis(now)], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .map_err(StoreError::unavailable)
    }

    fn ready_buckets(
        &mut self,
        now: DateTime<Utc>,
        priority: i64,
    ) -> Result<Vec<BucketWeight>, StoreError> {
        let sql = format!(
            "SELECT v.bucket_name, SUM(v.bucket_weight) FROM {vq} v
             WHERE v.hidden = 0 AND v.priority = ?2
               AND EXISTS (SELECT 1 FROM {task} t
                           WHERE t.vqueue_name = v.name AND t.status IN ({statuses}) AND t.visible_at <= ?1)
             GROUP BY v.bucket_name
             ORDER BY v.bucket_name",
            vq = self.tables.vqueue,
            task = self.tables.task,
            statuses = status_list(TaskStatus::SELECTABLE),
        );
        let mut stmt = self.tx.prepare(&sql).map_err(StoreError::unavailable)?;
        let rows = stmt
            .query_map(params![to_millis(now), priority], |row| {
                Ok(BucketWeight {
                    bucket_name: row.get(0)?,
                    weight: weight(row.get(1)?),
                })
            })
            .map_err(StoreError::unavailable)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::unavailable)
    }

    fn head_of_bucket(
        &mut self,
        now: DateTime<Utc>,
        priority: i64,
        bucket_name: &str,
    ) -> Result<Option<Candidate>, StoreError> {
        let sql = format!(
            "SELECT t.id, t.vqueue_name, t.lease_count, v.visibility_timeout
             FROM {} t JOIN {} v ON v.name = t.vqueue_name
             WHERE {} AND v.priority = ?2 AND v.bucket_name = ?3
             ORDER BY t.priority DESC, t.queued_at ASC, t.rowid ASC
             LIMIT 1",
            self.tables.task,
            self.tables.vqueue,
            ready_clause()
        );
        let raw = self
            .tx
            .query_row(&sql, params![to_millis(now), priority, bucket_name], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })
            .optional()
            .map_err(StoreError::unavailable)?;
        raw.map(|(id, vqueue_name, lease_count, timeout)| {
            Ok(Candidate {
                id: parse_id(&id)?,
                vqueue_name,
                lease_count,
                visibility_timeout: Duration::from_secs(weight(timeout)),
            })
        })
        .transpose()
    }

    fn next_visible_at(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let sql = format!(
            "SELECT MIN(t.visible_at) FROM {} t JOIN {} v ON v.name = t.vqueue_name
             WHERE t.status IN ({}) AND v.hidden = 0 AND t.visible_at > ?1",
            self.tables.task,
            self.tables.vqueue,
            status_list(TaskStatus::SELECTABLE)
        );
        let ms = self
            .tx
            .query_row(&sql, params![to_millis(now)], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .map_err(StoreError::unavailable)?;
        Ok(ms.and_then(from_millis))
    }

    fn count_by_status(&mut self) -> Result<Vec<(TaskStatus, u64)>, StoreError> {
        let sql = format!(
            "SELECT status, COUNT(*) FROM {} GROUP BY status ORDER BY status",
            self.tables.task
        );
        let mut stmt = self.tx.prepare(&sql).map_err(StoreError::unavailable)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))
            .map_err(StoreError::unavailable)?;
        let mut out = Vec::new();
        for row in rows {
            let (code, count) = row.map_err(StoreError::unavailable)?;
            out.push((status(code)?, weight(count)));
        }
        Ok(out)
    }

    fn count_expired_leases(&mut self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE status = ?1 AND visible_at <= ?2",
            self.tables.task
        );
        self.tx
            .query_row(
                &sql,
                params![TaskStatus::Leased.code(), to_millis(now)],
                |row| row.get::<_, i64>(0),
            )
            .map(weight)
            .map_err(StoreError::unavailable)
    }

    fn count_in_flight(
        &mut self,
        vqueues: &[String],
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        if vqueues.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE status = ? AND visible_at > ? AND vqueue_name IN ({})",
            self.tables.task,
            placeholders(vqueues.len())
        );
        let mut values = vec![
            Value::from(TaskStatus::Leased.code()),
            Value::from(to_millis(now)),
        ];
        values.extend(vqueues.iter().cloned().map(Value::from));
        self.tx
            .query_row(&sql, rusqlite::params_from_iter(values), |row| {
                row.get::<_, i64>(0)
            })
            .map(weight)
            .map_err(StoreError::unavailable)
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        let Tables {
            vqueue,
            task,
            error,
        } = self.tables;
        self.tx
            .execute_batch(&format!(
                "DELETE FROM {error}; DELETE FROM {task}; DELETE FROM {vqueue};"
            ))
            .map_err(StoreError::unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn secs(n: i64) -> DateTime<Utc> {
        t0() + chrono::Duration::seconds(n)
    }

    fn vqueue(name: &str, priority: i64, bucket: &str, weight: u64) -> VirtualQueue {
        VirtualQueue::new(
            name,
            VQueuePolicy {
                priority,
                bucket_name: bucket.to_string(),
                bucket_weight: weight,
                visibility_timeout: Duration::from_secs(30),
            },
            t0(),
        )
    }

    fn new_task(vq: &str, priority: i64, queued_at: DateTime<Utc>) -> NewTask {
        NewTask {
            id: TaskId::from_ulid(Ulid::new()),
            vqueue_name: vq.to_string(),
            data: b"payload".to_vec(),
            priority,
            queued_at,
            visible_at: queued_at,
        }
    }

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory(DEFAULT_WORKSPACE).unwrap()
    }

    #[test]
    fn insert_task_without_vqueue_reports_missing_vqueue() {
        let store = store();
        let err = store
            .transaction(|tx| tx.insert_task(&new_task("ghost", 50, t0())))
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingVirtualQueue(name) if name == "ghost"));
    }

    #[test]
    fn duplicate_vqueue_is_distinguishable() {
        let store = store();
        store
            .transaction(|tx| tx.insert_vqueue(&vqueue("vq", 50, "", 100)))
            .unwrap();
        let err = store
            .transaction(|tx| tx.insert_vqueue(&vqueue("vq", 10, "", 1)))
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateVirtualQueue(name) if name == "vq"));
    }

    #[test]
    fn failed_closure_rolls_back() {
        let store = store();
        let result: Result<(), StoreError> = store.transaction(|tx| {
            tx.insert_vqueue(&vqueue("vq", 50, "", 100))?;
            Err(StoreError::Corrupt("boom".into()))
        });
        assert!(result.is_err());

        let found = store.transaction(|tx| tx.find_vqueue("vq")).unwrap();
        assert_eq!(found, None);
    }

    #[test]
    fn task_round_trips_through_row() {
        let store = store();
        let task = new_task("vq", 7, secs(1));
        let record = store
            .transaction(|tx| {
                tx.insert_vqueue(&vqueue("vq", 50, "", 100))?;
                tx.insert_task(&task)?;
                tx.get_task(task.id)
            })
            .unwrap()
            .unwrap();

        assert_eq!(record.id, task.id);
        assert_eq!(record.data, b"payload");
        assert_eq!(record.priority, 7);
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.visible_at, Some(secs(1)));
        assert_eq!(record.queued_at, secs(1));
        assert_eq!(record.ended_at, None);
        assert_eq!(record.lease_count, 0);
    }

    #[test]
    fn guarded_update_touches_only_matching_rows() {
        let store = store();
        let task = new_task("vq", 50, t0());
        store
            .transaction(|tx| {
                tx.insert_vqueue(&vqueue("vq", 50, "", 100))?;
                tx.insert_task(&task)
            })
            .unwrap();

        let claim = TaskChange::at(secs(1))
            .status(TaskStatus::Leased)
            .visible(Visibility::At(secs(31)))
            .started(secs(1))
            .bump_lease_count();

        // 期限前は選択不可
        let early = store
            .transaction(|tx| {
                tx.update_task_where(
                    task.id,
                    &TaskGuard::status_in(TaskStatus::SELECTABLE).due_by(t0() - chrono::Duration::seconds(1)),
                    &claim,
                )
            })
            .unwrap();
        assert_eq!(early, 0);

        let guard = TaskGuard::status_in(TaskStatus::SELECTABLE)
            .due_by(secs(1))
            .lease_count(0)
            .vqueue_visible();
        assert_eq!(
            store
                .transaction(|tx| tx.update_task_where(task.id, &guard, &claim))
                .unwrap(),
            1
        );
        // 同じバージョンでの二度目は失敗
        assert_eq!(
            store
                .transaction(|tx| tx.update_task_where(task.id, &guard, &claim))
                .unwrap(),
            0
        );

        let record = store.transaction(|tx| tx.get_task(task.id)).unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Leased);
        assert_eq!(record.visible_at, Some(secs(31)));
        assert_eq!(record.started_at, Some(secs(1)));
        assert_eq!(record.lease_count, 1);
    }

    #[test]
    fn terminal_visibility_is_never() {
        let store = store();
        let task = new_task("vq", 50, t0());
        let record = store
            .transaction(|tx| {
                tx.insert_vqueue(&vqueue("vq", 50, "", 100))?;
                tx.insert_task(&task)?;
                tx.update_task_where(
                    task.id,
                    &TaskGuard::status_in(&[TaskStatus::Pending]),
                    &TaskChange::at(secs(2))
                        .status(TaskStatus::Succeeded)
                        .visible(Visibility::Never)
                        .ended(Some(secs(2))),
                )?;
                tx.get_task(task.id)
            })
            .unwrap()
            .unwrap();
        assert_eq!(record.visible_at, None);
        assert_eq!(record.ended_at, Some(secs(2)));
    }

    #[test]
    fn limiter_only_releases_vqueues_it_hid() {
        let store = store();
        let names = |xs: &[&str]| xs.iter().map(|x| x.to_string()).collect::<Vec<_>>();
        store
            .transaction(|tx| {
                for name in ["a", "b", "c"] {
                    tx.insert_vqueue(&vqueue(name, 50, "", 100))?;
                }
                tx.set_vqueue_hidden(&names(&["c"]), true, t0())
            })
            .unwrap();

        let hidden = store
            .transaction(|tx| tx.hide_vqueues_for("lim", &names(&["b", "a", "c"]), secs(1)))
            .unwrap();
        assert_eq!(hidden, names(&["a", "b"]));
        let c = store.transaction(|tx| tx.find_vqueue("c")).unwrap().unwrap();
        assert_eq!(c.hidden_by, None);

        // 運用者の pause は所有者を運用者に移す
        let taken = store
            .transaction(|tx| tx.set_vqueue_hidden(&names(&["b"]), true, secs(2)))
            .unwrap();
        assert_eq!(taken, 1);

        let released = store
            .transaction(|tx| tx.unhide_vqueues_of("lim", secs(3)))
            .unwrap();
        assert_eq!(released, names(&["a"]));
        let vqueues = store.transaction(|tx| tx.list_vqueues()).unwrap();
        let still_hidden: Vec<&str> = vqueues
            .iter()
            .filter(|v| v.hidden)
            .map(|v| v.name.as_str())
            .collect();
        assert_eq!(still_hidden, vec!["b", "c"]);
    }

    #[test]
    fn hidden_vqueue_blocks_claim_guard() {
        let store = store();
        let task = new_task("vq", 50, t0());
        store
            .transaction(|tx| {
                tx.insert_vqueue(&vqueue("vq", 50, "", 100))?;
                tx.insert_task(&task)?;
                tx.set_vqueue_hidden(&["vq".to_string()], true, t0())
            })
            .unwrap();

        let affected = store
            .transaction(|tx| {
                tx.update_task_where(
                    task.id,
                    &TaskGuard::status_in(TaskStatus::SELECTABLE)
                        .due_by(secs(1))
                        .vqueue_visible(),
                    &TaskChange::at(secs(1)).status(TaskStatus::Leased),
                )
            })
            .unwrap();
        assert_eq!(affected, 0);
        assert_eq!(
            store.transaction(|tx| tx.max_ready_priority(secs(1))).unwrap(),
            None
        );
    }

    #[test]
    fn selection_queries_follow_layers_and_buckets() {
        let store = store();
        let low = new_task("low", 99, t0());
        let a_late = new_task("a", 50, secs(2));
        let a_early = new_task("a", 50, secs(1));
        let a_high = new_task("a", 60, secs(3));
        let b = new_task("b", 50, t0());
        store
            .transaction(|tx| {
                tx.insert_vqueue(&vqueue("low", 10, "", 100))?;
                tx.insert_vqueue(&vqueue("a", 90, "x", 1))?;
                tx.insert_vqueue(&vqueue("a2", 90, "x", 7))?;
                tx.insert_vqueue(&vqueue("b", 90, "y", 3))?;
                for task in [&low, &a_late, &a_early, &a_high, &b] {
                    tx.insert_task(task)?;
                }
                Ok::<_, StoreError>(())
            })
            .unwrap();

        let now = secs(10);
        let (max, buckets, head) = store
            .transaction(|tx| {
                let max = tx.max_ready_priority(now)?;
                let buckets = tx.ready_buckets(now, 90)?;
                let head = tx.head_of_bucket(now, 90, "x")?;
                Ok::<_, StoreError>((max, buckets, head))
            })
            .unwrap();

        assert_eq!(max, Some(90));
        // a2 はタスクが無いので重みに含めない
        assert_eq!(
            buckets,
            vec![
                BucketWeight {
                    bucket_name: "x".into(),
                    weight: 1
                },
                BucketWeight {
                    bucket_name: "y".into(),
                    weight: 3
                },
            ]
        );
        let head = head.unwrap();
        assert_eq!(head.id, a_high.id);
        assert_eq!(head.visibility_timeout, Duration::from_secs(30));
    }

    #[test]
    fn same_millisecond_ties_break_by_insertion_order() {
        let store = store();
        let first = new_task("vq", 50, t0());
        let second = new_task("vq", 50, t0());
        let head = store
            .transaction(|tx| {
                tx.insert_vqueue(&vqueue("vq", 50, "", 100))?;
                tx.insert_task(&first)?;
                tx.insert_task(&second)?;
                tx.head_of_bucket(t0(), 50, "")
            })
            .unwrap()
            .unwrap();
        assert_eq!(head.id, first.id);
    }

    #[test]
    fn delete_removes_error_history() {
        let store = store();
        let task = new_task("vq", 50, t0());
        let (deleted, again) = store
            .transaction(|tx| {
                tx.insert_vqueue(&vqueue("vq", 50, "", 100))?;
                tx.insert_task(&task)?;
                tx.append_error(&TaskError {
                    task_id: task.id,
                    error_message: "boom".into(),
                    happened_at: t0(),
                })?;
                let deleted = tx.delete_task(task.id)?;
                let again = tx.delete_task(task.id)?;
                Ok::<_, StoreError>((deleted, again))
            })
            .unwrap();
        assert!(deleted);
        assert!(!again);
        assert!(store.transaction(|tx| tx.task_errors(task.id)).unwrap().is_empty());
    }

    #[test]
    fn workspaces_are_isolated_and_flushable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vtq.db");
        let first = SqliteStore::open(&path, "first").unwrap();
        let second = SqliteStore::open(&path, "second").unwrap();

        first
            .transaction(|tx| {
                tx.insert_vqueue(&vqueue("vq", 50, "", 100))?;
                tx.insert_task(&new_task("vq", 50, t0()))
            })
            .unwrap();

        assert_eq!(
            second.transaction(|tx| tx.count_by_status()).unwrap(),
            vec![]
        );
        assert_eq!(
            first.transaction(|tx| tx.count_by_status()).unwrap(),
            vec![(TaskStatus::Pending, 1)]
        );

        first.transaction(|tx| tx.flush()).unwrap();
        assert_eq!(first.transaction(|tx| tx.count_by_status()).unwrap(), vec![]);
        assert_eq!(first.transaction(|tx| tx.list_vqueues()).unwrap(), vec![]);
    }

    #[test]
    fn rejects_unsafe_workspace_names() {
        assert!(matches!(
            SqliteStore::open_in_memory("x; DROP TABLE y"),
            Err(StoreError::InvalidWorkspace(_))
        ));
    }
}
