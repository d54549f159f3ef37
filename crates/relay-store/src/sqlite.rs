//! SQLite store and task queue
//!
//! Tasks live in the same database as events, so `dispatch` writes the event
//! and its tasks in one transaction. Leases are claimed with a conditional
//! UPDATE; a claim only succeeds when it changes exactly one row, so two
//! leasers can never hold the same task. Timestamps are stored as epoch
//! milliseconds.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_common::{
    later_by, Attempt, AttemptStatus, Endpoint, EndpointId, Event, EventId, LeaseToken, LeasedTask, Source,
    Task,
};
use relay_queue::memory::wait_until_due;
use relay_queue::{QueueError, TaskQueue, WorkSignal};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::{select_endpoints, validate_endpoint, Result, Store, StoreError};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS sources (
        id TEXT PRIMARY KEY,
        workspace_id TEXT NOT NULL,
        name TEXT,
        path TEXT NOT NULL,
        methods TEXT NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1,
        async_ingest INTEGER NOT NULL DEFAULT 0,
        response TEXT,
        plugins TEXT NOT NULL,
        endpoints TEXT,
        created_at BIGINT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS endpoints (
        id TEXT PRIMARY KEY,
        workspace_id TEXT NOT NULL,
        name TEXT,
        url TEXT NOT NULL,
        method TEXT NOT NULL,
        headers TEXT NOT NULL,
        timeout_ms BIGINT,
        enabled INTEGER NOT NULL DEFAULT 1,
        events TEXT NOT NULL,
        retry TEXT,
        created_at BIGINT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_endpoints_workspace ON endpoints(workspace_id)",
    r#"
    CREATE TABLE IF NOT EXISTS events (
        id TEXT PRIMARY KEY,
        workspace_id TEXT NOT NULL,
        event_type TEXT NOT NULL,
        data TEXT NOT NULL,
        created_at BIGINT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        event_id TEXT NOT NULL REFERENCES events(id),
        endpoint_id TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        scheduled_at BIGINT NOT NULL,
        lease_token TEXT,
        lease_expires_at BIGINT,
        created_at BIGINT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_tasks_scheduled ON tasks(scheduled_at)",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_lease_token ON tasks(lease_token)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_event ON tasks(event_id)",
    r#"
    CREATE TABLE IF NOT EXISTS attempts (
        id TEXT PRIMARY KEY,
        task_id TEXT NOT NULL,
        event_id TEXT NOT NULL,
        endpoint_id TEXT NOT NULL,
        attempt_number INTEGER NOT NULL,
        status TEXT NOT NULL,
        status_code INTEGER,
        request TEXT NOT NULL,
        response TEXT,
        error TEXT,
        duration_ms BIGINT NOT NULL,
        exhausted INTEGER NOT NULL DEFAULT 0,
        created_at BIGINT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_attempts_task ON attempts(task_id)",
    "CREATE INDEX IF NOT EXISTS idx_attempts_event ON attempts(event_id)",
];

pub struct SqliteStore {
    pool: SqlitePool,
    notify: Notify,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            notify: Notify::new(),
        }
    }

    /// Open a pool for `url`, creating the database file if needed
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Ok(Self::new(pool))
    }

    /// Private in-memory database on a single pinned connection
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self::new(pool);
        store.init_schema().await?;
        Ok(store)
    }

    pub async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("Relay schema initialized (SQLite)");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Earliest time any task becomes leasable
    async fn next_due_at(&self) -> Option<DateTime<Utc>> {
        let row = sqlx::query(
            "SELECT MIN(MAX(scheduled_at, COALESCE(lease_expires_at, 0))) AS due FROM tasks",
        )
        .fetch_one(&self.pool)
        .await
        .ok()?;
        let due: Option<i64> = row.try_get("due").ok()?;
        due.and_then(DateTime::from_timestamp_millis)
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn timestamp(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| StoreError::InvalidData(format!("invalid timestamp {}", ms)))
}

fn json_column<T: serde::de::DeserializeOwned>(row: &SqliteRow, column: &str) -> Result<T> {
    let raw: String = row.try_get(column)?;
    Ok(serde_json::from_str(&raw)?)
}

fn optional_json_column<T: serde::de::DeserializeOwned>(row: &SqliteRow, column: &str) -> Result<Option<T>> {
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|s| serde_json::from_str(&s)).transpose().map_err(StoreError::from)
}

fn parse_event_id(raw: &str) -> Result<EventId> {
    raw.parse()
        .map_err(|e| StoreError::InvalidData(format!("invalid event id {}: {}", raw, e)))
}

fn source_from_row(row: &SqliteRow) -> Result<Source> {
    Ok(Source {
        id: row.try_get("id")?,
        workspace_id: row.try_get("workspace_id")?,
        name: row.try_get("name")?,
        path: row.try_get("path")?,
        methods: json_column(row, "methods")?,
        enabled: row.try_get("enabled")?,
        async_ingest: row.try_get("async_ingest")?,
        response: optional_json_column(row, "response")?,
        plugins: json_column(row, "plugins")?,
        endpoints: optional_json_column(row, "endpoints")?,
    })
}

fn endpoint_from_row(row: &SqliteRow) -> Result<Endpoint> {
    let timeout_ms: Option<i64> = row.try_get("timeout_ms")?;
    Ok(Endpoint {
        id: row.try_get("id")?,
        workspace_id: row.try_get("workspace_id")?,
        name: row.try_get("name")?,
        url: row.try_get("url")?,
        method: row.try_get("method")?,
        headers: json_column(row, "headers")?,
        timeout_ms: timeout_ms.map(|t| t.max(0) as u64),
        enabled: row.try_get("enabled")?,
        events: json_column(row, "events")?,
        retry: optional_json_column(row, "retry")?,
    })
}

fn event_from_row(row: &SqliteRow) -> Result<Event> {
    let id: String = row.try_get("id")?;
    Ok(Event {
        id: parse_event_id(&id)?,
        workspace_id: row.try_get("workspace_id")?,
        event_type: row.try_get("event_type")?,
        data: json_column(row, "data")?,
        created_at: timestamp(row.try_get("created_at")?)?,
    })
}

fn task_from_row(row: &SqliteRow) -> Result<Task> {
    let event_id: String = row.try_get("event_id")?;
    let attempts: i64 = row.try_get("attempts")?;
    Ok(Task {
        id: row.try_get("id")?,
        event_id: parse_event_id(&event_id)?,
        endpoint_id: row.try_get("endpoint_id")?,
        attempts: attempts.max(0) as u32,
        scheduled_at: timestamp(row.try_get("scheduled_at")?)?,
    })
}

fn attempt_from_row(row: &SqliteRow) -> Result<Attempt> {
    let event_id: String = row.try_get("event_id")?;
    let status: String = row.try_get("status")?;
    let status_code: Option<i64> = row.try_get("status_code")?;
    let attempt_number: i64 = row.try_get("attempt_number")?;
    let duration_ms: i64 = row.try_get("duration_ms")?;
    Ok(Attempt {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        event_id: parse_event_id(&event_id)?,
        endpoint_id: row.try_get("endpoint_id")?,
        attempt_number: attempt_number.max(0) as u32,
        status: AttemptStatus::from_str(&status).map_err(StoreError::InvalidData)?,
        status_code: status_code.map(|c| c as u16),
        request: json_column(row, "request")?,
        response: optional_json_column(row, "response")?,
        error: row.try_get("error")?,
        duration_ms: duration_ms.max(0) as u64,
        exhausted: row.try_get("exhausted")?,
        created_at: timestamp(row.try_get("created_at")?)?,
    })
}

fn queue_error(e: impl std::fmt::Display) -> QueueError {
    QueueError::Backend(e.to_string())
}

// ============================================================================
// Store
// ============================================================================

#[async_trait]
impl Store for SqliteStore {
    async fn list_sources(&self) -> Result<Vec<Source>> {
        let rows = sqlx::query("SELECT * FROM sources ORDER BY created_at, rowid")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(source_from_row).collect()
    }

    async fn resolve_endpoints(&self, source: &Source, event_type: &str) -> Result<Vec<Endpoint>> {
        let rows = sqlx::query("SELECT * FROM endpoints WHERE workspace_id = ? AND enabled = 1 ORDER BY created_at, rowid")
            .bind(&source.workspace_id)
            .fetch_all(&self.pool)
            .await?;
        let candidates = rows.iter().map(endpoint_from_row).collect::<Result<Vec<_>>>()?;
        Ok(select_endpoints(source, event_type, &candidates))
    }

    async fn dispatch(&self, event: &Event, endpoint_ids: &[EndpointId]) -> Result<Vec<Task>> {
        let tasks: Vec<Task> = endpoint_ids
            .iter()
            .map(|endpoint_id| Task::new(event.id, endpoint_id.clone()))
            .collect();
        let now = Utc::now().timestamp_millis();

        // dropping the transaction on any error rolls it back
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO events (id, workspace_id, event_type, data, created_at) VALUES (?, ?, ?, ?, ?)")
            .bind(event.id.to_string())
            .bind(&event.workspace_id)
            .bind(&event.event_type)
            .bind(serde_json::to_string(&event.data)?)
            .bind(event.created_at.timestamp_millis())
            .execute(&mut *tx)
            .await?;

        for task in &tasks {
            sqlx::query(
                "INSERT INTO tasks (id, event_id, endpoint_id, attempts, scheduled_at, created_at) VALUES (?, ?, ?, 0, ?, ?)",
            )
            .bind(&task.id)
            .bind(task.event_id.to_string())
            .bind(&task.endpoint_id)
            .bind(task.scheduled_at.timestamp_millis())
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        self.notify.notify_waiters();

        debug!(event_id = %event.id, tasks = tasks.len(), "Dispatched event (SQLite)");
        Ok(tasks)
    }

    async fn get_event(&self, id: &EventId) -> Result<Option<Event>> {
        let row = sqlx::query("SELECT * FROM events WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(event_from_row).transpose()
    }

    async fn get_endpoint(&self, id: &str) -> Result<Option<Endpoint>> {
        let row = sqlx::query("SELECT * FROM endpoints WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(endpoint_from_row).transpose()
    }

    async fn insert_attempt(&self, attempt: &Attempt) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO attempts (
                id, task_id, event_id, endpoint_id, attempt_number, status, status_code,
                request, response, error, duration_ms, exhausted, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&attempt.id)
        .bind(&attempt.task_id)
        .bind(attempt.event_id.to_string())
        .bind(&attempt.endpoint_id)
        .bind(attempt.attempt_number as i64)
        .bind(attempt.status.as_str())
        .bind(attempt.status_code.map(|c| c as i64))
        .bind(serde_json::to_string(&attempt.request)?)
        .bind(attempt.response.as_ref().map(serde_json::to_string).transpose()?)
        .bind(&attempt.error)
        .bind(attempt.duration_ms as i64)
        .bind(attempt.exhausted)
        .bind(attempt.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_attempts(&self, task_id: &str) -> Result<Vec<Attempt>> {
        let rows = sqlx::query("SELECT * FROM attempts WHERE task_id = ? ORDER BY attempt_number, created_at")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(attempt_from_row).collect()
    }

    async fn list_attempts_for_event(&self, event_id: &EventId) -> Result<Vec<Attempt>> {
        let rows = sqlx::query("SELECT * FROM attempts WHERE event_id = ? ORDER BY created_at, attempt_number")
            .bind(event_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(attempt_from_row).collect()
    }

    async fn count_tasks_for_event(&self, event_id: &EventId) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM tasks WHERE event_id = ?")
            .bind(event_id.to_string())
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n.max(0) as u64)
    }

    async fn upsert_source(&self, source: &Source) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sources (id, workspace_id, name, path, methods, enabled, async_ingest, response, plugins, endpoints, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                workspace_id = excluded.workspace_id,
                name = excluded.name,
                path = excluded.path,
                methods = excluded.methods,
                enabled = excluded.enabled,
                async_ingest = excluded.async_ingest,
                response = excluded.response,
                plugins = excluded.plugins,
                endpoints = excluded.endpoints
            "#,
        )
        .bind(&source.id)
        .bind(&source.workspace_id)
        .bind(&source.name)
        .bind(&source.path)
        .bind(serde_json::to_string(&source.methods)?)
        .bind(source.enabled)
        .bind(source.async_ingest)
        .bind(source.response.as_ref().map(serde_json::to_string).transpose()?)
        .bind(serde_json::to_string(&source.plugins)?)
        .bind(source.endpoints.as_ref().map(serde_json::to_string).transpose()?)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_endpoint(&self, endpoint: &Endpoint) -> Result<()> {
        validate_endpoint(endpoint)?;
        sqlx::query(
            r#"
            INSERT INTO endpoints (id, workspace_id, name, url, method, headers, timeout_ms, enabled, events, retry, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                workspace_id = excluded.workspace_id,
                name = excluded.name,
                url = excluded.url,
                method = excluded.method,
                headers = excluded.headers,
                timeout_ms = excluded.timeout_ms,
                enabled = excluded.enabled,
                events = excluded.events,
                retry = excluded.retry
            "#,
        )
        .bind(&endpoint.id)
        .bind(&endpoint.workspace_id)
        .bind(&endpoint.name)
        .bind(&endpoint.url)
        .bind(&endpoint.method)
        .bind(serde_json::to_string(&endpoint.headers)?)
        .bind(endpoint.timeout_ms.map(|t| t as i64))
        .bind(endpoint.enabled)
        .bind(serde_json::to_string(&endpoint.events)?)
        .bind(endpoint.retry.as_ref().map(serde_json::to_string).transpose()?)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ============================================================================
// Task queue
// ============================================================================

#[async_trait]
impl TaskQueue for SqliteStore {
    async fn enqueue(&self, task: Task, not_before: DateTime<Utc>) -> relay_queue::Result<()> {
        let result = sqlx::query(
            "INSERT INTO tasks (id, event_id, endpoint_id, attempts, scheduled_at, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&task.id)
        .bind(task.event_id.to_string())
        .bind(&task.endpoint_id)
        .bind(task.attempts as i64)
        .bind(not_before.timestamp_millis())
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                self.notify.notify_waiters();
                Ok(())
            }
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(QueueError::DuplicateTask(task.id)),
            Err(e) => Err(queue_error(e)),
        }
    }

    async fn lease(&self, batch_size: usize, lease_duration: Duration) -> relay_queue::Result<Vec<LeasedTask>> {
        let now = Utc::now();
        let now_ms = now.timestamp_millis();
        let expires_at = later_by(now, lease_duration);

        let candidates = sqlx::query(
            r#"
            SELECT id FROM tasks
            WHERE scheduled_at <= ?
            AND (lease_token IS NULL OR lease_expires_at <= ?)
            ORDER BY scheduled_at, id
            LIMIT ?
            "#,
        )
        .bind(now_ms)
        .bind(now_ms)
        .bind(batch_size as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(queue_error)?;

        let mut leased = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let id: String = candidate.try_get("id").map_err(queue_error)?;
            let token = LeaseToken::generate();

            // another leaser may have claimed the row since the SELECT
            let claimed = sqlx::query(
                r#"
                UPDATE tasks SET lease_token = ?, lease_expires_at = ?
                WHERE id = ?
                AND scheduled_at <= ?
                AND (lease_token IS NULL OR lease_expires_at <= ?)
                RETURNING id, event_id, endpoint_id, attempts, scheduled_at
                "#,
            )
            .bind(token.as_str())
            .bind(expires_at.timestamp_millis())
            .bind(&id)
            .bind(now_ms)
            .bind(now_ms)
            .fetch_optional(&self.pool)
            .await
            .map_err(queue_error)?;

            if let Some(row) = claimed {
                let task = task_from_row(&row).map_err(queue_error)?;
                leased.push(LeasedTask {
                    task,
                    token,
                    lease_expires_at: expires_at,
                });
            }
        }
        Ok(leased)
    }

    async fn ack(&self, token: &LeaseToken) -> relay_queue::Result<()> {
        let result = sqlx::query("DELETE FROM tasks WHERE lease_token = ?")
            .bind(token.as_str())
            .execute(&self.pool)
            .await
            .map_err(queue_error)?;
        if result.rows_affected() == 0 {
            return Err(QueueError::lease_lost(token));
        }
        Ok(())
    }

    async fn nack(&self, token: &LeaseToken, next_not_before: DateTime<Utc>) -> relay_queue::Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET attempts = attempts + 1, scheduled_at = ?, lease_token = NULL, lease_expires_at = NULL
            WHERE lease_token = ?
            "#,
        )
        .bind(next_not_before.timestamp_millis())
        .bind(token.as_str())
        .execute(&self.pool)
        .await
        .map_err(queue_error)?;
        if result.rows_affected() == 0 {
            return Err(QueueError::lease_lost(token));
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn extend(&self, token: &LeaseToken, duration: Duration) -> relay_queue::Result<()> {
        let expires_at = later_by(Utc::now(), duration);
        let result = sqlx::query("UPDATE tasks SET lease_expires_at = ? WHERE lease_token = ?")
            .bind(expires_at.timestamp_millis())
            .bind(token.as_str())
            .execute(&self.pool)
            .await
            .map_err(queue_error)?;
        if result.rows_affected() == 0 {
            return Err(QueueError::lease_lost(token));
        }
        Ok(())
    }

    async fn wait_for_work(&self, max_wait: Duration) {
        let notified = self.notify.notified();
        let wait = wait_until_due(self.next_due_at().await, max_wait);
        let _ = tokio::time::timeout(wait, notified).await;
    }
}

impl WorkSignal for SqliteStore {
    fn notify_work(&self) {
        self.notify.notify_waiters();
    }
}
