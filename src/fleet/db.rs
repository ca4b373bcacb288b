use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::models::*;

/// Async-safe handle to the fleet database.
///
/// Wraps `FleetDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<FleetDb>>,
}

impl DbHandle {
    pub fn new(db: FleetDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    ///
    /// The closure holds the connection lock for its whole body, so a
    /// read-check-write inside one `call` is serialized against every other
    /// caller. All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R, E>(&self, f: F) -> std::result::Result<R, E>
    where
        F: FnOnce(&FleetDb) -> std::result::Result<R, E> + Send + 'static,
        R: Send + 'static,
        E: From<anyhow::Error> + Send + 'static,
    {
        let db = self.inner.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await;
        match joined {
            Ok(result) => result,
            Err(e) => Err(anyhow::Error::new(e).context("DB task panicked").into()),
        }
    }

    /// Acquire the database mutex synchronously. Used by CLI commands and
    /// tests; never from a request handler.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, FleetDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct FleetDb {
    conn: Connection,
}

const AGENT_COLUMNS: &str = "id, hostname, platform, version, capabilities, endpoint, status, \
     metrics, last_seen, registered_at, created_at, updated_at";

const TASK_COLUMNS: &str =
    "id, agent_id, task_type, payload, status, result, error, created_at, updated_at";

const DEPLOYMENT_COLUMNS: &str =
    "id, agent_id, stack_name, compose_content, env_content, task_id, created_at";

impl FleetDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS agents (
                    id TEXT PRIMARY KEY,
                    hostname TEXT NOT NULL DEFAULT '',
                    platform TEXT NOT NULL DEFAULT '',
                    version TEXT NOT NULL DEFAULT '',
                    capabilities TEXT NOT NULL DEFAULT '[]',
                    endpoint TEXT,
                    status TEXT NOT NULL DEFAULT 'offline',
                    metrics TEXT,
                    last_seen TEXT,
                    registered_at TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS tasks (
                    id TEXT PRIMARY KEY,
                    agent_id TEXT NOT NULL REFERENCES agents(id),
                    task_type TEXT NOT NULL,
                    payload TEXT NOT NULL DEFAULT '{}',
                    status TEXT NOT NULL DEFAULT 'pending',
                    result TEXT,
                    error TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS deployments (
                    id TEXT PRIMARY KEY,
                    agent_id TEXT NOT NULL REFERENCES agents(id),
                    stack_name TEXT NOT NULL,
                    compose_content TEXT NOT NULL,
                    env_content TEXT NOT NULL DEFAULT '',
                    task_id TEXT NOT NULL REFERENCES tasks(id),
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS settings (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_tasks_agent ON tasks(agent_id, status);
                CREATE INDEX IF NOT EXISTS idx_deployments_agent ON deployments(agent_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Agents ────────────────────────────────────────────────────────

    /// Insert or fully replace an agent record.
    pub fn upsert_agent(&self, agent: &Agent) -> Result<()> {
        let capabilities = serde_json::to_string(&agent.capabilities)
            .context("Failed to serialize agent capabilities")?;
        let metrics = agent
            .metrics
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize agent metrics")?;
        self.conn
            .execute(
                "INSERT INTO agents (id, hostname, platform, version, capabilities, endpoint, status,
                                     metrics, last_seen, registered_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(id) DO UPDATE SET
                    hostname = excluded.hostname,
                    platform = excluded.platform,
                    version = excluded.version,
                    capabilities = excluded.capabilities,
                    endpoint = excluded.endpoint,
                    status = excluded.status,
                    metrics = excluded.metrics,
                    last_seen = excluded.last_seen,
                    registered_at = excluded.registered_at,
                    created_at = excluded.created_at,
                    updated_at = excluded.updated_at",
                params![
                    agent.id,
                    agent.hostname,
                    agent.platform,
                    agent.version,
                    capabilities,
                    agent.endpoint,
                    agent.status.as_str(),
                    metrics,
                    agent.last_seen,
                    agent.registered_at,
                    agent.created_at,
                    agent.updated_at,
                ],
            )
            .context("Failed to upsert agent")?;
        Ok(())
    }

    pub fn get_agent(&self, id: &str) -> Result<Option<Agent>> {
        let sql = format!("SELECT {} FROM agents WHERE id = ?1", AGENT_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], AgentRow::from_row)
            .optional()
            .context("Failed to query agent")?;
        row.map(AgentRow::into_agent).transpose()
    }

    pub fn list_agents(&self) -> Result<Vec<Agent>> {
        let sql = format!("SELECT {} FROM agents ORDER BY id", AGENT_COLUMNS);
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_agents")?;
        let rows = stmt
            .query_map([], AgentRow::from_row)
            .context("Failed to query agents")?;
        let mut agents = Vec::new();
        for row in rows {
            agents.push(row.context("Failed to read agent row")?.into_agent()?);
        }
        Ok(agents)
    }

    // ── Tasks ─────────────────────────────────────────────────────────

    pub fn insert_task(&self, task: &Task) -> Result<()> {
        let payload = serde_json::to_string(&task.kind.payload())
            .context("Failed to serialize task payload")?;
        let result = task
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize task result")?;
        self.conn
            .execute(
                "INSERT INTO tasks (id, agent_id, task_type, payload, status, result, error, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    task.id,
                    task.agent_id,
                    task.kind.type_name(),
                    payload,
                    task.status.as_str(),
                    result,
                    task.error,
                    task.created_at,
                    task.updated_at,
                ],
            )
            .context("Failed to insert task")?;
        Ok(())
    }

    pub fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let sql = format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], TaskRow::from_row)
            .optional()
            .context("Failed to query task")?;
        row.map(TaskRow::into_task).transpose()
    }

    /// Tasks for one agent in creation order, optionally filtered by status.
    pub fn list_tasks_for_agent(
        &self,
        agent_id: &str,
        status: Option<TaskStatus>,
    ) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT {} FROM tasks WHERE agent_id = ?1 AND (?2 IS NULL OR status = ?2) ORDER BY rowid",
            TASK_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_tasks_for_agent")?;
        let rows = stmt
            .query_map(
                params![agent_id, status.map(|s| s.as_str())],
                TaskRow::from_row,
            )
            .context("Failed to query tasks")?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.context("Failed to read task row")?.into_task()?);
        }
        Ok(tasks)
    }

    pub fn update_task_outcome(
        &self,
        id: &str,
        status: TaskStatus,
        result: Option<&serde_json::Value>,
        error: Option<&str>,
        updated_at: DateTime<Utc>,
    ) -> Result<Task> {
        let result = result
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize task result")?;
        self.conn
            .execute(
                "UPDATE tasks SET status = ?1, result = COALESCE(?2, result), error = COALESCE(?3, error), updated_at = ?4
                 WHERE id = ?5",
                params![status.as_str(), result, error, updated_at, id],
            )
            .context("Failed to update task")?;
        self.get_task(id)?.context("Task not found after update")
    }

    // ── Deployments ───────────────────────────────────────────────────

    pub fn insert_deployment(&self, deployment: &Deployment) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO deployments (id, agent_id, stack_name, compose_content, env_content, task_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    deployment.id,
                    deployment.agent_id,
                    deployment.stack_name,
                    deployment.compose_content,
                    deployment.env_content,
                    deployment.task_id,
                    deployment.created_at,
                ],
            )
            .context("Failed to insert deployment")?;
        Ok(())
    }

    pub fn get_deployment(&self, id: &str) -> Result<Option<Deployment>> {
        let sql = format!("SELECT {} FROM deployments WHERE id = ?1", DEPLOYMENT_COLUMNS);
        self.conn
            .query_row(&sql, params![id], deployment_from_row)
            .optional()
            .context("Failed to query deployment")
    }

    /// Deployments for one agent, newest first.
    pub fn list_deployments_for_agent(&self, agent_id: &str) -> Result<Vec<Deployment>> {
        let sql = format!(
            "SELECT {} FROM deployments WHERE agent_id = ?1 ORDER BY rowid DESC",
            DEPLOYMENT_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_deployments_for_agent")?;
        let rows = stmt
            .query_map(params![agent_id], deployment_from_row)
            .context("Failed to query deployments")?;
        let mut deployments = Vec::new();
        for row in rows {
            deployments.push(row.context("Failed to read deployment row")?);
        }
        Ok(deployments)
    }

    // ── Settings ──────────────────────────────────────────────────────

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("Failed to query setting")
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = datetime('now')",
                params![key, value],
            )
            .context("Failed to upsert setting")?;
        Ok(())
    }
}

/// Intermediate row struct for reading agents before converting status,
/// capabilities and metrics strings into typed values.
struct AgentRow {
    id: String,
    hostname: String,
    platform: String,
    version: String,
    capabilities: String,
    endpoint: Option<String>,
    status: String,
    metrics: Option<String>,
    last_seen: Option<DateTime<Utc>>,
    registered_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl AgentRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            hostname: row.get(1)?,
            platform: row.get(2)?,
            version: row.get(3)?,
            capabilities: row.get(4)?,
            endpoint: row.get(5)?,
            status: row.get(6)?,
            metrics: row.get(7)?,
            last_seen: row.get(8)?,
            registered_at: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn into_agent(self) -> Result<Agent> {
        let status = AgentStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse agent status")?;
        let capabilities: Vec<String> = serde_json::from_str(&self.capabilities)
            .context("Failed to parse agent capabilities JSON")?;
        let metrics = self
            .metrics
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("Failed to parse agent metrics JSON")?;
        Ok(Agent {
            id: self.id,
            hostname: self.hostname,
            platform: self.platform,
            version: self.version,
            capabilities,
            endpoint: self.endpoint,
            status,
            metrics,
            last_seen: self.last_seen,
            registered_at: self.registered_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct TaskRow {
    id: String,
    agent_id: String,
    task_type: String,
    payload: String,
    status: String,
    result: Option<String>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TaskRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            agent_id: row.get(1)?,
            task_type: row.get(2)?,
            payload: row.get(3)?,
            status: row.get(4)?,
            result: row.get(5)?,
            error: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn into_task(self) -> Result<Task> {
        let payload: serde_json::Value =
            serde_json::from_str(&self.payload).context("Failed to parse task payload JSON")?;
        let kind: TaskKind = serde_json::from_value(
            serde_json::json!({ "type": self.task_type, "payload": payload }),
        )
        .with_context(|| format!("Failed to decode {} task {}", self.task_type, self.id))?;
        let status = TaskStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse task status")?;
        let result = self
            .result
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("Failed to parse task result JSON")?;
        Ok(Task {
            id: self.id,
            agent_id: self.agent_id,
            kind,
            status,
            result,
            error: self.error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn deployment_from_row(row: &Row<'_>) -> rusqlite::Result<Deployment> {
    Ok(Deployment {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        stack_name: row.get(2)?,
        compose_content: row.get(3)?,
        env_content: row.get(4)?,
        task_id: row.get(5)?,
        created_at: row.get(6)?,
    })
}
