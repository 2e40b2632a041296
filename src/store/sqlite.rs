//! SQLite 任务存储（async-sqlite feature）
//!
//! tasks / steps / execution_records 三张表；版本检查用 `UPDATE ... WHERE version = ?`，
//! 影响行数为 0 时再查一次区分 NotFound 与 VersionConflict。

use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use crate::core::ToolFailure;
use crate::plan::{Step, StepStatus, Task, TaskPriority, TaskStatus};
use crate::sandbox::{ExecutionExit, ExecutionRecord, ResourceUsage};
use crate::store::{StoreError, TaskFilter, TaskStore};

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Backend(format!("serialization: {e}"))
    }
}

pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
        let pool = SqlitePoolOptions::new()
            .max_connections(3)
            .connect(&db_url)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                status TEXT NOT NULL,
                priority INTEGER NOT NULL,
                progress INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                cancel_requested INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                completed_at INTEGER,
                version INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS steps (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL REFERENCES tasks(id),
                seq INTEGER NOT NULL,
                name TEXT,
                tool_name TEXT NOT NULL,
                input_parameters TEXT NOT NULL,
                dependency_ids TEXT NOT NULL,
                status TEXT NOT NULL,
                retry_count INTEGER NOT NULL,
                max_retries INTEGER NOT NULL,
                output TEXT,
                error TEXT,
                started_at INTEGER,
                completed_at INTEGER,
                version INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS execution_records (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                step_id TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                sandbox_id TEXT NOT NULL,
                tool_name TEXT NOT NULL,
                resource_usage TEXT NOT NULL,
                exit_status TEXT,
                started_at INTEGER NOT NULL,
                ended_at INTEGER
            )",
        )
        .execute(&self.pool)
        .await?;

        for ddl in [
            "CREATE INDEX IF NOT EXISTS idx_tasks_user ON tasks(user_id)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)",
            "CREATE INDEX IF NOT EXISTS idx_steps_task ON steps(task_id, seq)",
            "CREATE INDEX IF NOT EXISTS idx_records_task ON execution_records(task_id)",
            "CREATE INDEX IF NOT EXISTS idx_records_tool ON execution_records(tool_name, started_at)",
        ] {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn current_version(&self, table: &str, id: &str) -> Result<Option<u64>, StoreError> {
        let sql = format!("SELECT version FROM {table} WHERE id = ?");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        Ok(row.map(|r| r.get::<i64, _>("version") as u64))
    }
}

fn parse_err(e: String) -> StoreError {
    StoreError::Backend(e)
}

fn task_from_row(row: &SqliteRow) -> Result<Task, StoreError> {
    Ok(Task {
        id: row.get("id"),
        user_id: row.get("user_id"),
        title: row.get("title"),
        description: row.get("description"),
        status: row.get::<String, _>("status").parse::<TaskStatus>().map_err(parse_err)?,
        priority: TaskPriority::from_i64(row.get::<i64, _>("priority")),
        progress_percent: row.get::<i64, _>("progress").clamp(0, 100) as u8,
        error_message: row.get("error_message"),
        cancel_requested: row.get::<i64, _>("cancel_requested") != 0,
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        version: row.get::<i64, _>("version") as u64,
    })
}

fn step_from_row(row: &SqliteRow) -> Result<Step, StoreError> {
    let output: Option<String> = row.get("output");
    let error: Option<String> = row.get("error");
    Ok(Step {
        id: row.get("id"),
        task_id: row.get("task_id"),
        seq: row.get::<i64, _>("seq") as usize,
        name: row.get("name"),
        tool_name: row.get("tool_name"),
        input_parameters: serde_json::from_str(&row.get::<String, _>("input_parameters"))?,
        dependency_ids: serde_json::from_str(&row.get::<String, _>("dependency_ids"))?,
        status: row.get::<String, _>("status").parse::<StepStatus>().map_err(parse_err)?,
        retry_count: row.get::<i64, _>("retry_count") as u32,
        max_retries: row.get::<i64, _>("max_retries") as u32,
        output: output.map(|s| serde_json::from_str(&s)).transpose()?,
        error: error
            .map(|s| serde_json::from_str::<ToolFailure>(&s))
            .transpose()?,
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        version: row.get::<i64, _>("version") as u64,
    })
}

fn record_from_row(row: &SqliteRow) -> Result<ExecutionRecord, StoreError> {
    let exit: Option<String> = row.get("exit_status");
    Ok(ExecutionRecord {
        id: row.get("id"),
        task_id: row.get("task_id"),
        step_id: row.get("step_id"),
        attempt: row.get::<i64, _>("attempt") as u32,
        sandbox_id: row.get("sandbox_id"),
        tool_name: row.get("tool_name"),
        resource_usage: serde_json::from_str(&row.get::<String, _>("resource_usage"))?,
        exit_status: exit.map(|s| serde_json::from_str(&s)).transpose()?,
        started_at: row.get("started_at"),
        ended_at: row.get("ended_at"),
    })
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn insert_task(&self, task: &Task, steps: &[Step]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO tasks
             (id, user_id, title, description, status, priority, progress, error_message,
              cancel_requested, created_at, started_at, completed_at, version)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&task.id)
        .bind(&task.user_id)
        .bind(&task.title)
        .bind(&task.description)
        .bind(task.status.as_str())
        .bind(task.priority as i64)
        .bind(task.progress_percent as i64)
        .bind(&task.error_message)
        .bind(task.cancel_requested as i64)
        .bind(task.created_at)
        .bind(task.started_at)
        .bind(task.completed_at)
        .bind(task.version as i64)
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() == 0 {
            return Err(StoreError::Duplicate(task.id.clone()));
        }

        for step in steps {
            sqlx::query(
                "INSERT INTO steps
                 (id, task_id, seq, name, tool_name, input_parameters, dependency_ids, status,
                  retry_count, max_retries, output, error, started_at, completed_at, version)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&step.id)
            .bind(&step.task_id)
            .bind(step.seq as i64)
            .bind(&step.name)
            .bind(&step.tool_name)
            .bind(step.input_parameters.to_string())
            .bind(serde_json::to_string(&step.dependency_ids)?)
            .bind(step.status.as_str())
            .bind(step.retry_count as i64)
            .bind(step.max_retries as i64)
            .bind(step.output.as_ref().map(|v| v.to_string()))
            .bind(step.error.as_ref().map(serde_json::to_string).transpose()?)
            .bind(step.started_at)
            .bind(step.completed_at)
            .bind(step.version as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                    StoreError::Duplicate(step.id.clone())
                }
                other => other.into(),
            })?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn get_step(&self, step_id: &str) -> Result<Option<Step>, StoreError> {
        let row = sqlx::query("SELECT * FROM steps WHERE id = ?")
            .bind(step_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(step_from_row).transpose()
    }

    async fn list_steps(&self, task_id: &str) -> Result<Vec<Step>, StoreError> {
        let rows = sqlx::query("SELECT * FROM steps WHERE task_id = ? ORDER BY seq ASC")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(step_from_row).collect()
    }

    async fn update_task(&self, task: &Task, expected_version: u64) -> Result<Task, StoreError> {
        let next = expected_version + 1;
        let result = sqlx::query(
            "UPDATE tasks SET status = ?, priority = ?, progress = ?, error_message = ?,
                cancel_requested = ?, started_at = ?, completed_at = ?, version = ?
             WHERE id = ? AND version = ?",
        )
        .bind(task.status.as_str())
        .bind(task.priority as i64)
        .bind(task.progress_percent as i64)
        .bind(&task.error_message)
        .bind(task.cancel_requested as i64)
        .bind(task.started_at)
        .bind(task.completed_at)
        .bind(next as i64)
        .bind(&task.id)
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(match self.current_version("tasks", &task.id).await? {
                Some(found) => StoreError::VersionConflict {
                    entity: "task",
                    id: task.id.clone(),
                    expected: expected_version,
                    found,
                },
                None => StoreError::NotFound(task.id.clone()),
            });
        }
        let mut stored = task.clone();
        stored.version = next;
        Ok(stored)
    }

    async fn update_step(&self, step: &Step, expected_version: u64) -> Result<Step, StoreError> {
        let next = expected_version + 1;
        let result = sqlx::query(
            "UPDATE steps SET status = ?, retry_count = ?, output = ?, error = ?,
                started_at = ?, completed_at = ?, version = ?
             WHERE id = ? AND version = ?",
        )
        .bind(step.status.as_str())
        .bind(step.retry_count as i64)
        .bind(step.output.as_ref().map(|v| v.to_string()))
        .bind(step.error.as_ref().map(serde_json::to_string).transpose()?)
        .bind(step.started_at)
        .bind(step.completed_at)
        .bind(next as i64)
        .bind(&step.id)
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(match self.current_version("steps", &step.id).await? {
                Some(found) => StoreError::VersionConflict {
                    entity: "step",
                    id: step.id.clone(),
                    expected: expected_version,
                    found,
                },
                None => StoreError::NotFound(step.id.clone()),
            });
        }
        let mut stored = step.clone();
        stored.version = next;
        Ok(stored)
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM tasks
             WHERE (?1 IS NULL OR user_id = ?1) AND (?2 IS NULL OR status = ?2)
             ORDER BY created_at ASC, id ASC",
        )
        .bind(&filter.user_id)
        .bind(filter.status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn start_record(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO execution_records
             (id, task_id, step_id, attempt, sandbox_id, tool_name, resource_usage, exit_status,
              started_at, ended_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.task_id)
        .bind(&record.step_id)
        .bind(record.attempt as i64)
        .bind(&record.sandbox_id)
        .bind(&record.tool_name)
        .bind(serde_json::to_string(&record.resource_usage)?)
        .bind(record.exit_status.as_ref().map(serde_json::to_string).transpose()?)
        .bind(record.started_at)
        .bind(record.ended_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish_record(
        &self,
        record_id: &str,
        exit: ExecutionExit,
        usage: ResourceUsage,
        ended_at: i64,
    ) -> Result<ExecutionRecord, StoreError> {
        let result = sqlx::query(
            "UPDATE execution_records SET exit_status = ?, resource_usage = ?, ended_at = ?
             WHERE id = ? AND exit_status IS NULL",
        )
        .bind(serde_json::to_string(&exit)?)
        .bind(serde_json::to_string(&usage)?)
        .bind(ended_at)
        .bind(record_id)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT * FROM execution_records WHERE id = ?")
            .bind(record_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(record_id.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyFinalized(record_id.to_string()));
        }
        record_from_row(&row)
    }

    async fn list_records(&self, task_id: &str) -> Result<Vec<ExecutionRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM execution_records WHERE task_id = ? ORDER BY started_at ASC, attempt ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn tool_records(&self, tool_name: &str, limit: usize) -> Result<Vec<ExecutionRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM execution_records WHERE tool_name = ? ORDER BY started_at DESC LIMIT ?",
        )
        .bind(tool_name)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
