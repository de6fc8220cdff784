use {
    burrow_common::{Error, Result, time::now_ms},
    serde::{Deserialize, Serialize},
    sqlx::SqlitePool,
};

/// Task lifecycle. `InProgress` is the canonical name; `running` is
/// accepted as a legacy alias when deserializing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    InProgress,
    Completed,
    Skipped,
    Failed,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            // `running` survives from older clients.
            "in_progress" | "running" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "skipped" => Some(Self::Skipped),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Allowed lifecycle transitions.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InProgress)
                | (Self::Pending, Self::Skipped)
                | (Self::InProgress, Self::Completed)
                | (Self::InProgress, Self::Failed)
                | (Self::InProgress, Self::Skipped)
        )
    }
}

impl<'de> Deserialize<'de> for TaskState {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown task state '{raw}'")))
    }
}

/// A queued automation item. Order index defines FIFO per container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub container_id: String,
    pub order_idx: i64,
    pub text: String,
    pub state: TaskState,
    pub started_at_ms: Option<u64>,
    pub completed_at_ms: Option<u64>,
    pub created_at_ms: u64,
}

/// SQLite persistence for the per-container task queue.
pub struct TaskStore {
    pool: SqlitePool,
}

impl TaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS tasks (
                id           TEXT PRIMARY KEY,
                container_id TEXT NOT NULL,
                order_idx    INTEGER NOT NULL,
                text         TEXT NOT NULL,
                state        TEXT NOT NULL,
                started_at   INTEGER,
                completed_at INTEGER,
                created_at   INTEGER NOT NULL
            )"#,
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_tasks_container_order ON tasks(container_id, order_idx)",
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Append a task at the tail of the container's queue.
    pub async fn add(&self, container_id: &str, text: &str) -> Result<Task> {
        if text.trim().is_empty() {
            return Err(Error::validation("task text cannot be empty"));
        }
        let row: (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(order_idx), 0) + 1 FROM tasks WHERE container_id = ?",
        )
        .bind(container_id)
        .fetch_one(&self.pool)
        .await?;

        let task = Task {
            id: uuid::Uuid::new_v4().to_string(),
            container_id: container_id.to_string(),
            order_idx: row.0,
            text: text.to_string(),
            state: TaskState::Pending,
            started_at_ms: None,
            completed_at_ms: None,
            created_at_ms: now_ms(),
        };
        sqlx::query(
            "INSERT INTO tasks (id, container_id, order_idx, text, state, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&task.id)
        .bind(&task.container_id)
        .bind(task.order_idx)
        .bind(&task.text)
        .bind(task.state.as_str())
        .bind(task.created_at_ms as i64)
        .execute(&self.pool)
        .await?;
        Ok(task)
    }

    pub async fn get(&self, id: &str) -> Result<Task> {
        let row = sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TaskRow::into_task)
            .transpose()?
            .ok_or_else(|| Error::not_found(format!("task {id} not found")))
    }

    pub async fn list(&self, container_id: &str) -> Result<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            "SELECT * FROM tasks WHERE container_id = ? ORDER BY order_idx",
        )
        .bind(container_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TaskRow::into_task).collect()
    }

    /// Pop the lowest-order pending task, moving it to `InProgress`.
    pub async fn dequeue(&self, container_id: &str) -> Result<Option<Task>> {
        let row = sqlx::query_as::<_, TaskRow>(
            "SELECT * FROM tasks WHERE container_id = ? AND state = 'pending'
             ORDER BY order_idx LIMIT 1",
        )
        .bind(container_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else { return Ok(None) };
        let task = row.into_task()?;
        self.set_state(&task.id, TaskState::InProgress).await?;
        self.get(&task.id).await.map(Some)
    }

    /// Transition a task, validating the state machine.
    pub async fn set_state(&self, id: &str, next: TaskState) -> Result<Task> {
        let task = self.get(id).await?;
        if !task.state.can_transition_to(next) {
            return Err(Error::precondition(format!(
                "task cannot move from {} to {}",
                task.state.as_str(),
                next.as_str()
            )));
        }
        let now = now_ms() as i64;
        let started = (next == TaskState::InProgress).then_some(now);
        let completed = matches!(
            next,
            TaskState::Completed | TaskState::Failed | TaskState::Skipped
        )
        .then_some(now);

        sqlx::query(
            "UPDATE tasks SET state = ?,
                 started_at = COALESCE(?, started_at),
                 completed_at = COALESCE(?, completed_at)
             WHERE id = ?",
        )
        .bind(next.as_str())
        .bind(started)
        .bind(completed)
        .bind(id)
        .execute(&self.pool)
        .await?;
        self.get(id).await
    }

    /// Close out any in-progress task as completed. The queue strategy
    /// calls this before dequeuing: a new silence window means the
    /// previous task's work has gone quiet.
    pub async fn complete_in_progress(&self, container_id: &str) -> Result<()> {
        let rows = sqlx::query_as::<_, TaskRow>(
            "SELECT * FROM tasks WHERE container_id = ? AND state = 'in_progress'",
        )
        .bind(container_id)
        .fetch_all(&self.pool)
        .await?;
        for row in rows {
            let task = row.into_task()?;
            self.set_state(&task.id, TaskState::Completed).await?;
        }
        Ok(())
    }

    pub async fn update_text(&self, id: &str, text: &str) -> Result<Task> {
        if text.trim().is_empty() {
            return Err(Error::validation("task text cannot be empty"));
        }
        let task = self.get(id).await?;
        if task.state != TaskState::Pending {
            return Err(Error::precondition("only pending tasks can be edited"));
        }
        sqlx::query("UPDATE tasks SET text = ? WHERE id = ?")
            .bind(text)
            .bind(id)
            .execute(&self.pool)
            .await?;
        self.get(id).await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("task {id} not found")));
        }
        Ok(())
    }

    pub async fn delete_for_container(&self, container_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM tasks WHERE container_id = ?")
            .bind(container_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    container_id: String,
    order_idx: i64,
    text: String,
    state: String,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    created_at: i64,
}

impl TaskRow {
    fn into_task(self) -> Result<Task> {
        let state = TaskState::parse(&self.state)
            .ok_or_else(|| Error::message(format!("unknown task state '{}'", self.state)))?;
        Ok(Task {
            id: self.id,
            container_id: self.container_id,
            order_idx: self.order_idx,
            text: self.text,
            state,
            started_at_ms: self.started_at.map(|v| v as u64),
            completed_at_ms: self.completed_at.map(|v| v as u64),
            created_at_ms: self.created_at as u64,
        })
    }
}
