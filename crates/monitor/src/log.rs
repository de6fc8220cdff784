use {
    burrow_common::{Result, time::now_ms},
    serde::Serialize,
    sqlx::SqlitePool,
};

use crate::types::{StrategyKind, StrategyOutcome};

/// Result bucket for one automation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogResult {
    Success,
    Failed,
    Skipped,
}

impl LogResult {
    fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "failed" => Self::Failed,
            "skipped" => Self::Skipped,
            _ => Self::Success,
        }
    }

    fn from_outcome(outcome: &StrategyOutcome) -> Self {
        if outcome.action == "skipped" {
            Self::Skipped
        } else if outcome.success {
            Self::Success
        } else {
            Self::Failed
        }
    }
}

/// One automation log entry, append-only.
#[derive(Debug, Clone, Serialize)]
pub struct AutomationLogEntry {
    pub id: i64,
    pub container_id: String,
    pub pty_session_id: String,
    pub strategy: String,
    pub action: String,
    pub command: Option<String>,
    pub context_snippet: String,
    pub llm_response: Option<serde_json::Value>,
    pub result: LogResult,
    pub error: Option<String>,
    pub created_at_ms: u64,
}

/// Context snippets stored with a log entry are capped at this many bytes.
const SNIPPET_LIMIT: usize = 500;

/// Append-only record of every strategy run.
pub struct AutomationLogStore {
    pool: SqlitePool,
}

impl AutomationLogStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS automation_logs (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                container_id   TEXT NOT NULL,
                pty_session_id TEXT NOT NULL,
                strategy       TEXT NOT NULL,
                action         TEXT NOT NULL,
                command        TEXT,
                context_snippet TEXT NOT NULL,
                llm_response   TEXT,
                result         TEXT NOT NULL,
                error          TEXT,
                created_at     INTEGER NOT NULL
            )"#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn record(
        &self,
        container_id: &str,
        pty_session_id: &str,
        strategy: StrategyKind,
        outcome: &StrategyOutcome,
        context: &[u8],
    ) -> Result<()> {
        let snippet_start = context.len().saturating_sub(SNIPPET_LIMIT);
        let snippet = String::from_utf8_lossy(&context[snippet_start..]).into_owned();

        sqlx::query(
            "INSERT INTO automation_logs
             (container_id, pty_session_id, strategy, action, command, context_snippet,
              llm_response, result, error, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(container_id)
        .bind(pty_session_id)
        .bind(strategy.as_str())
        .bind(&outcome.action)
        .bind(&outcome.command)
        .bind(&snippet)
        .bind(
            outcome
                .llm_response
                .as_ref()
                .and_then(|v| serde_json::to_string(v).ok()),
        )
        .bind(LogResult::from_outcome(outcome).as_str())
        .bind(&outcome.error)
        .bind(now_ms() as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_for_container(
        &self,
        container_id: &str,
        limit: usize,
    ) -> Result<Vec<AutomationLogEntry>> {
        let rows = sqlx::query_as::<_, LogRow>(
            "SELECT * FROM automation_logs WHERE container_id = ?
             ORDER BY id DESC LIMIT ?",
        )
        .bind(container_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(LogRow::into_entry).collect())
    }
}

#[derive(sqlx::FromRow)]
struct LogRow {
    id: i64,
    container_id: String,
    pty_session_id: String,
    strategy: String,
    action: String,
    command: Option<String>,
    context_snippet: String,
    llm_response: Option<String>,
    result: String,
    error: Option<String>,
    created_at: i64,
}

impl LogRow {
    fn into_entry(self) -> AutomationLogEntry {
        AutomationLogEntry {
            id: self.id,
            container_id: self.container_id,
            pty_session_id: self.pty_session_id,
            strategy: self.strategy,
            action: self.action,
            command: self.command,
            context_snippet: self.context_snippet,
            llm_response: self
                .llm_response
                .as_deref()
                .and_then(|raw| serde_json::from_str(raw).ok()),
            result: LogResult::parse(&self.result),
            error: self.error,
            created_at_ms: self.created_at as u64,
        }
    }
}
