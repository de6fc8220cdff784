use {
    burrow_common::{Error, Result, time::now_ms},
    serde::{Deserialize, Serialize},
    sqlx::SqlitePool,
};

/// Turn lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl TurnState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A persistent conversation bound to one container, possibly resuming an
/// assistant-side session across process runs.
#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: String,
    pub container_id: String,
    /// Session id the assistant assigned, once its init event arrives.
    pub assistant_session_id: Option<String>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

/// One prompt-plus-response unit.
#[derive(Debug, Clone, Serialize)]
pub struct Turn {
    pub id: String,
    pub conversation_id: String,
    pub turn_idx: i64,
    pub prompt: String,
    pub source: String,
    pub response: String,
    pub model: Option<String>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cost_usd: Option<f64>,
    pub duration_ms: Option<i64>,
    pub state: TurnState,
    pub created_at_ms: u64,
}

/// Usage figures closing out a turn.
#[derive(Debug, Clone, Default)]
pub struct TurnUsage {
    pub model: Option<String>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cost_usd: Option<f64>,
    pub duration_ms: Option<i64>,
}

/// SQLite persistence for conversations, turns, and raw stream events.
pub struct ConversationStore {
    pool: SqlitePool,
}

impl ConversationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS conversations (
                id                   TEXT PRIMARY KEY,
                container_id         TEXT NOT NULL,
                assistant_session_id TEXT,
                created_at           INTEGER NOT NULL,
                updated_at           INTEGER NOT NULL
            )"#,
        )
        .execute(pool)
        .await?;
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS turns (
                id              TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                turn_idx        INTEGER NOT NULL,
                prompt          TEXT NOT NULL,
                source          TEXT NOT NULL,
                response        TEXT NOT NULL DEFAULT '',
                model           TEXT,
                input_tokens    INTEGER,
                output_tokens   INTEGER,
                cost_usd        REAL,
                duration_ms     INTEGER,
                state           TEXT NOT NULL,
                created_at      INTEGER NOT NULL,
                UNIQUE(conversation_id, turn_idx)
            )"#,
        )
        .execute(pool)
        .await?;
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS stream_events (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                turn_id    TEXT NOT NULL,
                event_idx  INTEGER NOT NULL,
                payload    TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )"#,
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_stream_events_turn ON stream_events(turn_id, event_idx)",
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Create a conversation, or return the existing one when resuming.
    pub async fn open_conversation(
        &self,
        container_id: &str,
        conversation_id: Option<String>,
    ) -> Result<Conversation> {
        if let Some(id) = conversation_id {
            return self.get_conversation(&id).await;
        }
        let now = now_ms();
        let conversation = Conversation {
            id: uuid::Uuid::new_v4().to_string(),
            container_id: container_id.to_string(),
            assistant_session_id: None,
            created_at_ms: now,
            updated_at_ms: now,
        };
        sqlx::query(
            "INSERT INTO conversations (id, container_id, created_at, updated_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&conversation.id)
        .bind(&conversation.container_id)
        .bind(now as i64)
        .bind(now as i64)
        .execute(&self.pool)
        .await?;
        Ok(conversation)
    }

    pub async fn get_conversation(&self, id: &str) -> Result<Conversation> {
        let row =
            sqlx::query_as::<_, ConversationRow>("SELECT * FROM conversations WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(ConversationRow::into_conversation)
            .ok_or_else(|| Error::not_found(format!("conversation {id} not found")))
    }

    pub async fn list_for_container(&self, container_id: &str) -> Result<Vec<Conversation>> {
        let rows = sqlx::query_as::<_, ConversationRow>(
            "SELECT * FROM conversations WHERE container_id = ? ORDER BY updated_at DESC",
        )
        .bind(container_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(ConversationRow::into_conversation)
            .collect())
    }

    pub async fn set_assistant_session(&self, id: &str, assistant_session_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE conversations SET assistant_session_id = ?, updated_at = ? WHERE id = ?",
        )
        .bind(assistant_session_id)
        .bind(now_ms() as i64)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Hard delete with explicit cascades.
    pub async fn delete_conversation(&self, id: &str) -> Result<()> {
        sqlx::query(
            "DELETE FROM stream_events WHERE turn_id IN (SELECT id FROM turns WHERE conversation_id = ?)",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        sqlx::query("DELETE FROM turns WHERE conversation_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Append a turn with the next index, already Running.
    pub async fn add_turn(
        &self,
        conversation_id: &str,
        prompt: &str,
        source: &str,
        model: Option<&str>,
    ) -> Result<Turn> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(turn_idx), -1) + 1 FROM turns WHERE conversation_id = ?",
        )
        .bind(conversation_id)
        .fetch_one(&self.pool)
        .await?;

        let turn = Turn {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            turn_idx: row.0,
            prompt: prompt.to_string(),
            source: source.to_string(),
            response: String::new(),
            model: model.map(String::from),
            input_tokens: None,
            output_tokens: None,
            cost_usd: None,
            duration_ms: None,
            state: TurnState::Running,
            created_at_ms: now_ms(),
        };
        sqlx::query(
            "INSERT INTO turns (id, conversation_id, turn_idx, prompt, source, model, state, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&turn.id)
        .bind(&turn.conversation_id)
        .bind(turn.turn_idx)
        .bind(&turn.prompt)
        .bind(&turn.source)
        .bind(&turn.model)
        .bind(turn.state.as_str())
        .bind(turn.created_at_ms as i64)
        .execute(&self.pool)
        .await?;

        sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
            .bind(now_ms() as i64)
            .bind(conversation_id)
            .execute(&self.pool)
            .await?;
        Ok(turn)
    }

    pub async fn get_turn(&self, id: &str) -> Result<Turn> {
        let row = sqlx::query_as::<_, TurnRow>("SELECT * FROM turns WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TurnRow::into_turn)
            .transpose()?
            .ok_or_else(|| Error::not_found(format!("turn {id} not found")))
    }

    /// Close out a turn with its final response and usage.
    pub async fn finish_turn(
        &self,
        id: &str,
        state: TurnState,
        response: &str,
        usage: &TurnUsage,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE turns SET state = ?, response = ?,
                 model = COALESCE(?, model),
                 input_tokens = ?, output_tokens = ?, cost_usd = ?, duration_ms = ?
             WHERE id = ?",
        )
        .bind(state.as_str())
        .bind(response)
        .bind(&usage.model)
        .bind(usage.input_tokens)
        .bind(usage.output_tokens)
        .bind(usage.cost_usd)
        .bind(usage.duration_ms)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The newest `limit` turns in ascending index order, plus whether
    /// older ones exist.
    pub async fn recent_turns(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<(Vec<Turn>, bool)> {
        let rows = sqlx::query_as::<_, TurnRow>(
            "SELECT * FROM turns WHERE conversation_id = ?
             ORDER BY turn_idx DESC LIMIT ?",
        )
        .bind(conversation_id)
        .bind(limit as i64 + 1)
        .fetch_all(&self.pool)
        .await?;

        let has_more = rows.len() > limit;
        let mut turns: Vec<Turn> = rows
            .into_iter()
            .take(limit)
            .map(TurnRow::into_turn)
            .collect::<Result<_>>()?;
        turns.reverse();
        Ok((turns, has_more))
    }

    /// Turns strictly before `before_idx`, newest `limit` of them,
    /// ascending order.
    pub async fn turns_before(
        &self,
        conversation_id: &str,
        before_idx: i64,
        limit: usize,
    ) -> Result<(Vec<Turn>, bool)> {
        let rows = sqlx::query_as::<_, TurnRow>(
            "SELECT * FROM turns WHERE conversation_id = ? AND turn_idx < ?
             ORDER BY turn_idx DESC LIMIT ?",
        )
        .bind(conversation_id)
        .bind(before_idx)
        .bind(limit as i64 + 1)
        .fetch_all(&self.pool)
        .await?;

        let has_more = rows.len() > limit;
        let mut turns: Vec<Turn> = rows
            .into_iter()
            .take(limit)
            .map(TurnRow::into_turn)
            .collect::<Result<_>>()?;
        turns.reverse();
        Ok((turns, has_more))
    }

    /// Persist one raw stream-json line for a turn, in arrival order.
    pub async fn append_event(&self, turn_id: &str, payload: &serde_json::Value) -> Result<()> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(event_idx), -1) + 1 FROM stream_events WHERE turn_id = ?",
        )
        .bind(turn_id)
        .fetch_one(&self.pool)
        .await?;
        sqlx::query(
            "INSERT INTO stream_events (turn_id, event_idx, payload, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(turn_id)
        .bind(row.0)
        .bind(payload.to_string())
        .bind(now_ms() as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All stored events of a turn, in emission order.
    pub async fn events_for_turn(&self, turn_id: &str) -> Result<Vec<serde_json::Value>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT payload FROM stream_events WHERE turn_id = ? ORDER BY event_idx",
        )
        .bind(turn_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .filter_map(|(payload,)| serde_json::from_str(&payload).ok())
            .collect())
    }
}

#[derive(sqlx::FromRow)]
struct ConversationRow {
    id: String,
    container_id: String,
    assistant_session_id: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl ConversationRow {
    fn into_conversation(self) -> Conversation {
        Conversation {
            id: self.id,
            container_id: self.container_id,
            assistant_session_id: self.assistant_session_id,
            created_at_ms: self.created_at as u64,
            updated_at_ms: self.updated_at as u64,
        }
    }
}

#[derive(sqlx::FromRow)]
struct TurnRow {
    id: String,
    conversation_id: String,
    turn_idx: i64,
    prompt: String,
    source: String,
    response: String,
    model: Option<String>,
    input_tokens: Option<i64>,
    output_tokens: Option<i64>,
    cost_usd: Option<f64>,
    duration_ms: Option<i64>,
    state: String,
    created_at: i64,
}

impl TurnRow {
    fn into_turn(self) -> Result<Turn> {
        let state = TurnState::parse(&self.state)
            .ok_or_else(|| Error::message(format!("unknown turn state '{}'", self.state)))?;
        Ok(Turn {
            id: self.id,
            conversation_id: self.conversation_id,
            turn_idx: self.turn_idx,
            prompt: self.prompt,
            source: self.source,
            response: self.response,
            model: self.model,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            cost_usd: self.cost_usd,
            duration_ms: self.duration_ms,
            state,
            created_at_ms: self.created_at as u64,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn store() -> ConversationStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        ConversationStore::init(&pool).await.unwrap();
        ConversationStore::new(pool)
    }

    #[tokio::test]
    async fn turn_indices_are_monotonic() {
        let store = store().await;
        let conversation = store.open_conversation("c1", None).await.unwrap();
        for i in 0..3 {
            let turn = store
                .add_turn(&conversation.id, &format!("p{i}"), "ws", None)
                .await
                .unwrap();
            assert_eq!(turn.turn_idx, i);
        }
    }

    #[tokio::test]
    async fn resume_returns_existing_conversation() {
        let store = store().await;
        let first = store.open_conversation("c1", None).await.unwrap();
        let resumed = store
            .open_conversation("c1", Some(first.id.clone()))
            .await
            .unwrap();
        assert_eq!(first.id, resumed.id);

        assert!(store.open_conversation("c1", Some("ghost".into())).await.is_err());
    }

    #[tokio::test]
    async fn recent_and_before_paging() {
        let store = store().await;
        let conversation = store.open_conversation("c1", None).await.unwrap();
        for i in 0..10 {
            store
                .add_turn(&conversation.id, &format!("p{i}"), "ws", None)
                .await
                .unwrap();
        }

        let (recent, has_more) = store.recent_turns(&conversation.id, 3).await.unwrap();
        assert!(has_more);
        assert_eq!(
            recent.iter().map(|t| t.turn_idx).collect::<Vec<_>>(),
            vec![7, 8, 9]
        );

        let (older, has_more) = store.turns_before(&conversation.id, 7, 3).await.unwrap();
        assert!(has_more);
        assert_eq!(
            older.iter().map(|t| t.turn_idx).collect::<Vec<_>>(),
            vec![4, 5, 6]
        );

        let (oldest, has_more) = store.turns_before(&conversation.id, 2, 10).await.unwrap();
        assert!(!has_more);
        assert_eq!(oldest.len(), 2);
    }

    #[tokio::test]
    async fn events_preserve_order() {
        let store = store().await;
        let conversation = store.open_conversation("c1", None).await.unwrap();
        let turn = store.add_turn(&conversation.id, "p", "ws", None).await.unwrap();

        for i in 0..5 {
            store
                .append_event(&turn.id, &serde_json::json!({"seq": i}))
                .await
                .unwrap();
        }
        let events = store.events_for_turn(&turn.id).await.unwrap();
        assert_eq!(events.len(), 5);
        assert_eq!(events[0]["seq"], 0);
        assert_eq!(events[4]["seq"], 4);
    }

    #[tokio::test]
    async fn finish_turn_records_usage() {
        let store = store().await;
        let conversation = store.open_conversation("c1", None).await.unwrap();
        let turn = store.add_turn(&conversation.id, "p", "ws", None).await.unwrap();

        store
            .finish_turn(
                &turn.id,
                TurnState::Completed,
                "done",
                &TurnUsage {
                    model: Some("m1".into()),
                    input_tokens: Some(10),
                    output_tokens: Some(20),
                    cost_usd: Some(0.01),
                    duration_ms: Some(1500),
                },
            )
            .await
            .unwrap();

        let loaded = store.get_turn(&turn.id).await.unwrap();
        assert_eq!(loaded.state, TurnState::Completed);
        assert_eq!(loaded.response, "done");
        assert_eq!(loaded.output_tokens, Some(20));
    }

    #[tokio::test]
    async fn delete_cascades_turns_and_events() {
        let store = store().await;
        let conversation = store.open_conversation("c1", None).await.unwrap();
        let turn = store.add_turn(&conversation.id, "p", "ws", None).await.unwrap();
        store
            .append_event(&turn.id, &serde_json::json!({"x": 1}))
            .await
            .unwrap();

        store.delete_conversation(&conversation.id).await.unwrap();
        assert!(store.get_conversation(&conversation.id).await.is_err());
        assert!(store.get_turn(&turn.id).await.is_err());
        assert!(store.events_for_turn(&turn.id).await.unwrap().is_empty());
    }
}
