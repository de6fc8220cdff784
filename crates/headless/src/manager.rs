use std::{
    collections::HashMap,
    pin::Pin,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use {
    burrow_common::{Error, Result},
    burrow_config::AssistantConfig,
    burrow_runtime::docker::{ContainerRuntime, ExecSpec},
    futures::StreamExt,
    serde::Serialize,
    tokio::{
        io::{AsyncWrite, AsyncWriteExt},
        sync::{Mutex as AsyncMutex, mpsc},
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::store::{ConversationStore, Turn, TurnState, TurnUsage};

/// Per-subscriber event channel capacity; sends are drop-on-full, the
/// persisted stream events are the lossless record.
const EVENT_CHANNEL_CAPACITY: usize = 100;
/// Grace between TERM and KILL when cancelling a turn.
const CANCEL_GRACE: Duration = Duration::from_secs(2);

/// What create/attach hands back to a client.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub conversation_id: String,
    pub container_id: String,
    pub assistant_session_id: Option<String>,
    pub current_turn_id: Option<String>,
}

/// Fan-out frames delivered to session subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// One raw stream-json line from the assistant.
    Event {
        turn_id: String,
        payload: serde_json::Value,
    },
    /// The running turn finished (completed, cancelled, or failed).
    TurnComplete { turn: Turn },
}

struct CurrentTurn {
    id: String,
    response: String,
    model: Option<String>,
    started: Instant,
}

/// One live assistant process inside a container.
pub struct HeadlessSession {
    pub id: String,
    pub container_id: String,
    pub runtime_id: String,
    pub conversation_id: String,
    current: Mutex<Option<CurrentTurn>>,
    input: AsyncMutex<Pin<Box<dyn AsyncWrite + Send>>>,
    subscribers: Mutex<HashMap<String, mpsc::Sender<SessionEvent>>>,
    cancel: CancellationToken,
}

impl HeadlessSession {
    pub fn current_turn_id(&self) -> Option<String> {
        lock(&self.current).as_ref().map(|t| t.id.clone())
    }

    fn fan_out(&self, event: SessionEvent) {
        let subscribers = lock(&self.subscribers);
        for tx in subscribers.values() {
            let _ = tx.try_send(event.clone());
        }
    }
}

/// Owns every headless session, keyed by local session id. Drives the
/// assistant in stream-json mode over a container exec.
pub struct HeadlessManager {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<ConversationStore>,
    assistant: AssistantConfig,
    sessions: Mutex<HashMap<String, Arc<HeadlessSession>>>,
}

impl HeadlessManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<ConversationStore>,
        assistant: AssistantConfig,
    ) -> Self {
        Self {
            runtime,
            store,
            assistant,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    /// Spawn a fresh assistant process for the container, opening a new
    /// conversation or resuming the supplied one. Any previous assistant
    /// process in the container is killed first, best effort.
    pub async fn create_session(
        &self,
        container_id: &str,
        runtime_id: &str,
        conversation_id: Option<String>,
    ) -> Result<SessionInfo> {
        if let Some(existing) = self.session_for_container(container_id) {
            self.close_session(&existing.id).await;
        }
        let _ = self
            .runtime
            .exec_run(
                runtime_id,
                ExecSpec::command(["pkill", "-f", self.assistant.binary.as_str()]),
            )
            .await;

        let conversation = self
            .store
            .open_conversation(container_id, conversation_id)
            .await?;

        let mut cmd = vec![self.assistant.binary.clone()];
        cmd.extend(self.assistant.args.iter().cloned());
        cmd.extend(
            [
                "--input-format",
                "stream-json",
                "--output-format",
                "stream-json",
                "--verbose",
            ]
            .map(String::from),
        );
        if let Some(assistant_session) = &conversation.assistant_session_id {
            cmd.push("--resume".into());
            cmd.push(assistant_session.clone());
        }

        let handle = self
            .runtime
            .exec_attach(
                runtime_id,
                ExecSpec {
                    cmd,
                    tty: false,
                    working_dir: None,
                    env: vec![],
                },
            )
            .await?;

        let session = Arc::new(HeadlessSession {
            id: uuid::Uuid::new_v4().to_string(),
            container_id: container_id.to_string(),
            runtime_id: runtime_id.to_string(),
            conversation_id: conversation.id.clone(),
            current: Mutex::new(None),
            input: AsyncMutex::new(handle.input),
            subscribers: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        });
        lock(&self.sessions).insert(session.id.clone(), session.clone());

        // One line-reader routine per session.
        let reader_session = session.clone();
        let store = self.store.clone();
        let mut output = handle.output;
        tokio::spawn(async move {
            let mut buffer: Vec<u8> = Vec::new();
            loop {
                let frame = tokio::select! {
                    _ = reader_session.cancel.cancelled() => break,
                    frame = output.next() => frame,
                };
                let Some(frame) = frame else { break };
                let chunk = match frame {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!(session_id = %reader_session.id, error = %e, "assistant stream error");
                        break;
                    },
                };
                if chunk.is_empty() {
                    break;
                }
                buffer.extend_from_slice(&chunk);
                while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line);
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<serde_json::Value>(line) {
                        Ok(event) => {
                            Self::handle_event(&reader_session, &store, event).await;
                        },
                        Err(e) => {
                            debug!(session_id = %reader_session.id, error = %e, "skipping non-JSON line");
                        },
                    }
                }
            }
            // Stream went away mid-turn: the turn is failed, not lost.
            let interrupted = lock(&reader_session.current).take();
            if let Some(current) = interrupted {
                let usage = TurnUsage {
                    model: current.model.clone(),
                    duration_ms: Some(current.started.elapsed().as_millis() as i64),
                    ..Default::default()
                };
                let _ = store
                    .finish_turn(&current.id, TurnState::Failed, &current.response, &usage)
                    .await;
                if let Ok(turn) = store.get_turn(&current.id).await {
                    reader_session.fan_out(SessionEvent::TurnComplete { turn });
                }
            }
            debug!(session_id = %reader_session.id, "assistant reader finished");
        });

        info!(
            session_id = %session.id,
            conversation_id = %conversation.id,
            container_id,
            "headless session created"
        );
        Ok(SessionInfo {
            session_id: session.id.clone(),
            conversation_id: conversation.id,
            container_id: container_id.to_string(),
            assistant_session_id: conversation.assistant_session_id,
            current_turn_id: None,
        })
    }

    /// One stream-json line: persist it, accumulate the turn response,
    /// close the turn when the final usage event arrives.
    async fn handle_event(
        session: &Arc<HeadlessSession>,
        store: &Arc<ConversationStore>,
        event: serde_json::Value,
    ) {
        let event_type = event.get("type").and_then(|t| t.as_str()).unwrap_or("");

        // The assistant's own session id arrives on the init event.
        if event_type == "system"
            && event.get("subtype").and_then(|s| s.as_str()) == Some("init")
            && let Some(assistant_session) = event.get("session_id").and_then(|s| s.as_str())
        {
            let _ = store
                .set_assistant_session(&session.conversation_id, assistant_session)
                .await;
        }

        let Some(turn_id) = session.current_turn_id() else {
            // Events outside a turn (startup banner, init) are not
            // persisted against any turn.
            return;
        };

        if let Err(e) = store.append_event(&turn_id, &event).await {
            warn!(turn_id, error = %e, "failed to persist stream event");
        }
        session.fan_out(SessionEvent::Event {
            turn_id: turn_id.clone(),
            payload: event.clone(),
        });

        match event_type {
            "user" | "assistant" => {
                let text = extract_message_text(&event);
                let model = event
                    .pointer("/message/model")
                    .and_then(|m| m.as_str())
                    .map(String::from);
                let mut current = lock(&session.current);
                if let Some(current) = current.as_mut() {
                    current.response.push_str(&text);
                    if model.is_some() {
                        current.model = model;
                    }
                }
            },
            "result" => {
                let taken = lock(&session.current).take();
                let Some(current) = taken else { return };
                let usage = TurnUsage {
                    model: current.model.clone(),
                    input_tokens: event
                        .pointer("/usage/input_tokens")
                        .and_then(|v| v.as_i64()),
                    output_tokens: event
                        .pointer("/usage/output_tokens")
                        .and_then(|v| v.as_i64()),
                    cost_usd: event.get("total_cost_usd").and_then(|v| v.as_f64()),
                    duration_ms: event
                        .get("duration_ms")
                        .and_then(|v| v.as_i64())
                        .or_else(|| Some(current.started.elapsed().as_millis() as i64)),
                };
                let _ = store
                    .finish_turn(&current.id, TurnState::Completed, &current.response, &usage)
                    .await;
                if let Ok(turn) = store.get_turn(&current.id).await {
                    session.fan_out(SessionEvent::TurnComplete { turn });
                }
            },
            _ => {},
        }
    }

    /// Open a turn and hand the prompt to the assistant's stdin.
    pub async fn send_prompt(
        &self,
        session_id: &str,
        prompt: &str,
        source: &str,
        model: Option<&str>,
    ) -> Result<Turn> {
        let session = self.get_session(session_id)?;
        if session.current_turn_id().is_some() {
            return Err(Error::precondition("a turn is already running"));
        }

        let turn = self
            .store
            .add_turn(&session.conversation_id, prompt, source, model)
            .await?;
        {
            let mut current = lock(&session.current);
            *current = Some(CurrentTurn {
                id: turn.id.clone(),
                response: String::new(),
                model: model.map(String::from),
                started: Instant::now(),
            });
        }

        let frame = serde_json::json!({
            "type": "user",
            "message": {
                "role": "user",
                "content": [{"type": "text", "text": prompt}],
            },
        });
        let mut line = frame.to_string();
        line.push('\n');
        {
            let mut input = session.input.lock().await;
            input.write_all(line.as_bytes()).await?;
            input.flush().await?;
        }
        Ok(turn)
    }

    /// Abort the running turn: TERM the assistant, KILL after a grace,
    /// and mark the turn cancelled.
    pub async fn cancel(&self, session_id: &str) -> Result<()> {
        let session = self.get_session(session_id)?;
        let Some(current) = lock(&session.current).take() else {
            return Err(Error::precondition("no turn is running"));
        };

        let _ = self
            .runtime
            .exec_run(
                &session.runtime_id,
                ExecSpec::command(["pkill", "-TERM", "-f", self.assistant.binary.as_str()]),
            )
            .await;
        let runtime = self.runtime.clone();
        let runtime_id = session.runtime_id.clone();
        let binary = self.assistant.binary.clone();
        tokio::spawn(async move {
            tokio::time::sleep(CANCEL_GRACE).await;
            let _ = runtime
                .exec_run(
                    &runtime_id,
                    ExecSpec::command(["pkill", "-KILL", "-f", binary.as_str()]),
                )
                .await;
        });

        let usage = TurnUsage {
            model: current.model.clone(),
            duration_ms: Some(current.started.elapsed().as_millis() as i64),
            ..Default::default()
        };
        self.store
            .finish_turn(&current.id, TurnState::Cancelled, &current.response, &usage)
            .await?;
        if let Ok(turn) = self.store.get_turn(&current.id).await {
            session.fan_out(SessionEvent::TurnComplete { turn });
        }
        info!(session_id, "turn cancelled");
        Ok(())
    }

    /// Register an event subscriber. Returns the live channel plus the
    /// already-emitted events of the in-flight turn (replayed so a client
    /// reconnecting mid-turn misses nothing).
    pub async fn subscribe(
        &self,
        session_id: &str,
        client_id: &str,
    ) -> Result<(mpsc::Receiver<SessionEvent>, Vec<SessionEvent>)> {
        let session = self.get_session(session_id)?;
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        // Registration completes before replay is read, so an event
        // arriving in between is delivered live rather than lost.
        lock(&session.subscribers).insert(client_id.to_string(), tx);

        let replay = match session.current_turn_id() {
            Some(turn_id) => self
                .store
                .events_for_turn(&turn_id)
                .await?
                .into_iter()
                .map(|payload| SessionEvent::Event {
                    turn_id: turn_id.clone(),
                    payload,
                })
                .collect(),
            None => Vec::new(),
        };
        Ok((rx, replay))
    }

    pub fn unsubscribe(&self, session_id: &str, client_id: &str) {
        if let Ok(session) = self.get_session(session_id) {
            lock(&session.subscribers).remove(client_id);
        }
    }

    pub fn get_session(&self, session_id: &str) -> Result<Arc<HeadlessSession>> {
        lock(&self.sessions)
            .get(session_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("headless session {session_id} not found")))
    }

    pub fn session_for_container(&self, container_id: &str) -> Option<Arc<HeadlessSession>> {
        lock(&self.sessions)
            .values()
            .find(|s| s.container_id == container_id)
            .cloned()
    }

    pub fn session_info(&self, session: &HeadlessSession) -> SessionInfo {
        SessionInfo {
            session_id: session.id.clone(),
            conversation_id: session.conversation_id.clone(),
            container_id: session.container_id.clone(),
            assistant_session_id: None,
            current_turn_id: session.current_turn_id(),
        }
    }

    /// Tear down the process and fan-out channels. The conversation and
    /// its turns stay persisted.
    pub async fn close_session(&self, session_id: &str) {
        let session = lock(&self.sessions).remove(session_id);
        if let Some(session) = session {
            session.cancel.cancel();
            lock(&session.subscribers).clear();
            let _ = self
                .runtime
                .exec_run(
                    &session.runtime_id,
                    ExecSpec::command(["pkill", "-f", self.assistant.binary.as_str()]),
                )
                .await;
            info!(session_id, "headless session closed");
        }
    }

    /// Close any session bound to the container. Returns true when one
    /// was closed. Used by the mode arbiter.
    pub async fn close_for_container(&self, container_id: &str) -> bool {
        match self.session_for_container(container_id) {
            Some(session) => {
                self.close_session(&session.id).await;
                true
            },
            None => false,
        }
    }

    /// Deleting a conversation first closes any live session bound to it.
    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<()> {
        let live: Option<Arc<HeadlessSession>> = lock(&self.sessions)
            .values()
            .find(|s| s.conversation_id == conversation_id)
            .cloned();
        if let Some(session) = live {
            self.close_session(&session.id).await;
        }
        self.store.delete_conversation(conversation_id).await
    }
}

/// Concatenated text blocks of a stream-json message event.
fn extract_message_text(event: &serde_json::Value) -> String {
    let Some(content) = event.pointer("/message/content") else {
        return String::new();
    };
    match content {
        serde_json::Value::String(text) => text.clone(),
        serde_json::Value::Array(blocks) => blocks
            .iter()
            .filter(|block| block.get("type").and_then(|t| t.as_str()) == Some("text"))
            .filter_map(|block| block.get("text").and_then(|t| t.as_str()))
            .collect(),
        _ => String::new(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {
        super::*,
        burrow_runtime::testing::{FakeExec, FakeRuntime},
    };

    struct Fixture {
        manager: HeadlessManager,
        runtime: Arc<FakeRuntime>,
    }

    async fn fixture() -> Fixture {
        // Single connection: the line reader persists events while the
        // test polls the same in-memory database.
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        ConversationStore::init(&pool).await.unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        runtime.add_running("rt-1", "one");
        let manager = HeadlessManager::new(
            runtime.clone(),
            Arc::new(ConversationStore::new(pool)),
            AssistantConfig::default(),
        );
        Fixture { manager, runtime }
    }

    fn feed_line(exec: &Arc<FakeExec>, value: serde_json::Value) {
        let mut line = value.to_string();
        line.push('\n');
        exec.feed_output(line.as_bytes());
    }

    async fn wait_for<F: Fn() -> bool>(check: F, what: &str) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test]
    async fn create_session_spawns_stream_json_assistant() {
        let f = fixture().await;
        let info = f
            .manager
            .create_session("c1", "rt-1", None)
            .await
            .unwrap();
        assert!(info.current_turn_id.is_none());

        // Previous assistant killed, then a stream-json exec attached.
        assert!(
            f.runtime
                .recorded_runs()
                .iter()
                .any(|cmd| cmd.contains("pkill -f claude"))
        );
        let exec = f.runtime.last_exec().unwrap();
        assert!(exec.spec.cmd.contains(&"--output-format".to_string()));
        assert!(exec.spec.cmd.contains(&"stream-json".to_string()));
        assert!(!exec.spec.tty);
    }

    #[tokio::test]
    async fn prompt_round_trip_completes_turn() {
        let f = fixture().await;
        let info = f.manager.create_session("c1", "rt-1", None).await.unwrap();
        let exec = f.runtime.last_exec().unwrap();

        let (mut rx, replay) = f.manager.subscribe(&info.session_id, "ws-1").await.unwrap();
        assert!(replay.is_empty());

        let turn = f
            .manager
            .send_prompt(&info.session_id, "add a test", "ws", None)
            .await
            .unwrap();
        assert_eq!(turn.turn_idx, 0);
        assert_eq!(turn.state, TurnState::Running);

        // The prompt reached stdin as one JSON line.
        let written = String::from_utf8(exec.written_bytes()).unwrap();
        let frame: serde_json::Value =
            serde_json::from_str(written.lines().next().unwrap()).unwrap();
        assert_eq!(frame["type"], "user");
        assert_eq!(frame["message"]["content"][0]["text"], "add a test");

        feed_line(
            &exec,
            serde_json::json!({
                "type": "system", "subtype": "init", "session_id": "asst-77",
            }),
        );
        feed_line(
            &exec,
            serde_json::json!({
                "type": "assistant",
                "message": {
                    "model": "sandbox-model",
                    "content": [{"type": "text", "text": "done: "}],
                },
            }),
        );
        feed_line(
            &exec,
            serde_json::json!({
                "type": "assistant",
                "message": {"content": [{"type": "text", "text": "added"}]},
            }),
        );
        feed_line(
            &exec,
            serde_json::json!({
                "type": "result", "subtype": "success",
                "duration_ms": 1200, "total_cost_usd": 0.004,
                "usage": {"input_tokens": 12, "output_tokens": 30},
            }),
        );

        // Subscriber sees the assistant events, then the completion.
        let mut saw_complete = None;
        for _ in 0..10 {
            match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
                Ok(Some(SessionEvent::TurnComplete { turn })) => {
                    saw_complete = Some(turn);
                    break;
                },
                Ok(Some(SessionEvent::Event { .. })) => continue,
                _ => break,
            }
        }
        let completed = saw_complete.expect("no turn_complete delivered");
        assert_eq!(completed.state, TurnState::Completed);
        assert_eq!(completed.response, "done: added");
        assert_eq!(completed.output_tokens, Some(30));
        assert_eq!(completed.model.as_deref(), Some("sandbox-model"));

        // The assistant session id was captured for future resume.
        let conversation = f
            .manager
            .store()
            .get_conversation(&info.conversation_id)
            .await
            .unwrap();
        assert_eq!(conversation.assistant_session_id.as_deref(), Some("asst-77"));
    }

    #[tokio::test]
    async fn reconnect_mid_turn_replays_emitted_events() {
        let f = fixture().await;
        let info = f.manager.create_session("c1", "rt-1", None).await.unwrap();
        let exec = f.runtime.last_exec().unwrap();

        f.manager
            .send_prompt(&info.session_id, "long task", "ws", None)
            .await
            .unwrap();

        feed_line(
            &exec,
            serde_json::json!({
                "type": "assistant",
                "message": {"content": [{"type": "text", "text": "step 1"}]},
            }),
        );
        feed_line(
            &exec,
            serde_json::json!({
                "type": "assistant",
                "message": {"content": [{"type": "text", "text": " step 2"}]},
            }),
        );

        let manager = &f.manager;
        let session = manager.get_session(&info.session_id).unwrap();
        wait_for(
            || session.current_turn_id().is_some(),
            "turn to be running",
        )
        .await;
        // Wait until both events are persisted.
        let store = manager.store().clone();
        let turn_id = session.current_turn_id().unwrap();
        for _ in 0..200 {
            if store.events_for_turn(&turn_id).await.unwrap().len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // A client attaching now gets the two missed events as replay.
        let (_rx, replay) = manager.subscribe(&info.session_id, "late").await.unwrap();
        assert_eq!(replay.len(), 2);
        match &replay[0] {
            SessionEvent::Event { payload, .. } => {
                assert_eq!(payload["message"]["content"][0]["text"], "step 1");
            },
            other => panic!("unexpected replay frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_marks_turn_cancelled() {
        let f = fixture().await;
        let info = f.manager.create_session("c1", "rt-1", None).await.unwrap();
        let turn = f
            .manager
            .send_prompt(&info.session_id, "never mind", "ws", None)
            .await
            .unwrap();

        f.manager.cancel(&info.session_id).await.unwrap();
        let stored = f.manager.store().get_turn(&turn.id).await.unwrap();
        assert_eq!(stored.state, TurnState::Cancelled);
        assert!(
            f.runtime
                .recorded_runs()
                .iter()
                .any(|cmd| cmd.contains("pkill -TERM"))
        );

        // With no running turn, another cancel is a precondition error.
        assert!(matches!(
            f.manager.cancel(&info.session_id).await.unwrap_err(),
            Error::Precondition(_)
        ));
    }

    #[tokio::test]
    async fn second_prompt_while_running_is_rejected() {
        let f = fixture().await;
        let info = f.manager.create_session("c1", "rt-1", None).await.unwrap();
        f.manager
            .send_prompt(&info.session_id, "first", "ws", None)
            .await
            .unwrap();
        let err = f
            .manager
            .send_prompt(&info.session_id, "second", "ws", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[tokio::test]
    async fn create_for_same_container_replaces_session() {
        let f = fixture().await;
        let first = f.manager.create_session("c1", "rt-1", None).await.unwrap();
        let second = f.manager.create_session("c1", "rt-1", None).await.unwrap();
        assert_ne!(first.session_id, second.session_id);
        assert!(f.manager.get_session(&first.session_id).is_err());
        assert!(f.manager.get_session(&second.session_id).is_ok());
    }

    #[tokio::test]
    async fn delete_conversation_closes_live_session() {
        let f = fixture().await;
        let info = f.manager.create_session("c1", "rt-1", None).await.unwrap();
        f.manager
            .delete_conversation(&info.conversation_id)
            .await
            .unwrap();
        assert!(f.manager.get_session(&info.session_id).is_err());
        assert!(
            f.manager
                .store()
                .get_conversation(&info.conversation_id)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn resume_passes_assistant_session_flag() {
        let f = fixture().await;
        let info = f.manager.create_session("c1", "rt-1", None).await.unwrap();
        f.manager
            .store()
            .set_assistant_session(&info.conversation_id, "asst-99")
            .await
            .unwrap();
        f.manager.close_session(&info.session_id).await;

        f.manager
            .create_session("c1", "rt-1", Some(info.conversation_id.clone()))
            .await
            .unwrap();
        let exec = f.runtime.last_exec().unwrap();
        assert!(exec.spec.cmd.contains(&"--resume".to_string()));
        assert!(exec.spec.cmd.contains(&"asst-99".to_string()));
    }
}
