use std::{
    collections::HashMap,
    pin::Pin,
    sync::{
        Arc, Mutex, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use {
    burrow_common::{Error, Result, time::now_ms},
    burrow_config::TerminalConfig,
    burrow_runtime::docker::{ContainerRuntime, ExecSpec},
    bytes::Bytes,
    futures::StreamExt,
    sqlx::SqlitePool,
    tokio::{
        io::{AsyncWrite, AsyncWriteExt},
        sync::{Mutex as AsyncMutex, mpsc},
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::history::HistoryStore;

/// Per-client output channel capacity. Sends are non-blocking; a slow
/// client loses frames instead of backpressuring the reader. The history
/// store keeps the authoritative byte stream.
const CLIENT_CHANNEL_CAPACITY: usize = 100;

/// Exec output is re-sliced to at most this block size before fan-out.
const READ_BLOCK: usize = 4 * 1024;

/// Invoked with `(session_id, block)` for every output block, in stream
/// order. Installed once at startup; this is how the monitoring engine
/// observes PTY output without the mux depending on it.
pub type OutputCallback = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

struct SessionState {
    cols: u16,
    rows: u16,
    clients: HashMap<String, mpsc::Sender<Bytes>>,
    last_activity: Instant,
}

/// A long-lived pseudo-terminal attached to a running container,
/// decoupled from any client socket.
pub struct PtySession {
    pub id: String,
    pub container_id: String,
    pub runtime_id: String,
    pub exec_id: String,
    state: Mutex<SessionState>,
    input: AsyncMutex<Pin<Box<dyn AsyncWrite + Send>>>,
    cancel: CancellationToken,
    protected: AtomicBool,
}

impl std::fmt::Debug for PtySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtySession")
            .field("id", &self.id)
            .field("container_id", &self.container_id)
            .field("runtime_id", &self.runtime_id)
            .field("exec_id", &self.exec_id)
            .field("protected", &self.protected.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl PtySession {
    /// Mark (or unmark) this session monitoring-protected. Protected
    /// sessions are exempt from idle reclamation, never from orderly
    /// shutdown.
    pub fn set_protected(&self, protected: bool) {
        self.protected.store(protected, Ordering::SeqCst);
    }

    pub fn is_protected(&self) -> bool {
        self.protected.load(Ordering::SeqCst)
    }

    pub fn dimensions(&self) -> (u16, u16) {
        let state = lock(&self.state);
        (state.cols, state.rows)
    }

    pub fn client_count(&self) -> usize {
        lock(&self.state).clients.len()
    }

    pub fn idle_for(&self) -> Duration {
        lock(&self.state).last_activity.elapsed()
    }

    fn touch(&self) {
        lock(&self.state).last_activity = Instant::now();
    }
}

/// Owns every live PTY session: spawns the shell exec, runs one reader
/// routine per session, fans output to attached clients, and reclaims
/// idle sessions.
pub struct PtyMultiplexer {
    runtime: Arc<dyn ContainerRuntime>,
    history: Arc<HistoryStore>,
    pool: SqlitePool,
    cfg: TerminalConfig,
    sessions: tokio::sync::RwLock<HashMap<String, Arc<PtySession>>>,
    output_callback: OnceLock<OutputCallback>,
    cancel: CancellationToken,
}

impl PtyMultiplexer {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        history: Arc<HistoryStore>,
        pool: SqlitePool,
        cfg: TerminalConfig,
    ) -> Self {
        Self {
            runtime,
            history,
            pool,
            cfg,
            sessions: tokio::sync::RwLock::new(HashMap::new()),
            output_callback: OnceLock::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub async fn init(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS pty_sessions (
                id            TEXT PRIMARY KEY,
                container_id  TEXT NOT NULL,
                runtime_id    TEXT NOT NULL,
                exec_id       TEXT NOT NULL,
                cols          INTEGER NOT NULL,
                rows          INTEGER NOT NULL,
                active        INTEGER NOT NULL DEFAULT 1,
                last_activity INTEGER NOT NULL,
                created_at    INTEGER NOT NULL
            )"#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Install the PTY-output observer. Called once at startup.
    pub fn set_output_callback(&self, callback: OutputCallback) {
        let _ = self.output_callback.set(callback);
    }

    /// Return the live session when `session_id` names one that is still
    /// running under the same container; otherwise spawn a fresh shell
    /// exec. A supplied id is reused for the new session so its persisted
    /// scrollback carries over across process restarts.
    pub async fn get_or_create(
        &self,
        container_id: &str,
        runtime_id: &str,
        session_id: Option<String>,
        cols: u16,
        rows: u16,
    ) -> Result<Arc<PtySession>> {
        if cols == 0 || rows == 0 {
            return Err(Error::validation("terminal dimensions must be positive"));
        }

        if let Some(id) = &session_id {
            let existing = self.sessions.read().await.get(id).cloned();
            if let Some(session) = existing {
                if session.runtime_id == runtime_id {
                    return Ok(session);
                }
                // Same id against a different container: the old exec is
                // stale. Close it, then respawn under the reused id.
                let _ = self.close_session(id).await;
            }
        }

        if !self.runtime.container_running(runtime_id).await? {
            return Err(Error::precondition("container is not running"));
        }

        let handle = self
            .runtime
            .exec_attach(runtime_id, ExecSpec::shell(&self.cfg.shell))
            .await?;
        let _ = self.runtime.exec_resize(&handle.exec_id, cols, rows).await;

        let id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let session = Arc::new(PtySession {
            id: id.clone(),
            container_id: container_id.to_string(),
            runtime_id: runtime_id.to_string(),
            exec_id: handle.exec_id.clone(),
            state: Mutex::new(SessionState {
                cols,
                rows,
                clients: HashMap::new(),
                last_activity: Instant::now(),
            }),
            input: AsyncMutex::new(handle.input),
            cancel: self.cancel.child_token(),
            protected: AtomicBool::new(false),
        });

        self.persist_session(&session).await?;
        self.sessions
            .write()
            .await
            .insert(id.clone(), session.clone());

        // One reader routine per session, for the session's whole life.
        let reader_session = session.clone();
        let history = self.history.clone();
        let callback = self.output_callback.get().cloned();
        let mut output = handle.output;
        tokio::spawn(async move {
            let cancel = reader_session.cancel.clone();
            loop {
                let frame = tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = output.next() => frame,
                };
                let Some(frame) = frame else { break };
                let block = match frame {
                    Ok(block) => block,
                    Err(e) => {
                        warn!(session_id = %reader_session.id, error = %e, "exec stream error");
                        break;
                    },
                };
                if block.is_empty() {
                    break;
                }
                for piece in block.chunks(READ_BLOCK) {
                    // Order matters: history first, then the monitor
                    // callback, then the lossy client fan-out.
                    if let Err(e) = history.append(&reader_session.id, piece).await {
                        warn!(session_id = %reader_session.id, error = %e, "history append failed");
                    }
                    if let Some(callback) = &callback {
                        callback(&reader_session.id, piece);
                    }
                    let payload = Bytes::copy_from_slice(piece);
                    let mut state = lock(&reader_session.state);
                    state.last_activity = Instant::now();
                    for client in state.clients.values() {
                        // Drop-on-full; the client catches up from history.
                        let _ = client.try_send(payload.clone());
                    }
                }
            }
            debug!(session_id = %reader_session.id, "pty reader finished");
        });

        info!(session_id = %id, container_id, "pty session created");
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::message("session vanished during creation"))
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<PtySession>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Register a client and return its live output channel plus the
    /// accumulated scrollback to replay before live frames.
    pub async fn attach_client(
        &self,
        session_id: &str,
        client_id: &str,
    ) -> Result<(mpsc::Receiver<Bytes>, Vec<u8>)> {
        let session = self
            .get(session_id)
            .await
            .ok_or_else(|| Error::not_found(format!("pty session {session_id} not found")))?;

        let (tx, rx) = mpsc::channel(CLIENT_CHANNEL_CAPACITY);
        {
            let mut state = lock(&session.state);
            state.clients.insert(client_id.to_string(), tx);
        }
        let scrollback = self.history.read_full(session_id).await?;
        Ok((rx, scrollback))
    }

    pub async fn remove_client(&self, session_id: &str, client_id: &str) {
        if let Some(session) = self.get(session_id).await {
            let mut state = lock(&session.state);
            state.clients.remove(client_id);
        }
    }

    /// Send raw bytes to the PTY input and refresh last-activity.
    pub async fn write(&self, session_id: &str, data: &[u8]) -> Result<()> {
        let session = self
            .get(session_id)
            .await
            .ok_or_else(|| Error::not_found(format!("pty session {session_id} not found")))?;
        {
            let mut input = session.input.lock().await;
            input.write_all(data).await?;
            input.flush().await?;
        }
        session.touch();
        Ok(())
    }

    /// Update the exec window size and persist the dimensions.
    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<()> {
        if cols == 0 || rows == 0 {
            return Err(Error::validation("terminal dimensions must be positive"));
        }
        let session = self
            .get(session_id)
            .await
            .ok_or_else(|| Error::not_found(format!("pty session {session_id} not found")))?;
        self.runtime
            .exec_resize(&session.exec_id, cols, rows)
            .await?;
        {
            let mut state = lock(&session.state);
            state.cols = cols;
            state.rows = rows;
        }
        sqlx::query("UPDATE pty_sessions SET cols = ?, rows = ? WHERE id = ?")
            .bind(cols as i64)
            .bind(rows as i64)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Close one session: stop its reader, flush scrollback, drop client
    /// channels, mark the record inactive.
    pub async fn close_session(&self, session_id: &str) -> Result<()> {
        let session = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(session_id)
        };
        let Some(session) = session else {
            return Ok(());
        };

        session.cancel.cancel();
        {
            let mut state = lock(&session.state);
            state.clients.clear();
        }
        if let Err(e) = self.history.flush_session(session_id).await {
            warn!(session_id, error = %e, "history flush on close failed");
        }
        sqlx::query("UPDATE pty_sessions SET active = 0, last_activity = ? WHERE id = ?")
            .bind(now_ms() as i64)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        info!(session_id, "pty session closed");
        Ok(())
    }

    /// Orderly shutdown for a container going away: closes every session
    /// bound to the runtime id, protected or not. Returns the count.
    pub async fn close_for_runtime(&self, runtime_id: &str) -> usize {
        let ids: Vec<String> = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .filter(|s| s.runtime_id == runtime_id)
                .map(|s| s.id.clone())
                .collect()
        };
        for id in &ids {
            let _ = self.close_session(id).await;
        }
        ids.len()
    }

    /// Mode-arbiter variant keyed by the database container id.
    pub async fn close_for_container(&self, container_id: &str) -> usize {
        let ids: Vec<String> = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .filter(|s| s.container_id == container_id)
                .map(|s| s.id.clone())
                .collect()
        };
        for id in &ids {
            let _ = self.close_session(id).await;
        }
        ids.len()
    }

    /// All live sessions for a container.
    pub async fn sessions_for_container(&self, container_id: &str) -> Vec<Arc<PtySession>> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.container_id == container_id)
            .cloned()
            .collect()
    }

    /// One idle-reclamation pass: sessions with zero clients, idle past
    /// the configured timeout, and not monitoring-protected are closed.
    pub async fn sweep_idle_once(&self) -> usize {
        let idle_timeout = Duration::from_secs(self.cfg.idle_timeout_secs);
        let candidates: Vec<String> = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .filter(|s| {
                    !s.is_protected() && s.client_count() == 0 && s.idle_for() >= idle_timeout
                })
                .map(|s| s.id.clone())
                .collect()
        };
        for id in &candidates {
            debug!(session_id = %id, "reclaiming idle pty session");
            let _ = self.close_session(id).await;
        }
        candidates.len()
    }

    /// Periodic idle sweep. Runs until cancelled.
    pub async fn run_idle_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(Duration::from_secs(
            self.cfg.sweep_interval_secs.max(1),
        ));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tick.tick() => {},
            }
            let reclaimed = self.sweep_idle_once().await;
            if reclaimed > 0 {
                info!(reclaimed, "idle pty sessions reclaimed");
            }
        }
    }

    /// Cancel every session. Used at teardown.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for id in ids {
            let _ = self.close_session(&id).await;
        }
    }

    async fn persist_session(&self, session: &PtySession) -> Result<()> {
        let (cols, rows) = session.dimensions();
        sqlx::query(
            r#"INSERT INTO pty_sessions (id, container_id, runtime_id, exec_id, cols, rows, active, last_activity, created_at)
               VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 runtime_id = excluded.runtime_id,
                 exec_id = excluded.exec_id,
                 cols = excluded.cols,
                 rows = excluded.rows,
                 active = 1,
                 last_activity = excluded.last_activity"#,
        )
        .bind(&session.id)
        .bind(&session.container_id)
        .bind(&session.runtime_id)
        .bind(&session.exec_id)
        .bind(cols as i64)
        .bind(rows as i64)
        .bind(now_ms() as i64)
        .bind(now_ms() as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
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
        burrow_config::HistoryConfig,
        burrow_runtime::testing::FakeRuntime,
        std::time::Duration,
    };

    struct Fixture {
        mux: Arc<PtyMultiplexer>,
        runtime: Arc<FakeRuntime>,
    }

    async fn fixture(cfg: TerminalConfig) -> Fixture {
        // Single connection: the reader task and assertions share one
        // in-memory database.
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        HistoryStore::init(&pool).await.unwrap();
        PtyMultiplexer::init(&pool).await.unwrap();

        let runtime = Arc::new(FakeRuntime::new());
        runtime.add_running("rt-1", "one");
        let history = Arc::new(HistoryStore::new(pool.clone(), HistoryConfig::default()));
        let mux = Arc::new(PtyMultiplexer::new(
            runtime.clone(),
            history,
            pool,
            cfg,
        ));
        Fixture { mux, runtime }
    }

    async fn drain(rx: &mut mpsc::Receiver<Bytes>, want: usize) -> Vec<u8> {
        let mut out = Vec::new();
        while out.len() < want {
            match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
                Ok(Some(block)) => out.extend_from_slice(&block),
                _ => break,
            }
        }
        out
    }

    #[tokio::test]
    async fn rejects_zero_dimensions() {
        let f = fixture(TerminalConfig::default()).await;
        assert!(
            f.mux
                .get_or_create("c1", "rt-1", None, 0, 24)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn requires_running_container() {
        let f = fixture(TerminalConfig::default()).await;
        let err = f
            .mux
            .get_or_create("c1", "rt-missing", None, 80, 24)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[tokio::test]
    async fn same_id_returns_existing_session() {
        let f = fixture(TerminalConfig::default()).await;
        let first = f
            .mux
            .get_or_create("c1", "rt-1", None, 80, 24)
            .await
            .unwrap();
        let second = f
            .mux
            .get_or_create("c1", "rt-1", Some(first.id.clone()), 80, 24)
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(f.runtime.execs().len(), 1);
    }

    #[tokio::test]
    async fn output_reaches_all_clients_in_order() {
        let f = fixture(TerminalConfig::default()).await;
        let session = f
            .mux
            .get_or_create("c1", "rt-1", None, 80, 24)
            .await
            .unwrap();
        let (mut rx1, history1) = f.mux.attach_client(&session.id, "a").await.unwrap();
        let (mut rx2, _) = f.mux.attach_client(&session.id, "b").await.unwrap();
        assert!(history1.is_empty());

        let exec = f.runtime.last_exec().unwrap();
        exec.feed_output(b"one ");
        exec.feed_output(b"two ");
        exec.feed_output(b"three");

        let got1 = drain(&mut rx1, 13).await;
        let got2 = drain(&mut rx2, 13).await;
        assert_eq!(got1, b"one two three");
        assert_eq!(got2, b"one two three");

        // The same bytes landed in history.
        let scrollback = f.mux.history.read_full(&session.id).await.unwrap();
        assert_eq!(scrollback, b"one two three");
    }

    #[tokio::test]
    async fn attach_replays_history_before_live() {
        let f = fixture(TerminalConfig::default()).await;
        let session = f
            .mux
            .get_or_create("c1", "rt-1", None, 80, 24)
            .await
            .unwrap();
        let exec = f.runtime.last_exec().unwrap();
        exec.feed_output(b"earlier output\r\n");

        // Give the reader a moment to stage the bytes.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (_rx, scrollback) = f.mux.attach_client(&session.id, "late").await.unwrap();
        assert_eq!(scrollback, b"earlier output\r\n");
    }

    #[tokio::test]
    async fn write_lands_on_exec_stdin() {
        let f = fixture(TerminalConfig::default()).await;
        let session = f
            .mux
            .get_or_create("c1", "rt-1", None, 80, 24)
            .await
            .unwrap();
        f.mux.write(&session.id, b"ls -la\r").await.unwrap();
        let exec = f.runtime.last_exec().unwrap();
        assert_eq!(exec.written_bytes(), b"ls -la\r");
    }

    #[tokio::test]
    async fn resize_updates_exec_and_dims() {
        let f = fixture(TerminalConfig::default()).await;
        let session = f
            .mux
            .get_or_create("c1", "rt-1", None, 80, 24)
            .await
            .unwrap();
        f.mux.resize(&session.id, 132, 43).await.unwrap();
        assert_eq!(session.dimensions(), (132, 43));
        assert!(f.mux.resize(&session.id, 0, 43).await.is_err());
    }

    #[tokio::test]
    async fn close_for_runtime_closes_protected_too() {
        let f = fixture(TerminalConfig::default()).await;
        let s1 = f
            .mux
            .get_or_create("c1", "rt-1", None, 80, 24)
            .await
            .unwrap();
        let s2 = f
            .mux
            .get_or_create("c1", "rt-1", Some("second".into()), 80, 24)
            .await
            .unwrap();
        s1.set_protected(true);

        let closed = f.mux.close_for_runtime("rt-1").await;
        assert_eq!(closed, 2);
        assert!(f.mux.get(&s1.id).await.is_none());
        assert!(f.mux.get(&s2.id).await.is_none());
    }

    #[tokio::test]
    async fn idle_sweep_spares_protected_sessions() {
        let cfg = TerminalConfig {
            idle_timeout_secs: 0,
            sweep_interval_secs: 1,
            shell: "/bin/bash".into(),
        };
        let f = fixture(cfg).await;
        let idle = f
            .mux
            .get_or_create("c1", "rt-1", None, 80, 24)
            .await
            .unwrap();
        let shielded = f
            .mux
            .get_or_create("c1", "rt-1", Some("shielded".into()), 80, 24)
            .await
            .unwrap();
        shielded.set_protected(true);

        let reclaimed = f.mux.sweep_idle_once().await;
        assert_eq!(reclaimed, 1);
        assert!(f.mux.get(&idle.id).await.is_none());
        assert!(f.mux.get(&shielded.id).await.is_some());
    }

    #[tokio::test]
    async fn idle_sweep_spares_sessions_with_clients() {
        let cfg = TerminalConfig {
            idle_timeout_secs: 0,
            sweep_interval_secs: 1,
            shell: "/bin/bash".into(),
        };
        let f = fixture(cfg).await;
        let session = f
            .mux
            .get_or_create("c1", "rt-1", None, 80, 24)
            .await
            .unwrap();
        let (_rx, _) = f.mux.attach_client(&session.id, "watcher").await.unwrap();

        assert_eq!(f.mux.sweep_idle_once().await, 0);
        assert!(f.mux.get(&session.id).await.is_some());
    }
}
