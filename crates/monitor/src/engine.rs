use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, OnceLock, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use {
    burrow_common::{Error, Result, time::now_ms},
    burrow_config::MonitorDefaults,
    burrow_runtime::docker::{ContainerRuntime, ExecSpec},
    burrow_term::RingBuffer,
    futures::future::BoxFuture,
    tokio::sync::{Notify, mpsc},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    log::AutomationLogStore,
    store::MonitorConfigStore,
    strategy::{
        InjectionStrategy, LlmStrategy, QueueStrategy, Strategy, StrategyContext, WebhookStrategy,
    },
    tasks::TaskStore,
    types::{ActionSummary, MonitorConfig, MonitorStatus, StrategyKind},
};

pub use crate::strategy::PtyWriter;

/// Marks a PTY session monitoring-protected (or lifts it). Installed by
/// the composition root.
pub type PtyProtector = Arc<dyn Fn(String, bool) -> BoxFuture<'static, ()> + Send + Sync>;

/// Status subscriber channel capacity; sends are drop-on-full.
const SUBSCRIBER_CAPACITY: usize = 10;
/// Subscribers without a successful send for this long are collected.
const SUBSCRIBER_TTL: Duration = Duration::from_secs(5 * 60);

struct Subscriber {
    tx: mpsc::Sender<MonitorStatus>,
    last_ok: Instant,
}

struct SessionInner {
    config: MonitorConfig,
    last_activity: Instant,
    last_action: Option<ActionSummary>,
    assistant_detected: bool,
    assistant_pid: Option<i64>,
    subscribers: HashMap<String, Subscriber>,
    timer_cancel: Option<CancellationToken>,
}

/// Per-PTY monitoring state. The ring buffer carries its own lock so
/// output writes never contend with status reads.
pub struct MonitorSession {
    pub container_id: String,
    pub pty_session_id: String,
    pub runtime_id: String,
    state: Mutex<SessionInner>,
    ring: Mutex<RingBuffer>,
    reset: Notify,
    cancel: CancellationToken,
    timer_armed: AtomicBool,
}

impl MonitorSession {
    fn threshold(&self) -> Duration {
        Duration::from_secs(lock(&self.state).config.silence_threshold_secs)
    }

    fn enabled(&self) -> bool {
        lock(&self.state).config.enabled
    }

    /// True while the silence timer task is alive. Exactly one exists for
    /// an enabled session, zero for a disabled one.
    pub fn timer_armed(&self) -> bool {
        self.timer_armed.load(Ordering::SeqCst)
    }
}

/// The silence detector. One engine owns every monitoring session, their
/// timers and assistant-detection pollers, and the strategy dispatch.
pub struct MonitorEngine {
    runtime: Arc<dyn ContainerRuntime>,
    logs: Arc<AutomationLogStore>,
    config_store: Arc<MonitorConfigStore>,
    defaults: MonitorDefaults,
    assistant_binary: String,
    sessions: RwLock<HashMap<String, Arc<MonitorSession>>>,
    writer: OnceLock<PtyWriter>,
    protector: OnceLock<PtyProtector>,
    webhook: WebhookStrategy,
    injection: InjectionStrategy,
    queue: QueueStrategy,
    llm: LlmStrategy,
    cancel: CancellationToken,
}

impl MonitorEngine {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        tasks: Arc<TaskStore>,
        logs: Arc<AutomationLogStore>,
        config_store: Arc<MonitorConfigStore>,
        defaults: MonitorDefaults,
        assistant_binary: String,
    ) -> Self {
        Self {
            runtime,
            logs,
            config_store,
            defaults,
            assistant_binary,
            sessions: RwLock::new(HashMap::new()),
            writer: OnceLock::new(),
            protector: OnceLock::new(),
            webhook: WebhookStrategy::new(),
            injection: InjectionStrategy,
            queue: QueueStrategy::new(tasks.clone()),
            llm: LlmStrategy::new(tasks),
            cancel: CancellationToken::new(),
        }
    }

    /// Install the write-to-PTY hook. Called once at startup.
    pub fn set_pty_writer(&self, writer: PtyWriter) {
        let _ = self.writer.set(writer);
    }

    /// Install the reclamation-protection hook. Called once at startup.
    pub fn set_pty_protector(&self, protector: PtyProtector) {
        let _ = self.protector.set(protector);
    }

    fn strategy(&self, kind: StrategyKind) -> &dyn Strategy {
        match kind {
            StrategyKind::Webhook => &self.webhook,
            StrategyKind::Injection => &self.injection,
            StrategyKind::Queue => &self.queue,
            StrategyKind::Llm => &self.llm,
        }
    }

    /// Turn monitoring on for a PTY session. Arms the silence timer
    /// (at most one), starts assistant detection, and marks the session
    /// monitoring-protected.
    pub async fn enable(
        self: &Arc<Self>,
        container_id: &str,
        pty_session_id: &str,
        runtime_id: &str,
        config: MonitorConfig,
    ) -> Result<()> {
        let mut config = config.sanitize();
        config.enabled = true;
        self.strategy(config.strategy).validate(&config)?;
        self.config_store.save(container_id, &config).await?;

        let (session, created) = {
            let mut sessions = write(&self.sessions);
            match sessions.get(pty_session_id) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let session = Arc::new(MonitorSession {
                        container_id: container_id.to_string(),
                        pty_session_id: pty_session_id.to_string(),
                        runtime_id: runtime_id.to_string(),
                        state: Mutex::new(SessionInner {
                            config: MonitorConfig::default(),
                            last_activity: Instant::now(),
                            last_action: None,
                            assistant_detected: false,
                            assistant_pid: None,
                            subscribers: HashMap::new(),
                            timer_cancel: None,
                        }),
                        ring: Mutex::new(RingBuffer::new(self.defaults.ring_capacity)),
                        reset: Notify::new(),
                        cancel: self.cancel.child_token(),
                        timer_armed: AtomicBool::new(false),
                    });
                    sessions.insert(pty_session_id.to_string(), session.clone());
                    (session, true)
                },
            }
        };

        let spawn_timer = {
            let mut inner = lock(&session.state);
            inner.config = config;
            inner.last_activity = Instant::now();
            if inner.timer_cancel.is_some() {
                // Already armed; the running timer picks up the new
                // threshold on its next loop iteration.
                None
            } else {
                let timer_cancel = session.cancel.child_token();
                inner.timer_cancel = Some(timer_cancel.clone());
                Some(timer_cancel)
            }
        };

        if let Some(timer_cancel) = spawn_timer {
            self.spawn_timer(session.clone(), timer_cancel);
        }
        if created {
            self.spawn_detection(session.clone());
        }

        if let Some(protector) = self.protector.get() {
            protector(pty_session_id.to_string(), true).await;
        }
        info!(pty_session_id, container_id, "monitoring enabled");
        Ok(())
    }

    /// Turn monitoring off: the timer is disarmed and the session loses
    /// its reclamation protection. Session state is retained until the
    /// cleanup sweep collects it.
    pub async fn disable(&self, pty_session_id: &str) -> Result<()> {
        let session = self.get(pty_session_id)?;
        {
            let mut inner = lock(&session.state);
            inner.config.enabled = false;
            if let Some(timer_cancel) = inner.timer_cancel.take() {
                timer_cancel.cancel();
            }
        }
        let config = lock(&session.state).config.clone();
        self.config_store.save(&session.container_id, &config).await?;

        if let Some(protector) = self.protector.get() {
            protector(pty_session_id.to_string(), false).await;
        }
        info!(pty_session_id, "monitoring disabled");
        Ok(())
    }

    /// Replace the session's policy. Enabled state follows the config:
    /// `enabled = true` behaves like enable, `false` like disable with
    /// the new policy retained.
    pub async fn update_config(
        self: &Arc<Self>,
        pty_session_id: &str,
        config: MonitorConfig,
    ) -> Result<()> {
        let session = self.get(pty_session_id)?;
        if config.enabled {
            let container_id = session.container_id.clone();
            let runtime_id = session.runtime_id.clone();
            return self
                .enable(&container_id, pty_session_id, &runtime_id, config)
                .await;
        }

        self.strategy(config.strategy).validate(&config)?;
        let was_enabled = {
            let mut inner = lock(&session.state);
            let was_enabled = inner.config.enabled;
            inner.config = config.sanitize();
            inner.config.enabled = false;
            if let Some(timer_cancel) = inner.timer_cancel.take() {
                timer_cancel.cancel();
            }
            was_enabled
        };
        let saved = lock(&session.state).config.clone();
        self.config_store.save(&session.container_id, &saved).await?;

        if was_enabled && let Some(protector) = self.protector.get() {
            protector(pty_session_id.to_string(), false).await;
        }
        Ok(())
    }

    pub fn get(&self, pty_session_id: &str) -> Result<Arc<MonitorSession>> {
        read(&self.sessions)
            .get(pty_session_id)
            .cloned()
            .ok_or_else(|| {
                Error::not_found(format!("no monitoring session for {pty_session_id}"))
            })
    }

    /// PTY-output callback target, invoked synchronously by the mux
    /// reader for every block: window the bytes, refresh activity, and
    /// slide the silence timer.
    pub fn on_pty_output(&self, pty_session_id: &str, data: &[u8]) {
        let Some(session) = read(&self.sessions).get(pty_session_id).cloned() else {
            return;
        };
        {
            let mut ring = lock(&session.ring);
            ring.write(data);
        }
        {
            let mut inner = lock(&session.state);
            inner.last_activity = Instant::now();
        }
        if session.enabled() {
            session.reset.notify_waiters();
        }
    }

    pub fn status(&self, pty_session_id: &str) -> Result<MonitorStatus> {
        let session = self.get(pty_session_id)?;
        Ok(Self::snapshot(&session))
    }

    /// The last-N bytes of the session's output window.
    pub fn context(&self, pty_session_id: &str, n: usize) -> Result<Vec<u8>> {
        let session = self.get(pty_session_id)?;
        let ring = lock(&session.ring);
        Ok(ring.get_last(n))
    }

    /// Register a status subscriber. Registration completes before this
    /// returns, so a status change after `subscribe` is always delivered.
    pub fn subscribe(
        &self,
        pty_session_id: &str,
        subscriber_id: &str,
    ) -> Result<mpsc::Receiver<MonitorStatus>> {
        let session = self.get(pty_session_id)?;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let snapshot = Self::snapshot(&session);
        let _ = tx.try_send(snapshot);
        lock(&session.state).subscribers.insert(
            subscriber_id.to_string(),
            Subscriber {
                tx,
                last_ok: Instant::now(),
            },
        );
        Ok(rx)
    }

    pub fn unsubscribe(&self, pty_session_id: &str, subscriber_id: &str) {
        if let Ok(session) = self.get(pty_session_id) {
            lock(&session.state).subscribers.remove(subscriber_id);
        }
    }

    fn snapshot(session: &MonitorSession) -> MonitorStatus {
        let inner = lock(&session.state);
        MonitorStatus {
            container_id: session.container_id.clone(),
            pty_session_id: session.pty_session_id.clone(),
            enabled: inner.config.enabled,
            silence_elapsed_secs: inner.last_activity.elapsed().as_secs(),
            silence_threshold_secs: inner.config.silence_threshold_secs,
            strategy: inner.config.strategy,
            assistant_detected: inner.assistant_detected,
            assistant_pid: inner.assistant_pid,
            last_action: inner.last_action.clone(),
        }
    }

    fn broadcast(session: &MonitorSession) {
        let snapshot = Self::snapshot(session);
        let mut inner = lock(&session.state);
        for subscriber in inner.subscribers.values_mut() {
            // Non-blocking: a full channel just misses this update.
            if subscriber.tx.try_send(snapshot.clone()).is_ok() {
                subscriber.last_ok = Instant::now();
            }
        }
    }

    fn spawn_timer(self: &Arc<Self>, session: Arc<MonitorSession>, cancel: CancellationToken) {
        let engine = Arc::clone(self);
        session.timer_armed.store(true, Ordering::SeqCst);
        tokio::spawn(async move {
            loop {
                let threshold = session.threshold();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = session.cancel.cancelled() => break,
                    _ = session.reset.notified() => continue,
                    _ = tokio::time::sleep(threshold) => {
                        engine.fire(&session).await;
                    },
                }
            }
            session.timer_armed.store(false, Ordering::SeqCst);
            debug!(pty_session_id = %session.pty_session_id, "silence timer disarmed");
        });
    }

    fn spawn_detection(self: &Arc<Self>, session: Arc<MonitorSession>) {
        let engine = Arc::clone(self);
        let interval = Duration::from_secs(self.defaults.detect_interval_secs.max(1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = session.cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {},
                }
                let result = engine
                    .runtime
                    .exec_run(
                        &session.runtime_id,
                        ExecSpec::command(["pgrep", "-f", engine.assistant_binary.as_str()]),
                    )
                    .await;
                let pid = match result {
                    Ok(output) if output.success() => output
                        .output
                        .lines()
                        .next()
                        .and_then(|line| line.trim().parse::<i64>().ok()),
                    // Detection failures stay silent; the next poll retries.
                    _ => None,
                };
                let changed = {
                    let mut inner = lock(&session.state);
                    let changed =
                        inner.assistant_pid != pid || inner.assistant_detected != pid.is_some();
                    inner.assistant_detected = pid.is_some();
                    inner.assistant_pid = pid;
                    changed
                };
                if changed {
                    Self::broadcast(&session);
                }
            }
        });
    }

    /// Timer expiry: run the configured strategy if the assistant is
    /// present, record the outcome, and let the loop re-arm.
    async fn fire(self: &Arc<Self>, session: &Arc<MonitorSession>) {
        let (config, detected, silence_secs) = {
            let inner = lock(&session.state);
            (
                inner.config.clone(),
                inner.assistant_detected,
                inner.last_activity.elapsed().as_secs(),
            )
        };
        if !config.enabled {
            return;
        }
        if !detected {
            debug!(
                pty_session_id = %session.pty_session_id,
                "assistant not detected, skipping strategy"
            );
            return;
        }
        let Some(writer) = self.writer.get() else {
            warn!("no pty writer installed, skipping strategy");
            return;
        };

        let snapshot = {
            let ring = lock(&session.ring);
            ring.read()
        };
        let threshold_secs = config.silence_threshold_secs;
        let kind = config.strategy;
        let ctx = StrategyContext {
            container_id: session.container_id.clone(),
            pty_session_id: session.pty_session_id.clone(),
            runtime_id: session.runtime_id.clone(),
            silence_secs,
            threshold_secs,
            snapshot,
            config,
            writer: writer.clone(),
        };

        // The strategy inherits a deadline equal to the threshold.
        let outcome = match tokio::time::timeout(
            Duration::from_secs(threshold_secs),
            self.strategy(kind).execute(&ctx),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => crate::types::StrategyOutcome::failed(
                "timeout",
                format!("strategy exceeded {threshold_secs}s deadline"),
            ),
        };

        if let Err(e) = self
            .logs
            .record(
                &session.container_id,
                &session.pty_session_id,
                kind,
                &outcome,
                &ctx.snapshot,
            )
            .await
        {
            warn!(error = %e, "automation log write failed");
        }

        {
            let mut inner = lock(&session.state);
            inner.last_action = Some(ActionSummary {
                strategy: kind,
                action: outcome.action.clone(),
                command: outcome.command.clone(),
                success: outcome.success,
                error: outcome.error.clone(),
                at_ms: now_ms(),
            });
        }
        Self::broadcast(session);
    }

    /// One cleanup pass: GC stale subscribers everywhere, then drop
    /// sessions that are disabled and inactive past the TTL. Enabled
    /// sessions are never swept.
    pub fn sweep_once(&self) -> usize {
        let ttl = Duration::from_secs(self.defaults.session_ttl_secs);
        let mut stale = Vec::new();
        {
            let sessions = read(&self.sessions);
            for session in sessions.values() {
                let mut inner = lock(&session.state);
                inner
                    .subscribers
                    .retain(|_, sub| sub.last_ok.elapsed() < SUBSCRIBER_TTL);
                if !inner.config.enabled && inner.last_activity.elapsed() >= ttl {
                    stale.push(session.pty_session_id.clone());
                }
            }
        }
        for pty_session_id in &stale {
            if let Some(session) = write(&self.sessions).remove(pty_session_id) {
                session.cancel.cancel();
                debug!(pty_session_id, "monitoring session swept");
            }
        }
        stale.len()
    }

    /// Periodic cleanup loop. Runs until cancelled.
    pub async fn run_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(Duration::from_secs(
            self.defaults.sweep_interval_secs.max(1),
        ));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tick.tick() => {},
            }
            let swept = self.sweep_once();
            if swept > 0 {
                info!(swept, "monitoring sessions cleaned up");
            }
        }
    }

    /// Drop a session outright (its PTY is gone).
    pub fn remove_session(&self, pty_session_id: &str) {
        if let Some(session) = write(&self.sessions).remove(pty_session_id) {
            session.cancel.cancel();
        }
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
        write(&self.sessions).clear();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn read<T>(rw: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match rw.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write<T>(rw: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match rw.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
