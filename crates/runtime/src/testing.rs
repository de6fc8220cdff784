//! Scripted in-memory [`ContainerRuntime`] used by tests across the
//! workspace. Not part of the public API surface proper; kept always
//! compiled so dependent crates can use it from their own test modules.

use std::{
    collections::HashMap,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
    time::Instant,
};

use {
    async_trait::async_trait,
    burrow_common::{Error, Result},
    bytes::Bytes,
    tokio::{io::AsyncWrite, sync::mpsc},
    tokio_stream::wrappers::UnboundedReceiverStream,
};

use crate::{
    docker::{ContainerRuntime, ContainerSpec, ExecHandle, ExecOutput, ExecSpec},
    types::{Container, InitStatus, LifecycleStatus, RuntimeContainer, SelectedTemplates},
};

/// One live attached exec created through [`FakeRuntime::exec_attach`].
pub struct FakeExec {
    pub exec_id: String,
    pub spec: ExecSpec,
    /// Feed bytes that the exec "produces" on its output stream.
    pub feed: mpsc::UnboundedSender<Result<Bytes>>,
    /// Every stdin write, one entry per write call, with its arrival time.
    pub written: Arc<Mutex<Vec<(Instant, Vec<u8>)>>>,
    /// Resize calls observed for this exec.
    pub resizes: Arc<Mutex<Vec<(u16, u16)>>>,
}

impl FakeExec {
    /// Concatenated stdin bytes.
    pub fn written_bytes(&self) -> Vec<u8> {
        self.written
            .lock()
            .map(|segments| segments.iter().flat_map(|(_, b)| b.clone()).collect())
            .unwrap_or_default()
    }

    /// Stdin writes as (elapsed-since-previous, bytes) pairs.
    pub fn written_segments(&self) -> Vec<(Instant, Vec<u8>)> {
        self.written.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn feed_output(&self, bytes: &[u8]) {
        let _ = self.feed.send(Ok(Bytes::copy_from_slice(bytes)));
    }

    pub fn close_output(&self) {
        // Dropping all senders closes the stream; tests keep one sender, so
        // signal EOF with an explicit zero-length frame convention instead.
        let _ = self.feed.send(Ok(Bytes::new()));
    }
}

struct FakeState {
    containers: HashMap<String, (ContainerSpec, bool)>,
    runs: Vec<String>,
    run_scripts: Vec<(String, ExecOutput)>,
    fail_matching: Vec<String>,
    execs: Vec<Arc<FakeExec>>,
    next_exec: u64,
    resizes: HashMap<String, Arc<Mutex<Vec<(u16, u16)>>>>,
}

/// Scripted [`ContainerRuntime`]: containers are map entries, execs are
/// channel pairs the test drives by hand.
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                containers: HashMap::new(),
                runs: Vec::new(),
                run_scripts: Vec::new(),
                fail_matching: Vec::new(),
                execs: Vec::new(),
                next_exec: 0,
                resizes: HashMap::new(),
            }),
        }
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, FakeState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Every `exec_run` invocation, flattened to a single command string.
    pub fn recorded_runs(&self) -> Vec<String> {
        self.locked().runs.clone()
    }

    /// Script the output of `exec_run` calls whose command contains `pat`.
    pub fn script_run(&self, pat: &str, exit_code: i64, output: &str) {
        self.locked().run_scripts.push((
            pat.to_string(),
            ExecOutput {
                exit_code,
                output: output.to_string(),
            },
        ));
    }

    /// Make `exec_run` calls whose command contains `pat` return an error.
    pub fn fail_runs_matching(&self, pat: &str) {
        self.locked().fail_matching.push(pat.to_string());
    }

    /// Pre-register a running container under a fixed runtime id.
    pub fn add_running(&self, runtime_id: &str, name: &str) {
        self.locked().containers.insert(
            runtime_id.to_string(),
            (
                ContainerSpec {
                    name: name.to_string(),
                    image: "fake:latest".into(),
                    env: vec![],
                    labels: HashMap::new(),
                    memory_bytes: 0,
                    cpu_cores: 1.0,
                    ports: vec![],
                    work_dir: "/app".into(),
                    run_as_root: false,
                },
                true,
            ),
        );
    }

    /// Execs created so far, in creation order.
    pub fn execs(&self) -> Vec<Arc<FakeExec>> {
        self.locked().execs.clone()
    }

    pub fn last_exec(&self) -> Option<Arc<FakeExec>> {
        self.locked().execs.last().cloned()
    }
}

/// AsyncWrite sink recording each write call as a timestamped segment.
struct RecordingWriter {
    written: Arc<Mutex<Vec<(Instant, Vec<u8>)>>>,
}

impl AsyncWrite for RecordingWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if let Ok(mut segments) = self.written.lock() {
            segments.push((Instant::now(), buf.to_vec()));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let runtime_id = format!("rt-{}", spec.name);
        self.locked()
            .containers
            .insert(runtime_id.clone(), (spec.clone(), false));
        Ok(runtime_id)
    }

    async fn start_container(&self, runtime_id: &str) -> Result<()> {
        let mut state = self.locked();
        match state.containers.get_mut(runtime_id) {
            Some(entry) => {
                entry.1 = true;
                Ok(())
            },
            None => Err(Error::runtime(format!("no such container {runtime_id}"))),
        }
    }

    async fn stop_container(&self, runtime_id: &str, _timeout_secs: i64) -> Result<()> {
        if let Some(entry) = self.locked().containers.get_mut(runtime_id) {
            entry.1 = false;
        }
        Ok(())
    }

    async fn remove_container(&self, runtime_id: &str, _force: bool) -> Result<()> {
        self.locked().containers.remove(runtime_id);
        Ok(())
    }

    async fn list_containers(&self, _label: &str) -> Result<Vec<RuntimeContainer>> {
        Ok(self
            .locked()
            .containers
            .iter()
            .map(|(id, (spec, running))| RuntimeContainer {
                runtime_id: id.clone(),
                name: spec.name.clone(),
                image: spec.image.clone(),
                state: if *running { "running" } else { "exited" }.into(),
            })
            .collect())
    }

    async fn container_running(&self, runtime_id: &str) -> Result<bool> {
        Ok(self
            .locked()
            .containers
            .get(runtime_id)
            .map(|(_, running)| *running)
            .unwrap_or(false))
    }

    async fn container_ip(&self, runtime_id: &str, _preferred_network: &str) -> Result<String> {
        if self.locked().containers.contains_key(runtime_id) {
            Ok("172.18.0.2".into())
        } else {
            Err(Error::runtime(format!("no such container {runtime_id}")))
        }
    }

    async fn connect_network(&self, _runtime_id: &str, _network: &str) -> Result<()> {
        Ok(())
    }

    async fn logs(&self, _runtime_id: &str, _tail: usize) -> Result<String> {
        Ok(String::new())
    }

    async fn exec_attach(&self, _runtime_id: &str, spec: ExecSpec) -> Result<ExecHandle> {
        let (feed, rx) = mpsc::unbounded_channel::<Result<Bytes>>();
        let written = Arc::new(Mutex::new(Vec::new()));
        let resizes = Arc::new(Mutex::new(Vec::new()));

        let mut state = self.locked();
        state.next_exec += 1;
        let exec_id = format!("exec-{}", state.next_exec);
        let exec = Arc::new(FakeExec {
            exec_id: exec_id.clone(),
            spec,
            feed,
            written: written.clone(),
            resizes: resizes.clone(),
        });
        state.execs.push(exec);
        state.resizes.insert(exec_id.clone(), resizes);

        Ok(ExecHandle {
            exec_id,
            output: Box::pin(UnboundedReceiverStream::new(rx)),
            input: Box::pin(RecordingWriter { written }),
        })
    }

    async fn exec_run(&self, _runtime_id: &str, spec: ExecSpec) -> Result<ExecOutput> {
        let command = spec.cmd.join(" ");
        let mut state = self.locked();
        state.runs.push(command.clone());

        if state.fail_matching.iter().any(|pat| command.contains(pat)) {
            return Err(Error::runtime(format!("scripted failure for '{command}'")));
        }
        if let Some((_, output)) = state
            .run_scripts
            .iter()
            .find(|(pat, _)| command.contains(pat))
        {
            return Ok(output.clone());
        }
        Ok(ExecOutput {
            exit_code: 0,
            output: String::new(),
        })
    }

    async fn exec_resize(&self, exec_id: &str, cols: u16, rows: u16) -> Result<()> {
        if let Some(resizes) = self.locked().resizes.get(exec_id)
            && let Ok(mut log) = resizes.lock()
        {
            log.push((cols, rows));
        }
        Ok(())
    }
}

/// A minimal ready-to-use container record for tests.
pub fn container_fixture(name: &str) -> Container {
    Container {
        id: format!("id-{name}"),
        name: name.to_string(),
        runtime_id: format!("rt-{name}"),
        status: LifecycleStatus::Running,
        init_status: InitStatus::Ready,
        init_message: None,
        git_url: None,
        repo_name: None,
        work_dir: "/app".into(),
        memory_bytes: 2 * 1024 * 1024 * 1024,
        cpu_cores: 1.0,
        ports: vec![],
        proxy: None,
        editor_enabled: false,
        credential_id: None,
        env_profile_id: None,
        command_profile_id: None,
        templates: SelectedTemplates::default(),
        skip_git_repo: true,
        permissive_mode: false,
        run_as_root: false,
        injection: Default::default(),
        created_at_ms: 0,
        started_at_ms: None,
        stopped_at_ms: None,
        initialized_at_ms: None,
    }
}
