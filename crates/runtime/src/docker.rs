use std::{collections::HashMap, pin::Pin};

use {
    async_trait::async_trait,
    bollard::{
        Docker,
        container::{
            Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
            LogsOptions, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
        },
        exec::{CreateExecOptions, ResizeExecOptions, StartExecResults},
        models::{HostConfig, PortBinding},
        network::ConnectNetworkOptions,
    },
    burrow_common::{Error, Result},
    bytes::Bytes,
    futures::{Stream, StreamExt},
    tokio::io::AsyncWrite,
};

use crate::types::{PortMapping, RuntimeContainer};

/// Everything needed to provision one sandbox container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub memory_bytes: i64,
    pub cpu_cores: f64,
    pub ports: Vec<PortMapping>,
    pub work_dir: String,
    pub run_as_root: bool,
}

/// A command executed inside a running container.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub cmd: Vec<String>,
    pub tty: bool,
    pub working_dir: Option<String>,
    pub env: Vec<String>,
}

impl ExecSpec {
    pub fn shell(shell: &str) -> Self {
        Self {
            cmd: vec![shell.to_string()],
            tty: true,
            working_dir: None,
            env: vec!["TERM=xterm-256color".into()],
        }
    }

    pub fn command(cmd: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            cmd: cmd.into_iter().map(Into::into).collect(),
            tty: false,
            working_dir: None,
            env: vec![],
        }
    }

    #[must_use]
    pub fn in_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Live attached exec: the output stream and the stdin writer.
pub struct ExecHandle {
    pub exec_id: String,
    pub output: Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>,
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
}

/// Result of a run-to-completion exec.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub output: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// The slice of the Docker Engine API burrow depends on. One production
/// implementation ([`DockerRuntime`]) plus a scripted fake for tests.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create the container and return its runtime id. Does not start it.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;
    async fn start_container(&self, runtime_id: &str) -> Result<()>;
    async fn stop_container(&self, runtime_id: &str, timeout_secs: i64) -> Result<()>;
    /// Remove, tolerating a container that is already gone.
    async fn remove_container(&self, runtime_id: &str, force: bool) -> Result<()>;
    /// All containers carrying the given managed label (running or not).
    async fn list_containers(&self, label: &str) -> Result<Vec<RuntimeContainer>>;
    async fn container_running(&self, runtime_id: &str) -> Result<bool>;
    /// Resolve the container address, preferring `preferred_network`.
    async fn container_ip(&self, runtime_id: &str, preferred_network: &str) -> Result<String>;
    async fn connect_network(&self, runtime_id: &str, network: &str) -> Result<()>;
    async fn logs(&self, runtime_id: &str, tail: usize) -> Result<String>;
    /// Start an attached exec (TTY or pipe) and hand back its streams.
    async fn exec_attach(&self, runtime_id: &str, spec: ExecSpec) -> Result<ExecHandle>;
    /// Run a command to completion, capturing combined output.
    async fn exec_run(&self, runtime_id: &str, spec: ExecSpec) -> Result<ExecOutput>;
    async fn exec_resize(&self, exec_id: &str, cols: u16, rows: u16) -> Result<()>;
}

/// [`ContainerRuntime`] over the local Docker daemon socket.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(runtime_err)?;
        Ok(Self { docker })
    }
}

fn runtime_err(e: bollard::errors::Error) -> Error {
    Error::runtime(e.to_string())
}

fn is_absent(e: &bollard::errors::Error) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        let mut exposed: HashMap<String, HashMap<(), ()>> = HashMap::new();
        for mapping in &spec.ports {
            let key = format!("{}/tcp", mapping.container_port);
            exposed.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".into()),
                    host_port: Some(mapping.host_port.to_string()),
                }]),
            );
        }

        let host_config = HostConfig {
            memory: Some(spec.memory_bytes),
            nano_cpus: Some((spec.cpu_cores * 1_000_000_000.0) as i64),
            port_bindings: Some(port_bindings),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone()),
            working_dir: Some(spec.work_dir.clone()),
            user: (!spec.run_as_root).then(|| "1000:1000".to_string()),
            // Keep the container alive; all real work happens via exec.
            cmd: Some(vec!["sleep".into(), "infinity".into()]),
            tty: Some(true),
            exposed_ports: Some(exposed),
            host_config: Some(host_config),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.as_str(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(runtime_err)?;
        Ok(response.id)
    }

    async fn start_container(&self, runtime_id: &str) -> Result<()> {
        self.docker
            .start_container(runtime_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(runtime_err)
    }

    async fn stop_container(&self, runtime_id: &str, timeout_secs: i64) -> Result<()> {
        match self
            .docker
            .stop_container(runtime_id, Some(StopContainerOptions { t: timeout_secs }))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_absent(&e) => Ok(()),
            Err(e) => Err(runtime_err(e)),
        }
    }

    async fn remove_container(&self, runtime_id: &str, force: bool) -> Result<()> {
        match self
            .docker
            .remove_container(
                runtime_id,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_absent(&e) => Ok(()),
            Err(e) => Err(runtime_err(e)),
        }
    }

    async fn list_containers(&self, label: &str) -> Result<Vec<RuntimeContainer>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![label.to_string()]);
        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(runtime_err)?;

        Ok(summaries
            .into_iter()
            .map(|s| RuntimeContainer {
                runtime_id: s.id.unwrap_or_default(),
                name: s
                    .names
                    .unwrap_or_default()
                    .first()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                image: s.image.unwrap_or_default(),
                state: s.state.unwrap_or_default(),
            })
            .collect())
    }

    async fn container_running(&self, runtime_id: &str) -> Result<bool> {
        match self
            .docker
            .inspect_container(runtime_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(details) => Ok(details
                .state
                .and_then(|s| s.running)
                .unwrap_or(false)),
            Err(e) if is_absent(&e) => Ok(false),
            Err(e) => Err(runtime_err(e)),
        }
    }

    async fn container_ip(&self, runtime_id: &str, preferred_network: &str) -> Result<String> {
        let details = self
            .docker
            .inspect_container(runtime_id, None::<InspectContainerOptions>)
            .await
            .map_err(runtime_err)?;

        let networks = details
            .network_settings
            .and_then(|s| s.networks)
            .unwrap_or_default();

        if let Some(endpoint) = networks.get(preferred_network)
            && let Some(ip) = endpoint.ip_address.as_deref().filter(|ip| !ip.is_empty())
        {
            return Ok(ip.to_string());
        }
        for endpoint in networks.values() {
            if let Some(ip) = endpoint.ip_address.as_deref().filter(|ip| !ip.is_empty()) {
                return Ok(ip.to_string());
            }
        }
        Err(Error::runtime(format!(
            "container {runtime_id} has no network address"
        )))
    }

    async fn connect_network(&self, runtime_id: &str, network: &str) -> Result<()> {
        self.docker
            .connect_network(
                network,
                ConnectNetworkOptions {
                    container: runtime_id,
                    ..Default::default()
                },
            )
            .await
            .map_err(runtime_err)
    }

    async fn logs(&self, runtime_id: &str, tail: usize) -> Result<String> {
        let mut stream = self.docker.logs(
            runtime_id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                tail: tail.to_string(),
                ..Default::default()
            }),
        );

        let mut out = Vec::new();
        while let Some(frame) = stream.next().await {
            out.extend_from_slice(&frame.map_err(runtime_err)?.into_bytes());
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    async fn exec_attach(&self, runtime_id: &str, spec: ExecSpec) -> Result<ExecHandle> {
        let created = self
            .docker
            .create_exec(
                runtime_id,
                CreateExecOptions {
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(spec.tty),
                    cmd: Some(spec.cmd),
                    working_dir: spec.working_dir,
                    env: Some(spec.env),
                    ..Default::default()
                },
            )
            .await
            .map_err(runtime_err)?;

        match self
            .docker
            .start_exec(&created.id, None)
            .await
            .map_err(runtime_err)?
        {
            StartExecResults::Attached { output, input } => Ok(ExecHandle {
                exec_id: created.id,
                output: Box::pin(
                    output.map(|frame| frame.map(|o| o.into_bytes()).map_err(runtime_err)),
                ),
                input,
            }),
            StartExecResults::Detached => {
                Err(Error::runtime("exec started detached, expected attached"))
            },
        }
    }

    async fn exec_run(&self, runtime_id: &str, spec: ExecSpec) -> Result<ExecOutput> {
        let mut handle = self.exec_attach(runtime_id, spec).await?;
        let mut out = Vec::new();
        while let Some(frame) = handle.output.next().await {
            out.extend_from_slice(&frame?);
        }
        let inspected = self
            .docker
            .inspect_exec(&handle.exec_id)
            .await
            .map_err(runtime_err)?;
        Ok(ExecOutput {
            exit_code: inspected.exit_code.unwrap_or(-1),
            output: String::from_utf8_lossy(&out).into_owned(),
        })
    }

    async fn exec_resize(&self, exec_id: &str, cols: u16, rows: u16) -> Result<()> {
        self.docker
            .resize_exec(
                exec_id,
                ResizeExecOptions {
                    height: rows,
                    width: cols,
                },
            )
            .await
            .map_err(runtime_err)
    }
}
