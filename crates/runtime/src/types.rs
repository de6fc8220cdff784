use serde::{Deserialize, Serialize};

/// Container lifecycle, driven only by [`crate::ContainerController`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStatus {
    Created,
    Running,
    Stopped,
    Deleted,
}

impl LifecycleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "running" => Some(Self::Running),
            "stopped" => Some(Self::Stopped),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }
}

/// Progress of the background provisioning state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitStatus {
    Pending,
    Cloning,
    Initializing,
    Ready,
    Failed,
}

impl InitStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Cloning => "cloning",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "cloning" => Some(Self::Cloning),
            "initializing" => Some(Self::Initializing),
            "ready" => Some(Self::Ready),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Declared container port exposed on the host.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: u16,
}

/// How the reverse proxy reaches this sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyDescriptor {
    /// Domain-routed (`<domain>` under the configured base) …
    pub domain: Option<String>,
    /// … or port-routed on a host port from the configured range.
    pub external_port: Option<u16>,
    /// Service port inside the container the proxy targets.
    pub internal_port: u16,
}

/// One template that could not be written into the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InjectionFailure {
    pub template_name: String,
    pub kind: String,
    pub reason: String,
}

/// Per-container audit of config injection. Partial failure is tolerated;
/// creation never fails because a template could not be written.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InjectionOutcome {
    pub successful: Vec<String>,
    pub failed: Vec<InjectionFailure>,
    pub warnings: Vec<String>,
    pub injected_at_ms: Option<u64>,
}

/// Selected config template ids, grouped by kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectedTemplates {
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub mcp_servers: Vec<String>,
    #[serde(default)]
    pub commands: Vec<String>,
}

impl SelectedTemplates {
    pub fn is_empty(&self) -> bool {
        self.instructions.is_none()
            && self.skills.is_empty()
            && self.mcp_servers.is_empty()
            && self.commands.is_empty()
    }
}

/// Persistent record of a managed sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    pub name: String,
    /// Opaque id assigned by the container runtime; empty until provisioned.
    pub runtime_id: String,
    pub status: LifecycleStatus,
    pub init_status: InitStatus,
    pub init_message: Option<String>,
    pub git_url: Option<String>,
    pub repo_name: Option<String>,
    pub work_dir: String,
    pub memory_bytes: i64,
    pub cpu_cores: f64,
    pub ports: Vec<PortMapping>,
    pub proxy: Option<ProxyDescriptor>,
    pub editor_enabled: bool,
    pub credential_id: Option<String>,
    pub env_profile_id: Option<String>,
    pub command_profile_id: Option<String>,
    pub templates: SelectedTemplates,
    pub skip_git_repo: bool,
    pub permissive_mode: bool,
    pub run_as_root: bool,
    pub injection: InjectionOutcome,
    pub created_at_ms: u64,
    pub started_at_ms: Option<u64>,
    pub stopped_at_ms: Option<u64>,
    pub initialized_at_ms: Option<u64>,
}

/// Validated input to [`crate::ContainerController::create`].
#[derive(Debug, Clone, Deserialize)]
pub struct CreateContainerRequest {
    pub name: String,
    #[serde(default)]
    pub git_url: Option<String>,
    #[serde(default)]
    pub repo_name: Option<String>,
    #[serde(default)]
    pub memory_bytes: Option<i64>,
    #[serde(default)]
    pub cpu_cores: Option<f64>,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub proxy_enabled: bool,
    #[serde(default)]
    pub proxy_domain: Option<String>,
    #[serde(default)]
    pub proxy_external_port: Option<u16>,
    #[serde(default)]
    pub proxy_internal_port: Option<u16>,
    #[serde(default)]
    pub editor_enabled: bool,
    #[serde(default)]
    pub credential_id: Option<String>,
    #[serde(default)]
    pub env_profile_id: Option<String>,
    #[serde(default)]
    pub command_profile_id: Option<String>,
    #[serde(default)]
    pub templates: SelectedTemplates,
    #[serde(default)]
    pub skip_git_repo: bool,
    #[serde(default)]
    pub permissive_mode: bool,
    #[serde(default)]
    pub run_as_root: bool,
}

/// Work dir for a sandbox: `/app` without a repository, else
/// `/workspace/<repo>`.
pub fn work_dir_for(skip_git_repo: bool, repo_name: Option<&str>) -> String {
    match repo_name {
        Some(repo) if !skip_git_repo => format!("/workspace/{repo}"),
        _ => "/app".to_string(),
    }
}

/// A container as the runtime reports it, used for orphan reconciliation.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeContainer {
    pub runtime_id: String,
    pub name: String,
    pub image: String,
    pub state: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_dir_defaults() {
        assert_eq!(work_dir_for(true, None), "/app");
        assert_eq!(work_dir_for(true, Some("repo")), "/app");
        assert_eq!(work_dir_for(false, None), "/app");
        assert_eq!(work_dir_for(false, Some("api")), "/workspace/api");
    }

    #[test]
    fn status_round_trips() {
        for s in [
            LifecycleStatus::Created,
            LifecycleStatus::Running,
            LifecycleStatus::Stopped,
            LifecycleStatus::Deleted,
        ] {
            assert_eq!(LifecycleStatus::parse(s.as_str()), Some(s));
        }
        for s in [
            InitStatus::Pending,
            InitStatus::Cloning,
            InitStatus::Initializing,
            InitStatus::Ready,
            InitStatus::Failed,
        ] {
            assert_eq!(InitStatus::parse(s.as_str()), Some(s));
        }
    }
}
