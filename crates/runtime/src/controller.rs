use std::{
    sync::{Arc, OnceLock},
    time::Duration,
};

use {
    burrow_common::{Error, Result},
    burrow_config::{BurrowConfig, SandboxDefaults},
    burrow_templates::TemplateStore,
    futures::future::BoxFuture,
    serde::Serialize,
    tokio::sync::oneshot,
    tracing::{info, warn},
};

use crate::{
    docker::ContainerRuntime,
    init::InitWorker,
    inject::Injector,
    ports::PortAllocator,
    profiles::ProfileStore,
    store::ContainerStore,
    types::{
        Container, CreateContainerRequest, InitStatus, LifecycleStatus, ProxyDescriptor,
        RuntimeContainer, work_dir_for,
    },
};

/// Client-visible budget for stop/delete before the call is reported as
/// deferred; the runtime call keeps running in the background.
const VISIBLE_BUDGET: Duration = Duration::from_secs(10);
const BACKGROUND_BUDGET: Duration = Duration::from_secs(45);

/// How a stop or delete resolved within the visible budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    /// The runtime call finished inside the visible window.
    Completed,
    /// Still running in the background; poll the status endpoint.
    Deferred,
}

/// Closes every PTY session bound to a runtime id, returning the count.
/// Installed by the composition root so the controller does not depend on
/// the multiplexer.
pub type SessionCloser = Arc<dyn Fn(String) -> BoxFuture<'static, usize> + Send + Sync>;

/// Sandbox lifecycle operations. All state transitions of a container
/// record happen here.
pub struct ContainerController {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<ContainerStore>,
    ports: Arc<PortAllocator>,
    profiles: Arc<ProfileStore>,
    injector: Arc<Injector>,
    config: BurrowConfig,
    session_closer: OnceLock<SessionCloser>,
}

impl ContainerController {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<ContainerStore>,
        ports: Arc<PortAllocator>,
        profiles: Arc<ProfileStore>,
        templates: Arc<TemplateStore>,
        config: BurrowConfig,
    ) -> Self {
        let injector = Arc::new(Injector::new(runtime.clone(), templates));
        Self {
            runtime,
            store,
            ports,
            profiles,
            injector,
            config,
            session_closer: OnceLock::new(),
        }
    }

    /// Install the PTY-closing hook. Called once at startup.
    pub fn set_session_closer(&self, closer: SessionCloser) {
        let _ = self.session_closer.set(closer);
    }

    /// Validate the request, reserve the record and its host ports, and
    /// kick off background provisioning. Returns the record immediately;
    /// progress is visible through `init_status`.
    pub async fn create(&self, request: CreateContainerRequest) -> Result<Container> {
        self.validate(&request).await?;

        let id = uuid::Uuid::new_v4().to_string();
        let proxy = self.reserve_proxy(&request, &id).await?;
        for mapping in &request.ports {
            if let Err(e) = self.ports.reserve(mapping.host_port, &id).await {
                let _ = self.ports.release_for_container(&id).await;
                return Err(e);
            }
        }

        let defaults = &self.config.sandbox;
        let container = Container {
            id: id.clone(),
            name: request.name.clone(),
            runtime_id: String::new(),
            status: LifecycleStatus::Created,
            init_status: InitStatus::Pending,
            init_message: None,
            work_dir: work_dir_for(request.skip_git_repo, request.repo_name.as_deref()),
            git_url: request.git_url,
            repo_name: request.repo_name,
            memory_bytes: request.memory_bytes.unwrap_or(defaults.memory_bytes),
            cpu_cores: request.cpu_cores.unwrap_or(defaults.cpu_cores),
            ports: request.ports,
            proxy,
            editor_enabled: request.editor_enabled,
            credential_id: request.credential_id,
            env_profile_id: request.env_profile_id,
            command_profile_id: request.command_profile_id,
            templates: request.templates,
            skip_git_repo: request.skip_git_repo,
            permissive_mode: request.permissive_mode,
            run_as_root: request.run_as_root,
            injection: Default::default(),
            created_at_ms: burrow_common::time::now_ms(),
            started_at_ms: None,
            stopped_at_ms: None,
            initialized_at_ms: None,
        };

        if let Err(e) = self.store.insert(&container).await {
            let _ = self.ports.release_for_container(&id).await;
            return Err(e);
        }
        info!(container = %container.name, id = %container.id, "container record reserved");

        let worker = InitWorker {
            runtime: self.runtime.clone(),
            store: self.store.clone(),
            profiles: self.profiles.clone(),
            injector: self.injector.clone(),
            config: self.config.clone(),
        };
        tokio::spawn(async move { worker.run(id).await });

        Ok(container)
    }

    pub async fn get(&self, id: &str) -> Result<Container> {
        self.store.get(id).await
    }

    pub async fn list(&self) -> Result<Vec<Container>> {
        self.store.list().await
    }

    /// Start a previously stopped container. Requires `init_status = Ready`.
    pub async fn start(&self, id: &str) -> Result<Container> {
        let container = self.store.get(id).await?;
        if container.init_status != InitStatus::Ready {
            return Err(Error::precondition(format!(
                "container is not ready (init status: {})",
                container.init_status.as_str()
            )));
        }
        self.runtime.start_container(&container.runtime_id).await?;
        self.store.set_status(id, LifecycleStatus::Running).await?;
        self.store.get(id).await
    }

    /// Stop with background completion semantics: the runtime call gets a
    /// 45 s budget on a detached task; the caller waits at most 10 s.
    pub async fn stop(&self, id: &str) -> Result<StopOutcome> {
        let container = self.store.get(id).await?;
        self.close_sessions(&container.runtime_id).await;

        let runtime = self.runtime.clone();
        let store = self.store.clone();
        let container_id = container.id.clone();
        let runtime_id = container.runtime_id.clone();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let result = match tokio::time::timeout(
                BACKGROUND_BUDGET,
                runtime.stop_container(&runtime_id, 10),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(Error::runtime("stop timed out in background")),
            };
            match &result {
                Ok(()) => {
                    let _ = store
                        .set_status(&container_id, LifecycleStatus::Stopped)
                        .await;
                },
                Err(e) => warn!(container_id, error = %e, "background stop failed"),
            }
            let _ = tx.send(result);
        });

        match tokio::time::timeout(VISIBLE_BUDGET, rx).await {
            Ok(Ok(Ok(()))) => Ok(StopOutcome::Completed),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(Error::runtime("stop worker dropped its result")),
            Err(_) => Ok(StopOutcome::Deferred),
        }
    }

    /// Delete the record and (best effort) the runtime object, with the
    /// same visible/background budget split as [`stop`](Self::stop).
    pub async fn delete(&self, id: &str) -> Result<StopOutcome> {
        let container = self.store.get(id).await?;
        self.close_sessions(&container.runtime_id).await;

        let runtime = self.runtime.clone();
        let store = self.store.clone();
        let ports = self.ports.clone();
        let container_id = container.id.clone();
        let runtime_id = container.runtime_id.clone();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let result = if runtime_id.is_empty() {
                Ok(())
            } else {
                match tokio::time::timeout(
                    BACKGROUND_BUDGET,
                    runtime.remove_container(&runtime_id, true),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(Error::runtime("delete timed out in background")),
                }
            };
            match &result {
                Ok(()) => {
                    let _ = ports.release_for_container(&container_id).await;
                    let _ = store.delete(&container_id).await;
                },
                Err(e) => warn!(container_id, error = %e, "background delete failed"),
            }
            let _ = tx.send(result);
        });

        match tokio::time::timeout(VISIBLE_BUDGET, rx).await {
            Ok(Ok(Ok(()))) => Ok(StopOutcome::Completed),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(Error::runtime("delete worker dropped its result")),
            Err(_) => Ok(StopOutcome::Deferred),
        }
    }

    pub async fn logs(&self, id: &str, tail: usize) -> Result<String> {
        let container = self.store.get(id).await?;
        if container.runtime_id.is_empty() {
            return Ok(String::new());
        }
        self.runtime.logs(&container.runtime_id, tail).await
    }

    /// Resolve the container's live address. Never cached; every call asks
    /// the runtime.
    pub async fn container_ip(&self, id: &str) -> Result<String> {
        let container = self.store.get(id).await?;
        if container.runtime_id.is_empty() {
            return Err(Error::precondition("container is not provisioned yet"));
        }
        self.runtime
            .container_ip(&container.runtime_id, &self.config.docker.network)
            .await
    }

    /// Containers present in the runtime but unknown to the database.
    pub async fn list_orphans(&self) -> Result<Vec<RuntimeContainer>> {
        let running = self
            .runtime
            .list_containers(&self.config.docker.label)
            .await?;
        let mut orphans = Vec::new();
        for candidate in running {
            if self
                .store
                .get_by_runtime_id(&candidate.runtime_id)
                .await?
                .is_none()
            {
                orphans.push(candidate);
            }
        }
        Ok(orphans)
    }

    pub async fn stop_orphan(&self, runtime_id: &str) -> Result<()> {
        self.runtime.stop_container(runtime_id, 10).await
    }

    pub async fn remove_orphan(&self, runtime_id: &str) -> Result<()> {
        self.runtime.remove_container(runtime_id, true).await
    }

    /// Orderly shutdown of terminal sessions, monitoring-protected or not.
    /// Distinct from idle reclamation.
    async fn close_sessions(&self, runtime_id: &str) {
        if runtime_id.is_empty() {
            return;
        }
        if let Some(closer) = self.session_closer.get() {
            let closed = closer(runtime_id.to_string()).await;
            if closed > 0 {
                info!(runtime_id, closed, "closed PTY sessions before shutdown");
            }
        }
    }

    async fn validate(&self, request: &CreateContainerRequest) -> Result<()> {
        let name_len = request.name.chars().count();
        if name_len == 0 || name_len > 63 {
            return Err(Error::validation("name must be 1-63 characters"));
        }
        if !request
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::validation(
                "name may only contain letters, digits, '-' and '_'",
            ));
        }

        if !request.skip_git_repo {
            if request.git_url.as_deref().unwrap_or("").is_empty()
                || request.repo_name.as_deref().unwrap_or("").is_empty()
            {
                return Err(Error::validation(
                    "git url and repository name are required unless skip_git_repo is set",
                ));
            }
            if request.credential_id.is_none() {
                return Err(Error::validation(
                    "a credential is required to clone the repository",
                ));
            }
        }

        if let Some(memory) = request.memory_bytes
            && !(1..=SandboxDefaults::MAX_MEMORY_BYTES).contains(&memory)
        {
            return Err(Error::validation("memory limit must be 1 byte to 128 GiB"));
        }
        if let Some(cpus) = request.cpu_cores
            && !(cpus > 0.0 && cpus <= SandboxDefaults::MAX_CPU_CORES)
        {
            return Err(Error::validation("cpu limit must be 0-64 cores"));
        }

        if request.proxy_enabled {
            if request.proxy_internal_port.is_none() {
                return Err(Error::validation(
                    "proxy requires an internal service port",
                ));
            }
            match (&request.proxy_domain, request.proxy_external_port) {
                (Some(_), Some(_)) | (None, None) => {
                    return Err(Error::validation(
                        "proxy requires exactly one of domain or external port",
                    ));
                },
                _ => {},
            }
        }
        Ok(())
    }

    async fn reserve_proxy(
        &self,
        request: &CreateContainerRequest,
        container_id: &str,
    ) -> Result<Option<ProxyDescriptor>> {
        if !request.proxy_enabled {
            return Ok(None);
        }
        let internal_port = request
            .proxy_internal_port
            .ok_or_else(|| Error::validation("proxy requires an internal service port"))?;

        let external_port = match request.proxy_external_port {
            Some(port) => {
                let range = &self.config.proxy;
                if !(range.port_range_start..=range.port_range_end).contains(&port) {
                    return Err(Error::validation(format!(
                        "external port {port} is outside the configured range {}-{}",
                        range.port_range_start, range.port_range_end
                    )));
                }
                self.ports.reserve(port, container_id).await?;
                Some(port)
            },
            None => None,
        };

        Ok(Some(ProxyDescriptor {
            domain: request.proxy_domain.clone(),
            external_port,
            internal_port,
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {
        super::*,
        crate::{testing::FakeRuntime, types::SelectedTemplates},
        burrow_templates::{NewTemplate, TemplateKind},
        sqlx::SqlitePool,
        std::sync::atomic::{AtomicUsize, Ordering},
    };

    struct Fixture {
        controller: ContainerController,
        templates: Arc<TemplateStore>,
        runtime: Arc<FakeRuntime>,
    }

    async fn fixture() -> Fixture {
        // One connection: the init worker and the test poll concurrently,
        // and every sqlite :memory: connection is its own database.
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        ContainerStore::init(&pool).await.unwrap();
        PortAllocator::init(&pool).await.unwrap();
        ProfileStore::init(&pool).await.unwrap();
        TemplateStore::init(&pool).await.unwrap();

        let runtime = Arc::new(FakeRuntime::new());
        let templates = Arc::new(TemplateStore::new(pool.clone()));
        let controller = ContainerController::new(
            runtime.clone(),
            Arc::new(ContainerStore::new(pool.clone())),
            Arc::new(PortAllocator::new(pool.clone())),
            Arc::new(ProfileStore::new(pool)),
            templates.clone(),
            BurrowConfig::default(),
        );
        Fixture {
            controller,
            templates,
            runtime,
        }
    }

    fn request(name: &str) -> CreateContainerRequest {
        CreateContainerRequest {
            name: name.into(),
            git_url: None,
            repo_name: None,
            memory_bytes: None,
            cpu_cores: None,
            ports: vec![],
            proxy_enabled: false,
            proxy_domain: None,
            proxy_external_port: None,
            proxy_internal_port: None,
            editor_enabled: false,
            credential_id: None,
            env_profile_id: None,
            command_profile_id: None,
            templates: SelectedTemplates::default(),
            skip_git_repo: true,
            permissive_mode: false,
            run_as_root: false,
        }
    }

    async fn wait_ready(controller: &ContainerController, id: &str) -> Container {
        for _ in 0..200 {
            let container = controller.get(id).await.unwrap();
            match container.init_status {
                InitStatus::Ready => return container,
                InitStatus::Failed => panic!("init failed: {:?}", container.init_message),
                _ => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
        panic!("container never became ready");
    }

    #[tokio::test]
    async fn create_validates_name() {
        let f = fixture().await;
        assert!(matches!(
            f.controller.create(request("")).await.unwrap_err(),
            Error::Validation(_)
        ));
        let long = "x".repeat(64);
        assert!(f.controller.create(request(&long)).await.is_err());
        assert!(f.controller.create(request("bad name")).await.is_err());
    }

    #[tokio::test]
    async fn create_requires_credential_for_repo() {
        let f = fixture().await;
        let mut req = request("withrepo");
        req.skip_git_repo = false;
        req.git_url = Some("https://github.com/a/b.git".into());
        req.repo_name = Some("b".into());
        let err = f.controller.create(req).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn create_rejects_proxy_domain_and_port() {
        let f = fixture().await;
        let mut req = request("proxyboth");
        req.proxy_enabled = true;
        req.proxy_internal_port = Some(3000);
        req.proxy_domain = Some("app".into());
        req.proxy_external_port = Some(20001);
        assert!(f.controller.create(req).await.is_err());
    }

    #[tokio::test]
    async fn create_then_ready_with_injection() {
        let f = fixture().await;
        let x = f
            .templates
            .create(NewTemplate {
                name: "x".into(),
                kind: TemplateKind::Instructions,
                description: None,
                content: "# hi".into(),
            })
            .await
            .unwrap();
        let y = f
            .templates
            .create(NewTemplate {
                name: "y".into(),
                kind: TemplateKind::Skill,
                description: None,
                content: "---\nallowed_tools:\n  - Read\n---\n# s".into(),
            })
            .await
            .unwrap();

        let mut req = request("sandbox1");
        req.templates = SelectedTemplates {
            instructions: Some(x.id),
            skills: vec![y.id],
            ..Default::default()
        };
        let created = f.controller.create(req).await.unwrap();
        assert_eq!(created.init_status, InitStatus::Pending);
        assert_eq!(created.work_dir, "/app");

        let ready = wait_ready(&f.controller, &created.id).await;
        assert_eq!(ready.status, LifecycleStatus::Running);
        assert_eq!(
            ready.injection.successful,
            vec!["x".to_string(), "y".to_string()]
        );
        assert!(ready.injection.failed.is_empty());
        assert!(ready.initialized_at_ms.is_some());
    }

    #[tokio::test]
    async fn injection_failure_is_tolerated() {
        let f = fixture().await;
        let good = f
            .templates
            .create(NewTemplate {
                name: "good".into(),
                kind: TemplateKind::Instructions,
                description: None,
                content: "# ok".into(),
            })
            .await
            .unwrap();
        let bad = f
            .templates
            .create(NewTemplate {
                name: "bad".into(),
                kind: TemplateKind::Command,
                description: None,
                content: "echo hi".into(),
            })
            .await
            .unwrap();
        f.runtime.fail_runs_matching(".claude/commands/bad.md");

        let mut req = request("sandbox2");
        req.templates = SelectedTemplates {
            instructions: Some(good.id),
            commands: vec![bad.id],
            ..Default::default()
        };
        let created = f.controller.create(req).await.unwrap();
        let ready = wait_ready(&f.controller, &created.id).await;
        assert_eq!(ready.injection.successful, vec!["good".to_string()]);
        assert_eq!(ready.injection.failed[0].template_name, "bad");
    }

    #[tokio::test]
    async fn start_requires_ready() {
        let f = fixture().await;
        let created = f.controller.create(request("pending1")).await.unwrap();
        // Pending or mid-init either way: force a failed state to be sure.
        f.controller
            .store
            .set_init_status(&created.id, InitStatus::Failed, Some("boom"))
            .await
            .unwrap();
        let err = f.controller.start(&created.id).await.unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[tokio::test]
    async fn stop_closes_sessions_and_completes() {
        let f = fixture().await;
        let created = f.controller.create(request("stopme")).await.unwrap();
        wait_ready(&f.controller, &created.id).await;

        static CLOSED: AtomicUsize = AtomicUsize::new(0);
        f.controller.set_session_closer(Arc::new(|_runtime_id| {
            Box::pin(async {
                CLOSED.fetch_add(1, Ordering::SeqCst);
                2
            })
        }));

        let outcome = f.controller.stop(&created.id).await.unwrap();
        assert_eq!(outcome, StopOutcome::Completed);
        assert_eq!(CLOSED.load(Ordering::SeqCst), 1);

        // Background task records the stopped status.
        for _ in 0..100 {
            if f.controller.get(&created.id).await.unwrap().status == LifecycleStatus::Stopped {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("status never became stopped");
    }

    #[tokio::test]
    async fn delete_releases_record() {
        let f = fixture().await;
        let created = f.controller.create(request("deleteme")).await.unwrap();
        wait_ready(&f.controller, &created.id).await;

        let outcome = f.controller.delete(&created.id).await.unwrap();
        assert_eq!(outcome, StopOutcome::Completed);

        for _ in 0..100 {
            if f.controller.get(&created.id).await.is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("record never deleted");
    }

    #[tokio::test]
    async fn orphans_are_runtime_only_containers() {
        let f = fixture().await;
        let created = f.controller.create(request("known")).await.unwrap();
        wait_ready(&f.controller, &created.id).await;
        f.runtime.add_running("rt-orphan", "stray");

        let orphans = f.controller.list_orphans().await.unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].runtime_id, "rt-orphan");

        f.controller.remove_orphan("rt-orphan").await.unwrap();
        assert!(f.controller.list_orphans().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn proxy_port_reserved_in_range() {
        let f = fixture().await;
        let mut req = request("proxied");
        req.proxy_enabled = true;
        req.proxy_internal_port = Some(3000);
        req.proxy_external_port = Some(20005);
        let created = f.controller.create(req).await.unwrap();
        let proxy = created.proxy.unwrap();
        assert_eq!(proxy.external_port, Some(20005));

        // Same port again conflicts.
        let mut req2 = request("proxied2");
        req2.proxy_enabled = true;
        req2.proxy_internal_port = Some(3000);
        req2.proxy_external_port = Some(20005);
        assert!(matches!(
            f.controller.create(req2).await.unwrap_err(),
            Error::Conflict(_)
        ));

        // Out of range is a validation error.
        let mut req3 = request("proxied3");
        req3.proxy_enabled = true;
        req3.proxy_internal_port = Some(3000);
        req3.proxy_external_port = Some(5);
        assert!(matches!(
            f.controller.create(req3).await.unwrap_err(),
            Error::Validation(_)
        ));
    }
}
