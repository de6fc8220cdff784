use std::{collections::HashMap, sync::Arc, time::Duration};

use {
    burrow_common::{Error, Result},
    burrow_config::BurrowConfig,
    tracing::{error, info, warn},
};

use crate::{
    docker::{ContainerRuntime, ContainerSpec, ExecSpec},
    inject::Injector,
    profiles::{ProfileKind, ProfileStore},
    store::ContainerStore,
    types::{Container, InitStatus, LifecycleStatus},
};

/// Hard deadline for the whole provisioning pipeline.
const INIT_DEADLINE: Duration = Duration::from_secs(30 * 60);

/// Drives one container through `Pending → Cloning → Initializing → Ready`.
///
/// Runs on a background task after the create call has already returned the
/// reserved record. Any error, or exceeding the deadline, parks the record
/// in `Failed` with a message; the record itself is retained.
pub(crate) struct InitWorker {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub store: Arc<ContainerStore>,
    pub profiles: Arc<ProfileStore>,
    pub injector: Arc<Injector>,
    pub config: BurrowConfig,
}

impl InitWorker {
    pub async fn run(&self, container_id: String) {
        let outcome = tokio::time::timeout(INIT_DEADLINE, self.provision(&container_id)).await;
        match outcome {
            Ok(Ok(())) => {
                info!(container_id, "container initialized");
            },
            Ok(Err(e)) => {
                error!(container_id, error = %e, "container initialization failed");
                let _ = self
                    .store
                    .set_init_status(&container_id, InitStatus::Failed, Some(&e.to_string()))
                    .await;
            },
            Err(_) => {
                error!(container_id, "container initialization timed out");
                let _ = self
                    .store
                    .set_init_status(
                        &container_id,
                        InitStatus::Failed,
                        Some("initialization timed out after 30 minutes"),
                    )
                    .await;
            },
        }
    }

    async fn provision(&self, container_id: &str) -> Result<()> {
        let container = self.store.get(container_id).await?;

        // Provision and boot the runtime object first; cloning and injection
        // both exec into the live container.
        let spec = self.build_spec(&container).await?;
        let runtime_id = self.runtime.create_container(&spec).await?;
        self.store.set_runtime_id(container_id, &runtime_id).await?;
        self.runtime.start_container(&runtime_id).await?;

        let container = self.store.get(container_id).await?;

        if !container.skip_git_repo {
            self.store
                .set_init_status(container_id, InitStatus::Cloning, None)
                .await?;
            self.clone_repository(&container).await?;
        }

        self.store
            .set_init_status(container_id, InitStatus::Initializing, None)
            .await?;

        if let Err(e) = self
            .runtime
            .connect_network(&container.runtime_id, &self.config.docker.network)
            .await
        {
            // The bridge address still works; record and continue.
            warn!(container_id, error = %e, "overlay network attach failed");
        }

        let mut injection = self.injector.inject_all(&container).await;

        if container.editor_enabled
            && let Err(e) = self.start_editor(&container).await
        {
            injection.warnings.push(format!("editor start failed: {e}"));
        }

        if let Some(profile_id) = &container.command_profile_id
            && let Err(e) = self.run_startup_commands(&container, profile_id).await
        {
            injection
                .warnings
                .push(format!("startup commands failed: {e}"));
        }

        self.store.set_ready(container_id, &injection).await?;
        self.store
            .set_status(container_id, LifecycleStatus::Running)
            .await?;
        Ok(())
    }

    async fn build_spec(&self, container: &Container) -> Result<ContainerSpec> {
        let mut env = vec![];
        if let Some(profile_id) = &container.env_profile_id {
            let profile = self.profiles.get(profile_id).await?;
            if profile.kind != ProfileKind::Env {
                return Err(Error::validation(format!(
                    "profile {profile_id} is not an env profile"
                )));
            }
            env.extend(
                profile
                    .payload
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty() && line.contains('='))
                    .map(String::from),
            );
        }
        if container.permissive_mode {
            env.push("BURROW_PERMISSIVE=1".into());
        }

        let mut labels = HashMap::new();
        labels.insert(self.config.docker.label.clone(), "true".into());
        labels.insert("dev.burrow.container-id".into(), container.id.clone());

        Ok(ContainerSpec {
            name: format!("burrow-{}", container.name),
            image: self.config.docker.image.clone(),
            env,
            labels,
            memory_bytes: container.memory_bytes,
            cpu_cores: container.cpu_cores,
            ports: container.ports.clone(),
            work_dir: container.work_dir.clone(),
            run_as_root: container.run_as_root,
        })
    }

    async fn clone_repository(&self, container: &Container) -> Result<()> {
        let url = container
            .git_url
            .as_deref()
            .ok_or_else(|| Error::validation("git url missing for clone"))?;
        let repo = container
            .repo_name
            .as_deref()
            .ok_or_else(|| Error::validation("repository name missing for clone"))?;

        let clone_url = match &container.credential_id {
            Some(credential_id) => {
                let credential = self.profiles.get(credential_id).await?;
                with_token(url, credential.payload.trim())
            },
            None => url.to_string(),
        };
        let target = format!("/workspace/{repo}");

        let result = self
            .runtime
            .exec_run(
                &container.runtime_id,
                ExecSpec::command([
                    "git",
                    "clone",
                    clone_url.as_str(),
                    target.as_str(),
                ]),
            )
            .await?;
        if !result.success() {
            return Err(Error::runtime(format!(
                "git clone exited with {}: {}",
                result.exit_code,
                scrub(&result.output, &clone_url, url).trim()
            )));
        }
        Ok(())
    }

    async fn start_editor(&self, container: &Container) -> Result<()> {
        let result = self
            .runtime
            .exec_run(
                &container.runtime_id,
                ExecSpec::command([
                    "/bin/sh",
                    "-c",
                    "nohup code-server --bind-addr 0.0.0.0:8443 --auth none \
                     >/tmp/code-server.log 2>&1 &",
                ])
                .in_dir(container.work_dir.clone()),
            )
            .await?;
        if !result.success() {
            return Err(Error::runtime(format!(
                "code-server launch exited with {}",
                result.exit_code
            )));
        }
        Ok(())
    }

    async fn run_startup_commands(&self, container: &Container, profile_id: &str) -> Result<()> {
        let profile = self.profiles.get(profile_id).await?;
        if profile.kind != ProfileKind::StartupCommand {
            return Err(Error::validation(format!(
                "profile {profile_id} is not a startup-command profile"
            )));
        }
        for line in profile.payload.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let result = self
                .runtime
                .exec_run(
                    &container.runtime_id,
                    ExecSpec::command(["/bin/sh", "-c", line])
                        .in_dir(container.work_dir.clone()),
                )
                .await?;
            if !result.success() {
                return Err(Error::runtime(format!(
                    "startup command '{line}' exited with {}",
                    result.exit_code
                )));
            }
        }
        Ok(())
    }
}

/// Embed a token into an https clone URL.
fn with_token(url: &str, token: &str) -> String {
    match url.strip_prefix("https://") {
        Some(rest) if !token.is_empty() => format!("https://{token}@{rest}"),
        _ => url.to_string(),
    }
}

/// Keep credentials out of error messages.
fn scrub(output: &str, secret_url: &str, plain_url: &str) -> String {
    output.replace(secret_url, plain_url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_embedding() {
        assert_eq!(
            with_token("https://github.com/a/b.git", "tok"),
            "https://tok@github.com/a/b.git"
        );
        assert_eq!(with_token("git@github.com:a/b.git", "tok"), "git@github.com:a/b.git");
        assert_eq!(with_token("https://x/y.git", ""), "https://x/y.git");
    }
}
