use std::{collections::HashMap, path::Path, sync::Arc};

use {
    base64::Engine as _,
    burrow_common::{Result, time::now_ms},
    burrow_templates::{ConfigTemplate, TemplateKind, TemplateStore, validate_content},
    tracing::{debug, warn},
};

use crate::{
    docker::{ContainerRuntime, ExecSpec},
    paths,
    types::{Container, InjectionFailure, InjectionOutcome},
};

/// Writes selected config templates into a running sandbox.
///
/// Injection is an audit-tracked best effort: each template lands or is
/// recorded as failed with a reason, and container creation never fails
/// because of it.
pub struct Injector {
    runtime: Arc<dyn ContainerRuntime>,
    templates: Arc<TemplateStore>,
}

impl Injector {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, templates: Arc<TemplateStore>) -> Self {
        Self { runtime, templates }
    }

    /// Inject every selected template, returning the audit outcome.
    pub async fn inject_all(&self, container: &Container) -> InjectionOutcome {
        let mut outcome = InjectionOutcome::default();
        let selected = &container.templates;

        if let Some(id) = &selected.instructions {
            self.inject_one(container, id, &mut outcome).await;
        }
        for id in &selected.skills {
            self.inject_one(container, id, &mut outcome).await;
        }
        for id in &selected.commands {
            self.inject_one(container, id, &mut outcome).await;
        }
        self.inject_mcp_config(container, &mut outcome).await;

        outcome.injected_at_ms = Some(now_ms());
        outcome
    }

    async fn inject_one(&self, container: &Container, id: &str, outcome: &mut InjectionOutcome) {
        let template = match self.templates.get(id).await {
            Ok(t) => t,
            Err(e) => {
                outcome.failed.push(InjectionFailure {
                    template_name: id.to_string(),
                    kind: "unknown".into(),
                    reason: e.to_string(),
                });
                return;
            },
        };

        match self.write_template(container, &template).await {
            Ok(()) => {
                debug!(
                    container = %container.name,
                    template = %template.name,
                    kind = template.kind.as_str(),
                    "template injected"
                );
                outcome.successful.push(template.name.clone());
            },
            Err(e) => {
                warn!(
                    container = %container.name,
                    template = %template.name,
                    error = %e,
                    "template injection failed"
                );
                outcome.failed.push(InjectionFailure {
                    template_name: template.name.clone(),
                    kind: template.kind.as_str().into(),
                    reason: e.to_string(),
                });
            },
        }
    }

    async fn write_template(&self, container: &Container, template: &ConfigTemplate) -> Result<()> {
        // Content may have changed since catalog time; re-validate at the
        // point of reference.
        validate_content(template.kind, &template.content)?;

        let base = Path::new(&container.work_dir);
        let target = match template.kind {
            TemplateKind::Instructions => base.join("CLAUDE.md"),
            TemplateKind::Skill => {
                paths::validate_file_stem(&template.name)?;
                paths::resolve_under(base, &format!(".claude/skills/{}/SKILL.md", template.name))?
            },
            TemplateKind::Command => {
                paths::validate_file_stem(&template.name)?;
                paths::resolve_under(base, &format!(".claude/commands/{}.md", template.name))?
            },
            // Handled wholesale by inject_mcp_config.
            TemplateKind::McpServer => return Ok(()),
        };

        self.write_file(container, &target, template.content.as_bytes())
            .await
    }

    /// Collect all selected MCP server specs into a single `.mcp.json`.
    async fn inject_mcp_config(&self, container: &Container, outcome: &mut InjectionOutcome) {
        if container.templates.mcp_servers.is_empty() {
            return;
        }

        let mut servers: HashMap<String, serde_json::Value> = HashMap::new();
        for id in &container.templates.mcp_servers {
            let template = match self.templates.get(id).await {
                Ok(t) => t,
                Err(e) => {
                    outcome.failed.push(InjectionFailure {
                        template_name: id.to_string(),
                        kind: TemplateKind::McpServer.as_str().into(),
                        reason: e.to_string(),
                    });
                    continue;
                },
            };
            match validate_content(TemplateKind::McpServer, &template.content).and_then(|()| {
                serde_json::from_str::<serde_json::Value>(&template.content).map_err(|e| {
                    burrow_common::Error::validation(format!("invalid MCP JSON: {e}"))
                })
            }) {
                Ok(spec) => {
                    servers.insert(template.name.clone(), spec);
                    outcome.successful.push(template.name.clone());
                },
                Err(e) => {
                    outcome.failed.push(InjectionFailure {
                        template_name: template.name.clone(),
                        kind: TemplateKind::McpServer.as_str().into(),
                        reason: e.to_string(),
                    });
                },
            }
        }

        if servers.is_empty() {
            return;
        }

        let document = serde_json::json!({ "mcpServers": servers });
        let target = Path::new(&container.work_dir).join(".mcp.json");
        let payload = match serde_json::to_vec_pretty(&document) {
            Ok(p) => p,
            Err(e) => {
                outcome
                    .warnings
                    .push(format!("failed to serialize .mcp.json: {e}"));
                return;
            },
        };
        if let Err(e) = self.write_file(container, &target, &payload).await {
            // The per-server successes above still stand in the audit; note
            // that the merged file did not land.
            outcome
                .warnings
                .push(format!("failed to write .mcp.json: {e}"));
        }
    }

    /// Write bytes to an in-container path, creating parent directories.
    /// Content travels base64-encoded so no shell quoting applies to it.
    async fn write_file(&self, container: &Container, target: &Path, content: &[u8]) -> Result<()> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(content);
        let dir = target
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "/".into());
        let script = format!(
            "mkdir -p '{dir}' && printf '%s' '{encoded}' | base64 -d > '{}'",
            target.display()
        );
        let result = self
            .runtime
            .exec_run(
                &container.runtime_id,
                ExecSpec::command(["/bin/sh", "-c", script.as_str()]),
            )
            .await?;
        if !result.success() {
            return Err(burrow_common::Error::runtime(format!(
                "write {} exited with {}: {}",
                target.display(),
                result.exit_code,
                result.output.trim()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {
        super::*,
        crate::{testing::FakeRuntime, types::SelectedTemplates},
        burrow_templates::NewTemplate,
        sqlx::SqlitePool,
    };

    async fn template_store() -> Arc<TemplateStore> {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        TemplateStore::init(&pool).await.unwrap();
        Arc::new(TemplateStore::new(pool))
    }

    fn container_with(templates: SelectedTemplates) -> Container {
        let mut c = crate::testing::container_fixture("c1");
        c.templates = templates;
        c
    }

    #[tokio::test]
    async fn injects_instructions_and_skills() {
        let store = template_store().await;
        let x = store
            .create(NewTemplate {
                name: "x".into(),
                kind: TemplateKind::Instructions,
                description: None,
                content: "# hi".into(),
            })
            .await
            .unwrap();
        let y = store
            .create(NewTemplate {
                name: "y".into(),
                kind: TemplateKind::Skill,
                description: None,
                content: "---\nallowed_tools:\n  - Read\n---\n# s".into(),
            })
            .await
            .unwrap();

        let runtime = Arc::new(FakeRuntime::new());
        let injector = Injector::new(runtime.clone(), store);
        let container = container_with(SelectedTemplates {
            instructions: Some(x.id),
            skills: vec![y.id],
            ..Default::default()
        });

        let outcome = injector.inject_all(&container).await;
        assert_eq!(outcome.successful, vec!["x".to_string(), "y".to_string()]);
        assert!(outcome.failed.is_empty());

        let runs = runtime.recorded_runs();
        assert!(runs.iter().any(|cmd| cmd.contains("CLAUDE.md")));
        assert!(runs.iter().any(|cmd| cmd.contains(".claude/skills/y/SKILL.md")));
    }

    #[tokio::test]
    async fn failure_is_tolerated_and_recorded() {
        let store = template_store().await;
        let good = store
            .create(NewTemplate {
                name: "good".into(),
                kind: TemplateKind::Instructions,
                description: None,
                content: "# ok".into(),
            })
            .await
            .unwrap();
        let bad = store
            .create(NewTemplate {
                name: "bad".into(),
                kind: TemplateKind::Command,
                description: None,
                content: "echo".into(),
            })
            .await
            .unwrap();

        let runtime = Arc::new(FakeRuntime::new());
        // Writes touching the bad command's path fail inside the container.
        runtime.fail_runs_matching(".claude/commands/bad.md");

        let injector = Injector::new(runtime, store);
        let container = container_with(SelectedTemplates {
            instructions: Some(good.id),
            commands: vec![bad.id],
            ..Default::default()
        });

        let outcome = injector.inject_all(&container).await;
        assert_eq!(outcome.successful, vec!["good".to_string()]);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].template_name, "bad");
    }

    #[tokio::test]
    async fn missing_template_id_is_a_failure_entry() {
        let store = template_store().await;
        let runtime = Arc::new(FakeRuntime::new());
        let injector = Injector::new(runtime, store);
        let container = container_with(SelectedTemplates {
            skills: vec!["nope".into()],
            ..Default::default()
        });

        let outcome = injector.inject_all(&container).await;
        assert!(outcome.successful.is_empty());
        assert_eq!(outcome.failed[0].template_name, "nope");
    }

    #[tokio::test]
    async fn mcp_specs_merge_into_one_file() {
        let store = template_store().await;
        let a = store
            .create(NewTemplate {
                name: "files".into(),
                kind: TemplateKind::McpServer,
                description: None,
                content: r#"{"command": "npx", "args": ["files"]}"#.into(),
            })
            .await
            .unwrap();

        let runtime = Arc::new(FakeRuntime::new());
        let injector = Injector::new(runtime.clone(), store);
        let container = container_with(SelectedTemplates {
            mcp_servers: vec![a.id],
            ..Default::default()
        });

        let outcome = injector.inject_all(&container).await;
        assert_eq!(outcome.successful, vec!["files".to_string()]);
        assert!(runtime.recorded_runs().iter().any(|cmd| cmd.contains(".mcp.json")));
    }
}
