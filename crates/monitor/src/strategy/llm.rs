use std::{sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    serde::Deserialize,
    tracing::{debug, warn},
};

use {
    super::{Strategy, StrategyContext, inject_into_pty},
    crate::{
        tasks::TaskStore,
        types::{LlmAction, MonitorConfig, StrategyOutcome},
    },
};

const DEFAULT_SYSTEM_PROMPT: &str = "You monitor a developer terminal that has gone silent. \
Reply with a JSON object: {\"action\": \"inject\"|\"skip\"|\"notify\"|\"complete\", \
\"command\": \"...\", \"reasoning\": \"...\"}. Choose inject only when a concrete next \
command is obvious from the terminal output.";

/// What the model is asked to return.
#[derive(Debug, Deserialize)]
struct LlmDecision {
    action: LlmAction,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    reasoning: Option<String>,
}

/// Asks an external model what to do about the silence, then applies its
/// decision. Any failure falls back to the configured default action.
pub struct LlmStrategy {
    client: reqwest::Client,
    tasks: Arc<TaskStore>,
}

impl LlmStrategy {
    pub fn new(tasks: Arc<TaskStore>) -> Self {
        Self {
            client: reqwest::Client::new(),
            tasks,
        }
    }

    async fn consult(
        &self,
        ctx: &StrategyContext,
        endpoint: &str,
        model: &str,
    ) -> Result<(LlmDecision, serde_json::Value), String> {
        let llm = &ctx.config.llm;
        let deadline = Duration::from_secs(llm.timeout_secs.min(ctx.threshold_secs).max(1));
        let system_prompt = llm
            .system_prompt
            .as_deref()
            .unwrap_or(DEFAULT_SYSTEM_PROMPT);
        let terminal_window = String::from_utf8_lossy(&ctx.snapshot);

        let body = serde_json::json!({
            "model": model,
            "temperature": llm.temperature,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": format!(
                    "The terminal has been silent for {} seconds. Recent output:\n{}",
                    ctx.silence_secs, terminal_window
                )},
            ],
        });

        let mut request = self.client.post(endpoint).timeout(deadline).json(&body);
        if let Some(key) = llm.api_key.as_deref().filter(|k| !k.is_empty()) {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("llm endpoint returned {}", response.status()));
        }
        let reply: serde_json::Value = response.json().await.map_err(|e| e.to_string())?;

        // Chat-completions shape first; a bare decision object as fallback.
        let decision = reply
            .pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .and_then(|content| serde_json::from_str::<LlmDecision>(content.trim()).ok())
            .or_else(|| serde_json::from_value::<LlmDecision>(reply.clone()).ok())
            .ok_or_else(|| "llm reply did not contain a parsable decision".to_string())?;

        Ok((decision, reply))
    }

    async fn apply(
        &self,
        ctx: &StrategyContext,
        action: LlmAction,
        command: Option<String>,
    ) -> StrategyOutcome {
        match action {
            LlmAction::Skip => StrategyOutcome::success("llm_skip", None),
            LlmAction::Inject => {
                let Some(command) = command.filter(|c| !c.trim().is_empty()) else {
                    return StrategyOutcome::skipped("llm chose inject without a command");
                };
                match inject_into_pty(&ctx.writer, &ctx.pty_session_id, &command).await {
                    Ok(()) => StrategyOutcome::success("llm_inject", Some(command)),
                    Err(e) => StrategyOutcome::failed("llm_inject", e.to_string()),
                }
            },
            LlmAction::Notify => {
                let Some(url) = ctx
                    .config
                    .webhook
                    .url
                    .as_deref()
                    .filter(|u| !u.is_empty())
                else {
                    return StrategyOutcome::skipped("llm chose notify without a webhook url");
                };
                let payload = serde_json::json!({
                    "container_id": ctx.container_id,
                    "session_id": ctx.pty_session_id,
                    "event": "llm_notify",
                    "timestamp": burrow_common::time::now_secs(),
                });
                match self.client.post(url).json(&payload).send().await {
                    Ok(_) => StrategyOutcome::success("llm_notify", None),
                    Err(e) => StrategyOutcome::failed("llm_notify", e.to_string()),
                }
            },
            LlmAction::Complete => {
                match self.tasks.complete_in_progress(&ctx.container_id).await {
                    Ok(()) => StrategyOutcome::success("llm_complete", None),
                    Err(e) => StrategyOutcome::failed("llm_complete", e.to_string()),
                }
            },
        }
    }
}

#[async_trait]
impl Strategy for LlmStrategy {
    fn name(&self) -> &'static str {
        "llm"
    }

    fn validate(&self, config: &MonitorConfig) -> burrow_common::Result<()> {
        if let Some(endpoint) = config.llm.endpoint.as_deref()
            && !endpoint.is_empty()
            && !endpoint.starts_with("http://")
            && !endpoint.starts_with("https://")
        {
            return Err(burrow_common::Error::validation(
                "llm endpoint must be http(s)",
            ));
        }
        Ok(())
    }

    async fn execute(&self, ctx: &StrategyContext) -> StrategyOutcome {
        let llm = &ctx.config.llm;
        let (Some(endpoint), Some(model)) = (
            llm.endpoint.as_deref().filter(|e| !e.is_empty()),
            llm.model.as_deref().filter(|m| !m.is_empty()),
        ) else {
            return StrategyOutcome::skipped("llm endpoint or model not configured");
        };

        match self.consult(ctx, endpoint, model).await {
            Ok((decision, reply)) => {
                debug!(action = ?decision.action, "llm decision");
                self.apply(ctx, decision.action, decision.command)
                    .await
                    .with_llm_response(reply)
            },
            Err(e) => {
                warn!(error = %e, "llm consult failed, applying default action");
                let fallback_command = ctx.config.injection.command_template.clone();
                self.apply(ctx, llm.default_action, fallback_command).await
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {
        super::*,
        crate::strategy::test_support::{context, recording_writer},
        sqlx::SqlitePool,
    };

    async fn tasks() -> Arc<TaskStore> {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        TaskStore::init(&pool).await.unwrap();
        Arc::new(TaskStore::new(pool))
    }

    fn chat_reply(decision: &str) -> String {
        serde_json::json!({
            "choices": [{"message": {"content": decision}}]
        })
        .to_string()
    }

    #[tokio::test]
    async fn skips_without_endpoint() {
        let strategy = LlmStrategy::new(tasks().await);
        let (writer, _) = recording_writer();
        let ctx = context(MonitorConfig::default(), writer);
        let outcome = strategy.execute(&ctx).await;
        assert_eq!(outcome.action, "skipped");
    }

    #[tokio::test]
    async fn inject_decision_drives_the_pty() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat")
            .with_status(200)
            .with_body(chat_reply(
                r#"{"action": "inject", "command": "cargo test", "reasoning": "tests pending"}"#,
            ))
            .expect(1)
            .create_async()
            .await;

        let strategy = LlmStrategy::new(tasks().await);
        let (writer, segments) = recording_writer();
        let mut config = MonitorConfig::default();
        config.llm.endpoint = Some(format!("{}/v1/chat", server.url()));
        config.llm.model = Some("arbiter-1".into());
        let ctx = context(config, writer);

        let outcome = strategy.execute(&ctx).await;
        assert!(outcome.success);
        assert_eq!(outcome.action, "llm_inject");
        assert!(outcome.llm_response.is_some());

        let segments = segments.lock().unwrap();
        assert_eq!(segments[0], b"cargo test");
        assert_eq!(segments[1], b"\r");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn skip_decision_touches_nothing() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/chat")
            .with_status(200)
            .with_body(chat_reply(r#"{"action": "skip"}"#))
            .create_async()
            .await;

        let strategy = LlmStrategy::new(tasks().await);
        let (writer, segments) = recording_writer();
        let mut config = MonitorConfig::default();
        config.llm.endpoint = Some(format!("{}/v1/chat", server.url()));
        config.llm.model = Some("arbiter-1".into());
        let ctx = context(config, writer);

        let outcome = strategy.execute(&ctx).await;
        assert_eq!(outcome.action, "llm_skip");
        assert!(segments.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn complete_decision_closes_running_task() {
        let tasks = tasks().await;
        tasks.add("c1", "long job").await.unwrap();
        tasks.dequeue("c1").await.unwrap();

        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/chat")
            .with_status(200)
            .with_body(chat_reply(r#"{"action": "complete"}"#))
            .create_async()
            .await;

        let strategy = LlmStrategy::new(tasks.clone());
        let (writer, _) = recording_writer();
        let mut config = MonitorConfig::default();
        config.llm.endpoint = Some(format!("{}/v1/chat", server.url()));
        config.llm.model = Some("arbiter-1".into());
        let ctx = context(config, writer);

        let outcome = strategy.execute(&ctx).await;
        assert_eq!(outcome.action, "llm_complete");
        let all = tasks.list("c1").await.unwrap();
        assert_eq!(all[0].state, crate::tasks::TaskState::Completed);
    }

    #[tokio::test]
    async fn error_falls_back_to_default_action() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/chat")
            .with_status(500)
            .create_async()
            .await;

        let strategy = LlmStrategy::new(tasks().await);
        let (writer, segments) = recording_writer();
        let mut config = MonitorConfig::default();
        config.llm.endpoint = Some(format!("{}/v1/chat", server.url()));
        config.llm.model = Some("arbiter-1".into());
        config.llm.default_action = LlmAction::Skip;
        let ctx = context(config, writer);

        let outcome = strategy.execute(&ctx).await;
        assert_eq!(outcome.action, "llm_skip");
        assert!(segments.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unparsable_reply_falls_back() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/chat")
            .with_status(200)
            .with_body(chat_reply("sorry, plain prose"))
            .create_async()
            .await;

        let strategy = LlmStrategy::new(tasks().await);
        let (writer, _) = recording_writer();
        let mut config = MonitorConfig::default();
        config.llm.endpoint = Some(format!("{}/v1/chat", server.url()));
        config.llm.model = Some("arbiter-1".into());
        let ctx = context(config, writer);

        let outcome = strategy.execute(&ctx).await;
        assert_eq!(outcome.action, "llm_skip");
    }
}
