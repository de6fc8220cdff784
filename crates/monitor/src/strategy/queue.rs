use std::sync::Arc;

use {
    async_trait::async_trait,
    tracing::{debug, warn},
};

use {
    super::{Strategy, StrategyContext, expand_placeholders, inject_into_pty},
    crate::{
        tasks::{TaskState, TaskStore},
        types::{MonitorConfig, StrategyOutcome},
    },
};

/// Drains the container's task queue one item per silence window: the
/// lowest-order pending task is injected into the terminal.
pub struct QueueStrategy {
    tasks: Arc<TaskStore>,
    client: reqwest::Client,
}

impl QueueStrategy {
    pub fn new(tasks: Arc<TaskStore>) -> Self {
        Self {
            tasks,
            client: reqwest::Client::new(),
        }
    }

    async fn notify_queue_empty(&self, ctx: &StrategyContext) {
        if !ctx.config.queue.notify_queue_empty {
            return;
        }
        let Some(url) = ctx.config.webhook.url.as_deref().filter(|u| !u.is_empty()) else {
            return;
        };
        let payload = serde_json::json!({
            "container_id": ctx.container_id,
            "session_id": ctx.pty_session_id,
            "event": "queue_empty",
            "timestamp": burrow_common::time::now_secs(),
        });
        if let Err(e) = self.client.post(url).json(&payload).send().await {
            warn!(url, error = %e, "queue-empty notification failed");
        }
    }
}

#[async_trait]
impl Strategy for QueueStrategy {
    fn name(&self) -> &'static str {
        "queue"
    }

    fn validate(&self, _config: &MonitorConfig) -> burrow_common::Result<()> {
        // An empty queue or missing template is a runtime condition, not a
        // configuration error.
        Ok(())
    }

    async fn execute(&self, ctx: &StrategyContext) -> StrategyOutcome {
        // A fresh silence window means whatever the previous task kicked
        // off has gone quiet; close it out before popping the next one.
        if let Err(e) = self.tasks.complete_in_progress(&ctx.container_id).await {
            return StrategyOutcome::failed("queue", e.to_string());
        }

        let task = match self.tasks.dequeue(&ctx.container_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                debug!(container_id = %ctx.container_id, "task queue empty");
                self.notify_queue_empty(ctx).await;
                return StrategyOutcome::success("queue_empty", None);
            },
            Err(e) => return StrategyOutcome::failed("queue", e.to_string()),
        };

        let raw = match ctx.config.queue.command_template.as_deref() {
            Some(template) if !template.trim().is_empty() => {
                format!("{template}\n{}", task.text)
            },
            _ => task.text.clone(),
        };
        // Exactly one trailing newline before it enters the injection path.
        let command = format!("{}\n", expand_placeholders(&raw, ctx).trim_end_matches('\n'));

        match inject_into_pty(&ctx.writer, &ctx.pty_session_id, &command).await {
            Ok(()) => StrategyOutcome::success(
                "queue_inject",
                Some(command.trim_end_matches('\n').to_string()),
            ),
            Err(e) => {
                let _ = self.tasks.set_state(&task.id, TaskState::Failed).await;
                StrategyOutcome::failed("queue_inject", e.to_string())
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

    #[tokio::test]
    async fn drains_fifo_then_reports_empty() {
        let tasks = tasks().await;
        tasks.add("c1", "task one").await.unwrap();
        tasks.add("c1", "task two").await.unwrap();
        tasks.add("c1", "task three").await.unwrap();

        let strategy = QueueStrategy::new(tasks.clone());
        let (writer, segments) = recording_writer();
        let ctx = context(MonitorConfig::default(), writer);

        for expected in ["task one", "task two", "task three"] {
            let outcome = strategy.execute(&ctx).await;
            assert_eq!(outcome.action, "queue_inject");
            assert_eq!(outcome.command.as_deref(), Some(expected));
        }

        let outcome = strategy.execute(&ctx).await;
        assert_eq!(outcome.action, "queue_empty");

        // Each injection produced a body write and a \r write.
        assert_eq!(segments.lock().unwrap().len(), 6);

        // Everything injected ended up completed.
        let all = tasks.list("c1").await.unwrap();
        assert!(all.iter().all(|t| t.state == TaskState::Completed));
    }

    #[tokio::test]
    async fn template_prefixes_task_text() {
        let tasks = tasks().await;
        tasks.add("c1", "fix the tests").await.unwrap();

        let strategy = QueueStrategy::new(tasks);
        let (writer, segments) = recording_writer();
        let mut config = MonitorConfig::default();
        config.queue.command_template = Some("Please do the following:".into());
        let ctx = context(config, writer);

        let outcome = strategy.execute(&ctx).await;
        assert!(outcome.success);
        let segments = segments.lock().unwrap();
        assert_eq!(segments[0], b"Please do the following:\nfix the tests");
        assert_eq!(segments[1], b"\r");
    }

    #[tokio::test]
    async fn injection_failure_fails_the_task() {
        let tasks = tasks().await;
        let task = tasks.add("c1", "doomed").await.unwrap();

        let strategy = QueueStrategy::new(tasks.clone());
        let writer: crate::strategy::PtyWriter = Arc::new(|_, _| {
            Box::pin(async { Err(burrow_common::Error::message("pty closed")) })
        });
        let ctx = context(MonitorConfig::default(), writer);

        let outcome = strategy.execute(&ctx).await;
        assert!(!outcome.success);
        assert_eq!(
            tasks.get(&task.id).await.unwrap().state,
            TaskState::Failed
        );
    }

    #[tokio::test]
    async fn queue_empty_notification_fires() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "event": "queue_empty",
            })))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let strategy = QueueStrategy::new(tasks().await);
        let (writer, _) = recording_writer();
        let mut config = MonitorConfig::default();
        config.queue.notify_queue_empty = true;
        config.webhook.url = Some(format!("{}/hook", server.url()));
        let ctx = context(config, writer);

        let outcome = strategy.execute(&ctx).await;
        assert_eq!(outcome.action, "queue_empty");
        mock.assert_async().await;
    }
}
