use async_trait::async_trait;

use {
    super::{Strategy, StrategyContext, expand_placeholders, inject_into_pty},
    crate::types::{MonitorConfig, StrategyOutcome},
};

/// Types a configured command into the silent terminal and submits it.
pub struct InjectionStrategy;

#[async_trait]
impl Strategy for InjectionStrategy {
    fn name(&self) -> &'static str {
        "injection"
    }

    fn validate(&self, _config: &MonitorConfig) -> burrow_common::Result<()> {
        // A missing template is tolerated until execute time.
        Ok(())
    }

    async fn execute(&self, ctx: &StrategyContext) -> StrategyOutcome {
        let Some(template) = ctx
            .config
            .injection
            .command_template
            .as_deref()
            .filter(|t| !t.trim().is_empty())
        else {
            return StrategyOutcome::skipped("no command template configured");
        };

        let command = expand_placeholders(template, ctx);
        match inject_into_pty(&ctx.writer, &ctx.pty_session_id, &command).await {
            Ok(()) => StrategyOutcome::success(
                "inject",
                Some(command.trim_end_matches(['\n', '\r']).to_string()),
            ),
            Err(e) => StrategyOutcome::failed("inject", e.to_string()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {
        super::*,
        crate::strategy::test_support::{context, recording_writer},
        std::time::Instant,
    };

    #[tokio::test]
    async fn skips_without_template() {
        let (writer, segments) = recording_writer();
        let ctx = context(MonitorConfig::default(), writer);
        let outcome = InjectionStrategy.execute(&ctx).await;
        assert_eq!(outcome.action, "skipped");
        assert!(segments.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn writes_body_pause_then_carriage_return() {
        let (writer, segments) = recording_writer();
        let mut config = MonitorConfig::default();
        config.injection.command_template = Some("continue with {container_id}\n\n".into());
        let ctx = context(config, writer);

        let started = Instant::now();
        let outcome = InjectionStrategy.execute(&ctx).await;
        let elapsed = started.elapsed();

        assert!(outcome.success);
        assert_eq!(outcome.command.as_deref(), Some("continue with c1"));

        // Exactly two writes: the stripped body, then a single \r.
        let segments = segments.lock().unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0], b"continue with c1");
        assert_eq!(segments[1], b"\r");
        assert!(elapsed >= super::super::SUBMIT_PAUSE);
    }

    #[tokio::test]
    async fn expands_all_placeholders() {
        let (writer, segments) = recording_writer();
        let mut config = MonitorConfig::default();
        config.injection.command_template =
            Some("{container_id}|{session_id}|{silence_duration}|{docker_id}".into());
        let ctx = context(config, writer);

        InjectionStrategy.execute(&ctx).await;
        let segments = segments.lock().unwrap();
        assert_eq!(segments[0], b"c1|s1|7|rt-1");
    }

    #[tokio::test]
    async fn write_failure_fails_the_strategy() {
        let writer: crate::strategy::PtyWriter = std::sync::Arc::new(|_, _| {
            Box::pin(async { Err(burrow_common::Error::message("pty gone")) })
        });
        let mut config = MonitorConfig::default();
        config.injection.command_template = Some("ls".into());
        let ctx = context(config, writer);

        let outcome = InjectionStrategy.execute(&ctx).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("pty gone"));
    }
}
