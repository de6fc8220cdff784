//! Pluggable silence reactions. A strategy gets the monitoring session's
//! identity, the ring-buffer snapshot, its config, and the write-to-PTY
//! hook; it reports what it did as a [`StrategyOutcome`].

pub mod inject;
pub mod llm;
pub mod queue;
pub mod webhook;

use std::{sync::Arc, time::Duration};

use {async_trait::async_trait, futures::future::BoxFuture};

use crate::types::{MonitorConfig, StrategyOutcome};

pub use {
    inject::InjectionStrategy, llm::LlmStrategy, queue::QueueStrategy, webhook::WebhookStrategy,
};

/// Writes raw bytes into a PTY session, as if typed. Installed by the
/// composition root; keeps this crate from importing the multiplexer.
pub type PtyWriter =
    Arc<dyn Fn(String, Vec<u8>) -> BoxFuture<'static, burrow_common::Result<()>> + Send + Sync>;

/// Everything a strategy may act on.
pub struct StrategyContext {
    pub container_id: String,
    pub pty_session_id: String,
    pub runtime_id: String,
    /// Seconds since the last PTY output byte.
    pub silence_secs: u64,
    pub threshold_secs: u64,
    /// Ring-buffer copy of the most recent output window.
    pub snapshot: Vec<u8>,
    pub config: MonitorConfig,
    pub writer: PtyWriter,
}

#[async_trait]
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Lenient: missing optional config passes; the gap surfaces as a
    /// `skipped` outcome at execute time instead.
    fn validate(&self, config: &MonitorConfig) -> burrow_common::Result<()>;

    async fn execute(&self, ctx: &StrategyContext) -> StrategyOutcome;
}

/// Pause between the command body and the submitting carriage return, so
/// the terminal line editor accepts the input before it is submitted.
pub const SUBMIT_PAUSE: Duration = Duration::from_millis(150);

/// Expand the supported placeholders in a command template.
pub fn expand_placeholders(template: &str, ctx: &StrategyContext) -> String {
    template
        .replace("{container_id}", &ctx.container_id)
        .replace("{session_id}", &ctx.pty_session_id)
        .replace("{timestamp}", &burrow_common::time::now_secs().to_string())
        .replace("{silence_duration}", &ctx.silence_secs.to_string())
        .replace("{docker_id}", &ctx.runtime_id)
}

/// The injection contract: body bytes (trailing newlines stripped), then
/// the submit pause, then exactly one carriage return.
pub async fn inject_into_pty(
    writer: &PtyWriter,
    session_id: &str,
    command: &str,
) -> burrow_common::Result<()> {
    let body = command.trim_end_matches(['\n', '\r']);
    writer(session_id.to_string(), body.as_bytes().to_vec()).await?;
    tokio::time::sleep(SUBMIT_PAUSE).await;
    writer(session_id.to_string(), b"\r".to_vec()).await?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{Arc, Mutex};

    use super::PtyWriter;
    use crate::types::MonitorConfig;

    /// A writer that records each call as one segment.
    pub fn recording_writer() -> (PtyWriter, Arc<Mutex<Vec<Vec<u8>>>>) {
        let segments: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = segments.clone();
        let writer: PtyWriter = Arc::new(move |_session, bytes| {
            let sink = sink.clone();
            Box::pin(async move {
                if let Ok(mut segments) = sink.lock() {
                    segments.push(bytes);
                }
                Ok(())
            })
        });
        (writer, segments)
    }

    pub fn context(config: MonitorConfig, writer: PtyWriter) -> super::StrategyContext {
        super::StrategyContext {
            container_id: "c1".into(),
            pty_session_id: "s1".into(),
            runtime_id: "rt-1".into(),
            silence_secs: 7,
            threshold_secs: 30,
            snapshot: b"$ make test\nrunning...\n".to_vec(),
            config,
            writer,
        }
    }
}
