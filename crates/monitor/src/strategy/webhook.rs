use std::time::Duration;

use {
    async_trait::async_trait,
    tracing::{debug, warn},
};

use {
    super::{Strategy, StrategyContext},
    crate::types::{MonitorConfig, StrategyOutcome},
};

const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);
const BACKOFF_SECS: [u64; 3] = [1, 2, 4];
const SNIPPET_LIMIT: usize = 500;

/// POSTs a silence notification to a configured URL, with retries.
pub struct WebhookStrategy {
    client: reqwest::Client,
}

impl Default for WebhookStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl WebhookStrategy {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn payload(ctx: &StrategyContext) -> serde_json::Value {
        let snippet_start = ctx.snapshot.len().saturating_sub(SNIPPET_LIMIT);
        serde_json::json!({
            "container_id": ctx.container_id,
            "session_id": ctx.pty_session_id,
            "silence_duration": ctx.silence_secs,
            "last_output_snippet": String::from_utf8_lossy(&ctx.snapshot[snippet_start..]),
            "timestamp": burrow_common::time::now_secs(),
        })
    }

    async fn post_once(
        &self,
        url: &str,
        headers: Option<&serde_json::Map<String, serde_json::Value>>,
        payload: &serde_json::Value,
    ) -> Result<(), String> {
        let mut request = self
            .client
            .post(url)
            .timeout(ATTEMPT_TIMEOUT)
            .json(payload);
        if let Some(headers) = headers {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name.as_str(), value);
                }
            }
        }
        let response = request.send().await.map_err(|e| e.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("webhook returned {}", response.status()))
        }
    }
}

#[async_trait]
impl Strategy for WebhookStrategy {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn validate(&self, config: &MonitorConfig) -> burrow_common::Result<()> {
        if let Some(url) = config.webhook.url.as_deref()
            && !url.is_empty()
            && !url.starts_with("http://")
            && !url.starts_with("https://")
        {
            return Err(burrow_common::Error::validation(
                "webhook url must be http(s)",
            ));
        }
        Ok(())
    }

    async fn execute(&self, ctx: &StrategyContext) -> StrategyOutcome {
        let Some(url) = ctx
            .config
            .webhook
            .url
            .as_deref()
            .filter(|u| !u.is_empty())
        else {
            return StrategyOutcome::skipped("no webhook url configured");
        };

        let payload = Self::payload(ctx);
        let headers = ctx.config.webhook.headers.as_ref();

        let mut last_error = String::new();
        for (attempt, backoff) in std::iter::once(None)
            .chain(BACKOFF_SECS.iter().copied().map(Some))
            .enumerate()
        {
            if let Some(backoff) = backoff {
                // The engine's deadline (the silence threshold) cancels
                // these sleeps along with the whole execution.
                tokio::time::sleep(Duration::from_secs(backoff)).await;
            }
            match self.post_once(url, headers, &payload).await {
                Ok(()) => {
                    debug!(url, attempt, "webhook delivered");
                    return StrategyOutcome::success("webhook", None);
                },
                Err(e) => {
                    warn!(url, attempt, error = %e, "webhook attempt failed");
                    last_error = e;
                },
            }
        }
        StrategyOutcome::failed("webhook", last_error)
    }
}
