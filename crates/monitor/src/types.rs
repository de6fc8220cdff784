use {
    burrow_config::MonitorDefaults,
    serde::{Deserialize, Serialize},
};

/// Which reaction fires when a session goes silent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Webhook,
    Injection,
    Queue,
    Llm,
}

impl StrategyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::Injection => "injection",
            Self::Queue => "queue",
            Self::Llm => "llm",
        }
    }
}

/// Per-session automation policy. Validation is lenient: a partially
/// configured strategy is accepted and records a skip at execute time
/// instead of failing enable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub enabled: bool,
    pub silence_threshold_secs: u64,
    pub strategy: StrategyKind,
    pub webhook: WebhookConfig,
    pub injection: InjectionConfig,
    pub queue: QueueConfig,
    pub llm: LlmConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            silence_threshold_secs: 30,
            strategy: StrategyKind::Webhook,
            webhook: WebhookConfig::default(),
            injection: InjectionConfig::default(),
            queue: QueueConfig::default(),
            llm: LlmConfig::default(),
        }
    }
}

impl MonitorConfig {
    /// Clamp the threshold into the allowed window.
    pub fn sanitize(mut self) -> Self {
        self.silence_threshold_secs = self.silence_threshold_secs.clamp(
            MonitorDefaults::MIN_THRESHOLD_SECS,
            MonitorDefaults::MAX_THRESHOLD_SECS,
        );
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub url: Option<String>,
    /// Extra request headers, supplied as a JSON string-to-string map.
    pub headers: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InjectionConfig {
    /// Command template with `{container_id}` / `{session_id}` /
    /// `{timestamp}` / `{silence_duration}` / `{docker_id}` placeholders.
    pub command_template: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Optional prefix placed above the dequeued task text.
    pub command_template: Option<String>,
    /// POST a queue-empty notification to the webhook URL when the queue
    /// runs dry.
    pub notify_queue_empty: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub temperature: f64,
    pub system_prompt: Option<String>,
    pub timeout_secs: u64,
    /// Applied when the call fails or the reply does not parse.
    pub default_action: LlmAction,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            model: None,
            temperature: 0.2,
            system_prompt: None,
            timeout_secs: 30,
            default_action: LlmAction::Skip,
        }
    }
}

/// What the arbitrating LLM decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmAction {
    Inject,
    Skip,
    Notify,
    Complete,
}

/// What a strategy did, recorded in the automation log and broadcast to
/// status subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct StrategyOutcome {
    pub action: String,
    pub command: Option<String>,
    pub success: bool,
    pub error: Option<String>,
    /// Raw LLM reply, when one was consulted.
    pub llm_response: Option<serde_json::Value>,
}

impl StrategyOutcome {
    pub fn success(action: impl Into<String>, command: Option<String>) -> Self {
        Self {
            action: action.into(),
            command,
            success: true,
            error: None,
            llm_response: None,
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            action: "skipped".into(),
            command: None,
            success: true,
            error: Some(reason.into()),
            llm_response: None,
        }
    }

    pub fn failed(action: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            command: None,
            success: false,
            error: Some(error.into()),
            llm_response: None,
        }
    }

    #[must_use]
    pub fn with_llm_response(mut self, response: serde_json::Value) -> Self {
        self.llm_response = Some(response);
        self
    }
}

/// Condensed record of the most recent strategy run.
#[derive(Debug, Clone, Serialize)]
pub struct ActionSummary {
    pub strategy: StrategyKind,
    pub action: String,
    pub command: Option<String>,
    pub success: bool,
    pub error: Option<String>,
    pub at_ms: u64,
}

/// Snapshot pushed to status subscribers and returned by the status
/// endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub container_id: String,
    pub pty_session_id: String,
    pub enabled: bool,
    pub silence_elapsed_secs: u64,
    pub silence_threshold_secs: u64,
    pub strategy: StrategyKind,
    pub assistant_detected: bool,
    pub assistant_pid: Option<i64>,
    pub last_action: Option<ActionSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_clamps_to_window() {
        let low = MonitorConfig {
            silence_threshold_secs: 1,
            ..Default::default()
        }
        .sanitize();
        assert_eq!(low.silence_threshold_secs, 5);

        let high = MonitorConfig {
            silence_threshold_secs: 10_000,
            ..Default::default()
        }
        .sanitize();
        assert_eq!(high.silence_threshold_secs, 300);

        let mid = MonitorConfig {
            silence_threshold_secs: 42,
            ..Default::default()
        }
        .sanitize();
        assert_eq!(mid.silence_threshold_secs, 42);
    }
}
