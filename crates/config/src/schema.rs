use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BurrowConfig {
    pub server: ServerConfig,
    pub docker: DockerConfig,
    pub sandbox: SandboxDefaults,
    pub proxy: ProxyConfig,
    pub terminal: TerminalConfig,
    pub history: HistoryConfig,
    pub monitor: MonitorDefaults,
    pub assistant: AssistantConfig,
}

/// HTTP server binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Override for the SQLite database path. Defaults to `<data_dir>/burrow.db`.
    pub database_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 7070,
            database_path: None,
        }
    }
}

/// Container runtime connection and image settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Image used for new sandboxes.
    pub image: String,
    /// Overlay network joined during init. Address resolution prefers this
    /// network over the default bridge when the container is attached to it.
    pub network: String,
    /// Label applied to every managed container; orphan listing filters on it.
    pub label: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            image: "burrow/sandbox:latest".into(),
            network: "burrow-net".into(),
            label: "dev.burrow.managed".into(),
        }
    }
}

/// Default resource caps applied when a create request leaves them unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxDefaults {
    pub memory_bytes: i64,
    pub cpu_cores: f64,
}

impl SandboxDefaults {
    pub const MAX_MEMORY_BYTES: i64 = 128 * 1024 * 1024 * 1024;
    pub const MAX_CPU_CORES: f64 = 64.0;
}

impl Default for SandboxDefaults {
    fn default() -> Self {
        Self {
            memory_bytes: 2 * 1024 * 1024 * 1024,
            cpu_cores: 1.0,
        }
    }
}

/// Reverse proxy exposure settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Host port range available for per-container external ports.
    pub port_range_start: u16,
    pub port_range_end: u16,
    /// Base domain for domain-routed proxying (`<name>.<base_domain>`).
    pub base_domain: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port_range_start: 20000,
            port_range_end: 21000,
            base_domain: None,
        }
    }
}

/// PTY session tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    /// Sessions with no clients and no activity for this long are reclaimed.
    pub idle_timeout_secs: u64,
    /// Idle sweep interval.
    pub sweep_interval_secs: u64,
    /// Shell spawned inside the container for interactive sessions.
    pub shell: String,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 30 * 60,
            sweep_interval_secs: 5 * 60,
            shell: "/bin/bash".into(),
        }
    }
}

/// Scrollback persistence tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub buffer_capacity: usize,
    pub flush_threshold: usize,
    pub flush_interval_secs: u64,
    pub max_chunk_bytes: usize,
    /// 0 = unlimited retention.
    pub max_chunks: u32,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 64 * 1024,
            flush_threshold: 32 * 1024,
            flush_interval_secs: 30,
            max_chunk_bytes: 256 * 1024,
            max_chunks: 0,
        }
    }
}

/// Silence monitoring defaults; per-session config overrides these.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorDefaults {
    pub silence_threshold_secs: u64,
    pub ring_capacity: usize,
    /// Assistant process detection poll interval.
    pub detect_interval_secs: u64,
    /// Sessions disabled and inactive for this long are swept.
    pub session_ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl MonitorDefaults {
    pub const MIN_THRESHOLD_SECS: u64 = 5;
    pub const MAX_THRESHOLD_SECS: u64 = 300;
}

impl Default for MonitorDefaults {
    fn default() -> Self {
        Self {
            silence_threshold_secs: 30,
            ring_capacity: 8 * 1024,
            detect_interval_secs: 5,
            session_ttl_secs: 30 * 60,
            sweep_interval_secs: 5 * 60,
        }
    }
}

/// The in-container coding assistant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantConfig {
    /// Binary name, also the pattern used for process detection.
    pub binary: String,
    /// Extra arguments prepended before the stream-json flags.
    pub args: Vec<String>,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            binary: "claude".into(),
            args: vec![],
        }
    }
}
