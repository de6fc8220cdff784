//! Configuration schema and loading for the burrow server.
//!
//! Config file: `burrow.toml`, searched in `./` then `~/.config/burrow/`.
//! Every section is optional; missing fields take the defaults below.

pub mod loader;
pub mod schema;

pub use {
    loader::{config_dir, data_dir, discover_and_load, load_config},
    schema::{
        AssistantConfig, BurrowConfig, DockerConfig, HistoryConfig, MonitorDefaults, ProxyConfig,
        SandboxDefaults, ServerConfig, TerminalConfig,
    },
};
