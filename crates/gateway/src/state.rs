use std::sync::Arc;

use {
    burrow_config::BurrowConfig,
    burrow_headless::{HeadlessManager, ModeArbiter},
    burrow_monitor::{AutomationLogStore, MonitorEngine, TaskStore},
    burrow_proxy::ProxyClient,
    burrow_runtime::{ContainerController, profiles::ProfileStore},
    burrow_templates::TemplateStore,
    burrow_term::{HistoryStore, PtyMultiplexer},
};

/// Shared application state. Component singletons are constructed
/// leaves-first at startup ([`crate::server::build_state`]) and torn down
/// in reverse.
pub struct AppState {
    pub config: BurrowConfig,
    pub controller: Arc<ContainerController>,
    pub mux: Arc<PtyMultiplexer>,
    pub history: Arc<HistoryStore>,
    pub engine: Arc<MonitorEngine>,
    pub headless: Arc<HeadlessManager>,
    pub arbiter: Arc<ModeArbiter>,
    pub templates: Arc<TemplateStore>,
    pub profiles: Arc<ProfileStore>,
    pub tasks: Arc<TaskStore>,
    pub automation_logs: Arc<AutomationLogStore>,
    pub proxy: Arc<ProxyClient>,
}
