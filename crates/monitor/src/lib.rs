//! Silence monitoring and automation: per-PTY silence timers sliding over
//! a ring-buffered output window, pluggable reaction strategies, and the
//! task queue and automation log backing them.

pub mod engine;
pub mod log;
pub mod store;
pub mod strategy;
pub mod tasks;
pub mod types;

pub use {
    engine::{MonitorEngine, PtyProtector, PtyWriter},
    log::AutomationLogStore,
    store::MonitorConfigStore,
    tasks::{Task, TaskState, TaskStore},
    types::{ActionSummary, MonitorConfig, MonitorStatus, StrategyKind, StrategyOutcome},
};
