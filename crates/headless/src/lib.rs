//! Headless assistant sessions: multi-turn conversations driven over the
//! assistant's stream-json interface, with per-turn persistence and
//! mid-turn reconnect replay, plus the per-container mode arbiter.

pub mod arbiter;
pub mod manager;
pub mod store;

pub use {
    arbiter::{ContainerMode, ModeArbiter},
    manager::{HeadlessManager, SessionEvent, SessionInfo},
    store::{Conversation, ConversationStore, Turn, TurnState},
};
