//! Terminal plumbing: the byte ring buffer, the compressed scrollback
//! store, and the PTY session multiplexer that fans container exec output
//! to any number of attached clients.

pub mod history;
pub mod mux;
pub mod ring;

pub use {
    history::HistoryStore,
    mux::{OutputCallback, PtyMultiplexer, PtySession},
    ring::RingBuffer,
};
