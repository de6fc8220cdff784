//! HTTP/WebSocket surface and composition root: wires the runtime
//! controller, terminal multiplexer, monitoring engine, headless manager
//! and reverse proxy together and exposes them under `/api`.

pub mod containers;
pub mod error;
pub mod headless_ws;
pub mod monitoring_routes;
pub mod profiles_routes;
pub mod proxy_routes;
pub mod server;
pub mod state;
pub mod tasks_routes;
pub mod templates_routes;
pub mod terminal_ws;

pub use {
    server::{build_state, init_schema, router, run},
    state::AppState,
};
